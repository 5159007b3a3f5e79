//! The unit flowing through selector pipelines.

use std::hash::{Hash, Hasher};

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::value::Value;

/// A value plus named variables, produced by a data fetch or a selector.
///
/// Items are immutable after construction; transforms build new items via
/// [`Item::clone_with`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    value: Vec<u8>,
    vars: IndexMap<String, Vec<u8>>,
}

impl Item {
    pub fn new(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            vars: IndexMap::new(),
        }
    }

    pub fn with_vars(value: impl Into<Vec<u8>>, vars: IndexMap<String, Vec<u8>>) -> Self {
        Self {
            value: value.into(),
            vars,
        }
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn vars(&self) -> &IndexMap<String, Vec<u8>> {
        &self.vars
    }

    pub fn var(&self, name: &str) -> Option<&[u8]> {
        self.vars.get(name).map(Vec::as_slice)
    }

    /// New item carrying the same vars with a replaced value.
    pub fn with_value(&self, value: Vec<u8>) -> Item {
        Item {
            value,
            vars: self.vars.clone(),
        }
    }

    /// New item with an optional replacement value and a vars overlay merged
    /// over the existing vars.
    pub fn clone_with<I, K>(&self, value: Option<Vec<u8>>, overlay: I) -> Item
    where
        I: IntoIterator<Item = (K, Vec<u8>)>,
        K: Into<String>,
    {
        let mut vars = self.vars.clone();
        for (k, v) in overlay {
            vars.insert(k.into(), v);
        }
        Item {
            value: value.unwrap_or_else(|| self.value.clone()),
            vars,
        }
    }

    /// Hex digest of the item value alone, used as the derived key by
    /// history-backed selectors when no explicit var key is configured.
    pub fn value_digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.value);
        hex::encode(hasher.finalize())
    }

    /// Value-model view: `{value: bytes, vars: {name: bytes}}`.
    pub fn to_value(&self) -> Value {
        let mut vars = Value::map();
        for (k, v) in &self.vars {
            vars.insert(k.clone(), Value::Bytes(v.clone()));
        }
        let mut map = Value::map();
        map.insert("value".to_string(), Value::Bytes(self.value.clone()));
        map.insert("vars".to_string(), Value::Map(vars));
        Value::Map(map)
    }
}

impl Hash for Item {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
        // Vars are hashed in sorted order so that equal items (IndexMap
        // equality ignores order) hash identically.
        let mut pairs: Vec<(&String, &Vec<u8>)> = self.vars.iter().collect();
        pairs.sort_by_key(|(k, _)| k.as_str());
        for (k, v) in pairs {
            k.hash(state);
            v.hash(state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_covers_vars() {
        let a = Item::new(&b"value"[..]);
        let b = a.clone_with(None, [("name", b"x".to_vec())]);
        assert_ne!(a, b);
        assert_eq!(b, a.clone_with(None, [("name", b"x".to_vec())]));
    }

    #[test]
    fn test_clone_with_overlays_vars() {
        let base = Item::with_vars(
            &b"row"[..],
            IndexMap::from([("a".to_string(), b"1".to_vec()), ("b".to_string(), b"2".to_vec())]),
        );
        let merged = base.clone_with(Some(b"new".to_vec()), [("b".to_string(), b"3".to_vec())]);
        assert_eq!(merged.value(), b"new");
        assert_eq!(merged.var("a"), Some(&b"1"[..]));
        assert_eq!(merged.var("b"), Some(&b"3"[..]));
        // original untouched
        assert_eq!(base.var("b"), Some(&b"2"[..]));
    }

    #[test]
    fn test_hash_order_insensitive() {
        use std::collections::hash_map::DefaultHasher;
        let a = Item::with_vars(
            &b"v"[..],
            IndexMap::from([("x".to_string(), b"1".to_vec()), ("y".to_string(), b"2".to_vec())]),
        );
        let b = Item::with_vars(
            &b"v"[..],
            IndexMap::from([("y".to_string(), b"2".to_vec()), ("x".to_string(), b"1".to_vec())]),
        );
        assert_eq!(a, b);
        let mut ha = DefaultHasher::new();
        let mut hb = DefaultHasher::new();
        a.hash(&mut ha);
        b.hash(&mut hb);
        assert_eq!(ha.finish(), hb.finish());
    }
}
