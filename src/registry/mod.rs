//! Polymorphic configuration loading.
//!
//! Every configured entity (watch, selector, match, action) is described by a
//! [`Descriptor`] in its kind's [`Registry`]: a type tag, a key schema merged
//! root-to-leaf, an optional shorthand `default_key`, the set of fields
//! excluded from the content hash, and a factory. Loading a configuration
//! map resolves the tag (explicit `type:` or the first non-common key),
//! coerces each declared field, collects the leftovers as free-form kwargs,
//! and stamps the node with a sha256 content hash over the coerced field map.
//!
//! The hash is the node's identity: cache keys derive from it, so it must be
//! stable across runs for identical configuration and must ignore
//! commentary-only fields.

mod error;

pub use error::{LoadError, LoadResult};

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::value::{digest_value, Value};

/// Declared coercion for a schema field.
#[derive(Debug, Clone, Copy)]
pub enum FieldKind {
    Str,
    OptStr,
    Int,
    OptInt,
    Bool,
    Map,
    List,
    ListOfStrs,
    ListOfMaps,
    Choice(&'static [&'static str]),
    /// `x` stays a map, anything else becomes `{type: x}`.
    MatchSpec,
    /// Accept the raw value verbatim.
    Any,
    /// Presence of this field is an error.
    Forbidden,
}

/// Default applied when a schema field is absent.
#[derive(Debug, Clone, Copy)]
pub enum FieldDefault {
    Null,
    Str(&'static str),
    Int(i64),
    Bool(bool),
    EmptyMap,
    EmptyList,
    Func(fn() -> Value),
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub kind: FieldKind,
    pub default: FieldDefault,
}

impl FieldSpec {
    pub const fn new(name: &'static str, kind: FieldKind, default: FieldDefault) -> Self {
        Self {
            name,
            kind,
            default,
        }
    }
}

/// The coerced output of a load, handed to a descriptor factory.
#[derive(Debug)]
pub struct Node {
    pub kind: &'static str,
    pub tag: &'static str,
    pub fields: IndexMap<String, Value>,
    pub kwargs: IndexMap<String, Value>,
    pub hash: String,
}

impl Node {
    pub fn take(&mut self, name: &str) -> Value {
        self.fields.shift_remove(name).unwrap_or(Value::Null)
    }

    pub fn take_req_str(&mut self, name: &str) -> LoadResult<String> {
        match self.take(name) {
            Value::Null => Err(LoadError::MissingField {
                kind: self.kind,
                field: name.to_string(),
            }),
            other => Ok(String::from_utf8_lossy(&other.to_bytes()).into_owned()),
        }
    }

    pub fn take_str(&mut self, name: &str) -> String {
        match self.take(name) {
            Value::Str(s) => s,
            other => String::from_utf8_lossy(&other.to_bytes()).into_owned(),
        }
    }

    pub fn take_opt_str(&mut self, name: &str) -> Option<String> {
        match self.take(name) {
            Value::Null => None,
            Value::Str(s) => Some(s),
            other => Some(String::from_utf8_lossy(&other.to_bytes()).into_owned()),
        }
    }

    pub fn take_int(&mut self, name: &str) -> i64 {
        match self.take(name) {
            Value::Int(i) => i,
            _ => 0,
        }
    }

    pub fn take_opt_int(&mut self, name: &str) -> Option<i64> {
        match self.take(name) {
            Value::Int(i) => Some(i),
            _ => None,
        }
    }

    pub fn take_bool(&mut self, name: &str) -> bool {
        matches!(self.take(name), Value::Bool(true))
    }

    pub fn take_map(&mut self, name: &str) -> IndexMap<String, Value> {
        match self.take(name) {
            Value::Map(m) => m,
            _ => IndexMap::new(),
        }
    }

    pub fn take_opt_map(&mut self, name: &str) -> Option<IndexMap<String, Value>> {
        match self.take(name) {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn take_list(&mut self, name: &str) -> Vec<Value> {
        match self.take(name) {
            Value::List(l) => l,
            _ => Vec::new(),
        }
    }

    pub fn take_str_list(&mut self, name: &str) -> Vec<String> {
        self.take_list(name)
            .into_iter()
            .map(|v| String::from_utf8_lossy(&v.to_bytes()).into_owned())
            .collect()
    }
}

pub struct Descriptor<T: ?Sized> {
    pub tag: &'static str,
    /// Additional tags resolving to this descriptor. Aliases share the
    /// schema, so identical fields hash identically under either spelling.
    pub aliases: &'static [&'static str],
    pub default_key: Option<&'static str>,
    pub hash_skip: &'static [&'static str],
    /// Schema levels root-to-leaf; later levels override earlier fields
    /// in place, preserving the root's declaration position.
    pub schema: &'static [&'static [FieldSpec]],
    pub build: fn(Node) -> LoadResult<Box<T>>,
}

pub struct Registry<T: ?Sized + 'static> {
    pub kind: &'static str,
    /// Keys never treated as a type discriminator when `type:` is absent.
    pub type_skip: &'static [&'static str],
    pub descriptors: &'static [Descriptor<T>],
}

impl<T: ?Sized> Registry<T> {
    pub fn resolve(&self, tag: &str) -> Option<&Descriptor<T>> {
        self.descriptors
            .iter()
            .find(|d| d.tag == tag || d.aliases.contains(&tag))
    }

    /// Enumerate registered tags, for diagnostics.
    pub fn tags(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.descriptors.iter().map(|d| d.tag)
    }

    /// Whether a configuration map resolves to a known type without loading.
    pub fn is_resolvable(&self, cfg: &IndexMap<String, Value>) -> bool {
        self.determine(cfg).is_some()
    }

    fn determine(&self, cfg: &IndexMap<String, Value>) -> Option<&Descriptor<T>> {
        if let Some(t) = cfg.get("type") {
            return self.resolve(&String::from_utf8_lossy(&t.to_bytes()));
        }
        let key = cfg
            .keys()
            .find(|k| !self.type_skip.contains(&k.as_str()))?;
        self.resolve(key)
    }

    pub fn load(&self, cfg: &Value) -> LoadResult<Box<T>> {
        match cfg {
            Value::Map(map) => self.load_map(map),
            other => Err(LoadError::Invalid {
                kind: self.kind,
                msg: format!("expected a mapping, got {}", other.type_name()),
            }),
        }
    }

    pub fn load_map(&self, cfg: &IndexMap<String, Value>) -> LoadResult<Box<T>> {
        let node = self.realize(cfg)?;
        let descriptor = self
            .resolve(node.tag)
            .expect("realize resolved the descriptor");
        (descriptor.build)(node)
    }

    /// Resolve, coerce, and hash a configuration map without constructing
    /// the object. Used by `--find` style diagnostics as well as `load_map`.
    pub fn realize(&self, cfg: &IndexMap<String, Value>) -> LoadResult<Node> {
        let mut kwargs = cfg.clone();
        if kwargs.contains_key("kwargs") {
            return Err(LoadError::ReservedKey {
                kind: self.kind,
                key: "kwargs".to_string(),
            });
        }

        // Resolve the subtype tag: explicit `type:`, else the first key that
        // is not a shared field name (shorthand form).
        let (descriptor, shorthand) = match kwargs.shift_remove("type") {
            Some(t) => {
                let tag = String::from_utf8_lossy(&t.to_bytes()).into_owned();
                let descriptor = self.resolve(&tag).ok_or(LoadError::UnknownType {
                    kind: self.kind,
                    tag,
                })?;
                (descriptor, None)
            }
            None => {
                let key = kwargs
                    .keys()
                    .find(|k| !self.type_skip.contains(&k.as_str()))
                    .cloned()
                    .ok_or_else(|| LoadError::UnknownType {
                        kind: self.kind,
                        tag: "<unspecified>".to_string(),
                    })?;
                let descriptor = self.resolve(&key).ok_or_else(|| LoadError::UnknownType {
                    kind: self.kind,
                    tag: key.clone(),
                })?;
                (descriptor, Some(key))
            }
        };

        // Shorthand `{tag: value}` binds the value to the subtype's
        // default key.
        if let Some(key) = shorthand {
            if let Some(default_key) = descriptor.default_key {
                let bound = kwargs.get(&key).cloned().unwrap_or(Value::Null);
                if !bound.is_null() {
                    kwargs.shift_remove(&key);
                    kwargs.insert(default_key.to_string(), bound);
                }
            }
        }

        let mut fields = IndexMap::new();
        for spec in merged_schema(descriptor) {
            let raw = kwargs.shift_remove(spec.name);
            let present = match &raw {
                None => false,
                // Explicit null only means something for nullable fields;
                // elsewhere it falls back to the default.
                Some(Value::Null) => matches!(
                    spec.kind,
                    FieldKind::OptStr | FieldKind::OptInt | FieldKind::Any | FieldKind::MatchSpec
                ),
                Some(_) => true,
            };
            let value = if present {
                coerce(self.kind, &spec, raw.unwrap_or(Value::Null))?
            } else {
                default_value(&spec.default)
            };
            fields.insert(spec.name.to_string(), value);
        }

        let hash = digest_value(&Value::Map(fields.clone()), descriptor.hash_skip);
        Ok(Node {
            kind: self.kind,
            tag: descriptor.tag,
            fields,
            kwargs,
            hash,
        })
    }
}

/// Merge schema levels root-to-leaf, with an implicit leading field named
/// after the tag itself (the shorthand landing slot) unless a level already
/// declares it.
fn merged_schema<T: ?Sized>(descriptor: &Descriptor<T>) -> Vec<FieldSpec> {
    let mut merged: IndexMap<&'static str, FieldSpec> = IndexMap::new();
    merged.insert(
        descriptor.tag,
        FieldSpec::new(descriptor.tag, FieldKind::Any, FieldDefault::Null),
    );
    for level in descriptor.schema {
        for spec in *level {
            merged.insert(spec.name, *spec);
        }
    }
    merged.into_values().collect()
}

fn default_value(default: &FieldDefault) -> Value {
    match default {
        FieldDefault::Null => Value::Null,
        FieldDefault::Str(s) => Value::Str(s.to_string()),
        FieldDefault::Int(i) => Value::Int(*i),
        FieldDefault::Bool(b) => Value::Bool(*b),
        FieldDefault::EmptyMap => Value::Map(IndexMap::new()),
        FieldDefault::EmptyList => Value::List(Vec::new()),
        FieldDefault::Func(f) => f(),
    }
}

fn coerce(kind: &'static str, spec: &FieldSpec, raw: Value) -> LoadResult<Value> {
    let actual = raw.type_name();
    let uncastable = move |expected: &str| LoadError::Uncastable {
        kind,
        field: spec.name.to_string(),
        expected: expected.to_string(),
        actual,
    };
    match spec.kind {
        FieldKind::Forbidden => Err(LoadError::UnexpectedArgument {
            kind,
            field: spec.name.to_string(),
        }),
        FieldKind::Any => Ok(raw),
        FieldKind::Str => cast_str(&raw).map(Value::Str).ok_or_else(|| uncastable("string")),
        FieldKind::OptStr => match raw {
            Value::Null => Ok(Value::Null),
            ref v => cast_str(v).map(Value::Str).ok_or_else(|| uncastable("string")),
        },
        FieldKind::Int => cast_int(&raw).map(Value::Int).ok_or_else(|| uncastable("int")),
        FieldKind::OptInt => match raw {
            Value::Null => Ok(Value::Null),
            ref v => cast_int(v).map(Value::Int).ok_or_else(|| uncastable("int")),
        },
        FieldKind::Bool => cast_bool(&raw).map(Value::Bool).ok_or_else(|| uncastable("bool")),
        FieldKind::Map => match raw {
            Value::Map(m) => Ok(Value::Map(m)),
            _ => Err(uncastable("map")),
        },
        FieldKind::List => match raw {
            Value::List(l) => Ok(Value::List(l)),
            _ => Err(uncastable("list")),
        },
        FieldKind::ListOfStrs => match raw {
            Value::Str(s) => Ok(Value::List(vec![Value::Str(s)])),
            Value::List(l) => {
                let strings: Option<Vec<Value>> =
                    l.iter().map(|v| cast_str(v).map(Value::Str)).collect();
                strings.map(Value::List).ok_or_else(|| uncastable("list of strings"))
            }
            _ => Err(uncastable("list of strings")),
        },
        FieldKind::ListOfMaps => match raw {
            Value::Map(m) => Ok(Value::List(vec![Value::Map(m)])),
            Value::List(l) => {
                if l.iter().all(|v| matches!(v, Value::Map(_))) {
                    Ok(Value::List(l))
                } else {
                    Err(uncastable("list of maps"))
                }
            }
            _ => Err(uncastable("list of maps")),
        },
        FieldKind::Choice(choices) => {
            let s = cast_str(&raw).ok_or_else(|| uncastable("string"))?;
            if choices.contains(&s.as_str()) {
                Ok(Value::Str(s))
            } else {
                Err(uncastable(&format!("one of {}", choices.join("/"))))
            }
        }
        FieldKind::MatchSpec => match raw {
            Value::Null => Ok(Value::Null),
            Value::Map(m) => Ok(Value::Map(m)),
            ref v => {
                let tag = cast_str(v).ok_or_else(|| uncastable("match spec"))?;
                let mut m = IndexMap::new();
                m.insert("type".to_string(), Value::Str(tag));
                Ok(Value::Map(m))
            }
        },
    }
}

fn cast_str(value: &Value) -> Option<String> {
    match value {
        Value::Str(s) => Some(s.clone()),
        Value::Int(i) => Some(i.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Bytes(b) => Some(String::from_utf8_lossy(b).into_owned()),
        _ => None,
    }
}

fn cast_int(value: &Value) -> Option<i64> {
    match value {
        Value::Int(i) => Some(*i),
        Value::Str(s) => s.trim().parse().ok(),
        Value::Bool(b) => Some(i64::from(*b)),
        _ => None,
    }
}

fn cast_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Int(i) => Some(*i != 0),
        Value::Str(s) => match s.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Some(true),
            "false" | "0" | "no" | "" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Fold extra state into an existing content hash, producing the derived
/// identity used by loop iterations and template instantiations.
pub fn mix_hash(hash: &str, extra: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(hash.as_bytes());
    extra.hash_into(&mut hasher, &[]);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Probe {
        node: Node,
    }

    fn probe_build(node: Node) -> LoadResult<Box<Probe>> {
        Ok(Box::new(Probe { node }))
    }

    static BASE_KEYS: &[FieldSpec] = &[
        FieldSpec::new("key1", FieldKind::Str, FieldDefault::Str("value1")),
        FieldSpec::new("key2", FieldKind::Str, FieldDefault::Str("value2")),
        FieldSpec::new("key3", FieldKind::Str, FieldDefault::Str("value3")),
        FieldSpec::new("comment", FieldKind::OptStr, FieldDefault::Null),
    ];

    static SUB_KEYS: &[FieldSpec] = &[
        FieldSpec::new("key3", FieldKind::Str, FieldDefault::Str("overridden3")),
        FieldSpec::new("key5", FieldKind::Str, FieldDefault::Str("value5")),
        FieldSpec::new("key6", FieldKind::Int, FieldDefault::Int(6)),
    ];

    static PROBES: Registry<Probe> = Registry {
        kind: "probe",
        type_skip: &["comment", "key1", "key2", "key3", "key5", "key6"],
        descriptors: &[Descriptor {
            tag: "sub",
            aliases: &["alias"],
            default_key: Some("key1"),
            hash_skip: &["comment"],
            schema: &[BASE_KEYS, SUB_KEYS],
            build: probe_build,
        }],
    };

    fn cfg(yaml: &str) -> IndexMap<String, Value> {
        let parsed: serde_yaml::Value = serde_yaml::from_str(yaml).unwrap();
        match Value::from_yaml(&parsed) {
            Value::Map(m) => m,
            other => panic!("expected map, got {:?}", other),
        }
    }

    #[test]
    fn test_defaults_and_overrides() {
        let probe = PROBES.load_map(&cfg("type: sub\nkey5: 5\nkey6: '7'\n")).unwrap();
        let mut node = probe.node;
        assert_eq!(node.take_str("key1"), "value1");
        assert_eq!(node.take_str("key2"), "value2");
        assert_eq!(node.take_str("key3"), "overridden3");
        assert_eq!(node.take_str("key5"), "5");
        assert_eq!(node.take_int("key6"), 7);
    }

    #[test]
    fn test_shorthand_binds_default_key() {
        let probe = PROBES.load_map(&cfg("sub: hello\n")).unwrap();
        let mut node = probe.node;
        assert_eq!(node.take_str("key1"), "hello");
    }

    #[test]
    fn test_unknown_type() {
        assert!(matches!(
            PROBES.load_map(&cfg("type: nope\n")),
            Err(LoadError::UnknownType { .. })
        ));
        assert!(matches!(
            PROBES.load_map(&cfg("nope: 1\n")),
            Err(LoadError::UnknownType { .. })
        ));
    }

    #[test]
    fn test_alias_resolves_and_hashes_identically() {
        let a = PROBES.load_map(&cfg("type: sub\nkey5: x\n")).unwrap();
        let b = PROBES.load_map(&cfg("type: alias\nkey5: x\n")).unwrap();
        assert_eq!(a.node.hash, b.node.hash);
    }

    #[test]
    fn test_extras_collected_not_hashed() {
        let a = PROBES.load_map(&cfg("type: sub\nunknown: 456\n")).unwrap();
        let b = PROBES.load_map(&cfg("type: sub\n")).unwrap();
        assert_eq!(a.node.kwargs.get("unknown"), Some(&Value::Int(456)));
        assert!(a.node.fields.get("unknown").is_none());
        assert_eq!(a.node.hash, b.node.hash);
    }

    #[test]
    fn test_hash_skip_fields() {
        let a = PROBES.load_map(&cfg("type: sub\ncomment: one\n")).unwrap();
        let b = PROBES.load_map(&cfg("type: sub\ncomment: two\n")).unwrap();
        let c = PROBES.load_map(&cfg("type: sub\nkey5: changed\n")).unwrap();
        assert_eq!(a.node.hash, b.node.hash);
        assert_ne!(a.node.hash, c.node.hash);
    }

    #[test]
    fn test_uncastable() {
        assert!(matches!(
            PROBES.load_map(&cfg("type: sub\nkey6: [1, 2]\n")),
            Err(LoadError::Uncastable { .. })
        ));
    }

    #[test]
    fn test_reserved_key() {
        assert!(matches!(
            PROBES.load_map(&cfg("type: sub\nkwargs: {}\n")),
            Err(LoadError::ReservedKey { .. })
        ));
    }

    #[test]
    fn test_type_skip_defers_determination() {
        // "key1" is a shared field; the discriminator is the next key.
        let probe = PROBES.load_map(&cfg("key1: zzz\nsub: ~\n")).unwrap();
        let mut node = probe.node;
        assert_eq!(node.take_str("key1"), "zzz");
    }

    #[test]
    fn test_mix_hash_changes_identity() {
        let a = PROBES.load_map(&cfg("type: sub\n")).unwrap();
        let mixed = mix_hash(&a.node.hash, &Value::from("iteration-0"));
        assert_ne!(a.node.hash, mixed);
        assert_eq!(mixed, mix_hash(&a.node.hash, &Value::from("iteration-0")));
    }
}
