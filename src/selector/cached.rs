//! History-backed selectors: dedupe against prior runs, cut at a stored
//! marker, and persist/recall per-item variables.
//!
//! Each selector stores under an effective cache key: the expanded
//! `cache_key` field when configured, else a default derived from the
//! selector's own content hash. The per-item derived key is `vars[key]`
//! when `key` names a variable, else the sha256 digest of the item value.

use indexmap::IndexMap;

use super::{Selector, SelectorCore, SelectorError, SelectorResult};
use crate::item::Item;
use crate::registry::{LoadResult, Node};
use crate::runtime::Runtime;
use crate::value::Value;

struct CachedCore {
    core: SelectorCore,
    cache_key: Option<String>,
    key: Option<String>,
}

impl CachedCore {
    fn from_node(node: &mut Node) -> Self {
        Self {
            cache_key: node.take_opt_str("cache_key"),
            key: node.take_opt_str("key"),
            core: SelectorCore::from_node(node),
        }
    }

    fn effective_key(&self, rt: &Runtime) -> SelectorResult<String> {
        match &self.cache_key {
            Some(template) => Ok(rt.ctx.expand_str(template)?),
            None => Ok(format!(
                "{}-selector-cache-{}",
                self.core.hash, self.core.tag
            )),
        }
    }

    fn derived_key(&self, item: &Item) -> SelectorResult<String> {
        match &self.key {
            Some(name) => item
                .var(name)
                .map(|v| String::from_utf8_lossy(v).into_owned())
                .ok_or_else(|| SelectorError::MissingVar(name.clone())),
            None => Ok(item.value_digest()),
        }
    }
}

fn stored_keys(value: &Value) -> Vec<String> {
    match value {
        Value::List(values) => values
            .iter()
            .map(|v| String::from_utf8_lossy(&v.to_bytes()).into_owned())
            .collect(),
        _ => Vec::new(),
    }
}

pub struct NewSelector {
    cached: CachedCore,
}

pub fn build_new(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(NewSelector {
        cached: CachedCore::from_node(&mut node),
    }))
}

impl Selector for NewSelector {
    fn core(&self) -> &SelectorCore {
        &self.cached.core
    }

    /// Emit only items whose derived key has not been seen before; the
    /// stored set becomes the union, preserving first-seen order.
    fn run_all(&self, rt: &mut Runtime, items: &[Item]) -> SelectorResult<Vec<Item>> {
        let cache_key = self.cached.effective_key(rt)?;
        let mut seen = stored_keys(&rt.cache.file_or(&cache_key, Value::List(Vec::new()))?);

        let mut out = Vec::new();
        for item in items {
            let key = self.cached.derived_key(item)?;
            if !seen.contains(&key) {
                seen.push(key);
                out.push(item.clone());
            }
        }

        rt.cache.put_file(
            &cache_key,
            &Value::List(seen.into_iter().map(Value::Str).collect()),
        )?;
        Ok(out)
    }
}

pub struct SinceSelector {
    cached: CachedCore,
}

pub fn build_since(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(SinceSelector {
        cached: CachedCore::from_node(&mut node),
    }))
}

impl Selector for SinceSelector {
    fn core(&self) -> &SelectorCore {
        &self.cached.core
    }

    /// Emit items up to (exclusive) the stored marker, then move the marker
    /// to the newest first item. With no marker yet, everything passes.
    fn run_all(&self, rt: &mut Runtime, items: &[Item]) -> SelectorResult<Vec<Item>> {
        let cache_key = self.cached.effective_key(rt)?;
        let marker = rt
            .cache
            .get_file(&cache_key)?
            .map(|v| String::from_utf8_lossy(&v.to_bytes()).into_owned());

        let mut out = Vec::new();
        for item in items {
            let key = self.cached.derived_key(item)?;
            if marker.as_deref() == Some(key.as_str()) {
                break;
            }
            out.push(item.clone());
        }

        if let Some(first) = items.first() {
            let key = self.cached.derived_key(first)?;
            rt.cache.put_file(&cache_key, &Value::Str(key))?;
        }
        Ok(out)
    }
}

pub struct DictStoreSelector {
    cached: CachedCore,
}

pub fn build_dictstore(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(DictStoreSelector {
        cached: CachedCore::from_node(&mut node),
    }))
}

impl Selector for DictStoreSelector {
    fn core(&self) -> &SelectorCore {
        &self.cached.core
    }

    /// Persist each item keyed by its derived key; the stream passes through
    /// unchanged.
    fn run_all(&self, rt: &mut Runtime, items: &[Item]) -> SelectorResult<Vec<Item>> {
        let cache_key = self.cached.effective_key(rt)?;
        let mut stored = match rt.cache.get_file(&cache_key)? {
            Some(Value::Map(map)) => map,
            _ => IndexMap::new(),
        };

        for item in items {
            stored.insert(self.cached.derived_key(item)?, item.to_value());
        }

        rt.cache.put_file(&cache_key, &Value::Map(stored))?;
        Ok(items.to_vec())
    }
}

pub struct DictLoadSelector {
    cached: CachedCore,
    filter: bool,
}

pub fn build_dictload(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(DictLoadSelector {
        filter: node.take_bool("filter"),
        cached: CachedCore::from_node(&mut node),
    }))
}

impl Selector for DictLoadSelector {
    fn core(&self) -> &SelectorCore {
        &self.cached.core
    }

    /// Overlay stored vars onto items with a matching derived key. With
    /// `filter` set, items with no stored entry drop out of the stream.
    fn run_all(&self, rt: &mut Runtime, items: &[Item]) -> SelectorResult<Vec<Item>> {
        let cache_key = self.cached.effective_key(rt)?;
        let stored = match rt.cache.get_file(&cache_key)? {
            Some(Value::Map(map)) => map,
            _ => IndexMap::new(),
        };

        let mut out = Vec::new();
        for item in items {
            let key = self.cached.derived_key(item)?;
            match stored.get(&key) {
                Some(Value::Map(entry)) => {
                    let overlay: Vec<(String, Vec<u8>)> = match entry.get("vars") {
                        Some(Value::Map(vars)) => vars
                            .iter()
                            .map(|(k, v)| (k.clone(), v.to_bytes()))
                            .collect(),
                        _ => Vec::new(),
                    };
                    out.push(item.clone_with(None, overlay));
                }
                _ if self.filter => {}
                _ => out.push(item.clone()),
            }
        }
        Ok(out)
    }
}
