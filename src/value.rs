//! Dynamic value model shared across the engine.
//!
//! Configuration nodes, context variables, template results, and cache
//! entries all carry the same [`Value`] type. Maps preserve insertion order:
//! node type determination reads "the first key", and content hashes are
//! computed over keys in declaration order.

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::item::Item;

/// A dynamically typed value.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
    /// A list of selector items bound into the context by a watch.
    Items(Vec<Item>),
}

impl Value {
    pub fn map() -> IndexMap<String, Value> {
        IndexMap::new()
    }

    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Str(_) => "string",
            Value::Bytes(_) => "bytes",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Items(_) => "items",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Empty in the container sense: null, `[]`, `{}`, `""`.
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Str(s) => s.is_empty(),
            Value::Bytes(b) => b.is_empty(),
            Value::List(l) => l.is_empty(),
            Value::Map(m) => m.is_empty(),
            Value::Items(i) => i.is_empty(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&IndexMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    /// Byte view of scalar values, allocating only for numeric rendering.
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            Value::Null => Vec::new(),
            Value::Bool(b) => if *b { b"true".to_vec() } else { b"false".to_vec() },
            Value::Int(i) => i.to_string().into_bytes(),
            Value::Str(s) => s.clone().into_bytes(),
            Value::Bytes(b) => b.clone(),
            other => render_plain(other).into_bytes(),
        }
    }

    /// Convert a parsed YAML document into the engine value model.
    ///
    /// YAML floats have no counterpart here and are carried as strings; all
    /// observed configuration fields are integral.
    pub fn from_yaml(yaml: &serde_yaml::Value) -> Value {
        match yaml {
            serde_yaml::Value::Null => Value::Null,
            serde_yaml::Value::Bool(b) => Value::Bool(*b),
            serde_yaml::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Str(n.to_string()),
            },
            serde_yaml::Value::String(s) => Value::Str(s.clone()),
            serde_yaml::Value::Sequence(seq) => {
                Value::List(seq.iter().map(Value::from_yaml).collect())
            }
            serde_yaml::Value::Mapping(map) => {
                let mut out = IndexMap::new();
                for (k, v) in map {
                    let key = match k {
                        serde_yaml::Value::String(s) => s.clone(),
                        other => render_plain(&Value::from_yaml(other)),
                    };
                    out.insert(key, Value::from_yaml(v));
                }
                Value::Map(out)
            }
            serde_yaml::Value::Tagged(tagged) => Value::from_yaml(&tagged.value),
        }
    }

    pub fn to_yaml(&self) -> serde_yaml::Value {
        match self {
            Value::Null => serde_yaml::Value::Null,
            Value::Bool(b) => serde_yaml::Value::Bool(*b),
            Value::Int(i) => serde_yaml::Value::Number((*i).into()),
            Value::Str(s) => serde_yaml::Value::String(s.clone()),
            Value::Bytes(_) | Value::Items(_) | Value::List(_) | Value::Map(_) => {
                // Bytes round-trip through the same `_base64` marker the JSON
                // blob codec uses, so the entries document stays plain YAML.
                yaml_from_json(&self.to_json())
            }
        }
    }

    pub fn from_yaml_entry(yaml: &serde_yaml::Value) -> Value {
        Value::from_json(&json_from_yaml(yaml))
    }

    /// Encode for blob storage: standard JSON, with byte sequences as
    /// `{"_base64": true, "data": "<base64>"}`.
    pub fn to_json(&self) -> serde_json::Value {
        use base64::Engine as _;
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::Number((*i).into()),
            Value::Str(s) => serde_json::Value::String(s.clone()),
            Value::Bytes(b) => {
                let mut map = serde_json::Map::new();
                map.insert("_base64".into(), serde_json::Value::Bool(true));
                map.insert(
                    "data".into(),
                    serde_json::Value::String(base64::engine::general_purpose::STANDARD.encode(b)),
                );
                serde_json::Value::Object(map)
            }
            Value::List(l) => serde_json::Value::Array(l.iter().map(Value::to_json).collect()),
            Value::Map(m) => {
                let mut map = serde_json::Map::new();
                for (k, v) in m {
                    map.insert(k.clone(), v.to_json());
                }
                serde_json::Value::Object(map)
            }
            Value::Items(items) => serde_json::Value::Array(
                items.iter().map(|item| item.to_value().to_json()).collect(),
            ),
        }
    }

    /// Decode blob JSON, restoring `{"_base64": true, "data": ...}` objects
    /// to byte sequences.
    pub fn from_json(json: &serde_json::Value) -> Value {
        use base64::Engine as _;
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Str(n.to_string()),
            },
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(arr) => {
                Value::List(arr.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(obj) => {
                if obj.get("_base64") == Some(&serde_json::Value::Bool(true)) {
                    if let Some(serde_json::Value::String(data)) = obj.get("data") {
                        if let Ok(bytes) =
                            base64::engine::general_purpose::STANDARD.decode(data.as_bytes())
                        {
                            return Value::Bytes(bytes);
                        }
                    }
                }
                let mut map = IndexMap::new();
                for (k, v) in obj {
                    map.insert(k.clone(), Value::from_json(v));
                }
                Value::Map(map)
            }
        }
    }

    /// Fold this value into a running digest using the canonical form:
    /// lists as `[x,y,]`, maps as `{k:v,}` pairs in insertion order, scalars
    /// prefixed with a type marker. Map keys listed in `skip` are omitted at
    /// every nesting level.
    pub fn hash_into(&self, hasher: &mut Sha256, skip: &[&str]) {
        match self {
            Value::List(items) => {
                hasher.update(b"[");
                for item in items {
                    item.hash_into(hasher, skip);
                    hasher.update(b",");
                }
                hasher.update(b"]");
            }
            Value::Items(items) => {
                hasher.update(b"[");
                for item in items {
                    item.to_value().hash_into(hasher, skip);
                    hasher.update(b",");
                }
                hasher.update(b"]");
            }
            Value::Map(map) => {
                hasher.update(b"{");
                for (k, v) in map {
                    if skip.contains(&k.as_str()) {
                        continue;
                    }
                    hasher.update(b"s");
                    hasher.update(k.as_bytes());
                    hasher.update(b":");
                    v.hash_into(hasher, skip);
                    hasher.update(b",");
                }
                hasher.update(b"}");
            }
            scalar => {
                hasher.update(b"s");
                hasher.update(&scalar.to_bytes_for_hash());
            }
        }
    }

    fn to_bytes_for_hash(&self) -> Vec<u8> {
        match self {
            Value::Null => b"null".to_vec(),
            other => other.to_bytes(),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Vec<u8>> for Value {
    fn from(b: Vec<u8>) -> Self {
        Value::Bytes(b)
    }
}

/// Plain text rendering used for map keys coerced from scalars and for the
/// generic list/map representations in template finalization.
pub fn render_plain(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Str(s) => s.clone(),
        Value::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        Value::List(items) => {
            let parts: Vec<String> = items.iter().map(render_quoted).collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Items(items) => {
            let parts: Vec<String> = items
                .iter()
                .map(|item| {
                    format!("\"{}\"", String::from_utf8_lossy(item.value()))
                })
                .collect();
            format!("[{}]", parts.join(", "))
        }
        Value::Map(map) => {
            let parts: Vec<String> = map
                .iter()
                .map(|(k, v)| format!("\"{}\": {}", k, render_quoted(v)))
                .collect();
            format!("{{{}}}", parts.join(", "))
        }
    }
}

fn render_quoted(value: &Value) -> String {
    match value {
        Value::Str(s) => format!("\"{}\"", s),
        Value::Bytes(b) => format!("\"{}\"", String::from_utf8_lossy(b)),
        other => render_plain(other),
    }
}

/// Compute the sha256 hex digest of a value's canonical form.
pub fn digest_value(value: &Value, skip: &[&str]) -> String {
    let mut hasher = Sha256::new();
    value.hash_into(&mut hasher, skip);
    hex::encode(hasher.finalize())
}

fn yaml_from_json(json: &serde_json::Value) -> serde_yaml::Value {
    match json {
        serde_json::Value::Null => serde_yaml::Value::Null,
        serde_json::Value::Bool(b) => serde_yaml::Value::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => serde_yaml::Value::Number(i.into()),
            None => serde_yaml::Value::String(n.to_string()),
        },
        serde_json::Value::String(s) => serde_yaml::Value::String(s.clone()),
        serde_json::Value::Array(arr) => {
            serde_yaml::Value::Sequence(arr.iter().map(yaml_from_json).collect())
        }
        serde_json::Value::Object(obj) => {
            let mut map = serde_yaml::Mapping::new();
            for (k, v) in obj {
                map.insert(serde_yaml::Value::String(k.clone()), yaml_from_json(v));
            }
            serde_yaml::Value::Mapping(map)
        }
    }
}

fn json_from_yaml(yaml: &serde_yaml::Value) -> serde_json::Value {
    match yaml {
        serde_yaml::Value::Null => serde_json::Value::Null,
        serde_yaml::Value::Bool(b) => serde_json::Value::Bool(*b),
        serde_yaml::Value::Number(n) => match n.as_i64() {
            Some(i) => serde_json::Value::Number(i.into()),
            None => serde_json::Value::String(n.to_string()),
        },
        serde_yaml::Value::String(s) => serde_json::Value::String(s.clone()),
        serde_yaml::Value::Sequence(seq) => {
            serde_json::Value::Array(seq.iter().map(json_from_yaml).collect())
        }
        serde_yaml::Value::Mapping(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                let key = match k {
                    serde_yaml::Value::String(s) => s.clone(),
                    other => render_plain(&Value::from_yaml(other)),
                };
                out.insert(key, json_from_yaml(v));
            }
            serde_json::Value::Object(out)
        }
        serde_yaml::Value::Tagged(tagged) => json_from_yaml(&tagged.value),
    }
}
