//! Item transforms composing the selector pipeline.
//!
//! A selector maps a list of [`Item`]s to a list of items. Elementwise
//! selectors implement [`Selector::run`] over a single item and inherit the
//! flattening `run_all`; aggregate selectors (slice, join, the history-backed
//! family) override [`Selector::run_all`] directly.
//!
//! Every selector shares three optional fields: `value` (the conventional
//! shorthand slot), `input` (read items from a context variable instead of
//! the pipeline), and `store` (push the output to a context variable and
//! pass the *input* through downstream unchanged).

mod cached;
mod format;
mod pattern;
mod query;
mod text;

use thiserror::Error;

use crate::cache::CacheError;
use crate::item::Item;
use crate::registry::{
    Descriptor, FieldDefault, FieldKind, FieldSpec, LoadError, Node, Registry,
};
use crate::runtime::Runtime;
use crate::template::TemplateError;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("selector produced an invalid result: {0}")]
    InvalidResult(String),

    #[error("item variable '{0}' is not set")]
    MissingVar(String),

    #[error("invalid JSON input: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JSON path: {0}")]
    JsonPath(String),

    #[error("decode: {0}")]
    Decode(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

pub type SelectorResult<T> = Result<T, SelectorError>;

/// Fields shared by every selector.
#[derive(Debug)]
pub struct SelectorCore {
    pub tag: &'static str,
    pub value: Option<String>,
    pub input: Option<String>,
    pub store: Option<String>,
    pub hash: String,
}

impl SelectorCore {
    pub fn from_node(node: &mut Node) -> Self {
        Self {
            tag: node.tag,
            value: node.take_opt_str("value"),
            input: node.take_opt_str("input"),
            store: node.take_opt_str("store"),
            hash: node.hash.clone(),
        }
    }
}

pub trait Selector {
    fn core(&self) -> &SelectorCore;

    /// Elementwise transform. Aggregate selectors leave this unimplemented
    /// and override [`Selector::run_all`].
    fn run(&self, _rt: &mut Runtime, _item: &Item) -> SelectorResult<Vec<Item>> {
        Err(SelectorError::InvalidResult(format!(
            "selector '{}' is aggregate-only",
            self.core().tag
        )))
    }

    /// Transform the whole item list. The default maps [`Selector::run`]
    /// over each item and flattens, dropping empty values.
    fn run_all(&self, rt: &mut Runtime, items: &[Item]) -> SelectorResult<Vec<Item>> {
        let mut out = Vec::new();
        for item in items {
            out.extend(
                self.run(rt, item)?
                    .into_iter()
                    .filter(|i| !i.value().is_empty()),
            );
        }
        Ok(out)
    }
}

/// Run one selector step of a pipeline.
///
/// Applies the `input` redirection, invokes the transform, and honors the
/// `store` pass-through contract: when `store` is set the result is pushed
/// onto the context and the caller receives the original items.
pub fn execute(
    selector: &dyn Selector,
    rt: &mut Runtime,
    items: Vec<Item>,
) -> SelectorResult<Vec<Item>> {
    let (input, store) = {
        let core = selector.core();
        (core.input.clone(), core.store.clone())
    };

    let source = match &input {
        Some(name) => items_from_value(rt.ctx.get_variable(name))?,
        None => items.clone(),
    };

    let result = selector.run_all(rt, &source)?;

    match store {
        Some(name) => {
            rt.ctx.push_variable(&name, Value::Items(result));
            Ok(items)
        }
        None => Ok(result),
    }
}

/// Interpret a context variable as an item list, wrapping scalars into a
/// singleton.
fn items_from_value(value: Option<&Value>) -> SelectorResult<Vec<Item>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Items(items)) => Ok(items.clone()),
        Some(Value::List(values)) => values
            .iter()
            .map(|v| match v {
                Value::Map(_) | Value::List(_) | Value::Items(_) => Err(
                    SelectorError::InvalidResult(format!(
                        "input element of type {} is not an item",
                        v.type_name()
                    )),
                ),
                scalar => Ok(Item::new(scalar.to_bytes())),
            })
            .collect(),
        Some(Value::Map(_)) => Err(SelectorError::InvalidResult(
            "input variable holds a mapping, not items".to_string(),
        )),
        Some(scalar) => Ok(vec![Item::new(scalar.to_bytes())]),
    }
}

static SELECTOR_KEYS: &[FieldSpec] = &[
    FieldSpec::new("value", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("input", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("store", FieldKind::OptStr, FieldDefault::Null),
];

static REGEX_KEYS: &[FieldSpec] = &[
    FieldSpec::new("regex", FieldKind::Str, FieldDefault::Str(".*")),
    FieldSpec::new("all", FieldKind::Bool, FieldDefault::Bool(false)),
];

static BYTES_KEYS: &[FieldSpec] = &[
    FieldSpec::new("start", FieldKind::Int, FieldDefault::Int(0)),
    FieldSpec::new("end", FieldKind::OptInt, FieldDefault::Null),
];

static LINES_KEYS: &[FieldSpec] = &[
    FieldSpec::new("keepends", FieldKind::Bool, FieldDefault::Bool(false)),
    FieldSpec::new("html", FieldKind::Bool, FieldDefault::Bool(false)),
];

static SPLIT_KEYS: &[FieldSpec] = &[
    FieldSpec::new("sep", FieldKind::Str, FieldDefault::Str(",")),
    FieldSpec::new("start", FieldKind::Int, FieldDefault::Int(0)),
    FieldSpec::new("end", FieldKind::OptInt, FieldDefault::Null),
];

static JOIN_KEYS: &[FieldSpec] = &[FieldSpec::new("sep", FieldKind::Str, FieldDefault::Str(","))];

static STRIP_KEYS: &[FieldSpec] = &[FieldSpec::new(
    "chars",
    FieldKind::Str,
    FieldDefault::Str("\r\n\t "),
)];

static STRIPTAGS_KEYS: &[FieldSpec] = &[FieldSpec::new(
    "replacement",
    FieldKind::Str,
    FieldDefault::Str(""),
)];

static REPLACE_KEYS: &[FieldSpec] = &[
    FieldSpec::new("regex", FieldKind::Str, FieldDefault::Str(".*")),
    FieldSpec::new("replacement", FieldKind::Str, FieldDefault::Str("")),
];

static SLICE_KEYS: &[FieldSpec] = &[
    FieldSpec::new("start", FieldKind::Int, FieldDefault::Int(0)),
    FieldSpec::new("end", FieldKind::OptInt, FieldDefault::Null),
];

static PICK_KEYS: &[FieldSpec] = &[FieldSpec::new(
    "index",
    FieldKind::List,
    FieldDefault::EmptyList,
)];

static FORMAT_KEYS: &[FieldSpec] = &[
    FieldSpec::new("format", FieldKind::Str, FieldDefault::Str("")),
    FieldSpec::new("var", FieldKind::OptStr, FieldDefault::Null),
];

static SUB_KEYS: &[FieldSpec] = &[FieldSpec::new(
    "value",
    FieldKind::ListOfMaps,
    FieldDefault::EmptyList,
)];

static DECODE_KEYS: &[FieldSpec] = &[FieldSpec::new(
    "encoding",
    FieldKind::Choice(&["html"]),
    FieldDefault::Str("html"),
)];

static CACHED_KEYS: &[FieldSpec] = &[
    FieldSpec::new("cache_key", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("key", FieldKind::OptStr, FieldDefault::Null),
];

static DICTLOAD_KEYS: &[FieldSpec] = &[FieldSpec::new(
    "filter",
    FieldKind::Bool,
    FieldDefault::Bool(false),
)];

/// All registered selector types.
pub static SELECTORS: Registry<dyn Selector> = Registry {
    kind: "selector",
    type_skip: &[
        "value", "input", "store", "start", "end", "sep", "chars", "replacement", "keepends",
        "all", "index", "var", "cache_key", "key", "filter", "encoding",
    ],
    descriptors: &[
        Descriptor {
            tag: "regex",
            aliases: &[],
            default_key: Some("regex"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, REGEX_KEYS],
            build: pattern::build_regex,
        },
        Descriptor {
            tag: "jq",
            aliases: &[],
            default_key: Some("value"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS],
            build: query::build_jq,
        },
        Descriptor {
            tag: "html",
            aliases: &[],
            default_key: Some("value"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS],
            build: query::build_html,
        },
        Descriptor {
            tag: "xml",
            aliases: &[],
            default_key: Some("value"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS],
            build: query::build_xml,
        },
        Descriptor {
            tag: "decode",
            aliases: &[],
            default_key: Some("encoding"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, DECODE_KEYS],
            build: text::build_decode,
        },
        Descriptor {
            tag: "bytes",
            aliases: &[],
            default_key: Some("end"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, BYTES_KEYS],
            build: text::build_bytes,
        },
        Descriptor {
            tag: "lines",
            aliases: &[],
            default_key: None,
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, LINES_KEYS],
            build: text::build_lines,
        },
        Descriptor {
            tag: "split",
            aliases: &[],
            default_key: Some("sep"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, SPLIT_KEYS],
            build: text::build_split,
        },
        Descriptor {
            tag: "join",
            aliases: &[],
            default_key: Some("sep"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, JOIN_KEYS],
            build: text::build_join,
        },
        Descriptor {
            tag: "strip",
            aliases: &[],
            default_key: Some("chars"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, STRIP_KEYS],
            build: text::build_strip,
        },
        Descriptor {
            tag: "striptags",
            aliases: &[],
            default_key: Some("replacement"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, STRIPTAGS_KEYS],
            build: text::build_striptags,
        },
        Descriptor {
            tag: "replace",
            aliases: &[],
            default_key: Some("regex"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, REPLACE_KEYS],
            build: text::build_replace,
        },
        Descriptor {
            tag: "slice",
            aliases: &[],
            default_key: Some("end"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, SLICE_KEYS],
            build: text::build_slice,
        },
        Descriptor {
            tag: "pick",
            aliases: &[],
            default_key: Some("index"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, PICK_KEYS],
            build: text::build_pick,
        },
        Descriptor {
            tag: "format",
            aliases: &[],
            default_key: Some("format"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, FORMAT_KEYS],
            build: format::build_format,
        },
        Descriptor {
            tag: "sub",
            aliases: &[],
            default_key: Some("value"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, SUB_KEYS],
            build: format::build_sub,
        },
        Descriptor {
            tag: "new",
            aliases: &[],
            default_key: Some("cache_key"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, CACHED_KEYS],
            build: cached::build_new,
        },
        Descriptor {
            tag: "since",
            aliases: &[],
            default_key: Some("cache_key"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, CACHED_KEYS],
            build: cached::build_since,
        },
        Descriptor {
            tag: "dictstore",
            aliases: &[],
            default_key: Some("cache_key"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, CACHED_KEYS],
            build: cached::build_dictstore,
        },
        Descriptor {
            tag: "dictload",
            aliases: &[],
            default_key: Some("cache_key"),
            hash_skip: &[],
            schema: &[SELECTOR_KEYS, CACHED_KEYS, DICTLOAD_KEYS],
            build: cached::build_dictload,
        },
    ],
};

/// Run a configured pipeline of selectors over an item list.
pub fn run_pipeline(
    configs: &[Value],
    rt: &mut Runtime,
    mut items: Vec<Item>,
) -> SelectorResult<Vec<Item>> {
    for config in configs {
        let selector = SELECTORS.load(config)?;
        items = execute(selector.as_ref(), rt, items)?;
    }
    Ok(items)
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_store_pass_through() {
        with_runtime(|rt| {
            let selector = load("split: ','\nstore: parts\n");
            let input = items(&[b"a,b,c"]);
            let out = execute(selector.as_ref(), rt, input.clone()).unwrap();
            assert_eq!(out, input);
            match rt.ctx.get_variable("parts") {
                Some(Value::Items(stored)) => {
                    assert_eq!(stored.len(), 3);
                    assert_eq!(stored[0].value(), b"a");
                }
                other => panic!("expected stored items, got {:?}", other),
            }
        });
    }

    #[test]
    fn test_input_redirection() {
        with_runtime(|rt| {
            rt.ctx
                .set_variable("feed", Value::Items(items(&[b"x", b"y"])));
            let selector = load("join: '-'\ninput: feed\n");
            let out = execute(selector.as_ref(), rt, items(&[b"ignored"])).unwrap();
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].value(), b"x-y");
        });
    }

    #[test]
    fn test_input_scalar_wraps_to_singleton() {
        with_runtime(|rt| {
            rt.ctx.set_variable("one", Value::from("solo"));
            let selector = load("strip: ''\ninput: one\n");
            let out = execute(selector.as_ref(), rt, Vec::new()).unwrap();
            assert_eq!(out.len(), 1);
            assert_eq!(out[0].value(), b"solo");
        });
    }

    #[test]
    fn test_input_mapping_is_invalid() {
        with_runtime(|rt| {
            rt.ctx.set_variable("bad", Value::Map(Value::map()));
            let selector = load("strip: ''\ninput: bad\n");
            assert!(matches!(
                execute(selector.as_ref(), rt, Vec::new()),
                Err(SelectorError::InvalidResult(_))
            ));
        });
    }

    #[test]
    fn test_pipeline_runs_in_order() {
        with_runtime(|rt| {
            let configs = vec![
                Value::from_yaml(&serde_yaml::from_str("split: ','").unwrap()),
                Value::from_yaml(&serde_yaml::from_str("strip: ' '").unwrap()),
            ];
            let out = run_pipeline(&configs, rt, items(&[b"a, b, c"])).unwrap();
            let values: Vec<&[u8]> = out.iter().map(Item::value).collect();
            assert_eq!(values, [b"a".as_slice(), b"b", b"c"]);
        });
    }
}
