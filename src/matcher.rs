//! Boolean predicates deciding whether selected items trigger a watch.

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::cache::CacheError;
use crate::item::Item;
use crate::registry::{Descriptor, FieldDefault, FieldKind, FieldSpec, Node, Registry};
use crate::runtime::Runtime;
use crate::template::TemplateError;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum MatchError {
    #[error("unknown comparison operator '{0}'")]
    UnknownOperator(String),

    #[error("comparison requires a single item, got {0}")]
    MultipleItems(usize),

    #[error("ordered comparison operand '{0}' is not an integer")]
    NonInteger(String),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

pub type MatchResult<T> = Result<T, MatchError>;

pub trait Match {
    fn hash(&self) -> &str;

    fn matches(&self, rt: &mut Runtime, items: &[Item]) -> MatchResult<bool>;
}

/// Cache-miss predicate: true exactly once per effective key.
///
/// The effective key defaults to one derived from the match's own content
/// hash, so an unchanged configuration keeps hitting the same entry across
/// runs; a templated `key` can fold in run state (e.g. `{{ data }}`).
struct CacheMatch {
    hash: String,
    key: Option<String>,
    empty: bool,
}

fn build_cache(mut node: Node) -> crate::registry::LoadResult<Box<dyn Match>> {
    Ok(Box::new(CacheMatch {
        key: node.take_opt_str("key"),
        empty: node.take_bool("empty"),
        hash: node.hash,
    }))
}

impl Match for CacheMatch {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn matches(&self, rt: &mut Runtime, items: &[Item]) -> MatchResult<bool> {
        if items.is_empty() && !self.empty {
            return Ok(false);
        }
        let key = match &self.key {
            Some(template) => {
                rt.ctx.push_variable("data", Value::Items(items.to_vec()));
                let expanded = rt.ctx.expand_str(template);
                rt.ctx.pop_variable("data").expect("data pushed above");
                expanded?
            }
            None => format!("{}-match", self.hash),
        };
        if rt.cache.has_entry(&key)? {
            return Ok(false);
        }
        rt.cache.put_entry(&key, Value::Bool(true))?;
        Ok(true)
    }
}

/// Relational predicate with a shorthand grammar inside `value`.
struct CondMatch {
    hash: String,
    value: String,
    operator: Option<String>,
    comparitor: String,
}

fn build_cond(mut node: Node) -> crate::registry::LoadResult<Box<dyn Match>> {
    Ok(Box::new(CondMatch {
        value: node.take_str("value"),
        operator: node.take_opt_str("operator"),
        comparitor: node.take_str("comparitor"),
        hash: node.hash,
    }))
}

impl Match for CondMatch {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn matches(&self, rt: &mut Runtime, items: &[Item]) -> MatchResult<bool> {
        evaluate_cond(
            rt,
            items,
            CondSpec {
                value: &self.value,
                operator: self.operator.as_deref(),
                comparitor: &self.comparitor,
            },
        )
    }
}

/// Unconditional predicate; the forced match for `before`/`after` hooks.
struct AlwaysMatch {
    hash: String,
}

fn build_always(node: Node) -> crate::registry::LoadResult<Box<dyn Match>> {
    Ok(Box::new(AlwaysMatch { hash: node.hash }))
}

impl Match for AlwaysMatch {
    fn hash(&self) -> &str {
        &self.hash
    }

    fn matches(&self, _rt: &mut Runtime, _items: &[Item]) -> MatchResult<bool> {
        Ok(true)
    }
}

static CACHE_KEYS: &[FieldSpec] = &[
    FieldSpec::new("key", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("empty", FieldKind::Bool, FieldDefault::Bool(false)),
];

static COND_KEYS: &[FieldSpec] = &[
    FieldSpec::new("value", FieldKind::Str, FieldDefault::Str("")),
    FieldSpec::new("operator", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("comparitor", FieldKind::Str, FieldDefault::Str("{{ data }}")),
];

pub static MATCHES: Registry<dyn Match> = Registry {
    kind: "match",
    type_skip: &["key", "empty", "operator", "value", "comparitor"],
    descriptors: &[
        Descriptor {
            tag: "cache",
            aliases: &[],
            default_key: Some("key"),
            hash_skip: &[],
            schema: &[CACHE_KEYS],
            build: build_cache,
        },
        Descriptor {
            tag: "cond",
            aliases: &[],
            default_key: Some("value"),
            hash_skip: &[],
            schema: &[COND_KEYS],
            build: build_cond,
        },
        Descriptor {
            tag: "none",
            aliases: &["true"],
            default_key: None,
            hash_skip: &[],
            schema: &[],
            build: build_always,
        },
    ],
};

/// The pieces of a relational comparison, shared by the `cond` match and the
/// `cond` watch.
pub struct CondSpec<'a> {
    pub value: &'a str,
    pub operator: Option<&'a str>,
    pub comparitor: &'a str,
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Operator {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl Operator {
    fn parse(op: &str) -> MatchResult<Self> {
        Ok(match op {
            "eq" | "==" => Operator::Eq,
            "neq" | "!=" => Operator::Neq,
            "lt" | "<" => Operator::Lt,
            "lte" | "<=" => Operator::Lte,
            "gt" | ">" => Operator::Gt,
            "gte" | ">=" => Operator::Gte,
            other => return Err(MatchError::UnknownOperator(other.to_string())),
        })
    }

    fn ordered(self) -> bool {
        !matches!(self, Operator::Eq | Operator::Neq)
    }
}

static SHORTHAND: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(?s)(.*?)\s+(eq|==|neq|!=|lte|<=|gte|>=|lt|<|gt|>)\s+(.*)$")
        .expect("static pattern")
});

/// Evaluate a relational comparison against the (at most one) input item.
///
/// `value` may embed the whole comparison (`"{{ data }} gte 3"`); otherwise
/// `comparitor <operator> value` is assembled from the configured fields.
/// Both sides expand as templates with `data` bound to the input items.
pub fn evaluate_cond(rt: &mut Runtime, items: &[Item], spec: CondSpec) -> MatchResult<bool> {
    if items.len() > 1 {
        return Err(MatchError::MultipleItems(items.len()));
    }

    let (lhs_src, op_src, rhs_src) = match SHORTHAND.captures(spec.value) {
        Some(caps) => (
            caps.get(1).map_or("", |m| m.as_str()).to_string(),
            caps.get(2).map_or("", |m| m.as_str()).to_string(),
            caps.get(3).map_or("", |m| m.as_str()).to_string(),
        ),
        None => {
            let op = spec
                .operator
                .ok_or_else(|| MatchError::UnknownOperator("<unset>".to_string()))?;
            (
                spec.comparitor.to_string(),
                op.to_string(),
                spec.value.to_string(),
            )
        }
    };
    let operator = Operator::parse(&op_src)?;

    rt.ctx.push_variable("data", Value::Items(items.to_vec()));
    let expanded = (|| -> Result<(String, String), TemplateError> {
        Ok((rt.ctx.expand_str(&lhs_src)?, rt.ctx.expand_str(&rhs_src)?))
    })();
    rt.ctx.pop_variable("data").expect("data pushed above");
    let (lhs, rhs) = expanded?;

    if operator.ordered() {
        let lhs: i64 = lhs
            .trim()
            .parse()
            .map_err(|_| MatchError::NonInteger(lhs.clone()))?;
        let rhs: i64 = rhs
            .trim()
            .parse()
            .map_err(|_| MatchError::NonInteger(rhs.clone()))?;
        Ok(match operator {
            Operator::Lt => lhs < rhs,
            Operator::Lte => lhs <= rhs,
            Operator::Gt => lhs > rhs,
            Operator::Gte => lhs >= rhs,
            Operator::Eq | Operator::Neq => unreachable!("handled below"),
        })
    } else {
        Ok(match operator {
            Operator::Eq => lhs == rhs,
            _ => lhs != rhs,
        })
    }
}
