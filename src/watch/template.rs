//! Templated watch instantiation.
//!
//! A template is a named configuration map stored at the watch-file level.
//! Invoking one (or a chain) merges the maps in order, splices the caller's
//! body into the `body:` sentinel, validates `requires`, and loads the
//! result as a watch whose hash is mixed with the invocation variables so
//! distinct instantiations keep distinct cache identities.

use indexmap::IndexMap;

use super::multiple::{Accumulator, Operator};
use super::{process_frame, Outcome, Watch, WatchCore, WatchError, WATCHES};
use crate::registry::{LoadResult, Node};
use crate::runtime::Runtime;
use crate::value::Value;

pub struct TemplateWatch {
    core: WatchCore,
    operator: Operator,
    template: Vec<String>,
    variables: IndexMap<String, Value>,
    body: Value,
    kwargs: IndexMap<String, Value>,
}

pub fn build_template(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    // `requires` may appear in the invocation for documentation; the binding
    // check runs against the resolved template map.
    node.take("requires");
    let body = match node.take("body") {
        body @ (Value::Map(_) | Value::List(_)) => body,
        _ => Value::Null,
    };
    let kwargs = node.kwargs.clone();
    Ok(Box::new(TemplateWatch {
        operator: Operator::parse(&node.take_str("operator")),
        template: node.take_str_list("template"),
        variables: node.take_map("variables"),
        body,
        kwargs,
        core: WatchCore::from_node(&mut node),
    }))
}

/// Splice `body` into the map's `body:` sentinel, recursively.
///
/// A map holding exactly `{body: ~}` is replaced outright; `{body: [..]}`
/// prepends to a list body; `{body: {..}}` merges under a map body. The
/// first sentinel found (depth-first through map values) wins.
fn replace_body(
    template: &IndexMap<String, Value>,
    body: &Value,
) -> Result<(bool, Value), WatchError> {
    if template.len() == 1 {
        if let Some(sentinel) = template.get("body") {
            return match (sentinel, body) {
                (Value::Null, _) => Ok((true, body.clone())),
                (Value::List(head), Value::List(tail)) => {
                    let mut merged = head.clone();
                    merged.extend(tail.iter().cloned());
                    Ok((true, Value::List(merged)))
                }
                (Value::Map(head), Value::Map(tail)) => {
                    let mut merged = head.clone();
                    for (k, v) in tail {
                        merged.insert(k.clone(), v.clone());
                    }
                    Ok((true, Value::Map(merged)))
                }
                _ => Err(WatchError::Invalid(format!(
                    "mismatched template body merge with types {} and {}",
                    sentinel.type_name(),
                    body.type_name()
                ))),
            };
        }
    }

    for (key, value) in template {
        if let Value::Map(child) = value {
            let (replaced, rewritten) = replace_body(child, body)?;
            if replaced {
                let mut out = template.clone();
                out.insert(key.clone(), rewritten);
                return Ok((true, Value::Map(out)));
            }
        }
    }
    Ok((false, Value::Map(template.clone())))
}

/// Merge a template chain and splice the body, falling back to a keyed
/// merge when no sentinel exists.
fn render_template(
    rt: &Runtime,
    templates: &[String],
    body: &Value,
) -> Result<IndexMap<String, Value>, WatchError> {
    let mut merged: IndexMap<String, Value> = IndexMap::new();
    for name in templates {
        let template = rt
            .template(name)
            .ok_or_else(|| WatchError::UnknownTemplate(name.clone()))?;
        let map = template.as_map().ok_or_else(|| {
            WatchError::Invalid(format!("template '{}' is not a mapping", name))
        })?;
        for (k, v) in map {
            merged.insert(k.clone(), v.clone());
        }
    }

    let (replaced, rewritten) = replace_body(&merged, body)?;
    if replaced {
        return match rewritten {
            Value::Map(map) => Ok(map),
            other => Err(WatchError::Invalid(format!(
                "template body replacement produced {}, expected a mapping",
                other.type_name()
            ))),
        };
    }

    // No sentinel: decide precedence by whether the merged template already
    // names a watch type. If it does, the body supplies extra keys; if not,
    // the body names the type and the template fills around it (body key
    // order and values win).
    let body_map = match body {
        Value::Map(map) => map.clone(),
        Value::Null => IndexMap::new(),
        other => {
            return Err(WatchError::Invalid(format!(
                "template body must be a mapping, got {}",
                other.type_name()
            )))
        }
    };
    if WATCHES.is_resolvable(&merged) {
        let mut out = merged;
        for (k, v) in body_map {
            out.insert(k, v);
        }
        Ok(out)
    } else {
        let mut out = body_map.clone();
        for (k, v) in merged {
            out.insert(k, v);
        }
        for (k, v) in body_map {
            out.insert(k, v);
        }
        Ok(out)
    }
}

impl Watch for TemplateWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let body = if self.body.is_empty() {
            Value::Map(self.kwargs.clone())
        } else {
            self.body.clone()
        };
        let mut template = render_template(rt, &self.template, &body)?;

        // `requires` inside the resolved template lists invocation variables
        // that must be bound; it is not a key of the resulting watch.
        if let Some(required) = template.shift_remove("requires") {
            if let Value::List(required) = required {
                for name in required {
                    let name = String::from_utf8_lossy(&name.to_bytes()).into_owned();
                    if !self.variables.contains_key(&name) {
                        return Err(WatchError::MissingRequiredVariable(name));
                    }
                }
            }
        }
        tracing::debug!(template = ?template, "resolved watch template");

        let mut child = WATCHES.load_map(&template)?;
        child
            .core_mut()
            .update_hash(&Value::Map(self.variables.clone()));

        let mut accumulator = Accumulator::new(self.operator);
        accumulator.absorb(child.process(rt)?);
        accumulator.finish(&self.core, rt)
    }

    fn process(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let expanded = match rt.ctx.expand(&Value::Map(self.variables.clone()))? {
            Value::Map(map) => map,
            _ => IndexMap::new(),
        };
        let names: Vec<String> = expanded.keys().cloned().collect();
        for (name, value) in expanded {
            rt.ctx.push_variable(&name, value);
        }

        let result = process_frame(self, rt);

        for name in names.iter().rev() {
            if let Err(e) = rt.ctx.pop_variable(name) {
                tracing::debug!(error = %e, "template variable pop failed");
            }
        }
        result
    }
}
