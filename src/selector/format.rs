//! Template formatting and nested sub-pipelines.

use super::{execute, Selector, SelectorCore, SelectorResult, SELECTORS};
use crate::item::Item;
use crate::registry::{LoadResult, Node};
use crate::runtime::Runtime;
use crate::value::Value;

pub struct FormatSelector {
    core: SelectorCore,
    format: String,
    var: Option<String>,
}

pub fn build_format(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    Ok(Box::new(FormatSelector {
        format: node.take_str("format"),
        var: node.take_opt_str("var"),
        core: SelectorCore::from_node(&mut node),
    }))
}

impl Selector for FormatSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    /// The current item's vars are visible to the template under the single
    /// name `vars` (`{{ vars.field }}`) while `format` renders; the result
    /// either replaces the value or lands in `vars[<var>]`.
    fn run(&self, rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let mut vars = Value::map();
        for (k, v) in item.vars() {
            vars.insert(k.clone(), Value::Bytes(v.clone()));
        }
        rt.ctx.push_variable("vars", Value::Map(vars));
        let rendered = rt.ctx.expand_str(&self.format);
        rt.ctx
            .pop_variable("vars")
            .expect("vars pushed above");
        let rendered = rendered?.into_bytes();

        let out = match &self.var {
            Some(name) => item.clone_with(None, [(name.clone(), rendered)]),
            None => item.with_value(rendered),
        };
        Ok(vec![out])
    }
}

pub struct SubSelector {
    core: SelectorCore,
    pipeline: Vec<Box<dyn Selector>>,
}

pub fn build_sub(mut node: Node) -> LoadResult<Box<dyn Selector>> {
    let configs = node.take_list("value");
    let pipeline = configs
        .iter()
        .map(|config| SELECTORS.load(config))
        .collect::<LoadResult<Vec<_>>>()?;
    Ok(Box::new(SubSelector {
        core: SelectorCore::from_node(&mut node),
        pipeline,
    }))
}

impl Selector for SubSelector {
    fn core(&self) -> &SelectorCore {
        &self.core
    }

    /// The nested pipeline runs once per input item over a singleton list;
    /// outputs concatenate.
    fn run(&self, rt: &mut Runtime, item: &Item) -> SelectorResult<Vec<Item>> {
        let mut items = vec![item.clone()];
        for selector in &self.pipeline {
            items = execute(selector.as_ref(), rt, items)?;
        }
        Ok(items)
    }
}
