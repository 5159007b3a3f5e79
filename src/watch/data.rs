//! Data-fetching leaf watches and their shared pipeline.

use indexmap::IndexMap;

use super::{get_comment, get_data, Outcome, Watch, WatchCore, WatchError};
use crate::item::Item;
use crate::matcher::{evaluate_cond, CondSpec, MATCHES};
use crate::registry::{LoadResult, Node};
use crate::runtime::Runtime;
use crate::selector;
use crate::value::Value;

/// Fields shared by every data-fetching watch.
#[derive(Debug, Clone)]
pub struct DataCore {
    pub store: Option<String>,
    pub selectors: Vec<Value>,
    pub match_spec: Option<IndexMap<String, Value>>,
}

impl DataCore {
    pub fn from_node(node: &mut Node) -> Self {
        Self {
            store: node.take_opt_str("store"),
            selectors: node.take_list("selectors"),
            match_spec: node.take_opt_map("match"),
        }
    }
}

/// The leaf algorithm: wrap fetched data as items, run the selector
/// pipeline, bind results into the context (`<hash>` process-wide, `data`
/// frame-scoped, `store` if configured), evaluate the match, and on trigger
/// expand the comment and action data.
///
/// With no `match` configured the watch triggers on non-empty output.
pub fn run_data_watch(
    core: &WatchCore,
    data: &DataCore,
    rt: &mut Runtime,
    fetched: Vec<Vec<u8>>,
    comment_vars: &[(&str, Value)],
) -> Result<Outcome, WatchError> {
    let items: Vec<Item> = fetched.into_iter().map(Item::new).collect();
    let items = selector::run_pipeline(&data.selectors, rt, items)?;

    rt.ctx.set_variable(&core.hash, Value::Items(items.clone()));
    if let Some(store) = &data.store {
        rt.ctx.set_variable(store, Value::Items(items.clone()));
    }

    rt.ctx.push_variable("data", Value::Items(items.clone()));
    let result = (|| {
        let trigger = match &data.match_spec {
            None => !items.is_empty(),
            Some(spec) => MATCHES.load_map(spec)?.matches(rt, &items)?,
        };
        if !trigger {
            return Ok(Outcome::silent());
        }
        Ok(Outcome::triggered(
            get_comment(core, rt, comment_vars)?,
            get_data(core, rt)?,
        ))
    })();
    rt.ctx.pop_variable("data")?;
    result
}

/// A null source: emits no data and always triggers.
pub struct TrueWatch {
    core: WatchCore,
}

pub fn build_true(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(TrueWatch {
        core: WatchCore::from_node(&mut node),
    }))
}

impl Watch for TrueWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        rt.ctx.set_variable(&self.core.hash, Value::Items(Vec::new()));
        Ok(Outcome::triggered(
            get_comment(&self.core, rt, &[])?,
            get_data(&self.core, rt)?,
        ))
    }
}

/// Numeric generator: `from` inclusive to `to` exclusive by `step`.
pub struct RangeWatch {
    core: WatchCore,
    data: DataCore,
    from: i64,
    to: i64,
    step: i64,
}

pub fn build_range(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(RangeWatch {
        from: node.take_int("from"),
        to: node.take_int("to"),
        step: node.take_int("step"),
        data: DataCore::from_node(&mut node),
        core: WatchCore::from_node(&mut node),
    }))
}

impl Watch for RangeWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        if self.step == 0 {
            return Err(WatchError::Fetch("range step must not be zero".to_string()));
        }
        let mut fetched = Vec::new();
        let mut current = self.from;
        while (self.step > 0 && current < self.to) || (self.step < 0 && current > self.to) {
            fetched.push(current.to_string().into_bytes());
            current += self.step;
        }
        run_data_watch(&self.core, &self.data, rt, fetched, &[])
    }
}

/// Lazy infinite source. Only consumable by a loop whose operator bounds
/// consumption; standalone it just triggers.
pub struct InfiniteWatch {
    core: WatchCore,
}

pub fn build_infinite(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(InfiniteWatch {
        core: WatchCore::from_node(&mut node),
    }))
}

impl Watch for InfiniteWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        Ok(Outcome::triggered(
            get_comment(&self.core, rt, &[])?,
            get_data(&self.core, rt)?,
        ))
    }
}

/// Emit a configured list verbatim.
pub struct StaticWatch {
    core: WatchCore,
    data: DataCore,
    values: Vec<Value>,
}

pub fn build_static(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(StaticWatch {
        values: node.take_list("data"),
        data: DataCore::from_node(&mut node),
        core: WatchCore::from_node(&mut node),
    }))
}

impl Watch for StaticWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let fetched = self.values.iter().map(Value::to_bytes).collect();
        run_data_watch(&self.core, &self.data, rt, fetched, &[])
    }
}

/// A relational comparison as a leaf watch, for use in `conditional` lists.
pub struct CondWatch {
    core: WatchCore,
    cond: String,
    operator: Option<String>,
    comparitor: String,
}

pub fn build_cond(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(CondWatch {
        cond: node.take_str("cond"),
        operator: node.take_opt_str("operator"),
        comparitor: node.take_str("comparitor"),
        core: WatchCore::from_node(&mut node),
    }))
}

impl Watch for CondWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let trigger = evaluate_cond(
            rt,
            &[],
            CondSpec {
                value: &self.cond,
                operator: self.operator.as_deref(),
                comparitor: &self.comparitor,
            },
        )?;
        if !trigger {
            return Ok(Outcome::silent());
        }
        Ok(Outcome::triggered(
            get_comment(&self.core, rt, &[])?,
            get_data(&self.core, rt)?,
        ))
    }
}
