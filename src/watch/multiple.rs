//! Compositor watches: ordered groups, loops over generated data,
//! conditionals, and one-shot gates.
//!
//! Children materialize lazily from raw configuration maps inside `run`, so
//! per-iteration hash mixing sees the concrete datum and short-circuiting
//! operators never construct children they will not execute.

use indexmap::IndexMap;

use super::{get_comment, process_frame, Comment, Outcome, Watch, WatchCore, WatchError, WATCHES};
use crate::item::Item;
use crate::registry::Node;
use crate::registry::LoadResult;
use crate::runtime::Runtime;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Operator {
    All,
    Any,
    Last,
    Break,
}

impl Operator {
    pub fn parse(op: &str) -> Self {
        match op {
            "all" | "and" => Operator::All,
            "last" => Operator::Last,
            "break" => Operator::Break,
            _ => Operator::Any,
        }
    }
}

/// Folds child outcomes under an operator, deciding when iteration stops.
pub struct Accumulator {
    operator: Operator,
    trigger: bool,
    last_trigger: bool,
    failed: bool,
    comments: Vec<Comment>,
    data: Vec<Value>,
}

impl Accumulator {
    pub fn new(operator: Operator) -> Self {
        Self {
            operator,
            trigger: false,
            last_trigger: false,
            failed: false,
            comments: Vec::new(),
            data: Vec::new(),
        }
    }

    /// Fold one child outcome. Returns false when no further children may
    /// be consumed (`all` saw a miss, `break` saw a non-trigger).
    pub fn absorb(&mut self, outcome: Outcome) -> bool {
        self.last_trigger = outcome.trigger;
        if outcome.trigger {
            self.trigger = true;
            self.comments.extend(outcome.comments);
            self.data.extend(outcome.data);
            true
        } else {
            match self.operator {
                Operator::All => {
                    self.failed = true;
                    false
                }
                Operator::Break => false,
                Operator::Any | Operator::Last => true,
            }
        }
    }

    /// Produce the combined outcome, nesting child comments under the
    /// watch's own comment when one is configured.
    pub fn finish(
        self,
        core: &WatchCore,
        rt: &mut Runtime,
    ) -> Result<Outcome, WatchError> {
        if self.failed {
            return Ok(Outcome::silent());
        }

        let (trigger, mut comments, data) = match self.operator {
            Operator::Last => {
                let mut comments = self.comments;
                let mut data = self.data;
                (
                    self.last_trigger,
                    comments.pop().map(|c| vec![c]).unwrap_or_default(),
                    data.pop().map(|d| vec![d]).unwrap_or_default(),
                )
            }
            _ => (self.trigger, self.comments, self.data),
        };

        if core.comment.is_some() {
            let mut nested = get_comment(core, rt, &[])?;
            nested.push(Comment::Nested(comments));
            comments = nested;
        }
        Ok(Outcome {
            trigger,
            comments,
            data,
        })
    }
}

/// Explicit children in declaration order.
pub struct GroupWatch {
    core: WatchCore,
    operator: Operator,
    group: Vec<Value>,
}

pub fn build_group(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(GroupWatch {
        operator: Operator::parse(&node.take_str("operator")),
        group: node.take_list("group"),
        core: WatchCore::from_node(&mut node),
    }))
}

impl Watch for GroupWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let mut accumulator = Accumulator::new(self.operator);
        for config in &self.group {
            let outcome = WATCHES.load(config)?.process(rt)?;
            if !accumulator.absorb(outcome) {
                break;
            }
        }
        accumulator.finish(&self.core, rt)
    }
}

/// Run a generator watch, then instantiate the `do` body once per produced
/// datum with the datum mixed into the body's hash.
pub struct LoopWatch {
    core: WatchCore,
    operator: Operator,
    loop_cfg: IndexMap<String, Value>,
    do_cfg: IndexMap<String, Value>,
    var: String,
}

pub fn build_loop(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(LoopWatch {
        operator: Operator::parse(&node.take_str("operator")),
        loop_cfg: node.take_map("loop"),
        do_cfg: node.take_map("do"),
        var: node.take_str("as"),
        core: WatchCore::from_node(&mut node),
    }))
}

impl LoopWatch {
    fn iterate(
        &self,
        rt: &mut Runtime,
        accumulator: &mut Accumulator,
        index: usize,
        item: &Item,
    ) -> Result<bool, WatchError> {
        rt.ctx.push_variable("index", Value::Int(index as i64));
        rt.ctx
            .push_variable(&self.var, Value::Bytes(item.value().to_vec()));

        let result = (|| {
            let mut config = self.do_cfg.clone();
            config.insert("version".to_string(), Value::Str(self.core.version.clone()));
            let mut child = WATCHES.load_map(&config)?;
            let mut extra = Value::map();
            extra.insert(self.var.clone(), Value::Bytes(item.value().to_vec()));
            child.core_mut().update_hash(&Value::Map(extra));
            child.process(rt)
        })();

        rt.ctx.pop_variable(&self.var)?;
        rt.ctx.pop_variable("index")?;
        Ok(accumulator.absorb(result?))
    }
}

impl Watch for LoopWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let mut config = self.loop_cfg.clone();
        config.insert("version".to_string(), Value::Str(self.core.version.clone()));
        let mut generator = WATCHES.load_map(&config)?;
        let infinite = generator.core().tag == "infinite";
        let outcome = generator.process(rt)?;

        let mut accumulator = Accumulator::new(self.operator);
        if infinite {
            // An unbounded source is only consumable under an operator that
            // stops on the first miss.
            if !matches!(self.operator, Operator::All | Operator::Break) {
                return Err(WatchError::Invalid(
                    "infinite loop source requires an 'all' or 'break' operator".to_string(),
                ));
            }
            let item = Item::new(&b"1"[..]);
            let mut index = 0;
            while self.iterate(rt, &mut accumulator, index, &item)? {
                index += 1;
            }
        } else if outcome.trigger {
            let items = match rt.ctx.get_variable(&generator.core().hash) {
                Some(Value::Items(items)) => items.clone(),
                _ => Vec::new(),
            };
            for (index, item) in items.iter().enumerate() {
                if !self.iterate(rt, &mut accumulator, index, item)? {
                    break;
                }
            }
        }
        accumulator.finish(&self.core, rt)
    }
}

/// Evaluate a condition group, then run the `then` branch on trigger or the
/// `else` branch (when configured) otherwise.
pub struct ConditionalWatch {
    core: WatchCore,
    operator: Operator,
    operator_name: String,
    conditional: Vec<Value>,
    then_cfg: IndexMap<String, Value>,
    else_cfg: Option<IndexMap<String, Value>>,
}

pub fn build_conditional(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    let operator_name = node.take_str("operator");
    Ok(Box::new(ConditionalWatch {
        operator: Operator::parse(&operator_name),
        operator_name,
        conditional: node.take_list("conditional"),
        then_cfg: node.take_map("then"),
        else_cfg: node.take_opt_map("else"),
        core: WatchCore::from_node(&mut node),
    }))
}

impl Watch for ConditionalWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let mut condition_cfg = Value::map();
        condition_cfg.insert("group".to_string(), Value::List(self.conditional.clone()));
        condition_cfg.insert("operator".to_string(), Value::Str(self.operator_name.clone()));
        condition_cfg.insert("version".to_string(), Value::Str(self.core.version.clone()));
        let condition = WATCHES.load_map(&condition_cfg)?.process(rt)?;

        let branch = if condition.trigger {
            Some(self.then_cfg.clone())
        } else {
            self.else_cfg.clone()
        };

        let mut accumulator = Accumulator::new(self.operator);
        if let Some(mut config) = branch {
            config.insert("version".to_string(), Value::Str(self.core.version.clone()));
            let outcome = WATCHES.load_map(&config)?.process(rt)?;
            accumulator.absorb(outcome);
        }
        accumulator.finish(&self.core, rt)
    }
}

/// Run the inner watch at most once: after the first trigger the recorded
/// once-key suppresses every later run.
pub struct OnceWatch {
    core: WatchCore,
    operator: Operator,
    once: IndexMap<String, Value>,
    key: Option<String>,
}

pub fn build_once(mut node: Node) -> LoadResult<Box<dyn Watch>> {
    Ok(Box::new(OnceWatch {
        operator: Operator::parse(&node.take_str("operator")),
        once: node.take_map("once"),
        key: node.take_opt_str("key"),
        core: WatchCore::from_node(&mut node),
    }))
}

impl OnceWatch {
    fn effective_key(&self, rt: &mut Runtime) -> Result<String, WatchError> {
        match &self.key {
            Some(template) => Ok(rt.ctx.expand_str(template)?),
            None => Ok(format!("{}-once", self.core.hash)),
        }
    }
}

impl Watch for OnceWatch {
    fn core(&self) -> &WatchCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut WatchCore {
        &mut self.core
    }

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let mut accumulator = Accumulator::new(self.operator);
        let outcome = WATCHES.load_map(&self.once)?.process(rt)?;
        accumulator.absorb(outcome);
        accumulator.finish(&self.core, rt)
    }

    fn process(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        let key = self.effective_key(rt)?;
        if rt.cache.has_entry(&key)? {
            return Ok(Outcome::silent());
        }
        let outcome = process_frame(self, rt)?;
        if outcome.trigger {
            rt.cache.put_entry(&key, Value::Bool(true))?;
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::cache::Cache;
    use crate::config::EngineConfig;

    #[test]
    fn test_group_any_accumulates_triggered() {
        with_runtime(|rt| {
            let mut w = load(
                "group:\n  - static: [a]\n    comment: first\n  - static: []\n  - static: [b]\n    comment: third\n",
            );
            let outcome = w.process(rt).unwrap();
            assert!(outcome.trigger);
            assert_eq!(comment_lines(&outcome), "first\nthird");
        });
    }

    #[test]
    fn test_group_all_short_circuits() {
        with_runtime(|rt| {
            // The third child would create a marker file; under `all` it must
            // never execute once the empty second child misses.
            let dir = tempfile::TempDir::new().unwrap();
            let marker = dir.path().join("ran");
            let yaml = format!(
                "group:\n  - static: [a]\n  - static: []\n  - cmd: 'touch {}'\noperator: all\n",
                marker.display()
            );
            let mut w = load(&yaml);
            let outcome = w.process(rt).unwrap();
            assert!(!outcome.trigger);
            assert!(outcome.comments.is_empty());
            assert!(!marker.exists());
        });
    }

    #[test]
    fn test_group_all_triggers_when_all_do() {
        with_runtime(|rt| {
            let mut w = load(
                "group:\n  - static: [a]\n  - static: [b]\noperator: all\n",
            );
            assert!(w.process(rt).unwrap().trigger);
        });
    }

    #[test]
    fn test_group_last_keeps_last_trigger() {
        with_runtime(|rt| {
            let mut w = load(
                "group:\n  - static: [a]\n    comment: first\n  - static: [b]\n    comment: second\noperator: last\n",
            );
            let outcome = w.process(rt).unwrap();
            assert!(outcome.trigger);
            assert_eq!(comment_lines(&outcome), "second");

            // Overall trigger follows the LAST child even when earlier ones
            // triggered.
            let mut w = load(
                "group:\n  - static: [a]\n    comment: first\n  - static: []\noperator: last\n",
            );
            let outcome = w.process(rt).unwrap();
            assert!(!outcome.trigger);
        });
    }

    #[test]
    fn test_group_nests_under_own_comment() {
        with_runtime(|rt| {
            let mut w = load(
                "group:\n  - static: [a]\n    comment: child\ncomment: parent\n",
            );
            let outcome = w.process(rt).unwrap();
            assert_eq!(comment_lines(&outcome), "parent\n  child");
        });
    }

    #[test]
    fn test_loop_iterates_with_distinct_hashes() {
        with_runtime(|rt| {
            let mut w = load(
                "loop:\n  static: [x, y]\n  match: none\ndo:\n  cmd: 'echo {{ loop }}-{{ index }}'\n  selectors:\n    - strip: ''\n  match: none\n  comment: '{{ data }}'\noperator: or\n",
            );
            let outcome = w.process(rt).unwrap();
            assert!(outcome.trigger);
            assert_eq!(comment_lines(&outcome), "x-0\ny-1");
        });
    }

    #[test]
    fn test_loop_iteration_cache_identity() {
        // The same `do` body under different data carries a different mixed
        // hash; keying a cache match on `{{ hash }}` keeps iterations from
        // colliding, so both trigger on the first run and neither on the
        // second.
        let source = "loop:\n  static: [x, y]\n  match: none\ndo:\n  static: [payload]\n  match:\n    type: cache\n    key: '{{ hash }}-seen'\n  comment: '{{ loop }}'\n";
        with_runtime(|rt| {
            let mut w = load(source);
            let outcome = w.process(rt).unwrap();
            assert!(outcome.trigger);
            assert_eq!(comment_lines(&outcome), "x\ny");

            let mut w = load(source);
            let outcome = w.process(rt).unwrap();
            assert!(!outcome.trigger);
        });
    }

    #[test]
    fn test_loop_zero_iterations() {
        with_runtime(|rt| {
            let mut w = load(
                "loop:\n  static: []\n  match: none\ndo:\n  static: [z]\n",
            );
            let outcome = w.process(rt).unwrap();
            assert!(!outcome.trigger);
        });
    }

    #[test]
    fn test_loop_infinite_bounded_by_break() {
        with_runtime(|rt| {
            // Consume the infinite source until the counter reaches 3.
            rt.ctx.set_variable("limit", Value::Int(3));
            let mut w = load(
                "loop:\n  type: infinite\ndo:\n  cond: '{{ index }} lt {{ limit }}'\n  comment: 'i{{ index }}'\noperator: break\n",
            );
            let outcome = w.process(rt).unwrap();
            assert!(outcome.trigger);
            assert_eq!(comment_lines(&outcome), "i0\ni1\ni2");
        });
    }

    #[test]
    fn test_loop_infinite_requires_terminating_operator() {
        with_runtime(|rt| {
            let mut w = load("loop:\n  type: infinite\ndo:\n  static: [a]\noperator: or\n");
            assert!(matches!(w.process(rt), Err(WatchError::Invalid(_))));
        });
    }

    #[test]
    fn test_conditional_then_else() {
        with_runtime(|rt| {
            let mut w = load(
                "conditional:\n  - cond: '1 eq 1'\nthen:\n  static: [t]\n  comment: then-ran\nelse:\n  static: [f]\n  comment: else-ran\n",
            );
            assert_eq!(comment_lines(&w.process(rt).unwrap()), "then-ran");

            let mut w = load(
                "conditional:\n  - cond: '0 eq 1'\nthen:\n  static: [t]\n  comment: then-ran\nelse:\n  static: [f]\n  comment: else-ran\n",
            );
            assert_eq!(comment_lines(&w.process(rt).unwrap()), "else-ran");
        });
    }

    #[test]
    fn test_conditional_without_else_is_silent() {
        with_runtime(|rt| {
            let mut w = load(
                "conditional:\n  - cond: '0 eq 1'\nthen:\n  static: [t]\n",
            );
            let outcome = w.process(rt).unwrap();
            assert!(!outcome.trigger);
        });
    }

    #[test]
    fn test_once_suppresses_second_run() {
        let mut cache = Cache::ephemeral().unwrap();
        let config = EngineConfig::default();
        let source = "once:\n  static: [a]\n  comment: fired\n";

        let mut rt = Runtime::new(&mut cache, &config);
        let mut w = load(source);
        let outcome = w.process(&mut rt).unwrap();
        assert!(outcome.trigger);

        // Fresh instance, same cache: the once-key is already recorded. The
        // inner command must not run again.
        let mut w = load(source);
        let outcome = w.process(&mut rt).unwrap();
        assert!(!outcome.trigger);
        assert!(outcome.comments.is_empty());
    }

    #[test]
    fn test_once_only_records_on_trigger() {
        with_runtime(|rt| {
            // The inner condition reads a context variable, so the same
            // configuration (same hash) can miss first and fire later.
            let source = "once:\n  cond: '{{ flag }} eq 1'\n  comment: fired\n";
            rt.ctx.set_variable("flag", Value::Int(0));
            let mut w = load(source);
            assert!(!w.process(rt).unwrap().trigger);

            // The miss must not have recorded the once-key.
            rt.ctx.set_variable("flag", Value::Int(1));
            let mut w = load(source);
            assert!(w.process(rt).unwrap().trigger);

            // Now it has.
            let mut w = load(source);
            assert!(!w.process(rt).unwrap().trigger);
        });
    }
}
