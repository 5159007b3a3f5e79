//! The recursive watch execution engine.
//!
//! A watch either fetches data (url, cmd, range, static, ...) or composes
//! children (group, loop, conditional, once, template). Execution is strictly
//! sequential and lexical: `process` pushes a context frame for the watch's
//! lifetime, runs `before` hooks (match disabled, failures abort), delegates
//! to the subclass `run`, then always runs `after` hooks (failures swallowed)
//! and pops the frame.
//!
//! Root watches go through [`execute`], which owns the run bookkeeping:
//! `<hash>-executed` / `<hash>-triggered` timestamps, consecutive-failure
//! counting with alert thresholds, and action dispatch.

mod cmd;
mod data;
mod multiple;
mod template;
mod url;

use std::time::Instant;

use indexmap::IndexMap;
use thiserror::Error;

use crate::action::{Action, ActionError, ErrorPayload, ReportPayload, ACTIONS};
use crate::cache::CacheError;
use crate::context::ContextError;
use crate::matcher::MatchError;
use crate::registry::{
    mix_hash, Descriptor, FieldDefault, FieldKind, FieldSpec, LoadError, Node, Registry,
};
use crate::runtime::Runtime;
use crate::selector::SelectorError;
use crate::template::{finalize, TemplateError};
use crate::value::Value;

pub use data::DataCore;

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("fetch error: {0}")]
    Fetch(String),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error(transparent)]
    Selector(#[from] SelectorError),

    #[error(transparent)]
    Match(#[from] MatchError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Action(#[from] ActionError),

    #[error("unknown configuration template '{0}'")]
    UnknownTemplate(String),

    #[error("template missing required variable '{0}'")]
    MissingRequiredVariable(String),

    #[error("{0}")]
    Invalid(String),
}

/// A rendered comment tree: lines at the current level plus nested groups.
#[derive(Debug, Clone, PartialEq)]
pub enum Comment {
    Line(String),
    Nested(Vec<Comment>),
}

/// The result of processing a watch.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub trigger: bool,
    pub comments: Vec<Comment>,
    pub data: Vec<Value>,
}

impl Outcome {
    pub fn silent() -> Self {
        Self {
            trigger: false,
            comments: Vec::new(),
            data: Vec::new(),
        }
    }

    pub fn triggered(comments: Vec<Comment>, data: Vec<Value>) -> Self {
        Self {
            trigger: true,
            comments,
            data,
        }
    }
}

/// Fields shared by every watch.
#[derive(Debug, Clone)]
pub struct WatchCore {
    pub tag: &'static str,
    pub comment: Option<String>,
    pub before: Vec<Value>,
    pub after: Vec<Value>,
    pub action_data: Option<IndexMap<String, Value>>,
    pub actions: Vec<Value>,
    pub version: String,
    pub hash: String,
}

impl WatchCore {
    pub fn from_node(node: &mut Node) -> Self {
        Self {
            tag: node.tag,
            comment: node.take_opt_str("comment"),
            before: node.take_list("before"),
            after: node.take_list("after"),
            action_data: node.take_opt_map("action_data"),
            actions: node.take_list("actions"),
            version: node.take_str("version"),
            hash: node.hash.clone(),
        }
    }

    /// Fold extra state into this watch's identity, e.g. the loop datum or
    /// template variables, so per-instantiation cache entries stay distinct.
    pub fn update_hash(&mut self, extra: &Value) {
        self.hash = mix_hash(&self.hash, extra);
    }
}

pub trait Watch {
    fn core(&self) -> &WatchCore;

    fn core_mut(&mut self) -> &mut WatchCore;

    fn run(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError>;

    /// Frame-scoped execution; overridden only by watches that gate the
    /// whole frame (`once`) or wrap it in extra scope (`template`).
    fn process(&mut self, rt: &mut Runtime) -> Result<Outcome, WatchError> {
        process_frame(self, rt)
    }
}

/// The shared `process` contract: frame push, `before` hooks, `run`,
/// `after` hooks, frame pop.
pub fn process_frame<W: Watch + ?Sized>(
    watch: &mut W,
    rt: &mut Runtime,
) -> Result<Outcome, WatchError> {
    let hash = watch.core().hash.clone();
    let before = watch.core().before.clone();
    let after = watch.core().after.clone();

    rt.ctx.push_frame(&hash);
    rt.ctx.push_variable("hash", Value::Str(hash.clone()));

    let result = (|| {
        for config in &before {
            load_hook(config)?.process(rt)?;
        }
        watch.run(rt)
    })();

    // After hooks always run; their own failures are logged, never surfaced.
    for config in &after {
        if let Err(e) = load_hook(config).and_then(|mut hook| hook.process(rt)) {
            tracing::debug!(error = %e, "after hook failed");
        }
    }
    rt.ctx.pop_frame(&hash)?;

    match result? {
        outcome if outcome.trigger => Ok(outcome),
        _ => Ok(Outcome::silent()),
    }
}

/// Load a `before`/`after` hook watch with its match forcibly disabled.
pub fn load_hook(config: &Value) -> Result<Box<dyn Watch>, WatchError> {
    let mut map = match config {
        Value::Map(map) => map.clone(),
        other => {
            return Err(WatchError::Invalid(format!(
                "hook configuration must be a mapping, got {}",
                other.type_name()
            )))
        }
    };
    map.insert("match".to_string(), Value::from("none"));
    Ok(WATCHES.load_map(&map)?)
}

/// Expand this watch's comment (if any) into comment-tree lines, with
/// `extra` variables visible during expansion.
pub fn get_comment(
    core: &WatchCore,
    rt: &mut Runtime,
    extra: &[(&str, Value)],
) -> Result<Vec<Comment>, WatchError> {
    let template = match &core.comment {
        None => return Ok(Vec::new()),
        Some(template) => template.clone(),
    };
    for (name, value) in extra {
        rt.ctx.push_variable(name, value.clone());
    }
    let rendered = rt.ctx.expand_str(&template);
    for (name, _) in extra.iter().rev() {
        rt.ctx.pop_variable(name)?;
    }
    Ok(vec![Comment::Line(rendered?)])
}

/// Build the structured records for a triggered watch: the configured
/// `action_data` expanded, under stable `id`/`executed` defaults.
pub fn get_data(core: &WatchCore, rt: &mut Runtime) -> Result<Vec<Value>, WatchError> {
    let configured = match &core.action_data {
        None => return Ok(Vec::new()),
        Some(map) => Value::Map(map.clone()),
    };
    let mut record = Value::map();
    record.insert("id".to_string(), rt.ctx.get_or("hash", Value::Null));
    record.insert("executed".to_string(), rt.ctx.get_or("starttime", Value::Null));
    if let Value::Map(expanded) = rt.ctx.expand(&configured)? {
        for (k, v) in expanded {
            record.insert(k, v);
        }
    }
    Ok(vec![Value::Map(record)])
}

/// Render a comment tree to indented text: two spaces per nesting level,
/// sub-lists indented one level deeper after the first line of a sibling
/// run, empty sub-renders elided.
pub fn render_comment(comments: &[Comment], indent: usize) -> String {
    let mut child_indent = indent;
    let mut output: Vec<String> = Vec::new();
    let pad = "  ".repeat(indent);
    for (i, node) in comments.iter().enumerate() {
        match node {
            Comment::Line(text) => {
                if i == 0 {
                    child_indent = indent + 1;
                }
                let continuation = format!("\n{pad}");
                output.push(format!(
                    "{pad}{}",
                    text.lines().collect::<Vec<_>>().join(&continuation)
                ));
            }
            Comment::Nested(children) => {
                let sub = render_comment(children, child_indent);
                if !sub.is_empty() {
                    output.push(sub);
                }
            }
        }
    }
    output.join("\n")
}

/// Top-level entrypoint for a root watch: bookkeeping, processing, action
/// dispatch, and failure accounting.
pub fn execute(watch: &mut dyn Watch, rt: &mut Runtime) -> Result<(), WatchError> {
    let started = Instant::now();
    let starttime = chrono::Utc::now().timestamp();
    rt.ctx.set_variable("starttime", Value::Int(starttime));
    let hash = watch.core().hash.clone();

    // The watch's own actions must load; broken default actions are skipped.
    let mut actions: Vec<Box<dyn Action>> = Vec::new();
    for config in &watch.core().actions.clone() {
        actions.push(ACTIONS.load(config)?);
    }
    for config in &rt.config.default_actions.clone() {
        match ACTIONS.load(config) {
            Ok(action) => actions.push(action),
            Err(e) => tracing::warn!(error = %e, "unable to load default action, skipping"),
        }
    }

    rt.cache
        .put_entry(&format!("{hash}-executed"), Value::Int(starttime))?;

    match watch.process(rt) {
        Ok(outcome) => {
            rt.cache
                .put_entry(&format!("{hash}-failures"), Value::Int(0))?;
            let elapsed = started.elapsed().as_secs();
            if outcome.trigger {
                rt.cache
                    .put_entry(&format!("{hash}-triggered"), Value::Int(starttime))?;
                tracing::info!("{hash}:{elapsed:04}:True");
                let payload = ReportPayload {
                    comment: render_comment(&outcome.comments, 0),
                    data: outcome.data,
                };
                for action in &actions {
                    if let Err(e) = action.report(rt, &payload) {
                        tracing::warn!(error = %e, "action dispatch failed");
                    }
                }
            } else {
                tracing::info!("{hash}:{elapsed:04}:False");
            }
            Ok(())
        }
        Err(err @ WatchError::Cache(_)) => Err(err),
        Err(err) => {
            let failures = match rt.cache.get_entry(&format!("{hash}-failures"))? {
                Some(Value::Int(n)) => n + 1,
                _ => 1,
            };
            rt.cache
                .put_entry(&format!("{hash}-failures"), Value::Int(failures))?;

            let elapsed = started.elapsed().as_secs();
            if rt.config.verbose {
                tracing::error!("{hash}:{elapsed:04}:Error:{failures}: {err:?}");
            } else {
                tracing::error!("{hash}:{elapsed:04}:Error:{failures}: {err}");
            }

            if [3, 10, 25, 50].contains(&failures) {
                let watch_file = finalize(rt.ctx.get_variable("watch_file"));
                let payload = ErrorPayload {
                    error: format!(
                        "{hash}:{watch_file} has failed {failures} times in a row"
                    ),
                };
                for action in &actions {
                    if let Err(e) = action.error(rt, &payload) {
                        tracing::warn!(error = %e, "error action dispatch failed");
                    }
                }
            }
            Ok(())
        }
    }
}

static WATCH_KEYS: &[FieldSpec] = &[
    FieldSpec::new("comment", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("before", FieldKind::ListOfMaps, FieldDefault::EmptyList),
    FieldSpec::new("after", FieldKind::ListOfMaps, FieldDefault::EmptyList),
    FieldSpec::new("action_data", FieldKind::Map, FieldDefault::Null),
    FieldSpec::new("actions", FieldKind::ListOfMaps, FieldDefault::EmptyList),
    FieldSpec::new("version", FieldKind::Str, FieldDefault::Str("1")),
];

static DATA_KEYS: &[FieldSpec] = &[
    FieldSpec::new("store", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("selectors", FieldKind::ListOfMaps, FieldDefault::EmptyList),
    FieldSpec::new("match", FieldKind::MatchSpec, FieldDefault::Null),
];

static URL_KEYS: &[FieldSpec] = &[
    FieldSpec::new("url", FieldKind::Str, FieldDefault::Null),
    FieldSpec::new("method", FieldKind::Str, FieldDefault::Str("GET")),
    FieldSpec::new("headers", FieldKind::Map, FieldDefault::EmptyMap),
    FieldSpec::new("cookies", FieldKind::Map, FieldDefault::EmptyMap),
    FieldSpec::new("body", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("code", FieldKind::OptInt, FieldDefault::Int(200)),
    FieldSpec::new("download", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("verify", FieldKind::Bool, FieldDefault::Bool(true)),
];

static CMD_KEYS: &[FieldSpec] = &[
    FieldSpec::new("cmd", FieldKind::Str, FieldDefault::Null),
    FieldSpec::new("shell", FieldKind::Str, FieldDefault::Str("/bin/sh")),
    FieldSpec::new("sudo", FieldKind::Bool, FieldDefault::Bool(false)),
    FieldSpec::new("env", FieldKind::Map, FieldDefault::EmptyMap),
    FieldSpec::new("cwd", FieldKind::Str, FieldDefault::Str(".")),
    FieldSpec::new("timeout", FieldKind::Int, FieldDefault::Int(30)),
    FieldSpec::new("return_code", FieldKind::OptInt, FieldDefault::Int(0)),
    FieldSpec::new(
        "output",
        FieldKind::Choice(&["stdout", "stderr", "both"]),
        FieldDefault::Str("stdout"),
    ),
];

static RANGE_KEYS: &[FieldSpec] = &[
    FieldSpec::new("from", FieldKind::Int, FieldDefault::Int(0)),
    FieldSpec::new("to", FieldKind::Int, FieldDefault::Int(0)),
    FieldSpec::new("step", FieldKind::Int, FieldDefault::Int(1)),
];

static STATIC_KEYS: &[FieldSpec] = &[FieldSpec::new(
    "data",
    FieldKind::List,
    FieldDefault::EmptyList,
)];

static COND_WATCH_KEYS: &[FieldSpec] = &[
    FieldSpec::new("cond", FieldKind::Str, FieldDefault::Str("")),
    FieldSpec::new("operator", FieldKind::OptStr, FieldDefault::Null),
    FieldSpec::new("comparitor", FieldKind::Str, FieldDefault::Str("{{ data }}")),
];

static OPERATORS: &[&str] = &["all", "and", "any", "or", "last", "break"];

static MULTIPLE_KEYS: &[FieldSpec] = &[FieldSpec::new(
    "operator",
    FieldKind::Choice(OPERATORS),
    FieldDefault::Str("any"),
)];

static GROUP_KEYS: &[FieldSpec] = &[FieldSpec::new(
    "group",
    FieldKind::ListOfMaps,
    FieldDefault::EmptyList,
)];

static LOOP_KEYS: &[FieldSpec] = &[
    FieldSpec::new("loop", FieldKind::Map, FieldDefault::EmptyMap),
    FieldSpec::new("do", FieldKind::Map, FieldDefault::EmptyMap),
    FieldSpec::new("as", FieldKind::Str, FieldDefault::Str("loop")),
    FieldSpec::new("operator", FieldKind::Choice(OPERATORS), FieldDefault::Str("or")),
];

static CONDITIONAL_KEYS: &[FieldSpec] = &[
    FieldSpec::new("conditional", FieldKind::ListOfMaps, FieldDefault::EmptyList),
    FieldSpec::new("operator", FieldKind::Choice(OPERATORS), FieldDefault::Str("and")),
    FieldSpec::new("then", FieldKind::Map, FieldDefault::EmptyMap),
    FieldSpec::new("else", FieldKind::Map, FieldDefault::Null),
];

static ONCE_KEYS: &[FieldSpec] = &[
    FieldSpec::new("once", FieldKind::Map, FieldDefault::EmptyMap),
    FieldSpec::new("key", FieldKind::OptStr, FieldDefault::Null),
];

static TEMPLATE_KEYS: &[FieldSpec] = &[
    FieldSpec::new("template", FieldKind::ListOfStrs, FieldDefault::EmptyList),
    FieldSpec::new("requires", FieldKind::List, FieldDefault::EmptyList),
    FieldSpec::new("variables", FieldKind::Map, FieldDefault::EmptyMap),
    FieldSpec::new("body", FieldKind::Any, FieldDefault::Null),
];

/// All registered watch types.
pub static WATCHES: Registry<dyn Watch> = Registry {
    kind: "watch",
    type_skip: &[
        "comment", "before", "after", "action_data", "actions", "version", "store", "selectors",
        "match", "operator", "as", "do", "then", "else", "variables", "requires", "body", "key",
        "method", "headers", "cookies", "code", "download", "verify", "shell", "sudo", "env",
        "cwd", "timeout", "return_code", "output", "from", "to", "step", "comparitor",
    ],
    descriptors: &[
        Descriptor {
            tag: "url",
            aliases: &[],
            default_key: Some("url"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, DATA_KEYS, URL_KEYS],
            build: url::build_url,
        },
        Descriptor {
            tag: "cmd",
            aliases: &[],
            default_key: Some("cmd"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, DATA_KEYS, CMD_KEYS],
            build: cmd::build_cmd,
        },
        Descriptor {
            tag: "true",
            aliases: &[],
            default_key: None,
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS],
            build: data::build_true,
        },
        Descriptor {
            tag: "range",
            aliases: &[],
            default_key: Some("to"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, DATA_KEYS, RANGE_KEYS],
            build: data::build_range,
        },
        Descriptor {
            tag: "infinite",
            aliases: &[],
            default_key: None,
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS],
            build: data::build_infinite,
        },
        Descriptor {
            tag: "static",
            aliases: &["data"],
            default_key: Some("data"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, DATA_KEYS, STATIC_KEYS],
            build: data::build_static,
        },
        Descriptor {
            tag: "cond",
            aliases: &[],
            default_key: Some("cond"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, COND_WATCH_KEYS],
            build: data::build_cond,
        },
        Descriptor {
            tag: "group",
            aliases: &[],
            default_key: Some("group"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, MULTIPLE_KEYS, GROUP_KEYS],
            build: multiple::build_group,
        },
        Descriptor {
            tag: "loop",
            aliases: &[],
            default_key: Some("loop"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, MULTIPLE_KEYS, LOOP_KEYS],
            build: multiple::build_loop,
        },
        Descriptor {
            tag: "conditional",
            aliases: &[],
            default_key: Some("conditional"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, MULTIPLE_KEYS, CONDITIONAL_KEYS],
            build: multiple::build_conditional,
        },
        Descriptor {
            tag: "once",
            aliases: &[],
            default_key: Some("once"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, MULTIPLE_KEYS, ONCE_KEYS],
            build: multiple::build_once,
        },
        Descriptor {
            tag: "template",
            aliases: &[],
            default_key: Some("template"),
            hash_skip: &["comment"],
            schema: &[WATCH_KEYS, MULTIPLE_KEYS, TEMPLATE_KEYS],
            build: template::build_template,
        },
    ],
};


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    fn line(s: &str) -> Comment {
        Comment::Line(s.to_string())
    }

    #[test]
    fn test_render_comment_flat() {
        let tree = vec![line("one"), line("two")];
        assert_eq!(render_comment(&tree, 0), "one\ntwo");
    }

    #[test]
    fn test_render_comment_nested_indents_two_spaces() {
        let tree = vec![
            line("parent"),
            Comment::Nested(vec![line("child"), Comment::Nested(vec![line("grand")])]),
        ];
        assert_eq!(render_comment(&tree, 0), "parent\n  child\n    grand");
    }

    #[test]
    fn test_render_comment_elides_empty_nested() {
        let tree = vec![line("only"), Comment::Nested(vec![])];
        assert_eq!(render_comment(&tree, 0), "only");
    }

    #[test]
    fn test_render_comment_multiline_string() {
        let tree = vec![
            line("head"),
            Comment::Nested(vec![line("a\nb")]),
        ];
        assert_eq!(render_comment(&tree, 0), "head\n  a\n  b");
    }

    #[test]
    fn test_hash_stable_modulo_comment() {
        let a = load("cmd: echo hi\ncomment: first\n");
        let b = load("cmd: echo hi\ncomment: second\n");
        let c = load("cmd: echo different\n");
        assert_eq!(a.core().hash, b.core().hash);
        assert_ne!(a.core().hash, c.core().hash);
    }

    #[test]
    fn test_version_busts_hash() {
        let a = load("cmd: echo hi\n");
        let b = load("cmd: echo hi\nversion: '2'\n");
        assert_ne!(a.core().hash, b.core().hash);
    }

    #[test]
    fn test_frames_balanced_after_process() {
        with_runtime(|rt| {
            let mut w = load("static: [a]\nmatch: none\n");
            w.process(rt).unwrap();
            // The watch frame is gone: its `hash` binding is unreachable.
            assert!(rt.ctx.get_variable("hash").is_none());
        });
    }

    #[test]
    fn test_before_hook_failure_aborts() {
        with_runtime(|rt| {
            let mut w = load(
                "static: [a]\nbefore:\n  - cmd: 'exit 3'\n",
            );
            assert!(w.process(rt).is_err());
        });
    }

    #[test]
    fn test_after_hook_failure_swallowed() {
        with_runtime(|rt| {
            let mut w = load(
                "static: [a]\nmatch: none\nafter:\n  - cmd: 'exit 3'\n",
            );
            let outcome = w.process(rt).unwrap();
            assert!(outcome.trigger);
        });
    }

    #[test]
    fn test_failure_thresholds_accumulate() {
        with_runtime(|rt| {
            // A command with a bad return code fails every run.
            let source = "cmd: 'exit 7'\n";
            let hash = load(source).core().hash.clone();
            for _ in 0..4 {
                let mut w = load(source);
                execute(w.as_mut(), rt).unwrap();
            }
            assert_eq!(
                rt.cache
                    .get_entry(&format!("{hash}-failures"))
                    .unwrap(),
                Some(Value::Int(4))
            );

            // A success clears the streak.
            let mut ok = load("cmd: 'exit 7'\nreturn_code: 7\n");
            execute(ok.as_mut(), rt).unwrap();
            let ok_hash = ok.core().hash.clone();
            assert_eq!(
                rt.cache.get_entry(&format!("{ok_hash}-failures")).unwrap(),
                Some(Value::Int(0))
            );
        });
    }
}
