//! Sinks receiving triggered results and failure notices.

mod file;
mod render;
mod slack;

use thiserror::Error;

use crate::registry::{Descriptor, FieldDefault, FieldKind, FieldSpec, Node, Registry};
use crate::runtime::Runtime;
use crate::template::TemplateError;
use crate::value::Value;

#[derive(Debug, Error)]
pub enum ActionError {
    #[error("action I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("webhook request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("action payload encoding: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Template(#[from] TemplateError),
}

pub type ActionResult<T> = Result<T, ActionError>;

/// A successfully triggered watch: the rendered comment tree plus any
/// structured records it produced.
#[derive(Debug, Clone)]
pub struct ReportPayload {
    pub comment: String,
    pub data: Vec<Value>,
}

/// A watch crossing a failure threshold.
#[derive(Debug, Clone)]
pub struct ErrorPayload {
    pub error: String,
}

pub trait Action {
    fn report(&self, rt: &mut Runtime, payload: &ReportPayload) -> ActionResult<()>;

    fn error(&self, _rt: &mut Runtime, _payload: &ErrorPayload) -> ActionResult<()> {
        Ok(())
    }
}

/// Log to the process logger at a configured level.
struct LogAction {
    level: String,
    error_level: String,
}

fn build_log(mut node: Node) -> crate::registry::LoadResult<Box<dyn Action>> {
    Ok(Box::new(LogAction {
        level: node.take_str("level"),
        error_level: node.take_str("error_level"),
    }))
}

fn emit(level: &str, message: &str) {
    match level {
        "debug" => tracing::debug!("{message}"),
        "warning" => tracing::warn!("{message}"),
        "error" | "critical" => tracing::error!("{message}"),
        _ => tracing::info!("{message}"),
    }
}

impl Action for LogAction {
    fn report(&self, _rt: &mut Runtime, payload: &ReportPayload) -> ActionResult<()> {
        emit(&self.level, &payload.comment);
        Ok(())
    }

    fn error(&self, _rt: &mut Runtime, payload: &ErrorPayload) -> ActionResult<()> {
        emit(&self.error_level, &payload.error);
        Ok(())
    }
}

static LEVELS: &[&str] = &["debug", "info", "warning", "error", "critical"];

static LOG_KEYS: &[FieldSpec] = &[
    FieldSpec::new("level", FieldKind::Choice(LEVELS), FieldDefault::Str("info")),
    FieldSpec::new(
        "error_level",
        FieldKind::Choice(LEVELS),
        FieldDefault::Str("error"),
    ),
];

static FILE_KEYS: &[FieldSpec] = &[FieldSpec::new("file", FieldKind::Str, FieldDefault::Null)];

static SLACK_KEYS: &[FieldSpec] = &[
    FieldSpec::new("url", FieldKind::Str, FieldDefault::Null),
    FieldSpec::new("payload", FieldKind::Map, FieldDefault::Func(default_slack_payload)),
];

static RENDER_KEYS: &[FieldSpec] = &[
    FieldSpec::new("name", FieldKind::Str, FieldDefault::Null),
    FieldSpec::new("sort", FieldKind::ListOfStrs, FieldDefault::EmptyList),
];

fn default_slack_payload() -> Value {
    let mut map = Value::map();
    map.insert("text".to_string(), Value::from("MESSAGE"));
    Value::Map(map)
}

pub static ACTIONS: Registry<dyn Action> = Registry {
    kind: "action",
    type_skip: &["level", "error_level", "url", "payload", "name", "sort"],
    descriptors: &[
        Descriptor {
            tag: "log",
            aliases: &[],
            default_key: Some("level"),
            hash_skip: &[],
            schema: &[LOG_KEYS],
            build: build_log,
        },
        Descriptor {
            tag: "file",
            aliases: &[],
            default_key: Some("file"),
            hash_skip: &[],
            schema: &[FILE_KEYS],
            build: file::build_file,
        },
        Descriptor {
            tag: "slack",
            aliases: &[],
            default_key: Some("url"),
            hash_skip: &[],
            schema: &[SLACK_KEYS],
            build: slack::build_slack,
        },
        Descriptor {
            tag: "render",
            aliases: &[],
            default_key: Some("name"),
            hash_skip: &[],
            schema: &[RENDER_KEYS],
            build: render::build_render,
        },
    ],
};
