//! Watch-file loading and per-file execution.
//!
//! A watch file is a YAML stream; each document may carry `config`,
//! `variables`, `templates`, `before`, `watch`, and `after` sections. The
//! driver gives every document its own [`Runtime`] (context, templates, HTTP
//! session) over the shared cache, runs the file-level hooks, and executes
//! each root watch with isolated error reporting.

use std::path::{Path, PathBuf};

use indexmap::IndexMap;
use serde::Deserialize;

use crate::cache::Cache;
use crate::config::{expand_env_vars, ConfigError, EngineConfig};
use crate::runtime::Runtime;
use crate::value::Value;
use crate::watch::{self, WatchError, WATCHES};

/// One YAML document from a watch file.
#[derive(Debug, Default)]
pub struct Document {
    pub config: Value,
    pub variables: IndexMap<String, Value>,
    pub templates: IndexMap<String, Value>,
    pub before: Vec<Value>,
    pub watches: Vec<Value>,
    pub after: Vec<Value>,
}

impl Document {
    fn from_value(value: Value) -> Result<Self, ConfigError> {
        let map = match value {
            Value::Null => return Ok(Self::default()),
            Value::Map(map) => map,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "watch document must be a mapping, got {}",
                    other.type_name()
                )))
            }
        };

        let mut document = Self {
            config: map.get("config").cloned().unwrap_or(Value::Null),
            ..Self::default()
        };
        if let Some(Value::Map(variables)) = map.get("variables") {
            document.variables = variables.clone();
        }
        if let Some(Value::Map(templates)) = map.get("templates") {
            document.templates = templates.clone();
        }
        if let Some(Value::List(before)) = map.get("before") {
            document.before = before.clone();
        }
        if let Some(Value::List(after)) = map.get("after") {
            document.after = after.clone();
        }
        document.watches = match map.get("watch") {
            None | Some(Value::Null) => Vec::new(),
            Some(Value::List(list)) => list.clone(),
            Some(node @ Value::Map(_)) => vec![node.clone()],
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "watch section must be a mapping or list, got {}",
                    other.type_name()
                )))
            }
        };
        Ok(document)
    }
}

/// Parse every document in a watch file, expanding `${VAR}` references
/// before YAML parsing.
pub fn parse_watch_file(path: &Path) -> Result<Vec<Document>, ConfigError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(e, path.to_path_buf()))?;
    let expanded = expand_env_vars(&text)?;

    let mut documents = Vec::new();
    for deserializer in serde_yaml::Deserializer::from_str(&expanded) {
        let doc = serde_yaml::Value::deserialize(deserializer)?;
        documents.push(Document::from_value(Value::from_yaml(&doc))?);
    }
    Ok(documents)
}

/// Collect watch files from explicit paths, recursing into directories for
/// `*.yml` / `*.yaml`.
pub fn discover(paths: &[PathBuf]) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for path in paths {
        if path.is_dir() {
            for entry in walkdir::WalkDir::new(path)
                .into_iter()
                .filter_map(Result::ok)
            {
                if entry.file_type().is_file() && is_yaml(entry.path()) {
                    files.push(entry.path().to_path_buf());
                }
            }
        } else if path.is_file() {
            files.push(path.clone());
        } else {
            tracing::warn!(path = %path.display(), "watch path does not exist, skipping");
        }
    }
    files.sort();
    files
}

fn is_yaml(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("yml") | Some("yaml")
    )
}

/// Execute one document against the shared cache.
///
/// Per-watch errors are reported and isolated; only cache failures
/// propagate (they invalidate the whole run).
pub fn run_document(
    document: &Document,
    cache: &mut Cache,
    base_config: &EngineConfig,
    path: &Path,
) -> Result<(), WatchError> {
    let mut config = base_config.clone();
    if let Err(e) = config.apply(&document.config) {
        tracing::error!(file = %path.display(), error = %e, "invalid config section, skipping document");
        return Ok(());
    }

    let mut rt = Runtime::new(cache, &config);
    rt.templates = document.templates.clone();
    rt.ctx
        .set_variable("watch_file", Value::Str(path.display().to_string()));
    for (name, value) in &document.variables {
        rt.ctx.set_variable(name, value.clone());
    }

    // File-level before hooks run with matches disabled; a failure aborts
    // the document (the after hooks still run).
    let result = (|| -> Result<(), WatchError> {
        for config in &document.before {
            watch::load_hook(config)?.process(&mut rt)?;
        }
        for config in &document.watches {
            match WATCHES.load(config) {
                Ok(mut root) => match watch::execute(root.as_mut(), &mut rt) {
                    Ok(()) => {}
                    Err(err @ WatchError::Cache(_)) => return Err(err),
                    Err(err) => {
                        tracing::error!(file = %path.display(), error = %err, "watch failed to execute");
                    }
                },
                Err(err) => {
                    tracing::error!(file = %path.display(), error = %err, "invalid watch node, skipping");
                }
            }
        }
        Ok(())
    })();

    for config in &document.after {
        if let Err(e) = watch::load_hook(config).and_then(|mut hook| hook.process(&mut rt)) {
            tracing::debug!(error = %e, "file-level after hook failed");
        }
    }

    match result {
        Err(err @ WatchError::Cache(_)) => Err(err),
        Err(err) => {
            tracing::error!(file = %path.display(), error = %err, "before hook failed, document aborted");
            Ok(())
        }
        Ok(()) => Ok(()),
    }
}

/// Locate a watch node by content hash without executing anything.
///
/// Statically declared children (group members, conditional branches, once
/// bodies, loop generators and bodies) are searched too; dynamically
/// templated bodies only acquire a hash at execution time.
pub fn find_hash(files: &[PathBuf], needle: &str) -> Option<(PathBuf, Value)> {
    for path in files {
        let documents = match parse_watch_file(path) {
            Ok(documents) => documents,
            Err(e) => {
                tracing::warn!(file = %path.display(), error = %e, "unreadable watch file");
                continue;
            }
        };
        for document in documents {
            for config in &document.watches {
                let mut nodes = Vec::new();
                collect_nodes(config, &mut nodes);
                if let Some((_, node)) = nodes.into_iter().find(|(hash, _)| hash == needle) {
                    return Some((path.clone(), node));
                }
            }
        }
    }
    None
}

fn collect_nodes(config: &Value, out: &mut Vec<(String, Value)>) {
    let map = match config.as_map() {
        Some(map) => map,
        None => return,
    };
    let node = match WATCHES.realize(map) {
        Ok(node) => node,
        Err(_) => return,
    };
    out.push((node.hash.clone(), config.clone()));

    let children: &[&str] = match node.tag {
        "group" => &["group"],
        "conditional" => &["conditional", "then", "else"],
        "once" => &["once"],
        "loop" => &["loop", "do"],
        _ => &[],
    };
    for field in children {
        match node.fields.get(*field) {
            Some(Value::List(list)) => {
                for child in list {
                    collect_nodes(child, out);
                }
            }
            Some(child) => collect_nodes(child, out),
            None => {}
        }
    }
}
