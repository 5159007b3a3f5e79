//! Engine configuration.
//!
//! The engine is configured via a YAML file (and per-document `config`
//! sections in watch files), with support for environment variable
//! interpolation using `${VAR_NAME}` syntax applied to the raw text before
//! parsing.

use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::value::Value;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {1}: {0}")]
    Io(std::io::Error, PathBuf),

    #[error("configuration parse error: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("environment variable '{0}' is not set")]
    MissingEnvVar(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Directory for file-log and render outputs.
    pub data_path: PathBuf,

    /// Actions appended to every root watch's own actions.
    pub default_actions: Vec<Value>,

    /// Passphrase sealing cache blob files.
    pub encryption_key: Option<String>,

    /// Include stack traces in failure logging.
    pub verbose: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data"),
            default_actions: Vec::new(),
            encryption_key: None,
            verbose: false,
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file.
    ///
    /// The file may either be the configuration map itself or wrap it under
    /// a top-level `config:` key (the watch-file form).
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(e, path.as_ref().to_path_buf()))?;
        let expanded = expand_env_vars(&text)?;
        let doc: serde_yaml::Value = serde_yaml::from_str(&expanded)?;
        let value = Value::from_yaml(&doc);
        let section = value
            .as_map()
            .and_then(|m| m.get("config"))
            .unwrap_or(&value);
        let mut config = Self::default();
        config.apply(section)?;
        Ok(config)
    }

    /// Overlay a `config` section (e.g. from a watch-file document) onto
    /// this configuration.
    pub fn apply(&mut self, section: &Value) -> Result<(), ConfigError> {
        let map = match section {
            Value::Null => return Ok(()),
            Value::Map(map) => map,
            other => {
                return Err(ConfigError::Invalid(format!(
                    "config section must be a mapping, got {}",
                    other.type_name()
                )))
            }
        };
        for (key, value) in map {
            match key.as_str() {
                "data_path" => match value {
                    Value::Str(s) => self.data_path = PathBuf::from(s),
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "data_path must be a string, got {}",
                            other.type_name()
                        )))
                    }
                },
                "default_actions" => match value {
                    Value::List(actions) => self.default_actions = actions.clone(),
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "default_actions must be a list, got {}",
                            other.type_name()
                        )))
                    }
                },
                "encryption_key" => match value {
                    Value::Null => self.encryption_key = None,
                    Value::Str(s) => self.encryption_key = Some(s.clone()),
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "encryption_key must be a string, got {}",
                            other.type_name()
                        )))
                    }
                },
                "verbose" => match value {
                    Value::Bool(b) => self.verbose = *b,
                    other => {
                        return Err(ConfigError::Invalid(format!(
                            "verbose must be a bool, got {}",
                            other.type_name()
                        )))
                    }
                },
                // Unknown keys are retained by the caller's document; they
                // are not configuration errors.
                _ => {}
            }
        }
        Ok(())
    }
}

static ENV_VAR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static pattern"));

/// Expand `${VAR_NAME}` references in raw configuration text.
pub fn expand_env_vars(text: &str) -> Result<String, ConfigError> {
    let mut missing = None;
    let expanded = ENV_VAR.replace_all(text, |caps: &regex::Captures| {
        let name = &caps[1];
        match std::env::var(name) {
            Ok(v) => v,
            Err(_) => {
                missing.get_or_insert_with(|| name.to_string());
                String::new()
            }
        }
    });
    match missing {
        Some(name) => Err(ConfigError::MissingEnvVar(name)),
        None => Ok(expanded.into_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_overlays() {
        let doc: serde_yaml::Value =
            serde_yaml::from_str("data_path: out\nverbose: true\ndefault_actions:\n  - log: info\n")
                .unwrap();
        let mut config = EngineConfig::default();
        config.apply(&Value::from_yaml(&doc)).unwrap();
        assert_eq!(config.data_path, PathBuf::from("out"));
        assert!(config.verbose);
        assert_eq!(config.default_actions.len(), 1);
    }

    #[test]
    fn test_apply_rejects_bad_types() {
        let doc: serde_yaml::Value = serde_yaml::from_str("data_path: [1]\n").unwrap();
        let mut config = EngineConfig::default();
        assert!(config.apply(&Value::from_yaml(&doc)).is_err());
    }

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("VIGIL_TEST_TOKEN", "sekrit");
        let out = expand_env_vars("key: ${VIGIL_TEST_TOKEN}\n").unwrap();
        assert_eq!(out, "key: sekrit\n");
        assert!(matches!(
            expand_env_vars("key: ${VIGIL_TEST_UNSET_VAR}\n"),
            Err(ConfigError::MissingEnvVar(_))
        ));
    }
}
