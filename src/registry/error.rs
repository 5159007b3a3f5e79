use thiserror::Error;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("unknown {kind} type '{tag}'")]
    UnknownType { kind: &'static str, tag: String },

    #[error("{kind} field '{field}' cannot be cast to {expected} (got {actual})")]
    Uncastable {
        kind: &'static str,
        field: String,
        expected: String,
        actual: &'static str,
    },

    #[error("reserved key '{key}' in {kind} configuration")]
    ReservedKey { kind: &'static str, key: String },

    #[error("unexpected argument '{field}' for {kind}")]
    UnexpectedArgument { kind: &'static str, field: String },

    #[error("{kind} requires field '{field}'")]
    MissingField { kind: &'static str, field: String },

    #[error("invalid {kind} configuration: {msg}")]
    Invalid { kind: &'static str, msg: String },
}

pub type LoadResult<T> = Result<T, LoadError>;
