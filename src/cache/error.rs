use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache is closed")]
    Closed,

    #[error("error extracting cache archive: {0}")]
    Extract(String),

    #[error("error compressing cache archive: {0}")]
    Compress(String),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cache entries document: {0}")]
    Entries(#[from] serde_yaml::Error),

    #[error("blob encoding: {0}")]
    Blob(#[from] serde_json::Error),

    #[error("blob decryption failed (wrong key or corrupt data)")]
    Decrypt,
}

pub type CacheResult<T> = Result<T, CacheError>;
