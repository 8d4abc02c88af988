//! Error types shared across the trainforge crates.

use std::path::PathBuf;

/// Convenience alias for results carrying a [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors raised by the shared plumbing: persistence, config, logging.
#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("File not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("Logging setup failed: {0}")]
    Logging(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound { path: path.into() }
    }
}
