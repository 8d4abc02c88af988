//! Error types for the trainforge-engine crate.
//!
//! Everything here is fatal for the current call. Controlled terminations
//! (non-finite loss, exhausted patience) are reported as
//! [`crate::training::callbacks::StopReason`] instead.

use std::path::PathBuf;
use thiserror::Error;
use trainforge_core::CoreError;

/// Top-level error type for engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Checkpoint not found: {}", .0.display())]
    CheckpointNotFound(PathBuf),

    #[error("Checkpoint {} holds a {found} payload, expected {expected}", path.display())]
    CheckpointKind {
        path: PathBuf,
        expected: String,
        found: String,
    },

    #[error("Shape mismatch for '{key}': model has {expected:?}, checkpoint has {found:?}")]
    ShapeMismatch {
        key: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },

    #[error("Tensor data length {len} does not match shape {shape:?}")]
    TensorLength { shape: Vec<usize>, len: usize },

    #[error("Train step output has no 'loss' entry")]
    MissingLoss,

    #[error("Metric result for model '{model}' has no 'score' entry")]
    MissingScore { model: String },

    #[error("Validation results are inconsistent: {0}")]
    InconsistentResults(String),

    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Hook error: {0}")]
    Hook(String),

    #[error(transparent)]
    Core(CoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Checkpoint encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Checkpoint decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

impl From<CoreError> for EngineError {
    fn from(err: CoreError) -> Self {
        match err {
            CoreError::NotFound { path } => Self::CheckpointNotFound(path),
            other => Self::Core(other),
        }
    }
}

impl EngineError {
    pub fn hook(msg: impl Into<String>) -> Self {
        Self::Hook(msg.into())
    }

    pub fn invalid_config(msg: impl Into<String>) -> Self {
        Self::InvalidConfig(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }
}

/// Convenience alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;
