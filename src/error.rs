//! Error types for Mood Flux

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur anywhere in the aggregation → training → scoring flow
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Design matrix has no rows")]
    EmptyDesignMatrix,

    #[error("Design matrix shape mismatch: expected {expected} columns, found {found}")]
    DimensionMismatch { expected: usize, found: usize },

    #[error("Insufficient training data: {found} complete rows (need at least 2)")]
    InsufficientTrainingData { found: usize },

    #[error("Repository error: {0}")]
    Repository(String),

    #[error("Model version already exists: {0}")]
    VersionConflict(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Store operation '{operation}' timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for PipelineError {
    fn from(e: sqlx::Error) -> Self {
        PipelineError::Repository(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
