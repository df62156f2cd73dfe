use crate::models::BatchStatus;
use thiserror::Error;

/// Errors surfaced by the orchestration core.
///
/// Only [`EngineError::InvalidTransition`] is a normal, expected rejection;
/// every other variant terminates the current batch run and requires an
/// explicit acknowledgment before a new run may start.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid transition: {from:?} -> {to:?}")]
    InvalidTransition { from: BatchStatus, to: BatchStatus },

    #[error("persistence failure: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    #[error("generation failure: {0}")]
    Generation(String),

    #[error("recovery ambiguity: {0}")]
    RecoveryAmbiguity(String),

    #[error("invalid batch config: {0}")]
    InvalidConfig(String),
}

/// Errors from the durable storage layer.
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("io error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("snapshot at {path} is not valid: {reason}")]
    Corrupt { path: String, reason: String },
}

impl PersistenceError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
