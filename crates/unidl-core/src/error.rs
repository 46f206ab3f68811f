//! Error types for unidl core

use crate::retry::ErrorKind;
use std::time::Duration;
use thiserror::Error;
use unidl_types::{FailureKind, JobError, JobState, SessionId};
use uuid::Uuid;

/// Errors returned to callers of the registry and the core facade
#[derive(Debug, Error)]
pub enum UnidlError {
    #[error("Rate limit exceeded for session {session}, retry in {}s", .retry_after.as_secs().max(1))]
    RateLimitExceeded {
        session: SessionId,
        retry_after: Duration,
    },

    #[error("Job not found: {0}")]
    NotFound(Uuid),

    #[error("Job {0} belongs to another session")]
    Forbidden(Uuid),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Job {id} is {state}")]
    InvalidState { id: Uuid, state: JobState },

    #[error("Batch of {got} URLs exceeds the limit of {max}")]
    BatchTooLarge { got: usize, max: usize },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),
}

impl UnidlError {
    /// Check if the caller may succeed by trying again later
    pub fn is_retryable(&self) -> bool {
        match self {
            UnidlError::RateLimitExceeded { .. } => true,
            UnidlError::Engine(e) => e.kind() == ErrorKind::Network,
            _ => false,
        }
    }
}

impl From<UnidlError> for String {
    fn from(error: UnidlError) -> Self {
        error.to_string()
    }
}

/// Errors reported by an extraction engine
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum EngineError {
    #[error("Unsupported URL: {0}")]
    UnsupportedUrl(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Interrupted")]
    Interrupted,

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),
}

impl EngineError {
    /// Retry classification
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Network(_) => ErrorKind::Network,
            _ => ErrorKind::Other,
        }
    }

    /// Record form stored on a failed job
    pub fn to_job_error(&self) -> JobError {
        let (kind, message) = match self {
            EngineError::UnsupportedUrl(m) => (FailureKind::UnsupportedUrl, m.clone()),
            EngineError::NotFound(m) => (FailureKind::NotFound, m.clone()),
            EngineError::Network(m) => (FailureKind::Network, m.clone()),
            EngineError::Storage(m) => (FailureKind::Storage, m.clone()),
            EngineError::Extraction(m) => (FailureKind::Extraction, m.clone()),
            EngineError::Interrupted => (FailureKind::Interrupted, "interrupted".to_string()),
        };
        JobError::new(kind, message)
    }
}

impl From<std::io::Error> for EngineError {
    fn from(error: std::io::Error) -> Self {
        EngineError::Storage(error.to_string())
    }
}
