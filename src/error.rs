//! Error types for the marker window agent.

use thiserror::Error;
use uuid::Uuid;

/// Main error type for the engine, the job queue and the workflows.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("analyzer returned no usable result")]
    EmptyResponse,

    /// A broken data-model invariant, e.g. a window without its marker.
    #[error("invariant violated: {0}")]
    Invariant(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience type alias for Result using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

impl EngineError {
    /// Errors that must stop the worker which observed them.
    pub fn is_fatal(&self) -> bool {
        matches!(self, EngineError::Invariant(_))
    }

    pub fn not_found(entity: &'static str, id: Uuid) -> Self {
        EngineError::NotFound { entity, id }
    }
}

/// Failures reported by an analyzer backend.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalyzerError {
    #[error("network error: {0}")]
    Network(String),

    #[error("server error ({status}): {message}")]
    Server { status: u16, message: String },

    #[error("request timed out")]
    Timeout,

    #[error("rate limited")]
    RateLimited,

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_invariant_errors_are_fatal() {
        assert!(EngineError::Invariant("window without marker".into()).is_fatal());
        assert!(!EngineError::EmptyResponse.is_fatal());
        assert!(!EngineError::Analyzer(AnalyzerError::Timeout).is_fatal());
        assert!(!EngineError::Store("unavailable".into()).is_fatal());
    }

    #[test]
    fn test_not_found_message() {
        let id = Uuid::nil();
        let err = EngineError::not_found("marker", id);
        assert_eq!(err.to_string(), format!("marker {id} not found"));
    }
}
