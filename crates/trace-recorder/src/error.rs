//! Error types for the trace recorder
//!
//! Nothing in here is ever surfaced to instrumented handler code unless the
//! process was started with the `RUNTIME_ERROR` context-missing strategy.

use thiserror::Error;

/// Errors produced inside the tracing subsystem
#[derive(Error, Debug)]
pub enum TraceError {
    /// No entity is available in the current trace context
    #[error("Entity not available: {0}")]
    EntityNotAvailable(String),

    /// An operation was applied to the wrong kind of entity
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    /// A trace header or sampling decision could not be interpreted
    #[error("Invalid sampling decision: {0}")]
    InvalidSamplingDecision(String),

    /// Daemon address could not be parsed or resolved
    #[error("Invalid daemon address: {0}")]
    InvalidDaemonAddress(String),

    /// Socket level failure
    #[error("Transport error: {0}")]
    Transport(#[from] std::io::Error),

    /// Entity could not be encoded
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl TraceError {
    /// Create an entity-not-available error
    pub fn entity_not_available(msg: impl Into<String>) -> Self {
        TraceError::EntityNotAvailable(msg.into())
    }

    /// Create an invalid-entity error
    pub fn invalid_entity(msg: impl Into<String>) -> Self {
        TraceError::InvalidEntity(msg.into())
    }
}

/// Result type alias for recorder operations
pub type Result<T> = std::result::Result<T, TraceError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TraceError::entity_not_available("no segment");
        assert_eq!(err.to_string(), "Entity not available: no segment");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::AddrNotAvailable, "gone");
        let err: TraceError = io.into();
        assert!(matches!(err, TraceError::Transport(_)));
    }
}
