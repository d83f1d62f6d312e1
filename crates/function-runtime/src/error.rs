//! Runtime errors and the error document reported to the control plane

use serde::{Deserialize, Serialize};
use thiserror::Error;
use trace_recorder::ExceptionDescriptor;

/// Largest error document the control plane accepts by default
pub const DEFAULT_MAX_ERROR_PAYLOAD: usize = 256 * 1024;

/// Sent instead of an error document that exceeds the payload ceiling
pub const PAYLOAD_TOO_LARGE_STUB: &str = r#"{"errorMessage":"Exception exceeded maximum payload size of 256KB.","errorType":"Runtime.PayloadTooLarge"}"#;

/// Platform errors. Any of these stops the invocation loop.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Control plane error {status}: {message}")]
    ControlPlane { status: u16, message: String },

    #[error("Invalid invocation: {0}")]
    InvalidInvocation(String),

    #[error("Handler initialization failed: {0}")]
    Init(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

impl From<reqwest::Error> for RuntimeError {
    fn from(err: reqwest::Error) -> Self {
        RuntimeError::Network(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Error document posted to the `error` and `init/error` endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(rename = "errorType")]
    pub error_type: String,

    #[serde(rename = "errorMessage")]
    pub error_message: String,

    #[serde(rename = "stackTrace", default, skip_serializing_if = "Vec::is_empty")]
    pub stack_trace: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<ErrorReport>>,
}

impl ErrorReport {
    pub fn new(error_type: impl Into<String>, error_message: impl Into<String>) -> Self {
        Self {
            error_type: error_type.into(),
            error_message: error_message.into(),
            stack_trace: Vec::new(),
            cause: None,
        }
    }

    /// Build a report from a described error chain, outermost first.
    ///
    /// Each wrapped error becomes the `cause` of the one wrapping it.
    /// Returns `None` for an empty chain.
    pub fn from_descriptors(descriptors: &[ExceptionDescriptor]) -> Option<Self> {
        descriptors.iter().rev().fold(None, |inner, descriptor| {
            let mut stack_trace: Vec<String> =
                descriptor.stack.iter().map(ToString::to_string).collect();
            if descriptor.truncated > 0 {
                stack_trace.push(format!("... {} more", descriptor.truncated));
            }
            Some(Self {
                error_type: descriptor.kind.clone(),
                error_message: descriptor.message.clone(),
                stack_trace,
                cause: inner.map(Box::new),
            })
        })
    }

    /// Render as JSON, or the fixed stub when over `max_bytes`
    pub fn render(&self, max_bytes: usize) -> String {
        match serde_json::to_string(self) {
            Ok(json) if json.len() <= max_bytes => json,
            Ok(json) => {
                tracing::warn!(
                    size = json.len(),
                    limit = max_bytes,
                    "Error report exceeds payload limit; sending stub"
                );
                PAYLOAD_TOO_LARGE_STUB.to_string()
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to encode error report");
                PAYLOAD_TOO_LARGE_STUB.to_string()
            }
        }
    }

    /// Whether [`ErrorReport::render`] would fall back to the stub
    pub fn exceeds(&self, max_bytes: usize) -> bool {
        serde_json::to_string(self)
            .map(|json| json.len() > max_bytes)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_recorder::{ExceptionDescriber, StackFrame, TracedError};

    #[test]
    fn test_small_report_renders() {
        let report = ErrorReport::new("Oops", "bad input");
        let rendered = report.render(DEFAULT_MAX_ERROR_PAYLOAD);

        let json: serde_json::Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(json["errorType"], "Oops");
        assert_eq!(json["errorMessage"], "bad input");
        assert!(json.get("stackTrace").is_none());
    }

    #[test]
    fn test_oversized_report_becomes_stub() {
        let report = ErrorReport::new("Huge", "x".repeat(300 * 1024));
        assert!(report.exceeds(DEFAULT_MAX_ERROR_PAYLOAD));
        assert_eq!(report.render(DEFAULT_MAX_ERROR_PAYLOAD), PAYLOAD_TOO_LARGE_STUB);

        let stub: serde_json::Value = serde_json::from_str(PAYLOAD_TOO_LARGE_STUB).unwrap();
        assert_eq!(stub["errorType"], "Runtime.PayloadTooLarge");
    }

    #[test]
    fn test_report_nests_causes() {
        let error = TracedError::new("OrderFailed", "could not place order")
            .with_frame(StackFrame::new("src/orders.rs", 40))
            .caused_by(TracedError::new("DbTimeout", "query timed out"));
        let descriptors = ExceptionDescriber::default().describe_typed(&error);

        let report = ErrorReport::from_descriptors(&descriptors).unwrap();
        assert_eq!(report.error_type, "OrderFailed");
        assert_eq!(report.stack_trace, vec!["at src/orders.rs:40".to_string()]);

        let cause = report.cause.as_deref().unwrap();
        assert_eq!(cause.error_type, "DbTimeout");
        assert!(cause.cause.is_none());
    }

    #[test]
    fn test_truncated_frames_are_noted() {
        let frames = (0..5).map(|line| StackFrame::new("src/lib.rs", line)).collect();
        let error = TracedError::new("Deep", "deep").with_frames(frames);
        let descriptors = ExceptionDescriber::new(2).describe_typed(&error);

        let report = ErrorReport::from_descriptors(&descriptors).unwrap();
        assert_eq!(report.stack_trace.len(), 3);
        assert_eq!(report.stack_trace[2], "... 3 more");
    }

    #[test]
    fn test_empty_chain() {
        assert!(ErrorReport::from_descriptors(&[]).is_none());
    }
}
