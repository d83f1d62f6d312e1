//! Per-invocation context handed to the handler

use chrono::{DateTime, TimeZone, Utc};
use reqwest::header::HeaderMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FunctionConfig;
use crate::error::{Result, RuntimeError};

pub const REQUEST_ID_HEADER: &str = "Lambda-Runtime-Aws-Request-Id";
pub const DEADLINE_HEADER: &str = "Lambda-Runtime-Deadline-Ms";
pub const FUNCTION_ARN_HEADER: &str = "Lambda-Runtime-Invoked-Function-Arn";
pub const TRACE_ID_HEADER: &str = "Lambda-Runtime-Trace-Id";
pub const CLIENT_CONTEXT_HEADER: &str = "Lambda-Runtime-Client-Context";
pub const COGNITO_IDENTITY_HEADER: &str = "Lambda-Runtime-Cognito-Identity";

/// What the control plane told us about one invocation
#[derive(Debug, Clone, PartialEq)]
pub struct InvocationContext {
    pub request_id: String,
    /// Deadline reported by the control plane, epoch milliseconds
    pub deadline_ms: i64,
    pub invoked_function_arn: String,
    /// Raw trace header for this invocation
    pub trace_id: Option<String>,
    /// Client context JSON, passed through untouched
    pub client_context: Option<String>,
    /// Cognito identity JSON, passed through untouched
    pub identity: Option<String>,
    pub function: Arc<FunctionConfig>,
}

impl InvocationContext {
    /// Read the invocation headers of a `next` response.
    ///
    /// The request id is required; everything else is optional.
    pub fn from_headers(headers: &HeaderMap, function: Arc<FunctionConfig>) -> Result<Self> {
        let request_id = header_str(headers, REQUEST_ID_HEADER)
            .ok_or_else(|| RuntimeError::InvalidInvocation(format!("missing {}", REQUEST_ID_HEADER)))?;

        let deadline_ms = header_str(headers, DEADLINE_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or_default();

        Ok(Self {
            request_id,
            deadline_ms,
            invoked_function_arn: header_str(headers, FUNCTION_ARN_HEADER).unwrap_or_default(),
            trace_id: header_str(headers, TRACE_ID_HEADER),
            client_context: header_str(headers, CLIENT_CONTEXT_HEADER),
            identity: header_str(headers, COGNITO_IDENTITY_HEADER),
            function,
        })
    }

    /// Deadline as a timestamp; `None` when the control plane sent none
    pub fn deadline(&self) -> Option<DateTime<Utc>> {
        if self.deadline_ms <= 0 {
            return None;
        }
        Utc.timestamp_millis_opt(self.deadline_ms).single()
    }

    /// Time left until the deadline, zero once it has passed
    pub fn remaining_time(&self) -> Duration {
        self.remaining_time_at(Utc::now())
    }

    fn remaining_time_at(&self, now: DateTime<Utc>) -> Duration {
        let remaining = self.deadline_ms - now.timestamp_millis();
        Duration::from_millis(remaining.max(0) as u64)
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderName, HeaderValue};

    fn headers(pairs: &[(&'static str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.insert(
                HeaderName::from_bytes(name.as_bytes()).unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        map
    }

    #[test]
    fn test_context_from_headers() {
        let map = headers(&[
            (REQUEST_ID_HEADER, "8476a536-e9f4-11e8-9739-2dfe598c3fcd"),
            (DEADLINE_HEADER, "1542409706888"),
            (FUNCTION_ARN_HEADER, "arn:aws:lambda:us-east-2:123456789012:function:custom-runtime"),
            (TRACE_ID_HEADER, "Root=1-5bef4de7-ad49b0e87f6ef6c87fc2e700;Parent=9a9197af755a6419;Sampled=1"),
        ]);
        let context = InvocationContext::from_headers(&map, Arc::default()).unwrap();

        assert_eq!(context.request_id, "8476a536-e9f4-11e8-9739-2dfe598c3fcd");
        assert_eq!(context.deadline_ms, 1_542_409_706_888);
        assert!(context.trace_id.as_deref().unwrap().starts_with("Root=1-5bef4de7"));
        assert!(context.client_context.is_none());
        assert_eq!(context.deadline().unwrap().timestamp(), 1_542_409_706);
    }

    #[test]
    fn test_missing_request_id() {
        let map = headers(&[(DEADLINE_HEADER, "1542409706888")]);
        let result = InvocationContext::from_headers(&map, Arc::default());
        assert!(matches!(result, Err(RuntimeError::InvalidInvocation(_))));
    }

    #[test]
    fn test_remaining_time() {
        let map = headers(&[(REQUEST_ID_HEADER, "r"), (DEADLINE_HEADER, "10000")]);
        let context = InvocationContext::from_headers(&map, Arc::default()).unwrap();

        let now = Utc.timestamp_millis_opt(7_500).single().unwrap();
        assert_eq!(context.remaining_time_at(now), Duration::from_millis(2_500));

        let later = Utc.timestamp_millis_opt(20_000).single().unwrap();
        assert_eq!(context.remaining_time_at(later), Duration::ZERO);
    }
}
