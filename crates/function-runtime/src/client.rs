//! Control plane client
//!
//! Speaks the runtime API: long-poll `invocation/next`, then post either
//! `invocation/{id}/response` or `invocation/{id}/error`. Startup failures
//! go to `init/error`.

use std::sync::Arc;
use trace_recorder::TRACE_HEADER_NAME;

use crate::config::FunctionConfig;
use crate::context::InvocationContext;
use crate::error::{Result, RuntimeError};

const API_VERSION: &str = "2018-06-01";

/// Marks an error report as thrown by the handler
pub const FUNCTION_ERROR_TYPE_HEADER: &str = "Lambda-Runtime-Function-Error-Type";

/// Carries the trace cause document of a failed invocation
pub const XRAY_ERROR_CAUSE_HEADER: &str = "Lambda-Runtime-Function-XRay-Error-Cause";

/// One unit of work pulled from the control plane
#[derive(Debug, Clone)]
pub struct Invocation {
    pub context: InvocationContext,
    pub body: Vec<u8>,
}

/// An error report ready to post
#[derive(Debug, Clone, Default)]
pub struct ErrorPost {
    /// Rendered error document
    pub body: String,
    /// Set only for errors raised by handler code
    pub function_error_type: Option<String>,
    /// Serialized trace cause
    pub xray_cause: Option<String>,
}

/// HTTP client for the runtime API
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    base_url: String,
    client: reqwest::Client,
}

impl ControlPlaneClient {
    /// Create a client for `runtime_api`, given as `host:port` or as a base
    /// URL with scheme.
    pub fn new(runtime_api: &str) -> Result<Self> {
        let runtime_api = runtime_api.trim().trim_end_matches('/');
        let base_url = if runtime_api.starts_with("http://") || runtime_api.starts_with("https://") {
            format!("{}/{}", runtime_api, API_VERSION)
        } else {
            format!("http://{}/{}", runtime_api, API_VERSION)
        };

        // No request timeout: `next` blocks until work arrives.
        let client = reqwest::Client::builder().build()?;

        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Block until the next invocation is available
    pub async fn next_invocation(&self, function: &Arc<FunctionConfig>) -> Result<Invocation> {
        let url = format!("{}/runtime/invocation/next", self.base_url);
        let response = self.client.get(&url).send().await?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(RuntimeError::ControlPlane {
                status: status.as_u16(),
                message,
            });
        }

        let context = InvocationContext::from_headers(response.headers(), Arc::clone(function))?;
        let body = response.bytes().await?.to_vec();

        tracing::debug!(
            request_id = %context.request_id,
            bytes = body.len(),
            "Received invocation"
        );
        Ok(Invocation { context, body })
    }

    /// Report a successful result
    pub async fn post_response(
        &self,
        request_id: &str,
        body: Vec<u8>,
        trace_echo: Option<&str>,
    ) -> Result<()> {
        let url = format!("{}/runtime/invocation/{}/response", self.base_url, request_id);
        let mut request = self.client.post(&url).body(body);
        if let Some(echo) = trace_echo {
            request = request.header(TRACE_HEADER_NAME, echo);
        }
        self.check(request.send().await?).await
    }

    /// Report a failed invocation
    pub async fn post_error(&self, request_id: &str, error: ErrorPost) -> Result<()> {
        let url = format!("{}/runtime/invocation/{}/error", self.base_url, request_id);
        self.send_error(&url, error).await
    }

    /// Report that the handler could not be initialized
    pub async fn post_init_error(&self, error: ErrorPost) -> Result<()> {
        let url = format!("{}/runtime/init/error", self.base_url);
        self.send_error(&url, error).await
    }

    async fn send_error(&self, url: &str, error: ErrorPost) -> Result<()> {
        let mut request = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(error.body);
        if let Some(error_type) = error.function_error_type {
            request = request.header(FUNCTION_ERROR_TYPE_HEADER, error_type);
        }
        if let Some(cause) = error.xray_cause {
            request = request.header(XRAY_ERROR_CAUSE_HEADER, cause);
        }
        self.check(request.send().await?).await
    }

    async fn check(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(RuntimeError::ControlPlane {
            status: status.as_u16(),
            message,
        })
    }
}
