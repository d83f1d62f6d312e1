//! The invocation loop
//!
//! `Idle -> Polling -> Dispatching -> Reporting -> Idle`, one invocation at a
//! time. Each invocation gets its own segment and trace context. Handler
//! failures and timeouts are reported and the loop continues; a failure to
//! talk to the control plane ends it.

use reqwest::header::HeaderValue;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tracing::Instrument;
use trace_recorder::exception::BoxError;
use trace_recorder::{
    Cause, EmitOutcome, Entity, ExceptionDescriptor, Recorder, TraceHeader, TracedError,
    TRACE_ENV_VAR,
};

use crate::client::{ControlPlaneClient, ErrorPost, Invocation};
use crate::config::{FunctionConfig, RuntimeConfig};
use crate::error::{ErrorReport, Result, RuntimeError};
use crate::handler::Handler;
use crate::metrics::{InvocationOutcome, RuntimeMetrics};

/// Error kind reported for an invocation that ran past its ceiling
pub const TIMEOUT_ERROR: &str = "Runtime.InvocationTimeout";

/// Error kind reported when the handler cannot be created
pub const INIT_ERROR: &str = "Runtime.InitError";

/// Largest trace cause sent alongside an error report
pub const MAX_XRAY_CAUSE_BYTES: usize = 1024 * 1024;

const SEGMENT_ORIGIN: &str = "AWS::Lambda::Function";

/// Drives a handler against the control plane
pub struct Runtime<H> {
    config: RuntimeConfig,
    function: Arc<FunctionConfig>,
    client: ControlPlaneClient,
    recorder: Recorder,
    metrics: Arc<RuntimeMetrics>,
    handler: H,
}

impl<H: Handler> Runtime<H> {
    pub fn new(config: RuntimeConfig, recorder: Recorder, handler: H) -> Result<Self> {
        config.validate()?;
        let client = ControlPlaneClient::new(&config.runtime_api)?;
        let function = Arc::new(config.function.clone());

        tracing::info!(
            function_name = %function.function_name,
            function_version = %function.function_version,
            memory_size_mb = ?function.memory_size_mb,
            invocation_timeout_secs = config.invocation_timeout.as_secs(),
            "Runtime initialized"
        );

        Ok(Self {
            config,
            function,
            client,
            recorder,
            metrics: Arc::new(RuntimeMetrics::new()?),
            handler,
        })
    }

    /// Build the handler with `init`, reporting a failure to `init/error`
    /// before returning it.
    pub async fn run_with_init<F, Fut, E>(
        config: RuntimeConfig,
        recorder: Recorder,
        init: F,
    ) -> Result<Self>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<H, E>>,
        E: Into<BoxError>,
    {
        match init().await {
            Ok(handler) => Self::new(config, recorder, handler),
            Err(e) => {
                let error: BoxError = e.into();
                tracing::error!(error = %error, "Handler initialization failed");

                let client = ControlPlaneClient::new(&config.runtime_api)?;
                let descriptors = recorder.describer().describe(error.as_ref());
                let report = ErrorReport::from_descriptors(&descriptors)
                    .unwrap_or_else(|| ErrorReport::new(INIT_ERROR, error.to_string()));
                let post = ErrorPost {
                    body: report.render(config.max_error_payload),
                    function_error_type: Some(report.error_type.clone()),
                    xray_cause: None,
                };
                client.post_init_error(post).await?;
                Err(RuntimeError::Init(error.to_string()))
            }
        }
    }

    pub fn metrics(&self) -> Arc<RuntimeMetrics> {
        Arc::clone(&self.metrics)
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    /// Process invocations until the control plane fails
    pub async fn run(&self) -> Result<()> {
        loop {
            self.run_once().await?;
        }
    }

    /// Poll for one invocation, run it and report the outcome
    pub async fn run_once(&self) -> Result<InvocationOutcome> {
        let invocation = self.client.next_invocation(&self.function).await?;
        let request_id = invocation.context.request_id.clone();

        let inbound = invocation
            .context
            .trace_id
            .as_deref()
            .and_then(TraceHeader::parse);
        // Only this loop writes the slot, and only between invocations.
        // Contexts created below carry the header themselves, so their
        // tasks never read it back from the environment.
        match &invocation.context.trace_id {
            Some(raw) => std::env::set_var(TRACE_ENV_VAR, raw),
            None => std::env::remove_var(TRACE_ENV_VAR),
        }

        let segment = self.begin_segment(&invocation, inbound.as_ref());
        let span = tracing::info_span!(
            "invocation",
            request_id = %request_id,
            trace_id = %segment.trace_id()
        );

        async {
            let started = Instant::now();
            let result = self.dispatch(invocation, &segment, inbound.as_ref()).await;
            let elapsed = started.elapsed().as_secs_f64();

            let (outcome, reported) = match result {
                Ok(Ok(output)) => {
                    let echo = inbound
                        .as_ref()
                        .and_then(|header| header.response_echo(segment.sampled()));
                    let reported = self
                        .client
                        .post_response(&request_id, output, echo.as_deref())
                        .await;
                    (InvocationOutcome::Success, reported)
                }
                Ok(Err(error)) => {
                    tracing::warn!(error = %error, "Handler returned an error");
                    let descriptors = self.recorder.describer().describe(error.as_ref());
                    segment.add_exception(descriptors.clone());
                    let post = self.error_post(&descriptors, &segment, true);
                    let reported = self.client.post_error(&request_id, post).await;
                    (InvocationOutcome::Error, reported)
                }
                Err(_) => {
                    tracing::error!(
                        timeout_secs = self.config.invocation_timeout.as_secs(),
                        "Invocation timed out"
                    );
                    let error = TracedError::new(
                        TIMEOUT_ERROR,
                        format!(
                            "Task timed out after {:.2} seconds",
                            self.config.invocation_timeout.as_secs_f64()
                        ),
                    );
                    let descriptors = self.recorder.describe(&error);
                    segment.add_exception(descriptors.clone());
                    let post = self.error_post(&descriptors, &segment, false);
                    let reported = self.client.post_error(&request_id, post).await;
                    (InvocationOutcome::Timeout, reported)
                }
            };

            self.metrics.record_invocation(outcome, elapsed);
            self.flush(&segment);

            reported.map(|()| {
                tracing::info!(outcome = outcome.as_str(), duration_secs = elapsed, "Invocation complete");
                outcome
            })
        }
        .instrument(span)
        .await
    }

    fn begin_segment(&self, invocation: &Invocation, inbound: Option<&TraceHeader>) -> Entity {
        let name = if self.function.function_name.is_empty() {
            "function"
        } else {
            self.function.function_name.as_str()
        };
        let segment = self.recorder.begin_segment(name, inbound);
        segment.set_origin(SEGMENT_ORIGIN);
        segment.add_aws("request_id", invocation.context.request_id.clone().into());
        if !invocation.context.invoked_function_arn.is_empty() {
            segment.add_aws(
                "function_arn",
                invocation.context.invoked_function_arn.clone().into(),
            );
        }
        segment
    }

    /// Run the handler under the invocation timeout inside the segment's
    /// trace context. The outer error is the timeout.
    async fn dispatch(
        &self,
        invocation: Invocation,
        segment: &Entity,
        inbound: Option<&TraceHeader>,
    ) -> std::result::Result<std::result::Result<Vec<u8>, BoxError>, tokio::time::error::Elapsed>
    {
        let facade_header = inbound
            .cloned()
            .unwrap_or_else(|| TraceHeader::for_entity(segment.trace_id(), &segment.id(), segment.sampled()));
        let context = self
            .recorder
            .new_context(segment.name())
            .with_facade_header(facade_header)
            .with_entity(segment.clone());
        let call = self.handler.call(invocation.body, invocation.context);
        tokio::time::timeout(self.config.invocation_timeout, context.scope(call)).await
    }

    fn error_post(
        &self,
        descriptors: &[ExceptionDescriptor],
        segment: &Entity,
        functional: bool,
    ) -> ErrorPost {
        let report = ErrorReport::from_descriptors(descriptors)
            .unwrap_or_else(|| ErrorReport::new("Error", "unknown error"));
        if report.exceeds(self.config.max_error_payload) {
            self.metrics.record_truncated_report();
        }

        ErrorPost {
            body: report.render(self.config.max_error_payload),
            function_error_type: functional.then(|| report.error_type.clone()),
            xray_cause: xray_cause(descriptors, segment),
        }
    }

    fn flush(&self, segment: &Entity) {
        let outcome = self.recorder.end_segment(segment);
        if let Some(EmitOutcome::Dropped(reason)) = &outcome {
            tracing::debug!(reason = %reason, "Segment dropped");
        }
        self.metrics.record_segment(outcome.as_ref());
    }
}

/// Trace cause for the error report header, when the trace is sampled and
/// the document fits
fn xray_cause(descriptors: &[ExceptionDescriptor], segment: &Entity) -> Option<String> {
    if !segment.sampled().is_sampled() || descriptors.is_empty() {
        return None;
    }
    let cause = serde_json::to_string(&Cause::new(descriptors.to_vec())).ok()?;
    if cause.len() > MAX_XRAY_CAUSE_BYTES || HeaderValue::from_str(&cause).is_err() {
        tracing::debug!(bytes = cause.len(), "Trace cause not attached to error report");
        return None;
    }
    Some(cause)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_recorder::{SampleDecision, TraceArena, TraceId};

    fn descriptors() -> Vec<ExceptionDescriptor> {
        trace_recorder::ExceptionDescriber::default()
            .describe_typed(&TracedError::new("Boom", "it broke"))
    }

    #[test]
    fn test_xray_cause_only_for_sampled_traces() {
        let sampled = TraceArena::new_segment("fn", TraceId::new(), None, SampleDecision::Sampled);
        let cause = xray_cause(&descriptors(), &sampled).unwrap();
        let json: serde_json::Value = serde_json::from_str(&cause).unwrap();
        assert_eq!(json["exceptions"][0]["type"], "Boom");

        let unsampled =
            TraceArena::new_segment("fn", TraceId::new(), None, SampleDecision::NotSampled);
        assert!(xray_cause(&descriptors(), &unsampled).is_none());
    }

    #[test]
    fn test_xray_cause_skips_empty_chain() {
        let sampled = TraceArena::new_segment("fn", TraceId::new(), None, SampleDecision::Sampled);
        assert!(xray_cause(&[], &sampled).is_none());
    }
}
