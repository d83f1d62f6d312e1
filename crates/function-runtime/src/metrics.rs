//! Prometheus metrics for the invocation loop
//!
//! - `function_runtime_invocations_total` (counter) - Invocations by outcome
//! - `function_runtime_invocation_duration_seconds` (histogram) - Handler wall time
//! - `function_runtime_error_reports_truncated_total` (counter) - Reports replaced by the stub
//! - `function_runtime_segments_total` (counter) - Segment emission by result

use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, Opts, Registry};
use std::sync::Arc;
use trace_recorder::EmitOutcome;

use crate::error::{Result, RuntimeError};

const NAMESPACE: &str = "function_runtime";

/// How an invocation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationOutcome {
    Success,
    Error,
    Timeout,
}

impl InvocationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvocationOutcome::Success => "success",
            InvocationOutcome::Error => "error",
            InvocationOutcome::Timeout => "timeout",
        }
    }
}

/// Runtime metrics for Prometheus
pub struct RuntimeMetrics {
    registry: Arc<Registry>,
    invocations_total: CounterVec,
    duration_seconds: Histogram,
    error_reports_truncated_total: Counter,
    segments_total: CounterVec,
}

impl RuntimeMetrics {
    /// Create metrics registered with a fresh registry
    pub fn new() -> Result<Self> {
        Self::with_registry(Arc::new(Registry::new()))
    }

    /// Create metrics and register them with `registry`
    pub fn with_registry(registry: Arc<Registry>) -> Result<Self> {
        let invocations_total = CounterVec::new(
            Opts::new("invocations_total", "Total number of invocations by outcome")
                .namespace(NAMESPACE),
            &["outcome"],
        )?;

        let duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "invocation_duration_seconds",
                "Handler wall time in seconds",
            )
            .namespace(NAMESPACE)
            .buckets(vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0, 300.0]),
        )?;

        let error_reports_truncated_total = Counter::with_opts(
            Opts::new(
                "error_reports_truncated_total",
                "Error reports replaced because they exceeded the payload limit",
            )
            .namespace(NAMESPACE),
        )?;

        let segments_total = CounterVec::new(
            Opts::new("segments_total", "Trace segments by emission result").namespace(NAMESPACE),
            &["result"],
        )?;

        registry.register(Box::new(invocations_total.clone()))?;
        registry.register(Box::new(duration_seconds.clone()))?;
        registry.register(Box::new(error_reports_truncated_total.clone()))?;
        registry.register(Box::new(segments_total.clone()))?;

        Ok(Self {
            registry,
            invocations_total,
            duration_seconds,
            error_reports_truncated_total,
            segments_total,
        })
    }

    pub fn record_invocation(&self, outcome: InvocationOutcome, seconds: f64) {
        self.invocations_total
            .with_label_values(&[outcome.as_str()])
            .inc();
        self.duration_seconds.observe(seconds);
    }

    pub fn record_truncated_report(&self) {
        self.error_reports_truncated_total.inc();
    }

    /// Count the result of ending a segment; `None` means it was streamed
    pub fn record_segment(&self, outcome: Option<&EmitOutcome>) {
        let result = match outcome {
            Some(EmitOutcome::Sent(_)) => "sent",
            Some(EmitOutcome::NotSampled) => "not_sampled",
            Some(EmitOutcome::Facade) => "facade",
            Some(EmitOutcome::Dropped(_)) => "dropped",
            None => "pending",
        };
        self.segments_total.with_label_values(&[result]).inc();
    }

    pub fn invocations(&self, outcome: InvocationOutcome) -> u64 {
        self.invocations_total
            .with_label_values(&[outcome.as_str()])
            .get() as u64
    }

    pub fn truncated_reports(&self) -> u64 {
        self.error_reports_truncated_total.get() as u64
    }

    pub fn segments(&self, result: &str) -> u64 {
        self.segments_total.with_label_values(&[result]).get() as u64
    }

    /// Get the Prometheus registry
    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }

    /// Gather all metrics in Prometheus format
    pub fn gather(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.registry.gather()
    }

    /// Encode metrics as text
    pub fn encode_text(&self) -> Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| RuntimeError::Metrics(prometheus::Error::Msg(e.to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_invocations() {
        let metrics = RuntimeMetrics::new().unwrap();
        metrics.record_invocation(InvocationOutcome::Success, 0.02);
        metrics.record_invocation(InvocationOutcome::Success, 0.03);
        metrics.record_invocation(InvocationOutcome::Timeout, 3.0);

        assert_eq!(metrics.invocations(InvocationOutcome::Success), 2);
        assert_eq!(metrics.invocations(InvocationOutcome::Timeout), 1);
        assert_eq!(metrics.invocations(InvocationOutcome::Error), 0);
    }

    #[test]
    fn test_record_segments() {
        let metrics = RuntimeMetrics::new().unwrap();
        metrics.record_segment(Some(&EmitOutcome::Sent(120)));
        metrics.record_segment(Some(&EmitOutcome::Dropped("closed".to_string())));
        metrics.record_segment(None);

        assert_eq!(metrics.segments("sent"), 1);
        assert_eq!(metrics.segments("dropped"), 1);
        assert_eq!(metrics.segments("pending"), 1);
    }

    #[test]
    fn test_encode_text() {
        let metrics = RuntimeMetrics::new().unwrap();
        metrics.record_truncated_report();
        metrics.record_invocation(InvocationOutcome::Error, 0.5);

        let text = metrics.encode_text().unwrap();
        assert!(text.contains("function_runtime_error_reports_truncated_total 1"));
        assert!(text.contains("function_runtime_invocations_total{outcome=\"error\"} 1"));
    }
}
