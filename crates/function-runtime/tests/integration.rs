//! Integration tests for the function runtime
//!
//! A wiremock server plays the control plane; traces go to an in-memory
//! emitter. Covers:
//! - Successful invocations with segment emission
//! - Handler errors and the error document
//! - Timeouts
//! - Sampling echo and initialization failures

use function_runtime::client::{FUNCTION_ERROR_TYPE_HEADER, XRAY_ERROR_CAUSE_HEADER};
use function_runtime::context::{DEADLINE_HEADER, REQUEST_ID_HEADER, TRACE_ID_HEADER};
use function_runtime::error::PAYLOAD_TOO_LARGE_STUB;
use function_runtime::runtime::TIMEOUT_ERROR;
use function_runtime::{
    handler_fn, Handler, InvocationContext, InvocationOutcome, Runtime, RuntimeConfig,
    RuntimeError,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use trace_recorder::exception::BoxError;
use trace_recorder::{FixedSampler, MemoryEmitter, Recorder, TracedError};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, Request, ResponseTemplate};

const NEXT_PATH: &str = "/2018-06-01/runtime/invocation/next";

/// Helper to create a recorder that samples everything into memory
fn recorder() -> (Recorder, Arc<MemoryEmitter>) {
    let emitter = Arc::new(MemoryEmitter::new());
    let recorder = Recorder::builder(emitter.clone())
        .sampler(Arc::new(FixedSampler(true)))
        .build();
    (recorder, emitter)
}

fn config(server: &MockServer) -> RuntimeConfig {
    RuntimeConfig::builder()
        .runtime_api(server.uri())
        .function_name("orders")
        .build()
        .unwrap()
}

/// Handler for tests where initialization fails first
struct NeverBuilt;

#[async_trait::async_trait]
impl Handler for NeverBuilt {
    async fn call(&self, event: Vec<u8>, _context: InvocationContext) -> Result<Vec<u8>, BoxError> {
        Ok(event)
    }
}

async fn mount_next(server: &MockServer, request_id: &str, body: &str, trace: Option<&str>) {
    let deadline = chrono::Utc::now().timestamp_millis() + 60_000;
    let mut response = ResponseTemplate::new(200)
        .set_body_string(body)
        .insert_header(REQUEST_ID_HEADER, request_id)
        .insert_header(DEADLINE_HEADER, deadline.to_string().as_str());
    if let Some(trace) = trace {
        response = response.insert_header(TRACE_ID_HEADER, trace);
    }
    Mock::given(method("GET"))
        .and(path(NEXT_PATH))
        .respond_with(response)
        .up_to_n_times(1)
        .mount(server)
        .await;
}

async fn requests_to(server: &MockServer, suffix: &str) -> Vec<Request> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .into_iter()
        .filter(|request| request.url.path().ends_with(suffix))
        .collect()
}

#[tokio::test]
async fn test_successful_invocation_emits_segment_once() {
    let server = MockServer::start().await;
    mount_next(&server, "req-1", r#"{"order":42}"#, None).await;
    Mock::given(method("POST"))
        .and(path("/2018-06-01/runtime/invocation/req-1/response"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (recorder, emitter) = recorder();
    let tracer = recorder.clone();
    let handler = handler_fn(move |event: Value, _ctx: InvocationContext| {
        let tracer = tracer.clone();
        async move {
            tracer
                .trace_async("validate", async { Ok::<_, TracedError>(()) })
                .await?;
            Ok::<_, TracedError>(json!({ "accepted": event["order"] }))
        }
    });
    let runtime = Runtime::new(config(&server), recorder, handler).unwrap();

    let outcome = runtime.run_once().await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Success);

    let responses = requests_to(&server, "/response").await;
    let body: Value = serde_json::from_slice(&responses[0].body).unwrap();
    assert_eq!(body, json!({ "accepted": 42 }));

    assert_eq!(emitter.len(), 1);
    let segment = &emitter.documents()[0];
    assert_eq!(segment.name, "orders");
    assert_eq!(segment.subsegments.len(), 1);
    assert_eq!(segment.subsegments[0].name, "validate");
    assert_eq!(segment.aws["request_id"], "req-1");
    assert_eq!(runtime.metrics().invocations(InvocationOutcome::Success), 1);
    assert_eq!(runtime.metrics().segments("sent"), 1);
}

#[tokio::test]
async fn test_rate_limiter_admits_first_trace_of_the_second() {
    let server = MockServer::start().await;
    mount_next(&server, "req-a", "{}", None).await;
    mount_next(&server, "req-b", "{}", None).await;
    for id in ["req-a", "req-b"] {
        Mock::given(method("POST"))
            .and(path(format!("/2018-06-01/runtime/invocation/{id}/response")))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;
    }

    // default sampler: one undecided trace per second
    let emitter = Arc::new(MemoryEmitter::new());
    let recorder = Recorder::builder(emitter.clone()).build();
    let handler = handler_fn(|event: Value, _ctx: InvocationContext| async move {
        Ok::<_, TracedError>(event)
    });
    let runtime = Runtime::new(config(&server), recorder, handler).unwrap();

    // keep both invocations inside one wall-clock second
    let into_second = chrono::Utc::now().timestamp_subsec_millis();
    if into_second > 500 {
        tokio::time::sleep(Duration::from_millis(u64::from(1_010 - into_second))).await;
    }

    assert_eq!(runtime.run_once().await.unwrap(), InvocationOutcome::Success);
    assert_eq!(runtime.run_once().await.unwrap(), InvocationOutcome::Success);

    assert_eq!(emitter.len(), 1);
    assert_eq!(emitter.documents()[0].aws["request_id"], "req-a");
    assert_eq!(runtime.metrics().segments("sent"), 1);
    assert_eq!(runtime.metrics().segments("not_sampled"), 1);
    assert_eq!(requests_to(&server, "/response").await.len(), 2);
}

#[tokio::test]
async fn test_handler_error_is_reported() {
    let server = MockServer::start().await;
    mount_next(&server, "req-2", "{}", None).await;
    Mock::given(method("POST"))
        .and(path("/2018-06-01/runtime/invocation/req-2/error"))
        .and(header(FUNCTION_ERROR_TYPE_HEADER, "OrderRejected"))
        .and(header_exists(XRAY_ERROR_CAUSE_HEADER))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (recorder, emitter) = recorder();
    let handler = handler_fn(|_event: Value, _ctx: InvocationContext| async move {
        Err::<Value, _>(
            TracedError::new("OrderRejected", "credit limit reached")
                .caused_by(TracedError::remote("LimitService", "limit exceeded")),
        )
    });
    let runtime = Runtime::new(config(&server), recorder, handler).unwrap();

    let outcome = runtime.run_once().await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Error);

    let errors = requests_to(&server, "/error").await;
    let report: Value = serde_json::from_slice(&errors[0].body).unwrap();
    assert_eq!(report["errorType"], "OrderRejected");
    assert_eq!(report["errorMessage"], "credit limit reached");
    assert_eq!(report["cause"]["errorType"], "LimitService");

    let segment = &emitter.documents()[0];
    assert!(segment.fault);
    let cause = segment.cause.as_ref().unwrap();
    assert_eq!(cause.exceptions.len(), 2);
    assert!(cause.exceptions[1].remote);
}

#[tokio::test]
async fn test_oversized_error_sends_stub() {
    let server = MockServer::start().await;
    // unsampled, so no trace cause header rides along with the report
    let trace = "Root=1-5759e988-bd862e3fe1be46a994272793;Sampled=0";
    mount_next(&server, "req-3", "{}", Some(trace)).await;
    Mock::given(method("POST"))
        .and(path("/2018-06-01/runtime/invocation/req-3/error"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (recorder, _emitter) = recorder();
    let handler = handler_fn(|_event: Value, _ctx: InvocationContext| async move {
        Err::<Value, _>(TracedError::new("Huge", "x".repeat(300 * 1024)))
    });
    let runtime = Runtime::new(config(&server), recorder, handler).unwrap();
    runtime.run_once().await.unwrap();

    let errors = requests_to(&server, "/error").await;
    assert_eq!(errors[0].body, PAYLOAD_TOO_LARGE_STUB.as_bytes());
    assert_eq!(runtime.metrics().truncated_reports(), 1);
}

#[tokio::test]
async fn test_timeout_is_reported_without_function_error_header() {
    let server = MockServer::start().await;
    mount_next(&server, "req-4", "{}", None).await;
    Mock::given(method("POST"))
        .and(path("/2018-06-01/runtime/invocation/req-4/error"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (recorder, emitter) = recorder();
    let tracer = recorder.clone();
    let handler = handler_fn(move |_event: Value, _ctx: InvocationContext| {
        let tracer = tracer.clone();
        async move {
            tracer
                .trace_async("slow-call", async {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok::<_, TracedError>(())
                })
                .await?;
            Ok::<_, TracedError>(Value::Null)
        }
    });
    let config = RuntimeConfig::builder()
        .runtime_api(server.uri())
        .invocation_timeout(Duration::from_millis(50))
        .build()
        .unwrap();
    let runtime = Runtime::new(config, recorder, handler).unwrap();

    let outcome = runtime.run_once().await.unwrap();
    assert_eq!(outcome, InvocationOutcome::Timeout);

    let errors = requests_to(&server, "/error").await;
    assert!(errors[0].headers.get(FUNCTION_ERROR_TYPE_HEADER).is_none());
    let report: Value = serde_json::from_slice(&errors[0].body).unwrap();
    assert_eq!(report["errorType"], TIMEOUT_ERROR);

    // the abandoned subsegment was still closed and shipped with the segment
    let segment = &emitter.documents()[0];
    assert_eq!(segment.subsegments.len(), 1);
    assert!(segment.subsegments[0].end_time.is_some());
}

#[tokio::test]
async fn test_requested_sampling_is_echoed() {
    let server = MockServer::start().await;
    let trace = "Root=1-5759e988-bd862e3fe1be46a994272793;Parent=53995c3f42cd8ad8;Sampled=?";
    mount_next(&server, "req-5", "{}", Some(trace)).await;
    Mock::given(method("POST"))
        .and(path("/2018-06-01/runtime/invocation/req-5/response"))
        .and(header(
            "X-Amzn-Trace-Id",
            "Root=1-5759e988-bd862e3fe1be46a994272793;Sampled=1",
        ))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (recorder, emitter) = recorder();
    let handler = handler_fn(|event: Value, _ctx: InvocationContext| async move {
        Ok::<_, TracedError>(event)
    });
    let runtime = Runtime::new(config(&server), recorder, handler).unwrap();
    runtime.run_once().await.unwrap();

    let segment = &emitter.documents()[0];
    assert_eq!(segment.trace_id.as_deref(), Some("1-5759e988-bd862e3fe1be46a994272793"));
    assert_eq!(segment.parent_id.as_deref(), Some("53995c3f42cd8ad8"));
}

#[tokio::test]
async fn test_control_plane_failure_stops_loop() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(NEXT_PATH))
        .respond_with(ResponseTemplate::new(500).set_body_string("down"))
        .mount(&server)
        .await;

    let (recorder, _emitter) = recorder();
    let handler = handler_fn(|event: Value, _ctx: InvocationContext| async move {
        Ok::<_, TracedError>(event)
    });
    let runtime = Runtime::new(config(&server), recorder, handler).unwrap();

    let result = runtime.run().await;
    assert!(matches!(
        result,
        Err(RuntimeError::ControlPlane { status: 500, .. })
    ));
}

#[tokio::test]
async fn test_init_failure_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/2018-06-01/runtime/init/error"))
        .and(header(FUNCTION_ERROR_TYPE_HEADER, "MissingSecret"))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let (recorder, _emitter) = recorder();
    let result = Runtime::run_with_init(config(&server), recorder, || async {
        Err::<NeverBuilt, _>(TracedError::new("MissingSecret", "DB_PASSWORD is not set"))
    })
    .await;

    assert!(matches!(result, Err(RuntimeError::Init(_))));
}
