//! Recorder facade
//!
//! Ties sampling, the task context, streaming and emission together. One
//! recorder is created at startup and shared by every invocation.

use serde_json::Value;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;

use crate::config::RecorderConfig;
use crate::context::{ContextMissingStrategy, TraceContext};
use crate::emitter::{EmitOutcome, Emitter, UdpEmitter};
use crate::entity::{AnnotationValue, Entity, TraceArena};
use crate::error::{Result, TraceError};
use crate::exception::{ExceptionDescriber, ExceptionDescriptor};
use crate::header::{SampleDecision, TraceHeader, TraceId};
use crate::sampling::{LocalSampler, SamplingStrategy};
use crate::streaming::StreamingStrategy;

/// Namespace given to subsegments that wrap downstream calls
pub const REMOTE_NAMESPACE: &str = "remote";

struct RecorderInner {
    sampler: Arc<dyn SamplingStrategy>,
    emitter: Arc<dyn Emitter>,
    streaming: StreamingStrategy,
    context_missing: ContextMissingStrategy,
    describer: ExceptionDescriber,
    tracing_name: Option<String>,
}

/// Shared handle to the tracing subsystem
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<RecorderInner>,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("streaming", &self.inner.streaming)
            .field("context_missing", &self.inner.context_missing)
            .field("describer", &self.inner.describer)
            .finish()
    }
}

impl Recorder {
    /// Build a recorder that sends to the configured daemon over UDP
    pub async fn from_config(config: RecorderConfig) -> Self {
        let emitter = UdpEmitter::bind(&config.daemon()).await;
        Self::builder(Arc::new(emitter)).config(&config).build()
    }

    pub fn builder(emitter: Arc<dyn Emitter>) -> RecorderBuilder {
        RecorderBuilder::new(emitter)
    }

    pub fn emitter(&self) -> &Arc<dyn Emitter> {
        &self.inner.emitter
    }

    pub fn streaming(&self) -> StreamingStrategy {
        self.inner.streaming
    }

    pub fn describer(&self) -> ExceptionDescriber {
        self.inner.describer
    }

    pub fn context_missing(&self) -> ContextMissingStrategy {
        self.inner.context_missing
    }

    /// A fresh, empty context for one invocation
    pub fn new_context(&self, facade_name: impl Into<String>) -> TraceContext {
        TraceContext::new(facade_name, Arc::clone(&self.inner.sampler))
    }

    /// Describe an error chain with the configured frame limit
    pub fn describe<E>(&self, error: &E) -> Vec<ExceptionDescriptor>
    where
        E: StdError + 'static,
    {
        self.inner.describer.describe_typed(error)
    }

    /// Open the root segment of a trace.
    ///
    /// An upstream `Sampled=0|1` is honoured as is; otherwise the sampler
    /// decides.
    pub fn begin_segment(&self, name: &str, upstream: Option<&TraceHeader>) -> Entity {
        let name = self.inner.tracing_name.as_deref().unwrap_or(name);
        let (trace_id, parent, decision) = match upstream {
            Some(header) => (
                header.root.clone(),
                header.parent.clone(),
                self.inner.sampler.decide(header.sampled),
            ),
            None => (
                TraceId::new(),
                None,
                self.inner.sampler.decide(SampleDecision::Unknown),
            ),
        };
        let segment = TraceArena::new_segment(name, trace_id, parent, decision);
        tracing::debug!(
            trace_id = %segment.trace_id(),
            segment_id = %segment.id(),
            sampled = ?decision,
            "Began segment"
        );
        segment
    }

    /// End a segment and emit it if nothing below it is still open.
    ///
    /// When subsegments are still open the finished part of the tree is
    /// streamed instead and `None` is returned; the segment is then sent by
    /// [`Recorder::finish_subsegment`] once its last subsegment finishes.
    pub fn end_segment(&self, segment: &Entity) -> Option<EmitOutcome> {
        segment.end();
        segment.release();

        if segment.claim_root_send() {
            return Some(self.inner.emitter.send(segment));
        }

        tracing::debug!(
            segment_id = %segment.id(),
            references = segment.reference_count(),
            "Segment has open subsegments; streaming finished subtrees"
        );
        if self.inner.streaming.should_stream(segment) {
            self.inner.streaming.stream(segment, self.inner.emitter.as_ref());
        }
        None
    }

    /// Open a subsegment under the current entity and make it current.
    ///
    /// Returns `Ok(None)` when no context exists and the strategy is
    /// `LogError`.
    pub fn begin_subsegment(&self, name: impl Into<String>) -> Result<Option<Entity>> {
        let Some(context) = self.context_or_missing()? else {
            return Ok(None);
        };
        let parent = context.get();
        let child = parent.begin_subsegment(name);
        context.set(child.clone());
        Ok(Some(child))
    }

    /// End the current subsegment and restore its parent as current
    pub fn end_subsegment(&self) -> Result<()> {
        let Some(context) = self.context_or_missing()? else {
            return Ok(());
        };
        let entity = match context.require() {
            Ok(entity) => entity,
            Err(e) => return self.inner.context_missing.handle(e),
        };
        if entity.is_segment() {
            return self
                .inner
                .context_missing
                .handle(TraceError::invalid_entity("current entity is a segment, not a subsegment"));
        }

        self.finish_subsegment(&entity);
        if let Some(parent) = entity.parent() {
            context.set(parent);
        }
        Ok(())
    }

    /// End and release a subsegment, then flush what became flushable.
    ///
    /// When the root segment already ended and this was its last open
    /// subsegment, the whole segment is sent here.
    pub fn finish_subsegment(&self, subsegment: &Entity) {
        subsegment.end();
        subsegment.release();

        let root = subsegment.root();
        if root.is_facade() {
            // The host owns the facade; its subsegments go out as they finish.
            StreamingStrategy::new(0).stream(&root, self.inner.emitter.as_ref());
        } else if subsegment.claim_root_send() {
            let outcome = self.inner.emitter.send(&root);
            tracing::debug!(
                segment_id = %root.id(),
                outcome = ?outcome,
                "Sent segment after its last subsegment finished"
            );
        } else if self.inner.streaming.should_stream(&root) {
            self.inner.streaming.stream(&root, self.inner.emitter.as_ref());
        }
    }

    /// Run `future` inside a new subsegment named `name`.
    ///
    /// The subsegment is current only for `future` and the tasks it spawns
    /// through [`crate::context::spawn`]. An error result is attached as the
    /// subsegment's cause. The subsegment is finished even when `future` is
    /// dropped before completion.
    pub async fn trace_async<F, T, E>(&self, name: impl Into<String>, future: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: StdError + 'static,
    {
        self.traced(name.into(), None, future).await
    }

    /// Like [`Recorder::trace_async`] for a call to a downstream service;
    /// the subsegment is placed in the `remote` namespace.
    pub async fn trace_remote<F, T, E>(&self, name: impl Into<String>, future: F) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: StdError + 'static,
    {
        self.traced(name.into(), Some(REMOTE_NAMESPACE), future).await
    }

    async fn traced<F, T, E>(
        &self,
        name: String,
        namespace: Option<&str>,
        future: F,
    ) -> std::result::Result<T, E>
    where
        F: Future<Output = std::result::Result<T, E>>,
        E: StdError + 'static,
    {
        let context = match TraceContext::current() {
            Some(context) => context,
            None => {
                if let Err(e) = self.inner.context_missing.handle(TraceError::entity_not_available(
                    format!("cannot trace '{}' outside a trace context", name),
                )) {
                    tracing::debug!(error = %e, "Running untraced");
                }
                return future.await;
            }
        };

        let subsegment = context.get().begin_subsegment(name);
        if let Some(namespace) = namespace {
            subsegment.set_namespace(namespace);
        }
        let guard = SubsegmentGuard {
            recorder: self.clone(),
            subsegment: subsegment.clone(),
        };

        let result = context.fork().with_entity(subsegment.clone()).scope(future).await;
        if let Err(error) = &result {
            subsegment.add_exception(self.inner.describer.describe_typed(error));
        }
        drop(guard);
        result
    }

    /// Annotate the current entity
    pub fn add_annotation(&self, key: impl Into<String>, value: impl Into<AnnotationValue>) -> Result<()> {
        let Some(entity) = self.current_or_missing()? else {
            return Ok(());
        };
        if let Err(e) = entity.add_annotation(key, value) {
            tracing::warn!(error = %e, "Annotation ignored");
        }
        Ok(())
    }

    /// Attach metadata to the current entity
    pub fn add_metadata(&self, key: impl Into<String>, value: Value) -> Result<()> {
        if let Some(entity) = self.current_or_missing()? {
            entity.add_metadata(key, value);
        }
        Ok(())
    }

    /// Record an error on the current entity
    pub fn add_exception<E>(&self, error: &E) -> Result<()>
    where
        E: StdError + 'static,
    {
        if let Some(entity) = self.current_or_missing()? {
            entity.add_exception(self.describe(error));
        }
        Ok(())
    }

    /// Header to send on a downstream call made from the current task
    pub fn current_trace_header(&self) -> Option<TraceHeader> {
        TraceContext::current().map(|context| context.get().outbound_header())
    }

    fn context_or_missing(&self) -> Result<Option<TraceContext>> {
        match TraceContext::current() {
            Some(context) => Ok(Some(context)),
            None => {
                self.inner.context_missing.handle(TraceError::entity_not_available(
                    "task is not running in a trace context",
                ))?;
                Ok(None)
            }
        }
    }

    fn current_or_missing(&self) -> Result<Option<Entity>> {
        Ok(self.context_or_missing()?.map(|context| context.get()))
    }
}

/// Finishes a subsegment when dropped
struct SubsegmentGuard {
    recorder: Recorder,
    subsegment: Entity,
}

impl Drop for SubsegmentGuard {
    fn drop(&mut self) {
        self.recorder.finish_subsegment(&self.subsegment);
    }
}

/// Builder for Recorder
pub struct RecorderBuilder {
    emitter: Arc<dyn Emitter>,
    sampler: Arc<dyn SamplingStrategy>,
    streaming: StreamingStrategy,
    context_missing: ContextMissingStrategy,
    describer: ExceptionDescriber,
    tracing_name: Option<String>,
}

impl RecorderBuilder {
    pub fn new(emitter: Arc<dyn Emitter>) -> Self {
        Self {
            emitter,
            sampler: Arc::new(LocalSampler::default()),
            streaming: StreamingStrategy::default(),
            context_missing: ContextMissingStrategy::default(),
            describer: ExceptionDescriber::default(),
            tracing_name: None,
        }
    }

    /// Apply every setting from a config
    pub fn config(self, config: &RecorderConfig) -> Self {
        let mut builder = self
            .sampler(Arc::new(LocalSampler::new(config.traces_per_second)))
            .streaming_threshold(config.streaming_threshold)
            .context_missing(config.context_missing)
            .max_stack_frames(config.max_stack_frames);
        builder.tracing_name = config.tracing_name.clone();
        builder
    }

    pub fn sampler(mut self, sampler: Arc<dyn SamplingStrategy>) -> Self {
        self.sampler = sampler;
        self
    }

    pub fn streaming_threshold(mut self, threshold: usize) -> Self {
        self.streaming = StreamingStrategy::new(threshold);
        self
    }

    pub fn context_missing(mut self, strategy: ContextMissingStrategy) -> Self {
        self.context_missing = strategy;
        self
    }

    pub fn max_stack_frames(mut self, frames: usize) -> Self {
        self.describer = ExceptionDescriber::new(frames);
        self
    }

    pub fn tracing_name(mut self, name: impl Into<String>) -> Self {
        self.tracing_name = Some(name.into());
        self
    }

    pub fn build(self) -> Recorder {
        Recorder {
            inner: Arc::new(RecorderInner {
                sampler: self.sampler,
                emitter: self.emitter,
                streaming: self.streaming,
                context_missing: self.context_missing,
                describer: self.describer,
                tracing_name: self.tracing_name,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::MemoryEmitter;
    use crate::exception::TracedError;
    use crate::sampling::FixedSampler;

    fn recorder(emitter: Arc<MemoryEmitter>) -> Recorder {
        Recorder::builder(emitter)
            .sampler(Arc::new(FixedSampler(true)))
            .build()
    }

    #[test]
    fn test_upstream_decision_honoured() {
        let recorder = Recorder::builder(Arc::new(MemoryEmitter::new()))
            .sampler(Arc::new(FixedSampler(true)))
            .build();
        let header = TraceHeader::parse("Root=1-5f84c7c1-1234567890abcdef12345678;Sampled=0").unwrap();
        let segment = recorder.begin_segment("fn", Some(&header));

        assert_eq!(segment.sampled(), SampleDecision::NotSampled);
        assert_eq!(segment.trace_id(), &header.root);
    }

    #[test]
    fn test_tracing_name_overrides() {
        let recorder = Recorder::builder(Arc::new(MemoryEmitter::new()))
            .tracing_name("orders")
            .build();
        assert_eq!(recorder.begin_segment("fn", None).name(), "orders");
    }

    #[tokio::test]
    async fn test_segment_with_subsegment_emits_once() {
        let emitter = Arc::new(MemoryEmitter::new());
        let recorder = recorder(Arc::clone(&emitter));
        let segment = recorder.begin_segment("fn", None);
        let context = recorder.new_context("fn").with_entity(segment.clone());

        context
            .scope(async {
                recorder.begin_subsegment("work").unwrap();
                recorder.add_annotation("step", "one").unwrap();
                recorder.end_subsegment().unwrap();
            })
            .await;

        assert!(emitter.is_empty());
        let outcome = recorder.end_segment(&segment);
        assert!(matches!(outcome, Some(EmitOutcome::Sent(_))));
        assert_eq!(emitter.len(), 1);

        let document = &emitter.documents()[0];
        assert_eq!(document.subsegments.len(), 1);
        assert_eq!(document.subsegments[0].name, "work");
        assert!(document.subsegments[0].annotations.contains_key("step"));
    }

    #[tokio::test]
    async fn test_trace_async_records_error() {
        let emitter = Arc::new(MemoryEmitter::new());
        let recorder = recorder(Arc::clone(&emitter));
        let segment = recorder.begin_segment("fn", None);
        let context = recorder.new_context("fn").with_entity(segment.clone());

        let result: std::result::Result<(), TracedError> = context
            .clone()
            .scope(recorder.trace_remote("payments", async {
                Err(TracedError::remote("PaymentDeclined", "card declined"))
            }))
            .await;
        assert!(result.is_err());
        // the segment stays current after the traced call
        assert_eq!(context.try_get(), Some(segment.clone()));

        recorder.end_segment(&segment);
        let document = &emitter.documents()[0];
        let call = &document.subsegments[0];
        assert_eq!(call.namespace.as_deref(), Some(REMOTE_NAMESPACE));
        assert!(call.fault);
        assert!(call.cause.as_ref().unwrap().exceptions[0].remote);
    }

    #[tokio::test]
    async fn test_dropped_future_still_finishes_subsegment() {
        let emitter = Arc::new(MemoryEmitter::new());
        let recorder = recorder(Arc::clone(&emitter));
        let segment = recorder.begin_segment("fn", None);
        let context = recorder.new_context("fn").with_entity(segment.clone());

        let pending = recorder.trace_async("slow", async {
            std::future::pending::<std::result::Result<(), TracedError>>().await
        });
        let timed_out = tokio::time::timeout(
            std::time::Duration::from_millis(10),
            context.scope(pending),
        )
        .await;
        assert!(timed_out.is_err());

        assert_eq!(segment.reference_count(), 1);
        assert!(matches!(recorder.end_segment(&segment), Some(EmitOutcome::Sent(_))));
    }

    #[tokio::test]
    async fn test_segment_sent_when_background_subsegment_finishes_later() {
        let emitter = Arc::new(MemoryEmitter::new());
        let recorder = recorder(Arc::clone(&emitter));
        let segment = recorder.begin_segment("fn", None);
        let context = recorder.new_context("fn").with_entity(segment.clone());

        let tracer = recorder.clone();
        let background = context
            .scope(async move {
                crate::context::spawn(async move {
                    tracer
                        .trace_async("background", async {
                            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                            Ok::<_, TracedError>(())
                        })
                        .await
                })
            })
            .await;
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;

        assert!(recorder.end_segment(&segment).is_none());
        assert!(emitter.is_empty());

        background.await.unwrap().unwrap();

        assert_eq!(emitter.len(), 1);
        let document = &emitter.documents()[0];
        assert_eq!(document.name, "fn");
        assert_eq!(document.subsegments.len(), 1);
        assert_eq!(document.subsegments[0].name, "background");

        // a later end of the same segment does not send it again
        assert!(recorder.end_segment(&segment).is_none());
        assert_eq!(emitter.len(), 1);
    }

    #[tokio::test]
    async fn test_segment_sent_when_open_subsegment_is_ended_later() {
        let emitter = Arc::new(MemoryEmitter::new());
        let recorder = recorder(Arc::clone(&emitter));
        let segment = recorder.begin_segment("fn", None);
        let context = recorder.new_context("fn").with_entity(segment.clone());

        let tracer = recorder.clone();
        context
            .clone()
            .scope(async move { tracer.begin_subsegment("left-open").unwrap() })
            .await
            .unwrap();

        assert!(recorder.end_segment(&segment).is_none());
        assert!(emitter.is_empty());

        let tracer = recorder.clone();
        context
            .scope(async move { tracer.end_subsegment() })
            .await
            .unwrap();

        assert_eq!(emitter.len(), 1);
        assert_eq!(emitter.documents()[0].subsegments[0].name, "left-open");
    }

    #[test]
    fn test_missing_context_strategies() {
        let lenient = Recorder::builder(Arc::new(MemoryEmitter::new())).build();
        assert!(matches!(lenient.begin_subsegment("x"), Ok(None)));
        assert!(lenient.add_annotation("k", 1).is_ok());

        let strict = Recorder::builder(Arc::new(MemoryEmitter::new()))
            .context_missing(ContextMissingStrategy::RuntimeError)
            .build();
        assert!(matches!(
            strict.begin_subsegment("x"),
            Err(TraceError::EntityNotAvailable(_))
        ));
    }

    #[tokio::test]
    async fn test_facade_subsegments_are_emitted_when_finished() {
        let emitter = Arc::new(MemoryEmitter::new());
        let recorder = recorder(Arc::clone(&emitter));
        let context = recorder.new_context("facade");

        context
            .scope(async {
                recorder.begin_subsegment("work").unwrap();
                recorder.end_subsegment().unwrap();
            })
            .await;

        let documents = emitter.documents();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents[0].name, "work");
        assert_eq!(documents[0].kind.as_deref(), Some("subsegment"));
    }
}
