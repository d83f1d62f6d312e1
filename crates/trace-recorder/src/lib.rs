//! Distributed tracing client for short-lived function invocations.
//!
//! Records segments and subsegments for each invocation and ships them to a
//! local trace daemon as UDP datagrams.
//!
//! # Entity Model
//!
//! ```text
//! Segment (one per invocation, or a facade owned by the host)
//!   └─ Subsegment (one per traced unit of work)
//!       └─ Subsegment ...
//! ```
//!
//! Every entity of a trace lives in one [`TraceArena`]. An entity is
//! emittable once it has ended and every subsegment below it has ended.
//! Large traces are streamed early, one finished subtree at a time.
//!
//! # Usage
//!
//! 1. Build a [`Recorder`] once with [`Recorder::from_config`].
//! 2. Per invocation, open a segment with [`Recorder::begin_segment`] and run
//!    the handler inside [`TraceContext::scope`].
//! 3. Wrap work in [`Recorder::trace_async`]; propagate
//!    [`Recorder::current_trace_header`] on outbound calls.
//! 4. Close the segment with [`Recorder::end_segment`].

pub mod config;
pub mod context;
pub mod emitter;
pub mod entity;
pub mod error;
pub mod exception;
pub mod header;
pub mod recorder;
pub mod sampling;
pub mod streaming;

pub use config::{RecorderConfig, RecorderConfigBuilder};
pub use context::{current_entity, spawn, ContextMissingStrategy, TraceContext};
pub use emitter::{DaemonConfig, EmitOutcome, Emitter, MemoryEmitter, UdpEmitter};
pub use entity::{AnnotationValue, Entity, EntityDocument, EntityKind, TraceArena};
pub use error::{Result, TraceError};
pub use exception::{
    Cause, ErrorOrigin, ExceptionDescriber, ExceptionDescriptor, StackFrame, TracedError,
};
pub use header::{SampleDecision, TraceHeader, TraceId, TRACE_ENV_VAR, TRACE_HEADER_NAME};
pub use recorder::{Recorder, RecorderBuilder};
pub use sampling::{FixedSampler, LocalSampler, SamplingStrategy};
pub use streaming::StreamingStrategy;
