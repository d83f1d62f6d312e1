//! Serverless function runtime with built-in tracing.
//!
//! Pulls invocations from the host's runtime API, runs a [`Handler`] for each
//! one under a hard timeout and reports the result. Every invocation is
//! recorded as a trace segment and flushed to the local trace daemon once the
//! outcome has been reported.
//!
//! # Usage
//!
//! ```rust,no_run
//! use function_runtime::{handler_fn, InvocationContext, Runtime, RuntimeConfig};
//! use trace_recorder::{Recorder, RecorderConfig, TracedError};
//!
//! # async fn run() -> function_runtime::Result<()> {
//! let recorder = Recorder::from_config(RecorderConfig::from_env()).await;
//! let handler = handler_fn(|event: serde_json::Value, _ctx: InvocationContext| async move {
//!     Ok::<_, TracedError>(event)
//! });
//! Runtime::new(RuntimeConfig::from_env()?, recorder, handler)?.run().await
//! # }
//! ```

pub mod client;
pub mod config;
pub mod context;
pub mod error;
pub mod handler;
pub mod logging;
pub mod metrics;
pub mod runtime;

pub use client::{ControlPlaneClient, ErrorPost, Invocation};
pub use config::{FunctionConfig, RuntimeConfig, RuntimeConfigBuilder};
pub use context::InvocationContext;
pub use error::{ErrorReport, Result, RuntimeError};
pub use handler::{handler_fn, Handler, HandlerFn};
pub use metrics::{InvocationOutcome, RuntimeMetrics};
pub use runtime::Runtime;
