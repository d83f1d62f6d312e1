//! Function runtime entry point
//!
//! Runs an echo handler against the host's runtime API with tracing enabled.

use clap::Parser;
use function_runtime::config::{
    FUNCTION_NAME_ENV, FUNCTION_VERSION_ENV, INVOCATION_TIMEOUT_ENV, LOG_GROUP_ENV,
    LOG_STREAM_ENV, MAX_ERROR_PAYLOAD_ENV, MEMORY_SIZE_ENV, RUNTIME_API_ENV,
};
use function_runtime::{handler_fn, logging, InvocationContext, Runtime, RuntimeConfig};
use std::time::Duration;
use trace_recorder::context::CONTEXT_MISSING_ENV;
use trace_recorder::emitter::DAEMON_ADDRESS_ENV;
use trace_recorder::{
    config::{SAMPLING_RATE_ENV, STREAMING_THRESHOLD_ENV, TRACING_NAME_ENV},
    ContextMissingStrategy, Recorder, RecorderConfig, TracedError,
};

#[derive(Parser)]
#[command(name = "bootstrap")]
#[command(about = "Serverless function runtime with built-in tracing")]
#[command(version)]
struct Cli {
    /// Runtime API address (host:port)
    #[arg(long, env = RUNTIME_API_ENV)]
    runtime_api: String,

    /// Function name
    #[arg(long, env = FUNCTION_NAME_ENV, default_value = "")]
    function_name: String,

    /// Function version
    #[arg(long, env = FUNCTION_VERSION_ENV, default_value = "$LATEST")]
    function_version: String,

    /// Memory budget in MB
    #[arg(long, env = MEMORY_SIZE_ENV)]
    memory_size: Option<u32>,

    #[arg(long, env = LOG_GROUP_ENV, default_value = "")]
    log_group: String,

    #[arg(long, env = LOG_STREAM_ENV, default_value = "")]
    log_stream: String,

    /// Hard ceiling per invocation, in seconds
    #[arg(long, env = INVOCATION_TIMEOUT_ENV, default_value = "43200")]
    invocation_timeout: u64,

    /// Error documents above this size are replaced by a stub
    #[arg(long, env = MAX_ERROR_PAYLOAD_ENV, default_value = "262144")]
    max_error_payload: usize,

    /// Trace daemon address; the environment value always wins
    #[arg(long, env = DAEMON_ADDRESS_ENV)]
    daemon_address: Option<String>,

    /// LOG_ERROR or RUNTIME_ERROR
    #[arg(long, env = CONTEXT_MISSING_ENV, default_value = "LOG_ERROR")]
    context_missing: String,

    /// Overrides the segment name
    #[arg(long, env = TRACING_NAME_ENV)]
    tracing_name: Option<String>,

    /// Undecided traces sampled per second
    #[arg(long, env = SAMPLING_RATE_ENV, default_value = "1")]
    sampling_rate: u64,

    /// Unstreamed subsegments that trigger streaming
    #[arg(long, env = STREAMING_THRESHOLD_ENV, default_value = "100")]
    streaming_threshold: usize,
}

impl Cli {
    fn runtime_config(&self) -> function_runtime::Result<RuntimeConfig> {
        let mut builder = RuntimeConfig::builder()
            .runtime_api(&self.runtime_api)
            .function_name(&self.function_name)
            .function_version(&self.function_version)
            .log_group(&self.log_group)
            .log_stream(&self.log_stream)
            .invocation_timeout(Duration::from_secs(self.invocation_timeout))
            .max_error_payload(self.max_error_payload);
        if let Some(memory) = self.memory_size {
            builder = builder.memory_size_mb(memory);
        }
        builder.build()
    }

    fn recorder_config(&self) -> RecorderConfig {
        let mut builder = RecorderConfig::builder()
            .context_missing(ContextMissingStrategy::parse(&self.context_missing).unwrap_or_default())
            .traces_per_second(self.sampling_rate)
            .streaming_threshold(self.streaming_threshold);
        if let Some(address) = &self.daemon_address {
            builder = builder.daemon_address(address);
        }
        if let Some(name) = &self.tracing_name {
            builder = builder.tracing_name(name);
        }
        builder.build()
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let cli = Cli::parse();
    let config = cli.runtime_config()?;
    let recorder = Recorder::from_config(cli.recorder_config()).await;

    tracing::info!(
        runtime_api = %config.runtime_api,
        function_name = %config.function.function_name,
        "Starting function runtime"
    );

    let runtime = Runtime::run_with_init(config, recorder, || async {
        Ok::<_, TracedError>(handler_fn(
            |event: serde_json::Value, context: InvocationContext| async move {
                tracing::info!(remaining_ms = context.remaining_time().as_millis() as u64, "Echoing event");
                Ok::<_, TracedError>(event)
            },
        ))
    })
    .await?;

    runtime.run().await?;
    Ok(())
}
