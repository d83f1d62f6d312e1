//! Recorder configuration
//!
//! Values come from the environment (see [`RecorderConfig::from_env`]) or
//! from the builder. The daemon address is special: an address set in the
//! environment always wins over one set in code.

use crate::context::ContextMissingStrategy;
use crate::emitter::DaemonConfig;
use crate::exception::DEFAULT_MAX_STACK_FRAMES;
use crate::sampling::DEFAULT_TRACES_PER_SECOND;
use crate::streaming::DEFAULT_STREAMING_THRESHOLD;

pub const TRACING_NAME_ENV: &str = "AWS_XRAY_TRACING_NAME";
pub const SAMPLING_RATE_ENV: &str = "AWS_XRAY_SAMPLING_RATE";
pub const STREAMING_THRESHOLD_ENV: &str = "AWS_XRAY_STREAMING_THRESHOLD";
pub const MAX_STACK_FRAMES_ENV: &str = "AWS_XRAY_MAX_STACK_FRAMES";

/// Recorder configuration
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    /// Daemon address requested by application code
    pub daemon_address: Option<String>,

    /// Behaviour when an entity is required but missing
    pub context_missing: ContextMissingStrategy,

    /// Overrides segment names when set
    pub tracing_name: Option<String>,

    /// Undecided traces admitted per second
    pub traces_per_second: u64,

    /// Unstreamed subsegments that trigger streaming
    pub streaming_threshold: usize,

    /// Frames kept per exception descriptor
    pub max_stack_frames: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            daemon_address: None,
            context_missing: ContextMissingStrategy::default(),
            tracing_name: None,
            traces_per_second: DEFAULT_TRACES_PER_SECOND,
            streaming_threshold: DEFAULT_STREAMING_THRESHOLD,
            max_stack_frames: DEFAULT_MAX_STACK_FRAMES,
        }
    }
}

impl RecorderConfig {
    /// Create a new config builder
    pub fn builder() -> RecorderConfigBuilder {
        RecorderConfigBuilder::new()
    }

    /// Create config from environment variables
    pub fn from_env() -> Self {
        Self {
            // the environment address is applied by `daemon()` with precedence
            daemon_address: None,
            context_missing: ContextMissingStrategy::from_env(),
            tracing_name: std::env::var(TRACING_NAME_ENV)
                .ok()
                .filter(|name| !name.trim().is_empty()),
            traces_per_second: std::env::var(SAMPLING_RATE_ENV)
                .map(|v| v.parse().unwrap_or(DEFAULT_TRACES_PER_SECOND))
                .unwrap_or(DEFAULT_TRACES_PER_SECOND),
            streaming_threshold: std::env::var(STREAMING_THRESHOLD_ENV)
                .map(|v| v.parse().unwrap_or(DEFAULT_STREAMING_THRESHOLD))
                .unwrap_or(DEFAULT_STREAMING_THRESHOLD),
            max_stack_frames: std::env::var(MAX_STACK_FRAMES_ENV)
                .map(|v| v.parse().unwrap_or(DEFAULT_MAX_STACK_FRAMES))
                .unwrap_or(DEFAULT_MAX_STACK_FRAMES),
        }
    }

    /// Daemon endpoint after applying environment precedence
    pub fn daemon(&self) -> DaemonConfig {
        DaemonConfig::resolve(self.daemon_address.as_deref())
    }
}

/// Builder for RecorderConfig
pub struct RecorderConfigBuilder {
    config: RecorderConfig,
}

impl RecorderConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RecorderConfig::default(),
        }
    }

    /// Start from environment values
    pub fn from_env() -> Self {
        Self {
            config: RecorderConfig::from_env(),
        }
    }

    pub fn daemon_address(mut self, address: impl Into<String>) -> Self {
        self.config.daemon_address = Some(address.into());
        self
    }

    pub fn context_missing(mut self, strategy: ContextMissingStrategy) -> Self {
        self.config.context_missing = strategy;
        self
    }

    pub fn tracing_name(mut self, name: impl Into<String>) -> Self {
        self.config.tracing_name = Some(name.into());
        self
    }

    pub fn traces_per_second(mut self, rate: u64) -> Self {
        self.config.traces_per_second = rate;
        self
    }

    pub fn streaming_threshold(mut self, threshold: usize) -> Self {
        self.config.streaming_threshold = threshold;
        self
    }

    pub fn max_stack_frames(mut self, frames: usize) -> Self {
        self.config.max_stack_frames = frames;
        self
    }

    pub fn build(self) -> RecorderConfig {
        self.config
    }
}

impl Default for RecorderConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
