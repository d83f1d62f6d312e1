//! Runtime configuration
//!
//! Read once at startup from the variables the host sets for the function
//! process.

use std::time::Duration;

use crate::error::{Result, RuntimeError, DEFAULT_MAX_ERROR_PAYLOAD};

pub const RUNTIME_API_ENV: &str = "AWS_LAMBDA_RUNTIME_API";
pub const FUNCTION_NAME_ENV: &str = "AWS_LAMBDA_FUNCTION_NAME";
pub const FUNCTION_VERSION_ENV: &str = "AWS_LAMBDA_FUNCTION_VERSION";
pub const LOG_GROUP_ENV: &str = "AWS_LAMBDA_LOG_GROUP_NAME";
pub const LOG_STREAM_ENV: &str = "AWS_LAMBDA_LOG_STREAM_NAME";
pub const MEMORY_SIZE_ENV: &str = "AWS_LAMBDA_FUNCTION_MEMORY_SIZE";
pub const INVOCATION_TIMEOUT_ENV: &str = "FUNCTION_RUNTIME_INVOCATION_TIMEOUT_SECS";
pub const MAX_ERROR_PAYLOAD_ENV: &str = "FUNCTION_RUNTIME_MAX_ERROR_PAYLOAD";

/// Hard ceiling on a single invocation
pub const DEFAULT_INVOCATION_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Static facts about the function, shared by every invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FunctionConfig {
    pub function_name: String,
    pub function_version: String,
    /// Memory budget in MB
    pub memory_size_mb: Option<u32>,
    pub log_group: String,
    pub log_stream: String,
}

impl FunctionConfig {
    pub fn from_env() -> Self {
        Self {
            function_name: std::env::var(FUNCTION_NAME_ENV).unwrap_or_default(),
            function_version: std::env::var(FUNCTION_VERSION_ENV)
                .unwrap_or_else(|_| "$LATEST".to_string()),
            memory_size_mb: std::env::var(MEMORY_SIZE_ENV)
                .ok()
                .and_then(|v| v.parse().ok()),
            log_group: std::env::var(LOG_GROUP_ENV).unwrap_or_default(),
            log_stream: std::env::var(LOG_STREAM_ENV).unwrap_or_default(),
        }
    }
}

/// Runtime configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Control plane `host:port`, or a full `http://` base URL
    pub runtime_api: String,

    pub function: FunctionConfig,

    /// Invocations still running after this are abandoned
    pub invocation_timeout: Duration,

    /// Error documents larger than this are replaced by a stub
    pub max_error_payload: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            runtime_api: "127.0.0.1:9001".to_string(),
            function: FunctionConfig::default(),
            invocation_timeout: DEFAULT_INVOCATION_TIMEOUT,
            max_error_payload: DEFAULT_MAX_ERROR_PAYLOAD,
        }
    }
}

impl RuntimeConfig {
    /// Create a new config builder
    pub fn builder() -> RuntimeConfigBuilder {
        RuntimeConfigBuilder::new()
    }

    /// Create config from environment variables.
    ///
    /// Fails only when the control plane address is missing.
    pub fn from_env() -> Result<Self> {
        let runtime_api = std::env::var(RUNTIME_API_ENV)
            .map_err(|_| RuntimeError::Config(format!("{} is not set", RUNTIME_API_ENV)))?;

        Ok(Self {
            runtime_api,
            function: FunctionConfig::from_env(),
            invocation_timeout: std::env::var(INVOCATION_TIMEOUT_ENV)
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_INVOCATION_TIMEOUT),
            max_error_payload: std::env::var(MAX_ERROR_PAYLOAD_ENV)
                .map(|v| v.parse().unwrap_or(DEFAULT_MAX_ERROR_PAYLOAD))
                .unwrap_or(DEFAULT_MAX_ERROR_PAYLOAD),
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.runtime_api.trim().is_empty() {
            return Err(RuntimeError::Config("runtime API address is empty".to_string()));
        }
        if self.invocation_timeout.is_zero() {
            return Err(RuntimeError::Config("invocation timeout must be positive".to_string()));
        }
        Ok(())
    }
}

/// Builder for RuntimeConfig
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: RuntimeConfig::default(),
        }
    }

    pub fn runtime_api(mut self, address: impl Into<String>) -> Self {
        self.config.runtime_api = address.into();
        self
    }

    pub fn function_name(mut self, name: impl Into<String>) -> Self {
        self.config.function.function_name = name.into();
        self
    }

    pub fn function_version(mut self, version: impl Into<String>) -> Self {
        self.config.function.function_version = version.into();
        self
    }

    pub fn memory_size_mb(mut self, memory: u32) -> Self {
        self.config.function.memory_size_mb = Some(memory);
        self
    }

    pub fn log_group(mut self, group: impl Into<String>) -> Self {
        self.config.function.log_group = group.into();
        self
    }

    pub fn log_stream(mut self, stream: impl Into<String>) -> Self {
        self.config.function.log_stream = stream.into();
        self
    }

    pub fn invocation_timeout(mut self, timeout: Duration) -> Self {
        self.config.invocation_timeout = timeout;
        self
    }

    pub fn max_error_payload(mut self, bytes: usize) -> Self {
        self.config.max_error_payload = bytes;
        self
    }

    pub fn build(self) -> Result<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for RuntimeConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
