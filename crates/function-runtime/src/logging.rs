//! Log subscriber setup
//!
//! JSON lines on stdout. The level comes from `AWS_LAMBDA_LOG_LEVEL`, then
//! `RUST_LOG`, then `info`.

use tracing_subscriber::EnvFilter;

pub const LOG_LEVEL_ENV: &str = "AWS_LAMBDA_LOG_LEVEL";

const DEFAULT_DIRECTIVE: &str = "info";

/// Pick the filter directive from the host log level and `RUST_LOG`
pub fn filter_directive(log_level: Option<&str>, rust_log: Option<&str>) -> String {
    if let Some(level) = log_level.map(|l| l.trim().to_ascii_lowercase()) {
        let mapped = match level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => Some(level.clone()),
            "fatal" => Some("error".to_string()),
            _ => None,
        };
        if let Some(directive) = mapped {
            return directive;
        }
    }

    rust_log
        .map(str::trim)
        .filter(|directive| !directive.is_empty())
        .unwrap_or(DEFAULT_DIRECTIVE)
        .to_string()
}

/// Install the global subscriber. Returns false when one is already set.
pub fn init() -> bool {
    let log_level = std::env::var(LOG_LEVEL_ENV).ok();
    let rust_log = std::env::var("RUST_LOG").ok();
    let directive = filter_directive(log_level.as_deref(), rust_log.as_deref());

    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .with_current_span(true)
        .try_init()
        .is_ok()
}
