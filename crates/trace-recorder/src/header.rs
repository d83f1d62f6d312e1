//! Trace identifiers and the propagation header
//!
//! The header travels as `Root=<trace id>;Parent=<entity id>;Sampled=<0|1|?>`.
//! Any field may be missing. A header without a usable `Root` is treated as
//! absent: the receiver starts a new trace with an undecided sampling state.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{Result, TraceError};

/// HTTP header carrying the trace header on inbound and outbound calls
pub const TRACE_HEADER_NAME: &str = "X-Amzn-Trace-Id";

/// Environment slot the runtime fills with the current invocation's header
pub const TRACE_ENV_VAR: &str = "_X_AMZN_TRACE_ID";

const TRACE_ID_VERSION: &str = "1";
const TRACE_ID_EPOCH_LEN: usize = 8;
const TRACE_ID_RANDOM_LEN: usize = 24;
const ENTITY_ID_LEN: usize = 16;

/// Generate a new 16 hex character entity id
pub fn new_entity_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(ENTITY_ID_LEN);
    id
}

/// Check that a value looks like an entity id
pub fn is_valid_entity_id(value: &str) -> bool {
    value.len() == ENTITY_ID_LEN && is_hex(value)
}

fn is_hex(value: &str) -> bool {
    value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Sampling state of a trace
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleDecision {
    Sampled,
    NotSampled,
    /// Upstream asked the receiver to decide and report the decision back
    Requested,
    Unknown,
}

impl FromStr for SampleDecision {
    type Err = TraceError;

    /// Parse the `Sampled=` field value
    fn from_str(value: &str) -> Result<Self> {
        match value {
            "1" => Ok(SampleDecision::Sampled),
            "0" => Ok(SampleDecision::NotSampled),
            "?" => Ok(SampleDecision::Requested),
            other => Err(TraceError::InvalidSamplingDecision(format!(
                "unrecognized Sampled value '{}'",
                other
            ))),
        }
    }
}

impl SampleDecision {
    /// Header representation, `None` for `Unknown`
    pub fn as_header_value(&self) -> Option<&'static str> {
        match self {
            SampleDecision::Sampled => Some("1"),
            SampleDecision::NotSampled => Some("0"),
            SampleDecision::Requested => Some("?"),
            SampleDecision::Unknown => None,
        }
    }

    /// Whether the decision is final (upstream made it, never re-evaluated)
    pub fn is_decided(&self) -> bool {
        matches!(self, SampleDecision::Sampled | SampleDecision::NotSampled)
    }

    pub fn is_sampled(&self) -> bool {
        matches!(self, SampleDecision::Sampled)
    }
}

impl From<bool> for SampleDecision {
    fn from(sampled: bool) -> Self {
        if sampled {
            SampleDecision::Sampled
        } else {
            SampleDecision::NotSampled
        }
    }
}

/// Trace id in the `1-xxxxxxxx-xxxxxxxxxxxxxxxxxxxxxxxx` format
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TraceId(String);

impl TraceId {
    /// Create a fresh trace id stamped with the current epoch second
    pub fn new() -> Self {
        let epoch = Utc::now().timestamp().max(0) as u64;
        let mut random = Uuid::new_v4().simple().to_string();
        random.truncate(TRACE_ID_RANDOM_LEN);
        TraceId(format!("{}-{:08x}-{}", TRACE_ID_VERSION, epoch, random))
    }

    /// Parse and validate a trace id
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split('-');
        let version = parts.next()?;
        let epoch = parts.next()?;
        let random = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        let valid = version == TRACE_ID_VERSION
            && epoch.len() == TRACE_ID_EPOCH_LEN
            && random.len() == TRACE_ID_RANDOM_LEN
            && is_hex(epoch)
            && is_hex(random);
        valid.then(|| TraceId(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TraceId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Parsed trace propagation header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceHeader {
    pub root: TraceId,
    pub parent: Option<String>,
    pub sampled: SampleDecision,
}

impl TraceHeader {
    /// Header for a brand new trace with an undecided sampling state
    pub fn new_trace() -> Self {
        Self {
            root: TraceId::new(),
            parent: None,
            sampled: SampleDecision::Unknown,
        }
    }

    /// Parse a header value. Returns `None` for garbled input.
    pub fn parse(value: &str) -> Option<Self> {
        let mut root = None;
        let mut parent = None;
        let mut sampled = SampleDecision::Unknown;

        for part in value.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            let (key, val) = part.split_once('=')?;
            match key.trim() {
                "Root" => root = Some(TraceId::parse(val.trim())?),
                "Parent" => {
                    let val = val.trim();
                    if !is_valid_entity_id(val) {
                        return None;
                    }
                    parent = Some(val.to_string());
                }
                "Sampled" => {
                    sampled = val.trim().parse().unwrap_or_else(|e: TraceError| {
                        tracing::debug!(error = %e, "Leaving sampling undecided");
                        SampleDecision::Unknown
                    })
                }
                // Self=, Lineage= and vendor keys are not ours to interpret
                _ => {}
            }
        }

        Some(Self {
            root: root?,
            parent,
            sampled,
        })
    }

    /// Parse an optional header, falling back to a new undecided trace
    pub fn parse_or_new(value: Option<&str>) -> Self {
        value.and_then(Self::parse).unwrap_or_else(Self::new_trace)
    }

    /// Read the header the runtime placed into the process environment
    pub fn from_env() -> Option<Self> {
        std::env::var(TRACE_ENV_VAR)
            .ok()
            .and_then(|value| Self::parse(&value))
    }

    /// Header for a downstream call made while `parent_id` is current
    pub fn for_entity(root: &TraceId, parent_id: &str, sampled: SampleDecision) -> Self {
        Self {
            root: root.clone(),
            parent: Some(parent_id.to_string()),
            sampled,
        }
    }

    /// Header to echo on the invocation's response when upstream requested
    /// a sampling decision
    pub fn response_echo(&self, resolved: SampleDecision) -> Option<String> {
        if self.sampled != SampleDecision::Requested {
            return None;
        }
        let echo = TraceHeader {
            root: self.root.clone(),
            parent: None,
            sampled: resolved,
        };
        Some(echo.to_string())
    }
}

impl fmt::Display for TraceHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Root={}", self.root)?;
        if let Some(parent) = &self.parent {
            write!(f, ";Parent={}", parent)?;
        }
        if let Some(sampled) = self.sampled.as_header_value() {
            write!(f, ";Sampled={}", sampled)?;
        }
        Ok(())
    }
}
