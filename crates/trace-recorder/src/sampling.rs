//! Sampling decisions
//!
//! An upstream `Sampled=0` or `Sampled=1` is final. Only when the upstream
//! asked for a decision (`Sampled=?`) or sent nothing usable does the local
//! strategy get consulted.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::header::SampleDecision;

/// Default number of traces admitted per second
pub const DEFAULT_TRACES_PER_SECOND: u64 = 1;

/// Admits up to `limit` requests per wall-clock second.
///
/// The counter is reset by whichever caller first observes a new second.
/// A caller racing that reset may be counted against the old window, so a
/// second can admit slightly more than `limit` under contention.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u64,
    window: AtomicI64,
    count: AtomicU64,
}

impl RateLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            window: AtomicI64::new(Utc::now().timestamp()),
            count: AtomicU64::new(0),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    /// Ask for one admission in the current second
    pub fn request(&self) -> bool {
        self.request_at(Utc::now().timestamp())
    }

    fn request_at(&self, second: i64) -> bool {
        let window = self.window.load(Ordering::Acquire);
        if second != window
            && self
                .window
                .compare_exchange(window, second, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            self.count.store(0, Ordering::Release);
        }
        self.count.fetch_add(1, Ordering::AcqRel) < self.limit
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(DEFAULT_TRACES_PER_SECOND)
    }
}

/// Local sampling policy consulted for undecided traces
pub trait SamplingStrategy: Send + Sync {
    /// Whether a new, undecided trace should be recorded
    fn should_trace(&self) -> bool;

    /// Resolve the decision for a trace given what upstream said
    fn decide(&self, upstream: SampleDecision) -> SampleDecision {
        if upstream.is_decided() {
            return upstream;
        }
        let decision = SampleDecision::from(self.should_trace());
        tracing::trace!(?upstream, ?decision, "Local sampling decision");
        decision
    }
}

/// Rate-limited sampling: the first `N` undecided traces of each second
#[derive(Debug, Default)]
pub struct LocalSampler {
    limiter: RateLimiter,
}

impl LocalSampler {
    pub fn new(traces_per_second: u64) -> Self {
        Self {
            limiter: RateLimiter::new(traces_per_second),
        }
    }

    pub fn traces_per_second(&self) -> u64 {
        self.limiter.limit()
    }
}

impl SamplingStrategy for LocalSampler {
    fn should_trace(&self) -> bool {
        self.limiter.request()
    }
}

/// Always returns the same answer for undecided traces
#[derive(Debug, Clone, Copy)]
pub struct FixedSampler(pub bool);

impl SamplingStrategy for FixedSampler {
    fn should_trace(&self) -> bool {
        self.0
    }
}
