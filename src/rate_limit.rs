//! Fixed-window rate limiting.
//!
//! The building blocks, leaves first:
//! - [`CounterStore`]: key to `(count, reset_at)` storage, with an in-memory implementation.
//! - [`KeyStrategy`]: derives the partition key from a request (IP, user, or custom).
//! - [`RateLimiter`]: owns a [`Policy`](crate::Policy) and a store and decides.
//! - [`AdmissionLayer`]: tower middleware that asks the limiter, attaches `X-RateLimit-*`
//!   headers, and answers `429` when the caller is over quota.
//!
//! # Architecture
//!
//! The middleware doesn't know *how* counting works, only that it should ask a
//! `RateLimiter`. The limiter doesn't know where counters live, only that a `CounterStore`
//! holds them, so an in-process map can be swapped for a networked store.

use std::time::Duration;

use crate::clock::to_iso8601;

pub mod key;
pub mod limiter;
pub mod middleware;
pub mod store;

pub use key::{
    AuthenticatedUser, BearerClaims, IdentityDecoder, KeyStrategy, PeerAddr, RequestHead,
    ANONYMOUS_SCOPE, UNKNOWN_SCOPE,
};
pub use limiter::{Caller, RateLimiter};
pub use middleware::{with_admission_control, AdmissionLayer, AdmissionService};
pub use store::{
    CleanupHandle, CounterEntry, CounterStore, InMemoryCounterStore, DEFAULT_CLEANUP_INTERVAL,
};

/// Outcome of evaluating one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionDecision {
    /// The request may proceed.
    pub allowed: bool,
    /// Policy maximum per window.
    pub limit: u64,
    /// Requests left in the current window.
    pub remaining: u64,
    /// Epoch milliseconds at which the window ends.
    pub reset_at: u64,
    /// Advisory wait, present only on denial.
    pub retry_after: Option<Duration>,
}

impl AdmissionDecision {
    /// `retry_after` in whole seconds, for `Retry-After` headers.
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs())
    }

    /// Window end as an ISO-8601 UTC timestamp.
    pub fn reset_iso8601(&self) -> String {
        to_iso8601(self.reset_at)
    }
}

/// Read-only quota snapshot, see [`RateLimiter::check_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_at: u64,
    /// Present only when the quota is exhausted.
    pub retry_after: Option<Duration>,
}

impl QuotaStatus {
    pub fn retry_after_secs(&self) -> Option<u64> {
        self.retry_after.map(|d| d.as_secs())
    }

    pub fn reset_iso8601(&self) -> String {
        to_iso8601(self.reset_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_helpers() {
        let decision = AdmissionDecision {
            allowed: false,
            limit: 5,
            remaining: 0,
            reset_at: 1_714_564_800_123,
            retry_after: Some(Duration::from_secs(42)),
        };
        assert_eq!(decision.retry_after_secs(), Some(42));
        assert_eq!(decision.reset_iso8601(), "2024-05-01T12:00:00.123Z");
    }
}
