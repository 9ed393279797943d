use serde_json::json;
use std::fmt;
use std::time::Duration;

/// Events emitted by the admission middleware, one per evaluated request.
///
/// Sinks consume them through the `recordMetric`-style accessors [`metric_name`],
/// [`value`] and [`tags`], or match on the variants directly.
///
/// [`metric_name`]: AdmissionEvent::metric_name
/// [`value`]: AdmissionEvent::value
/// [`tags`]: AdmissionEvent::tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionEvent {
    /// The request was admitted.
    Allowed {
        /// Policy that evaluated the request.
        policy: String,
        /// Policy limit per window.
        limit: u64,
        /// Requests left in the window after this one.
        remaining: u64,
    },
    /// The request was rejected with 429.
    Denied {
        /// Policy that evaluated the request.
        policy: String,
        /// Policy limit per window.
        limit: u64,
        /// Advisory wait handed to the caller.
        retry_after: Duration,
    },
    /// The limiter failed and the request was let through unchecked.
    FailedOpen {
        /// Policy that evaluated the request.
        policy: String,
    },
}

impl AdmissionEvent {
    /// Policy the event belongs to.
    pub fn policy(&self) -> &str {
        match self {
            AdmissionEvent::Allowed { policy, .. }
            | AdmissionEvent::Denied { policy, .. }
            | AdmissionEvent::FailedOpen { policy } => policy,
        }
    }

    /// Short outcome label: `allowed`, `denied` or `failed_open`.
    pub fn outcome(&self) -> &'static str {
        match self {
            AdmissionEvent::Allowed { .. } => "allowed",
            AdmissionEvent::Denied { .. } => "denied",
            AdmissionEvent::FailedOpen { .. } => "failed_open",
        }
    }

    /// Metric name under which the event is recorded.
    pub fn metric_name(&self) -> &'static str {
        match self {
            AdmissionEvent::Allowed { .. } => "rate_limit.allowed",
            AdmissionEvent::Denied { .. } => "rate_limit.denied",
            AdmissionEvent::FailedOpen { .. } => "rate_limit.fail_open",
        }
    }

    /// Every event counts as one occurrence.
    pub fn value(&self) -> f64 {
        1.0
    }

    /// Dimensions attached to the metric.
    pub fn tags(&self) -> Vec<(&'static str, String)> {
        let mut tags = vec![("policy", self.policy().to_string())];
        match self {
            AdmissionEvent::Allowed { remaining, .. } => {
                tags.push(("remaining", remaining.to_string()));
            }
            AdmissionEvent::Denied { retry_after, .. } => {
                tags.push(("retry_after", retry_after.as_secs().to_string()));
            }
            AdmissionEvent::FailedOpen { .. } => {}
        }
        tags
    }
}

impl fmt::Display for AdmissionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdmissionEvent::Allowed { policy, limit, remaining } => {
                write!(f, "Allowed({policy}, {remaining}/{limit} left)")
            }
            AdmissionEvent::Denied { policy, limit, retry_after } => {
                write!(f, "Denied({policy}, limit={limit}, retry_after={}s)", retry_after.as_secs())
            }
            AdmissionEvent::FailedOpen { policy } => write!(f, "FailedOpen({policy})"),
        }
    }
}

/// Convert an [`AdmissionEvent`] into a JSON value for sinks.
pub fn event_to_json(event: &AdmissionEvent) -> serde_json::Value {
    match event {
        AdmissionEvent::Allowed { policy, limit, remaining } => json!({
            "kind": "allowed",
            "policy": policy,
            "limit": *limit,
            "remaining": *remaining,
        }),
        AdmissionEvent::Denied { policy, limit, retry_after } => json!({
            "kind": "denied",
            "policy": policy,
            "limit": *limit,
            "retry_after_secs": retry_after.as_secs(),
        }),
        AdmissionEvent::FailedOpen { policy } => json!({
            "kind": "failed_open",
            "policy": policy,
        }),
    }
}
