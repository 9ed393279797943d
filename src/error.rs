//! Error types for admission control.
//!
//! Only infrastructure failures are errors here. A denied request is a normal
//! [`AdmissionDecision`](crate::AdmissionDecision), not an error.
use std::time::Duration;

/// Boxed error carried by store failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures raised while evaluating a request against a policy.
///
/// The middleware absorbs every variant and lets the request through (fail-open).
#[derive(thiserror::Error, Debug)]
pub enum AdmissionError {
    /// The counter store returned an error.
    #[error("counter store unavailable for '{key}': {source}")]
    StoreUnavailable {
        /// Partition key being evaluated.
        key: String,
        /// Underlying store error.
        #[source]
        source: BoxError,
    },
    /// The counter store did not answer within the configured deadline.
    #[error("counter store timed out after {timeout:?} for '{key}'")]
    StoreTimeout {
        /// Partition key being evaluated.
        key: String,
        /// Deadline that elapsed.
        timeout: Duration,
    },
}

impl AdmissionError {
    /// Wrap a store error for `key`.
    pub fn store(key: impl Into<String>, source: impl Into<BoxError>) -> Self {
        AdmissionError::StoreUnavailable { key: key.into(), source: source.into() }
    }

    /// Partition key the failure relates to.
    pub fn key(&self) -> &str {
        match self {
            Self::StoreUnavailable { key, .. } | Self::StoreTimeout { key, .. } => key,
        }
    }

    /// Check if this error came from the store itself.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Check if this error is a store deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::StoreTimeout { .. })
    }
}

/// Failure to derive a caller scope from a request.
///
/// Key strategies fall back to a default scope when this happens; it is never surfaced to the
/// caller of the wrapped service.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    /// An `Authorization` credential was present but could not be decoded.
    #[error("malformed credential: {0}")]
    MalformedCredential(String),
}
