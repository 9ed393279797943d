//! Immutable admission policies.
//!
//! A [`Policy`] names a class of endpoints and fixes how many requests one caller may make per
//! fixed window. Policies are validated once by [`PolicyBuilder::build`] and shared behind `Arc`
//! afterwards.

use std::time::Duration;

use crate::rate_limit::key::KeyStrategy;

/// Rejection message used when none is configured.
pub const DEFAULT_MESSAGE: &str = "Too many requests, please try again later.";

/// Errors produced when validating a policy.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PolicyError {
    /// Policy names namespace counter keys and must not be empty.
    #[error("policy name must not be empty")]
    EmptyName,
    /// `max` must be > 0.
    #[error("policy '{name}': max must be > 0")]
    ZeroMax {
        /// Offending policy.
        name: String,
    },
    /// The window must be at least one millisecond.
    #[error("policy '{name}': window must be at least 1ms (got {window:?})")]
    InvalidWindow {
        /// Offending policy.
        name: String,
        /// Value provided by caller.
        window: Duration,
    },
}

/// Validated, immutable admission policy.
#[derive(Debug, Clone)]
pub struct Policy {
    name: String,
    window: Duration,
    max: u64,
    message: String,
    key: KeyStrategy,
    skip_successful: bool,
    skip_failed: bool,
}

impl Policy {
    /// Start building a policy called `name`.
    ///
    /// # Examples
    /// ```
    /// use std::time::Duration;
    /// use turnstile::Policy;
    ///
    /// let policy = Policy::builder("auth")
    ///     .window(Duration::from_secs(15 * 60))
    ///     .max(5)
    ///     .message("Too many login attempts, please try again later.")
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(policy.max(), 5);
    /// ```
    pub fn builder(name: impl Into<String>) -> PolicyBuilder {
        PolicyBuilder {
            name: name.into(),
            window: Duration::from_secs(60),
            max: 60,
            message: DEFAULT_MESSAGE.to_string(),
            key: KeyStrategy::Ip,
            skip_successful: false,
            skip_failed: false,
        }
    }

    /// Construct a policy from values known to be valid.
    pub(crate) fn fixed(name: &str, window: Duration, max: u64, message: &str) -> Self {
        Self {
            name: name.to_string(),
            window,
            max,
            message: message.to_string(),
            key: KeyStrategy::Ip,
            skip_successful: false,
            skip_failed: false,
        }
    }

    /// Name used to namespace counter keys and select the policy in a registry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed window length.
    pub fn window(&self) -> Duration {
        self.window
    }

    /// Requests admitted per key per window.
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Message returned to rejected callers.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Strategy partitioning counters by caller.
    pub fn key_strategy(&self) -> &KeyStrategy {
        &self.key
    }

    /// Successful responses (status < 400) are not counted.
    pub fn skip_successful(&self) -> bool {
        self.skip_successful
    }

    /// Failed responses (status >= 400 or handler error) are not counted.
    pub fn skip_failed(&self) -> bool {
        self.skip_failed
    }

    /// Some outcomes are not counted, so the handler's result decides whether a request keeps
    /// its count.
    pub fn defers_counting(&self) -> bool {
        self.skip_successful || self.skip_failed
    }

    /// Whether a request with this outcome is counted against the caller.
    pub fn counts_outcome(&self, succeeded: bool) -> bool {
        if succeeded {
            !self.skip_successful
        } else {
            !self.skip_failed
        }
    }
}

/// Builder for [`Policy`].
#[derive(Debug, Clone)]
pub struct PolicyBuilder {
    name: String,
    window: Duration,
    max: u64,
    message: String,
    key: KeyStrategy,
    skip_successful: bool,
    skip_failed: bool,
}

impl PolicyBuilder {
    pub fn window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn max(mut self, max: u64) -> Self {
        self.max = max;
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn key(mut self, key: KeyStrategy) -> Self {
        self.key = key;
        self
    }

    pub fn skip_successful(mut self, skip: bool) -> Self {
        self.skip_successful = skip;
        self
    }

    pub fn skip_failed(mut self, skip: bool) -> Self {
        self.skip_failed = skip;
        self
    }

    /// Validate and freeze the policy.
    pub fn build(self) -> Result<Policy, PolicyError> {
        if self.name.trim().is_empty() {
            return Err(PolicyError::EmptyName);
        }
        if self.max == 0 {
            return Err(PolicyError::ZeroMax { name: self.name });
        }
        if self.window < Duration::from_millis(1) {
            return Err(PolicyError::InvalidWindow { name: self.name, window: self.window });
        }
        Ok(Policy {
            name: self.name,
            window: self.window,
            max: self.max,
            message: self.message,
            key: self.key,
            skip_successful: self.skip_successful,
            skip_failed: self.skip_failed,
        })
    }
}
