use http::Request;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{to_iso8601, Clock, SystemClock};
use crate::error::AdmissionError;
use crate::policy::Policy;
use crate::rate_limit::key::RequestHead;
use crate::rate_limit::store::{window_millis, CounterEntry, CounterStore, InMemoryCounterStore};
use crate::rate_limit::{AdmissionDecision, QuotaStatus};

/// Owned description of the caller behind one request.
///
/// Built synchronously from the request head so that nothing borrowed from the request is held
/// across store calls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Partition key, `"{policy}:{scope}"`.
    pub key: String,
    /// Client address, for logs.
    pub ip: Option<String>,
    /// `User-Agent`, for logs.
    pub user_agent: Option<String>,
}

/// Fixed-window rate limiter for one [`Policy`].
///
/// The first request for a key opens a window of `policy.window()`; every request inside the
/// window increments the counter; requests past `policy.max()` are denied until the window ends.
/// A burst straddling a boundary can therefore see up to `2 * max` admissions in less than one
/// window. That approximation is accepted.
///
/// Clones share the policy, store and clock.
pub struct RateLimiter<S = InMemoryCounterStore> {
    policy: Arc<Policy>,
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    store_timeout: Option<Duration>,
}

impl<S> Clone for RateLimiter<S> {
    fn clone(&self) -> Self {
        Self {
            policy: self.policy.clone(),
            store: self.store.clone(),
            clock: self.clock.clone(),
            store_timeout: self.store_timeout,
        }
    }
}

impl<S> std::fmt::Debug for RateLimiter<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("clock", &self.clock)
            .field("store_timeout", &self.store_timeout)
            .finish_non_exhaustive()
    }
}

impl<S> RateLimiter<S>
where
    S: CounterStore + 'static,
{
    /// Create a limiter enforcing `policy` against `store`.
    pub fn new(policy: Policy, store: Arc<S>) -> Self {
        Self { policy: Arc::new(policy), store, clock: Arc::new(SystemClock), store_timeout: None }
    }

    /// Override the clock (useful for deterministic tests).
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Treat store calls slower than `timeout` as store failures.
    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Derive the caller for a request head.
    pub fn identify(&self, head: &RequestHead<'_>) -> Caller {
        Caller {
            key: self.policy.key_strategy().key(self.policy.name(), head),
            ip: head.client_ip(),
            user_agent: head.user_agent().map(str::to_string),
        }
    }

    /// Count `req` and decide whether to admit it.
    ///
    /// Store failures are logged and produce an admitting decision.
    pub fn check_limit<B>(
        &self,
        req: &Request<B>,
    ) -> impl Future<Output = AdmissionDecision> + Send + '_ {
        let caller = self.identify(&RequestHead::from(req));
        async move {
            match self.try_check(&caller).await {
                Ok(decision) => decision,
                Err(err) => {
                    tracing::error!(
                        target: "turnstile::limiter",
                        policy = %self.policy.name(),
                        key = %caller.key,
                        error = %err,
                        "admission check failed; failing open"
                    );
                    self.fail_open()
                }
            }
        }
    }

    /// Count one request for `caller` and decide, surfacing store failures.
    pub async fn try_check(&self, caller: &Caller) -> Result<AdmissionDecision, AdmissionError> {
        let now = self.clock.now_millis();
        let entry = self
            .guarded(&caller.key, self.store.increment(&caller.key, self.policy.window(), now))
            .await?;
        let decision = self.decide(entry, now);
        if !decision.allowed {
            self.log_denied(caller, entry.count, entry.reset_at);
        }
        Ok(decision)
    }

    /// Take back the count of an admitted request whose outcome is not counted.
    ///
    /// `reset_at` identifies the window the request was counted in; a window that has since
    /// rolled over is left untouched.
    pub async fn release(&self, key: &str, reset_at: u64) -> Result<Option<CounterEntry>, AdmissionError> {
        self.guarded(key, self.store.decrement(key, reset_at)).await
    }

    /// Read-only quota snapshot for the caller of `req`. Never creates or modifies counters.
    pub fn check_status<B>(
        &self,
        req: &Request<B>,
    ) -> impl Future<Output = Result<QuotaStatus, AdmissionError>> + Send + '_ {
        let caller = self.identify(&RequestHead::from(req));
        async move { self.status_for(&caller.key).await }
    }

    /// Quota snapshot for a precomputed key.
    pub async fn status_for(&self, key: &str) -> Result<QuotaStatus, AdmissionError> {
        let now = self.clock.now_millis();
        let max = self.policy.max();
        let status = match self.live_entry(key, now).await? {
            Some(entry) => {
                let remaining = max.saturating_sub(entry.count);
                QuotaStatus {
                    limit: max,
                    remaining,
                    reset_at: entry.reset_at,
                    retry_after: (remaining == 0).then(|| retry_after(entry.reset_at, now)),
                }
            }
            None => QuotaStatus {
                limit: max,
                remaining: max,
                reset_at: self.fresh_reset_at(now),
                retry_after: None,
            },
        };
        Ok(status)
    }

    /// Forget the counter for the caller of `req`, e.g. after a successful login.
    pub fn reset<B>(
        &self,
        req: &Request<B>,
    ) -> impl Future<Output = Result<(), AdmissionError>> + Send + '_ {
        let caller = self.identify(&RequestHead::from(req));
        async move {
            self.guarded(&caller.key, self.store.delete(&caller.key)).await?;
            tracing::debug!(target: "turnstile::limiter", key = %caller.key, "counter reset");
            Ok(())
        }
    }

    /// Decision used when the limiter cannot reach its store.
    pub fn fail_open(&self) -> AdmissionDecision {
        let now = self.clock.now_millis();
        AdmissionDecision {
            allowed: true,
            limit: self.policy.max(),
            remaining: self.policy.max(),
            reset_at: self.fresh_reset_at(now),
            retry_after: None,
        }
    }

    fn decide(&self, entry: CounterEntry, now: u64) -> AdmissionDecision {
        let max = self.policy.max();
        if entry.count <= max {
            AdmissionDecision {
                allowed: true,
                limit: max,
                remaining: max - entry.count,
                reset_at: entry.reset_at,
                retry_after: None,
            }
        } else {
            AdmissionDecision {
                allowed: false,
                limit: max,
                remaining: 0,
                reset_at: entry.reset_at,
                retry_after: Some(retry_after(entry.reset_at, now)),
            }
        }
    }

    async fn live_entry(&self, key: &str, now: u64) -> Result<Option<CounterEntry>, AdmissionError> {
        let entry = self.guarded(key, self.store.get(key)).await?;
        Ok(entry.filter(|e| !e.is_expired(now)))
    }

    async fn guarded<T, E, F>(&self, key: &str, op: F) -> Result<T, AdmissionError>
    where
        F: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let result = match self.store_timeout {
            Some(timeout) => tokio::time::timeout(timeout, op)
                .await
                .map_err(|_| AdmissionError::StoreTimeout { key: key.to_string(), timeout })?,
            None => op.await,
        };
        result.map_err(|e| AdmissionError::store(key, e))
    }

    fn fresh_reset_at(&self, now: u64) -> u64 {
        now.saturating_add(window_millis(self.policy.window()))
    }

    fn log_denied(&self, caller: &Caller, count: u64, reset_at: u64) {
        tracing::warn!(
            target: "turnstile::limiter",
            policy = %self.policy.name(),
            key = %caller.key,
            count,
            limit = self.policy.max(),
            ip = caller.ip.as_deref().unwrap_or("unknown"),
            user_agent = caller.user_agent.as_deref().unwrap_or(""),
            reset = %to_iso8601(reset_at),
            "rate limit exceeded"
        );
    }
}

/// Whole seconds until `reset_at`, rounded up and never below one.
fn retry_after(reset_at: u64, now: u64) -> Duration {
    let millis = reset_at.saturating_sub(now);
    Duration::from_secs(millis.div_ceil(1_000).max(1))
}
