//! Registry of named rate limiters sharing one counter store.
//!
//! Each policy is instantiated once and reused for every request; look limiters up by name to
//! mount them on routes.
//!
//! ```rust
//! use std::sync::Arc;
//! use turnstile::{presets, InMemoryCounterStore, PolicyRegistry};
//!
//! let registry = PolicyRegistry::with_defaults(Arc::new(InMemoryCounterStore::new()));
//! let auth = registry.require(presets::AUTH).unwrap();
//! assert_eq!(auth.policy().max(), 5);
//! ```

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::warn;

use crate::clock::{Clock, SystemClock};
use crate::config::{AdmissionConfig, ConfigError};
use crate::policy::Policy;
use crate::presets;
use crate::rate_limit::limiter::RateLimiter;
use crate::rate_limit::middleware::AdmissionLayer;
use crate::rate_limit::store::{CleanupHandle, CounterStore, InMemoryCounterStore, DEFAULT_CLEANUP_INTERVAL};

/// Errors from policy registries.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The requested policy was not registered.
    #[error("rate limit policy '{name}' not found")]
    NotFound {
        /// Name that could not be located.
        name: String,
    },
}

/// Named limiters over a shared store. Clones share the same table.
pub struct PolicyRegistry<S = InMemoryCounterStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    store_timeout: Option<Duration>,
    cleanup_interval: Duration,
    limiters: Arc<RwLock<HashMap<String, RateLimiter<S>>>>,
}

impl<S> Clone for PolicyRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            store_timeout: self.store_timeout,
            cleanup_interval: self.cleanup_interval,
            limiters: self.limiters.clone(),
        }
    }
}

impl<S> std::fmt::Debug for PolicyRegistry<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = self.names_unsorted();
        f.debug_struct("PolicyRegistry")
            .field("policies", &names)
            .field("store_timeout", &self.store_timeout)
            .field("cleanup_interval", &self.cleanup_interval)
            .finish_non_exhaustive()
    }
}

impl<S> PolicyRegistry<S>
where
    S: CounterStore + 'static,
{
    pub fn builder(store: Arc<S>) -> PolicyRegistryBuilder<S> {
        PolicyRegistryBuilder {
            store,
            clock: Arc::new(SystemClock),
            store_timeout: None,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
            policies: Vec::new(),
        }
    }

    /// Registry holding the standard table from [`presets`].
    pub fn with_defaults(store: Arc<S>) -> Self {
        presets::all().into_iter().fold(Self::builder(store), PolicyRegistryBuilder::policy).build()
    }

    /// Registry holding the policies of `config`, applying its store timeout and sweep interval.
    pub fn from_config(store: Arc<S>, config: &AdmissionConfig) -> Result<Self, ConfigError> {
        if config.cleanup_interval_secs == 0 {
            return Err(ConfigError::ZeroCleanupInterval);
        }
        let mut builder = Self::builder(store).cleanup_interval(config.cleanup_interval());
        if let Some(timeout) = config.store_timeout() {
            builder = builder.store_timeout(timeout);
        }
        for policy in config.build_policies()? {
            builder = builder.policy(policy);
        }
        Ok(builder.build())
    }

    /// Instantiate the limiter for `policy`, replacing one with the same name. Only the builder
    /// calls this, so the table is fixed once built.
    fn register(&self, policy: Policy) {
        let name = policy.name().to_string();
        let mut limiter = RateLimiter::new(policy, self.store.clone()).with_clock(self.clock.clone());
        if let Some(timeout) = self.store_timeout {
            limiter = limiter.with_store_timeout(timeout);
        }

        let mut map = self.limiters.write().unwrap_or_else(PoisonError::into_inner);
        if map.contains_key(&name) {
            warn!(target: "turnstile::registry", policy = %name, "policy name replaced; last registration wins");
        }
        map.insert(name, limiter);
    }

    /// Limiter registered under `name`.
    pub fn get(&self, name: &str) -> Option<RateLimiter<S>> {
        self.limiters.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    /// Like [`get`](Self::get), erroring if missing.
    pub fn require(&self, name: &str) -> Result<RateLimiter<S>, RegistryError> {
        self.get(name).ok_or_else(|| RegistryError::NotFound { name: name.to_string() })
    }

    /// Middleware layer for the limiter registered under `name`.
    pub fn layer(&self, name: &str) -> Result<AdmissionLayer<S>, RegistryError> {
        self.require(name).map(AdmissionLayer::new)
    }

    /// Registered policy names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names = self.names_unsorted();
        names.sort();
        names
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cleanup_interval(&self) -> Duration {
        self.cleanup_interval
    }
}

impl<S> PolicyRegistry<S> {
    fn names_unsorted(&self) -> Vec<String> {
        self.limiters.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect()
    }
}

impl PolicyRegistry<InMemoryCounterStore> {
    /// Start sweeping the shared in-memory store at the configured interval.
    ///
    /// Expiry is judged by the registry's clock, the same one its limiters read.
    pub fn spawn_cleanup(&self) -> CleanupHandle {
        self.store.spawn_cleanup_with(self.cleanup_interval, self.clock.clone())
    }
}

/// Builder for [`PolicyRegistry`].
pub struct PolicyRegistryBuilder<S> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    store_timeout: Option<Duration>,
    cleanup_interval: Duration,
    policies: Vec<Policy>,
}

impl<S> PolicyRegistryBuilder<S>
where
    S: CounterStore + 'static,
{
    pub fn policy(mut self, policy: Policy) -> Self {
        self.policies.push(policy);
        self
    }

    /// Clock shared by every limiter and by [`PolicyRegistry::spawn_cleanup`].
    pub fn clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = Some(timeout);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn build(self) -> PolicyRegistry<S> {
        let registry = PolicyRegistry {
            store: self.store,
            clock: self.clock,
            store_timeout: self.store_timeout,
            cleanup_interval: self.cleanup_interval,
            limiters: Arc::new(RwLock::new(HashMap::new())),
        };
        for policy in self.policies {
            registry.register(policy);
        }
        registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn store() -> Arc<InMemoryCounterStore> {
        Arc::new(InMemoryCounterStore::new())
    }

    #[test]
    fn defaults_hold_the_standard_table() {
        let registry = PolicyRegistry::with_defaults(store());
        assert_eq!(
            registry.names(),
            vec!["api", "auth", "booking", "email", "passwordReset", "register"]
        );
        assert_eq!(registry.require("passwordReset").unwrap().policy().max(), 3);
    }

    #[test]
    fn missing_policy_is_not_found() {
        let registry = PolicyRegistry::with_defaults(store());
        assert!(registry.get("uploads").is_none());
        assert_eq!(
            registry.require("uploads").unwrap_err(),
            RegistryError::NotFound { name: "uploads".into() }
        );
        assert!(registry.layer("uploads").is_err());
        assert!(registry.layer("api").is_ok());
    }

    #[test]
    fn register_warns_and_replaces_duplicates() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = PolicyRegistry::builder(store())
            .policy(Policy::builder("api").max(10).build().unwrap())
            .policy(Policy::builder("api").max(20).build().unwrap())
            .build();

        assert_eq!(registry.require("api").unwrap().policy().max(), 20, "last registration should win");

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(
            logs.contains("policy name replaced"),
            "warning should be emitted on duplicate registration"
        );
    }

    #[test]
    fn from_config_applies_settings() {
        let config = AdmissionConfig::from_json_str(
            r#"{ "cleanup_interval_secs": 30, "store_timeout_ms": 25, "policies": [
                { "name": "uploads", "window_ms": 60000, "max": 4 }
            ] }"#,
        )
        .unwrap();
        let registry = PolicyRegistry::from_config(store(), &config).unwrap();
        assert_eq!(registry.names(), vec!["uploads"]);
        assert_eq!(registry.cleanup_interval(), Duration::from_secs(30));
        assert_eq!(registry.require("uploads").unwrap().policy().window(), Duration::from_secs(60));
    }

    #[test]
    fn from_config_rejects_zero_cleanup_interval() {
        let config = AdmissionConfig::from_json_str(r#"{ "cleanup_interval_secs": 0 }"#).unwrap();
        assert!(matches!(
            PolicyRegistry::from_config(store(), &config),
            Err(ConfigError::ZeroCleanupInterval)
        ));
    }

    #[tokio::test]
    async fn limiters_share_the_store() {
        let registry = PolicyRegistry::with_defaults(store());
        let req = http::Request::builder().header("x-forwarded-for", "198.51.100.1").body(()).unwrap();

        registry.require("auth").unwrap().check_limit(&req).await;
        registry.require("api").unwrap().check_limit(&req).await;

        assert_eq!(registry.store().len(), 2);
        let again = registry.require("auth").unwrap().check_limit(&req).await;
        assert_eq!(again.remaining, 3, "same limiter state across lookups");
    }
}
