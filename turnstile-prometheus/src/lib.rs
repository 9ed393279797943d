//! Prometheus metrics sink for `turnstile`.
//! Bring your own `prometheus::Registry`; counters are registered and incremented.

use prometheus::{IntCounterVec, Registry};
use std::convert::Infallible;
use std::future::{ready, Ready};
use std::sync::Arc;
use std::task::{Context, Poll};
use turnstile::telemetry::{AdmissionEvent, TelemetrySink};

/// Name of the counter this sink registers.
pub const EVENTS_TOTAL: &str = "turnstile_admission_events_total";

#[derive(Clone, Debug)]
pub struct PrometheusSink {
    registry: Arc<Registry>,
    counter: IntCounterVec,
}

impl PrometheusSink {
    /// Create a sink and register counters into the provided registry.
    ///
    /// # Errors
    /// Returns an error if the metric cannot be registered (e.g. name conflict).
    pub fn new<R: Into<Arc<Registry>>>(registry: R) -> Result<Self, prometheus::Error> {
        let registry = registry.into();
        let counter = IntCounterVec::new(
            prometheus::Opts::new(EVENTS_TOTAL, "Admission decisions by policy and outcome"),
            &["policy", "outcome"],
        )?;
        registry.register(Box::new(counter.clone()))?;
        Ok(Self { registry, counter })
    }

    /// Expose the registry for HTTP scraping.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Current count for one policy/outcome pair.
    pub fn count(&self, policy: &str, outcome: &str) -> u64 {
        self.counter.with_label_values(&[policy, outcome]).get()
    }
}

impl tower_service::Service<AdmissionEvent> for PrometheusSink {
    type Response = ();
    type Error = Infallible;
    type Future = Ready<Result<(), Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: AdmissionEvent) -> Self::Future {
        self.counter.with_label_values(&[event.policy(), event.outcome()]).inc();
        ready(Ok(()))
    }
}

impl TelemetrySink for PrometheusSink {
    type SinkError = Infallible;
}
