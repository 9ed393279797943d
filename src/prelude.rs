//! Convenient re-exports for common Turnstile types.
pub use crate::{
    clock::{Clock, ManualClock, SystemClock},
    config::AdmissionConfig,
    policy::Policy,
    presets,
    rate_limit::{
        with_admission_control, AdmissionDecision, AdmissionLayer, AuthenticatedUser,
        CounterStore, InMemoryCounterStore, KeyStrategy, PeerAddr, RateLimiter,
    },
    registry::PolicyRegistry,
    telemetry::{AdmissionEvent, LogSink, MemorySink, NullSink, TelemetrySink},
    AdmissionError,
};
