//! Telemetry for admission decisions.
//!
//! The middleware emits one [`AdmissionEvent`] per evaluated request (allowed, denied or
//! failed-open). Events flow through [`TelemetrySink`] implementations, which are
//! `tower::Service<AdmissionEvent>`s so they compose like any other service.
//!
//! Emission is best-effort and detached from the request: sink errors are swallowed, and a slow
//! sink never delays a response.

pub mod events;
pub mod sinks;

pub use events::{event_to_json, AdmissionEvent};
pub use sinks::{
    emit_best_effort, spawn_emit, LogSink, MemorySink, NonBlockingSink, NullSink, TelemetrySink,
};
