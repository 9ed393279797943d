#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # Turnstile
//!
//! Fixed-window admission control for tower HTTP services.
//!
//! ## Features
//!
//! - **Fixed-window counters** behind a pluggable async [`CounterStore`]
//! - **Key strategies** partitioning callers by IP, authenticated user, or a custom function
//! - **Named policies** with a standard table ([`presets`]) and a JSON [`config`] loader
//! - **Tower middleware** adding `X-RateLimit-*` headers and answering `429` with a JSON body
//! - **Fail-open** on store failures, so an unavailable store never takes the service down
//! - **Telemetry** events for every decision, routed through composable sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use std::convert::Infallible;
//! use std::sync::Arc;
//! use http::{Request, Response, StatusCode};
//! use tower::{service_fn, Layer, ServiceExt};
//! use turnstile::{presets, InMemoryCounterStore, PolicyRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let registry = PolicyRegistry::with_defaults(Arc::new(InMemoryCounterStore::new()));
//!     let login = registry.layer(presets::AUTH).unwrap().layer(service_fn(
//!         |_req: Request<String>| async { Ok::<_, Infallible>(Response::new(String::from("welcome"))) },
//!     ));
//!
//!     let req = Request::builder()
//!         .uri("/api/auth/login")
//!         .header("x-forwarded-for", "203.0.113.9")
//!         .body(String::new())
//!         .unwrap();
//!     let resp = login.oneshot(req).await.unwrap();
//!     assert_eq!(resp.status(), StatusCode::OK);
//!     assert_eq!(resp.headers()["x-ratelimit-remaining"], "4");
//! }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod policy;
pub mod prelude;
pub mod presets;
pub mod rate_limit;
pub mod registry;
pub mod telemetry;

// Re-exports
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AdmissionConfig, ConfigError, PolicyConfig};
pub use error::{AdmissionError, KeyError};
pub use policy::{Policy, PolicyBuilder, PolicyError};
pub use rate_limit::{
    with_admission_control, AdmissionDecision, AdmissionLayer, AdmissionService,
    AuthenticatedUser, BearerClaims, Caller, CleanupHandle, CounterEntry, CounterStore,
    IdentityDecoder, InMemoryCounterStore, KeyStrategy, PeerAddr, QuotaStatus, RateLimiter,
    RequestHead,
};
pub use registry::{PolicyRegistry, PolicyRegistryBuilder, RegistryError};
