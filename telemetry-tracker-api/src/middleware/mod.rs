//! HTTP middleware for the ingestion router
//!
//! Outer to inner: [`RecoveryLayer`], [`request_telemetry_middleware`], then
//! the request tracing middleware from [`crate::observability`].

pub mod recorder;
pub mod recovery;
pub mod telemetry;

pub use recorder::ResponseRecorder;
pub use recovery::{install_panic_hook, AbortRequest, Recovery, RecoveryLayer};
pub use telemetry::request_telemetry_middleware;
