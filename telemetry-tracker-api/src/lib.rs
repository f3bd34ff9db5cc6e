//! HTTP ingestion API and request telemetry pipeline
//!
//! [`app`] assembles the router. Every request passes, outer to inner, through
//! request id assignment, the panic recovery boundary, request id
//! propagation, request telemetry, request tracing and the request timeout
//! before it reaches a handler.

pub mod error;
pub mod handlers;
pub mod middleware;
pub mod observability;

pub use error::{ApiError, ApiResult};
pub use middleware::{AbortRequest, RecoveryLayer, ResponseRecorder};
pub use observability::{MetricsRegistry, ObservabilityProvider};

use axum::{
    routing::{get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;
use std::time::Duration;
use telemetry_tracker_core::EventStore;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
};

/// Maximum processing time of one request
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn EventStore>,
    pub metrics: MetricsRegistry,
    prometheus: Option<PrometheusHandle>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn EventStore>,
        metrics: MetricsRegistry,
        prometheus: Option<PrometheusHandle>,
    ) -> Self {
        Self {
            store,
            metrics,
            prometheus,
        }
    }

    /// State wired to the provider's meter and Prometheus handle
    pub fn from_provider(store: Arc<dyn EventStore>, provider: &ObservabilityProvider) -> Self {
        Self::new(store, provider.metrics(), provider.prometheus())
    }

    pub fn prometheus(&self) -> Option<&PrometheusHandle> {
        self.prometheus.as_ref()
    }
}

/// Build the application router with the full middleware chain.
pub fn app(state: AppState) -> Router {
    let metrics = state.metrics.clone();

    let routes = Router::new()
        .route("/events", post(handlers::create_event))
        .route("/healthz", get(handlers::healthz))
        .route("/metrics", get(observability::metrics_handler))
        .fallback(handlers::not_found)
        .with_state(state);

    with_middleware(routes, metrics)
}

/// Wrap `router` in the request pipeline, recording HTTP metrics into
/// `metrics`.
pub fn with_middleware(router: Router, metrics: MetricsRegistry) -> Router {
    router.layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(RecoveryLayer::new())
            .layer(PropagateRequestIdLayer::x_request_id())
            .layer(axum::middleware::from_fn_with_state(
                metrics,
                middleware::request_telemetry_middleware,
            ))
            .layer(axum::middleware::from_fn(
                observability::tracing_middleware,
            ))
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT)),
    )
}
