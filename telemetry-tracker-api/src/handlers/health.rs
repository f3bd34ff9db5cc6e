use axum::{http::header, response::IntoResponse};

/// Liveness check
pub async fn healthz() -> impl IntoResponse {
    tracing::info_span!("HealthCheck").in_scope(|| {
        tracing::debug!("Health check");
        ([(header::CONTENT_TYPE, "text/plain; charset=utf-8")], "OK")
    })
}
