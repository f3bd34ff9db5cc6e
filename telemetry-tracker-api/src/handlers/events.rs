use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, StatusCode},
    Json,
};
use serde_json::{json, Value};
use telemetry_tracker_core::Event;

use crate::{
    error::{ApiError, ApiResult},
    error_ctx, info_ctx,
    observability::{record_error, record_event, set_attribute},
    AppState,
};

const APPLICATION_JSON: &str = "application/json";

/// Ingest one telemetry event.
///
/// Returns `202 Accepted` once the event is stored. Storage failures are
/// counted and logged here and surface as a generic 500; they are never
/// retried.
pub async fn create_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<(StatusCode, Json<Value>)> {
    if !is_json(&headers) {
        return Err(ApiError::UnsupportedMediaType(format!(
            "Content-Type must be {}",
            APPLICATION_JSON
        )));
    }

    let event = Event::from_json(&body)?;

    state.metrics.event_received(&event.event_type);
    set_attribute("event.type", event.event_type.clone());

    if let Err(err) = state.store.store(&event).await {
        state.metrics.database_error();
        error_ctx!(error = %err, event_type = %event.event_type, "Failed to store event");
        record_error(&err);
        return Err(ApiError::Store(err));
    }

    state.metrics.event_stored();
    record_event("Event stored successfully");
    info_ctx!(event_type = %event.event_type, "Event stored");

    Ok((StatusCode::ACCEPTED, Json(json!({"status": "accepted"}))))
}

/// `application/json`, with or without parameters such as `charset`
fn is_json(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .map(|mime| mime.trim().eq_ignore_ascii_case(APPLICATION_JSON))
        .unwrap_or(false)
}
