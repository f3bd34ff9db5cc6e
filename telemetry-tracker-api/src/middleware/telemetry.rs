//! Request telemetry middleware
//!
//! Attaches a [`RequestLogger`] to the request's task, observes the response
//! through a [`ResponseRecorder`], and once the response body has been
//! written records one count, one duration and one size sample labeled with
//! `{method, status}` plus one `Request completed` log line whose level
//! follows the status.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{header, HeaderMap, Method, StatusCode},
    middleware::Next,
    response::Response,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::Instrument;
use uuid::Uuid;

use super::recorder::ResponseRecorder;
use crate::observability::{
    with_logger, LoggerSlot, MetricsRegistry, RequestFields, RequestLogger, REQUEST_ID_HEADER,
};

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";

/// Axum middleware recording request telemetry.
///
/// Reuses the [`ResponseRecorder`] an outer recovery boundary placed in the
/// request extensions so both observe the same status, and publishes the
/// request logger through the boundary's [`LoggerSlot`].
///
/// The HTTP samples and the completion log are emitted when the response
/// body finishes streaming (or is dropped), after this function has
/// returned. Status and byte count are final at that point.
pub async fn request_telemetry_middleware(
    State(metrics): State<MetricsRegistry>,
    mut request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let method = request.method().clone();

    let logger = RequestLogger::new(&RequestFields {
        request_id: request_id(request.headers()),
        method: method.to_string(),
        path: request.uri().path().to_string(),
        remote_addr: client_addr(&request),
        user_agent: header_value(request.headers(), header::USER_AGENT.as_str())
            .unwrap_or_default()
            .to_string(),
    });

    if let Some(slot) = request.extensions().get::<LoggerSlot>() {
        slot.attach(logger.clone());
    }

    let recorder = match request.extensions().get::<ResponseRecorder>() {
        Some(recorder) => recorder.clone(),
        None => {
            let recorder = ResponseRecorder::new();
            request.extensions_mut().insert(recorder.clone());
            recorder
        }
    };

    let response = with_logger(logger.clone(), next.run(request))
        .instrument(logger.span().clone())
        .await;

    recorder.record(response, move |recorder| {
        let status = recorder.status().unwrap_or(StatusCode::OK);
        let bytes = recorder.bytes_written();
        let elapsed = start.elapsed();

        metrics.http_request(&method, status);
        metrics.http_request_duration(&method, status, elapsed);
        metrics.http_response_size(&method, status, bytes);

        log_completion(&logger, &method, status, bytes, elapsed);
    })
}

fn log_completion(
    logger: &RequestLogger,
    method: &Method,
    status: StatusCode,
    bytes: u64,
    elapsed: Duration,
) {
    let span = logger.span();
    let request_id = logger.request_id();
    let duration_ms = elapsed.as_millis() as u64;

    if status.is_server_error() {
        tracing::error!(
            parent: span,
            request_id = %request_id,
            method = %method,
            status = status.as_u16(),
            bytes,
            duration_ms,
            "Request completed"
        );
    } else if status.is_client_error() {
        tracing::warn!(
            parent: span,
            request_id = %request_id,
            method = %method,
            status = status.as_u16(),
            bytes,
            duration_ms,
            "Request completed"
        );
    } else {
        tracing::info!(
            parent: span,
            request_id = %request_id,
            method = %method,
            status = status.as_u16(),
            bytes,
            duration_ms,
            "Request completed"
        );
    }
}

/// The transport-assigned request id, or a fresh one if none was assigned
fn request_id(headers: &HeaderMap) -> String {
    header_value(headers, REQUEST_ID_HEADER)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

/// Client address: first `X-Forwarded-For` hop, then `X-Real-IP`, then the
/// peer address of the connection.
fn client_addr(request: &Request) -> String {
    let headers = request.headers();

    if let Some(forwarded) = header_value(headers, X_FORWARDED_FOR) {
        if let Some(first) = forwarded.split(',').map(str::trim).find(|s| !s.is_empty()) {
            return first.to_string();
        }
    }

    if let Some(real_ip) = header_value(headers, X_REAL_IP).map(str::trim) {
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

fn header_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
