//! OpenTelemetry request tracing
//!
//! This module provides:
//! - The OTLP trace pipeline used by the observability provider in remote mode
//! - W3C Trace Context extraction from inbound headers
//! - [`tracing_middleware`], which opens one `HTTP <method> <path>` span per
//!   request and closes it on every exit path, panics included
//! - Helpers handlers use to annotate the current request span

use axum::{
    extract::{MatchedPath, Request},
    http::HeaderMap,
    middleware::Next,
    response::Response,
};
use opentelemetry::{
    propagation::{Extractor, TextMapPropagator},
    trace::{TraceContextExt, TracerProvider as _},
    Context as OtelContext, Value,
};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    propagation::TraceContextPropagator,
    trace::{Config, RandomIdGenerator, Sampler, Tracer, TracerProvider},
    Resource,
};
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tracing::{field::Empty, Span, Subscriber};
use tracing_opentelemetry::OpenTelemetrySpanExt;
use tracing_subscriber::{filter, registry::LookupSpan, Layer};

use super::logging::{logger_from_context, REQUEST_ID_HEADER, REQUEST_LOGGER_TARGET};
use super::provider::{ObservabilityConfig, ObservabilityError};
use crate::middleware::ResponseRecorder;

// OpenTelemetry span status values understood by tracing-opentelemetry
const STATUS_ERROR: &str = "ERROR";

// ============================================================================
// Pipeline
// ============================================================================

/// Build a batching OTLP/gRPC tracer provider for `config`.
pub(crate) fn build_tracer_provider(
    config: &ObservabilityConfig,
    resource: Resource,
) -> Result<TracerProvider, ObservabilityError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| ObservabilityError::TraceExporter(e.to_string()))?;

    let sampler = Sampler::ParentBased(Box::new(Sampler::TraceIdRatioBased(
        config.sampling_rate,
    )));

    Ok(TracerProvider::builder()
        .with_config(
            Config::default()
                .with_sampler(sampler)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(resource),
        )
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build())
}

/// Tracer used by the `tracing` bridge layer.
pub(crate) fn tracer(provider: &TracerProvider, service_name: &str) -> Tracer {
    provider.tracer(service_name.to_string())
}

/// `tracing` layer exporting spans through `tracer`.
///
/// Request logger spans are excluded so that the request span is the root of
/// each exported trace.
pub fn otel_layer<S>(tracer: Tracer) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a> + Send + Sync,
{
    tracing_opentelemetry::layer()
        .with_tracer(tracer)
        .with_filter(filter::filter_fn(|metadata| {
            metadata.target() != REQUEST_LOGGER_TARGET
        }))
}

// ============================================================================
// Context Propagation
// ============================================================================

/// W3C Trace Context propagation for inbound requests
pub struct TraceContextPropagation;

impl TraceContextPropagation {
    /// Extract a valid remote trace context from HTTP headers
    pub fn extract(headers: &HeaderMap) -> Option<OtelContext> {
        let propagator = TraceContextPropagator::new();
        let context = propagator.extract(&HeaderMapExtractor::new(headers));

        if context.span().span_context().is_valid() {
            Some(context)
        } else {
            None
        }
    }
}

/// Extractor for reading trace context from HTTP headers
struct HeaderMapExtractor<'a> {
    headers: &'a HeaderMap,
}

impl<'a> HeaderMapExtractor<'a> {
    fn new(headers: &'a HeaderMap) -> Self {
        Self { headers }
    }
}

impl<'a> Extractor for HeaderMapExtractor<'a> {
    fn get(&self, key: &str) -> Option<&str> {
        self.headers.get(key).and_then(|v| v.to_str().ok())
    }

    fn keys(&self) -> Vec<&str> {
        self.headers.keys().map(|k| k.as_str()).collect()
    }
}

// ============================================================================
// Middleware
// ============================================================================

/// Axum middleware opening one span per request.
///
/// The span is named `HTTP <method> <path>` for export, carries the request
/// id of the attached request logger, becomes the parent of everything the
/// handler does, records the response status, and is marked as failed for
/// 5xx responses or when the inner stage panics.
pub async fn tracing_middleware(request: Request, next: Next) -> Response {
    let request_id = request_id(request.headers());
    let recorder = request.extensions().get::<ResponseRecorder>().cloned();
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|mp| mp.as_str().to_string())
        .unwrap_or_else(|| path.clone());

    let span = tracing::info_span!(
        "http_request",
        otel.name = %format_args!("HTTP {} {}", method, path),
        otel.kind = "server",
        request_id = %request_id,
        http.request.method = %method,
        http.route = %route,
        url.path = %path,
        http.response.status_code = Empty,
        otel.status_code = Empty,
        otel.status_message = Empty,
    );

    if let Some(parent) = TraceContextPropagation::extract(request.headers()) {
        span.set_parent(parent);
    }

    let response = SpanScope::new(span.clone(), next.run(request)).await;

    // A status the handler wrote through the recorder wins over the returned one
    let status = recorder
        .as_ref()
        .and_then(ResponseRecorder::status)
        .unwrap_or_else(|| response.status());
    span.record("http.response.status_code", status.as_u16());
    if status.is_server_error() {
        span.record("otel.status_code", STATUS_ERROR);
        span.record(
            "otel.status_message",
            status.canonical_reason().unwrap_or("server error"),
        );
    }

    response
}

/// Request id of the attached logger, falling back to the `x-request-id` header.
fn request_id(headers: &HeaderMap) -> String {
    match logger_from_context() {
        Some(logger) if !logger.request_id().is_empty() => logger.request_id().to_string(),
        _ => headers
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string(),
    }
}

/// Holds a span open around an inner future and enters it on every poll.
///
/// If a poll of the inner future unwinds, the span is marked as failed when
/// the scope is dropped.
struct SpanScope<F> {
    span: Span,
    inner: Pin<Box<F>>,
    polling: bool,
}

impl<F> SpanScope<F> {
    fn new(span: Span, inner: F) -> Self {
        Self {
            span,
            inner: Box::pin(inner),
            polling: false,
        }
    }
}

impl<F: Future> Future for SpanScope<F> {
    type Output = F::Output;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        let _entered = this.span.enter();

        this.polling = true;
        let polled = this.inner.as_mut().poll(cx);
        this.polling = false;

        polled
    }
}

impl<F> Drop for SpanScope<F> {
    fn drop(&mut self) {
        if self.polling {
            self.span.record("otel.status_code", STATUS_ERROR);
            self.span.record("otel.status_message", "panic");
        }
    }
}

// ============================================================================
// Span Helpers
// ============================================================================

/// Mark the current request span as failed with `error`
pub fn record_error(error: &dyn std::error::Error) {
    let span = Span::current();
    span.record("otel.status_code", STATUS_ERROR);
    span.record("otel.status_message", error.to_string().as_str());
}

/// Add a domain attribute to the current span's exported data
pub fn set_attribute(key: &'static str, value: impl Into<Value>) {
    Span::current().set_attribute(key, value);
}

/// Add a named event to the current span
pub fn record_event(name: &str) {
    tracing::info!(message = name);
}

// ============================================================================
// Tests
// ============================================================================
