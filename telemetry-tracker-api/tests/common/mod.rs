//! Shared fixtures for the API integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use axum::{body::Body, http::Request, Router};
use http_body_util::BodyExt;
use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use telemetry_tracker_api::{AppState, MetricsRegistry};
use telemetry_tracker_core::{Event, EventStore, StoreError};
use tower::ServiceExt;
use tracing::{
    field::{Field, Visit},
    span, Level, Subscriber,
};
use tracing_subscriber::{layer::Context, layer::SubscriberExt, registry::LookupSpan, Layer};

pub const LOGIN_EVENT: &str =
    r#"{"event_type":"login","timestamp":"2024-03-28T12:34:56Z","data":{"user":"test"}}"#;

// ===== Event store =====

/// In-memory store that either accepts or rejects every event
#[derive(Default)]
pub struct StubStore {
    pub fail: bool,
    pub calls: AtomicUsize,
}

impl StubStore {
    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            fail: true,
            ..Self::default()
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventStore for StubStore {
    async fn store(&self, _event: &Event) -> Result<(), StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            Err(StoreError::Database("connection refused".to_string()))
        } else {
            Ok(())
        }
    }
}

// ===== Metrics =====

pub fn debugging_metrics() -> (MetricsRegistry, Snapshotter) {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    (MetricsRegistry::new(Arc::new(recorder)), snapshotter)
}

/// Everything recorded up to one point in time.
///
/// A debugging snapshot drains histogram samples, so each test takes one
/// snapshot and asserts every metric against it.
pub struct Recorded {
    values: Vec<(String, Vec<String>, DebugValue)>,
}

impl Recorded {
    pub fn take(snapshotter: &Snapshotter) -> Self {
        let values = snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .map(|(key, _, _, value)| {
                let mut labels: Vec<String> = key
                    .key()
                    .labels()
                    .map(|l| format!("{}={}", l.key(), l.value()))
                    .collect();
                labels.sort();
                (key.key().name().to_string(), labels, value)
            })
            .collect();
        Self { values }
    }

    /// Recorded values of `name`, with labels as sorted `key=value` pairs
    pub fn metric(&self, name: &str) -> Vec<(Vec<String>, DebugValue)> {
        self.values
            .iter()
            .filter(|(metric, _, _)| metric == name)
            .map(|(_, labels, value)| (labels.clone(), clone_debug_value(value)))
            .collect()
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.metric(name)
            .into_iter()
            .map(|(_, value)| match value {
                DebugValue::Counter(n) => n,
                other => panic!("{} is not a counter: {:?}", name, other),
            })
            .sum()
    }

    pub fn histogram_samples(&self, name: &str) -> usize {
        self.metric(name)
            .into_iter()
            .map(|(_, value)| match value {
                DebugValue::Histogram(samples) => samples.len(),
                other => panic!("{} is not a histogram: {:?}", name, other),
            })
            .sum()
    }
}

/// `DebugValue` does not implement `Clone` in metrics-util 0.17
fn clone_debug_value(value: &DebugValue) -> DebugValue {
    match value {
        DebugValue::Counter(n) => DebugValue::Counter(*n),
        DebugValue::Gauge(v) => DebugValue::Gauge(*v),
        DebugValue::Histogram(samples) => DebugValue::Histogram(samples.clone()),
    }
}

// ===== Log capture =====

#[derive(Debug, Clone)]
pub struct CapturedEvent {
    pub level: Level,
    pub message: String,
    pub fields: HashMap<String, String>,
}

impl CapturedEvent {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct CapturedSpan {
    pub name: String,
    pub fields: HashMap<String, String>,
}

impl CapturedSpan {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Layer recording every event and every closed span with its fields
#[derive(Clone, Default)]
pub struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
    closed_spans: Arc<Mutex<Vec<CapturedSpan>>>,
}

impl CaptureLayer {
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn with_message(&self, message: &str) -> Vec<CapturedEvent> {
        self.events()
            .into_iter()
            .filter(|e| e.message == message)
            .collect()
    }

    pub fn closed_spans(&self) -> Vec<String> {
        self.closed_spans
            .lock()
            .unwrap()
            .iter()
            .map(|span| span.name.clone())
            .collect()
    }

    pub fn closed_spans_named(&self, name: &str) -> Vec<CapturedSpan> {
        self.closed_spans
            .lock()
            .unwrap()
            .iter()
            .filter(|span| span.name == name)
            .cloned()
            .collect()
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: HashMap<String, String>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: String) {
        if field.name() == "message" {
            self.message = value;
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value.to_string());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value.to_string());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        self.insert(field, format!("{:?}", value));
    }
}

impl<S> Layer<S> for CaptureLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            message: visitor.message,
            fields: visitor.fields,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            if let Some(visitor) = span.extensions_mut().get_mut::<FieldVisitor>() {
                values.record(visitor);
            }
        }
    }

    fn on_close(&self, id: span::Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(&id) {
            let fields = span
                .extensions()
                .get::<FieldVisitor>()
                .map(|visitor| visitor.fields.clone())
                .unwrap_or_default();
            self.closed_spans.lock().unwrap().push(CapturedSpan {
                name: span.name().to_string(),
                fields,
            });
        }
    }
}

/// Install a capturing subscriber on the current thread.
pub fn capture_logs() -> (CaptureLayer, tracing::subscriber::DefaultGuard) {
    let layer = CaptureLayer::default();
    let subscriber = tracing_subscriber::registry().with(layer.clone());
    let guard = tracing::subscriber::set_default(subscriber);
    (layer, guard)
}

// ===== HTTP =====

pub fn state(store: Arc<StubStore>, metrics: MetricsRegistry) -> AppState {
    AppState::new(store, metrics, None)
}

pub fn post_event(body: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/events")
        .header("content-type", "application/json")
        .header("user-agent", "integration-test")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

/// Send `request` and read the whole body, so completion telemetry has run
/// by the time this returns.
pub async fn send(app: Router, request: Request<Body>) -> (axum::http::StatusCode, axum::http::HeaderMap, String) {
    let response = app.oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, headers, String::from_utf8(body.to_vec()).unwrap())
}
