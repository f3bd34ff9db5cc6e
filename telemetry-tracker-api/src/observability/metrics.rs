//! Metrics registry for request and domain telemetry
//!
//! [`MetricsRegistry`] records into an explicit [`metrics::Recorder`] handle
//! owned by the observability provider. No global recorder is installed, so
//! every test can hand the registry its own recorder. Locally the recorder is
//! a Prometheus recorder rendered at `/metrics`; in `otel` mode it is an
//! [`OtelRecorder`] feeding an OTLP meter provider.
//!
//! # Metrics
//!
//! | Name | Kind | Labels |
//! |------|------|--------|
//! | `events_received_total` | counter | `event_type` |
//! | `events_stored_total` | counter | |
//! | `database_errors_total` | counter | |
//! | `http_requests_total` | counter | `method`, `status` |
//! | `http_request_duration_seconds` | histogram | `method`, `status` |
//! | `http_response_size_bytes` | histogram | `method`, `status` |
//! | `process_cpu_seconds_total` | counter | |
//! | `process_resident_memory_bytes` | gauge | |
//! | `process_open_fds` | gauge | |
//! | `process_start_time_seconds` | gauge | |

use axum::{
    extract::State,
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
};
use metrics::{
    Counter, CounterFn, Gauge, GaugeFn, Histogram, HistogramFn, Key, KeyName, Label, Level,
    Metadata, NoopRecorder, Recorder, SharedString, Unit,
};
use metrics_exporter_prometheus::{BuildError, Matcher, PrometheusBuilder, PrometheusRecorder};
use opentelemetry::{metrics as otel, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    metrics::{PeriodicReader, SdkMeterProvider},
    Resource,
};
use std::collections::HashMap;
use std::fmt;
#[cfg(target_os = "linux")]
use std::fs;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::provider::ObservabilityConfig;
use crate::AppState;

// ============================================================================
// Metric Names
// ============================================================================

pub const EVENTS_RECEIVED_TOTAL: &str = "events_received_total";
pub const EVENTS_STORED_TOTAL: &str = "events_stored_total";
pub const DATABASE_ERRORS_TOTAL: &str = "database_errors_total";
pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
pub const HTTP_RESPONSE_SIZE_BYTES: &str = "http_response_size_bytes";
pub const PROCESS_CPU_SECONDS_TOTAL: &str = "process_cpu_seconds_total";
pub const PROCESS_RESIDENT_MEMORY_BYTES: &str = "process_resident_memory_bytes";
pub const PROCESS_OPEN_FDS: &str = "process_open_fds";
pub const PROCESS_START_TIME_SECONDS: &str = "process_start_time_seconds";

/// How often process metrics are refreshed
pub const PROCESS_METRICS_INTERVAL: Duration = Duration::from_secs(5);

// USER_HZ on Linux
const CLOCK_TICKS_PER_SECOND: f64 = 100.0;

/// Request latency buckets, in seconds
pub const DURATION_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Response size buckets, 100 B to 10 MB
pub const RESPONSE_SIZE_BUCKETS: &[f64] = &[
    100.0,
    1_000.0,
    10_000.0,
    100_000.0,
    1_000_000.0,
    10_000_000.0,
];

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("Failed to build Prometheus recorder: {0}")]
    Build(#[from] BuildError),

    #[error("Failed to build OTLP metric exporter: {0}")]
    Exporter(String),
}

// ============================================================================
// Registry
// ============================================================================

/// Named counters and histograms for the ingestion service.
///
/// Cloning is cheap; all clones record into the same recorder. Every call
/// records exactly one increment or one sample.
#[derive(Clone)]
pub struct MetricsRegistry {
    recorder: Arc<dyn Recorder + Send + Sync>,
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

impl MetricsRegistry {
    pub fn new(recorder: Arc<dyn Recorder + Send + Sync>) -> Self {
        let registry = Self { recorder };
        registry.describe();
        registry
    }

    /// Registry that discards everything it records.
    pub fn noop() -> Self {
        Self::new(Arc::new(NoopRecorder))
    }

    fn describe(&self) {
        let counters = [
            (EVENTS_RECEIVED_TOTAL, "Total number of events received"),
            (EVENTS_STORED_TOTAL, "Total number of events successfully stored"),
            (DATABASE_ERRORS_TOTAL, "Total number of database errors"),
            (HTTP_REQUESTS_TOTAL, "Total number of HTTP requests"),
        ];
        for (name, help) in counters {
            self.recorder.describe_counter(
                KeyName::from(name),
                Some(Unit::Count),
                SharedString::from(help),
            );
        }

        self.recorder.describe_histogram(
            KeyName::from(HTTP_REQUEST_DURATION_SECONDS),
            Some(Unit::Seconds),
            SharedString::from("HTTP request duration in seconds"),
        );
        self.recorder.describe_histogram(
            KeyName::from(HTTP_RESPONSE_SIZE_BYTES),
            Some(Unit::Bytes),
            SharedString::from("HTTP response size in bytes"),
        );

        self.recorder.describe_counter(
            KeyName::from(PROCESS_CPU_SECONDS_TOTAL),
            Some(Unit::Seconds),
            SharedString::from("Total CPU time consumed by the process"),
        );
        self.recorder.describe_gauge(
            KeyName::from(PROCESS_RESIDENT_MEMORY_BYTES),
            Some(Unit::Bytes),
            SharedString::from("Resident memory size in bytes"),
        );
        self.recorder.describe_gauge(
            KeyName::from(PROCESS_OPEN_FDS),
            Some(Unit::Count),
            SharedString::from("Number of open file descriptors"),
        );
        self.recorder.describe_gauge(
            KeyName::from(PROCESS_START_TIME_SECONDS),
            Some(Unit::Seconds),
            SharedString::from("Process start time as Unix timestamp"),
        );
    }

    fn counter(&self, name: &'static str, labels: Vec<Label>) -> Counter {
        let metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));
        self.recorder
            .register_counter(&Key::from_parts(name, labels), &metadata)
    }

    fn gauge(&self, name: &'static str) -> Gauge {
        let metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));
        self.recorder
            .register_gauge(&Key::from_name(name), &metadata)
    }

    fn histogram(&self, name: &'static str, labels: Vec<Label>) -> Histogram {
        let metadata = Metadata::new(module_path!(), Level::INFO, Some(module_path!()));
        self.recorder
            .register_histogram(&Key::from_parts(name, labels), &metadata)
    }

    /// One event of `event_type` was accepted for processing.
    pub fn event_received(&self, event_type: &str) {
        self.counter(
            EVENTS_RECEIVED_TOTAL,
            vec![Label::new("event_type", event_type.to_string())],
        )
        .increment(1);
    }

    /// One event was persisted.
    pub fn event_stored(&self) {
        self.counter(EVENTS_STORED_TOTAL, Vec::new()).increment(1);
    }

    /// One storage operation failed.
    pub fn database_error(&self) {
        self.counter(DATABASE_ERRORS_TOTAL, Vec::new()).increment(1);
    }

    pub fn http_request(&self, method: &Method, status: StatusCode) {
        self.counter(HTTP_REQUESTS_TOTAL, http_labels(method, status))
            .increment(1);
    }

    pub fn http_request_duration(&self, method: &Method, status: StatusCode, elapsed: Duration) {
        self.histogram(HTTP_REQUEST_DURATION_SECONDS, http_labels(method, status))
            .record(elapsed.as_secs_f64());
    }

    pub fn http_response_size(&self, method: &Method, status: StatusCode, bytes: u64) {
        self.histogram(HTTP_RESPONSE_SIZE_BYTES, http_labels(method, status))
            .record(bytes as f64);
    }

    pub fn process_started(&self, started_at: SystemTime) {
        let since_epoch = started_at.duration_since(UNIX_EPOCH).unwrap_or_default();
        self.gauge(PROCESS_START_TIME_SECONDS)
            .set(since_epoch.as_secs_f64());
    }

    /// Record whichever process statistics could be read.
    pub fn process_stats(&self, stats: &ProcessStats) {
        if let Some(seconds) = stats.cpu_seconds {
            self.counter(PROCESS_CPU_SECONDS_TOTAL, Vec::new())
                .absolute(seconds as u64);
        }
        if let Some(bytes) = stats.resident_memory_bytes {
            self.gauge(PROCESS_RESIDENT_MEMORY_BYTES).set(bytes as f64);
        }
        if let Some(count) = stats.open_fds {
            self.gauge(PROCESS_OPEN_FDS).set(count as f64);
        }
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::noop()
    }
}

fn http_labels(method: &Method, status: StatusCode) -> Vec<Label> {
    vec![
        Label::new("method", method.as_str().to_string()),
        Label::new("status", status.as_u16().to_string()),
    ]
}

// ============================================================================
// Prometheus
// ============================================================================

fn prometheus_builder() -> Result<PrometheusBuilder, MetricsError> {
    Ok(PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(HTTP_REQUEST_DURATION_SECONDS.to_string()),
            DURATION_BUCKETS,
        )?
        .set_buckets_for_metric(
            Matcher::Full(HTTP_RESPONSE_SIZE_BYTES.to_string()),
            RESPONSE_SIZE_BUCKETS,
        )?)
}

/// Prometheus recorder rendered on demand through its handle.
pub fn prometheus_recorder() -> Result<PrometheusRecorder, MetricsError> {
    Ok(prometheus_builder()?.build_recorder())
}

/// Handler for `GET /metrics`
pub async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.prometheus() {
        Some(handle) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

// ============================================================================
// OpenTelemetry
// ============================================================================

/// Periodically exporting OTLP/gRPC meter provider for `config`.
pub(crate) fn build_meter_provider(
    config: &ObservabilityConfig,
    resource: Resource,
) -> Result<SdkMeterProvider, MetricsError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| MetricsError::Exporter(e.to_string()))?;

    let reader = PeriodicReader::builder(exporter, opentelemetry_sdk::runtime::Tokio)
        .with_interval(config.metrics_export_interval())
        .build();

    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build())
}

/// [`metrics::Recorder`] writing into OpenTelemetry instruments of one meter.
///
/// Each distinct key (name plus labels) gets one instrument handle; labels
/// become attributes. Counter `absolute` updates are exported as the increase
/// over the last value seen.
pub struct OtelRecorder {
    meter: otel::Meter,
    descriptions: Mutex<HashMap<String, (Option<Unit>, String)>>,
    counters: Mutex<HashMap<Key, Arc<OtelCounter>>>,
    gauges: Mutex<HashMap<Key, Arc<OtelGauge>>>,
    histograms: Mutex<HashMap<Key, Arc<OtelHistogram>>>,
}

impl OtelRecorder {
    pub fn new(meter: otel::Meter) -> Self {
        Self {
            meter,
            descriptions: Mutex::new(HashMap::new()),
            counters: Mutex::new(HashMap::new()),
            gauges: Mutex::new(HashMap::new()),
            histograms: Mutex::new(HashMap::new()),
        }
    }

    fn describe(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.descriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.as_str().to_string(), (unit, description.to_string()));
    }

    fn description(&self, name: &str) -> (String, String) {
        let descriptions = self.descriptions.lock().unwrap_or_else(PoisonError::into_inner);
        match descriptions.get(name) {
            Some((unit, description)) => (
                unit.map(otel_unit).unwrap_or_default().to_string(),
                description.clone(),
            ),
            None => (String::new(), String::new()),
        }
    }
}

impl fmt::Debug for OtelRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OtelRecorder").finish_non_exhaustive()
    }
}

impl Recorder for OtelRecorder {
    fn describe_counter(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.describe(key, unit, description);
    }

    fn describe_gauge(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.describe(key, unit, description);
    }

    fn describe_histogram(&self, key: KeyName, unit: Option<Unit>, description: SharedString) {
        self.describe(key, unit, description);
    }

    fn register_counter(&self, key: &Key, _metadata: &Metadata<'_>) -> Counter {
        let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = counters.entry(key.clone()).or_insert_with(|| {
            let (unit, description) = self.description(key.name());
            Arc::new(OtelCounter {
                instrument: self
                    .meter
                    .u64_counter(key.name().to_string())
                    .with_unit(unit)
                    .with_description(description)
                    .build(),
                attributes: attributes(key),
                total: AtomicU64::new(0),
            })
        });
        Counter::from_arc(handle.clone())
    }

    fn register_gauge(&self, key: &Key, _metadata: &Metadata<'_>) -> Gauge {
        let mut gauges = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = gauges.entry(key.clone()).or_insert_with(|| {
            let (unit, description) = self.description(key.name());
            Arc::new(OtelGauge {
                instrument: self
                    .meter
                    .f64_gauge(key.name().to_string())
                    .with_unit(unit)
                    .with_description(description)
                    .build(),
                attributes: attributes(key),
                value: AtomicU64::new(0f64.to_bits()),
            })
        });
        Gauge::from_arc(handle.clone())
    }

    fn register_histogram(&self, key: &Key, _metadata: &Metadata<'_>) -> Histogram {
        let mut histograms = self.histograms.lock().unwrap_or_else(PoisonError::into_inner);
        let handle = histograms.entry(key.clone()).or_insert_with(|| {
            let (unit, description) = self.description(key.name());
            let mut builder = self
                .meter
                .f64_histogram(key.name().to_string())
                .with_unit(unit)
                .with_description(description);
            if let Some(buckets) = buckets_for(key.name()) {
                builder = builder.with_boundaries(buckets.to_vec());
            }
            Arc::new(OtelHistogram {
                instrument: builder.build(),
                attributes: attributes(key),
            })
        });
        Histogram::from_arc(handle.clone())
    }
}

struct OtelCounter {
    instrument: otel::Counter<u64>,
    attributes: Vec<KeyValue>,
    total: AtomicU64,
}

impl CounterFn for OtelCounter {
    fn increment(&self, value: u64) {
        self.total.fetch_add(value, Ordering::Relaxed);
        self.instrument.add(value, &self.attributes);
    }

    fn absolute(&self, value: u64) {
        let previous = self.total.fetch_max(value, Ordering::Relaxed);
        if value > previous {
            self.instrument.add(value - previous, &self.attributes);
        }
    }
}

struct OtelGauge {
    instrument: otel::Gauge<f64>,
    attributes: Vec<KeyValue>,
    value: AtomicU64,
}

impl OtelGauge {
    fn update(&self, f: impl Fn(f64) -> f64) {
        let mut current = self.value.load(Ordering::Relaxed);
        loop {
            let next = f(f64::from_bits(current));
            match self.value.compare_exchange_weak(
                current,
                next.to_bits(),
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    self.instrument.record(next, &self.attributes);
                    return;
                }
                Err(actual) => current = actual,
            }
        }
    }
}

impl GaugeFn for OtelGauge {
    fn increment(&self, value: f64) {
        self.update(|current| current + value);
    }

    fn decrement(&self, value: f64) {
        self.update(|current| current - value);
    }

    fn set(&self, value: f64) {
        self.update(|_| value);
    }
}

struct OtelHistogram {
    instrument: otel::Histogram<f64>,
    attributes: Vec<KeyValue>,
}

impl HistogramFn for OtelHistogram {
    fn record(&self, value: f64) {
        self.instrument.record(value, &self.attributes);
    }
}

fn attributes(key: &Key) -> Vec<KeyValue> {
    key.labels()
        .map(|label| KeyValue::new(label.key().to_string(), label.value().to_string()))
        .collect()
}

fn buckets_for(name: &str) -> Option<&'static [f64]> {
    match name {
        HTTP_REQUEST_DURATION_SECONDS => Some(DURATION_BUCKETS),
        HTTP_RESPONSE_SIZE_BYTES => Some(RESPONSE_SIZE_BUCKETS),
        _ => None,
    }
}

// UCUM units as OpenTelemetry expects them
fn otel_unit(unit: Unit) -> &'static str {
    match unit {
        Unit::Seconds => "s",
        Unit::Bytes => "By",
        Unit::Count => "1",
        other => other.as_canonical_label(),
    }
}

// ============================================================================
// Process Metrics
// ============================================================================

/// Point-in-time resource usage of this process. Fields the platform cannot
/// report are `None`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ProcessStats {
    pub cpu_seconds: Option<f64>,
    pub resident_memory_bytes: Option<u64>,
    pub open_fds: Option<u64>,
}

impl ProcessStats {
    #[cfg(target_os = "linux")]
    pub fn collect() -> Self {
        Self {
            cpu_seconds: fs::read_to_string("/proc/self/stat")
                .ok()
                .and_then(|stat| parse_cpu_seconds(&stat)),
            resident_memory_bytes: fs::read_to_string("/proc/self/status")
                .ok()
                .and_then(|status| parse_resident_memory(&status)),
            open_fds: fs::read_dir("/proc/self/fd")
                .ok()
                .map(|entries| entries.count() as u64),
        }
    }

    #[cfg(not(target_os = "linux"))]
    pub fn collect() -> Self {
        Self::default()
    }
}

/// User plus system CPU time from the contents of `/proc/<pid>/stat`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_cpu_seconds(stat: &str) -> Option<f64> {
    // The command name may contain spaces; fields resume after its ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) as f64 / CLOCK_TICKS_PER_SECOND)
}

/// `VmRSS` in bytes from the contents of `/proc/<pid>/status`
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
fn parse_resident_memory(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

fn process_start_time() -> SystemTime {
    static STARTED: OnceLock<SystemTime> = OnceLock::new();
    *STARTED.get_or_init(SystemTime::now)
}

/// Record the process start time, then refresh process statistics every
/// `interval` until the returned task is aborted.
///
/// Must be called from within a Tokio runtime.
pub fn spawn_process_collector(metrics: MetricsRegistry, interval: Duration) -> JoinHandle<()> {
    metrics.process_started(process_start_time());

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            metrics.process_stats(&ProcessStats::collect());
        }
    })
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use metrics_util::debugging::{DebugValue, DebuggingRecorder, Snapshotter};
    use opentelemetry::metrics::MeterProvider as _;
    use opentelemetry_sdk::metrics::{
        data::{self, ResourceMetrics},
        reader::MetricReader,
        InstrumentKind, ManualReader, MetricResult, Pipeline, Temporality,
    };
    use pretty_assertions::assert_eq;
    use std::sync::Weak;

    fn registry() -> (MetricsRegistry, Snapshotter) {
        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        (MetricsRegistry::new(Arc::new(recorder)), snapshotter)
    }

    /// `DebugValue` does not implement `Clone` in metrics-util 0.17
    fn clone_debug_value(value: &DebugValue) -> DebugValue {
        match value {
            DebugValue::Counter(n) => DebugValue::Counter(*n),
            DebugValue::Gauge(v) => DebugValue::Gauge(*v),
            DebugValue::Histogram(samples) => DebugValue::Histogram(samples.clone()),
        }
    }

    fn values(snapshotter: &Snapshotter, name: &str) -> Vec<(Vec<(String, String)>, DebugValue)> {
        snapshotter
            .snapshot()
            .into_vec()
            .into_iter()
            .filter(|(key, _, _, _)| key.key().name() == name)
            .map(|(key, _, _, value)| {
                let labels = key
                    .key()
                    .labels()
                    .map(|l| (l.key().to_string(), l.value().to_string()))
                    .collect();
                (labels, value)
            })
            .collect()
    }

    #[test]
    fn test_event_received_is_labeled_by_type() {
        let (metrics, snapshotter) = registry();

        metrics.event_received("login");
        metrics.event_received("login");
        metrics.event_received("logout");

        let mut recorded = values(&snapshotter, EVENTS_RECEIVED_TOTAL);
        recorded.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            recorded,
            vec![
                (
                    vec![("event_type".to_string(), "login".to_string())],
                    DebugValue::Counter(2)
                ),
                (
                    vec![("event_type".to_string(), "logout".to_string())],
                    DebugValue::Counter(1)
                ),
            ]
        );
    }

    #[test]
    fn test_unlabeled_domain_counters() {
        let (metrics, snapshotter) = registry();

        metrics.event_stored();
        metrics.database_error();
        metrics.database_error();

        assert_eq!(
            values(&snapshotter, EVENTS_STORED_TOTAL),
            vec![(vec![], DebugValue::Counter(1))]
        );
        assert_eq!(
            values(&snapshotter, DATABASE_ERRORS_TOTAL),
            vec![(vec![], DebugValue::Counter(2))]
        );
    }

    #[test]
    fn test_http_metrics_share_method_and_status_labels() {
        let (metrics, snapshotter) = registry();
        let labels = vec![
            ("method".to_string(), "POST".to_string()),
            ("status".to_string(), "202".to_string()),
        ];

        metrics.http_request(&Method::POST, StatusCode::ACCEPTED);
        metrics.http_request_duration(&Method::POST, StatusCode::ACCEPTED, Duration::from_millis(250));
        metrics.http_response_size(&Method::POST, StatusCode::ACCEPTED, 20);

        let snapshot = snapshotter.snapshot().into_vec();
        let find = |name: &str| {
            snapshot
                .iter()
                .find(|(key, _, _, _)| key.key().name() == name)
                .map(|(key, _, _, value)| {
                    let found: Vec<(String, String)> = key
                        .key()
                        .labels()
                        .map(|l| (l.key().to_string(), l.value().to_string()))
                        .collect();
                    (found, clone_debug_value(value))
                })
                .expect("metric recorded")
        };

        let (found, value) = find(HTTP_REQUESTS_TOTAL);
        assert_eq!(found, labels);
        assert_eq!(value, DebugValue::Counter(1));

        let (found, value) = find(HTTP_REQUEST_DURATION_SECONDS);
        assert_eq!(found, labels);
        match value {
            DebugValue::Histogram(samples) => {
                assert_eq!(samples.len(), 1);
                assert!((samples[0].into_inner() - 0.25).abs() < f64::EPSILON);
            }
            other => panic!("unexpected value {:?}", other),
        }

        let (_, value) = find(HTTP_RESPONSE_SIZE_BYTES);
        match value {
            DebugValue::Histogram(samples) => assert_eq!(samples.len(), 1),
            other => panic!("unexpected value {:?}", other),
        }
    }

    #[test]
    fn test_concurrent_increments_are_not_lost() {
        let (metrics, snapshotter) = registry();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let metrics = metrics.clone();
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        metrics.http_request(&Method::GET, StatusCode::OK);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(
            values(&snapshotter, HTTP_REQUESTS_TOTAL)[0].1,
            DebugValue::Counter(8_000)
        );
    }

    #[test]
    fn test_prometheus_render_uses_configured_buckets() {
        let recorder = prometheus_recorder().unwrap();
        let handle = recorder.handle();
        let metrics = MetricsRegistry::new(Arc::new(recorder));

        metrics.http_response_size(&Method::GET, StatusCode::OK, 512);
        metrics.event_stored();

        let rendered = handle.render();
        assert!(rendered.contains("http_response_size_bytes_bucket"));
        assert!(rendered.contains("le=\"1000\""));
        assert!(rendered.contains("events_stored_total 1"));
    }

    #[test]
    fn test_parse_cpu_seconds_skips_command_name() {
        let stat = "1234 (tele metry) S 1 1234 1234 0 -1 4194560 100 0 0 0 250 150 0 0 20 0";
        assert_eq!(parse_cpu_seconds(stat), Some(4.0));
        assert_eq!(parse_cpu_seconds("garbage"), None);
    }

    #[test]
    fn test_parse_resident_memory() {
        let status = "Name:\ttelemetry\nVmPeak:\t  9000 kB\nVmRSS:\t  2048 kB\n";
        assert_eq!(parse_resident_memory(status), Some(2048 * 1024));
        assert_eq!(parse_resident_memory("Name:\ttelemetry\n"), None);
    }

    #[test]
    fn test_process_stats_skip_missing_values() {
        let (metrics, snapshotter) = registry();

        metrics.process_stats(&ProcessStats {
            cpu_seconds: Some(3.5),
            resident_memory_bytes: Some(4096),
            open_fds: None,
        });

        let snapshot = snapshotter.snapshot().into_vec();
        let value = |name: &str| {
            snapshot
                .iter()
                .find(|(key, _, _, _)| key.key().name() == name)
                .map(|(_, _, _, value)| clone_debug_value(value))
        };

        assert_eq!(value(PROCESS_CPU_SECONDS_TOTAL), Some(DebugValue::Counter(3)));
        match value(PROCESS_RESIDENT_MEMORY_BYTES) {
            Some(DebugValue::Gauge(bytes)) => assert_eq!(bytes.into_inner(), 4096.0),
            other => panic!("unexpected value {:?}", other),
        }
        assert_eq!(value(PROCESS_OPEN_FDS), None);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_collect_reads_proc() {
        let stats = ProcessStats::collect();
        assert!(stats.cpu_seconds.is_some());
        assert!(stats.resident_memory_bytes.unwrap_or_default() > 0);
        assert!(stats.open_fds.unwrap_or_default() > 0);
    }

    #[tokio::test]
    async fn test_process_collector_records_start_time() {
        let (metrics, snapshotter) = registry();

        let collector = spawn_process_collector(metrics, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(50)).await;
        collector.abort();

        let snapshot = snapshotter.snapshot().into_vec();
        let start = snapshot
            .iter()
            .find(|(key, _, _, _)| key.key().name() == PROCESS_START_TIME_SECONDS)
            .map(|(_, _, _, value)| value.clone());
        match start {
            Some(DebugValue::Gauge(seconds)) => assert!(seconds.into_inner() > 0.0),
            other => panic!("unexpected value {:?}", other),
        }
    }

    // ===== OpenTelemetry bridge =====

    #[derive(Debug, Clone, Default)]
    struct SharedReader(Arc<ManualReader>);

    impl MetricReader for SharedReader {
        fn register_pipeline(&self, pipeline: Weak<Pipeline>) {
            self.0.register_pipeline(pipeline)
        }

        fn collect(&self, rm: &mut ResourceMetrics) -> MetricResult<()> {
            self.0.collect(rm)
        }

        fn force_flush(&self) -> MetricResult<()> {
            self.0.force_flush()
        }

        fn shutdown(&self) -> MetricResult<()> {
            self.0.shutdown()
        }

        fn temporality(&self, kind: InstrumentKind) -> Temporality {
            self.0.temporality(kind)
        }
    }

    fn otel_registry() -> (MetricsRegistry, SharedReader, SdkMeterProvider) {
        let reader = SharedReader::default();
        let provider = SdkMeterProvider::builder()
            .with_reader(reader.clone())
            .build();
        let recorder = OtelRecorder::new(provider.meter("telemetry-tracker-test"));
        (MetricsRegistry::new(Arc::new(recorder)), reader, provider)
    }

    fn collect(reader: &SharedReader) -> ResourceMetrics {
        let mut metrics = ResourceMetrics {
            resource: Resource::empty(),
            scope_metrics: Vec::new(),
        };
        reader.collect(&mut metrics).unwrap();
        metrics
    }

    fn find<'a>(metrics: &'a ResourceMetrics, name: &str) -> &'a data::Metric {
        metrics
            .scope_metrics
            .iter()
            .flat_map(|scope| scope.metrics.iter())
            .find(|metric| metric.name == name)
            .unwrap_or_else(|| panic!("{} not exported", name))
    }

    #[test]
    fn test_otel_recorder_exports_counters_with_labels() {
        let (metrics, reader, _provider) = otel_registry();

        metrics.event_received("login");
        metrics.event_received("login");
        metrics.http_request(&Method::POST, StatusCode::ACCEPTED);

        let exported = collect(&reader);

        let received = find(&exported, EVENTS_RECEIVED_TOTAL);
        assert_eq!(received.description, "Total number of events received");
        let sum = received
            .data
            .as_any()
            .downcast_ref::<data::Sum<u64>>()
            .expect("counter exported as sum");
        assert_eq!(sum.data_points.len(), 1);
        assert_eq!(sum.data_points[0].value, 2);
        assert_eq!(
            sum.data_points[0].attributes,
            vec![KeyValue::new("event_type", "login")]
        );

        let requests = find(&exported, HTTP_REQUESTS_TOTAL)
            .data
            .as_any()
            .downcast_ref::<data::Sum<u64>>()
            .expect("counter exported as sum");
        let mut attributes = requests.data_points[0].attributes.clone();
        attributes.sort_by(|a, b| a.key.as_str().cmp(b.key.as_str()));
        assert_eq!(
            attributes,
            vec![
                KeyValue::new("method", "POST"),
                KeyValue::new("status", "202"),
            ]
        );
    }

    #[test]
    fn test_otel_recorder_uses_configured_buckets() {
        let (metrics, reader, _provider) = otel_registry();

        metrics.http_request_duration(&Method::GET, StatusCode::OK, Duration::from_millis(30));

        let exported = collect(&reader);
        let metric = find(&exported, HTTP_REQUEST_DURATION_SECONDS);
        assert_eq!(metric.unit, "s");

        let histogram = metric
            .data
            .as_any()
            .downcast_ref::<data::Histogram<f64>>()
            .expect("histogram exported");
        assert_eq!(histogram.data_points[0].count, 1);
        assert_eq!(histogram.data_points[0].bounds, DURATION_BUCKETS.to_vec());
    }

    #[test]
    fn test_otel_counter_absolute_exports_increase() {
        let (metrics, reader, _provider) = otel_registry();

        for seconds in [5.0, 8.0, 3.0] {
            metrics.process_stats(&ProcessStats {
                cpu_seconds: Some(seconds),
                ..ProcessStats::default()
            });
        }

        let exported = collect(&reader);
        let sum = find(&exported, PROCESS_CPU_SECONDS_TOTAL)
            .data
            .as_any()
            .downcast_ref::<data::Sum<u64>>()
            .expect("counter exported as sum");
        assert_eq!(sum.data_points[0].value, 8);
    }

    #[test]
    fn test_otel_gauge_reports_last_value() {
        let (metrics, reader, _provider) = otel_registry();

        metrics.process_stats(&ProcessStats {
            open_fds: Some(12),
            ..ProcessStats::default()
        });
        metrics.process_stats(&ProcessStats {
            open_fds: Some(9),
            ..ProcessStats::default()
        });

        let exported = collect(&reader);
        let gauge = find(&exported, PROCESS_OPEN_FDS)
            .data
            .as_any()
            .downcast_ref::<data::Gauge<f64>>()
            .expect("gauge exported");
        assert_eq!(gauge.data_points[0].value, 9.0);
    }
}
