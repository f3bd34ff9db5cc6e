//! Observability provider lifecycle
//!
//! [`ObservabilityProvider`] owns the process logger (a `tracing` dispatcher),
//! the tracer, the metrics registry and the telemetry exporters. It is built
//! once at startup and handed to every component that records telemetry.
//!
//! Lifecycle: `Ready -> ShuttingDown -> Terminated`. [`ObservabilityProvider::init`]
//! is all-or-nothing, so a provider value only exists once it is `Ready`.
//! Shutdown drains every exporter concurrently within one deadline and
//! reports every failure.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use telemetry_tracker_api::observability::{
//!     ObservabilityConfig, ObservabilityMode, ObservabilityProvider,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = ObservabilityConfig::builder()
//!     .mode(ObservabilityMode::Otel)
//!     .service_name("telemetry-tracker")
//!     .otlp_endpoint("http://localhost:4317")
//!     .build();
//!
//! let provider = ObservabilityProvider::init(config).await?;
//! provider.install_global()?;
//!
//! // ... serve ...
//!
//! provider.shutdown(Duration::from_secs(15)).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures::future::join_all;
use metrics::{NoopRecorder, Recorder};
use metrics_exporter_prometheus::PrometheusHandle;
use opentelemetry::{metrics::MeterProvider as _, KeyValue};
use opentelemetry_sdk::{
    logs::LoggerProvider, metrics::SdkMeterProvider, trace::Tracer, trace::TracerProvider,
    Resource,
};
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{info, warn, Dispatch};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::Layered, layer::SubscriberExt, EnvFilter, Layer, Registry,
};

use super::logging::{build_logger_provider, fmt_layer, log_bridge_layer, LogFormat};
use super::metrics::{
    build_meter_provider, prometheus_recorder, spawn_process_collector, MetricsError,
    MetricsRegistry, OtelRecorder, PROCESS_METRICS_INTERVAL,
};
use super::tracing::{build_tracer_provider, otel_layer, tracer};
use crate::middleware::recovery::install_panic_hook;

const SERVICE_NAME: &str = "service.name";
const SERVICE_VERSION: &str = "service.version";
const DEPLOYMENT_ENVIRONMENT: &str = "deployment.environment";

const DEFAULT_OTLP_ENDPOINT: &str = "http://otel-collector:4317";

const METER_NAME: &str = env!("CARGO_PKG_NAME");

// ============================================================================
// Errors
// ============================================================================

/// Errors raised while building the provider
#[derive(Error, Debug)]
pub enum ObservabilityError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to initialize trace exporter: {0}")]
    TraceExporter(String),

    #[error("Failed to initialize log exporter: {0}")]
    LogExporter(String),

    #[error("Failed to initialize metrics exporter: {0}")]
    MetricsExporter(#[from] MetricsError),

    #[error("Failed to install subscriber: {0}")]
    Subscriber(String),

    #[error("Observability provider is shutting down or terminated")]
    Terminated,
}

/// Failure of a single exporter shutdown
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExporterError {
    #[error("{0}")]
    Failed(String),

    #[error("timed out after {0:?}")]
    TimedOut(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExporterFailure {
    pub exporter: String,
    pub error: ExporterError,
}

/// Every exporter failure collected during one shutdown
#[derive(Error, Debug, Clone)]
pub struct ShutdownError {
    failures: Vec<ExporterFailure>,
}

impl ShutdownError {
    pub fn failures(&self) -> &[ExporterFailure] {
        &self.failures
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} telemetry exporter(s) failed to shut down", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "; {}: {}", failure.exporter, failure.error)?;
        }
        Ok(())
    }
}

// ============================================================================
// Configuration
// ============================================================================

/// Which telemetry the provider produces and where it goes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObservabilityMode {
    /// OTLP export of traces, logs and metrics
    Otel,
    /// Local output at debug level, span timings logged
    Debug,
    /// Local output at info level
    #[default]
    Local,
    /// Warnings and errors only, metrics discarded
    Noop,
}

impl ObservabilityMode {
    /// Log level used when neither `RUST_LOG` nor a filter is configured
    pub fn default_level(self) -> &'static str {
        match self {
            Self::Otel | Self::Local => "info",
            Self::Debug => "debug",
            Self::Noop => "warn",
        }
    }
}

impl FromStr for ObservabilityMode {
    type Err = ObservabilityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "otel" => Ok(Self::Otel),
            "debug" => Ok(Self::Debug),
            "local" => Ok(Self::Local),
            "noop" => Ok(Self::Noop),
            other => Err(ObservabilityError::Config(format!(
                "unknown observability mode '{}'",
                other
            ))),
        }
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub mode: ObservabilityMode,

    /// Service name (e.g., "telemetry-tracker")
    pub service_name: String,

    /// Service version (e.g., "1.0.0")
    pub service_version: String,

    /// Deployment environment (e.g., "production", "staging", "development")
    pub environment: String,

    /// OTLP/gRPC collector endpoint (e.g., "http://localhost:4317")
    pub otlp_endpoint: String,

    /// How often metrics are pushed to the collector in `otel` mode
    pub metrics_export_interval_secs: u64,

    pub log_format: LogFormat,

    /// Filter directives (e.g., "info,sqlx=warn"); `RUST_LOG` takes precedence
    pub log_filter: Option<String>,

    /// Sampling rate (0.0 to 1.0)
    pub sampling_rate: f64,

    pub shutdown_timeout_secs: u64,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            mode: ObservabilityMode::default(),
            service_name: "telemetry-tracker".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),
            otlp_endpoint: env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or_else(|_| DEFAULT_OTLP_ENDPOINT.to_string()),
            metrics_export_interval_secs: 60,
            log_format: LogFormat::default(),
            log_filter: None,
            sampling_rate: 1.0,
            shutdown_timeout_secs: 15,
        }
    }
}

impl ObservabilityConfig {
    pub fn builder() -> ObservabilityConfigBuilder {
        ObservabilityConfigBuilder::default()
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn metrics_export_interval(&self) -> Duration {
        Duration::from_secs(self.metrics_export_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ObservabilityError> {
        if self.service_name.trim().is_empty() {
            return Err(ObservabilityError::Config(
                "service_name cannot be empty".to_string(),
            ));
        }

        if !(0.0..=1.0).contains(&self.sampling_rate) {
            return Err(ObservabilityError::Config(format!(
                "sampling_rate must be between 0.0 and 1.0, got {}",
                self.sampling_rate
            )));
        }

        if self.mode == ObservabilityMode::Otel
            && !(self.otlp_endpoint.starts_with("http://")
                || self.otlp_endpoint.starts_with("https://"))
        {
            return Err(ObservabilityError::Config(format!(
                "otlp_endpoint must be an http(s) URL, got '{}'",
                self.otlp_endpoint
            )));
        }

        if self.shutdown_timeout_secs == 0 {
            return Err(ObservabilityError::Config(
                "shutdown_timeout_secs must be greater than zero".to_string(),
            ));
        }

        if self.metrics_export_interval_secs == 0 {
            return Err(ObservabilityError::Config(
                "metrics_export_interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

/// Builder for [`ObservabilityConfig`]
#[derive(Debug, Default)]
pub struct ObservabilityConfigBuilder {
    config: ObservabilityConfig,
}

impl ObservabilityConfigBuilder {
    pub fn mode(mut self, mode: ObservabilityMode) -> Self {
        self.config.mode = mode;
        self
    }

    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.config.service_name = name.into();
        self
    }

    pub fn service_version(mut self, version: impl Into<String>) -> Self {
        self.config.service_version = version.into();
        self
    }

    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.config.environment = environment.into();
        self
    }

    pub fn otlp_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.otlp_endpoint = endpoint.into();
        self
    }

    pub fn metrics_export_interval(mut self, interval: Duration) -> Self {
        self.config.metrics_export_interval_secs = interval.as_secs();
        self
    }

    pub fn log_format(mut self, format: LogFormat) -> Self {
        self.config.log_format = format;
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.config.log_filter = Some(filter.into());
        self
    }

    pub fn sampling_rate(mut self, rate: f64) -> Self {
        self.config.sampling_rate = rate;
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.shutdown_timeout_secs = timeout.as_secs();
        self
    }

    pub fn build(self) -> ObservabilityConfig {
        self.config
    }
}

// ============================================================================
// Exporters
// ============================================================================

/// A telemetry sink the provider drains at shutdown
#[async_trait]
pub trait TelemetryExporter: Send + Sync {
    /// Name used in logs and shutdown failures (e.g., "traces")
    fn name(&self) -> &str;

    /// Flush buffered telemetry and release the exporter
    async fn shutdown(&self) -> Result<(), ExporterError>;
}

struct TraceExporter {
    provider: TracerProvider,
}

#[async_trait]
impl TelemetryExporter for TraceExporter {
    fn name(&self) -> &str {
        "traces"
    }

    async fn shutdown(&self) -> Result<(), ExporterError> {
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .map_err(|e| ExporterError::Failed(e.to_string()))?
            .map_err(|e| ExporterError::Failed(e.to_string()))
    }
}

struct LogExporter {
    provider: LoggerProvider,
}

#[async_trait]
impl TelemetryExporter for LogExporter {
    fn name(&self) -> &str {
        "logs"
    }

    async fn shutdown(&self) -> Result<(), ExporterError> {
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .map_err(|e| ExporterError::Failed(e.to_string()))?
            .map_err(|e| ExporterError::Failed(e.to_string()))
    }
}

struct MetricsExporter {
    provider: SdkMeterProvider,
}

#[async_trait]
impl TelemetryExporter for MetricsExporter {
    fn name(&self) -> &str {
        "metrics"
    }

    async fn shutdown(&self) -> Result<(), ExporterError> {
        let provider = self.provider.clone();
        tokio::task::spawn_blocking(move || provider.shutdown())
            .await
            .map_err(|e| ExporterError::Failed(e.to_string()))?
            .map_err(|e| ExporterError::Failed(e.to_string()))
    }
}

// ============================================================================
// Provider
// ============================================================================

/// Lifecycle state of an [`ObservabilityProvider`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProviderState {
    Ready = 0,
    ShuttingDown = 1,
    Terminated = 2,
}

impl ProviderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::ShuttingDown,
            _ => Self::Terminated,
        }
    }
}

type BaseSubscriber = Layered<EnvFilter, Registry>;
type BoxedLayer = Box<dyn Layer<BaseSubscriber> + Send + Sync>;

/// Logger, tracer, meter and exporters of the process
pub struct ObservabilityProvider {
    mode: ObservabilityMode,
    dispatch: Dispatch,
    tracer: Option<Tracer>,
    metrics: MetricsRegistry,
    prometheus: Option<PrometheusHandle>,
    exporters: Mutex<Vec<Arc<dyn TelemetryExporter>>>,
    process_collector: std::sync::Mutex<Option<JoinHandle<()>>>,
    state: AtomicU8,
}

impl fmt::Debug for ObservabilityProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObservabilityProvider")
            .field("mode", &self.mode)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl ObservabilityProvider {
    /// Build every handle and exporter `config.mode` calls for.
    ///
    /// Fails without side effects on the process if any exporter cannot be
    /// constructed. Must be called from within a Tokio runtime.
    pub async fn init(config: ObservabilityConfig) -> Result<Self, ObservabilityError> {
        config.validate()?;

        let filter = match EnvFilter::try_from_default_env() {
            Ok(filter) => filter,
            Err(_) => EnvFilter::try_new(
                config
                    .log_filter
                    .as_deref()
                    .unwrap_or(config.mode.default_level()),
            )
            .map_err(|e| ObservabilityError::Config(e.to_string()))?,
        };

        let span_events = match config.mode {
            ObservabilityMode::Debug => FmtSpan::CLOSE,
            _ => FmtSpan::NONE,
        };

        let mut layers: Vec<BoxedLayer> = vec![fmt_layer(config.log_format, span_events)];
        let mut exporters: Vec<Arc<dyn TelemetryExporter>> = Vec::new();
        let mut tracer_handle = None;

        let (recorder, prometheus): (Arc<dyn Recorder + Send + Sync>, Option<PrometheusHandle>) =
            match config.mode {
                ObservabilityMode::Otel => {
                    let resource = Resource::new(vec![
                        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
                        KeyValue::new(SERVICE_VERSION, config.service_version.clone()),
                        KeyValue::new(DEPLOYMENT_ENVIRONMENT, config.environment.clone()),
                    ]);

                    let tracer_provider = build_tracer_provider(&config, resource.clone())?;
                    let logger_provider = build_logger_provider(&config, resource.clone())?;
                    let meter_provider = build_meter_provider(&config, resource)?;
                    let recorder = OtelRecorder::new(meter_provider.meter(METER_NAME));

                    let otel_tracer = tracer(&tracer_provider, &config.service_name);
                    layers.push(otel_layer(otel_tracer.clone()).boxed());
                    layers.push(log_bridge_layer(&logger_provider).boxed());
                    tracer_handle = Some(otel_tracer);

                    exporters.push(Arc::new(TraceExporter {
                        provider: tracer_provider,
                    }));
                    exporters.push(Arc::new(LogExporter {
                        provider: logger_provider,
                    }));
                    exporters.push(Arc::new(MetricsExporter {
                        provider: meter_provider,
                    }));

                    (Arc::new(recorder), None)
                }
                ObservabilityMode::Debug | ObservabilityMode::Local => {
                    let recorder = prometheus_recorder()?;
                    let handle = recorder.handle();
                    (Arc::new(recorder), Some(handle))
                }
                ObservabilityMode::Noop => (Arc::new(NoopRecorder), None),
            };

        let subscriber = tracing_subscriber::registry().with(filter).with(layers);
        let dispatch = Dispatch::new(subscriber);

        install_panic_hook();

        tracing::dispatcher::with_default(&dispatch, || {
            info!(
                mode = ?config.mode,
                service_name = %config.service_name,
                service_version = %config.service_version,
                environment = %config.environment,
                exporters = exporters.len(),
                "Observability provider initialized"
            );
        });

        let metrics = MetricsRegistry::new(recorder);
        let process_collector = match config.mode {
            ObservabilityMode::Noop => None,
            _ => Some(spawn_process_collector(
                metrics.clone(),
                PROCESS_METRICS_INTERVAL,
            )),
        };

        Ok(Self {
            mode: config.mode,
            dispatch,
            tracer: tracer_handle,
            metrics,
            prometheus,
            exporters: Mutex::new(exporters),
            process_collector: std::sync::Mutex::new(process_collector),
            state: AtomicU8::new(ProviderState::Ready as u8),
        })
    }

    /// Make this provider's logger the process-wide default.
    pub fn install_global(&self) -> Result<(), ObservabilityError> {
        tracing::dispatcher::set_global_default(self.dispatch.clone())
            .map_err(|e| ObservabilityError::Subscriber(e.to_string()))
    }

    pub fn mode(&self) -> ObservabilityMode {
        self.mode
    }

    pub fn state(&self) -> ProviderState {
        ProviderState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The process logger
    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// The OpenTelemetry tracer, present in `otel` mode
    pub fn tracer(&self) -> Option<&Tracer> {
        self.tracer.as_ref()
    }

    /// The meter
    pub fn metrics(&self) -> MetricsRegistry {
        self.metrics.clone()
    }

    /// Render handle of the Prometheus recorder, present in `debug` and `local` mode
    pub fn prometheus(&self) -> Option<PrometheusHandle> {
        self.prometheus.clone()
    }

    /// Add an exporter to drain at shutdown.
    pub async fn register_exporter(
        &self,
        exporter: Arc<dyn TelemetryExporter>,
    ) -> Result<(), ObservabilityError> {
        let mut exporters = self.exporters.lock().await;
        if self.state() != ProviderState::Ready {
            return Err(ObservabilityError::Terminated);
        }
        exporters.push(exporter);
        Ok(())
    }

    pub async fn exporter_names(&self) -> Vec<String> {
        self.exporters
            .lock()
            .await
            .iter()
            .map(|e| e.name().to_string())
            .collect()
    }

    /// Shut down every registered exporter concurrently, bounded by `timeout`.
    ///
    /// All exporters are attempted even when some fail; every failure is
    /// reported in the returned error. Exporters still running at the deadline
    /// are abandoned and reported as timed out. Later calls return `Ok(())`
    /// without touching any exporter.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), ShutdownError> {
        let exporters = {
            let mut exporters = self.exporters.lock().await;
            if self.state() == ProviderState::Terminated {
                return Ok(());
            }
            self.state
                .store(ProviderState::ShuttingDown as u8, Ordering::SeqCst);
            std::mem::take(&mut *exporters)
        };

        let collector = self
            .process_collector
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(collector) = collector {
            collector.abort();
        }

        let deadline = Instant::now() + timeout;
        let results = join_all(exporters.iter().map(|exporter| async move {
            let outcome = match timeout_at(deadline, exporter.shutdown()).await {
                Ok(result) => result,
                Err(_) => Err(ExporterError::TimedOut(timeout)),
            };
            (exporter.name().to_string(), outcome)
        }))
        .await;

        let mut failures = Vec::new();
        for (exporter, outcome) in results {
            match outcome {
                Ok(()) => info!(exporter = %exporter, "Telemetry exporter shut down"),
                Err(error) => {
                    warn!(exporter = %exporter, error = %error, "Telemetry exporter shutdown failed");
                    failures.push(ExporterFailure { exporter, error });
                }
            }
        }

        self.state
            .store(ProviderState::Terminated as u8, Ordering::SeqCst);

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ShutdownError { failures })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
