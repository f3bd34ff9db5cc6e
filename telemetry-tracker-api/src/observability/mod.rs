//! Observability for the telemetry tracker
//!
//! This module provides:
//! - The [`ObservabilityProvider`], which owns the process logger, tracer,
//!   meter and exporters and shuts them down together
//! - Request-correlated logging through a task-scoped [`RequestLogger`]
//! - OpenTelemetry request tracing with W3C Trace Context propagation
//! - Application, HTTP and process metrics, exposed for Prometheus locally
//!   and pushed over OTLP in `otel` mode

pub mod logging;
pub mod metrics;
pub mod provider;
pub mod tracing;

pub use self::logging::{
    current_logger, fmt_layer, log_bridge_layer, logger_from_context, with_logger, LogFormat,
    LoggerSlot, RequestFields, RequestLogger, REQUEST_ID_HEADER, REQUEST_LOGGER_TARGET,
};

pub use self::metrics::{
    metrics_handler, prometheus_recorder, spawn_process_collector, MetricsError,
    MetricsRegistry, OtelRecorder, ProcessStats,
};

pub use self::provider::{
    ExporterError, ExporterFailure, ObservabilityConfig, ObservabilityConfigBuilder,
    ObservabilityError, ObservabilityMode, ObservabilityProvider, ProviderState, ShutdownError,
    TelemetryExporter,
};

pub use self::tracing::{
    otel_layer, record_error, record_event, set_attribute, tracing_middleware,
    TraceContextPropagation,
};
