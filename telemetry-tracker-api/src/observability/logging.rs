//! Correlated per-request logging
//!
//! This module provides:
//! - A [`RequestLogger`]: a `tracing` span carrying the request id, method,
//!   path, client address and user agent of one request
//! - Task-scoped attachment of that logger ([`with_logger`]) and typed
//!   retrieval ([`logger_from_context`], [`current_logger`])
//! - The `fmt` layer used by the process subscriber, in JSON, pretty or
//!   compact form
//! - The OTLP log pipeline and the bridge that forwards `tracing` events to it
//!
//! # Examples
//!
//! ```rust,no_run
//! use telemetry_tracker_api::observability::logging::{
//!     current_logger, with_logger, RequestFields, RequestLogger,
//! };
//!
//! # async fn example() {
//! let logger = RequestLogger::new(&RequestFields {
//!     request_id: "req-1".into(),
//!     ..Default::default()
//! });
//!
//! with_logger(logger, async {
//!     assert_eq!(current_logger().request_id(), "req-1");
//! })
//! .await;
//! # }
//! ```

use opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{logs::LoggerProvider, Resource};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, OnceLock};
use tokio::task_local;
use tracing::{level_filters::LevelFilter, Span, Subscriber};
use tracing_subscriber::{
    filter::Targets,
    fmt::{self, format::FmtSpan},
    registry::LookupSpan,
    Layer,
};

use super::provider::{ObservabilityConfig, ObservabilityError};

// ============================================================================
// Constants
// ============================================================================

/// HTTP header carrying the request correlation ID
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Target of request logger spans. Spans with this target are kept out of
/// trace export.
pub const REQUEST_LOGGER_TARGET: &str = "telemetry_tracker::request";

// ============================================================================
// Configuration
// ============================================================================

/// Log format configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// JSON format for production (machine-readable)
    Json,
    /// Pretty format for development (human-readable)
    Pretty,
    /// Compact format for minimal output
    Compact,
}

impl Default for LogFormat {
    fn default() -> Self {
        #[cfg(debug_assertions)]
        return Self::Pretty;

        #[cfg(not(debug_assertions))]
        return Self::Json;
    }
}

/// Build the console layer for the given format.
pub fn fmt_layer<S>(format: LogFormat, span_events: FmtSpan) -> Box<dyn Layer<S> + Send + Sync>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    match format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Pretty => fmt::layer()
            .pretty()
            .with_thread_ids(true)
            .with_span_events(span_events)
            .boxed(),
        LogFormat::Compact => fmt::layer()
            .compact()
            .with_span_events(span_events)
            .boxed(),
    }
}

/// Build a batching OTLP/gRPC logger provider for `config`.
pub(crate) fn build_logger_provider(
    config: &ObservabilityConfig,
    resource: Resource,
) -> Result<LoggerProvider, ObservabilityError> {
    let exporter = opentelemetry_otlp::LogExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .map_err(|e| ObservabilityError::LogExporter(e.to_string()))?;

    Ok(LoggerProvider::builder()
        .with_resource(resource)
        .with_batch_exporter(exporter, opentelemetry_sdk::runtime::Tokio)
        .build())
}

/// Layer forwarding `tracing` events to `provider`.
///
/// Events from the export transport itself are dropped so that exporting a
/// log record never produces another one.
pub fn log_bridge_layer<S>(provider: &LoggerProvider) -> impl Layer<S> + Send + Sync
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    let transport = Targets::new()
        .with_default(LevelFilter::TRACE)
        .with_target("h2", LevelFilter::OFF)
        .with_target("hyper", LevelFilter::OFF)
        .with_target("tonic", LevelFilter::OFF)
        .with_target("tower", LevelFilter::OFF)
        .with_target("opentelemetry", LevelFilter::OFF);

    OpenTelemetryTracingBridge::new(provider).with_filter(transport)
}

// ============================================================================
// Request Logger
// ============================================================================

/// Correlation fields of one inbound request
#[derive(Debug, Clone, Default)]
pub struct RequestFields {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub remote_addr: String,
    pub user_agent: String,
}

/// Structured logger bound to a single request.
///
/// Events emitted with the logger's span as parent, or inside a future
/// instrumented with it, carry every correlation field.
#[derive(Debug, Clone)]
pub struct RequestLogger {
    span: Span,
    request_id: Arc<str>,
}

impl RequestLogger {
    pub fn new(fields: &RequestFields) -> Self {
        let span = tracing::info_span!(
            target: REQUEST_LOGGER_TARGET,
            "request",
            request_id = %fields.request_id,
            method = %fields.method,
            path = %fields.path,
            remote_addr = %fields.remote_addr,
            user_agent = %fields.user_agent,
        );

        Self {
            span,
            request_id: Arc::from(fields.request_id.as_str()),
        }
    }

    /// Logger tagged only with a request id, for code that runs before the
    /// telemetry middleware attached the full logger.
    pub fn detached(request_id: &str) -> Self {
        let span = tracing::info_span!(
            target: REQUEST_LOGGER_TARGET,
            "request",
            request_id = %request_id,
        );

        Self {
            span,
            request_id: Arc::from(request_id),
        }
    }

    /// The process logger: no span, no request id.
    pub fn process_default() -> Self {
        Self {
            span: Span::none(),
            request_id: Arc::from(""),
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

task_local! {
    static REQUEST_LOGGER: RequestLogger;
}

/// Run `future` with `logger` attached to the task.
///
/// Attaching inside a scope that already carries a logger shadows it for the
/// duration of `future`; the outer logger is untouched.
pub async fn with_logger<F>(logger: RequestLogger, future: F) -> F::Output
where
    F: Future,
{
    REQUEST_LOGGER.scope(logger, future).await
}

/// The logger attached to the current task, if any.
pub fn logger_from_context() -> Option<RequestLogger> {
    REQUEST_LOGGER.try_with(RequestLogger::clone).ok()
}

/// The attached logger, or the process logger when none is attached.
pub fn current_logger() -> RequestLogger {
    logger_from_context().unwrap_or_else(RequestLogger::process_default)
}

/// Write-once cell through which an outer layer observes the logger attached
/// further in.
#[derive(Debug, Clone, Default)]
pub struct LoggerSlot(Arc<OnceLock<RequestLogger>>);

impl LoggerSlot {
    /// Returns `false` when a logger was already attached.
    pub fn attach(&self, logger: RequestLogger) -> bool {
        self.0.set(logger).is_ok()
    }

    pub fn get(&self) -> Option<RequestLogger> {
        self.0.get().cloned()
    }
}

// ============================================================================
// Utility Macros
// ============================================================================

/// Log with the current request context
#[macro_export]
macro_rules! log_with_context {
    ($level:expr, $($arg:tt)*) => {{
        let logger = $crate::observability::logging::current_logger();
        tracing::event!(
            $level,
            request_id = %logger.request_id(),
            $($arg)*
        );
    }};
}

/// Info log with context
#[macro_export]
macro_rules! info_ctx {
    ($($arg:tt)*) => {
        $crate::log_with_context!(tracing::Level::INFO, $($arg)*)
    };
}

/// Warn log with context
#[macro_export]
macro_rules! warn_ctx {
    ($($arg:tt)*) => {
        $crate::log_with_context!(tracing::Level::WARN, $($arg)*)
    };
}

/// Error log with context
#[macro_export]
macro_rules! error_ctx {
    ($($arg:tt)*) => {
        $crate::log_with_context!(tracing::Level::ERROR, $($arg)*)
    };
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn logger(request_id: &str) -> RequestLogger {
        RequestLogger::new(&RequestFields {
            request_id: request_id.to_string(),
            method: "POST".to_string(),
            path: "/events".to_string(),
            remote_addr: "127.0.0.1".to_string(),
            user_agent: "test".to_string(),
        })
    }

    #[test]
    fn test_absent_logger_falls_back_to_process_default() {
        assert!(logger_from_context().is_none());
        assert_eq!(current_logger().request_id(), "");
        assert!(current_logger().span().is_none());
    }

    #[tokio::test]
    async fn test_attached_logger_is_visible_across_awaits() {
        with_logger(logger("req-1"), async {
            tokio::task::yield_now().await;
            let attached = logger_from_context().expect("logger attached");
            assert_eq!(attached.request_id(), "req-1");
        })
        .await;

        assert!(logger_from_context().is_none());
    }

    #[tokio::test]
    async fn test_nested_attach_shadows_outer_logger() {
        with_logger(logger("outer"), async {
            with_logger(logger("inner"), async {
                assert_eq!(current_logger().request_id(), "inner");
            })
            .await;

            assert_eq!(current_logger().request_id(), "outer");
        })
        .await;
    }

    #[tokio::test]
    async fn test_spawned_tasks_do_not_inherit_logger() {
        with_logger(logger("req-2"), async {
            let seen = tokio::spawn(async { logger_from_context().is_some() })
                .await
                .unwrap();
            assert!(!seen);
        })
        .await;
    }

    #[test]
    fn test_detached_logger_keeps_request_id() {
        assert_eq!(RequestLogger::detached("req-3").request_id(), "req-3");
    }

    #[test]
    fn test_logger_slot_first_attach_wins() {
        let slot = LoggerSlot::default();
        assert!(slot.get().is_none());

        assert!(slot.attach(logger("first")));
        assert!(!slot.attach(logger("second")));

        let shared = slot.clone();
        assert_eq!(shared.get().unwrap().request_id(), "first");
    }

    #[test]
    fn test_log_format_deserializes_lowercase() {
        let format: LogFormat = serde_json::from_str("\"compact\"").unwrap();
        assert_eq!(format, LogFormat::Compact);
    }
}
