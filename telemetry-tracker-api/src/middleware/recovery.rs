//! Panic recovery boundary
//!
//! [`RecoveryLayer`] is the outermost layer of the router. A panic raised by
//! any inner layer or handler, while building the response or while
//! streaming its body, is caught here exactly once, logged at error level
//! with the panic value and a stack trace, and turned into a response:
//!
//! - no status written yet: a single generic `500 Internal Server Error`
//! - a status already written: that status with an empty body, never a
//!   second response
//! - body already streaming: the body ends with an error frame
//!
//! A panic whose payload is [`AbortRequest`] is not an application failure.
//! It is re-raised so the connection serving the request is torn down.

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use http_body::{Frame, SizeHint};
use std::any::Any;
use std::backtrace::Backtrace;
use std::cell::{Cell, RefCell};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::{Arc, Once};
use std::task::{Context, Poll};
use tower::{Layer, Service};

use super::recorder::ResponseRecorder;
use crate::error::ApiError;
use crate::observability::{LoggerSlot, RequestLogger, REQUEST_ID_HEADER};

/// Panic payload a handler raises to drop the connection instead of
/// answering, e.g. `std::panic::panic_any(AbortRequest)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AbortRequest;

// ============================================================================
// Panic Hook
// ============================================================================

thread_local! {
    static BOUNDARY_DEPTH: Cell<usize> = const { Cell::new(0) };
    static PANIC_BACKTRACE: RefCell<Option<Backtrace>> = const { RefCell::new(None) };
}

static PANIC_HOOK: Once = Once::new();

/// Install the process panic hook used by recovery boundaries.
///
/// Inside a boundary the hook captures a backtrace of the panic site for the
/// boundary to log and prints nothing. Elsewhere it defers to the hook that
/// was installed before it. Installing more than once has no effect.
pub fn install_panic_hook() {
    PANIC_HOOK.call_once(|| {
        let previous = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            if BOUNDARY_DEPTH.with(Cell::get) > 0 {
                let backtrace = Backtrace::force_capture();
                PANIC_BACKTRACE.with(|slot| *slot.borrow_mut() = Some(backtrace));
            } else {
                previous(info);
            }
        }));
    });
}

/// Run `f` inside the boundary, catching any unwind.
fn guarded<R>(f: impl FnOnce() -> R) -> std::thread::Result<R> {
    BOUNDARY_DEPTH.with(|depth| depth.set(depth.get() + 1));
    let result = panic::catch_unwind(AssertUnwindSafe(f));
    BOUNDARY_DEPTH.with(|depth| depth.set(depth.get() - 1));
    result
}

fn take_backtrace() -> String {
    PANIC_BACKTRACE
        .with(|slot| slot.borrow_mut().take())
        .map(|backtrace| backtrace.to_string())
        .unwrap_or_else(|| "<stack trace unavailable>".to_string())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}

// ============================================================================
// Layer
// ============================================================================

/// Layer applying the [`Recovery`] boundary
#[derive(Debug, Clone, Copy)]
pub struct RecoveryLayer {
    _priv: (),
}

impl RecoveryLayer {
    pub fn new() -> Self {
        install_panic_hook();
        Self { _priv: () }
    }
}

impl Default for RecoveryLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for RecoveryLayer {
    type Service = Recovery<S>;

    fn layer(&self, inner: S) -> Self::Service {
        Recovery { inner }
    }
}

/// Middleware service catching panics from everything it wraps
#[derive(Debug, Clone)]
pub struct Recovery<S> {
    inner: S,
}

impl<S> Service<Request> for Recovery<S>
where
    S: Service<Request, Response = Response> + Send + 'static,
    S::Future: Send + 'static,
{
    type Response = Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: Request) -> Self::Future {
        let boundary = Boundary {
            recorder: ResponseRecorder::new(),
            slot: LoggerSlot::default(),
            request_id: request
                .headers()
                .get(REQUEST_ID_HEADER)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .into(),
        };

        request.extensions_mut().insert(boundary.recorder.clone());
        request.extensions_mut().insert(boundary.slot.clone());

        let inner = &mut self.inner;
        let future = match guarded(move || inner.call(request)) {
            Ok(future) => future,
            Err(payload) => {
                let response = boundary.recover(payload);
                return Box::pin(async move { Ok(response) });
            }
        };

        Box::pin(async move {
            match CatchPanic::new(future).await {
                Ok(Ok(response)) => Ok(boundary.guard_body(response)),
                Ok(Err(error)) => Err(error),
                Err(payload) => Ok(boundary.recover(payload)),
            }
        })
    }
}

/// Per-request state of the boundary
#[derive(Clone)]
struct Boundary {
    recorder: ResponseRecorder,
    slot: LoggerSlot,
    request_id: Arc<str>,
}

impl Boundary {
    /// Log the panic, then answer only if nothing was written yet.
    fn recover(&self, payload: Box<dyn Any + Send>) -> Response {
        self.log_panic(payload);

        let mut response = if self.recorder.write_header(StatusCode::INTERNAL_SERVER_ERROR) {
            ApiError::Internal("panic recovered".to_string()).into_response()
        } else {
            self.recorder
                .status()
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        };

        // Layers that would echo the request id sit inside the boundary.
        if let Ok(request_id) = HeaderValue::from_str(&self.request_id) {
            if !self.request_id.is_empty() {
                response.headers_mut().insert(REQUEST_ID_HEADER, request_id);
            }
        }

        response
    }

    fn log_panic(&self, payload: Box<dyn Any + Send>) {
        if payload.is::<AbortRequest>() {
            panic::resume_unwind(payload);
        }

        let stack = take_backtrace();
        let logger = self
            .slot
            .get()
            .unwrap_or_else(|| RequestLogger::detached(&self.request_id));

        tracing::error!(
            parent: logger.span(),
            request_id = %logger.request_id(),
            panic_value = %panic_message(&*payload),
            stack = %stack,
            "Panic recovered"
        );
    }

    fn guard_body(self, response: Response) -> Response {
        let (parts, body) = response.into_parts();
        let body = GuardedBody {
            inner: body,
            boundary: Some(self),
        };
        Response::from_parts(parts, Body::new(body))
    }
}

/// Future adapter resolving to `Err(payload)` if polling `F` panicked
struct CatchPanic<F> {
    inner: Pin<Box<F>>,
}

impl<F> CatchPanic<F> {
    fn new(inner: F) -> Self {
        Self {
            inner: Box::pin(inner),
        }
    }
}

impl<F: Future> Future for CatchPanic<F> {
    type Output = Result<F::Output, Box<dyn Any + Send>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let inner = self.inner.as_mut();
        match guarded(move || inner.poll(cx)) {
            Ok(Poll::Ready(output)) => Poll::Ready(Ok(output)),
            Ok(Poll::Pending) => Poll::Pending,
            Err(payload) => Poll::Ready(Err(payload)),
        }
    }
}

/// Response body that turns a panic while streaming into an error frame.
///
/// The status line has already been sent at that point, so nothing is
/// written besides ending the body.
struct GuardedBody {
    inner: Body,
    // Taken on the first panic; the body is finished afterwards.
    boundary: Option<Boundary>,
}

impl http_body::Body for GuardedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        if this.boundary.is_none() {
            return Poll::Ready(None);
        }

        let inner = Pin::new(&mut this.inner);
        match guarded(move || inner.poll_frame(cx)) {
            Ok(polled) => polled,
            Err(payload) => {
                if let Some(boundary) = this.boundary.take() {
                    boundary.log_panic(payload);
                }
                Poll::Ready(Some(Err(axum::Error::new("response body panicked"))))
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        self.boundary.is_none() || self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
