//! Pass-through observation of the status and size of a response.
//!
//! A [`ResponseRecorder`] is shared by every layer of one request through the
//! request extensions. The first status written to it is authoritative; later
//! writes are ignored. [`ResponseRecorder::record`] wraps a response body so
//! that bytes are counted as they stream out, without buffering, and a
//! completion callback runs exactly once when the body is finished.

use axum::{body::Body, http::StatusCode, response::Response};
use bytes::Bytes;
use http_body::{Frame, SizeHint};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

/// Observed status and byte count of one response
#[derive(Clone, Default)]
pub struct ResponseRecorder {
    inner: Arc<RecorderState>,
}

#[derive(Default)]
struct RecorderState {
    status: OnceLock<StatusCode>,
    bytes: AtomicU64,
}

impl ResponseRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `status` if no status has been recorded yet.
    ///
    /// Returns `true` when this call set the status.
    pub fn write_header(&self, status: StatusCode) -> bool {
        self.inner.status.set(status).is_ok()
    }

    /// Account for `len` body bytes. A body write without a prior header
    /// write records `200 OK`.
    pub fn write(&self, len: usize) {
        self.write_header(StatusCode::OK);
        self.inner.bytes.fetch_add(len as u64, Ordering::Relaxed);
    }

    /// The first status written, if any.
    pub fn status(&self) -> Option<StatusCode> {
        self.inner.status.get().copied()
    }

    pub fn bytes_written(&self) -> u64 {
        self.inner.bytes.load(Ordering::Relaxed)
    }

    /// Whether a response has been started for this request.
    pub fn is_started(&self) -> bool {
        self.inner.status.get().is_some()
    }

    /// Record the response's status and wrap its body so streamed bytes are
    /// counted. `on_complete` runs once, after the last frame, on a body
    /// error, or when the body is dropped early.
    ///
    /// A status written earlier through [`write_header`](Self::write_header)
    /// replaces the response's own status, so the client always receives the
    /// recorded one.
    pub fn record<F>(&self, response: Response, on_complete: F) -> Response
    where
        F: FnOnce(&ResponseRecorder) + Send + 'static,
    {
        let (mut parts, body) = response.into_parts();
        if !self.write_header(parts.status) {
            if let Some(status) = self.status() {
                parts.status = status;
            }
        }

        let body = RecordedBody {
            inner: body,
            recorder: self.clone(),
            on_complete: Some(Box::new(on_complete)),
            polling: false,
        };

        Response::from_parts(parts, Body::new(body))
    }
}

impl fmt::Debug for ResponseRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseRecorder")
            .field("status", &self.status())
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

type CompletionFn = Box<dyn FnOnce(&ResponseRecorder) + Send>;

struct RecordedBody {
    inner: Body,
    recorder: ResponseRecorder,
    on_complete: Option<CompletionFn>,
    // Set while the inner body is being polled. Still set on drop only if
    // that poll unwound.
    polling: bool,
}

impl RecordedBody {
    fn complete(&mut self) {
        if let Some(on_complete) = self.on_complete.take() {
            on_complete(&self.recorder);
        }
    }
}

impl http_body::Body for RecordedBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;

        this.polling = true;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        this.polling = false;

        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    this.recorder.write(data.len());
                }
            }
            Poll::Ready(Some(Err(_))) | Poll::Ready(None) => this.complete(),
            Poll::Pending => {}
        }

        polled
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for RecordedBody {
    fn drop(&mut self) {
        if !self.polling {
            self.complete();
        }
    }
}
