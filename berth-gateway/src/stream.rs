//! Streaming response plumbing.
//!
//! Every streaming endpoint follows the same contract: each record is
//! written and flushed as its own chunk, an in-band error record is
//! written before the stream closes on failure, and client disconnect
//! runs a cleanup guard so subscriptions and log followers do not leak.

use std::convert::Infallible;

use axum::body::{Body, Bytes};
use axum::http::header;
use axum::response::Response;
use serde::Serialize;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::{Stream, StreamExt};

use crate::error::error_code;

pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Runs a cleanup closure when the response body is dropped, which is
/// how axum signals client disconnect.
pub struct CloseGuard(Option<Box<dyn FnOnce() + Send>>);

impl CloseGuard {
    #[must_use]
    pub fn new(cleanup: impl FnOnce() + Send + 'static) -> Self {
        Self(Some(Box::new(cleanup)))
    }

    /// A guard with no cleanup.
    #[must_use]
    pub fn none() -> Self {
        Self(None)
    }
}

impl Drop for CloseGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.0.take() {
            cleanup();
        }
    }
}

/// One line of an NDJSON stream: a record, or an in-band error that
/// terminates the stream.
#[must_use]
pub fn ndjson_line<T: Serialize>(record: &T) -> Bytes {
    match serde_json::to_vec(record) {
        Ok(mut line) => {
            line.push(b'\n');
            Bytes::from(line)
        }
        Err(e) => error_line(&berth_core::CoreError::DataDecode(e.to_string())),
    }
}

/// Serialized error record, written before a stream closes on failure.
#[must_use]
pub fn error_line(err: &berth_core::CoreError) -> Bytes {
    let body = serde_json::json!({"code": error_code(err), "message": err.to_string()});
    let mut line = body.to_string().into_bytes();
    line.push(b'\n');
    Bytes::from(line)
}

/// Builds an NDJSON response from a stream of serialized lines. The
/// guard is dropped when the client goes away or the stream ends.
pub fn ndjson_response<S>(lines: S, guard: CloseGuard) -> Response
where
    S: Stream<Item = Bytes> + Send + 'static,
{
    let mut guard = Some(guard);
    let body = lines.map(move |line| {
        // Holds the guard until the stream is dropped.
        let _alive = &mut guard;
        Ok::<_, Infallible>(line)
    });
    match Response::builder()
        .header(header::CONTENT_TYPE, NDJSON_CONTENT_TYPE)
        .body(Body::from_stream(body))
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, "failed to build stream response");
            Response::new(Body::empty())
        }
    }
}

/// Raw byte stream response for log and interaction output.
pub fn bytes_response(rx: tokio::sync::mpsc::Receiver<Vec<u8>>, guard: CloseGuard) -> Response {
    let mut guard = Some(guard);
    let body = ReceiverStream::new(rx).map(move |chunk| {
        let _alive = &mut guard;
        Ok::<_, Infallible>(Bytes::from(chunk))
    });
    match Response::builder()
        .header(header::CONTENT_TYPE, "application/octet-stream")
        .body(Body::from_stream(body))
    {
        Ok(resp) => resp,
        Err(e) => {
            tracing::error!(error = %e, "failed to build stream response");
            Response::new(Body::empty())
        }
    }
}
