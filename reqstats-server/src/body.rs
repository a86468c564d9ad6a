//! Response body wrapper that turns body completion into terminal signals

use hyper::body::{Body, Frame, SizeHint};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use crate::connection::Connection;
use crate::recorder::RecorderHandle;

/// Wraps a response body and signals the recorder when hyper lets go of it.
///
/// A body released after its last frame reports "finished" at the
/// connection's next flush, once the bytes are on the socket. A body released
/// early reports "aborted" right away.
pub struct TrackedBody<B: Body> {
    inner: B,
    handle: Option<RecorderHandle>,
    connection: Option<Arc<Connection>>,
    ended: bool,
    bodiless: bool,
}

impl<B: Body> TrackedBody<B> {
    pub fn new(inner: B, handle: RecorderHandle) -> Self {
        let connection = handle.recorder().connection().cloned();
        Self {
            inner,
            handle: Some(handle),
            connection,
            ended: false,
            bodiless: false,
        }
    }

    /// Mark a response whose body is never sent (HEAD, 204, 304)
    pub fn bodiless(mut self) -> Self {
        self.bodiless = true;
        self
    }

    fn completed(&self) -> bool {
        self.ended || self.bodiless || self.inner.is_end_stream()
    }
}

impl<B: Body + Unpin> Body for TrackedBody<B> {
    type Data = B::Data;
    type Error = B::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let frame = ready!(Pin::new(&mut this.inner).poll_frame(cx));
        if frame.is_none() {
            this.ended = true;
        }
        Poll::Ready(frame)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl<B: Body> Drop for TrackedBody<B> {
    fn drop(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };
        if !self.completed() {
            handle.abort();
            return;
        }
        match &self.connection {
            Some(connection) => connection.defer_until_flush(Box::new(move |completion| {
                handle.complete(completion);
            })),
            None => {
                handle.finish();
            }
        }
    }
}

/// Aborts the recorder when dropped while still armed.
///
/// Held across the request handler so a handler error, or hyper dropping the
/// service future, still produces a result.
pub struct AbortGuard {
    handle: Option<RecorderHandle>,
}

impl AbortGuard {
    pub fn new(handle: RecorderHandle) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn disarm(mut self) {
        self.handle = None;
    }
}

impl Drop for AbortGuard {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}
