//! Connections and their cumulative byte counters

use std::io::{self, IoSlice};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::trace;

use crate::gate::Completion;
use crate::lock;
use crate::tracker::{ByteCounters, ByteDelta, ConnectionByteTracker};

static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Callback waiting for the connection's next successful flush
pub type FlushCallback = Box<dyn FnOnce(Completion) + Send>;

#[derive(Default)]
struct FlushQueue {
    callbacks: Vec<FlushCallback>,
    closed: bool,
}

/// A transport connection shared by every request multiplexed over it.
///
/// The transport feeds the counters; the stats core only reads them and moves
/// the request-boundary checkpoint held in [`ConnectionByteTracker`].
pub struct Connection {
    id: ConnectionId,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    tracker: ConnectionByteTracker,
    awaiting_flush: Mutex<FlushQueue>,
}

impl Connection {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            id: ConnectionId::next(),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            tracker: ConnectionByteTracker::new(),
            awaiting_flush: Mutex::new(FlushQueue::default()),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn record_read(&self, n: u64) {
        self.bytes_read.fetch_add(n, Ordering::AcqRel);
    }

    pub fn record_written(&self, n: u64) {
        self.bytes_written.fetch_add(n, Ordering::AcqRel);
    }

    pub fn tracker(&self) -> &ConnectionByteTracker {
        &self.tracker
    }

    /// Bytes since the previous request boundary, leaving it in place
    pub fn delta(&self) -> ByteDelta {
        self.tracker.delta(self)
    }

    /// Charge the bytes since the previous boundary and start a new one
    pub fn take_delta(&self) -> ByteDelta {
        self.tracker.take_delta(self)
    }

    /// Run `callback` once everything written so far has been flushed.
    ///
    /// If the connection is dropped first the callback sees
    /// [`Completion::Aborted`], immediately when it is already gone.
    pub fn defer_until_flush(&self, callback: FlushCallback) {
        let mut queue = lock(&self.awaiting_flush);
        if queue.closed {
            drop(queue);
            trace!(connection = %self.id, "Connection already closed, aborting deferred callback");
            callback(Completion::Aborted);
            return;
        }
        queue.callbacks.push(callback);
    }

    /// Number of callbacks waiting on a flush
    pub fn pending_flushes(&self) -> usize {
        lock(&self.awaiting_flush).callbacks.len()
    }

    /// Whether the transport has let go of this connection
    pub fn is_closed(&self) -> bool {
        lock(&self.awaiting_flush).closed
    }

    pub(crate) fn flushed(&self) {
        let callbacks = std::mem::take(&mut lock(&self.awaiting_flush).callbacks);
        self.run(callbacks, Completion::Finished);
    }

    pub(crate) fn closed(&self) {
        let callbacks = {
            let mut queue = lock(&self.awaiting_flush);
            queue.closed = true;
            std::mem::take(&mut queue.callbacks)
        };
        self.run(callbacks, Completion::Aborted);
    }

    fn run(&self, callbacks: Vec<FlushCallback>, completion: Completion) {
        if callbacks.is_empty() {
            return;
        }
        trace!(connection = %self.id, count = callbacks.len(), ?completion, "Draining flush callbacks");
        for callback in callbacks {
            callback(completion);
        }
    }
}

impl ByteCounters for Connection {
    fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Acquire)
    }

    fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("bytes_read", &self.bytes_read())
            .field("bytes_written", &self.bytes_written())
            .finish()
    }
}

/// I/O wrapper that feeds a [`Connection`]'s counters.
///
/// Every byte that crosses the socket is counted, so request and response
/// sizes include the HTTP head and any transfer framing.
pub struct CountingIo<T> {
    inner: T,
    connection: Arc<Connection>,
}

impl<T> CountingIo<T> {
    pub fn new(inner: T, connection: Arc<Connection>) -> Self {
        Self { inner, connection }
    }
}

impl<T> Drop for CountingIo<T> {
    fn drop(&mut self) {
        self.connection.closed();
    }
}

impl<T: AsyncRead + Unpin> AsyncRead for CountingIo<T> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let nr = buf.filled().len() - before;
        this.connection.record_read(nr as u64);
        Poll::Ready(Ok(()))
    }
}

impl<T: AsyncWrite + Unpin> AsyncWrite for CountingIo<T> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let nw = ready!(Pin::new(&mut this.inner).poll_write(cx, buf))?;
        this.connection.record_written(nw as u64);
        Poll::Ready(Ok(nw))
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let nw = ready!(Pin::new(&mut this.inner).poll_write_vectored(cx, bufs))?;
        this.connection.record_written(nw as u64);
        Poll::Ready(Ok(nw))
    }

    fn is_write_vectored(&self) -> bool {
        self.inner.is_write_vectored()
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(Pin::new(&mut this.inner).poll_flush(cx))?;
        this.connection.flushed();
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_connection_ids_are_unique() {
        let a = Connection::new();
        let b = Connection::new();
        assert_ne!(a.id(), b.id());
        assert!(a.id().to_string().starts_with("conn-"));
    }

    #[tokio::test]
    async fn test_counting_io_counts_both_directions() {
        let (client, server) = tokio::io::duplex(1024);
        let connection = Connection::new();
        let mut io = CountingIo::new(server, connection.clone());
        let mut client = client;

        client.write_all(b"hello world").await.unwrap();
        let mut buf = [0u8; 11];
        io.read_exact(&mut buf).await.unwrap();
        io.write_all(b"ok").await.unwrap();

        assert_eq!(connection.bytes_read(), 11);
        assert_eq!(connection.bytes_written(), 2);

        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(&reply, b"ok");
    }

    #[tokio::test]
    async fn test_flush_fires_deferred_callbacks() {
        let (_client, server) = tokio::io::duplex(64);
        let connection = Connection::new();
        let mut io = CountingIo::new(server, connection.clone());
        let (tx, rx) = mpsc::channel();

        connection.defer_until_flush(Box::new(move |completion| {
            tx.send(completion).unwrap();
        }));
        assert_eq!(connection.pending_flushes(), 1);

        io.write_all(b"done").await.unwrap();
        io.flush().await.unwrap();

        assert_eq!(rx.try_recv().unwrap(), Completion::Finished);
        assert_eq!(connection.pending_flushes(), 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_aborts_deferred_callbacks() {
        let (_client, server) = tokio::io::duplex(64);
        let connection = Connection::new();
        let io = CountingIo::new(server, connection.clone());
        let (tx, rx) = mpsc::channel();

        connection.defer_until_flush(Box::new(move |completion| {
            tx.send(completion).unwrap();
        }));
        drop(io);

        assert_eq!(rx.try_recv().unwrap(), Completion::Aborted);
        assert!(connection.is_closed());
    }

    #[test]
    fn test_defer_after_close_aborts_immediately() {
        let connection = Connection::new();
        connection.closed();
        let (tx, rx) = mpsc::channel();

        connection.defer_until_flush(Box::new(move |completion| {
            tx.send(completion).unwrap();
        }));

        assert_eq!(rx.try_recv().unwrap(), Completion::Aborted);
        assert_eq!(connection.pending_flushes(), 0);

        connection.flushed();
        assert!(rx.try_recv().is_err());
    }
}
