//! Per-request stats recording
//!
//! A [`RequestStatsRecorder`] is created for exactly one request. Once
//! observed it waits for the first terminal signal, charges the request with
//! the connection bytes moved since the previous request boundary and
//! publishes a single [`StatsResult`] to its listeners.

use reqstats_common::{
    HeaderField, Headers, RequestStats, ResponseStats, StatsResult, DEFAULT_STATUS,
};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;
use tracing::{debug, trace};

use crate::connection::Connection;
use crate::gate::{Completion, CompletionGate};
use crate::lock;
use crate::progress::ProgressReporter;
use crate::tracker::ByteDelta;
use reqstats_common::ProgressSnapshot;

/// Callback receiving a completed request's stats
pub type StatsListener = Arc<dyn Fn(&StatsResult) + Send + Sync>;

type ResultListener = Arc<dyn Fn(&Arc<StatsResult>) + Send + Sync>;

/// What the transport knows about a request when it starts
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub path: String,
    pub headers: Headers,
    pub connection: Option<Arc<Connection>>,
}

impl RequestInfo {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            headers: Headers::new(),
            connection: None,
        }
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_connection(mut self, connection: Arc<Connection>) -> Self {
        self.connection = Some(connection);
        self
    }

    /// Announced body length, if any
    pub fn content_length(&self) -> Option<u64> {
        self.headers
            .get("content-length")
            .and_then(HeaderField::first)
            .and_then(|value| value.trim().parse().ok())
    }
}

#[derive(Debug, Clone)]
struct ResponseHead {
    status: u16,
    headers: Headers,
}

impl Default for ResponseHead {
    fn default() -> Self {
        Self {
            status: DEFAULT_STATUS,
            headers: Headers::new(),
        }
    }
}

/// Stats recorder bound to one request/response pair
pub struct RequestStatsRecorder {
    request: RequestInfo,
    expected_total_bytes: Option<u64>,
    started: OnceLock<Instant>,
    gate: CompletionGate,
    response: Mutex<ResponseHead>,
    listeners: Mutex<Vec<ResultListener>>,
    result: Mutex<Option<Arc<StatsResult>>>,
}

impl RequestStatsRecorder {
    pub fn new(request: RequestInfo) -> Self {
        let expected_total_bytes = request.content_length();
        Self {
            request,
            expected_total_bytes,
            started: OnceLock::new(),
            gate: CompletionGate::new(),
            response: Mutex::new(ResponseHead::default()),
            listeners: Mutex::new(Vec::new()),
            result: Mutex::new(None),
        }
    }

    /// Override the expected request size used for progress estimates
    pub fn with_expected_total_bytes(mut self, bytes: Option<u64>) -> Self {
        self.expected_total_bytes = bytes;
        self
    }

    pub fn request(&self) -> &RequestInfo {
        &self.request
    }

    pub fn connection(&self) -> Option<&Arc<Connection>> {
        self.request.connection.as_ref()
    }

    pub fn expected_total_bytes(&self) -> Option<u64> {
        self.expected_total_bytes
    }

    /// When observation started; `None` until [`observe`](Self::observe)
    pub fn start_time(&self) -> Option<Instant> {
        self.started.get().copied()
    }

    pub fn result(&self) -> Option<Arc<StatsResult>> {
        lock(&self.result).clone()
    }

    pub fn is_complete(&self) -> bool {
        self.gate.is_fired()
    }

    /// Start the clock and hand out the handle carrying the terminal signals
    pub fn observe(self, listener: Option<StatsListener>) -> RecorderHandle {
        self.started.get_or_init(Instant::now);
        if let Some(listener) = listener {
            lock(&self.listeners).push(Arc::new(move |result: &Arc<StatsResult>| {
                listener(result.as_ref())
            }));
        }
        RecorderHandle {
            recorder: Arc::new(self),
            progress: Arc::new(Mutex::new(ProgressReporter::new())),
        }
    }

    /// Bytes this request has moved so far.
    ///
    /// Before completion this peeks at the connection without moving its
    /// checkpoint; afterwards it is the charged amount.
    pub fn transferred(&self) -> ByteDelta {
        let result = lock(&self.result);
        match result.as_ref() {
            Some(result) => ByteDelta {
                read: result.request.bytes,
                written: result.response.bytes,
            },
            None => self
                .connection()
                .map(|connection| connection.delta())
                .unwrap_or_default(),
        }
    }

    fn set_response_head(&self, status: u16, headers: Headers) {
        if self.gate.is_fired() {
            return;
        }
        *lock(&self.response) = ResponseHead { status, headers };
    }

    fn on_complete(&self, listener: ResultListener) {
        let mut listeners = lock(&self.listeners);
        match self.result() {
            Some(result) => {
                drop(listeners);
                listener(&result);
            }
            None => listeners.push(listener),
        }
    }

    fn complete(&self, completion: Completion) -> Option<Arc<StatsResult>> {
        let Some(result) = self.gate.fire(|| {
            let mut slot = lock(&self.result);
            let result = Arc::new(self.build(completion));
            *slot = Some(result.clone());
            result
        }) else {
            trace!(?completion, path = %self.request.path, "Ignoring terminal signal after completion");
            return None;
        };

        debug!(
            method = %result.request.method,
            path = %result.request.path,
            ok = result.ok,
            elapsed_ms = result.elapsed_ms,
            request_bytes = result.request.bytes,
            response_bytes = result.response.bytes,
            "Request stats recorded"
        );

        let listeners = std::mem::take(&mut *lock(&self.listeners));
        for listener in &listeners {
            listener(&result);
        }
        Some(result)
    }

    fn build(&self, completion: Completion) -> StatsResult {
        let elapsed = self
            .start_time()
            .map(|started| started.elapsed())
            .unwrap_or_default();

        let delta = match self.connection() {
            Some(connection) => connection.take_delta(),
            None => {
                debug!(path = %self.request.path, "No connection attached, reporting zero bytes");
                ByteDelta::default()
            }
        };

        let head = lock(&self.response).clone();

        StatsResult {
            ok: completion.is_ok(),
            elapsed_ms: elapsed.as_millis() as u64,
            request: RequestStats {
                bytes: delta.read,
                headers: self.request.headers.clone(),
                method: self.request.method.clone(),
                path: self.request.path.clone(),
            },
            response: ResponseStats {
                bytes: delta.written,
                headers: head.headers,
                status: head.status,
            },
        }
    }
}

/// Observe a request in one call
pub fn observe(request: RequestInfo, listener: Option<StatsListener>) -> RecorderHandle {
    RequestStatsRecorder::new(request).observe(listener)
}

/// Shared handle to an observed recorder.
///
/// The transport drives the terminal signals through it; anyone else may
/// poll progress or wait for the result.
#[derive(Clone)]
pub struct RecorderHandle {
    recorder: Arc<RequestStatsRecorder>,
    progress: Arc<Mutex<ProgressReporter>>,
}

impl RecorderHandle {
    pub fn recorder(&self) -> &RequestStatsRecorder {
        &self.recorder
    }

    pub fn request(&self) -> &RequestInfo {
        self.recorder.request()
    }

    /// Status and headers as they stand; read again at the terminal signal
    pub fn set_response_head(&self, status: u16, headers: Headers) {
        self.recorder.set_response_head(status, headers);
    }

    /// "Finished" signal
    pub fn finish(&self) -> Option<Arc<StatsResult>> {
        self.recorder.complete(Completion::Finished)
    }

    /// "Aborted" signal
    pub fn abort(&self) -> Option<Arc<StatsResult>> {
        self.recorder.complete(Completion::Aborted)
    }

    /// Deliver a terminal signal; only the first one produces a result
    pub fn complete(&self, completion: Completion) -> Option<Arc<StatsResult>> {
        self.recorder.complete(completion)
    }

    /// Register a listener; called at once if the result already exists
    pub fn on_complete<F>(&self, listener: F)
    where
        F: Fn(&StatsResult) + Send + Sync + 'static,
    {
        self.recorder
            .on_complete(Arc::new(move |result: &Arc<StatsResult>| listener(result.as_ref())));
    }

    /// Like [`on_complete`](Self::on_complete), sharing the stored result
    pub fn on_result<F>(&self, listener: F)
    where
        F: Fn(&Arc<StatsResult>) + Send + Sync + 'static,
    {
        self.recorder.on_complete(Arc::new(listener));
    }

    pub fn result(&self) -> Option<Arc<StatsResult>> {
        self.recorder.result()
    }

    pub fn is_complete(&self) -> bool {
        self.recorder.is_complete()
    }

    /// Poll in-flight progress with this handle's reporter
    pub fn progress(&self) -> Option<ProgressSnapshot> {
        lock(&self.progress).poll(&self.recorder)
    }
}

impl std::fmt::Debug for RecorderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecorderHandle")
            .field("method", &self.recorder.request.method)
            .field("path", &self.recorder.request.path)
            .field("complete", &self.recorder.is_complete())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::ByteCounters;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn put_request(connection: &Arc<Connection>) -> RequestInfo {
        let mut headers = Headers::new();
        headers.insert(
            "connection".to_string(),
            HeaderField::One("keep-alive".to_string()),
        );
        headers.insert(
            "content-length".to_string(),
            HeaderField::One("2".to_string()),
        );
        RequestInfo::new("PUT", "/")
            .with_headers(headers)
            .with_connection(connection.clone())
    }

    fn collecting() -> (StatsListener, Arc<Mutex<Vec<StatsResult>>>) {
        let results = Arc::new(Mutex::new(Vec::new()));
        let sink = results.clone();
        let listener: StatsListener = Arc::new(move |result: &StatsResult| {
            sink.lock().unwrap().push(result.clone());
        });
        (listener, results)
    }

    #[test]
    fn test_finish_then_abort_reports_once() {
        let connection = Connection::new();
        let (listener, results) = collecting();
        let handle = observe(put_request(&connection), Some(listener));

        connection.record_read(90);
        connection.record_written(60);
        let first = handle.finish().unwrap();
        connection.record_written(5);
        assert!(handle.abort().is_none());
        assert!(handle.finish().is_none());

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].ok);
        assert_eq!(results[0].request.bytes, 90);
        assert_eq!(results[0].response.bytes, 60);
        assert_eq!(*first, results[0]);

        // the late signal must not move the checkpoint
        assert_eq!(connection.delta().written, 5);
    }

    #[test]
    fn test_abort_before_response() {
        let connection = Connection::new();
        let (listener, results) = collecting();
        let handle = observe(put_request(&connection), Some(listener));

        connection.record_read(75);
        handle.abort();

        let results = results.lock().unwrap();
        let result = &results[0];
        assert!(!result.ok);
        assert_eq!(result.request.bytes, 75);
        assert_eq!(result.request.method, "PUT");
        assert_eq!(result.request.path, "/");
        assert_eq!(result.response.bytes, 0);
        assert!(result.response.headers.is_empty());
        assert_eq!(result.response.status, DEFAULT_STATUS);
    }

    #[test]
    fn test_missing_connection_reports_zero_bytes() {
        let (listener, results) = collecting();
        let handle = observe(RequestInfo::new("GET", "/health"), Some(listener));
        handle.set_response_head(204, Headers::new());
        handle.finish();

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].ok);
        assert_eq!(results[0].request.bytes, 0);
        assert_eq!(results[0].response.bytes, 0);
        assert_eq!(results[0].response.status, 204);
    }

    #[test]
    fn test_keep_alive_requests_sum_to_connection_totals() {
        let connection = Connection::new();
        let (listener, results) = collecting();

        for n in 1..=4u64 {
            let handle = observe(put_request(&connection), Some(listener.clone()));
            connection.record_read(1_000_000 + n);
            connection.record_written(150 + n);
            handle.finish();
        }

        let results = results.lock().unwrap();
        assert_eq!(results.len(), 4);
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result.request.bytes, 1_000_001 + i as u64);
        }
        let read: u64 = results.iter().map(|r| r.request.bytes).sum();
        let written: u64 = results.iter().map(|r| r.response.bytes).sum();
        assert_eq!(read, connection.bytes_read());
        assert_eq!(written, connection.bytes_written());
    }

    #[tokio::test]
    async fn test_elapsed_covers_delay() {
        let handle = observe(RequestInfo::new("GET", "/slow"), None);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let result = handle.finish().unwrap();
        assert!(result.elapsed_ms >= 10);
    }

    #[test]
    fn test_response_head_read_at_signal_time() {
        let handle = observe(RequestInfo::new("GET", "/"), None);
        handle.set_response_head(100, Headers::new());

        let mut headers = Headers::new();
        headers.insert(
            "content-type".to_string(),
            HeaderField::One("text/plain".to_string()),
        );
        handle.set_response_head(201, headers);
        let result = handle.finish().unwrap();
        assert_eq!(result.response.status, 201);
        assert_eq!(
            result.response.headers.get("content-type"),
            Some(&HeaderField::One("text/plain".to_string()))
        );

        handle.set_response_head(500, Headers::new());
        assert_eq!(handle.result().unwrap().response.status, 201);
    }

    #[test]
    fn test_late_listener_sees_stored_result() {
        let handle = observe(RequestInfo::new("GET", "/"), None);
        let calls = Arc::new(AtomicUsize::new(0));

        let early = calls.clone();
        handle.on_complete(move |_| {
            early.fetch_add(1, Ordering::SeqCst);
        });
        handle.abort();

        let late = calls.clone();
        handle.on_complete(move |result| {
            assert!(!result.ok);
            late.fetch_add(1, Ordering::SeqCst);
        });
        handle.finish();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_result_listeners_share_stored_result() {
        let handle = observe(RequestInfo::new("GET", "/"), None);
        let shared = Arc::new(Mutex::new(Vec::new()));

        let early = shared.clone();
        handle.on_result(move |result| early.lock().unwrap().push(result.clone()));
        let stored = handle.finish().unwrap();
        let late = shared.clone();
        handle.on_result(move |result| late.lock().unwrap().push(result.clone()));

        let seen = shared.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert!(seen.iter().all(|result| Arc::ptr_eq(result, &stored)));
    }

    #[test]
    fn test_unobserved_recorder_has_no_start() {
        let connection = Connection::new();
        let recorder = RequestStatsRecorder::new(put_request(&connection));
        assert!(recorder.start_time().is_none());
        assert_eq!(recorder.expected_total_bytes(), Some(2));
        assert!(!recorder.is_complete());

        let recorder = recorder.with_expected_total_bytes(None);
        assert_eq!(recorder.expected_total_bytes(), None);
        let handle = recorder.observe(None);
        assert!(handle.recorder().start_time().is_some());
    }

    #[test]
    fn test_transferred_tracks_in_flight_then_final() {
        let connection = Connection::new();
        connection.record_read(40);
        connection.tracker().checkpoint(&*connection);

        let handle = observe(put_request(&connection), None);
        connection.record_read(12);
        assert_eq!(handle.recorder().transferred().read, 12);

        handle.finish();
        connection.record_read(500);
        assert_eq!(handle.recorder().transferred().read, 12);
    }
}
