//! Live progress of in-flight requests

use reqstats_common::{ProgressSnapshot, RequestProgress, ResponseProgress};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::recorder::{RecorderHandle, RequestStatsRecorder};

#[derive(Debug, Clone, Copy)]
struct PollCheckpoint {
    at: Instant,
    read: u64,
    written: u64,
}

/// Computes speed and ETA between successive polls.
///
/// Keeps its own checkpoint of time and request bytes. The connection's
/// request-boundary checkpoint is only ever read, so polling has no effect on
/// the bytes a request is finally charged.
#[derive(Debug, Default)]
pub struct ProgressReporter {
    last: Option<PollCheckpoint>,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` until the recorder has been observed
    pub fn poll(&mut self, recorder: &RequestStatsRecorder) -> Option<ProgressSnapshot> {
        let started = recorder.start_time()?;
        let now = Instant::now();
        let completed = recorder.is_complete();
        let transferred = recorder.transferred();

        let last = self.last.unwrap_or(PollCheckpoint {
            at: started,
            read: 0,
            written: 0,
        });
        let elapsed_delta = now.saturating_duration_since(last.at);
        let read_delta = transferred.read.saturating_sub(last.read);
        let written_delta = transferred.written.saturating_sub(last.written);
        self.last = Some(PollCheckpoint {
            at: now,
            read: transferred.read,
            written: transferred.written,
        });

        let upload_speed = per_second(read_delta, elapsed_delta);
        let bytes_remaining = recorder
            .expected_total_bytes()
            .map(|expected| expected.saturating_sub(transferred.read));
        let eta_ms = bytes_remaining.map(|remaining| {
            if upload_speed > 0.0 {
                (remaining as f64 / upload_speed * 1000.0).round() as u64
            } else {
                0
            }
        });

        let snapshot = ProgressSnapshot {
            completed,
            elapsed_ms: now.saturating_duration_since(started).as_millis() as u64,
            elapsed_delta_ms: elapsed_delta.as_millis() as u64,
            request: RequestProgress {
                bytes: transferred.read,
                bytes_delta: read_delta,
                bytes_per_second: upload_speed,
                bytes_remaining,
                eta_ms,
            },
            response: ResponseProgress {
                bytes: transferred.written,
                bytes_delta: written_delta,
                bytes_per_second: per_second(written_delta, elapsed_delta),
            },
        };
        trace!(path = %recorder.request().path, ?snapshot, "Progress polled");
        Some(snapshot)
    }
}

fn per_second(bytes: u64, elapsed: Duration) -> f64 {
    let secs = elapsed.as_secs_f64();
    if secs > 0.0 {
        bytes as f64 / secs
    } else {
        0.0
    }
}

/// Log progress of one request every `interval` until it completes
pub async fn log_progress(handle: RecorderHandle, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // first tick fires immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(progress) = handle.progress() else {
            continue;
        };
        if progress.completed {
            break;
        }
        debug!(
            method = %handle.request().method,
            path = %handle.request().path,
            elapsed_ms = progress.elapsed_ms,
            request_bytes = progress.request.bytes,
            upload_bps = progress.request.bytes_per_second as u64,
            eta_ms = ?progress.request.eta_ms,
            response_bytes = progress.response.bytes,
            download_bps = progress.response.bytes_per_second as u64,
            "Request in flight"
        );
    }
}
