//! Reqstats - per-request HTTP traffic and timing stats
//!
//! Byte counts are taken from the connection, so requests sharing a
//! keep-alive connection are each charged only for their own traffic.

pub mod body;
pub mod connection;
pub mod events;
pub mod gate;
pub mod hub;
pub mod progress;
pub mod recorder;
pub mod server;
pub mod tracker;

pub use connection::{Connection, ConnectionId, CountingIo};
pub use events::{EventKind, StatsEvent, StatsEvents, SubscriptionId};
pub use gate::{Completion, CompletionGate, GateState};
pub use hub::ServerStatsHub;
pub use progress::ProgressReporter;
pub use recorder::{observe, RecorderHandle, RequestInfo, RequestStatsRecorder, StatsListener};
pub use reqstats_common::{ProgressSnapshot, StatsResult};
pub use server::HttpStatsServer;
pub use tracker::{ByteCounters, ByteDelta, ByteSnapshot, ConnectionByteTracker};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
