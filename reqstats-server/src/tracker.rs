//! Request-boundary byte accounting for shared connections
//!
//! A keep-alive connection carries several requests one after another. Its
//! counters only ever grow, so each request is charged the difference between
//! the counters at its completion and the checkpoint left by the request
//! before it.

use std::sync::Mutex;

use crate::lock;

/// Anything exposing cumulative, monotonic byte counters
pub trait ByteCounters {
    fn bytes_read(&self) -> u64;
    fn bytes_written(&self) -> u64;
}

/// Counter values captured at a request boundary
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteSnapshot {
    pub bytes_read: u64,
    pub bytes_written: u64,
}

impl ByteSnapshot {
    pub fn capture<C: ByteCounters + ?Sized>(counters: &C) -> Self {
        Self {
            bytes_read: counters.bytes_read(),
            bytes_written: counters.bytes_written(),
        }
    }
}

/// Bytes moved since the last checkpoint
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ByteDelta {
    pub read: u64,
    pub written: u64,
}

/// Checkpoint side-record owned by one connection.
///
/// The checkpoint is created lazily: a connection that never completed a
/// request counts from zero.
#[derive(Debug, Default)]
pub struct ConnectionByteTracker {
    checkpoint: Mutex<Option<ByteSnapshot>>,
}

impl ConnectionByteTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes moved since the last checkpoint, without moving it
    pub fn delta<C: ByteCounters + ?Sized>(&self, counters: &C) -> ByteDelta {
        let checkpoint = lock(&self.checkpoint);
        diff(ByteSnapshot::capture(counters), checkpoint.unwrap_or_default())
    }

    /// Move the checkpoint to the current counter values
    pub fn checkpoint<C: ByteCounters + ?Sized>(&self, counters: &C) {
        *lock(&self.checkpoint) = Some(ByteSnapshot::capture(counters));
    }

    /// Read the delta and checkpoint in one step.
    ///
    /// Both happen under the connection's lock, so two requests finishing on
    /// different worker threads are charged disjoint byte ranges.
    pub fn take_delta<C: ByteCounters + ?Sized>(&self, counters: &C) -> ByteDelta {
        let mut checkpoint = lock(&self.checkpoint);
        let current = ByteSnapshot::capture(counters);
        let delta = diff(current, checkpoint.unwrap_or_default());
        *checkpoint = Some(current);
        delta
    }

    /// Last stored checkpoint (zero when none exists yet)
    pub fn last_checkpoint(&self) -> ByteSnapshot {
        lock(&self.checkpoint).unwrap_or_default()
    }
}

fn diff(current: ByteSnapshot, previous: ByteSnapshot) -> ByteDelta {
    ByteDelta {
        read: current.bytes_read.saturating_sub(previous.bytes_read),
        written: current.bytes_written.saturating_sub(previous.bytes_written),
    }
}
