//! Single-fire completion gate

use std::sync::atomic::{AtomicU8, Ordering};

const PENDING: u8 = 0;
const FIRED: u8 = 1;

/// How a response reached its end
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// Response completed and was flushed to the peer
    Finished,
    /// Connection went away before the response completed
    Aborted,
}

impl Completion {
    pub fn is_ok(self) -> bool {
        self == Completion::Finished
    }
}

/// Gate state; `Pending -> Fired` is the only transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Pending,
    Fired,
}

/// Lets exactly one terminal signal through.
///
/// A response can see both "finished" and "closed" in quick succession; the
/// first one to reach the gate decides the outcome and every later one is a
/// no-op.
#[derive(Debug)]
pub struct CompletionGate {
    state: AtomicU8,
}

impl CompletionGate {
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
        }
    }

    /// Run `build` if the gate is still pending.
    ///
    /// Returns `None` without calling `build` once the gate has fired.
    pub fn fire<T, F>(&self, build: F) -> Option<T>
    where
        F: FnOnce() -> T,
    {
        self.state
            .compare_exchange(PENDING, FIRED, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| build())
    }

    pub fn state(&self) -> GateState {
        match self.state.load(Ordering::Acquire) {
            PENDING => GateState::Pending,
            _ => GateState::Fired,
        }
    }

    pub fn is_fired(&self) -> bool {
        self.state() == GateState::Fired
    }
}

impl Default for CompletionGate {
    fn default() -> Self {
        Self::new()
    }
}
