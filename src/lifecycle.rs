//! Server lifecycle bookkeeping.
//!
//! The state only moves forward: `NotStarted -> Started -> Closed`, or straight from
//! `NotStarted` to `Closed` when a server is closed before it was ever started.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Condvar, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ServerState {
    NotStarted = 0,
    Started = 1,
    Closed = 2,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::NotStarted,
            1 => ServerState::Started,
            _ => ServerState::Closed,
        }
    }
}

/// Atomic cell holding a [`ServerState`]; readable from any thread.
#[derive(Debug)]
pub struct Lifecycle {
    state: AtomicU8,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(ServerState::NotStarted as u8),
        }
    }

    pub fn get(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// Moves from `from` to `to`. Returns the state actually observed when the move is
    /// refused, either because the current state differs from `from` or because `to` would
    /// go backwards.
    pub fn transition(&self, from: ServerState, to: ServerState) -> Result<(), ServerState> {
        if to <= from {
            return Err(self.get());
        }
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ServerState::from_u8)
    }

    /// Forces `Closed`. Returns the previous state.
    pub fn close(&self) -> ServerState {
        ServerState::from_u8(self.state.swap(ServerState::Closed as u8, Ordering::SeqCst))
    }
}

/// One-shot latch. Servers release one when every loop thread has finished, and the TCP
/// server another when its listening socket is gone.
#[derive(Debug, Default)]
pub struct Termination {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Termination {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        *done = true;
        self.cond.notify_all();
    }

    pub fn is_released(&self) -> bool {
        *self.done.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until [`release`](Self::release) has been called.
    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap_or_else(PoisonError::into_inner);
        while !*done {
            done = self.cond.wait(done).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Releases a [`Termination`] when dropped, so a loop thread signals its exit even when it
/// unwinds.
pub(crate) struct ReleaseOnDrop<'a>(pub(crate) &'a Termination);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        self.0.release();
    }
}
