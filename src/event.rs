//! Auto-reset signal primitive
//!
//! Hands control from the MIDI driver callback thread back to a blocked
//! caller. Binary and auto-resetting: `signal` wakes at most one waiter, a
//! signal posted with no waiter present satisfies the next `wait`, and a
//! satisfied `wait` clears the signal so the following `wait` blocks again.

use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// Named binary signal. The name only labels log output; nothing is
/// registered process-wide.
pub struct SignalEvent {
    name: String,
    signaled: Mutex<bool>,
    condvar: Condvar,
}

impl SignalEvent {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            signaled: Mutex::new(false),
            condvar: Condvar::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Post the signal, waking at most one waiter. Posting while already
    /// signaled is a no-op (binary, not counting).
    pub fn signal(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        trace!("event '{}' signaled", self.name);
        self.condvar.notify_one();
    }

    /// Block until signaled, then consume the signal.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        self.condvar.wait_while(&mut signaled, |set| !*set);
        *signaled = false;
    }

    /// Block until signaled or the timeout elapses. Returns `true` when the
    /// signal was consumed, `false` on timeout.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut signaled = self.signaled.lock();
        let result = self
            .condvar
            .wait_while_for(&mut signaled, |set| !*set, timeout);
        if *signaled {
            *signaled = false;
            true
        } else {
            debug_assert!(result.timed_out());
            false
        }
    }

    /// Drop any pending signal without blocking. Used when re-arming a
    /// session so a stale signal cannot satisfy the next wait.
    pub fn clear(&self) {
        *self.signaled.lock() = false;
    }
}
