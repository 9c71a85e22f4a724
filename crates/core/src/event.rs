//! Manual-reset event usable across threads.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{Error, Result};

/// A manual-reset signal: once set, all current and future waiters return
/// until [`CrossThreadEvent::reset`] is called.
///
/// Used to join on work handed to another thread, e.g. session creation on
/// the connection's object queue and the final teardown sweep.
pub struct CrossThreadEvent {
    signaled: Mutex<bool>,
    cond: Condvar,
}

impl CrossThreadEvent {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Signal the event and wake every waiter. Idempotent.
    pub fn set(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cond.notify_all();
    }

    /// Return the event to the non-signaled state.
    pub fn reset(&self) {
        *self.signaled.lock() = false;
    }

    /// Block until the event is signaled. Returns immediately if it
    /// already is.
    pub fn wait(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
    }

    /// As [`CrossThreadEvent::wait`], but gives up with [`Error::Timeout`]
    /// once `timeout` has elapsed without the event becoming signaled.
    pub fn timed_wait(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut signaled = self.signaled.lock();
        while !*signaled {
            if self.cond.wait_until(&mut signaled, deadline).timed_out() {
                return if *signaled { Ok(()) } else { Err(Error::Timeout) };
            }
        }
        Ok(())
    }
}

impl Default for CrossThreadEvent {
    fn default() -> Self {
        Self::new()
    }
}
