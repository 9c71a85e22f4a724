//! Managed timer wrapper.
//!
//! Timers carry a second lock beyond the callback gate. A repeating timer
//! re-enters the dispatcher back to back, so a destroyer contending only on
//! the callback gate could starve behind consecutive ticks. The destroy
//! gate is taken by the destroyer *outside* the callback gate; the tick
//! path opens a lock/unlock window on it after every tick, which guarantees
//! the destroyer a slot between ticks.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use gantry_middleware::{HandleId, TimerHandle};
use once_cell::sync::OnceCell;
use parking_lot::{Mutex, ReentrantMutex};

use crate::error::{Error, Result};

/// Public identity of a managed timer.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TimerId(pub(crate) HandleId);

impl TimerId {
    pub fn handle(self) -> HandleId {
        self.0
    }
}

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer{}", self.0)
    }
}

pub type TimerTickFn = dyn Fn(TimerId) + Send + Sync;

pub(crate) struct TimerWrapper {
    handle: OnceCell<Arc<dyn TimerHandle>>,
    gate: ReentrantMutex<RefCell<Option<Arc<TimerTickFn>>>>,
    /// Ordered outside `gate`; see the module docs.
    destroy_gate: Mutex<()>,
}

impl TimerWrapper {
    pub(crate) fn new(on_tick: Arc<TimerTickFn>) -> Self {
        Self {
            handle: OnceCell::new(),
            gate: ReentrantMutex::new(RefCell::new(Some(on_tick))),
            destroy_gate: Mutex::new(()),
        }
    }

    pub(crate) fn set_handle(&self, handle: Arc<dyn TimerHandle>) {
        let ok = self.handle.set(handle).is_ok();
        debug_assert!(ok, "timer handle set twice");
    }

    pub(crate) fn dispatch_tick(&self, id: HandleId) {
        {
            let gate = self.gate.lock();
            let cb = gate.borrow().clone();
            if let Some(cb) = cb {
                cb(TimerId(id));
            }
        }
        // interleaving point for a destroyer blocked on the destroy gate
        drop(self.destroy_gate.lock());
    }

    /// Clear the tick callback; subsequent ticks are no-ops.
    pub(crate) fn shutdown(&self) {
        let _destroy_gate = self.destroy_gate.lock();
        let gate = self.gate.lock();
        *gate.borrow_mut() = None;
    }

    pub(crate) fn neutralize(&self) {
        self.shutdown();
    }

    /// Runs on the session dispatcher thread; stops the middleware timer
    /// under both locks.
    pub(crate) fn finish_destroy(&self) -> Result<()> {
        let _destroy_gate = self.destroy_gate.lock();
        let _gate = self.gate.lock();
        match self.handle.get() {
            Some(handle) => Ok(handle.destroy()?),
            None => Err(Error::InvalidArg("timer has no middleware handle")),
        }
    }
}
