//! In-process middleware used by the gantry test suites.
//!
//! Everything runs inside the test process: queues are channels pumped by
//! real dispatcher threads, timers are threads ticking on a timeout,
//! subscriptions and inboxes hang off a [`LoopbackTransport`] that tests
//! drive directly with [`LoopbackTransport::publish`] and
//! [`LoopbackTransport::post_inbox`]. The concurrency is real even though
//! no wire is involved, which is the point: the managed layer's locking is
//! exercised by genuine cross-thread races.

use std::sync::Arc;

use gantry_middleware::{Bridge, EventQueue, MwResult};

mod queue;
mod timer;
mod transport;

pub use queue::LocalQueue;
pub use transport::LoopbackTransport;

/// A bridge whose queues live entirely in this process.
pub struct LocalBridge;

impl LocalBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(LocalBridge)
    }
}

impl Bridge for LocalBridge {
    fn create_queue(&self) -> MwResult<Arc<dyn EventQueue>> {
        Ok(LocalQueue::new())
    }
}
