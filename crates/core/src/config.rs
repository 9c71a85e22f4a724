use std::time::Duration;

/// Default interval at which the reaper visits draining sessions.
const REAPER_INTERVAL_SECS: u64 = 1;

/// Default slice handed to the object queue while the final teardown sweep
/// waits for session queues to drain.
const DRAIN_DISPATCH_MILLIS: u64 = 10;

/// Default bound on how long connection teardown waits for every session
/// to drain before giving up with a timeout.
const DESTROY_WAIT_SECS: u64 = 10;

/// Tunables for a [`Connection`](crate::Connection).
#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    pub(crate) reaper_interval: Duration,
    pub(crate) drain_dispatch_slice: Duration,
    pub(crate) destroy_wait: Duration,
}

impl ConnectionConfig {
    pub fn new() -> Self {
        Self {
            reaper_interval: Duration::from_secs(REAPER_INTERVAL_SECS),
            drain_dispatch_slice: Duration::from_millis(DRAIN_DISPATCH_MILLIS),
            destroy_wait: Duration::from_secs(DESTROY_WAIT_SECS),
        }
    }

    /// Sets how often the reaper checks whether a draining session can be
    /// finalized.
    pub fn with_reaper_interval(mut self, interval: Duration) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Sets the dispatch slice used between sweeps of the final teardown
    /// loop.
    pub fn with_drain_dispatch_slice(mut self, slice: Duration) -> Self {
        self.drain_dispatch_slice = slice;
        self
    }

    /// Sets the bound on how long [`Connection::destroy`](crate::Connection::destroy)
    /// waits for all sessions to drain.
    pub fn with_destroy_wait(mut self, wait: Duration) -> Self {
        self.destroy_wait = wait;
        self
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::new()
    }
}
