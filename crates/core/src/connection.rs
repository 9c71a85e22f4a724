//! A connection: the bridge, the object queue, the session lists and the
//! reaper.
//!
//! The object queue is a dedicated dispatcher used only for session
//! lifecycle events and the reaper timer; user callbacks never run on it.
//! Destroyed sessions are parked on the draining list until their queues
//! empty, at which point the reaper finalizes them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use gantry_middleware::{Bridge, Dispatcher, EventQueue, TimerHandle};
use parking_lot::Mutex;
use slab::Slab;
use smallvec::SmallVec;

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::event::CrossThreadEvent;
use crate::session::{Session, SessionInner};

/// Where a session currently sits in the connection's lists, cached on the
/// session for O(1) removal. The key is a slab index, not a reference, so
/// the slot's lifetime is independent of the session's.
#[derive(Copy, Clone, Debug)]
pub(crate) enum ListSlot {
    Active(usize),
    Draining(usize),
}

#[derive(Default)]
struct SessionLists {
    active: Slab<Arc<SessionInner>>,
    draining: Slab<Arc<SessionInner>>,
}

/// Handle to a live connection. Not clonable: the creator owns teardown.
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    bridge: Arc<dyn Bridge>,
    config: ConnectionConfig,
    object_queue: Arc<dyn EventQueue>,
    object_dispatcher: Mutex<Option<Box<dyn Dispatcher>>>,
    reaper: Mutex<Option<Arc<dyn TimerHandle>>>,
    lists: Mutex<SessionLists>,
    destroy_event: CrossThreadEvent,
    /// Raised when the bounded destroy wait expires; makes the final
    /// sweep give up so the object dispatcher can be joined.
    sweep_abort: AtomicBool,
    torn_down: AtomicBool,
}

impl Connection {
    /// Create a connection over `bridge` with the default configuration.
    pub fn create(bridge: Arc<dyn Bridge>) -> Result<Connection> {
        Self::create_with_config(bridge, ConnectionConfig::default())
    }

    pub fn create_with_config(
        bridge: Arc<dyn Bridge>,
        config: ConnectionConfig,
    ) -> Result<Connection> {
        let object_queue = bridge.create_queue()?;
        object_queue.set_name("object-queue");
        let object_dispatcher = match object_queue.clone().create_dispatcher() {
            Ok(dispatcher) => dispatcher,
            Err(e) => {
                let _ = object_queue.destroy();
                return Err(e.into());
            }
        };

        let inner = Arc::new(ConnectionInner {
            bridge,
            config,
            object_queue,
            object_dispatcher: Mutex::new(Some(object_dispatcher)),
            reaper: Mutex::new(None),
            lists: Mutex::new(SessionLists::default()),
            destroy_event: CrossThreadEvent::new(),
            sweep_abort: AtomicBool::new(false),
            torn_down: AtomicBool::new(false),
        });

        if let Err(e) = ConnectionInner::start_reaper(&inner) {
            let _ = inner.teardown_object_queue(Ok(()));
            return Err(e);
        }

        log::debug!("connection created");
        Ok(Connection { inner })
    }

    /// Create a session. Blocks the caller until the session's queue and
    /// dispatcher have been constructed on the object-queue thread.
    pub fn create_session(&self) -> Result<Session> {
        let session = Arc::new(SessionInner::allocate());
        let done = Arc::new(CrossThreadEvent::new());
        let status: Arc<Mutex<Option<Result<()>>>> = Arc::new(Mutex::new(None));

        {
            let bridge = self.inner.bridge.clone();
            let session = session.clone();
            let done = done.clone();
            let status = status.clone();
            self.inner.object_queue.enqueue(Box::new(move || {
                *status.lock() = Some(session.create(&bridge));
                done.set();
            }))?;
        }
        done.wait();

        let ret = status
            .lock()
            .take()
            .unwrap_or(Err(Error::InvalidArg("session creation reported no status")));
        ret?;

        {
            let mut lists = self.inner.lists.lock();
            let key = lists.active.insert(session.clone());
            *session.list_slot.lock() = Some(ListSlot::Active(key));
        }
        log::debug!("created session {}", session.seq);
        Ok(Session { inner: session })
    }

    /// Stop the session dispatching callbacks without destroying it.
    pub fn shutdown_session(&self, session: &Session) -> Result<()> {
        session.inner.deactivate();
        Ok(())
    }

    /// Move the session out of service. All of its open objects are
    /// scheduled for destruction; the reaper frees the session once its
    /// queue drains. Idempotent: a session that is no longer active
    /// returns OK. Does not block.
    pub fn destroy_session(&self, session: &Session) -> Result<()> {
        self.inner.destroy_session_inner(&session.inner)
    }

    /// Number of sessions currently in service.
    pub fn active_sessions(&self) -> usize {
        self.inner.lists.lock().active.len()
    }

    /// Number of sessions awaiting finalization by the reaper.
    pub fn draining_sessions(&self) -> usize {
        self.inner.lists.lock().draining.len()
    }

    /// Tear the connection down: destroy every session, wait for the
    /// final sweep to finalize them all (bounded by the configured destroy
    /// wait), then release the object queue. Errors accumulate; the first
    /// non-OK observed is returned.
    pub fn destroy(self) -> Result<()> {
        ConnectionInner::teardown(&self.inner)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if !self.inner.torn_down.load(Ordering::Acquire) {
            log::warn!("connection dropped without destroy; dispatcher threads leak");
        }
    }
}

impl ConnectionInner {
    fn start_reaper(this: &Arc<Self>) -> Result<()> {
        let weak = Arc::downgrade(this);
        let reaper = this.object_queue.create_timer(
            this.config.reaper_interval,
            Arc::new(move |_id| {
                if let Some(conn) = weak.upgrade() {
                    conn.sweep_draining_sessions();
                }
            }),
        )?;
        *this.reaper.lock() = Some(reaper);
        Ok(())
    }

    fn destroy_session_inner(&self, session: &Arc<SessionInner>) -> Result<()> {
        {
            let mut lists = self.lists.lock();
            let mut slot = session.list_slot.lock();
            match slot.take() {
                Some(ListSlot::Active(key)) => {
                    lists.active.remove(key);
                }
                other => {
                    *slot = other;
                    log::debug!("destroy_session: session {} is not active", session.seq);
                    return Ok(());
                }
            }
        }

        let ret = session.destroy_all_events();

        {
            let mut lists = self.lists.lock();
            let key = lists.draining.insert(session.clone());
            *session.list_slot.lock() = Some(ListSlot::Draining(key));
        }
        log::debug!("session {} draining: {ret:?}", session.seq);
        ret
    }

    /// One reaper pass. Runs on the object-queue thread; the list lock is
    /// never held across per-session work.
    fn sweep_draining_sessions(&self) {
        let snapshot: SmallVec<[Arc<SessionInner>; 4]> = {
            let lists = self.lists.lock();
            lists.draining.iter().map(|(_, s)| s.clone()).collect()
        };
        for session in snapshot {
            if session.can_destroy().is_err() {
                continue;
            }
            {
                let mut lists = self.lists.lock();
                let mut slot = session.list_slot.lock();
                match slot.take() {
                    Some(ListSlot::Draining(key)) => {
                        lists.draining.remove(key);
                    }
                    other => {
                        *slot = other;
                        continue;
                    }
                }
            }
            if let Err(e) = session.destroy() {
                log::warn!("finalizing session {}: {e}", session.seq);
            }
            log::debug!("session {} finalized", session.seq);
        }
    }

    fn teardown(this: &Arc<Self>) -> Result<()> {
        this.torn_down.store(true, Ordering::Release);
        let mut ret = Ok(());

        // stop the reaper first so no further ticks fire
        if let Some(reaper) = this.reaper.lock().take() {
            let r = reaper.destroy().map_err(Error::from);
            if ret.is_ok() {
                ret = r;
            }
        }

        // move every active session onto the draining list
        loop {
            let session = {
                let lists = this.lists.lock();
                lists.active.iter().next().map(|(_, s)| s.clone())
            };
            let Some(session) = session else { break };
            let r = this.destroy_session_inner(&session);
            if ret.is_ok() {
                ret = r;
            }
        }

        // the final sweep runs on the object queue, behind any session
        // lifecycle events still pending there
        let conn = this.clone();
        match this.object_queue.enqueue(Box::new(move || {
            loop {
                conn.sweep_draining_sessions();
                if conn.lists.lock().draining.is_empty()
                    || conn.sweep_abort.load(Ordering::Acquire)
                {
                    break;
                }
                if let Err(e) = conn.object_queue.timed_dispatch(conn.config.drain_dispatch_slice)
                {
                    log::warn!("final sweep dispatch failed: {e}");
                    break;
                }
            }
            conn.destroy_event.set();
        })) {
            Ok(()) => {
                let r = this.destroy_event.timed_wait(this.config.destroy_wait);
                if r.is_err() {
                    this.sweep_abort.store(true, Ordering::Release);
                    this.destroy_event.wait();
                }
                if ret.is_ok() {
                    ret = r;
                }
            }
            Err(e) => {
                if ret.is_ok() {
                    ret = Err(e.into());
                }
            }
        }

        ret = this.teardown_object_queue(ret);
        log::debug!("connection destroyed: {ret:?}");
        ret
    }

    /// Destroy the object dispatcher and queue, preserving `ret` if it
    /// already carries an error.
    fn teardown_object_queue(&self, mut ret: Result<()>) -> Result<()> {
        if let Some(dispatcher) = self.object_dispatcher.lock().take() {
            let r = dispatcher.destroy().map_err(Error::from);
            if ret.is_ok() {
                ret = r;
            }
        }
        let r = self.object_queue.destroy().map_err(Error::from);
        if ret.is_ok() {
            ret = r;
        }
        ret
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::time::Duration;

    use gantry_testing::LocalBridge;

    fn fast_config() -> ConnectionConfig {
        ConnectionConfig::new().with_reaper_interval(Duration::from_millis(20))
    }

    #[test]
    fn empty_connection_create_destroy() {
        let conn = Connection::create(LocalBridge::new()).unwrap();
        assert_eq!(conn.active_sessions(), 0);
        conn.destroy().unwrap();
    }

    #[test]
    fn session_round_trip_through_the_reaper() {
        let conn = Connection::create_with_config(LocalBridge::new(), fast_config()).unwrap();
        let session = conn.create_session().unwrap();
        assert_eq!(conn.active_sessions(), 1);
        assert!(session.can_destroy().is_ok());

        conn.destroy_session(&session).unwrap();
        assert_eq!(conn.active_sessions(), 0);

        let deadline = std::time::Instant::now() + Duration::from_secs(2);
        while conn.draining_sessions() > 0 {
            assert!(std::time::Instant::now() < deadline, "reaper never ran");
            std::thread::sleep(Duration::from_millis(5));
        }
        conn.destroy().unwrap();
    }

    #[test]
    fn sessions_drain_independently() {
        let conn = Connection::create_with_config(LocalBridge::new(), fast_config()).unwrap();
        let a = conn.create_session().unwrap();
        let b = conn.create_session().unwrap();
        assert_eq!(conn.active_sessions(), 2);

        conn.destroy_session(&a).unwrap();
        assert_eq!(conn.active_sessions(), 1);
        assert!(b.can_destroy().is_ok());

        conn.destroy().unwrap();
    }

    #[test]
    fn destroy_session_is_idempotent() {
        let conn = Connection::create_with_config(LocalBridge::new(), fast_config()).unwrap();
        let session = conn.create_session().unwrap();
        conn.destroy_session(&session).unwrap();
        conn.destroy_session(&session).unwrap();
        conn.destroy().unwrap();
    }

    #[test]
    fn draining_session_rejects_creates() {
        let conn = Connection::create_with_config(LocalBridge::new(), fast_config()).unwrap();
        let session = conn.create_session().unwrap();
        conn.destroy_session(&session).unwrap();
        assert!(matches!(
            session.create_timer(Duration::from_millis(10), |_| {}),
            Err(Error::InvalidArg(_))
        ));
        conn.destroy().unwrap();
    }
}
