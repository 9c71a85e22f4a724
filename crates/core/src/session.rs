//! A session: one event queue, one dispatcher thread, and the indexes of
//! every live object created against them.
//!
//! All user callbacks for a session's objects run on its dispatcher
//! thread. Object creation runs inline on the caller's thread; object
//! destruction is deferred onto the session queue so the middleware
//! teardown happens on the thread that owns the object.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use gantry_middleware::{
    Bridge, Dispatcher, EventQueue, HandleId, InboxHooks, SubscriptionHooks, Transport,
};
use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::connection::ListSlot;
use crate::error::{Error, Result};
use crate::inbox::{InboxCallbacks, InboxId, InboxWrapper};
use crate::map::SyncMap;
use crate::subscription::{
    CallbackState, SubscriptionCallbacks, SubscriptionId, SubscriptionWrapper, WildcardCallbacks,
};
use crate::timer::{TimerId, TimerTickFn, TimerWrapper};

static NEXT_SESSION_SEQ: AtomicU64 = AtomicU64::new(1);

enum SubscriptionKind<'a> {
    Basic,
    Wildcard { source: &'a str },
}

/// Handle to a live session. Cheap to clone; the connection owns the
/// session until the reaper finalizes it.
#[derive(Clone)]
pub struct Session {
    pub(crate) inner: Arc<SessionInner>,
}

impl Session {
    /// Sequence number used in logs and the queue name.
    pub fn seq(&self) -> u64 {
        self.inner.seq
    }

    /// OK when the session queue has no pending events and no open
    /// objects; [`Error::QueueOpenObjects`] otherwise.
    pub fn can_destroy(&self) -> Result<()> {
        self.inner.can_destroy()
    }

    pub fn create_basic_subscription(
        &self,
        transport: &Arc<dyn Transport>,
        symbol: &str,
        callbacks: SubscriptionCallbacks,
    ) -> Result<SubscriptionId> {
        self.inner
            .create_subscription(transport, symbol, callbacks.into(), SubscriptionKind::Basic)
    }

    pub fn create_wildcard_subscription(
        &self,
        transport: &Arc<dyn Transport>,
        source: &str,
        symbol: &str,
        callbacks: WildcardCallbacks,
    ) -> Result<SubscriptionId> {
        self.inner.create_subscription(
            transport,
            symbol,
            callbacks.into(),
            SubscriptionKind::Wildcard { source },
        )
    }

    /// Clear the subscription's message callbacks without destroying it.
    /// Runs under the map lock so it cannot race a concurrent removal.
    pub fn shutdown_subscription(&self, id: SubscriptionId) -> Result<()> {
        self.inner.subscriptions.for_one(id.0, |w| {
            w.shutdown();
            Ok(())
        })
    }

    /// Destroy the subscription. Idempotent: an id that is no longer
    /// indexed is treated as already destroyed.
    pub fn destroy_subscription(&self, id: SubscriptionId) -> Result<()> {
        let ret = match self.inner.subscriptions.remove(id.0) {
            None => Ok(()),
            Some(wrapper) => self.inner.destroy_subscription_wrapper(wrapper),
        };
        log::trace!("session {}: destroy {id}: {ret:?}", self.inner.seq);
        ret
    }

    pub fn create_inbox(
        &self,
        transport: &Arc<dyn Transport>,
        callbacks: InboxCallbacks,
    ) -> Result<InboxId> {
        self.inner.create_inbox(transport, callbacks)
    }

    /// Clear the inbox's message callback without destroying it.
    pub fn shutdown_inbox(&self, id: InboxId) -> Result<()> {
        self.inner.inboxes.for_one(id.0, |w| {
            w.shutdown();
            Ok(())
        })
    }

    /// Destroy the inbox. Idempotent.
    pub fn destroy_inbox(&self, id: InboxId) -> Result<()> {
        let ret = match self.inner.inboxes.remove(id.0) {
            None => Ok(()),
            Some(wrapper) => self.inner.destroy_inbox_wrapper(wrapper),
        };
        log::trace!("session {}: destroy {id}: {ret:?}", self.inner.seq);
        ret
    }

    pub fn create_timer(
        &self,
        interval: Duration,
        on_tick: impl Fn(TimerId) + Send + Sync + 'static,
    ) -> Result<TimerId> {
        self.inner.create_timer(interval, Arc::new(on_tick))
    }

    /// Clear the timer's tick callback without destroying it.
    pub fn shutdown_timer(&self, id: TimerId) -> Result<()> {
        self.inner.timers.for_one(id.0, |w| {
            w.shutdown();
            Ok(())
        })
    }

    /// Destroy the timer. Idempotent.
    pub fn destroy_timer(&self, id: TimerId) -> Result<()> {
        let ret = match self.inner.timers.remove(id.0) {
            None => Ok(()),
            Some(wrapper) => self.inner.destroy_timer_wrapper(wrapper),
        };
        log::trace!("session {}: destroy {id}: {ret:?}", self.inner.seq);
        ret
    }
}

pub(crate) struct SessionInner {
    pub(crate) seq: u64,
    queue: OnceCell<Arc<dyn EventQueue>>,
    dispatcher: Mutex<Option<Box<dyn Dispatcher>>>,
    pub(crate) subscriptions: SyncMap<Arc<SubscriptionWrapper>>,
    pub(crate) inboxes: SyncMap<Arc<InboxWrapper>>,
    pub(crate) timers: SyncMap<Arc<TimerWrapper>>,
    /// Set by `destroy_all_events`; creates fail afterwards.
    draining: AtomicBool,
    /// Position in whichever of the connection's session lists holds this
    /// session, for O(1) removal.
    pub(crate) list_slot: Mutex<Option<ListSlot>>,
}

impl SessionInner {
    pub(crate) fn allocate() -> Self {
        Self {
            seq: NEXT_SESSION_SEQ.fetch_add(1, Ordering::Relaxed),
            queue: OnceCell::new(),
            dispatcher: Mutex::new(None),
            subscriptions: SyncMap::new(),
            inboxes: SyncMap::new(),
            timers: SyncMap::new(),
            draining: AtomicBool::new(false),
            list_slot: Mutex::new(None),
        }
    }

    /// Complete creation: queue then dispatcher. Runs on the connection's
    /// object-queue thread so queue construction is serialized against
    /// bridge state. Partial failure tears down whatever was built.
    pub(crate) fn create(&self, bridge: &Arc<dyn Bridge>) -> Result<()> {
        let ret = self.try_create(bridge);
        log::debug!("session {}: create: {ret:?}", self.seq);
        if ret.is_err() {
            let _ = self.destroy();
        }
        ret
    }

    fn try_create(&self, bridge: &Arc<dyn Bridge>) -> Result<()> {
        let queue = bridge.create_queue()?;
        queue.set_name(&format!("session-queue-{}", self.seq));
        self.queue
            .set(queue.clone())
            .map_err(|_| Error::InvalidArg("session already created"))?;
        let dispatcher = queue.create_dispatcher()?;
        *self.dispatcher.lock() = Some(dispatcher);
        Ok(())
    }

    fn queue(&self) -> Result<&Arc<dyn EventQueue>> {
        self.queue
            .get()
            .ok_or(Error::InvalidArg("session has no queue"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.draining.load(Ordering::Acquire) {
            return Err(Error::InvalidArg("session is draining"));
        }
        Ok(())
    }

    /// Stop dispatching without tearing anything down. Idempotent.
    pub(crate) fn deactivate(&self) {
        if let Some(queue) = self.queue.get() {
            queue.deactivate();
        }
        log::debug!("session {}: deactivated", self.seq);
    }

    /// Drain all three maps, scheduling the destroy of every drained
    /// object onto the session queue. After this returns no further object
    /// can be created against the session and the maps are empty.
    pub(crate) fn destroy_all_events(&self) -> Result<()> {
        self.draining.store(true, Ordering::Release);
        // a shut-down session must still pump its queue to drain
        if let Some(queue) = self.queue.get() {
            queue.activate();
        }
        log::debug!(
            "session {}: destroying {} inboxes, {} subscriptions, {} timers",
            self.seq,
            self.inboxes.len(),
            self.subscriptions.len(),
            self.timers.len()
        );
        let mut ret = Ok(());
        let r = self.inboxes.drain(|w| self.destroy_inbox_wrapper(w));
        if ret.is_ok() {
            ret = r;
        }
        let r = self
            .subscriptions
            .drain(|w| self.destroy_subscription_wrapper(w));
        if ret.is_ok() {
            ret = r;
        }
        let r = self.timers.drain(|w| self.destroy_timer_wrapper(w));
        if ret.is_ok() {
            ret = r;
        }
        ret
    }

    pub(crate) fn can_destroy(&self) -> Result<()> {
        match self.queue.get() {
            Some(queue) if !queue.can_destroy() => Err(Error::QueueOpenObjects),
            _ => Ok(()),
        }
    }

    /// Finalize: dispatcher first (stopping work), then the queue. Call
    /// only once `can_destroy` returns OK. Errors accumulate.
    pub(crate) fn destroy(&self) -> Result<()> {
        let mut ret = Ok(());
        if let Some(dispatcher) = self.dispatcher.lock().take() {
            let r = dispatcher.destroy().map_err(Error::from);
            if ret.is_ok() {
                ret = r;
            }
        }
        if let Some(queue) = self.queue.get() {
            let r = queue.destroy().map_err(Error::from);
            if ret.is_ok() {
                ret = r;
            }
        }
        log::debug!("session {}: destroyed: {ret:?}", self.seq);
        ret
    }

    fn create_subscription(
        &self,
        transport: &Arc<dyn Transport>,
        symbol: &str,
        state: CallbackState,
        kind: SubscriptionKind<'_>,
    ) -> Result<SubscriptionId> {
        self.ensure_open()?;
        let queue = self.queue()?;
        let wrapper = Arc::new(SubscriptionWrapper::new(state));
        let hooks = SubscriptionHooks {
            on_create: {
                let w = wrapper.clone();
                Arc::new(move |id| w.dispatch_create(id))
            },
            on_error: {
                let w = wrapper.clone();
                Arc::new(move |id, error| w.dispatch_error(id, error))
            },
            on_msg: {
                let w = wrapper.clone();
                Arc::new(move |id, msg, topic| w.dispatch_msg(id, msg, topic))
            },
            on_destroy: Arc::new(move |id| log::trace!("subscription {id} released")),
        };
        let handle = match kind {
            SubscriptionKind::Basic => queue.create_basic_subscription(transport, symbol, hooks)?,
            SubscriptionKind::Wildcard { source } => {
                queue.create_wildcard_subscription(transport, source, symbol, hooks)?
            }
        };
        wrapper.set_handle(handle.clone());
        self.subscriptions.insert(handle.id(), wrapper);
        log::trace!("session {}: created subscription {}", self.seq, handle.id());
        Ok(SubscriptionId(handle.id()))
    }

    fn create_inbox(
        &self,
        transport: &Arc<dyn Transport>,
        callbacks: InboxCallbacks,
    ) -> Result<InboxId> {
        self.ensure_open()?;
        let queue = self.queue()?;
        let wrapper = Arc::new(InboxWrapper::new(callbacks));
        let hooks = InboxHooks {
            on_msg: {
                let w = wrapper.clone();
                Arc::new(move |id, msg| w.dispatch_msg(id, msg))
            },
            on_error: {
                let w = wrapper.clone();
                Arc::new(move |id, error| w.dispatch_error(id, error))
            },
        };
        let handle = queue.create_inbox(transport, hooks)?;
        wrapper.set_handle(handle.clone());
        self.inboxes.insert(handle.id(), wrapper);
        log::trace!("session {}: created inbox {}", self.seq, handle.id());
        Ok(InboxId(handle.id()))
    }

    fn create_timer(&self, interval: Duration, on_tick: Arc<TimerTickFn>) -> Result<TimerId> {
        self.ensure_open()?;
        let queue = self.queue()?;
        let wrapper = Arc::new(TimerWrapper::new(on_tick));
        let hook = {
            let w = wrapper.clone();
            Arc::new(move |id: HandleId| w.dispatch_tick(id))
        };
        let handle = queue.create_timer(interval, hook)?;
        wrapper.set_handle(handle.clone());
        self.timers.insert(handle.id(), wrapper);
        log::trace!("session {}: created timer {}", self.seq, handle.id());
        Ok(TimerId(handle.id()))
    }

    /// Neutralize and schedule destruction. The wrapper is already out of
    /// the map; any callback dispatched before removal completes sees the
    /// cleared state and returns without touching user code.
    pub(crate) fn destroy_subscription_wrapper(
        &self,
        wrapper: Arc<SubscriptionWrapper>,
    ) -> Result<()> {
        wrapper.neutralize();
        let queue = self.queue()?;
        queue.enqueue(Box::new(move || {
            if let Err(e) = wrapper.finish_destroy() {
                log::warn!("deferred subscription destroy failed: {e}");
            }
        }))?;
        Ok(())
    }

    pub(crate) fn destroy_inbox_wrapper(&self, wrapper: Arc<InboxWrapper>) -> Result<()> {
        wrapper.neutralize();
        let queue = self.queue()?;
        queue.enqueue(Box::new(move || {
            if let Err(e) = wrapper.finish_destroy() {
                log::warn!("deferred inbox destroy failed: {e}");
            }
        }))?;
        Ok(())
    }

    pub(crate) fn destroy_timer_wrapper(&self, wrapper: Arc<TimerWrapper>) -> Result<()> {
        wrapper.neutralize();
        let queue = self.queue()?;
        queue.enqueue(Box::new(move || {
            if let Err(e) = wrapper.finish_destroy() {
                log::warn!("deferred timer destroy failed: {e}");
            }
        }))?;
        Ok(())
    }
}
