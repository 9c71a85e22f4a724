//! Managed subscription wrapper.
//!
//! Pairs the middleware subscription handle with the user's callbacks
//! behind the callback gate. Middleware hooks land in the `dispatch_*`
//! methods on the session's dispatcher thread; `shutdown` and the destroy
//! path neutralize the callbacks from any thread.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use gantry_middleware::{HandleId, MiddlewareError, Msg, SubscriptionHandle};
use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;

use crate::error::{Error, Result};

/// Public identity of a managed subscription.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SubscriptionId(pub(crate) HandleId);

impl SubscriptionId {
    pub fn handle(self) -> HandleId {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub{}", self.0)
    }
}

pub type SubscriptionCreateFn = dyn Fn(SubscriptionId) + Send + Sync;
pub type SubscriptionErrorFn = dyn Fn(SubscriptionId, &MiddlewareError) + Send + Sync;
pub type SubscriptionMsgFn = dyn Fn(SubscriptionId, &Msg) + Send + Sync;
pub type WildcardMsgFn = dyn Fn(SubscriptionId, &str, &Msg) + Send + Sync;

/// Callbacks for a basic subscription.
#[derive(Default)]
pub struct SubscriptionCallbacks {
    pub(crate) on_create: Option<Arc<SubscriptionCreateFn>>,
    pub(crate) on_error: Option<Arc<SubscriptionErrorFn>>,
    pub(crate) on_msg: Option<Arc<SubscriptionMsgFn>>,
}

impl SubscriptionCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(mut self, f: impl Fn(SubscriptionId) + Send + Sync + 'static) -> Self {
        self.on_create = Some(Arc::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(SubscriptionId, &MiddlewareError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_msg(mut self, f: impl Fn(SubscriptionId, &Msg) + Send + Sync + 'static) -> Self {
        self.on_msg = Some(Arc::new(f));
        self
    }
}

/// Callbacks for a wildcard subscription; message delivery carries the
/// matched topic.
#[derive(Default)]
pub struct WildcardCallbacks {
    pub(crate) on_create: Option<Arc<SubscriptionCreateFn>>,
    pub(crate) on_error: Option<Arc<SubscriptionErrorFn>>,
    pub(crate) on_msg: Option<Arc<WildcardMsgFn>>,
}

impl WildcardCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_create(mut self, f: impl Fn(SubscriptionId) + Send + Sync + 'static) -> Self {
        self.on_create = Some(Arc::new(f));
        self
    }

    pub fn on_error(
        mut self,
        f: impl Fn(SubscriptionId, &MiddlewareError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_msg(
        mut self,
        f: impl Fn(SubscriptionId, &str, &Msg) + Send + Sync + 'static,
    ) -> Self {
        self.on_msg = Some(Arc::new(f));
        self
    }
}

/// Unified callback state; a basic subscription leaves the wildcard slot
/// empty and vice versa.
#[derive(Default)]
pub(crate) struct CallbackState {
    on_create: Option<Arc<SubscriptionCreateFn>>,
    on_error: Option<Arc<SubscriptionErrorFn>>,
    on_msg_basic: Option<Arc<SubscriptionMsgFn>>,
    on_msg_wildcard: Option<Arc<WildcardMsgFn>>,
}

impl From<SubscriptionCallbacks> for CallbackState {
    fn from(cbs: SubscriptionCallbacks) -> Self {
        CallbackState {
            on_create: cbs.on_create,
            on_error: cbs.on_error,
            on_msg_basic: cbs.on_msg,
            on_msg_wildcard: None,
        }
    }
}

impl From<WildcardCallbacks> for CallbackState {
    fn from(cbs: WildcardCallbacks) -> Self {
        CallbackState {
            on_create: cbs.on_create,
            on_error: cbs.on_error,
            on_msg_basic: None,
            on_msg_wildcard: cbs.on_msg,
        }
    }
}

pub(crate) struct SubscriptionWrapper {
    handle: OnceCell<Arc<dyn SubscriptionHandle>>,
    /// The callback gate. Dispatch holds it across the user callback, so a
    /// cross-thread neutralization blocks until the callback returns while
    /// the dispatcher thread itself may re-enter (destroy-from-callback).
    gate: ReentrantMutex<RefCell<CallbackState>>,
}

impl SubscriptionWrapper {
    pub(crate) fn new(state: CallbackState) -> Self {
        Self {
            handle: OnceCell::new(),
            gate: ReentrantMutex::new(RefCell::new(state)),
        }
    }

    pub(crate) fn set_handle(&self, handle: Arc<dyn SubscriptionHandle>) {
        let ok = self.handle.set(handle).is_ok();
        debug_assert!(ok, "subscription handle set twice");
    }

    pub(crate) fn dispatch_create(&self, id: HandleId) {
        let gate = self.gate.lock();
        let cb = gate.borrow().on_create.clone();
        if let Some(cb) = cb {
            cb(SubscriptionId(id));
        }
    }

    pub(crate) fn dispatch_error(&self, id: HandleId, error: &MiddlewareError) {
        let gate = self.gate.lock();
        let cb = gate.borrow().on_error.clone();
        if let Some(cb) = cb {
            cb(SubscriptionId(id), error);
        }
    }

    pub(crate) fn dispatch_msg(&self, id: HandleId, msg: &Msg, topic: Option<&str>) {
        let gate = self.gate.lock();
        match topic {
            Some(topic) => {
                let cb = gate.borrow().on_msg_wildcard.clone();
                if let Some(cb) = cb {
                    cb(SubscriptionId(id), topic, msg);
                }
            }
            None => {
                let cb = gate.borrow().on_msg_basic.clone();
                if let Some(cb) = cb {
                    cb(SubscriptionId(id), msg);
                }
            }
        }
    }

    /// Clear the message callbacks. The map entry stays; later deliveries
    /// find nothing to call.
    pub(crate) fn shutdown(&self) {
        let gate = self.gate.lock();
        let mut state = gate.borrow_mut();
        state.on_msg_basic = None;
        state.on_msg_wildcard = None;
    }

    /// Clear every callback ahead of the destroy event.
    pub(crate) fn neutralize(&self) {
        let gate = self.gate.lock();
        *gate.borrow_mut() = CallbackState::default();
    }

    /// Runs on the session dispatcher thread. The middleware destroy
    /// happens under the gate; the wrapper itself is released once the
    /// middleware delivers its deferred on-destroy hook and drops the
    /// dispatch closures.
    pub(crate) fn finish_destroy(&self) -> Result<()> {
        let _gate = self.gate.lock();
        match self.handle.get() {
            Some(handle) => Ok(handle.destroy()?),
            None => Err(Error::InvalidArg("subscription has no middleware handle")),
        }
    }
}
