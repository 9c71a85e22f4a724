//! Managed inbox wrapper.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use gantry_middleware::{HandleId, InboxHandle, MiddlewareError, Msg};
use once_cell::sync::OnceCell;
use parking_lot::ReentrantMutex;

use crate::error::{Error, Result};

/// Public identity of a managed inbox.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct InboxId(pub(crate) HandleId);

impl InboxId {
    pub fn handle(self) -> HandleId {
        self.0
    }
}

impl fmt::Display for InboxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inbox{}", self.0)
    }
}

pub type InboxMsgFn = dyn Fn(InboxId, &Msg) + Send + Sync;
pub type InboxErrorFn = dyn Fn(InboxId, &MiddlewareError) + Send + Sync;

/// Callbacks for an inbox. The message callback is mandatory, the error
/// callback optional.
pub struct InboxCallbacks {
    pub(crate) on_msg: Option<Arc<InboxMsgFn>>,
    pub(crate) on_error: Option<Arc<InboxErrorFn>>,
}

impl InboxCallbacks {
    pub fn new(on_msg: impl Fn(InboxId, &Msg) + Send + Sync + 'static) -> Self {
        Self {
            on_msg: Some(Arc::new(on_msg)),
            on_error: None,
        }
    }

    pub fn on_error(
        mut self,
        f: impl Fn(InboxId, &MiddlewareError) + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }
}

#[derive(Default)]
struct CallbackState {
    on_msg: Option<Arc<InboxMsgFn>>,
    on_error: Option<Arc<InboxErrorFn>>,
}

pub(crate) struct InboxWrapper {
    handle: OnceCell<Arc<dyn InboxHandle>>,
    gate: ReentrantMutex<RefCell<CallbackState>>,
}

impl InboxWrapper {
    pub(crate) fn new(cbs: InboxCallbacks) -> Self {
        Self {
            handle: OnceCell::new(),
            gate: ReentrantMutex::new(RefCell::new(CallbackState {
                on_msg: cbs.on_msg,
                on_error: cbs.on_error,
            })),
        }
    }

    pub(crate) fn set_handle(&self, handle: Arc<dyn InboxHandle>) {
        let ok = self.handle.set(handle).is_ok();
        debug_assert!(ok, "inbox handle set twice");
    }

    pub(crate) fn dispatch_msg(&self, id: HandleId, msg: &Msg) {
        let gate = self.gate.lock();
        let cb = gate.borrow().on_msg.clone();
        if let Some(cb) = cb {
            cb(InboxId(id), msg);
        }
    }

    pub(crate) fn dispatch_error(&self, id: HandleId, error: &MiddlewareError) {
        let gate = self.gate.lock();
        let cb = gate.borrow().on_error.clone();
        if let Some(cb) = cb {
            cb(InboxId(id), error);
        }
    }

    /// Clear the message callback; error reporting stays live until
    /// destroy.
    pub(crate) fn shutdown(&self) {
        let gate = self.gate.lock();
        gate.borrow_mut().on_msg = None;
    }

    pub(crate) fn neutralize(&self) {
        let gate = self.gate.lock();
        *gate.borrow_mut() = CallbackState::default();
    }

    /// Runs on the session dispatcher thread; the middleware inbox is torn
    /// down inline and the wrapper is released when the destroy event and
    /// the middleware drop their references.
    pub(crate) fn finish_destroy(&self) -> Result<()> {
        let _gate = self.gate.lock();
        match self.handle.get() {
            Some(handle) => Ok(handle.destroy()?),
            None => Err(Error::InvalidArg("inbox has no middleware handle")),
        }
    }
}
