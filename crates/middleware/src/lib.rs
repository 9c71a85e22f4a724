//! The surface the managed layer assumes from the messaging middleware.
//!
//! Everything here is an interface: a concrete middleware binds a transport
//! family to [`Bridge`] and hands out queues, dispatchers, timers,
//! subscriptions and inboxes against it. The managed layer never sees past
//! these traits. `gantry-testing` carries an in-process implementation used
//! by the test suites.
//!
//! The one piece of policy this crate does own is identity: every
//! middleware object carries a [`HandleId`], assigned by the implementation
//! at creation time. The managed layer indexes its wrappers by that id, so
//! implementations must keep it stable and unique for the life of the
//! process.

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Failures surfaced by a middleware implementation.
///
/// The managed layer folds all of these into its PLATFORM error kind; the
/// distinctions exist for logging and for middleware-internal handling.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MiddlewareError {
    #[error("event queue is shut down")]
    QueueShutDown,
    #[error("object has already been destroyed")]
    AlreadyDestroyed,
    #[error("transport type not supported by this middleware")]
    TransportMismatch,
    #[error("platform failure: {0}")]
    Platform(String),
}

pub type MwResult<T> = Result<T, MiddlewareError>;

/// Process-unique identity of a middleware object.
///
/// Wrappers in the managed layer are keyed by this id rather than by the
/// address of the underlying object, so no layout tricks are needed to go
/// from a handle back to its wrapper.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct HandleId(u64);

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

impl HandleId {
    /// Allocate the next process-unique id.
    pub fn allocate() -> Self {
        HandleId(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A delivered message.
#[derive(Clone, Debug, Default)]
pub struct Msg {
    payload: Bytes,
}

impl Msg {
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Msg {
            payload: payload.into(),
        }
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A one-shot work item enqueued on an event queue.
pub type QueueEvent = Box<dyn FnOnce() + Send>;

/// Timer tick hook; receives the id of the firing timer.
pub type TickFn = Arc<dyn Fn(HandleId) + Send + Sync>;

/// Hooks a subscription is created with. All of them run on the thread
/// dispatching the subscription's queue.
pub struct SubscriptionHooks {
    pub on_create: Arc<dyn Fn(HandleId) + Send + Sync>,
    pub on_error: Arc<dyn Fn(HandleId, &MiddlewareError) + Send + Sync>,
    /// Message delivery. The topic is `Some` for wildcard subscriptions and
    /// `None` for basic ones.
    pub on_msg: Arc<dyn Fn(HandleId, &Msg, Option<&str>) + Send + Sync>,
    /// Fired once, after [`SubscriptionHandle::destroy`] has taken effect
    /// and no further hook will run. The implementation must drop its copy
    /// of these hooks when this returns.
    pub on_destroy: Arc<dyn Fn(HandleId) + Send + Sync>,
}

/// Hooks an inbox is created with.
pub struct InboxHooks {
    pub on_msg: Arc<dyn Fn(HandleId, &Msg) + Send + Sync>,
    pub on_error: Arc<dyn Fn(HandleId, &MiddlewareError) + Send + Sync>,
}

/// An instance of the middleware bound to a transport family.
pub trait Bridge: Send + Sync {
    /// Create an event queue. Events enqueued against it run on whatever
    /// dispatcher is later created for it.
    fn create_queue(&self) -> MwResult<Arc<dyn EventQueue>>;
}

/// An event queue plus the factory for objects whose callbacks it serves.
pub trait EventQueue: Send + Sync {
    fn set_name(&self, name: &str);

    /// Enqueue a one-shot event.
    fn enqueue(&self, event: QueueEvent) -> MwResult<()>;

    /// Pump pending events on the calling thread for up to `slice`.
    /// Permitted from the dispatcher thread itself; events run inline.
    fn timed_dispatch(&self, slice: Duration) -> MwResult<()>;

    /// Pause dispatching. Idempotent. Events keep accumulating.
    fn deactivate(&self);

    /// Resume dispatching after [`EventQueue::deactivate`]. Idempotent.
    fn activate(&self);

    /// True when the queue has no pending events and no open objects
    /// (timers, subscriptions, inboxes) created against it.
    fn can_destroy(&self) -> bool;

    /// Start a dispatcher thread pumping this queue. At most one dispatcher
    /// per queue.
    fn create_dispatcher(self: Arc<Self>) -> MwResult<Box<dyn Dispatcher>>;

    fn create_timer(&self, interval: Duration, on_tick: TickFn) -> MwResult<Arc<dyn TimerHandle>>;

    fn create_basic_subscription(
        &self,
        transport: &Arc<dyn Transport>,
        symbol: &str,
        hooks: SubscriptionHooks,
    ) -> MwResult<Arc<dyn SubscriptionHandle>>;

    fn create_wildcard_subscription(
        &self,
        transport: &Arc<dyn Transport>,
        source: &str,
        symbol: &str,
        hooks: SubscriptionHooks,
    ) -> MwResult<Arc<dyn SubscriptionHandle>>;

    fn create_inbox(
        &self,
        transport: &Arc<dyn Transport>,
        hooks: InboxHooks,
    ) -> MwResult<Arc<dyn InboxHandle>>;

    /// Tear the queue down. Call only after its dispatcher is destroyed and
    /// [`EventQueue::can_destroy`] holds.
    fn destroy(&self) -> MwResult<()>;
}

/// The thread pumping an event queue.
pub trait Dispatcher: Send {
    /// Stop pumping and join the thread.
    fn destroy(self: Box<Self>) -> MwResult<()>;
}

/// An opaque transport endpoint. Implementations downcast through
/// [`Transport::as_any`] to recover their own type.
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;
    fn as_any(&self) -> &dyn Any;
}

pub trait TimerHandle: Send + Sync {
    fn id(&self) -> HandleId;
    /// Stop the timer. No tick hook runs after this returns, though ticks
    /// already enqueued may still be drained as no-ops.
    fn destroy(&self) -> MwResult<()>;
}

pub trait SubscriptionHandle: Send + Sync {
    fn id(&self) -> HandleId;
    /// Begin teardown. Destruction is deferred: the middleware delivers the
    /// `on_destroy` hook on the owning queue thread once the subscription
    /// is fully unwound, and releases its hooks afterwards.
    fn destroy(&self) -> MwResult<()>;
}

pub trait InboxHandle: Send + Sync {
    fn id(&self) -> HandleId;
    /// Tear down inline; the implementation releases its hooks before
    /// returning.
    fn destroy(&self) -> MwResult<()>;
}
