//! Thread-safe lifetime management for messaging middleware objects.
//!
//! The middleware underneath hands out bare objects — subscriptions,
//! request/reply inboxes, timers — whose callbacks run on the dispatcher
//! thread of the queue they were created against, and which must be torn
//! down on that thread. This crate lets callers create and destroy those
//! objects from any thread, including from inside one of the object's own
//! callbacks, without racing the dispatcher.
//!
//! Two tiers bind object lifetimes to dispatcher threads:
//!
//! - a [`Connection`] owns the bridge, a private object queue for session
//!   lifecycle work, and the reaper that finalizes sessions once their
//!   queues drain;
//! - a [`Session`] owns one queue/dispatcher pair and indexes every live
//!   object created against it.
//!
//! Destruction is deferred: the public destroy calls remove the object
//! from its session's index, neutralize its user callbacks under the
//! object's callback gate, and enqueue the middleware teardown onto the
//! owning session queue. Once destroy returns, no user callback will start
//! again for that object; a callback already in flight on another thread
//! is waited out by the gate, not interrupted.
//!
//! The only cost added to the hot path is one uncontended lock acquisition
//! around each callback dispatch.

pub mod config;
pub mod connection;
pub mod error;
pub mod event;
pub mod inbox;
pub mod map;
pub mod session;
pub mod subscription;
pub mod timer;

pub use config::ConnectionConfig;
pub use connection::Connection;
pub use error::{Error, Result};
pub use event::CrossThreadEvent;
pub use inbox::{InboxCallbacks, InboxId};
pub use session::Session;
pub use subscription::{SubscriptionCallbacks, SubscriptionId, WildcardCallbacks};
pub use timer::TimerId;
