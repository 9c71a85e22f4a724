//! Loopback transport: topic-matched subscription delivery and
//! point-to-point inbox delivery, all in-process.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use gantry_middleware::{
    EventQueue, HandleId, InboxHandle, InboxHooks, MiddlewareError, Msg, MwResult,
    SubscriptionHandle, SubscriptionHooks, Transport,
};
use parking_lot::Mutex;

use crate::queue::LocalQueue;

enum TopicMatcher {
    /// Basic subscription: the topic must equal the symbol.
    Exact(String),
    /// Wildcard subscription: topics under `source.`; `*` as the symbol
    /// matches everything below the source.
    Prefixed { source: String, symbol: String },
}

impl TopicMatcher {
    fn matches(&self, topic: &str) -> bool {
        match self {
            TopicMatcher::Exact(symbol) => topic == symbol,
            TopicMatcher::Prefixed { source, symbol } => {
                match topic.strip_prefix(source.as_str()).and_then(|t| t.strip_prefix('.')) {
                    Some(rest) => symbol == "*" || rest == symbol,
                    None => false,
                }
            }
        }
    }
}

struct SubscriptionEntry {
    id: HandleId,
    matcher: TopicMatcher,
    subscription: Weak<LocalSubscription>,
}

#[derive(Default)]
struct Registry {
    subscriptions: Vec<SubscriptionEntry>,
    inboxes: HashMap<HandleId, Weak<LocalInbox>>,
}

/// The in-process transport endpoint. Tests publish messages and post
/// inbox replies directly on it.
pub struct LoopbackTransport {
    self_weak: Weak<LoopbackTransport>,
    name: String,
    registry: Mutex<Registry>,
}

impl LoopbackTransport {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        Arc::new_cyclic(|self_weak| LoopbackTransport {
            self_weak: self_weak.clone(),
            name,
            registry: Mutex::new(Registry::default()),
        })
    }

    pub(crate) fn downcast(transport: &Arc<dyn Transport>) -> MwResult<Arc<LoopbackTransport>> {
        transport
            .as_any()
            .downcast_ref::<LoopbackTransport>()
            .and_then(|t| t.self_weak.upgrade())
            .ok_or(MiddlewareError::TransportMismatch)
    }

    /// Deliver `msg` to every live subscription whose pattern matches
    /// `topic`, on each subscription's own queue thread. Returns the
    /// number of subscriptions hit.
    pub fn publish(&self, topic: &str, msg: Msg) -> usize {
        let targets: Vec<Arc<LocalSubscription>> = {
            let registry = self.registry.lock();
            registry
                .subscriptions
                .iter()
                .filter(|e| e.matcher.matches(topic))
                .filter_map(|e| e.subscription.upgrade())
                .collect()
        };
        let delivered = targets.len();
        for subscription in targets {
            subscription.deliver(topic, msg.clone());
        }
        delivered
    }

    /// Deliver `msg` to the inbox with the given handle id, if it is still
    /// live.
    pub fn post_inbox(&self, inbox: HandleId, msg: Msg) -> bool {
        let target = self.registry.lock().inboxes.get(&inbox).and_then(Weak::upgrade);
        match target {
            Some(inbox) => {
                inbox.deliver(msg);
                true
            }
            None => false,
        }
    }

    /// Report an error against the inbox with the given handle id.
    pub fn post_inbox_error(&self, inbox: HandleId, error: MiddlewareError) -> bool {
        let target = self.registry.lock().inboxes.get(&inbox).and_then(Weak::upgrade);
        match target {
            Some(inbox) => {
                inbox.deliver_error(error);
                true
            }
            None => false,
        }
    }

    fn unregister_subscription(&self, id: HandleId) {
        self.registry.lock().subscriptions.retain(|e| e.id != id);
    }

    fn unregister_inbox(&self, id: HandleId) {
        self.registry.lock().inboxes.remove(&id);
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct LocalSubscription {
    id: HandleId,
    wildcard: bool,
    queue: Weak<LocalQueue>,
    transport: Weak<LoopbackTransport>,
    self_weak: Weak<LocalSubscription>,
    hooks: Mutex<Option<SubscriptionHooks>>,
    destroyed: AtomicBool,
}

impl LocalSubscription {
    pub(crate) fn register_basic(
        queue: Arc<LocalQueue>,
        transport: Arc<LoopbackTransport>,
        symbol: &str,
        hooks: SubscriptionHooks,
    ) -> MwResult<Arc<dyn SubscriptionHandle>> {
        Self::register(
            queue,
            transport,
            TopicMatcher::Exact(symbol.to_owned()),
            false,
            hooks,
        )
    }

    pub(crate) fn register_wildcard(
        queue: Arc<LocalQueue>,
        transport: Arc<LoopbackTransport>,
        source: &str,
        symbol: &str,
        hooks: SubscriptionHooks,
    ) -> MwResult<Arc<dyn SubscriptionHandle>> {
        Self::register(
            queue,
            transport,
            TopicMatcher::Prefixed {
                source: source.to_owned(),
                symbol: symbol.to_owned(),
            },
            true,
            hooks,
        )
    }

    fn register(
        queue: Arc<LocalQueue>,
        transport: Arc<LoopbackTransport>,
        matcher: TopicMatcher,
        wildcard: bool,
        hooks: SubscriptionHooks,
    ) -> MwResult<Arc<dyn SubscriptionHandle>> {
        let subscription = Arc::new_cyclic(|self_weak| LocalSubscription {
            id: HandleId::allocate(),
            wildcard,
            queue: Arc::downgrade(&queue),
            transport: Arc::downgrade(&transport),
            self_weak: self_weak.clone(),
            hooks: Mutex::new(Some(hooks)),
            destroyed: AtomicBool::new(false),
        });
        transport
            .registry
            .lock()
            .subscriptions
            .push(SubscriptionEntry {
                id: subscription.id,
                matcher,
                subscription: Arc::downgrade(&subscription),
            });
        queue.object_opened();

        // the create hook is delivered on the queue thread, like every
        // other subscription callback
        let weak = subscription.self_weak.clone();
        let _ = queue.enqueue(Box::new(move || {
            let Some(sub) = weak.upgrade() else { return };
            let on_create = sub.hooks.lock().as_ref().map(|h| h.on_create.clone());
            if let Some(on_create) = on_create {
                on_create(sub.id);
            }
        }));

        Ok(subscription)
    }

    fn deliver(&self, topic: &str, msg: Msg) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let topic = self.wildcard.then(|| topic.to_owned());
        let weak = self.self_weak.clone();
        let _ = queue.enqueue(Box::new(move || {
            let Some(sub) = weak.upgrade() else { return };
            let on_msg = sub.hooks.lock().as_ref().map(|h| h.on_msg.clone());
            if let Some(on_msg) = on_msg {
                on_msg(sub.id, &msg, topic.as_deref());
            }
        }));
    }
}

impl SubscriptionHandle for LocalSubscription {
    fn id(&self) -> HandleId {
        self.id
    }

    fn destroy(&self) -> MwResult<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(MiddlewareError::AlreadyDestroyed);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.unregister_subscription(self.id);
        }
        // destruction completes on the queue thread: the on-destroy hook
        // fires there and the hooks are released with it
        let enqueued = match self.queue.upgrade() {
            Some(queue) => {
                let weak = self.self_weak.clone();
                let ret = queue.enqueue(Box::new(move || {
                    let Some(sub) = weak.upgrade() else { return };
                    if let Some(hooks) = sub.hooks.lock().take() {
                        (hooks.on_destroy)(sub.id);
                    }
                }));
                queue.object_closed();
                ret.is_ok()
            }
            None => false,
        };
        if !enqueued {
            *self.hooks.lock() = None;
        }
        log::trace!("subscription {} destroyed", self.id);
        Ok(())
    }
}

pub struct LocalInbox {
    id: HandleId,
    queue: Weak<LocalQueue>,
    transport: Weak<LoopbackTransport>,
    self_weak: Weak<LocalInbox>,
    hooks: Mutex<Option<InboxHooks>>,
    destroyed: AtomicBool,
}

impl LocalInbox {
    pub(crate) fn register(
        queue: Arc<LocalQueue>,
        transport: Arc<LoopbackTransport>,
        hooks: InboxHooks,
    ) -> MwResult<Arc<dyn InboxHandle>> {
        let inbox = Arc::new_cyclic(|self_weak| LocalInbox {
            id: HandleId::allocate(),
            queue: Arc::downgrade(&queue),
            transport: Arc::downgrade(&transport),
            self_weak: self_weak.clone(),
            hooks: Mutex::new(Some(hooks)),
            destroyed: AtomicBool::new(false),
        });
        transport
            .registry
            .lock()
            .inboxes
            .insert(inbox.id, Arc::downgrade(&inbox));
        queue.object_opened();
        Ok(inbox)
    }

    fn deliver(&self, msg: Msg) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let weak = self.self_weak.clone();
        let _ = queue.enqueue(Box::new(move || {
            let Some(inbox) = weak.upgrade() else { return };
            let on_msg = inbox.hooks.lock().as_ref().map(|h| h.on_msg.clone());
            if let Some(on_msg) = on_msg {
                on_msg(inbox.id, &msg);
            }
        }));
    }

    fn deliver_error(&self, error: MiddlewareError) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let weak = self.self_weak.clone();
        let _ = queue.enqueue(Box::new(move || {
            let Some(inbox) = weak.upgrade() else { return };
            let on_error = inbox.hooks.lock().as_ref().map(|h| h.on_error.clone());
            if let Some(on_error) = on_error {
                on_error(inbox.id, &error);
            }
        }));
    }
}

impl InboxHandle for LocalInbox {
    fn id(&self) -> HandleId {
        self.id
    }

    fn destroy(&self) -> MwResult<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(MiddlewareError::AlreadyDestroyed);
        }
        if let Some(transport) = self.transport.upgrade() {
            transport.unregister_inbox(self.id);
        }
        *self.hooks.lock() = None;
        if let Some(queue) = self.queue.upgrade() {
            queue.object_closed();
        }
        log::trace!("inbox {} destroyed", self.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use gantry_middleware::EventQueue;

    fn hooks(counter: Arc<AtomicUsize>) -> SubscriptionHooks {
        SubscriptionHooks {
            on_create: Arc::new(|_| {}),
            on_error: Arc::new(|_, _| {}),
            on_msg: Arc::new(move |_, _, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
            on_destroy: Arc::new(|_| {}),
        }
    }

    fn drain(queue: &Arc<LocalQueue>) {
        queue.timed_dispatch(Duration::from_millis(20)).unwrap();
    }

    #[test]
    fn basic_subscription_matches_exact_topic() {
        let queue = LocalQueue::new();
        let transport = LoopbackTransport::new("loop");
        let hits = Arc::new(AtomicUsize::new(0));

        let sub = LocalSubscription::register_basic(
            queue.clone(),
            transport.clone(),
            "ticker.A",
            hooks(hits.clone()),
        )
        .unwrap();

        assert_eq!(transport.publish("ticker.A", Msg::default()), 1);
        assert_eq!(transport.publish("ticker.B", Msg::default()), 0);
        drain(&queue);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        sub.destroy().unwrap();
        assert_eq!(transport.publish("ticker.A", Msg::default()), 0);
        drain(&queue);
    }

    #[test]
    fn wildcard_subscription_matches_under_source() {
        let queue = LocalQueue::new();
        let transport = LoopbackTransport::new("loop");
        let hits = Arc::new(AtomicUsize::new(0));

        let sub = LocalSubscription::register_wildcard(
            queue.clone(),
            transport.clone(),
            "feed",
            "*",
            hooks(hits.clone()),
        )
        .unwrap();

        assert_eq!(transport.publish("feed.A", Msg::default()), 1);
        assert_eq!(transport.publish("feed.B", Msg::default()), 1);
        assert_eq!(transport.publish("other.A", Msg::default()), 0);
        drain(&queue);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        sub.destroy().unwrap();
        drain(&queue);
    }

    #[test]
    fn inbox_delivery_and_destroy() {
        let queue = LocalQueue::new();
        let transport = LoopbackTransport::new("loop");
        let msgs = Arc::new(AtomicUsize::new(0));
        let errors = Arc::new(AtomicUsize::new(0));

        let inbox = {
            let msgs = msgs.clone();
            let errors = errors.clone();
            LocalInbox::register(
                queue.clone(),
                transport.clone(),
                InboxHooks {
                    on_msg: Arc::new(move |_, _| {
                        msgs.fetch_add(1, Ordering::SeqCst);
                    }),
                    on_error: Arc::new(move |_, _| {
                        errors.fetch_add(1, Ordering::SeqCst);
                    }),
                },
            )
            .unwrap()
        };

        assert!(transport.post_inbox(inbox.id(), Msg::new(&b"reply"[..])));
        assert!(transport.post_inbox_error(inbox.id(), MiddlewareError::Platform("nak".into())));
        drain(&queue);
        assert_eq!(msgs.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);

        inbox.destroy().unwrap();
        assert!(!transport.post_inbox(inbox.id(), Msg::default()));
        assert!(queue.can_destroy());
    }
}
