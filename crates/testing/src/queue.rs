//! Channel-backed event queue and its dispatcher thread.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select, unbounded};
use gantry_middleware::{
    Dispatcher, EventQueue, InboxHooks, MiddlewareError, MwResult, QueueEvent, SubscriptionHandle,
    SubscriptionHooks, TickFn, TimerHandle, Transport,
};
use parking_lot::{Condvar, Mutex};

use crate::timer::LocalTimer;
use crate::transport::{LocalInbox, LocalSubscription, LoopbackTransport};

pub struct LocalQueue {
    self_weak: Weak<LocalQueue>,
    name: Mutex<String>,
    event_tx: Sender<QueueEvent>,
    event_rx: Receiver<QueueEvent>,
    /// Events enqueued but not yet fully executed.
    pending: AtomicUsize,
    /// Timers, subscriptions and inboxes created against this queue and
    /// not yet destroyed.
    open_objects: AtomicUsize,
    paused: Mutex<bool>,
    resume_cond: Condvar,
    shut_down: AtomicBool,
    dispatcher_started: AtomicBool,
}

impl LocalQueue {
    pub fn new() -> Arc<Self> {
        let (event_tx, event_rx) = unbounded();
        Arc::new_cyclic(|self_weak| LocalQueue {
            self_weak: self_weak.clone(),
            name: Mutex::new(String::from("unnamed")),
            event_tx,
            event_rx,
            pending: AtomicUsize::new(0),
            open_objects: AtomicUsize::new(0),
            paused: Mutex::new(false),
            resume_cond: Condvar::new(),
            shut_down: AtomicBool::new(false),
            dispatcher_started: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub(crate) fn arc(&self) -> Arc<LocalQueue> {
        self.self_weak
            .upgrade()
            .expect("queue accessed during teardown")
    }

    pub(crate) fn object_opened(&self) {
        self.open_objects.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn object_closed(&self) {
        let prev = self.open_objects.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "open object count underflow");
    }

    fn run_event(&self, event: QueueEvent) {
        event();
        self.pending.fetch_sub(1, Ordering::SeqCst);
    }

    fn wait_until_active(&self) {
        let mut paused = self.paused.lock();
        while *paused {
            self.resume_cond.wait(&mut paused);
        }
    }

    fn dispatch_loop(self: Arc<Self>, stop_rx: Receiver<()>) {
        scopeguard::defer! {
            log::trace!("dispatcher for queue '{}' exited", self.name());
        }
        loop {
            self.wait_until_active();
            select! {
                recv(stop_rx) -> _ => break,
                recv(self.event_rx) -> event => match event {
                    Ok(event) => self.run_event(event),
                    Err(_) => break,
                },
            }
        }
    }
}

impl EventQueue for LocalQueue {
    fn set_name(&self, name: &str) {
        *self.name.lock() = name.to_owned();
    }

    fn enqueue(&self, event: QueueEvent) -> MwResult<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(MiddlewareError::QueueShutDown);
        }
        self.pending.fetch_add(1, Ordering::SeqCst);
        self.event_tx.send(event).map_err(|_| {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            MiddlewareError::QueueShutDown
        })
    }

    fn timed_dispatch(&self, slice: Duration) -> MwResult<()> {
        let deadline = Instant::now() + slice;
        loop {
            match self.event_rx.recv_deadline(deadline) {
                Ok(event) => self.run_event(event),
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        Ok(())
    }

    fn deactivate(&self) {
        *self.paused.lock() = true;
    }

    fn activate(&self) {
        let mut paused = self.paused.lock();
        *paused = false;
        self.resume_cond.notify_all();
    }

    fn can_destroy(&self) -> bool {
        self.pending.load(Ordering::SeqCst) == 0 && self.open_objects.load(Ordering::SeqCst) == 0
    }

    fn create_dispatcher(self: Arc<Self>) -> MwResult<Box<dyn Dispatcher>> {
        if self.dispatcher_started.swap(true, Ordering::SeqCst) {
            return Err(MiddlewareError::Platform(
                "queue already has a dispatcher".into(),
            ));
        }
        let (stop_tx, stop_rx) = unbounded();
        let queue = self.clone();
        let join = std::thread::Builder::new()
            .name(format!("queue-{}", self.name()))
            .spawn(move || queue.dispatch_loop(stop_rx))
            .map_err(|e| MiddlewareError::Platform(e.to_string()))?;
        Ok(Box::new(LocalDispatcher {
            queue: self,
            stop_tx,
            join: Some(join),
        }))
    }

    fn create_timer(&self, interval: Duration, on_tick: TickFn) -> MwResult<Arc<dyn TimerHandle>> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(MiddlewareError::QueueShutDown);
        }
        LocalTimer::start(self.arc(), interval, on_tick)
    }

    fn create_basic_subscription(
        &self,
        transport: &Arc<dyn Transport>,
        symbol: &str,
        hooks: SubscriptionHooks,
    ) -> MwResult<Arc<dyn SubscriptionHandle>> {
        let transport = LoopbackTransport::downcast(transport)?;
        LocalSubscription::register_basic(self.arc(), transport, symbol, hooks)
    }

    fn create_wildcard_subscription(
        &self,
        transport: &Arc<dyn Transport>,
        source: &str,
        symbol: &str,
        hooks: SubscriptionHooks,
    ) -> MwResult<Arc<dyn SubscriptionHandle>> {
        let transport = LoopbackTransport::downcast(transport)?;
        LocalSubscription::register_wildcard(self.arc(), transport, source, symbol, hooks)
    }

    fn create_inbox(
        &self,
        transport: &Arc<dyn Transport>,
        hooks: InboxHooks,
    ) -> MwResult<Arc<dyn gantry_middleware::InboxHandle>> {
        let transport = LoopbackTransport::downcast(transport)?;
        LocalInbox::register(self.arc(), transport, hooks)
    }

    fn destroy(&self) -> MwResult<()> {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return Err(MiddlewareError::AlreadyDestroyed);
        }
        log::trace!("queue '{}' destroyed", self.name());
        Ok(())
    }
}

pub struct LocalDispatcher {
    queue: Arc<LocalQueue>,
    stop_tx: Sender<()>,
    join: Option<JoinHandle<()>>,
}

impl Dispatcher for LocalDispatcher {
    fn destroy(mut self: Box<Self>) -> MwResult<()> {
        let _ = self.stop_tx.send(());
        // wake the loop if the queue is deactivated so it can observe the
        // stop signal
        self.queue.activate();
        match self.join.take() {
            Some(join) => join
                .join()
                .map_err(|_| MiddlewareError::Platform("dispatcher thread panicked".into())),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    #[test]
    fn dispatcher_runs_enqueued_events_in_order() {
        let queue = LocalQueue::new();
        let dispatcher = queue.clone().create_dispatcher().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        for i in 0..10 {
            let seen = seen.clone();
            queue
                .enqueue(Box::new(move || seen.lock().push(i)))
                .unwrap();
        }
        while !queue.can_destroy() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*seen.lock(), (0..10).collect::<Vec<_>>());

        dispatcher.destroy().unwrap();
        queue.destroy().unwrap();
    }

    #[test]
    fn deactivated_queue_holds_events_until_activated() {
        let queue = LocalQueue::new();
        queue.deactivate();
        let dispatcher = queue.clone().create_dispatcher().unwrap();

        let ran = Arc::new(AtomicBool::new(false));
        {
            let ran = ran.clone();
            queue
                .enqueue(Box::new(move || ran.store(true, Ordering::SeqCst)))
                .unwrap();
        }
        std::thread::sleep(Duration::from_millis(50));
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!queue.can_destroy());

        queue.activate();
        while !queue.can_destroy() {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert!(ran.load(Ordering::SeqCst));

        dispatcher.destroy().unwrap();
        queue.destroy().unwrap();
    }

    #[test]
    fn timed_dispatch_pumps_from_the_calling_thread() {
        let queue = LocalQueue::new();
        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let count = count.clone();
            queue
                .enqueue(Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }))
                .unwrap();
        }
        queue.timed_dispatch(Duration::from_millis(20)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        assert!(queue.can_destroy());
        queue.destroy().unwrap();
    }

    #[test]
    fn destroyed_queue_rejects_events() {
        let queue = LocalQueue::new();
        queue.destroy().unwrap();
        let err = queue.enqueue(Box::new(|| {})).unwrap_err();
        assert_eq!(err, MiddlewareError::QueueShutDown);
        assert_eq!(queue.destroy(), Err(MiddlewareError::AlreadyDestroyed));
    }
}
