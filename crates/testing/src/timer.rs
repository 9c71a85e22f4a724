//! Interval timer backed by a thread ticking on a channel timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use gantry_middleware::{EventQueue, HandleId, MiddlewareError, MwResult, TickFn, TimerHandle};
use parking_lot::Mutex;

use crate::queue::LocalQueue;

pub struct LocalTimer {
    id: HandleId,
    queue: Weak<LocalQueue>,
    self_weak: Weak<LocalTimer>,
    tick: Mutex<Option<TickFn>>,
    stop_tx: Sender<()>,
    /// Checked by the tick thread before enqueueing, so destroy stops new
    /// ticks even when the stop signal has not been consumed yet.
    dead: AtomicBool,
    destroyed: AtomicBool,
}

impl LocalTimer {
    pub(crate) fn start(
        queue: Arc<LocalQueue>,
        interval: Duration,
        on_tick: TickFn,
    ) -> MwResult<Arc<dyn TimerHandle>> {
        let (stop_tx, stop_rx) = unbounded();
        let timer = Arc::new_cyclic(|self_weak| LocalTimer {
            id: HandleId::allocate(),
            queue: Arc::downgrade(&queue),
            self_weak: self_weak.clone(),
            tick: Mutex::new(Some(on_tick)),
            stop_tx,
            dead: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
        });
        queue.object_opened();

        let weak = Arc::downgrade(&timer);
        std::thread::Builder::new()
            .name(format!("timer-{}", timer.id))
            .spawn(move || Self::tick_loop(weak, stop_rx, interval))
            .map_err(|e| MiddlewareError::Platform(e.to_string()))?;

        Ok(timer)
    }

    fn tick_loop(weak: Weak<LocalTimer>, stop_rx: Receiver<()>, interval: Duration) {
        loop {
            match stop_rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    let Some(timer) = weak.upgrade() else { break };
                    if timer.dead.load(Ordering::Acquire) {
                        break;
                    }
                    timer.enqueue_tick();
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }
    }

    fn enqueue_tick(&self) {
        let Some(queue) = self.queue.upgrade() else {
            return;
        };
        let weak = self.self_weak.clone();
        let _ = queue.enqueue(Box::new(move || {
            let Some(timer) = weak.upgrade() else { return };
            let tick = timer.tick.lock().clone();
            if let Some(tick) = tick {
                tick(timer.id);
            }
        }));
    }
}

impl TimerHandle for LocalTimer {
    fn id(&self) -> HandleId {
        self.id
    }

    fn destroy(&self) -> MwResult<()> {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return Err(MiddlewareError::AlreadyDestroyed);
        }
        self.dead.store(true, Ordering::Release);
        *self.tick.lock() = None;
        let _ = self.stop_tx.send(());
        if let Some(queue) = self.queue.upgrade() {
            queue.object_closed();
        }
        log::trace!("timer {} destroyed", self.id);
        Ok(())
    }
}
