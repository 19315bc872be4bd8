//! Overflow policies for unbounded upstreams.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::flowctl::slot::SubscriptionSlot;
use crate::flowctl::terminal::TerminalLatch;
use crate::op::basic::AdapterPublisher;
use crate::op::drain::DrainGate;
use crate::queue::LinkedQueue;
use crate::source::Backpressure;

/// Callback invoked with each item discarded by
/// [`on_backpressure_drop_with`](Flow::on_backpressure_drop_with).
pub type DropHandler<T> = Arc<dyn Fn(T) + Send + Sync>;

impl<T: Send + 'static> Flow<T> {
    /// Requests everything upstream and fails fast with
    /// [`FlowError::Overflow`] when an item arrives without downstream
    /// demand.
    pub fn on_backpressure_error(&self) -> Flow<T> {
        self.on_backpressure(Backpressure::Error, None)
    }

    /// Requests everything upstream and silently discards items arriving
    /// without downstream demand (logged at debug level).
    pub fn on_backpressure_drop(&self) -> Flow<T> {
        self.on_backpressure(Backpressure::Drop, None)
    }

    /// [`on_backpressure_drop`](Flow::on_backpressure_drop) with a callback
    /// receiving every discarded item.
    pub fn on_backpressure_drop_with(
        &self,
        handler: impl Fn(T) + Send + Sync + 'static,
    ) -> Flow<T> {
        self.on_backpressure(Backpressure::Drop, Some(Arc::new(handler)))
    }

    /// Keeps only the most recent undelivered item.
    pub fn on_backpressure_latest(&self) -> Flow<T> {
        self.on_backpressure(Backpressure::Latest, None)
    }

    /// Buffers every undelivered item in an unbounded queue; the only
    /// policy that can exhaust memory.
    pub fn on_backpressure_buffer(&self) -> Flow<T> {
        self.on_backpressure(Backpressure::Buffer, None)
    }

    fn on_backpressure(&self, mode: Backpressure, on_drop: Option<DropHandler<T>>) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let stage = Arc::new(BackpressureStage {
                down: down.clone(),
                mode,
                on_drop: on_drop.clone(),
                requested: AtomicU64::new(0),
                cancelled: AtomicBool::new(false),
                delivered: AtomicBool::new(false),
                gate: DrainGate::new(),
                latch: TerminalLatch::new(),
                queue: LinkedQueue::new(),
                latest: Mutex::new(None),
                up: SubscriptionSlot::new(),
            });
            down.on_subscribe(Link::Direct(Arc::new(BackpressureSubscription {
                stage: stage.clone(),
            })));
            source.subscribe(stage);
        }))
    }
}

struct BackpressureStage<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    mode: Backpressure,
    on_drop: Option<DropHandler<T>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
    delivered: AtomicBool,
    gate: DrainGate,
    latch: TerminalLatch,
    queue: LinkedQueue<T>,
    latest: Mutex<Option<T>>,
    up: SubscriptionSlot,
}

impl<T: Send + 'static> BackpressureStage<T> {
    fn pop(&self) -> Option<T> {
        match self.mode {
            Backpressure::Latest => self.latest.lock().unwrap().take(),
            Backpressure::Buffer => self.queue.poll(),
            _ => None,
        }
    }

    fn staged_empty(&self) -> bool {
        match self.mode {
            Backpressure::Latest => self.latest.lock().unwrap().is_none(),
            Backpressure::Buffer => self.queue.is_empty(),
            _ => true,
        }
    }

    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            'pass: loop {
                if self.cancelled.load(Ordering::Acquire) {
                    self.queue.clear();
                    self.latest.lock().unwrap().take();
                    break 'pass;
                }
                let done = self.latch.is_terminated();
                if self.requested.load(Ordering::Acquire) > 0 {
                    if let Some(v) = self.pop() {
                        self.down.on_next(v);
                        post_produced(&self.requested, 1);
                        continue 'pass;
                    }
                }
                if done && self.staged_empty() && !self.delivered.swap(true, Ordering::AcqRel) {
                    self.up.clear();
                    match self.latch.get() {
                        Some(Ok(())) => self.down.on_complete(),
                        Some(Err(e)) => self.down.on_error(e),
                        None => unreachable!("latch observed terminated"),
                    }
                }
                break 'pass;
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for BackpressureStage<T> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.up.set(link.into_subscription()) {
            // The whole point: upstream runs unbounded, this stage absorbs.
            self.up.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if self.cancelled.load(Ordering::Acquire) || self.latch.is_terminated() {
            return;
        }
        match self.mode {
            Backpressure::Error => {
                if self.requested.load(Ordering::Acquire) > 0 {
                    self.down.on_next(item);
                    post_produced(&self.requested, 1);
                } else {
                    self.up.cancel();
                    if self.latch.try_error(FlowError::Overflow) {
                        self.drain();
                    }
                }
            }
            Backpressure::Drop => {
                if self.requested.load(Ordering::Acquire) > 0 {
                    self.down.on_next(item);
                    post_produced(&self.requested, 1);
                } else {
                    match &self.on_drop {
                        Some(handler) => handler(item),
                        None => log::debug!("backpressure: item dropped without demand"),
                    }
                }
            }
            Backpressure::Latest => {
                *self.latest.lock().unwrap() = Some(item);
                self.drain();
            }
            Backpressure::Buffer => {
                self.queue.offer(item);
                self.drain();
            }
        }
    }

    fn on_complete(&self) {
        if self.latch.try_complete() {
            self.drain();
        }
    }

    fn on_error(&self, err: FlowError) {
        if self.latch.try_error(err) {
            self.drain();
        } else {
            log::debug!("backpressure: error after terminal suppressed");
        }
    }
}

struct BackpressureSubscription<T: Send + 'static> {
    stage: Arc<BackpressureStage<T>>,
}

impl<T: Send + 'static> Subscription for BackpressureSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        post_request(&self.stage.requested, n);
        self.stage.drain();
    }

    fn cancel(&self) {
        self.stage.cancelled.store(true, Ordering::Release);
        self.stage.up.cancel();
        self.stage.drain();
    }
}
