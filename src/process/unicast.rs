use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::FlowError;
use crate::flow::{
    Flow, FusedQueue, FusionMode, Link, Subscriber, Subscription, WakeHandle,
};
use crate::flowctl::NoopSubscription;
use crate::flowctl::request::{post_produced, post_request};
use crate::op::basic::AdapterPublisher;
use crate::op::drain::DrainGate;
use crate::queue::LinkedQueue;

/// Hot single-subscriber processor over an unbounded staging queue. The
/// hand-off stage behind `window` and `group_by`: a producer side pushes,
/// exactly one subscriber drains — either through the classic signal path
/// or by negotiating `Async` fusion and polling the queue directly.
pub struct UnicastProcessor<T: Send + 'static> {
    queue: LinkedQueue<T>,
    requested: AtomicU64,
    gate: DrainGate,
    cancelled: AtomicBool,
    delivered: AtomicBool,
    attached: AtomicBool,
    fused: AtomicBool,
    down: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    wake: Mutex<Option<WakeHandle>>,
    me: Mutex<Weak<Self>>,
}

impl<T: Send + 'static> UnicastProcessor<T> {
    pub fn new() -> Arc<Self> {
        let me = Arc::new(Self {
            queue: LinkedQueue::new(),
            requested: AtomicU64::new(0),
            gate: DrainGate::new(),
            cancelled: AtomicBool::new(false),
            delivered: AtomicBool::new(false),
            attached: AtomicBool::new(false),
            fused: AtomicBool::new(false),
            down: Mutex::new(None),
            wake: Mutex::new(None),
            me: Mutex::new(Weak::new()),
        });
        *me.me.lock().unwrap() = Arc::downgrade(&me);
        me
    }

    /// The publisher face of this processor (single attach).
    pub fn flow(&self) -> Flow<T> {
        let weak = self.me.lock().unwrap().clone();
        Flow::new(AdapterPublisher::new(move |down| {
            if let Some(me) = weak.upgrade() {
                me.attach(down);
            }
        }))
    }

    fn attach(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self.attached.swap(true, Ordering::AcqRel) {
            subscriber.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
            subscriber.on_error(FlowError::AlreadySubscribed);
            return;
        }
        let Some(me) = self.me.lock().unwrap().upgrade() else {
            return;
        };
        *self.down.lock().unwrap() = Some(subscriber.clone());
        subscriber.on_subscribe(Link::Fused(me as Arc<dyn FusedQueue<T>>));
        self.drain();
    }

    /// Producer side: stages an item. Dropped after cancel or terminal.
    pub fn offer(&self, item: T) {
        if self.cancelled.load(Ordering::Acquire) || self.queue.is_done() {
            return;
        }
        self.queue.offer(item);
        self.signal();
    }

    /// Producer side: terminal completion (after the staged items).
    pub fn complete(&self) {
        if !self.queue.is_done() {
            self.queue.mark_done();
            self.signal();
        }
    }

    /// Producer side: terminal failure (after the staged items).
    pub fn error(&self, err: FlowError) {
        if self.queue.is_done() {
            crate::hooks::on_undeliverable(err);
            return;
        }
        self.queue.fail(err);
        self.signal();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn signal(&self) {
        if self.fused.load(Ordering::Acquire) {
            let wake = self.wake.lock().unwrap().clone();
            if let Some(wake) = wake {
                wake();
            }
        } else {
            self.drain();
        }
    }

    fn peek_down(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.down.lock().unwrap().clone()
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
                    break 'pass;
                }
                let Some(down) = self.peek_down() else {
                    break 'pass;
                };
                let done = self.queue.is_done();
                if self.requested.load(Ordering::Acquire) > 0 {
                    if let Some(v) = self.queue.poll() {
                        down.on_next(v);
                        post_produced(&self.requested, 1);
                        continue 'pass;
                    }
                }
                if done && self.queue.is_empty() && !self.delivered.swap(true, Ordering::AcqRel) {
                    self.down.lock().unwrap().take();
                    match self.queue.take_failure() {
                        Some(err) => down.on_error(err),
                        None => down.on_complete(),
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

impl<T: Send + 'static> Subscription for UnicastProcessor<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        post_request(&self.requested, n);
        if !self.fused.load(Ordering::Acquire) {
            self.drain();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.down.lock().unwrap().take();
    }
}

impl<T: Send + 'static> FusedQueue<T> for UnicastProcessor<T> {
    fn enable(&self, requested: FusionMode, wake: WakeHandle) -> FusionMode {
        if requested == FusionMode::Async {
            *self.wake.lock().unwrap() = Some(wake);
            self.fused.store(true, Ordering::Release);
            // Emission runs through poll from here on.
            self.down.lock().unwrap().take();
            FusionMode::Async
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        match self.queue.poll() {
            Some(v) => Ok(Some(v)),
            None => match self.queue.take_failure() {
                Some(err) => Err(err),
                None => Ok(None),
            },
        }
    }

    fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    fn clear(&self) {
        self.queue.clear();
    }

    fn is_done(&self) -> bool {
        self.queue.is_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSubscriber;

    /// Items staged before the attach are delivered on subscription
    #[test]
    fn test_replay_staged() {
        let proc = UnicastProcessor::new();
        proc.offer(1);
        proc.offer(2);
        proc.complete();
        let probe = TestSubscriber::unbounded();
        proc.flow().subscribe(probe.clone());
        assert_eq!(probe.items(), vec![1, 2]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// The second subscriber is rejected
    #[test]
    fn test_single_subscriber() {
        let proc = UnicastProcessor::<i64>::new();
        let first = TestSubscriber::unbounded();
        let second = TestSubscriber::unbounded();
        proc.flow().subscribe(first.clone());
        proc.flow().subscribe(second.clone());
        assert_eq!(second.error_count(), 1);
        assert_eq!(first.error_count(), 0);
    }

    /// Demand gates the hand-off
    #[test]
    fn test_bounded() {
        let proc = UnicastProcessor::new();
        let probe = TestSubscriber::with_request(1);
        proc.flow().subscribe(probe.clone());
        proc.offer(1);
        proc.offer(2);
        assert_eq!(probe.items(), vec![1]);
        probe.request(5);
        assert_eq!(probe.items(), vec![1, 2]);
    }

    /// A failure is delivered after the staged items
    #[test]
    fn test_error_after_items() {
        let proc = UnicastProcessor::new();
        let probe = TestSubscriber::unbounded();
        proc.flow().subscribe(probe.clone());
        proc.offer(1);
        proc.error(FlowError::message("late"));
        assert_eq!(probe.items(), vec![1]);
        assert_eq!(probe.error_count(), 1);
    }
}
