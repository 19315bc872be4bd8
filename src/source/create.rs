use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Publisher, Subscriber, Subscription};
use crate::flowctl::request::{post_produced, post_request};
use crate::flowctl::terminal::TerminalLatch;
use crate::op::drain::DrainGate;
use crate::queue::LinkedQueue;

/// Overflow policy of a [`create`] source: what happens to an item pushed
/// while downstream demand is zero.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Backpressure {
    /// Signal [`FlowError::Overflow`] and stop.
    Error,
    /// Silently discard the item.
    Drop,
    /// Keep only the most recent undelivered item.
    Latest,
    /// Buffer everything (unbounded; the only policy that can exhaust
    /// memory).
    Buffer,
}

/// Adapts a cold push-style producer ("call `next` whenever you like") to
/// the request-driven contract, applying `mode` on overflow.
///
/// The producer side of the [`Emitter`] must be driven by one thread at a
/// time; wrap the chain in a serializer if that cannot be guaranteed.
pub fn create<T: Send + 'static>(
    setup: impl Fn(Emitter<T>) + Send + Sync + 'static,
    mode: Backpressure,
) -> Flow<T> {
    Flow::new(CreatePublisher {
        setup: Box::new(setup),
        mode,
    })
}

struct CreatePublisher<T: Send + 'static> {
    setup: Box<dyn Fn(Emitter<T>) + Send + Sync>,
    mode: Backpressure,
}

impl<T: Send + 'static> Publisher<T> for CreatePublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let core = Arc::new(EmitterCore {
            down: subscriber.clone(),
            mode: self.mode,
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            delivered: AtomicBool::new(false),
            gate: DrainGate::new(),
            latch: TerminalLatch::new(),
            queue: LinkedQueue::new(),
            latest: Mutex::new(None),
        });
        subscriber.on_subscribe(Link::Direct(core.clone()));
        (self.setup)(Emitter { core });
    }
}

/// Producer-side handle of a [`create`] source.
pub struct Emitter<T: Send + 'static> {
    core: Arc<EmitterCore<T>>,
}

impl<T: Send + 'static> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            core: self.core.clone(),
        }
    }
}

impl<T: Send + 'static> Emitter<T> {
    /// Pushes an item, applying the overflow policy when demand is zero.
    pub fn next(&self, item: T) {
        self.core.next(item);
    }

    pub fn complete(&self) {
        if self.core.latch.try_complete() {
            self.core.drain();
        }
    }

    pub fn error(&self, err: FlowError) {
        if self.core.latch.try_error(err) {
            self.core.drain();
        } else {
            log::debug!("emitter error after terminal dropped");
        }
    }

    /// Outstanding downstream demand, for producers that can pace
    /// themselves.
    pub fn requested(&self) -> u64 {
        self.core.requested.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.core.cancelled.load(Ordering::Acquire)
    }
}

struct EmitterCore<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    mode: Backpressure,
    requested: AtomicU64,
    cancelled: AtomicBool,
    /// Terminal forwarded downstream (exactly once).
    delivered: AtomicBool,
    gate: DrainGate,
    latch: TerminalLatch,
    queue: LinkedQueue<T>,
    latest: Mutex<Option<T>>,
}

impl<T: Send + 'static> EmitterCore<T> {
    fn next(&self, item: T) {
        if self.cancelled.load(Ordering::Acquire) || self.latch.is_terminated() {
            return;
        }
        match self.mode {
            Backpressure::Error => {
                if self.requested.load(Ordering::Acquire) > 0 {
                    self.down.on_next(item);
                    post_produced(&self.requested, 1);
                } else if self.latch.try_error(FlowError::Overflow) {
                    self.drain();
                }
            }
            Backpressure::Drop => {
                if self.requested.load(Ordering::Acquire) > 0 {
                    self.down.on_next(item);
                    post_produced(&self.requested, 1);
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
                // Terminal flag first; the producer stages items before
                // latching, so done + empty stage is definitive.
                let done = self.latch.is_terminated();
                if self.requested.load(Ordering::Acquire) > 0 {
                    if let Some(v) = self.pop() {
                        self.down.on_next(v);
                        post_produced(&self.requested, 1);
                        continue 'pass;
                    }
                }
                if done && self.staged_empty() && !self.delivered.swap(true, Ordering::AcqRel) {
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

impl<T: Send + 'static> Subscription for EmitterCore<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            if !self.delivered.swap(true, Ordering::AcqRel) {
                self.down.on_error(FlowError::ZeroRequest);
            }
            return;
        }
        post_request(&self.requested, n);
        self.drain();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSubscriber;

    fn push_three(mode: Backpressure) -> Arc<TestSubscriber<i64>> {
        let probe = TestSubscriber::with_request(0);
        create(
            |em: Emitter<i64>| {
                em.next(1);
                em.next(2);
                em.next(3);
                em.complete();
            },
            mode,
        )
        .subscribe(probe.clone());
        probe
    }

    /// Error policy fails fast when demand is zero
    #[test]
    fn test_error_policy() {
        let probe = push_three(Backpressure::Error);
        assert_eq!(probe.item_count(), 0);
        assert!(matches!(probe.first_error(), Some(FlowError::Overflow)));
    }

    /// Drop policy discards quietly and still completes
    #[test]
    fn test_drop_policy() {
        let probe = push_three(Backpressure::Drop);
        assert_eq!(probe.item_count(), 0);
        assert_eq!(probe.completion_count(), 1);
    }

    /// Latest policy keeps only the newest undelivered item
    #[test]
    fn test_latest_policy() {
        let probe = push_three(Backpressure::Latest);
        assert_eq!(probe.item_count(), 0);
        probe.request(10);
        assert_eq!(probe.items(), vec![3]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// Buffer policy delivers everything once demand arrives
    #[test]
    fn test_buffer_policy() {
        let probe = push_three(Backpressure::Buffer);
        probe.request(10);
        assert_eq!(probe.items(), vec![1, 2, 3]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// With live demand the producer thread is relayed item by item
    #[test]
    fn test_live_relay() {
        let probe = TestSubscriber::unbounded();
        create(
            |em: Emitter<i64>| {
                let em = em.clone();
                std::thread::spawn(move || {
                    for i in 0..100 {
                        em.next(i);
                    }
                    em.complete();
                });
            },
            Backpressure::Buffer,
        )
        .subscribe(probe.clone());
        assert!(probe.await_terminal(std::time::Duration::from_secs(2)));
        assert_eq!(probe.items(), (0..100).collect::<Vec<_>>());
    }
}
