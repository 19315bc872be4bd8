//! Eager concatenation: parallel pre-production, sequential relay.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{ErrorBag, FlowError};
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;
use crate::op::drain::DrainGate;
use crate::queue::RingQueue;

/// Subscribes all sources immediately but relays them strictly in order:
/// the head source is drained to completion before the next one's queue is
/// touched.
pub fn concat_eager<T: Send + 'static>(sources: Vec<Flow<T>>) -> Flow<T> {
    let shared = Arc::new(sources);
    crate::source::from_iter(EagerVec(shared)).concat_map_eager(
        |f| f,
        usize::MAX,
        crate::hooks::buffer_size(),
    )
}

struct EagerVec<T: Send + 'static>(Arc<Vec<Flow<T>>>);

impl<T: Send + 'static> Clone for EagerVec<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send + 'static> IntoIterator for EagerVec<T> {
    type Item = Flow<T>;
    type IntoIter = std::vec::IntoIter<Flow<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.as_ref().clone().into_iter()
    }
}

impl<T: Send + 'static> Flow<T> {
    /// Maps each item to an inner flow, subscribing up to `max_concurrency`
    /// of them eagerly (each prefetching into its own bounded queue of
    /// `prefetch`), while relaying their items in arrival order.
    pub fn concat_map_eager<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        max_concurrency: usize,
        prefetch: usize,
    ) -> Flow<R> {
        let source = self.clone();
        let f = Arc::new(f);
        Flow::new(AdapterPublisher::new(move |down| {
            let prefetch = prefetch.max(1);
            let coordinator = Arc::new(EagerCoordinator {
                down: down.clone(),
                mapper: f.clone(),
                max_concurrency: max_concurrency.max(1),
                prefetch,
                limit: (prefetch - (prefetch >> 2)) as u64,
                requested: AtomicU64::new(0),
                gate: DrainGate::new(),
                cancelled: AtomicBool::new(false),
                outer_done: AtomicBool::new(false),
                delivered: AtomicBool::new(false),
                fatal: AtomicBool::new(false),
                errors: ErrorBag::default(),
                inners: Mutex::new(VecDeque::new()),
                outer: SubscriptionSlot::new(),
                me: Mutex::new(Weak::new()),
            });
            *coordinator.me.lock().unwrap() = Arc::downgrade(&coordinator);
            down.on_subscribe(Link::Direct(Arc::new(EagerSubscription {
                parent: coordinator.clone(),
            })));
            source.subscribe(coordinator);
        }))
    }
}

struct EagerCoordinator<T: Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    mapper: Arc<dyn Fn(T) -> Flow<R> + Send + Sync>,
    max_concurrency: usize,
    prefetch: usize,
    limit: u64,
    requested: AtomicU64,
    gate: DrainGate,
    cancelled: AtomicBool,
    outer_done: AtomicBool,
    delivered: AtomicBool,
    fatal: AtomicBool,
    errors: ErrorBag,
    /// Arrival-ordered inner queues; only the front one is relayed.
    inners: Mutex<VecDeque<Arc<EagerInner<R>>>>,
    outer: SubscriptionSlot,
    me: Mutex<Weak<Self>>,
}

struct EagerInner<R: Send + 'static> {
    queue: RingQueue<R>,
    done: AtomicBool,
    link: Mutex<Option<Link<R>>>,
    consumed: AtomicU64,
}

impl<R: Send + 'static> EagerInner<R> {
    fn detach(&self) {
        self.link.lock().unwrap().take();
    }
}

impl<T: Send + 'static, R: Send + 'static> EagerCoordinator<T, R> {
    fn arc(&self) -> Option<Arc<Self>> {
        self.me.lock().unwrap().upgrade()
    }

    fn teardown(&self) {
        self.outer.cancel();
        let inners = std::mem::take(&mut *self.inners.lock().unwrap());
        for inner in inners {
            if let Some(link) = inner.link.lock().unwrap().take() {
                link.cancel();
            }
            inner.queue.clear();
        }
    }

    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            self.drain_pass();
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn drain_pass(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.teardown();
            return;
        }
        if self.fatal.load(Ordering::Acquire) {
            self.teardown();
            if !self.delivered.swap(true, Ordering::AcqRel) {
                let err = self.errors.take().unwrap_or(FlowError::Overflow);
                self.down.on_error(err);
            }
            return;
        }
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.teardown();
                return;
            }
            let head = self.inners.lock().unwrap().front().cloned();
            let Some(head) = head else { break };

            // Relay the head under demand.
            let done = head.done.load(Ordering::Acquire);
            if self.requested.load(Ordering::Acquire) > 0 {
                if let Some(v) = head.queue.poll() {
                    self.down.on_next(v);
                    post_produced(&self.requested, 1);
                    self.replenish(&head);
                    continue;
                }
            }
            // Head exhausted?
            if done && head.queue.is_empty() {
                head.detach();
                self.inners.lock().unwrap().pop_front();
                if !self.outer_done.load(Ordering::Acquire) {
                    self.outer.request(1);
                }
                continue;
            }
            break;
        }

        if self.outer_done.load(Ordering::Acquire)
            && self.inners.lock().unwrap().is_empty()
            && !self.delivered.swap(true, Ordering::AcqRel)
        {
            match self.errors.take() {
                Some(err) => self.down.on_error(err),
                None => self.down.on_complete(),
            }
        }
    }

    fn replenish(&self, inner: &Arc<EagerInner<R>>) {
        let consumed = inner.consumed.load(Ordering::Relaxed) + 1;
        if consumed >= self.limit {
            inner.consumed.store(0, Ordering::Relaxed);
            if let Some(link) = inner.link.lock().unwrap().clone() {
                link.request(consumed);
            }
        } else {
            inner.consumed.store(consumed, Ordering::Relaxed);
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for EagerCoordinator<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.outer.set(link.into_subscription()) {
            let upfront = if self.max_concurrency == usize::MAX {
                UNBOUNDED
            } else {
                self.max_concurrency as u64
            };
            self.outer.request(upfront);
        }
    }

    fn on_next(&self, item: T) {
        if self.cancelled.load(Ordering::Acquire) || self.delivered.load(Ordering::Acquire) {
            return;
        }
        let flow = (self.mapper)(item);
        let inner = Arc::new(EagerInner {
            queue: RingQueue::with_capacity(self.prefetch),
            done: AtomicBool::new(false),
            link: Mutex::new(None),
            consumed: AtomicU64::new(0),
        });
        self.inners.lock().unwrap().push_back(inner.clone());
        if let Some(parent) = self.arc() {
            flow.subscribe(Arc::new(EagerInnerSubscriber { parent, inner }));
        }
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.outer.clear();
        self.drain();
    }

    fn on_error(&self, err: FlowError) {
        self.outer_done.store(true, Ordering::Release);
        self.outer.clear();
        self.errors.push(err);
        self.fatal.store(true, Ordering::Release);
        self.drain();
    }
}

struct EagerInnerSubscriber<T: Send + 'static, R: Send + 'static> {
    parent: Arc<EagerCoordinator<T, R>>,
    inner: Arc<EagerInner<R>>,
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<R> for EagerInnerSubscriber<T, R> {
    fn on_subscribe(&self, link: Link<R>) {
        *self.inner.link.lock().unwrap() = Some(link.clone());
        // Pre-produce into the private queue even while waiting for the
        // relay turn.
        link.request(self.parent.prefetch as u64);
    }

    fn on_next(&self, item: R) {
        if self.inner.queue.offer(item).is_err() {
            if let Some(link) = self.inner.link.lock().unwrap().take() {
                link.cancel();
            }
            self.inner.done.store(true, Ordering::Release);
            self.parent.errors.push(FlowError::Overflow);
            self.parent.fatal.store(true, Ordering::Release);
        }
        self.parent.drain();
    }

    fn on_complete(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.detach();
        self.parent.drain();
    }

    fn on_error(&self, err: FlowError) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.detach();
        self.parent.errors.push(err);
        self.parent.fatal.store(true, Ordering::Release);
        self.parent.drain();
    }
}

struct EagerSubscription<T: Send + 'static, R: Send + 'static> {
    parent: Arc<EagerCoordinator<T, R>>,
}

impl<T: Send + 'static, R: Send + 'static> Subscription for EagerSubscription<T, R> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        post_request(&self.parent.requested, n);
        self.parent.drain();
    }

    fn cancel(&self) {
        self.parent.cancelled.store(true, Ordering::Release);
        self.parent.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec;
    use crate::source::{just, range};
    use crate::testkit::TestSubscriber;
    use std::time::Duration;

    /// Relay order is arrival order even with eager subscription
    #[test]
    fn test_eager_order() {
        let probe = TestSubscriber::unbounded();
        concat_eager(vec![range(0, 3), range(10, 3)]).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2, 10, 11, 12]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// A slow head holds back an already-finished second source
    #[test]
    fn test_eager_preproduction() {
        let probe = TestSubscriber::unbounded();
        let slow_head = range(0, 2).observe_on(exec::computation());
        concat_eager(vec![slow_head, range(10, 2)]).subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.items(), vec![0, 1, 10, 11]);
    }

    /// Demand gates the relay across inner boundaries
    #[test]
    fn test_eager_bounded() {
        let probe = TestSubscriber::with_request(3);
        concat_eager(vec![just(1), just(2), just(3), just(4)]).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![1, 2, 3]);
        assert!(!probe.is_terminated());
    }
}
