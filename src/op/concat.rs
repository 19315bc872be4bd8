//! Sequential concatenation: one live inner at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{ErrorBag, FlowError};
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;
use crate::op::drain::DrainGate;
use crate::queue::RingQueue;

/// Relays each source to completion before subscribing the next.
pub fn concat<T: Send + 'static>(sources: Vec<Flow<T>>) -> Flow<T> {
    let shared = Arc::new(sources);
    let iterable = ConcatVec(shared);
    crate::source::from_iter(iterable).concat_map_with(|f| f, 2, false)
}

struct ConcatVec<T: Send + 'static>(Arc<Vec<Flow<T>>>);

impl<T: Send + 'static> Clone for ConcatVec<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send + 'static> IntoIterator for ConcatVec<T> {
    type Item = Flow<T>;
    type IntoIter = std::vec::IntoIter<Flow<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.as_ref().clone().into_iter()
    }
}

impl<T: Send + 'static> Flow<T> {
    /// Maps each item to an inner flow and relays them strictly in order,
    /// one inner at a time, prefetching outer items with the default buffer.
    pub fn concat_map<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
    ) -> Flow<R> {
        self.concat_map_with(f, crate::hooks::buffer_size(), false)
    }

    /// [`concat_map`](Flow::concat_map) with an explicit outer prefetch and
    /// optional error delaying (a failed inner defers its error until the
    /// remaining inners finished).
    pub fn concat_map_with<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        prefetch: usize,
        delay_errors: bool,
    ) -> Flow<R> {
        let source = self.clone();
        let f = Arc::new(f);
        Flow::new(AdapterPublisher::new(move |down| {
            let prefetch = prefetch.max(1);
            let coordinator = Arc::new(ConcatCoordinator {
                down: down.clone(),
                mapper: f.clone(),
                prefetch,
                delay_errors,
                pending: RingQueue::with_capacity(prefetch),
                active: AtomicBool::new(false),
                outer_done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                delivered: AtomicBool::new(false),
                errors: ErrorBag::default(),
                gate: DrainGate::new(),
                outer: SubscriptionSlot::new(),
                arbiter: Arc::new(SubscriptionSlot::new()),
                me: Mutex::new(Weak::new()),
            });
            *coordinator.me.lock().unwrap() = Arc::downgrade(&coordinator);
            down.on_subscribe(Link::Direct(Arc::new(ConcatSubscription {
                parent: coordinator.clone(),
            })));
            source.subscribe(coordinator);
        }))
    }
}

struct ConcatCoordinator<T: Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    mapper: Arc<dyn Fn(T) -> Flow<R> + Send + Sync>,
    prefetch: usize,
    delay_errors: bool,
    /// Outer items waiting for their turn.
    pending: RingQueue<T>,
    active: AtomicBool,
    outer_done: AtomicBool,
    cancelled: AtomicBool,
    delivered: AtomicBool,
    errors: ErrorBag,
    gate: DrainGate,
    outer: SubscriptionSlot,
    /// Carries downstream demand across successive inners; each inner
    /// replaces the subscription and inherits the unconsumed remainder.
    arbiter: Arc<SubscriptionSlot>,
    me: Mutex<Weak<Self>>,
}

impl<T: Send + 'static, R: Send + 'static> ConcatCoordinator<T, R> {
    fn arc(&self) -> Option<Arc<Self>> {
        self.me.lock().unwrap().upgrade()
    }

    /// Trampolined state advance: subscribe the next inner when idle. The
    /// gate flattens the recursion of inners that complete synchronously.
    fn advance(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            loop {
                if self.cancelled.load(Ordering::Acquire) {
                    self.pending.clear();
                    break;
                }
                if self.active.load(Ordering::Acquire) {
                    break;
                }
                match self.pending.poll() {
                    Some(item) => {
                        self.active.store(true, Ordering::Release);
                        // One outer slot freed; keep the prefetch window full.
                        self.outer.request(1);
                        let flow = (self.mapper)(item);
                        if let Some(parent) = self.arc() {
                            flow.subscribe(Arc::new(ConcatInnerSubscriber { parent }));
                        }
                        // The inner may have completed synchronously and
                        // cleared `active`; loop to pick up the next one.
                    }
                    None => {
                        if self.outer_done.load(Ordering::Acquire)
                            && !self.delivered.swap(true, Ordering::AcqRel)
                        {
                            match self.errors.take() {
                                Some(err) => self.down.on_error(err),
                                None => self.down.on_complete(),
                            }
                        }
                        break;
                    }
                }
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn inner_finished(&self, err: Option<FlowError>) {
        if let Some(e) = err {
            if self.delay_errors {
                self.errors.push(e);
            } else {
                self.cancelled.store(true, Ordering::Release);
                self.outer.cancel();
                self.arbiter.cancel();
                if !self.delivered.swap(true, Ordering::AcqRel) {
                    self.down.on_error(e);
                } else {
                    crate::hooks::on_undeliverable(e);
                }
                return;
            }
        }
        self.active.store(false, Ordering::Release);
        self.advance();
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for ConcatCoordinator<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.outer.set(link.into_subscription()) {
            self.outer.request(self.prefetch as u64);
        }
    }

    fn on_next(&self, item: T) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.pending.offer(item).is_err() {
            // Upstream ignored the prefetch bound.
            self.outer.cancel();
            self.inner_finished(Some(FlowError::Overflow));
            return;
        }
        self.advance();
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.outer.clear();
        self.advance();
    }

    fn on_error(&self, err: FlowError) {
        self.outer_done.store(true, Ordering::Release);
        self.outer.clear();
        if self.delay_errors {
            self.errors.push(err);
            self.advance();
        } else {
            self.cancelled.store(true, Ordering::Release);
            self.arbiter.cancel();
            if !self.delivered.swap(true, Ordering::AcqRel) {
                self.down.on_error(err);
            } else {
                crate::hooks::on_undeliverable(err);
            }
        }
    }
}

struct ConcatInnerSubscriber<T: Send + 'static, R: Send + 'static> {
    parent: Arc<ConcatCoordinator<T, R>>,
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<R> for ConcatInnerSubscriber<T, R> {
    fn on_subscribe(&self, link: Link<R>) {
        self.parent.arbiter.replace(link.into_subscription());
    }

    fn on_next(&self, item: R) {
        if self.parent.cancelled.load(Ordering::Acquire) {
            return;
        }
        self.parent.down.on_next(item);
        self.parent.arbiter.produced(1);
    }

    fn on_complete(&self) {
        self.parent.inner_finished(None);
    }

    fn on_error(&self, err: FlowError) {
        self.parent.inner_finished(Some(err));
    }
}

struct ConcatSubscription<T: Send + 'static, R: Send + 'static> {
    parent: Arc<ConcatCoordinator<T, R>>,
}

impl<T: Send + 'static, R: Send + 'static> Subscription for ConcatSubscription<T, R> {
    fn request(&self, n: u64) {
        self.parent.arbiter.request(n);
    }

    fn cancel(&self) {
        self.parent.cancelled.store(true, Ordering::Release);
        self.parent.outer.cancel();
        self.parent.arbiter.cancel();
        self.parent.advance();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{empty, fail, just, range};
    use crate::testkit::TestSubscriber;

    /// Inners are relayed strictly in order
    #[test]
    fn test_concat_order() {
        let probe = TestSubscriber::unbounded();
        concat(vec![range(0, 3), range(10, 2)]).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2, 10, 11]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// Law: concat with empty is the identity on either side
    #[test]
    fn test_concat_identity() {
        let probe = TestSubscriber::unbounded();
        concat(vec![range(0, 3), empty()]).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);

        let probe = TestSubscriber::unbounded();
        concat(vec![empty(), range(0, 3)]).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);
    }

    /// Demand carries across an inner switch: 2 from the first, 2 from the
    /// second, without a fresh request
    #[test]
    fn test_demand_carries_over() {
        let probe = TestSubscriber::with_request(4);
        concat(vec![range(0, 2), range(10, 10)]).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 10, 11]);
        assert!(!probe.is_terminated());
    }

    /// concat_map expands in order
    #[test]
    fn test_concat_map() {
        let probe = TestSubscriber::unbounded();
        range(0, 3)
            .concat_map(|x| range(x * 10, 2))
            .subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 10, 11, 20, 21]);
    }

    /// An inner error stops everything by default
    #[test]
    fn test_error_immediate() {
        let probe = TestSubscriber::unbounded();
        concat(vec![just(1), fail(FlowError::message("mid")), just(3)]).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![1]);
        assert_eq!(probe.error_count(), 1);
    }

    /// With delayed errors the later inners still run
    #[test]
    fn test_error_delayed() {
        let probe = TestSubscriber::unbounded();
        crate::source::from_iter(vec![just(1), fail(FlowError::message("mid")), just(3)])
            .concat_map_with(|f| f, 2, true)
            .subscribe(probe.clone());
        assert_eq!(probe.items(), vec![1, 3]);
        assert_eq!(probe.error_count(), 1);
    }
}
