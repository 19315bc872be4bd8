//! Switching coordinator: only the newest inner speaks.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::request::{post_produced, post_request};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;
use crate::op::drain::DrainGate;
use crate::queue::RingQueue;

impl<T: Send + 'static> Flow<T> {
    /// Maps each outer item to an inner flow; every new inner cancels the
    /// previous one, and items of a cancelled inner are discarded even when
    /// already in flight. An inner completing does not terminate the chain
    /// unless the outer has completed too.
    pub fn switch_map<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
    ) -> Flow<R> {
        self.switch_map_prefetch(f, crate::hooks::buffer_size())
    }

    pub fn switch_map_prefetch<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        prefetch: usize,
    ) -> Flow<R> {
        let source = self.clone();
        let f = Arc::new(f);
        Flow::new(AdapterPublisher::new(move |down| {
            let coordinator = Arc::new(SwitchCoordinator {
                down: down.clone(),
                mapper: f.clone(),
                prefetch: prefetch.max(1),
                limit: {
                    let p = prefetch.max(1);
                    (p - (p >> 2)) as u64
                },
                generation: AtomicU64::new(0),
                current: Mutex::new(None),
                requested: AtomicU64::new(0),
                gate: DrainGate::new(),
                cancelled: AtomicBool::new(false),
                outer_done: AtomicBool::new(false),
                delivered: AtomicBool::new(false),
                outer: SubscriptionSlot::new(),
                me: Mutex::new(Weak::new()),
            });
            *coordinator.me.lock().unwrap() = Arc::downgrade(&coordinator);
            down.on_subscribe(Link::Direct(Arc::new(SwitchSubscription {
                parent: coordinator.clone(),
            })));
            source.subscribe(coordinator);
        }))
    }
}

struct SwitchCoordinator<T: Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    mapper: Arc<dyn Fn(T) -> Flow<R> + Send + Sync>,
    prefetch: usize,
    limit: u64,
    /// Monotonically increasing inner index; the drain only relays items
    /// tagged with the current one.
    generation: AtomicU64,
    current: Mutex<Option<Arc<SwitchInner<R>>>>,
    requested: AtomicU64,
    gate: DrainGate,
    cancelled: AtomicBool,
    outer_done: AtomicBool,
    delivered: AtomicBool,
    outer: SubscriptionSlot,
    me: Mutex<Weak<Self>>,
}

struct SwitchInner<R: Send + 'static> {
    index: u64,
    queue: RingQueue<R>,
    done: AtomicBool,
    link: Mutex<Option<Link<R>>>,
    consumed: AtomicU64,
}

impl<R: Send + 'static> SwitchInner<R> {
    fn retire(&self) {
        if let Some(link) = self.link.lock().unwrap().take() {
            link.cancel();
        }
        self.queue.clear();
    }
}

impl<T: Send + 'static, R: Send + 'static> SwitchCoordinator<T, R> {
    fn arc(&self) -> Option<Arc<Self>> {
        self.me.lock().unwrap().upgrade()
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
            self.outer.cancel();
            if let Some(inner) = self.current.lock().unwrap().take() {
                inner.retire();
            }
            return;
        }
        loop {
            let inner = self.current.lock().unwrap().clone();
            let Some(inner) = inner else { break };
            // Stale inners are swapped out before their queues are read, but
            // the tag check closes the window against in-flight swaps.
            if inner.index != self.generation.load(Ordering::Acquire) {
                break;
            }
            let done = inner.done.load(Ordering::Acquire);
            if self.requested.load(Ordering::Acquire) > 0 {
                if let Some(v) = inner.queue.poll() {
                    if inner.index != self.generation.load(Ordering::Acquire) {
                        // Swapped mid-poll; the item belongs to a dead inner.
                        break;
                    }
                    self.down.on_next(v);
                    post_produced(&self.requested, 1);
                    self.replenish(&inner);
                    continue;
                }
            }
            if done && inner.queue.is_empty() {
                let mut current = self.current.lock().unwrap();
                if current
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(c, &inner))
                {
                    current.take();
                }
            }
            break;
        }

        if self.outer_done.load(Ordering::Acquire)
            && self.current.lock().unwrap().is_none()
            && !self.delivered.swap(true, Ordering::AcqRel)
        {
            self.down.on_complete();
        }
    }

    fn replenish(&self, inner: &Arc<SwitchInner<R>>) {
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

    fn fail(&self, err: FlowError) {
        self.cancelled.store(true, Ordering::Release);
        self.outer.cancel();
        if let Some(inner) = self.current.lock().unwrap().take() {
            inner.retire();
        }
        if !self.delivered.swap(true, Ordering::AcqRel) {
            self.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for SwitchCoordinator<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.outer.set(link.into_subscription()) {
            self.outer.request(crate::flowctl::request::UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if self.cancelled.load(Ordering::Acquire) || self.delivered.load(Ordering::Acquire) {
            return;
        }
        let flow = (self.mapper)(item);
        let index = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let inner = Arc::new(SwitchInner {
            index,
            queue: RingQueue::with_capacity(self.prefetch),
            done: AtomicBool::new(false),
            link: Mutex::new(None),
            consumed: AtomicU64::new(0),
        });
        let previous = self.current.lock().unwrap().replace(inner.clone());
        if let Some(previous) = previous {
            previous.retire();
        }
        if let Some(parent) = self.arc() {
            flow.subscribe(Arc::new(SwitchInnerSubscriber { parent, inner }));
        }
        self.drain();
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.outer.clear();
        self.drain();
    }

    fn on_error(&self, err: FlowError) {
        self.outer_done.store(true, Ordering::Release);
        self.fail(err);
    }
}

struct SwitchInnerSubscriber<T: Send + 'static, R: Send + 'static> {
    parent: Arc<SwitchCoordinator<T, R>>,
    inner: Arc<SwitchInner<R>>,
}

impl<T: Send + 'static, R: Send + 'static> SwitchInnerSubscriber<T, R> {
    fn is_current(&self) -> bool {
        self.inner.index == self.parent.generation.load(Ordering::Acquire)
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<R> for SwitchInnerSubscriber<T, R> {
    fn on_subscribe(&self, link: Link<R>) {
        if !self.is_current() {
            link.cancel();
            return;
        }
        *self.inner.link.lock().unwrap() = Some(link.clone());
        link.request(self.parent.prefetch as u64);
    }

    fn on_next(&self, item: R) {
        if !self.is_current() {
            // Arrived after the switch; never reaches downstream.
            return;
        }
        if self.inner.queue.offer(item).is_err() {
            if let Some(link) = self.inner.link.lock().unwrap().take() {
                link.cancel();
            }
            self.parent.fail(FlowError::Overflow);
            return;
        }
        self.parent.drain();
    }

    fn on_complete(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.link.lock().unwrap().take();
        self.parent.drain();
    }

    fn on_error(&self, err: FlowError) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.link.lock().unwrap().take();
        if self.is_current() {
            self.parent.fail(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct SwitchSubscription<T: Send + 'static, R: Send + 'static> {
    parent: Arc<SwitchCoordinator<T, R>>,
}

impl<T: Send + 'static, R: Send + 'static> Subscription for SwitchSubscription<T, R> {
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
    use crate::source::{Backpressure, Emitter, create, just, range};
    use crate::testkit::TestSubscriber;
    use std::time::Duration;

    /// A synchronous outer behaves like map-to-last
    #[test]
    fn test_switch_sync() {
        let probe = TestSubscriber::unbounded();
        range(0, 3)
            .switch_map(|x| range(x * 10, 2))
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(2)));
        // Each outer item replaces the previous inner before it is drained,
        // except items already relayed; the last inner always completes.
        let items = probe.items();
        assert!(items.ends_with(&[20, 21]), "got {items:?}");
        assert_eq!(probe.completion_count(), 1);
    }

    /// Seed scenario: an inner item arriving after the switch is discarded
    #[test]
    fn test_switch_discards_stale() {
        type Slot = Arc<Mutex<Option<Emitter<i64>>>>;
        let outer_slot: Slot = Arc::new(Mutex::new(None));
        let a_slot: Slot = Arc::new(Mutex::new(None));
        let b_slot: Slot = Arc::new(Mutex::new(None));

        let outer = {
            let s = outer_slot.clone();
            create(
                move |em: Emitter<i64>| {
                    *s.lock().unwrap() = Some(em);
                },
                Backpressure::Buffer,
            )
        };
        let a = {
            let s = a_slot.clone();
            create(
                move |em: Emitter<i64>| {
                    *s.lock().unwrap() = Some(em);
                },
                Backpressure::Buffer,
            )
        };
        let b = {
            let s = b_slot.clone();
            create(
                move |em: Emitter<i64>| {
                    *s.lock().unwrap() = Some(em);
                },
                Backpressure::Buffer,
            )
        };

        let probe = TestSubscriber::unbounded();
        let inners = Mutex::new(vec![b, a]);
        outer
            .switch_map(move |_| inners.lock().unwrap().pop().unwrap())
            .subscribe(probe.clone());

        let outer_em = outer_slot.lock().unwrap().clone().unwrap();
        outer_em.next(0); // switch in A
        let a_em = a_slot.lock().unwrap().clone().unwrap();
        outer_em.next(1); // switch in B, cancelling A
        let b_em = b_slot.lock().unwrap().clone().unwrap();

        a_em.next(100); // stale: must never be seen
        b_em.next(200);
        b_em.complete();
        outer_em.complete();

        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_eq!(probe.items(), vec![200]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// Inner completion alone does not complete the chain
    #[test]
    fn test_inner_complete_not_terminal() {
        type Slot = Arc<Mutex<Option<Emitter<i64>>>>;
        let outer_slot: Slot = Arc::new(Mutex::new(None));
        let outer = {
            let s = outer_slot.clone();
            create(
                move |em: Emitter<i64>| {
                    *s.lock().unwrap() = Some(em);
                },
                Backpressure::Buffer,
            )
        };
        let probe = TestSubscriber::unbounded();
        outer.switch_map(|x| just(x)).subscribe(probe.clone());

        let em = outer_slot.lock().unwrap().clone().unwrap();
        em.next(7);
        assert!(probe.await_items(1, Duration::from_secs(2)));
        assert!(!probe.is_terminated());
        em.complete();
        assert!(probe.await_terminal(Duration::from_secs(2)));
    }
}
