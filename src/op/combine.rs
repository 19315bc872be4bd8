//! Latest-value combination: `combine_latest` and `with_latest_from`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Publisher, Subscriber, Subscription};
use crate::flowctl::NoopSubscription;
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::drain::DrainGate;
use crate::queue::LinkedQueue;

/// Emits a combination of the most recent value of every source each time
/// any source emits, once all of them have emitted at least once. Completes
/// when a source finishes without ever emitting, or when all sources have
/// finished. Errors terminate immediately.
pub fn combine_latest<T, R>(
    sources: Vec<Flow<T>>,
    combiner: impl Fn(Vec<T>) -> R + Send + Sync + 'static,
) -> Flow<R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    Flow::new(CombinePublisher {
        sources,
        combiner: Arc::new(combiner),
        prefetch: crate::hooks::buffer_size(),
    })
}

/// Relays the main source's items, each combined with the latest value of
/// every companion; main items arriving before all companions have emitted
/// are dropped (their demand is re-requested). Companions never terminate
/// the chain, but their errors do.
pub fn with_latest_from<T, R>(
    main: Flow<T>,
    others: Vec<Flow<T>>,
    combiner: impl Fn(T, &[T]) -> R + Send + Sync + 'static,
) -> Flow<R>
where
    T: Clone + Send + 'static,
    R: Send + 'static,
{
    Flow::new(WithLatestPublisher {
        main,
        others,
        combiner: Arc::new(combiner),
    })
}

struct CombinePublisher<T: Clone + Send + 'static, R: Send + 'static> {
    sources: Vec<Flow<T>>,
    combiner: Arc<dyn Fn(Vec<T>) -> R + Send + Sync>,
    prefetch: usize,
}

impl<T: Clone + Send + 'static, R: Send + 'static> Publisher<R> for CombinePublisher<T, R> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        if self.sources.is_empty() {
            subscriber.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
            subscriber.on_complete();
            return;
        }
        let n = self.sources.len();
        let coordinator = Arc::new(CombineCoordinator {
            down: subscriber.clone(),
            combiner: self.combiner.clone(),
            prefetch: self.prefetch,
            latest: Mutex::new(vec![None; n]),
            filled: AtomicUsize::new(0),
            total: n,
            completed: AtomicUsize::new(0),
            rows: LinkedQueue::new(),
            links: (0..n).map(|_| Mutex::new(None)).collect(),
            requested: AtomicU64::new(0),
            gate: DrainGate::new(),
            cancelled: AtomicBool::new(false),
            done: AtomicBool::new(false),
            delivered: AtomicBool::new(false),
            failure: Mutex::new(None),
        });
        subscriber.on_subscribe(Link::Direct(Arc::new(CombineSubscription {
            parent: coordinator.clone(),
        })));
        for i in 0..n {
            if coordinator.cancelled.load(Ordering::Acquire) {
                break;
            }
            self.sources[i].subscribe(Arc::new(CombineInnerSubscriber {
                parent: coordinator.clone(),
                index: i,
            }));
        }
    }
}

struct CombineCoordinator<T: Clone + Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    combiner: Arc<dyn Fn(Vec<T>) -> R + Send + Sync>,
    prefetch: usize,
    /// One slot per source with its most recent value.
    latest: Mutex<Vec<Option<T>>>,
    filled: AtomicUsize,
    total: usize,
    completed: AtomicUsize,
    /// Fully-populated combinations awaiting downstream demand.
    rows: LinkedQueue<Vec<T>>,
    links: Vec<Mutex<Option<Link<T>>>>,
    requested: AtomicU64,
    gate: DrainGate,
    cancelled: AtomicBool,
    /// No further rows can be produced.
    done: AtomicBool,
    delivered: AtomicBool,
    failure: Mutex<Option<FlowError>>,
}

impl<T: Clone + Send + 'static, R: Send + 'static> CombineCoordinator<T, R> {
    fn teardown(&self) {
        for slot in &self.links {
            if let Some(link) = slot.lock().unwrap().take() {
                link.cancel();
            }
        }
        self.rows.clear();
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
        loop {
            if let Some(err) = self.failure.lock().unwrap().take() {
                self.cancelled.store(true, Ordering::Release);
                self.teardown();
                if !self.delivered.swap(true, Ordering::AcqRel) {
                    self.down.on_error(err);
                }
                return;
            }
            let done = self.done.load(Ordering::Acquire);
            if self.requested.load(Ordering::Acquire) > 0 {
                if let Some(row) = self.rows.poll() {
                    self.down.on_next((self.combiner)(row));
                    post_produced(&self.requested, 1);
                    continue;
                }
            }
            if done && self.rows.is_empty() {
                self.teardown();
                if !self.delivered.swap(true, Ordering::AcqRel) {
                    self.down.on_complete();
                }
            }
            return;
        }
    }

    fn value(&self, index: usize, item: T) {
        {
            let mut latest = self.latest.lock().unwrap();
            if latest[index].is_none() {
                self.filled.fetch_add(1, Ordering::AcqRel);
            }
            latest[index] = Some(item);
            if self.filled.load(Ordering::Acquire) == self.total {
                let row: Vec<T> = latest
                    .iter()
                    .map(|slot| slot.clone().expect("all slots filled"))
                    .collect();
                self.rows.offer(row);
            }
        }
        // The source's slot was (or will be) superseded; grant it one more.
        if let Some(link) = self.links[index].lock().unwrap().clone() {
            link.request(1);
        }
        self.drain();
    }

    fn finished(&self, index: usize) {
        let had_value = self.latest.lock().unwrap()[index].is_some();
        let completed = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        if !had_value || completed == self.total {
            self.done.store(true, Ordering::Release);
        }
        self.drain();
    }

    fn errored(&self, err: FlowError) {
        *self.failure.lock().unwrap() = Some(err);
        self.drain();
    }
}

struct CombineInnerSubscriber<T: Clone + Send + 'static, R: Send + 'static> {
    parent: Arc<CombineCoordinator<T, R>>,
    index: usize,
}

impl<T: Clone + Send + 'static, R: Send + 'static> Subscriber<T>
    for CombineInnerSubscriber<T, R>
{
    fn on_subscribe(&self, link: Link<T>) {
        *self.parent.links[self.index].lock().unwrap() = Some(link.clone());
        link.request(self.parent.prefetch as u64);
    }

    fn on_next(&self, item: T) {
        self.parent.value(self.index, item);
    }

    fn on_complete(&self) {
        self.parent.links[self.index].lock().unwrap().take();
        self.parent.finished(self.index);
    }

    fn on_error(&self, err: FlowError) {
        self.parent.links[self.index].lock().unwrap().take();
        self.parent.errored(err);
    }
}

struct CombineSubscription<T: Clone + Send + 'static, R: Send + 'static> {
    parent: Arc<CombineCoordinator<T, R>>,
}

impl<T: Clone + Send + 'static, R: Send + 'static> Subscription for CombineSubscription<T, R> {
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

struct WithLatestPublisher<T: Clone + Send + 'static, R: Send + 'static> {
    main: Flow<T>,
    others: Vec<Flow<T>>,
    combiner: Arc<dyn Fn(T, &[T]) -> R + Send + Sync>,
}

impl<T: Clone + Send + 'static, R: Send + 'static> Publisher<R> for WithLatestPublisher<T, R> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        let n = self.others.len();
        let state = Arc::new(WithLatestState {
            down: subscriber.clone(),
            combiner: self.combiner.clone(),
            latest: Mutex::new(vec![None; n]),
            filled: AtomicUsize::new(0),
            total: n,
            emission: Mutex::new(()),
            done: AtomicBool::new(false),
            main: SubscriptionSlot::new(),
            others: (0..n).map(|_| SubscriptionSlot::new()).collect(),
        });
        subscriber.on_subscribe(Link::Direct(Arc::new(WithLatestSubscription {
            state: state.clone(),
        })));
        for i in 0..n {
            self.others[i].subscribe(Arc::new(WithLatestCompanion {
                state: state.clone(),
                index: i,
            }));
        }
        self.main.subscribe(Arc::new(WithLatestMain { state }));
    }
}

struct WithLatestState<T: Clone + Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    combiner: Arc<dyn Fn(T, &[T]) -> R + Send + Sync>,
    latest: Mutex<Vec<Option<T>>>,
    filled: AtomicUsize,
    total: usize,
    /// Serializes main emissions against a racing companion error.
    emission: Mutex<()>,
    done: AtomicBool,
    main: SubscriptionSlot,
    others: Vec<SubscriptionSlot>,
}

impl<T: Clone + Send + 'static, R: Send + 'static> WithLatestState<T, R> {
    fn teardown(&self) {
        self.main.cancel();
        for other in &self.others {
            other.cancel();
        }
    }

    fn terminate(&self, outcome: Result<(), FlowError>) {
        if self.done.swap(true, Ordering::AcqRel) {
            if let Err(e) = outcome {
                crate::hooks::on_undeliverable(e);
            }
            return;
        }
        self.teardown();
        let _guard = self.emission.lock().unwrap();
        match outcome {
            Ok(()) => self.down.on_complete(),
            Err(e) => self.down.on_error(e),
        }
    }
}

struct WithLatestMain<T: Clone + Send + 'static, R: Send + 'static> {
    state: Arc<WithLatestState<T, R>>,
}

impl<T: Clone + Send + 'static, R: Send + 'static> Subscriber<T> for WithLatestMain<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        self.state.main.set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if self.state.done.load(Ordering::Acquire) {
            return;
        }
        if self.state.filled.load(Ordering::Acquire) < self.state.total {
            // Not every companion has spoken yet; the item is dropped and
            // its demand slot recycled.
            self.state.main.request(1);
            return;
        }
        let row: Vec<T> = self
            .state
            .latest
            .lock()
            .unwrap()
            .iter()
            .map(|slot| slot.clone().expect("companions all filled"))
            .collect();
        let _guard = self.state.emission.lock().unwrap();
        if !self.state.done.load(Ordering::Acquire) {
            self.state.down.on_next((self.state.combiner)(item, &row));
        }
    }

    fn on_complete(&self) {
        self.state.terminate(Ok(()));
    }

    fn on_error(&self, err: FlowError) {
        self.state.terminate(Err(err));
    }
}

struct WithLatestCompanion<T: Clone + Send + 'static, R: Send + 'static> {
    state: Arc<WithLatestState<T, R>>,
    index: usize,
}

impl<T: Clone + Send + 'static, R: Send + 'static> Subscriber<T> for WithLatestCompanion<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.state.others[self.index].set(link.into_subscription()) {
            // Companions are latest-value samples; they are never the
            // bottleneck.
            self.state.others[self.index].request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        let mut latest = self.state.latest.lock().unwrap();
        if latest[self.index].is_none() {
            self.state.filled.fetch_add(1, Ordering::AcqRel);
        }
        latest[self.index] = Some(item);
    }

    fn on_complete(&self) {
        // Companions do not contribute to termination.
        self.state.others[self.index].clear();
    }

    fn on_error(&self, err: FlowError) {
        self.state.terminate(Err(err));
    }
}

struct WithLatestSubscription<T: Clone + Send + 'static, R: Send + 'static> {
    state: Arc<WithLatestState<T, R>>,
}

impl<T: Clone + Send + 'static, R: Send + 'static> Subscription for WithLatestSubscription<T, R> {
    fn request(&self, n: u64) {
        self.state.main.request(n);
    }

    fn cancel(&self) {
        self.state.done.store(true, Ordering::Release);
        self.state.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::op::combine_latest2;
    use crate::source::{Backpressure, Emitter, create, empty, from_iter, just, never};
    use crate::testkit::TestSubscriber;
    use std::time::Duration;

    fn manual() -> (Flow<i64>, Arc<Mutex<Option<Emitter<i64>>>>) {
        let slot: Arc<Mutex<Option<Emitter<i64>>>> = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let flow = create(
            move |em: Emitter<i64>| {
                *s.lock().unwrap() = Some(em);
            },
            Backpressure::Buffer,
        );
        (flow, slot)
    }

    /// Combinations fire only once every source has emitted
    #[test]
    fn test_combine_latest_gate() {
        let (a, a_em) = manual();
        let (b, b_em) = manual();
        let probe = TestSubscriber::unbounded();
        combine_latest2(a, b, |x, y| (x, y)).subscribe(probe.clone());

        let a_em = a_em.lock().unwrap().clone().unwrap();
        let b_em = b_em.lock().unwrap().clone().unwrap();
        a_em.next(1);
        assert_eq!(probe.item_count(), 0);
        b_em.next(10);
        a_em.next(2);
        a_em.complete();
        b_em.complete();
        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_eq!(probe.items(), vec![(1, 10), (2, 10)]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// A source completing without emitting completes the chain
    #[test]
    fn test_combine_latest_empty_source() {
        let probe = TestSubscriber::unbounded();
        combine_latest2(just(1), empty(), |x, y: i64| x + y).subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_eq!(probe.item_count(), 0);
        assert_eq!(probe.completion_count(), 1);
    }

    /// with_latest_from drops main items until companions have spoken
    #[test]
    fn test_with_latest_from() {
        let (main, main_em) = manual();
        let (side, side_em) = manual();
        let probe = TestSubscriber::unbounded();
        with_latest_from(main, vec![side], |x, row| x + row[0]).subscribe(probe.clone());

        let main_em = main_em.lock().unwrap().clone().unwrap();
        let side_em = side_em.lock().unwrap().clone().unwrap();
        main_em.next(1); // dropped, no companion value yet
        side_em.next(100);
        main_em.next(2);
        main_em.next(3);
        main_em.complete();
        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_eq!(probe.items(), vec![102, 103]);
    }

    /// Companion completion does not terminate the chain
    #[test]
    fn test_companion_completion_ignored() {
        let (main, main_em) = manual();
        let probe = TestSubscriber::unbounded();
        with_latest_from(main, vec![from_iter(vec![50i64])], |x, row| x + row[0])
            .subscribe(probe.clone());
        let main_em = main_em.lock().unwrap().clone().unwrap();
        main_em.next(1);
        assert!(probe.await_items(1, Duration::from_secs(2)));
        assert!(!probe.is_terminated());
        main_em.complete();
        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_eq!(probe.items(), vec![51]);
    }

    /// combine_latest with never is silent but alive
    #[test]
    fn test_combine_latest_never() {
        let probe = TestSubscriber::unbounded();
        combine_latest2(just(1), never(), |x, y: i64| x + y).subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert!(!probe.is_terminated());
    }
}
