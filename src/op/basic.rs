//! Stateless and small-state per-item transformers.

use std::collections::HashSet;
use std::hash::Hash;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Publisher, Subscriber, Subscription};
use crate::flowctl::request::UNBOUNDED;
use crate::flowctl::scalar::ScalarSubscription;

impl<T: Send + 'static> Flow<T> {
    /// Transforms every item.
    pub fn map<R: Send + 'static>(&self, f: impl Fn(T) -> R + Send + Sync + 'static) -> Flow<R> {
        let source = self.clone();
        let f = Arc::new(f);
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(MapSubscriber {
                down,
                f: f.clone(),
            }));
        }))
    }

    /// Transforms every item through a fallible mapping; a failure cancels
    /// upstream, errors the chain and swallows later signals.
    pub fn try_map<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> Result<R, FlowError> + Send + Sync + 'static,
    ) -> Flow<R> {
        let source = self.clone();
        let f = Arc::new(f);
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(TryMapSubscriber {
                down,
                f: f.clone(),
                up: Mutex::new(None),
                done: AtomicBool::new(false),
            }));
        }))
    }

    /// Keeps items matching the predicate; each rejection requests one more
    /// upstream so downstream demand is preserved.
    pub fn filter(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        let source = self.clone();
        let predicate = Arc::new(predicate);
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(FilterSubscriber {
                down,
                predicate: predicate.clone(),
                up: Mutex::new(None),
                done: AtomicBool::new(false),
            }));
        }))
    }

    /// Fallible [`filter`](Flow::filter).
    pub fn try_filter(
        &self,
        predicate: impl Fn(&T) -> Result<bool, FlowError> + Send + Sync + 'static,
    ) -> Flow<T> {
        let source = self.clone();
        let predicate = Arc::new(predicate);
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(TryFilterSubscriber {
                down,
                predicate: predicate.clone(),
                up: Mutex::new(None),
                done: AtomicBool::new(false),
            }));
        }))
    }

    /// Emits the running accumulation: `f(seed, x1)`, `f(f(seed, x1), x2)`, …
    /// (one output per input; the bare seed is not emitted).
    pub fn scan<R: Clone + Send + Sync + 'static>(
        &self,
        seed: R,
        f: impl Fn(R, T) -> R + Send + Sync + 'static,
    ) -> Flow<R> {
        let source = self.clone();
        let f = Arc::new(f);
        Flow::new(AdapterPublisher::new(move |down| {
            let f = f.clone();
            source.subscribe(Arc::new(ScanSubscriber {
                down,
                f,
                state: Mutex::new(seed.clone()),
            }));
        }))
    }

    /// Consumes the whole upstream and emits the final accumulation as a
    /// single item.
    pub fn fold<R: Clone + Send + Sync + 'static>(
        &self,
        seed: R,
        f: impl Fn(R, T) -> R + Send + Sync + 'static,
    ) -> Flow<R> {
        let f = Arc::new(f);
        self.fold_factory(
            move || seed.clone(),
            move |acc, item| f(acc, item),
            |acc| Some(acc),
        )
    }

    /// Pairwise reduction; completes empty when upstream was empty.
    pub fn reduce(&self, f: impl Fn(T, T) -> T + Send + Sync + 'static) -> Flow<T> {
        let f = Arc::new(f);
        self.fold_factory(
            || None,
            move |acc: Option<T>, item| {
                Some(match acc {
                    None => item,
                    Some(prev) => f(prev, item),
                })
            },
            |acc| acc,
        )
    }

    /// Collects everything into one `Vec`.
    pub fn to_list(&self) -> Flow<Vec<T>> {
        self.fold_factory(
            Vec::new,
            |mut acc, item| {
                acc.push(item);
                acc
            },
            |acc| Some(acc),
        )
    }

    /// Drops duplicates over the whole stream.
    pub fn distinct(&self) -> Flow<T>
    where
        T: Eq + Hash + Clone,
    {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let seen = Mutex::new(HashSet::new());
            source.subscribe(Arc::new(FilterSubscriber {
                down,
                predicate: Arc::new(move |item: &T| seen.lock().unwrap().insert(item.clone())),
                up: Mutex::new(None),
                done: AtomicBool::new(false),
            }));
        }))
    }

    /// Drops an item equal to its immediate predecessor.
    pub fn distinct_until_changed(&self) -> Flow<T>
    where
        T: PartialEq + Clone,
    {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let last: Mutex<Option<T>> = Mutex::new(None);
            source.subscribe(Arc::new(FilterSubscriber {
                down,
                predicate: Arc::new(move |item: &T| {
                    let mut guard = last.lock().unwrap();
                    let fresh = guard.as_ref() != Some(item);
                    if fresh {
                        *guard = Some(item.clone());
                    }
                    fresh
                }),
                up: Mutex::new(None),
                done: AtomicBool::new(false),
            }));
        }))
    }

    /// Suppresses all items, relaying only the terminal signal.
    pub fn ignore_elements(&self) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(IgnoreSubscriber { down }));
        }))
    }

    fn fold_factory<S, R>(
        &self,
        seed: impl Fn() -> S + Send + Sync + 'static,
        step: impl Fn(S, T) -> S + Send + Sync + 'static,
        finish: impl Fn(S) -> Option<R> + Send + Sync + 'static,
    ) -> Flow<R>
    where
        S: Send + 'static,
        R: Send + 'static,
    {
        let source = self.clone();
        let step = Arc::new(step);
        let finish = Arc::new(finish);
        Flow::new(AdapterPublisher::new(move |down| {
            let scalar = Arc::new(ScalarSubscription::new(down.clone()));
            down.on_subscribe(Link::Fused(scalar.clone()));
            source.subscribe(Arc::new(FoldSubscriber {
                scalar,
                state: Mutex::new(Some(seed())),
                step: step.clone(),
                finish: finish.clone(),
                _marker: PhantomData,
            }));
        }))
    }
}

/// Publisher built from a closure that wires an adapter at attach time.
pub(crate) struct AdapterPublisher<T: Send + 'static> {
    attach: Box<dyn Fn(Arc<dyn Subscriber<T>>) + Send + Sync>,
}

impl<T: Send + 'static> AdapterPublisher<T> {
    pub(crate) fn new(attach: impl Fn(Arc<dyn Subscriber<T>>) + Send + Sync + 'static) -> Self {
        Self {
            attach: Box::new(attach),
        }
    }
}

impl<T: Send + 'static> Publisher<T> for AdapterPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (self.attach)(subscriber);
    }
}

struct MapSubscriber<T: Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    f: Arc<dyn Fn(T) -> R + Send + Sync>,
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for MapSubscriber<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        // 1:1 operator: downstream demand flows straight upstream.
        self.down.on_subscribe(Link::Direct(link.into_subscription()));
    }

    fn on_next(&self, item: T) {
        self.down.on_next((self.f)(item));
    }

    fn on_complete(&self) {
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        self.down.on_error(err);
    }
}

struct TryMapSubscriber<T: Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    f: Arc<dyn Fn(T) -> Result<R, FlowError> + Send + Sync>,
    up: Mutex<Option<Arc<dyn Subscription>>>,
    done: AtomicBool,
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for TryMapSubscriber<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        *self.up.lock().unwrap() = Some(up.clone());
        self.down.on_subscribe(Link::Direct(up));
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        match (self.f)(item) {
            Ok(v) => self.down.on_next(v),
            Err(e) => {
                self.done.store(true, Ordering::Release);
                if let Some(up) = self.up.lock().unwrap().take() {
                    up.cancel();
                }
                self.down.on_error(e);
            }
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.lock().unwrap().take();
            self.down.on_complete();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.lock().unwrap().take();
            self.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct FilterSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    up: Mutex<Option<Arc<dyn Subscription>>>,
    done: AtomicBool,
}

impl<T: Send + 'static> Subscriber<T> for FilterSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        *self.up.lock().unwrap() = Some(up.clone());
        self.down.on_subscribe(Link::Direct(up));
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if (self.predicate)(&item) {
            self.down.on_next(item);
        } else {
            // Keep downstream demand intact: the rejected item consumed one
            // upstream slot.
            let up = self.up.lock().unwrap().clone();
            if let Some(up) = up {
                up.request(1);
            }
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.lock().unwrap().take();
            self.down.on_complete();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.lock().unwrap().take();
            self.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct TryFilterSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    predicate: Arc<dyn Fn(&T) -> Result<bool, FlowError> + Send + Sync>,
    up: Mutex<Option<Arc<dyn Subscription>>>,
    done: AtomicBool,
}

impl<T: Send + 'static> Subscriber<T> for TryFilterSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        *self.up.lock().unwrap() = Some(up.clone());
        self.down.on_subscribe(Link::Direct(up));
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        match (self.predicate)(&item) {
            Ok(true) => self.down.on_next(item),
            Ok(false) => {
                let up = self.up.lock().unwrap().clone();
                if let Some(up) = up {
                    up.request(1);
                }
            }
            Err(e) => {
                self.done.store(true, Ordering::Release);
                if let Some(up) = self.up.lock().unwrap().take() {
                    up.cancel();
                }
                self.down.on_error(e);
            }
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.lock().unwrap().take();
            self.down.on_complete();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.lock().unwrap().take();
            self.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct ScanSubscriber<T: Send + 'static, R: Clone + Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    f: Arc<dyn Fn(R, T) -> R + Send + Sync>,
    state: Mutex<R>,
}

impl<T: Send + 'static, R: Clone + Send + 'static> Subscriber<T> for ScanSubscriber<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        self.down.on_subscribe(Link::Direct(link.into_subscription()));
    }

    fn on_next(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        let next = (self.f)(state.clone(), item);
        *state = next.clone();
        drop(state);
        self.down.on_next(next);
    }

    fn on_complete(&self) {
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        self.down.on_error(err);
    }
}

struct FoldSubscriber<T, S, R>
where
    T: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    scalar: Arc<ScalarSubscription<R>>,
    state: Mutex<Option<S>>,
    step: Arc<dyn Fn(S, T) -> S + Send + Sync>,
    finish: Arc<dyn Fn(S) -> Option<R> + Send + Sync>,
    _marker: PhantomData<fn(T)>,
}

impl<T, S, R> Subscriber<T> for FoldSubscriber<T, S, R>
where
    T: Send + 'static,
    S: Send + 'static,
    R: Send + 'static,
{
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        self.scalar.hold_upstream(up.clone());
        // A reduction consumes its source regardless of downstream demand.
        up.request(UNBOUNDED);
    }

    fn on_next(&self, item: T) {
        let mut state = self.state.lock().unwrap();
        if let Some(acc) = state.take() {
            *state = Some((self.step)(acc, item));
        }
    }

    fn on_complete(&self) {
        let acc = self.state.lock().unwrap().take();
        match acc.and_then(|s| (self.finish)(s)) {
            Some(result) => self.scalar.complete_with(result),
            None => self.scalar.complete_empty(),
        }
    }

    fn on_error(&self, err: FlowError) {
        self.state.lock().unwrap().take();
        self.scalar.error(err);
    }
}

struct IgnoreSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
}

impl<T: Send + 'static> Subscriber<T> for IgnoreSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        self.down
            .on_subscribe(Link::Direct(Arc::new(CancelThrough { up: up.clone() })));
        up.request(UNBOUNDED);
    }

    fn on_next(&self, _item: T) {}

    fn on_complete(&self) {
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        self.down.on_error(err);
    }
}

/// Forwards cancellation but swallows demand (used where no items can ever
/// flow downstream).
struct CancelThrough {
    up: Arc<dyn Subscription>,
}

impl Subscription for CancelThrough {
    fn request(&self, _n: u64) {}

    fn cancel(&self) {
        self.up.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::range;
    use crate::testkit::TestSubscriber;

    /// map(f).map(g) behaves like map(g∘f)
    #[test]
    fn test_map_composition() {
        let probe = TestSubscriber::unbounded();
        range(0, 5).map(|x| x + 1).map(|x| x * 2).subscribe(probe.clone());
        let fused = TestSubscriber::unbounded();
        range(0, 5).map(|x| (x + 1) * 2).subscribe(fused.clone());
        assert_eq!(probe.items(), fused.items());
    }

    /// Seed scenario: range + filter + reduce yields 30
    #[test]
    fn test_range_filter_reduce() {
        let probe = TestSubscriber::unbounded();
        range(1, 10)
            .filter(|x| x % 2 == 0)
            .reduce(|a, b| a + b)
            .subscribe(probe.clone());
        assert_eq!(probe.items(), vec![30]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// Filter preserves bounded downstream demand
    #[test]
    fn test_filter_preserves_demand() {
        let probe = TestSubscriber::with_request(2);
        range(0, 10).filter(|x| x % 3 == 0).subscribe(probe.clone());
        // Two requested: 0 and 3 arrive even though rejects consumed slots.
        assert_eq!(probe.items(), vec![0, 3]);
    }

    /// try_map failure cancels upstream and errors downstream once
    #[test]
    fn test_try_map_failure() {
        let probe = TestSubscriber::unbounded();
        range(0, 10)
            .try_map(|x| {
                if x < 3 {
                    Ok(x)
                } else {
                    Err(FlowError::message("too big"))
                }
            })
            .subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);
        assert_eq!(probe.error_count(), 1);
        assert_eq!(probe.completion_count(), 0);
    }

    /// scan emits the running accumulation
    #[test]
    fn test_scan() {
        let probe = TestSubscriber::unbounded();
        range(1, 4).scan(0, |acc, x| acc + x).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![1, 3, 6]);
    }

    /// reduce of an empty source completes without items
    #[test]
    fn test_reduce_empty() {
        let probe = TestSubscriber::unbounded();
        crate::source::empty::<i64>().reduce(|a, b| a + b).subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert_eq!(probe.completion_count(), 1);
    }

    /// to_list gathers the whole range
    #[test]
    fn test_to_list() {
        let probe = TestSubscriber::unbounded();
        range(1, 5).to_list().subscribe(probe.clone());
        assert_eq!(probe.items(), vec![vec![1, 2, 3, 4, 5]]);
    }

    /// distinct drops later duplicates; distinct_until_changed only adjacent
    #[test]
    fn test_distinct_variants() {
        let data = vec![1i64, 1, 2, 2, 1, 3];
        let probe = TestSubscriber::unbounded();
        crate::source::from_iter(data.clone()).distinct().subscribe(probe.clone());
        assert_eq!(probe.items(), vec![1, 2, 3]);

        let probe = TestSubscriber::unbounded();
        crate::source::from_iter(data).distinct_until_changed().subscribe(probe.clone());
        assert_eq!(probe.items(), vec![1, 2, 1, 3]);
    }

    /// ignore_elements forwards only the terminal
    #[test]
    fn test_ignore_elements() {
        let probe = TestSubscriber::unbounded();
        range(0, 100).ignore_elements().subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert_eq!(probe.completion_count(), 1);
    }
}
