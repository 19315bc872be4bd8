//! Counting and predicate-based slicing: take/skip and their variants.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::NoopSubscription;
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;
use crate::op::drain::DrainGate;

impl<T: Send + 'static> Flow<T> {
    /// Relays the first `n` items, then cancels upstream and completes.
    /// Downstream demand is forwarded untouched; the excess is dropped at
    /// the cutoff. `take(0)` completes at attach without requesting.
    pub fn take(&self, n: u64) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(TakeSubscriber {
                down,
                remaining: AtomicU64::new(n),
                done: AtomicBool::new(false),
                up: Mutex::new(None),
            }));
        }))
    }

    /// Like [`take`](Flow::take), but never lets more than `n` of demand
    /// reach upstream in total — for upstreams where overproduction is
    /// costly.
    pub fn limit(&self, n: u64) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let state = Arc::new(LimitState {
                budget: AtomicU64::new(n),
                up: SubscriptionSlot::new(),
            });
            down.on_subscribe(Link::Direct(Arc::new(LimitSubscription {
                state: state.clone(),
            })));
            source.subscribe(Arc::new(LimitSubscriber {
                down,
                remaining: AtomicU64::new(n),
                done: AtomicBool::new(false),
                state,
            }));
        }))
    }

    /// Drops the first `n` items.
    pub fn skip(&self, n: u64) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(SkipSubscriber {
                down,
                to_skip: AtomicU64::new(n),
                extra: n,
            }));
        }))
    }

    /// Relays while the predicate holds; the first failing item is dropped,
    /// upstream cancelled, downstream completed.
    pub fn take_while(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        let source = self.clone();
        let predicate = Arc::new(predicate);
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(TakeWhileSubscriber {
                down,
                predicate: predicate.clone(),
                done: AtomicBool::new(false),
                up: Mutex::new(None),
            }));
        }))
    }

    /// Drops while the predicate holds, then relays everything.
    pub fn skip_while(&self, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Flow<T> {
        let source = self.clone();
        let predicate = Arc::new(predicate);
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(SkipWhileSubscriber {
                down,
                predicate: predicate.clone(),
                skipping: AtomicBool::new(true),
                up: Mutex::new(None),
            }));
        }))
    }

    /// Keeps a ring of the last `n` items and drains it on upstream
    /// completion, honoring downstream demand.
    pub fn take_last(&self, n: usize) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let tail = Arc::new(TakeLastSubscriber {
                down: down.clone(),
                keep: n,
                buf: Mutex::new(VecDeque::with_capacity(n)),
                requested: AtomicU64::new(0),
                gate: DrainGate::new(),
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                up: SubscriptionSlot::new(),
            });
            down.on_subscribe(Link::Direct(Arc::new(TakeLastSubscription {
                parent: tail.clone(),
            })));
            source.subscribe(tail);
        }))
    }

    /// Withholds the trailing `n` items (each emission lags `n` behind).
    pub fn skip_last(&self, n: usize) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(SkipLastSubscriber {
                down,
                lag: n,
                buf: Mutex::new(VecDeque::with_capacity(n + 1)),
            }));
        }))
    }

    /// Relays until `other` signals anything (item or completion), then
    /// completes and cancels both.
    pub fn take_until<U: Send + 'static>(&self, other: Flow<U>) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let shared = Arc::new(UntilShared {
                down,
                emission: Mutex::new(()),
                done: AtomicBool::new(false),
                main: SubscriptionSlot::new(),
                other: SubscriptionSlot::new(),
            });
            shared
                .down
                .on_subscribe(Link::Direct(Arc::new(UntilSubscription {
                    shared: shared.clone(),
                })));
            other.subscribe(Arc::new(UntilTrigger {
                shared: shared.clone(),
                _marker: std::marker::PhantomData,
            }));
            source.subscribe(Arc::new(TakeUntilMain { shared }));
        }))
    }

    /// Drops items until `other` emits its first item.
    pub fn skip_until<U: Send + 'static>(&self, other: Flow<U>) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let shared = Arc::new(SkipUntilShared {
                down,
                open: AtomicBool::new(false),
                done: AtomicBool::new(false),
                main: SubscriptionSlot::new(),
                other: SubscriptionSlot::new(),
            });
            shared
                .down
                .on_subscribe(Link::Direct(Arc::new(SkipUntilSubscription {
                    shared: shared.clone(),
                })));
            other.subscribe(Arc::new(SkipUntilTrigger {
                shared: shared.clone(),
                _marker: std::marker::PhantomData,
            }));
            source.subscribe(Arc::new(SkipUntilMain { shared }));
        }))
    }
}

struct TakeSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    remaining: AtomicU64,
    done: AtomicBool,
    up: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<T: Send + 'static> Subscriber<T> for TakeSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.remaining.load(Ordering::Acquire) == 0 {
            // Nothing will ever be relayed; no demand leaves this stage.
            link.cancel();
            self.done.store(true, Ordering::Release);
            self.down
                .on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
            self.down.on_complete();
            return;
        }
        let up = link.into_subscription();
        *self.up.lock().unwrap() = Some(up.clone());
        self.down.on_subscribe(Link::Direct(up));
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let left = self.remaining.load(Ordering::Acquire);
        if left == 0 {
            return;
        }
        self.remaining.store(left - 1, Ordering::Release);
        self.down.on_next(item);
        if left == 1 {
            self.done.store(true, Ordering::Release);
            if let Some(up) = self.up.lock().unwrap().take() {
                up.cancel();
            }
            self.down.on_complete();
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

struct LimitState {
    /// Demand still allowed to flow upstream, in total.
    budget: AtomicU64,
    up: SubscriptionSlot,
}

struct LimitSubscription {
    state: Arc<LimitState>,
}

impl Subscription for LimitSubscription {
    fn request(&self, n: u64) {
        let mut cur = self.state.budget.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return;
            }
            let grant = n.min(cur);
            match self.state.budget.compare_exchange_weak(
                cur,
                cur - grant,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.state.up.request(grant);
                    return;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    fn cancel(&self) {
        self.state.up.cancel();
    }
}

struct LimitSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    remaining: AtomicU64,
    done: AtomicBool,
    state: Arc<LimitState>,
}

impl<T: Send + 'static> Subscriber<T> for LimitSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.remaining.load(Ordering::Acquire) == 0 {
            link.cancel();
            if !self.done.swap(true, Ordering::AcqRel) {
                self.down.on_complete();
            }
            return;
        }
        self.state.up.set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let left = self.remaining.load(Ordering::Acquire);
        if left == 0 {
            return;
        }
        self.remaining.store(left - 1, Ordering::Release);
        self.down.on_next(item);
        if left == 1 {
            self.done.store(true, Ordering::Release);
            self.state.up.cancel();
            self.down.on_complete();
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.state.up.clear();
            self.down.on_complete();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.state.up.clear();
            self.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct SkipSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    to_skip: AtomicU64,
    extra: u64,
}

impl<T: Send + 'static> Subscriber<T> for SkipSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        self.down.on_subscribe(Link::Direct(up.clone()));
        // The dropped prefix consumes upstream slots downstream never asked
        // for; cover them upfront.
        if self.extra > 0 {
            up.request(self.extra);
        }
    }

    fn on_next(&self, item: T) {
        let left = self.to_skip.load(Ordering::Acquire);
        if left > 0 {
            self.to_skip.store(left - 1, Ordering::Release);
            return;
        }
        self.down.on_next(item);
    }

    fn on_complete(&self) {
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        self.down.on_error(err);
    }
}

struct TakeWhileSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    done: AtomicBool,
    up: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<T: Send + 'static> Subscriber<T> for TakeWhileSubscriber<T> {
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
            self.done.store(true, Ordering::Release);
            if let Some(up) = self.up.lock().unwrap().take() {
                up.cancel();
            }
            self.down.on_complete();
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

struct SkipWhileSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    predicate: Arc<dyn Fn(&T) -> bool + Send + Sync>,
    skipping: AtomicBool,
    up: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<T: Send + 'static> Subscriber<T> for SkipWhileSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        *self.up.lock().unwrap() = Some(up.clone());
        self.down.on_subscribe(Link::Direct(up));
    }

    fn on_next(&self, item: T) {
        if self.skipping.load(Ordering::Acquire) {
            if (self.predicate)(&item) {
                let up = self.up.lock().unwrap().clone();
                if let Some(up) = up {
                    up.request(1);
                }
                return;
            }
            self.skipping.store(false, Ordering::Release);
        }
        self.down.on_next(item);
    }

    fn on_complete(&self) {
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        self.down.on_error(err);
    }
}

struct TakeLastSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    keep: usize,
    buf: Mutex<VecDeque<T>>,
    requested: AtomicU64,
    gate: DrainGate,
    done: AtomicBool,
    cancelled: AtomicBool,
    up: SubscriptionSlot,
}

impl<T: Send + 'static> TakeLastSubscriber<T> {
    /// Runs only after upstream completed: relay the retained tail under
    /// downstream demand.
    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            loop {
                if self.cancelled.load(Ordering::Acquire) {
                    self.buf.lock().unwrap().clear();
                    break;
                }
                if !self.done.load(Ordering::Acquire) {
                    break;
                }
                if self.requested.load(Ordering::Acquire) == 0 {
                    if self.buf.lock().unwrap().is_empty() {
                        self.cancelled.store(true, Ordering::Release);
                        self.down.on_complete();
                    }
                    break;
                }
                let item = self.buf.lock().unwrap().pop_front();
                match item {
                    Some(v) => {
                        self.down.on_next(v);
                        post_produced(&self.requested, 1);
                    }
                    None => {
                        self.cancelled.store(true, Ordering::Release);
                        self.down.on_complete();
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
}

impl<T: Send + 'static> Subscriber<T> for TakeLastSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        if self.up.set(up) {
            // The tail is only known at completion; consume everything.
            self.up.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if self.keep == 0 {
            return;
        }
        let mut buf = self.buf.lock().unwrap();
        if buf.len() == self.keep {
            buf.pop_front();
        }
        buf.push_back(item);
    }

    fn on_complete(&self) {
        self.up.clear();
        self.done.store(true, Ordering::Release);
        self.drain();
    }

    fn on_error(&self, err: FlowError) {
        self.up.clear();
        self.buf.lock().unwrap().clear();
        self.down.on_error(err);
    }
}

struct TakeLastSubscription<T: Send + 'static> {
    parent: Arc<TakeLastSubscriber<T>>,
}

impl<T: Send + 'static> Subscription for TakeLastSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        post_request(&self.parent.requested, n);
        self.parent.drain();
    }

    fn cancel(&self) {
        self.parent.cancelled.store(true, Ordering::Release);
        self.parent.up.cancel();
        self.parent.drain();
    }
}

struct SkipLastSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    lag: usize,
    buf: Mutex<VecDeque<T>>,
}

impl<T: Send + 'static> Subscriber<T> for SkipLastSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        self.down.on_subscribe(Link::Direct(up.clone()));
        // The withheld suffix lags demand by `lag` slots; cover it upfront.
        if self.lag > 0 {
            up.request(self.lag as u64);
        }
    }

    fn on_next(&self, item: T) {
        let mut buf = self.buf.lock().unwrap();
        buf.push_back(item);
        if buf.len() > self.lag {
            let out = buf.pop_front().unwrap();
            drop(buf);
            self.down.on_next(out);
        }
    }

    fn on_complete(&self) {
        self.buf.lock().unwrap().clear();
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        self.buf.lock().unwrap().clear();
        self.down.on_error(err);
    }
}

struct UntilShared<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    /// Serializes the racing main-next against the trigger's terminal.
    emission: Mutex<()>,
    done: AtomicBool,
    main: SubscriptionSlot,
    other: SubscriptionSlot,
}

impl<T: Send + 'static> UntilShared<T> {
    fn trip(&self, outcome: Result<(), FlowError>) {
        if self.done.swap(true, Ordering::AcqRel) {
            if let Err(e) = outcome {
                crate::hooks::on_undeliverable(e);
            }
            return;
        }
        self.main.cancel();
        self.other.cancel();
        let _guard = self.emission.lock().unwrap();
        match outcome {
            Ok(()) => self.down.on_complete(),
            Err(e) => self.down.on_error(e),
        }
    }
}

struct TakeUntilMain<T: Send + 'static> {
    shared: Arc<UntilShared<T>>,
}

impl<T: Send + 'static> Subscriber<T> for TakeUntilMain<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.shared.main.set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if self.shared.done.load(Ordering::Acquire) {
            return;
        }
        let _guard = self.shared.emission.lock().unwrap();
        if !self.shared.done.load(Ordering::Acquire) {
            self.shared.down.on_next(item);
        }
    }

    fn on_complete(&self) {
        self.shared.trip(Ok(()));
    }

    fn on_error(&self, err: FlowError) {
        self.shared.trip(Err(err));
    }
}

struct UntilTrigger<T: Send + 'static, U: Send + 'static> {
    shared: Arc<UntilShared<T>>,
    _marker: std::marker::PhantomData<fn(U)>,
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<U> for UntilTrigger<T, U> {
    fn on_subscribe(&self, link: Link<U>) {
        let up = link.into_subscription();
        if self.shared.other.set(up) {
            self.shared.other.request(1);
        }
    }

    fn on_next(&self, _item: U) {
        self.shared.trip(Ok(()));
    }

    fn on_complete(&self) {
        self.shared.trip(Ok(()));
    }

    fn on_error(&self, err: FlowError) {
        self.shared.trip(Err(err));
    }
}

struct UntilSubscription<T: Send + 'static> {
    shared: Arc<UntilShared<T>>,
}

impl<T: Send + 'static> Subscription for UntilSubscription<T> {
    fn request(&self, n: u64) {
        self.shared.main.request(n);
    }

    fn cancel(&self) {
        self.shared.done.store(true, Ordering::Release);
        self.shared.main.cancel();
        self.shared.other.cancel();
    }
}

struct SkipUntilShared<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    open: AtomicBool,
    done: AtomicBool,
    main: SubscriptionSlot,
    other: SubscriptionSlot,
}

struct SkipUntilMain<T: Send + 'static> {
    shared: Arc<SkipUntilShared<T>>,
}

impl<T: Send + 'static> Subscriber<T> for SkipUntilMain<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.shared.main.set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if self.shared.done.load(Ordering::Acquire) {
            return;
        }
        if self.shared.open.load(Ordering::Acquire) {
            self.shared.down.on_next(item);
        } else {
            self.shared.main.request(1);
        }
    }

    fn on_complete(&self) {
        if !self.shared.done.swap(true, Ordering::AcqRel) {
            self.shared.other.cancel();
            self.shared.down.on_complete();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.shared.done.swap(true, Ordering::AcqRel) {
            self.shared.other.cancel();
            self.shared.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct SkipUntilTrigger<T: Send + 'static, U: Send + 'static> {
    shared: Arc<SkipUntilShared<T>>,
    _marker: std::marker::PhantomData<fn(U)>,
}

impl<T: Send + 'static, U: Send + 'static> Subscriber<U> for SkipUntilTrigger<T, U> {
    fn on_subscribe(&self, link: Link<U>) {
        let up = link.into_subscription();
        if self.shared.other.set(up) {
            self.shared.other.request(1);
        }
    }

    fn on_next(&self, _item: U) {
        self.shared.open.store(true, Ordering::Release);
        self.shared.other.cancel();
    }

    fn on_complete(&self) {
        // Trigger completing without items: the gate simply never opens.
    }

    fn on_error(&self, err: FlowError) {
        if !self.shared.done.swap(true, Ordering::AcqRel) {
            self.shared.main.cancel();
            self.shared.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct SkipUntilSubscription<T: Send + 'static> {
    shared: Arc<SkipUntilShared<T>>,
}

impl<T: Send + 'static> Subscription for SkipUntilSubscription<T> {
    fn request(&self, n: u64) {
        self.shared.main.request(n);
    }

    fn cancel(&self) {
        self.shared.done.store(true, Ordering::Release);
        self.shared.main.cancel();
        self.shared.other.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{from_iter, just, never, range};
    use crate::testkit::TestSubscriber;

    /// take stops after n and completes exactly once
    #[test]
    fn test_take() {
        let probe = TestSubscriber::unbounded();
        range(0, 100).take(3).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// take(0) completes at attach without requesting upstream
    #[test]
    fn test_take_zero() {
        let probe = TestSubscriber::unbounded();
        range(0, 100).take(0).subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert_eq!(probe.completion_count(), 1);
    }

    /// limit caps the total demand that reaches upstream
    #[test]
    fn test_limit() {
        let probe = TestSubscriber::unbounded();
        range(0, 100).limit(4).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2, 3]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// skip drops the prefix
    #[test]
    fn test_skip() {
        let probe = TestSubscriber::unbounded();
        range(0, 6).skip(4).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![4, 5]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// take_while cuts at the first failing item
    #[test]
    fn test_take_while() {
        let probe = TestSubscriber::unbounded();
        range(0, 100).take_while(|x| *x < 3).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// skip_while opens at the first failing item and stays open
    #[test]
    fn test_skip_while() {
        let probe = TestSubscriber::unbounded();
        from_iter(vec![1i64, 2, 5, 1, 2])
            .skip_while(|x| *x < 3)
            .subscribe(probe.clone());
        assert_eq!(probe.items(), vec![5, 1, 2]);
    }

    /// take_last retains exactly the tail and respects demand
    #[test]
    fn test_take_last() {
        let probe = TestSubscriber::with_request(1);
        range(0, 10).take_last(3).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![7]);
        probe.request(10);
        assert_eq!(probe.items(), vec![7, 8, 9]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// skip_last withholds the tail
    #[test]
    fn test_skip_last() {
        let probe = TestSubscriber::unbounded();
        range(0, 5).skip_last(2).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// take_until with an immediate trigger yields nothing
    #[test]
    fn test_take_until_immediate() {
        let probe = TestSubscriber::unbounded();
        range(0, 100).take_until(just(())).subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert_eq!(probe.completion_count(), 1);
    }

    /// take_until with a silent trigger passes everything through
    #[test]
    fn test_take_until_never() {
        let probe = TestSubscriber::unbounded();
        range(0, 4).take_until(never::<()>()).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2, 3]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// skip_until with an immediate trigger passes everything through
    #[test]
    fn test_skip_until_open() {
        let probe = TestSubscriber::unbounded();
        range(0, 3).skip_until(just(())).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);
    }

    /// skip_until with a silent trigger drops everything
    #[test]
    fn test_skip_until_closed() {
        let probe = TestSubscriber::unbounded();
        range(0, 3).skip_until(never::<()>()).subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert_eq!(probe.completion_count(), 1);
    }
}
