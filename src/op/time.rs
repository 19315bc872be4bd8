//! Clock-driven operators: delay, timeout, sample, debounce, throttle.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam_utils::atomic::AtomicCell;

use crate::error::FlowError;
use crate::exec::{Executor, Worker};
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;

impl<T: Send + 'static> Flow<T> {
    /// Shifts every item (and the completion) forward by `delay`, keeping
    /// order through the worker's FIFO. Errors are not delayed.
    pub fn delay(&self, delay: Duration, executor: Arc<dyn Executor>) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let shared = Arc::new(DelayShared {
                down: down.clone(),
                worker: executor.worker(),
                cancelled: AtomicBool::new(false),
                up: SubscriptionSlot::new(),
            });
            down.on_subscribe(Link::Direct(Arc::new(DelaySubscription {
                shared: shared.clone(),
            })));
            source.subscribe(Arc::new(DelaySubscriber { shared, delay }));
        }))
    }

    /// Delays the *attach* to upstream, not the items.
    pub fn delay_subscription(&self, delay: Duration, executor: Arc<dyn Executor>) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let slot = Arc::new(SubscriptionSlot::new());
            down.on_subscribe(Link::Direct(Arc::new(SlotSubscription {
                slot: slot.clone(),
            })));
            let source = source.clone();
            let worker = executor.worker();
            let relay_worker = worker.clone();
            worker.schedule_delayed(
                Box::new(move || {
                    source.subscribe(Arc::new(SlotRelay {
                        down,
                        slot,
                        worker: relay_worker,
                    }));
                }),
                delay,
            );
        }))
    }

    /// Errors with [`FlowError::Timeout`] when the first item does not
    /// arrive within `window`, or a later item within `window` of its
    /// predecessor.
    pub fn timeout(&self, window: Duration, executor: Arc<dyn Executor>) -> Flow<T> {
        self.timeout_with(window, window, None, executor)
    }

    /// Full-control timeout: a separate first-item window, and an optional
    /// fallback flow switched in (inheriting outstanding demand) instead of
    /// erroring.
    pub fn timeout_with(
        &self,
        first: Duration,
        between: Duration,
        fallback: Option<Flow<T>>,
        executor: Arc<dyn Executor>,
    ) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let stage = Arc::new(TimeoutStage {
                down: down.clone(),
                worker: executor.worker(),
                between,
                fallback: fallback.clone(),
                arbiter: Arc::new(SubscriptionSlot::new()),
                generation: AtomicU64::new(0),
                switched: AtomicBool::new(false),
                me: Mutex::new(Weak::new()),
            });
            *stage.me.lock().unwrap() = Arc::downgrade(&stage);
            down.on_subscribe(Link::Direct(Arc::new(TimeoutSubscription {
                stage: stage.clone(),
            })));
            stage.arm(0, first);
            source.subscribe(stage);
        }))
    }

    /// Emits the most recent item each `period`; quiet periods emit
    /// nothing. A tick with an item but no demand is an overflow error.
    pub fn sample(&self, period: Duration, executor: Arc<dyn Executor>) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let stage = Arc::new(SampleStage {
                down: down.clone(),
                worker: executor.worker(),
                latest: AtomicCell::new(None),
                requested: AtomicU64::new(0),
                done: AtomicBool::new(false),
                up: SubscriptionSlot::new(),
            });
            down.on_subscribe(Link::Direct(Arc::new(SampleSubscription {
                stage: stage.clone(),
            })));
            let ticker = stage.clone();
            stage.worker.schedule_periodic(
                Box::new(move || ticker.tick()),
                period,
                period,
            );
            source.subscribe(stage);
        }))
    }

    /// Emits an item only once `window` elapses with nothing newer; each
    /// arrival restarts the clock. The pending item is flushed at
    /// completion.
    pub fn debounce(&self, window: Duration, executor: Arc<dyn Executor>) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let stage = Arc::new(DebounceStage {
                down: down.clone(),
                worker: executor.worker(),
                window,
                pending: Mutex::new(None),
                generation: AtomicU64::new(0),
                requested: AtomicU64::new(0),
                done: AtomicBool::new(false),
                up: SubscriptionSlot::new(),
                me: Mutex::new(Weak::new()),
            });
            *stage.me.lock().unwrap() = Arc::downgrade(&stage);
            down.on_subscribe(Link::Direct(Arc::new(DebounceSubscription {
                stage: stage.clone(),
            })));
            source.subscribe(stage);
        }))
    }

    /// Relays the first item of each `window`, dropping the rest; purely
    /// clock-based, no worker involved.
    pub fn throttle_first(&self, window: Duration) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            source.subscribe(Arc::new(ThrottleFirstSubscriber {
                down,
                window,
                open_at: Mutex::new(None),
                up: Mutex::new(None),
            }));
        }))
    }
}

struct DelayShared<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    cancelled: AtomicBool,
    up: SubscriptionSlot,
}

struct DelaySubscriber<T: Send + 'static> {
    shared: Arc<DelayShared<T>>,
    delay: Duration,
}

impl<T: Send + 'static> Subscriber<T> for DelaySubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.shared.up.set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        let shared = self.shared.clone();
        self.shared.worker.schedule_delayed(
            Box::new(move || {
                if !shared.cancelled.load(Ordering::Acquire) {
                    shared.down.on_next(item);
                }
            }),
            self.delay,
        );
    }

    fn on_complete(&self) {
        let shared = self.shared.clone();
        self.shared.worker.schedule_delayed(
            Box::new(move || {
                if !shared.cancelled.load(Ordering::Acquire) {
                    shared.up.clear();
                    shared.down.on_complete();
                }
                shared.worker.dispose();
            }),
            self.delay,
        );
    }

    fn on_error(&self, err: FlowError) {
        // Errors jump the queue: pending delayed items are abandoned.
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.up.clear();
        self.shared.down.on_error(err);
        self.shared.worker.dispose();
    }
}

struct DelaySubscription<T: Send + 'static> {
    shared: Arc<DelayShared<T>>,
}

impl<T: Send + 'static> Subscription for DelaySubscription<T> {
    fn request(&self, n: u64) {
        self.shared.up.request(n);
    }

    fn cancel(&self) {
        self.shared.cancelled.store(true, Ordering::Release);
        self.shared.up.cancel();
        self.shared.worker.dispose();
    }
}

/// Slot-backed pass-through used where the upstream attach happens later.
struct SlotSubscription {
    slot: Arc<SubscriptionSlot>,
}

impl Subscription for SlotSubscription {
    fn request(&self, n: u64) {
        self.slot.request(n);
    }

    fn cancel(&self) {
        self.slot.cancel();
    }
}

struct SlotRelay<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    slot: Arc<SubscriptionSlot>,
    worker: Arc<dyn Worker>,
}

impl<T: Send + 'static> Subscriber<T> for SlotRelay<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.slot.set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        self.down.on_next(item);
    }

    fn on_complete(&self) {
        self.slot.clear();
        self.down.on_complete();
        self.worker.dispose();
    }

    fn on_error(&self, err: FlowError) {
        self.slot.clear();
        self.down.on_error(err);
        self.worker.dispose();
    }
}

struct TimeoutStage<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    between: Duration,
    fallback: Option<Flow<T>>,
    /// Demand survives the switch to the fallback.
    arbiter: Arc<SubscriptionSlot>,
    generation: AtomicU64,
    switched: AtomicBool,
    me: Mutex<Weak<Self>>,
}

impl<T: Send + 'static> TimeoutStage<T> {
    fn arm(&self, generation: u64, window: Duration) {
        let weak = self.me.lock().unwrap().clone();
        self.worker.schedule_delayed(
            Box::new(move || {
                if let Some(stage) = weak.upgrade() {
                    stage.fire(generation, window);
                }
            }),
            window,
        );
    }

    fn fire(&self, generation: u64, window: Duration) {
        if self.switched.load(Ordering::Acquire)
            || self.generation.load(Ordering::Acquire) != generation
        {
            return;
        }
        if self.switched.swap(true, Ordering::AcqRel) {
            return;
        }
        self.arbiter.cancel_current();
        match &self.fallback {
            Some(fallback) => {
                fallback.subscribe(Arc::new(SlotRelay {
                    down: self.down.clone(),
                    slot: self.arbiter.clone(),
                    worker: self.worker.clone(),
                }));
            }
            None => {
                self.down.on_error(FlowError::Timeout(window));
                self.worker.dispose();
            }
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for TimeoutStage<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.arbiter.replace(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if self.switched.load(Ordering::Acquire) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.down.on_next(item);
        self.arbiter.produced(1);
        self.arm(generation, self.between);
    }

    fn on_complete(&self) {
        if !self.switched.swap(true, Ordering::AcqRel) {
            self.arbiter.clear();
            self.down.on_complete();
            self.worker.dispose();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.switched.swap(true, Ordering::AcqRel) {
            self.arbiter.clear();
            self.down.on_error(err);
            self.worker.dispose();
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct TimeoutSubscription<T: Send + 'static> {
    stage: Arc<TimeoutStage<T>>,
}

impl<T: Send + 'static> Subscription for TimeoutSubscription<T> {
    fn request(&self, n: u64) {
        self.stage.arbiter.request(n);
    }

    fn cancel(&self) {
        self.stage.switched.store(true, Ordering::Release);
        self.stage.arbiter.cancel();
        self.stage.worker.dispose();
    }
}

struct SampleStage<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    latest: AtomicCell<Option<T>>,
    requested: AtomicU64,
    done: AtomicBool,
    up: SubscriptionSlot,
}

impl<T: Send + 'static> SampleStage<T> {
    fn tick(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        if let Some(v) = self.latest.take() {
            if self.requested.load(Ordering::Acquire) > 0 {
                self.down.on_next(v);
                post_produced(&self.requested, 1);
            } else if !self.done.swap(true, Ordering::AcqRel) {
                self.up.cancel();
                self.down.on_error(FlowError::Overflow);
                self.worker.dispose();
            }
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for SampleStage<T> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.up.set(link.into_subscription()) {
            self.up.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if !self.done.load(Ordering::Acquire) {
            self.latest.store(Some(item));
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.clear();
            self.down.on_complete();
            self.worker.dispose();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.latest.take();
            self.up.clear();
            self.down.on_error(err);
            self.worker.dispose();
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct SampleSubscription<T: Send + 'static> {
    stage: Arc<SampleStage<T>>,
}

impl<T: Send + 'static> Subscription for SampleSubscription<T> {
    fn request(&self, n: u64) {
        if n > 0 {
            post_request(&self.stage.requested, n);
        }
    }

    fn cancel(&self) {
        self.stage.done.store(true, Ordering::Release);
        self.stage.up.cancel();
        self.stage.worker.dispose();
    }
}

struct DebounceStage<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    window: Duration,
    pending: Mutex<Option<(u64, T)>>,
    generation: AtomicU64,
    requested: AtomicU64,
    done: AtomicBool,
    up: SubscriptionSlot,
    me: Mutex<Weak<Self>>,
}

impl<T: Send + 'static> DebounceStage<T> {
    fn flush(&self, generation: u64) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let item = {
            let mut pending = self.pending.lock().unwrap();
            match pending.take() {
                Some((tag, v)) if tag == generation => Some(v),
                other => {
                    // A newer item superseded this window; put it back.
                    *pending = other;
                    None
                }
            }
        };
        if let Some(v) = item {
            if self.requested.load(Ordering::Acquire) > 0 {
                self.down.on_next(v);
                post_produced(&self.requested, 1);
            } else if !self.done.swap(true, Ordering::AcqRel) {
                self.up.cancel();
                self.down.on_error(FlowError::Overflow);
                self.worker.dispose();
            }
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for DebounceStage<T> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.up.set(link.into_subscription()) {
            self.up.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *self.pending.lock().unwrap() = Some((generation, item));
        let weak = self.me.lock().unwrap().clone();
        self.worker.schedule_delayed(
            Box::new(move || {
                if let Some(stage) = weak.upgrade() {
                    stage.flush(generation);
                }
            }),
            self.window,
        );
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            // The quiet window is moot now; the pending item goes out with
            // the completion if there is demand for it.
            let pending = self.pending.lock().unwrap().take();
            if let Some((_, v)) = pending {
                if self.requested.load(Ordering::Acquire) > 0 {
                    self.down.on_next(v);
                }
            }
            self.up.clear();
            self.down.on_complete();
            self.worker.dispose();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.pending.lock().unwrap().take();
            self.up.clear();
            self.down.on_error(err);
            self.worker.dispose();
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct DebounceSubscription<T: Send + 'static> {
    stage: Arc<DebounceStage<T>>,
}

impl<T: Send + 'static> Subscription for DebounceSubscription<T> {
    fn request(&self, n: u64) {
        if n > 0 {
            post_request(&self.stage.requested, n);
        }
    }

    fn cancel(&self) {
        self.stage.done.store(true, Ordering::Release);
        self.stage.up.cancel();
        self.stage.worker.dispose();
    }
}

struct ThrottleFirstSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    window: Duration,
    open_at: Mutex<Option<Instant>>,
    up: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<T: Send + 'static> Subscriber<T> for ThrottleFirstSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        *self.up.lock().unwrap() = Some(up.clone());
        self.down.on_subscribe(Link::Direct(up));
    }

    fn on_next(&self, item: T) {
        let now = Instant::now();
        let mut gate = self.open_at.lock().unwrap();
        if gate.is_none_or(|at| now >= at) {
            *gate = Some(now + self.window);
            drop(gate);
            self.down.on_next(item);
        } else {
            drop(gate);
            let up = self.up.lock().unwrap().clone();
            if let Some(up) = up {
                up.request(1);
            }
        }
    }

    fn on_complete(&self) {
        self.up.lock().unwrap().take();
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        self.up.lock().unwrap().take();
        self.down.on_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec;
    use crate::source::{Backpressure, Emitter, create, just, range};
    use crate::testkit::TestSubscriber;

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

    /// delay shifts items without reordering them
    #[test]
    fn test_delay_order() {
        let probe = TestSubscriber::unbounded();
        let started = Instant::now();
        range(0, 5)
            .delay(Duration::from_millis(20), exec::single())
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(3)));
        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(probe.items(), vec![0, 1, 2, 3, 4]);
    }

    /// delay_subscription defers the attach itself
    #[test]
    fn test_delay_subscription() {
        let probe = TestSubscriber::unbounded();
        range(0, 3)
            .delay_subscription(Duration::from_millis(15), exec::single())
            .subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert!(probe.await_terminal(Duration::from_secs(3)));
        assert_eq!(probe.items(), vec![0, 1, 2]);
    }

    /// Seed scenario: stalled source with a fallback yields [1, 99]
    #[test]
    fn test_timeout_fallback() {
        let (main, main_em) = manual();
        let probe = TestSubscriber::unbounded();
        main.timeout_with(
            Duration::from_millis(50),
            Duration::from_millis(50),
            Some(just(99)),
            exec::single(),
        )
        .subscribe(probe.clone());
        let em = main_em.lock().unwrap().clone().unwrap();
        em.next(1);
        // ...and then the source stalls.
        assert!(probe.await_terminal(Duration::from_secs(3)));
        assert_eq!(probe.items(), vec![1, 99]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// Without a fallback a stall surfaces FlowError::Timeout
    #[test]
    fn test_timeout_error() {
        let (main, _em) = manual();
        let probe = TestSubscriber::unbounded();
        main.timeout(Duration::from_millis(20), exec::single())
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(3)));
        assert!(matches!(probe.first_error(), Some(FlowError::Timeout(_))));
    }

    /// A fast source never times out
    #[test]
    fn test_timeout_not_triggered() {
        let probe = TestSubscriber::unbounded();
        range(0, 5)
            .timeout(Duration::from_secs(5), exec::single())
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(3)));
        assert_eq!(probe.item_count(), 5);
        assert_eq!(probe.completion_count(), 1);
    }

    /// debounce keeps only the last of a burst
    #[test]
    fn test_debounce_burst() {
        let (main, main_em) = manual();
        let probe = TestSubscriber::unbounded();
        main.debounce(Duration::from_millis(30), exec::single())
            .subscribe(probe.clone());
        let em = main_em.lock().unwrap().clone().unwrap();
        em.next(1);
        em.next(2);
        em.next(3);
        assert!(probe.await_items(1, Duration::from_secs(3)));
        assert_eq!(probe.items(), vec![3]);
        em.complete();
        assert!(probe.await_terminal(Duration::from_secs(3)));
    }

    /// sample emits the newest value per tick and skips quiet ticks
    #[test]
    fn test_sample() {
        let (main, main_em) = manual();
        let probe = TestSubscriber::unbounded();
        main.sample(Duration::from_millis(25), exec::single())
            .subscribe(probe.clone());
        let em = main_em.lock().unwrap().clone().unwrap();
        em.next(1);
        em.next(2);
        assert!(probe.await_items(1, Duration::from_secs(3)));
        assert_eq!(probe.items(), vec![2]);
        em.complete();
        assert!(probe.await_terminal(Duration::from_secs(3)));
    }

    /// throttle_first keeps the head of each window
    #[test]
    fn test_throttle_first() {
        let probe = TestSubscriber::unbounded();
        range(0, 100)
            .throttle_first(Duration::from_secs(5))
            .subscribe(probe.clone());
        // The whole synchronous burst fits one window.
        assert_eq!(probe.items(), vec![0]);
        assert_eq!(probe.completion_count(), 1);
    }
}
