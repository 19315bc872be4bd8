//! Thread hand-off with a bounded queue and a worker trampoline.

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::FlowError;
use crate::exec::{Executor, Worker};
use crate::flow::{Flow, FusionMode, Link, Subscriber, Subscription};
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::flowctl::terminal::TerminalLatch;
use crate::op::basic::AdapterPublisher;
use crate::op::drain::DrainGate;
use crate::queue::RingQueue;

const MODE_NONE: u8 = 0;
const MODE_SYNC: u8 = 1;
const MODE_ASYNC: u8 = 2;

impl<T: Send + 'static> Flow<T> {
    /// Re-emits everything on a worker of `executor`, staging items in a
    /// bounded queue of the default prefetch.
    pub fn observe_on(&self, executor: Arc<dyn Executor>) -> Flow<T> {
        self.observe_on_prefetch(executor, crate::hooks::buffer_size())
    }

    /// [`observe_on`](Flow::observe_on) with an explicit prefetch: the queue
    /// capacity, the upfront upstream request, and (in 75% steps) the
    /// replenishment unit.
    pub fn observe_on_prefetch(&self, executor: Arc<dyn Executor>, prefetch: usize) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let prefetch = prefetch.max(1);
            let stage = Arc::new(ObserveOnStage {
                down: down.clone(),
                worker: executor.worker(),
                prefetch,
                limit: prefetch - (prefetch >> 2),
                mode: AtomicU8::new(MODE_NONE),
                link: Mutex::new(None),
                queue: RingQueue::with_capacity(prefetch),
                requested: AtomicU64::new(0),
                consumed: AtomicU64::new(0),
                gate: DrainGate::new(),
                cancelled: AtomicBool::new(false),
                delivered: AtomicBool::new(false),
                latch: TerminalLatch::new(),
                me: Mutex::new(Weak::new()),
            });
            *stage.me.lock().unwrap() = Arc::downgrade(&stage);
            down.on_subscribe(Link::Direct(Arc::new(ObserveOnSubscription {
                stage: stage.clone(),
            })));
            source.subscribe(stage);
        }))
    }
}

struct ObserveOnStage<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    prefetch: usize,
    /// Replenishment threshold: request more once 75% of the window is used.
    limit: usize,
    mode: AtomicU8,
    link: Mutex<Option<Link<T>>>,
    queue: RingQueue<T>,
    requested: AtomicU64,
    /// Items taken from upstream since the last replenishment. Touched only
    /// by the drain owner.
    consumed: AtomicU64,
    gate: DrainGate,
    cancelled: AtomicBool,
    /// Terminal forwarded downstream.
    delivered: AtomicBool,
    latch: TerminalLatch,
    me: Mutex<Weak<Self>>,
}

impl<T: Send + 'static> ObserveOnStage<T> {
    fn arc(&self) -> Option<Arc<Self>> {
        self.me.lock().unwrap().upgrade()
    }

    fn upstream(&self) -> Option<Link<T>> {
        self.link.lock().unwrap().clone()
    }

    /// Funnel point: whoever transitions the gate 0→1 puts the drain on the
    /// worker; everyone else has marked the work as missed.
    fn schedule_drain(&self) {
        if self.gate.enter() {
            if let Some(me) = self.arc() {
                self.worker.schedule(Box::new(move || me.drain_loop()));
            }
        }
    }

    fn drain_loop(&self) {
        let mut missed = 1;
        loop {
            if self.mode.load(Ordering::Acquire) == MODE_SYNC {
                self.drain_sync();
            } else {
                self.drain_push();
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    /// Pull pass over a fused synchronous generator: no staging queue, no
    /// replenishment, emission bounded by downstream demand only.
    fn drain_sync(&self) {
        let Some(link) = self.upstream() else { return };
        let mut emitted = 0u64;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                return;
            }
            let req = self.requested.load(Ordering::Acquire);
            if req != UNBOUNDED && emitted >= req {
                break;
            }
            match link.poll() {
                Ok(Some(v)) => {
                    self.down.on_next(v);
                    emitted += 1;
                }
                Ok(None) => {
                    self.finish(Ok(()));
                    return;
                }
                Err(e) => {
                    self.finish(Err(e));
                    return;
                }
            }
        }
        if emitted > 0 {
            post_produced(&self.requested, emitted);
        }
    }

    /// Push pass: drain the staging queue (ours, or the fused upstream's)
    /// under downstream demand, observing the terminal only after emptiness.
    fn drain_push(&self) {
        let fused = self.mode.load(Ordering::Acquire) == MODE_ASYNC;
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.queue.clear();
                if let Some(link) = self.link.lock().unwrap().take() {
                    link.clear();
                }
                return;
            }
            let done = if fused {
                self.upstream().is_some_and(|l| l.is_done())
            } else {
                self.latch.is_terminated()
            };
            let mut delivered_one = false;
            if self.requested.load(Ordering::Acquire) > 0 {
                let polled = if fused {
                    match self.upstream().map(|l| l.poll()) {
                        Some(Ok(v)) => v,
                        Some(Err(e)) => {
                            self.finish(Err(e));
                            return;
                        }
                        None => None,
                    }
                } else {
                    self.queue.poll()
                };
                if let Some(v) = polled {
                    self.down.on_next(v);
                    post_produced(&self.requested, 1);
                    self.replenish();
                    delivered_one = true;
                }
            }
            if delivered_one {
                continue;
            }
            let empty = if fused {
                self.upstream().is_none_or(|l| l.is_empty())
            } else {
                self.queue.is_empty()
            };
            if done && empty {
                let outcome = if fused {
                    // An Async-fused upstream parks its failure behind the
                    // queue; an empty poll surfaces it.
                    match self.upstream().map(|l| l.poll()) {
                        Some(Err(e)) => Err(e),
                        _ => Ok(()),
                    }
                } else {
                    self.latch.get().unwrap_or(Ok(()))
                };
                self.finish(outcome);
            }
            return;
        }
    }

    fn replenish(&self) {
        let consumed = self.consumed.load(Ordering::Relaxed) + 1;
        if consumed >= self.limit as u64 {
            self.consumed.store(0, Ordering::Relaxed);
            if let Some(link) = self.upstream() {
                link.request(consumed);
            }
        } else {
            self.consumed.store(consumed, Ordering::Relaxed);
        }
    }

    fn finish(&self, outcome: Result<(), FlowError>) {
        if self.delivered.swap(true, Ordering::AcqRel) {
            if let Err(e) = outcome {
                crate::hooks::on_undeliverable(e);
            }
            return;
        }
        self.cancelled.store(true, Ordering::Release);
        self.link.lock().unwrap().take();
        match outcome {
            Ok(()) => self.down.on_complete(),
            Err(e) => self.down.on_error(e),
        }
        self.worker.dispose();
    }
}

impl<T: Send + 'static> Subscriber<T> for ObserveOnStage<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let wake: crate::flow::WakeHandle = {
            let weak = self.me.lock().unwrap().clone();
            Arc::new(move || {
                if let Some(me) = weak.upgrade() {
                    me.schedule_drain();
                }
            })
        };
        let granted = link.try_fuse(FusionMode::Async, wake.clone());
        let granted = if granted == FusionMode::None {
            link.try_fuse(FusionMode::Sync, wake)
        } else {
            granted
        };
        *self.link.lock().unwrap() = Some(link.clone());
        match granted {
            FusionMode::Sync => {
                self.mode.store(MODE_SYNC, Ordering::Release);
                // A cold generator is demand-driven through poll; requesting
                // would double-account.
            }
            FusionMode::Async => {
                self.mode.store(MODE_ASYNC, Ordering::Release);
                link.request(self.prefetch as u64);
            }
            FusionMode::None => {
                self.mode.store(MODE_NONE, Ordering::Release);
                link.request(self.prefetch as u64);
            }
        }
        // Demand may have arrived before the upstream did; serve it now.
        self.schedule_drain();
    }

    fn on_next(&self, item: T) {
        // Only reachable in unfused mode; fused upstreams go through the
        // queue and the wake handle.
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.queue.offer(item).is_err() {
            if let Some(link) = self.upstream() {
                link.cancel();
            }
            let _ = self.latch.try_error(FlowError::Overflow);
        }
        self.schedule_drain();
    }

    fn on_complete(&self) {
        if self.latch.try_complete() {
            self.schedule_drain();
        }
    }

    fn on_error(&self, err: FlowError) {
        if self.latch.try_error(err) {
            self.schedule_drain();
        } else {
            log::debug!("observe_on: error after terminal suppressed");
        }
    }
}

struct ObserveOnSubscription<T: Send + 'static> {
    stage: Arc<ObserveOnStage<T>>,
}

impl<T: Send + 'static> Subscription for ObserveOnSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        post_request(&self.stage.requested, n);
        self.stage.schedule_drain();
    }

    fn cancel(&self) {
        self.stage.cancelled.store(true, Ordering::Release);
        if let Some(link) = self.stage.upstream() {
            link.cancel();
        }
        self.stage.worker.dispose();
        self.stage.schedule_drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec;
    use crate::source::{from_iter, range};
    use crate::testkit::TestSubscriber;
    use std::time::Duration;

    /// Order is preserved across the thread hop
    #[test]
    fn test_order_preserved() {
        let probe = TestSubscriber::unbounded();
        range(0, 500)
            .observe_on(exec::computation())
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.items(), (0..500).collect::<Vec<_>>());
        assert_eq!(probe.completion_count(), 1);
    }

    /// Bounded demand is honored across the boundary
    #[test]
    fn test_bounded_demand() {
        let probe = TestSubscriber::with_request(3);
        range(0, 100)
            .observe_on(exec::computation())
            .subscribe(probe.clone());
        assert!(probe.await_items(3, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(probe.items(), vec![0, 1, 2]);
        assert!(!probe.is_terminated());
        probe.request(crate::flowctl::request::UNBOUNDED);
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.item_count(), 100);
    }

    /// The declared prefetch is requested upfront, then replenished in 75%
    /// steps
    #[test]
    fn test_prefetch_accounting() {
        use crate::flow::Publisher;

        struct RequestSpy {
            down: Arc<dyn Subscriber<i64>>,
            requests: Arc<Mutex<Vec<u64>>>,
        }

        impl Subscriber<i64> for RequestSpy {
            fn on_subscribe(&self, link: Link<i64>) {
                let up = link.into_subscription();
                self.down.on_subscribe(Link::Direct(Arc::new(SpySubscription {
                    up,
                    requests: self.requests.clone(),
                })));
            }

            fn on_next(&self, item: i64) {
                self.down.on_next(item);
            }

            fn on_complete(&self) {
                self.down.on_complete();
            }

            fn on_error(&self, err: FlowError) {
                self.down.on_error(err);
            }
        }

        struct SpySubscription {
            up: Arc<dyn Subscription>,
            requests: Arc<Mutex<Vec<u64>>>,
        }

        impl Subscription for SpySubscription {
            fn request(&self, n: u64) {
                self.requests.lock().unwrap().push(n);
                self.up.request(n);
            }

            fn cancel(&self) {
                self.up.cancel();
            }
        }

        struct SpiedRange {
            requests: Arc<Mutex<Vec<u64>>>,
        }

        impl Publisher<i64> for SpiedRange {
            fn subscribe(&self, subscriber: Arc<dyn Subscriber<i64>>) {
                range(0, 200).subscribe(Arc::new(RequestSpy {
                    down: subscriber,
                    requests: self.requests.clone(),
                }));
            }
        }

        let requests = Arc::new(Mutex::new(Vec::new()));
        let probe = TestSubscriber::unbounded();
        Flow::new(SpiedRange {
            requests: requests.clone(),
        })
        .observe_on_prefetch(exec::computation(), 16)
        .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.item_count(), 200);

        let seen = requests.lock().unwrap().clone();
        assert_eq!(seen[0], 16, "prefetch requested upfront: {seen:?}");
        assert!(
            seen[1..].iter().all(|r| *r == 12),
            "replenishment in 75% steps: {seen:?}"
        );
    }

    /// An unfused pushy upstream is staged through the ring without loss
    #[test]
    fn test_unfused_upstream() {
        // map breaks fusion, forcing the ring-queue path.
        let probe = TestSubscriber::unbounded();
        from_iter((0..200).collect::<Vec<i64>>())
            .map(|x| x * 2)
            .observe_on_prefetch(exec::computation(), 16)
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.items(), (0..200).map(|x| x * 2).collect::<Vec<_>>());
    }
}
