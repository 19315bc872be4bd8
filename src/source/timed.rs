use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::FlowError;
use crate::exec::{Canceller, Executor, Worker};
use crate::flow::{Flow, Link, Publisher, Subscriber, Subscription};
use crate::flowctl::request::{post_produced, post_request};

/// Emits a single `0` after `delay` on a worker of `executor`, then
/// completes. Firing without downstream demand is an overflow error.
pub fn timer(delay: Duration, executor: Arc<dyn Executor>) -> Flow<i64> {
    Flow::new(TimerPublisher { delay, executor })
}

/// Emits `0, 1, 2, …` every `period` (first after `initial`). An elapsed
/// tick with no outstanding demand is an overflow error.
pub fn interval(initial: Duration, period: Duration, executor: Arc<dyn Executor>) -> Flow<i64> {
    Flow::new(IntervalPublisher {
        initial,
        period,
        executor,
    })
}

struct TimerPublisher {
    delay: Duration,
    executor: Arc<dyn Executor>,
}

impl Publisher<i64> for TimerPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<i64>>) {
        let worker = self.executor.worker();
        let sub = Arc::new(TimerSubscription {
            down: subscriber.clone(),
            worker: worker.clone(),
            requested: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Link::Direct(sub.clone()));
        worker.schedule_delayed(
            Box::new(move || {
                sub.fire();
            }),
            self.delay,
        );
    }
}

struct TimerSubscription {
    down: Arc<dyn Subscriber<i64>>,
    worker: Arc<dyn Worker>,
    requested: AtomicBool,
    cancelled: AtomicBool,
}

impl TimerSubscription {
    fn fire(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.requested.load(Ordering::Acquire) {
            self.down.on_next(0);
            self.down.on_complete();
        } else {
            self.down.on_error(FlowError::Overflow);
        }
        self.worker.dispose();
    }
}

impl Subscription for TimerSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            if !self.cancelled.swap(true, Ordering::AcqRel) {
                self.down.on_error(FlowError::ZeroRequest);
                self.worker.dispose();
            }
            return;
        }
        self.requested.store(true, Ordering::Release);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.worker.dispose();
    }
}

struct IntervalPublisher {
    initial: Duration,
    period: Duration,
    executor: Arc<dyn Executor>,
}

impl Publisher<i64> for IntervalPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<i64>>) {
        let worker = self.executor.worker();
        let sub = Arc::new(IntervalSubscription {
            down: subscriber.clone(),
            worker: worker.clone(),
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            count: AtomicU64::new(0),
            tick: Mutex::new(None),
        });
        subscriber.on_subscribe(Link::Direct(sub.clone()));
        let ticker = sub.clone();
        let cancel = worker.schedule_periodic(
            Box::new(move || {
                ticker.fire();
            }),
            self.initial,
            self.period,
        );
        *sub.tick.lock().unwrap() = Some(cancel);
    }
}

struct IntervalSubscription {
    down: Arc<dyn Subscriber<i64>>,
    worker: Arc<dyn Worker>,
    requested: AtomicU64,
    cancelled: AtomicBool,
    count: AtomicU64,
    tick: Mutex<Option<Canceller>>,
}

impl IntervalSubscription {
    fn fire(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        if self.requested.load(Ordering::Acquire) > 0 {
            let n = self.count.fetch_add(1, Ordering::Relaxed);
            self.down.on_next(n as i64);
            post_produced(&self.requested, 1);
        } else {
            // A tick elapsed with nobody asking: the clock cannot be paused.
            if !self.cancelled.swap(true, Ordering::AcqRel) {
                self.down.on_error(FlowError::Overflow);
                self.stop();
            }
        }
    }
}

impl Subscription for IntervalSubscription {
    fn request(&self, n: u64) {
        if n == 0 {
            if !self.cancelled.swap(true, Ordering::AcqRel) {
                self.down.on_error(FlowError::ZeroRequest);
                self.stop();
            }
            return;
        }
        post_request(&self.requested, n);
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        self.stop();
    }
}

impl IntervalSubscription {
    fn stop(&self) {
        if let Some(c) = self.tick.lock().unwrap().take() {
            c.cancel();
        }
        self.worker.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec;
    use crate::testkit::TestSubscriber;

    /// timer fires once after its delay and completes
    #[test]
    fn test_timer() {
        let probe = TestSubscriber::unbounded();
        timer(Duration::from_millis(10), exec::single()).subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert_eq!(probe.items(), vec![0]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// timer without demand errors instead of emitting
    #[test]
    fn test_timer_no_demand() {
        let probe = TestSubscriber::<i64>::with_request(0);
        timer(Duration::from_millis(5), exec::single()).subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(2)));
        assert!(matches!(probe.first_error(), Some(FlowError::Overflow)));
    }

    /// interval counts monotonically
    #[test]
    fn test_interval() {
        let probe = TestSubscriber::unbounded();
        interval(
            Duration::from_millis(1),
            Duration::from_millis(1),
            exec::single(),
        )
        .subscribe(probe.clone());
        assert!(probe.await_items(5, Duration::from_secs(2)));
        probe.cancel();
        let items = probe.items();
        assert_eq!(items[..5], [0, 1, 2, 3, 4]);
    }
}
