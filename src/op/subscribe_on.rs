//! Moving the subscription (and optionally the requests) onto a worker.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::FlowError;
use crate::exec::{Executor, Worker};
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;

impl<T: Send + 'static> Flow<T> {
    /// Performs the attach to upstream on a worker of `executor`. Items
    /// still arrive on whatever thread upstream emits from.
    pub fn subscribe_on(&self, executor: Arc<dyn Executor>) -> Flow<T> {
        self.subscribe_on_requests(executor, false)
    }

    /// [`subscribe_on`](Flow::subscribe_on) that additionally hops every
    /// downstream `request` onto the worker — required when upstream
    /// produces synchronously on the requesting thread and must not run on
    /// the subscriber's.
    pub fn subscribe_on_requests(&self, executor: Arc<dyn Executor>, request_on: bool) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let worker = executor.worker();
            let stage = Arc::new(SubscribeOnStage {
                down: down.clone(),
                worker: worker.clone(),
                request_on,
                up: SubscriptionSlot::new(),
                done: AtomicBool::new(false),
            });
            down.on_subscribe(Link::Direct(Arc::new(SubscribeOnSubscription {
                stage: stage.clone(),
            })));
            let source = source.clone();
            let hopped = stage.clone();
            worker.schedule(Box::new(move || {
                source.subscribe(hopped);
            }));
        }))
    }
}

struct SubscribeOnStage<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    worker: Arc<dyn Worker>,
    request_on: bool,
    up: SubscriptionSlot,
    done: AtomicBool,
}

impl<T: Send + 'static> Subscriber<T> for SubscribeOnStage<T> {
    fn on_subscribe(&self, link: Link<T>) {
        // Demand that arrived before the hop is forwarded by the slot.
        self.up.set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        self.down.on_next(item);
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
            self.up.clear();
            self.down.on_error(err);
            self.worker.dispose();
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct SubscribeOnSubscription<T: Send + 'static> {
    stage: Arc<SubscribeOnStage<T>>,
}

impl<T: Send + 'static> Subscription for SubscribeOnSubscription<T> {
    fn request(&self, n: u64) {
        if self.stage.request_on {
            let stage = self.stage.clone();
            self.stage.worker.schedule(Box::new(move || {
                stage.up.request(n);
            }));
        } else {
            self.stage.up.request(n);
        }
    }

    fn cancel(&self) {
        self.stage.up.cancel();
        self.stage.worker.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec;
    use crate::source::range;
    use crate::testkit::TestSubscriber;
    use std::time::Duration;

    /// The whole synchronous chain runs away from the caller thread
    #[test]
    fn test_subscription_hops() {
        let caller = std::thread::current().id();
        let seen = Arc::new(std::sync::Mutex::new(None));
        let s = seen.clone();
        let probe = TestSubscriber::unbounded();
        range(0, 5)
            .map(move |x| {
                *s.lock().unwrap() = Some(std::thread::current().id());
                x
            })
            .subscribe_on(exec::computation())
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.item_count(), 5);
        assert_ne!(seen.lock().unwrap().unwrap(), caller);
    }

    /// Requests issued before the hop are not lost
    #[test]
    fn test_early_demand_kept() {
        let probe = TestSubscriber::with_request(2);
        range(0, 10).subscribe_on(exec::computation()).subscribe(probe.clone());
        assert!(probe.await_items(2, Duration::from_secs(5)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(probe.items(), vec![0, 1]);
        assert!(!probe.is_terminated());
    }

    /// request_on hops demand onto the worker thread
    #[test]
    fn test_request_on() {
        let probe = TestSubscriber::unbounded();
        range(0, 3)
            .subscribe_on_requests(exec::computation(), true)
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(5)));
        assert_eq!(probe.items(), vec![0, 1, 2]);
    }
}
