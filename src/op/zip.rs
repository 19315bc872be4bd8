//! Zipping coordinator: lockstep combination with per-source queues.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Publisher, Subscriber, Subscription};
use crate::flowctl::NoopSubscription;
use crate::flowctl::request::{post_produced, post_request};
use crate::op::drain::DrainGate;
use crate::queue::RingQueue;

/// Combines the sources in lockstep: the k-th output is built from the k-th
/// item of every source. Completes as soon as any source is exhausted
/// (shortest source wins). Each source is prefetched into its own bounded
/// queue and replenished as its items are consumed.
pub fn zip<T, R>(
    sources: Vec<Flow<T>>,
    zipper: impl Fn(Vec<T>) -> R + Send + Sync + 'static,
) -> Flow<R>
where
    T: Send + 'static,
    R: Send + 'static,
{
    Flow::new(ZipPublisher {
        sources,
        zipper: Arc::new(zipper),
        prefetch: crate::hooks::buffer_size(),
    })
}

impl<T: Send + 'static> Flow<T> {
    /// Binary [`zip`] with a two-argument closure.
    pub fn zip_with<R: Send + 'static>(
        &self,
        other: Flow<T>,
        zipper: impl Fn(T, T) -> R + Send + Sync + 'static,
    ) -> Flow<R> {
        crate::op::zip2(self.clone(), other, zipper)
    }
}

struct ZipPublisher<T: Send + 'static, R: Send + 'static> {
    sources: Vec<Flow<T>>,
    zipper: Arc<dyn Fn(Vec<T>) -> R + Send + Sync>,
    prefetch: usize,
}

impl<T: Send + 'static, R: Send + 'static> Publisher<R> for ZipPublisher<T, R> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<R>>) {
        if self.sources.is_empty() {
            subscriber.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
            subscriber.on_complete();
            return;
        }
        let coordinator = Arc::new(ZipCoordinator {
            down: subscriber.clone(),
            zipper: self.zipper.clone(),
            prefetch: self.prefetch,
            limit: (self.prefetch - (self.prefetch >> 2)) as u64,
            inners: self
                .sources
                .iter()
                .map(|_| {
                    Arc::new(ZipInner {
                        queue: RingQueue::with_capacity(self.prefetch),
                        done: AtomicBool::new(false),
                        link: Mutex::new(None),
                        consumed: AtomicU64::new(0),
                    })
                })
                .collect(),
            requested: AtomicU64::new(0),
            gate: DrainGate::new(),
            cancelled: AtomicBool::new(false),
            delivered: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Link::Direct(Arc::new(ZipSubscription {
            parent: coordinator.clone(),
        })));
        for (i, source) in self.sources.iter().enumerate() {
            if coordinator.cancelled.load(Ordering::Acquire)
                || coordinator.delivered.load(Ordering::Acquire)
            {
                break;
            }
            source.subscribe(Arc::new(ZipInnerSubscriber {
                parent: coordinator.clone(),
                inner: coordinator.inners[i].clone(),
            }));
        }
    }
}

struct ZipCoordinator<T: Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    zipper: Arc<dyn Fn(Vec<T>) -> R + Send + Sync>,
    prefetch: usize,
    limit: u64,
    inners: Vec<Arc<ZipInner<T>>>,
    requested: AtomicU64,
    gate: DrainGate,
    cancelled: AtomicBool,
    delivered: AtomicBool,
}

struct ZipInner<T: Send + 'static> {
    queue: RingQueue<T>,
    done: AtomicBool,
    link: Mutex<Option<Link<T>>>,
    consumed: AtomicU64,
}

impl<T: Send + 'static> ZipInner<T> {
    fn retire(&self) {
        if let Some(link) = self.link.lock().unwrap().take() {
            link.cancel();
        }
        self.queue.clear();
    }
}

impl<T: Send + 'static, R: Send + 'static> ZipCoordinator<T, R> {
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

    fn teardown(&self) {
        for inner in &self.inners {
            inner.retire();
        }
    }

    /// A source that finished with nothing staged means no further tuple can
    /// ever be built.
    fn starved(&self) -> bool {
        self.inners
            .iter()
            .any(|inner| inner.done.load(Ordering::Acquire) && inner.queue.is_empty())
    }

    fn drain_pass(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.teardown();
            return;
        }
        loop {
            if self.starved() {
                self.teardown();
                if !self.delivered.swap(true, Ordering::AcqRel) {
                    self.down.on_complete();
                }
                return;
            }
            if self.requested.load(Ordering::Acquire) == 0 {
                return;
            }
            if self.inners.iter().any(|inner| inner.queue.is_empty()) {
                return;
            }
            // Every queue has a head: consume one from each.
            let row: Vec<T> = self
                .inners
                .iter()
                .map(|inner| inner.queue.poll().expect("non-empty zip queue"))
                .collect();
            self.down.on_next((self.zipper)(row));
            post_produced(&self.requested, 1);
            for inner in &self.inners {
                self.replenish(inner);
            }
            if self.cancelled.load(Ordering::Acquire) {
                self.teardown();
                return;
            }
        }
    }

    fn replenish(&self, inner: &Arc<ZipInner<T>>) {
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
        self.teardown();
        if !self.delivered.swap(true, Ordering::AcqRel) {
            self.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct ZipInnerSubscriber<T: Send + 'static, R: Send + 'static> {
    parent: Arc<ZipCoordinator<T, R>>,
    inner: Arc<ZipInner<T>>,
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for ZipInnerSubscriber<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        *self.inner.link.lock().unwrap() = Some(link.clone());
        link.request(self.parent.prefetch as u64);
    }

    fn on_next(&self, item: T) {
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
        self.parent.fail(err);
    }
}

struct ZipSubscription<T: Send + 'static, R: Send + 'static> {
    parent: Arc<ZipCoordinator<T, R>>,
}

impl<T: Send + 'static, R: Send + 'static> Subscription for ZipSubscription<T, R> {
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
    use crate::op::zip2;
    use crate::source::{never, range};
    use crate::testkit::TestSubscriber;

    /// Seed scenario: zip of range(1,5) and range(10,3) is [11,13,15]
    #[test]
    fn test_zip_shortest_wins() {
        let probe = TestSubscriber::unbounded();
        zip2(range(1, 5), range(10, 3), |a, b| a + b).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![11, 13, 15]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// A silent source holds emission, an exhausted one completes the chain
    #[test]
    fn test_zip_with_never() {
        let probe = TestSubscriber::unbounded();
        zip2(range(0, 3), never(), |a, b: i64| a + b).subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert!(!probe.is_terminated());
    }

    /// Demand gates tuple production
    #[test]
    fn test_zip_bounded() {
        let probe = TestSubscriber::with_request(2);
        zip2(range(0, 10), range(0, 10), |a, b| a * b).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1]);
        assert!(!probe.is_terminated());
        probe.request(100);
        assert_eq!(probe.item_count(), 10);
        assert_eq!(probe.completion_count(), 1);
    }

    /// An empty source list is an empty flow
    #[test]
    fn test_zip_empty_sources() {
        let probe = TestSubscriber::<i64>::unbounded();
        zip(Vec::<Flow<i64>>::new(), |_row| 0i64).subscribe(probe.clone());
        assert_eq!(probe.completion_count(), 1);
    }

    /// N-ary zip rows arrive in source order
    #[test]
    fn test_zip_vec_rows() {
        let probe = TestSubscriber::unbounded();
        zip(vec![range(0, 2), range(10, 2), range(20, 2)], |row| row)
            .subscribe(probe.clone());
        assert_eq!(
            probe.items(),
            vec![vec![0, 10, 20], vec![1, 11, 21]]
        );
    }
}
