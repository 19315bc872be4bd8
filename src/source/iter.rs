use std::iter::Peekable;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, FusedQueue, FusionMode, Link, Publisher, Subscriber, Subscription, WakeHandle};
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::op::drain::DrainGate;

/// Cold generator over a clonable iterable; every subscriber gets a fresh
/// iteration. The canonical `Sync`-fused source: a fused downstream polls
/// items one by one instead of receiving pushes.
pub fn from_iter<T, I>(iterable: I) -> Flow<T>
where
    T: Send + 'static,
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
{
    Flow::new(IterPublisher { iterable })
}

/// The integers `start..start+count`.
pub fn range(start: i64, count: u64) -> Flow<i64> {
    let end = start.saturating_add(i64::try_from(count).unwrap_or(i64::MAX));
    from_iter(start..end)
}

struct IterPublisher<I> {
    iterable: I,
}

impl<T, I> Publisher<T> for IterPublisher<I>
where
    T: Send + 'static,
    I: IntoIterator<Item = T> + Clone + Send + Sync + 'static,
    I::IntoIter: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let sub = Arc::new(IterSubscription {
            iter: Mutex::new(self.iterable.clone().into_iter().peekable()),
            down: subscriber.clone(),
            requested: AtomicU64::new(0),
            gate: DrainGate::new(),
            cancelled: AtomicBool::new(false),
            terminated: AtomicBool::new(false),
            fused: AtomicBool::new(false),
        });
        subscriber.on_subscribe(Link::Fused(sub));
    }
}

struct IterSubscription<T: Send + 'static, It: Iterator<Item = T> + Send> {
    iter: Mutex<Peekable<It>>,
    down: Arc<dyn Subscriber<T>>,
    requested: AtomicU64,
    gate: DrainGate,
    cancelled: AtomicBool,
    terminated: AtomicBool,
    fused: AtomicBool,
}

impl<T: Send + 'static, It: Iterator<Item = T> + Send> IterSubscription<T, It> {
    fn next(&self) -> Option<T> {
        self.iter.lock().unwrap().next()
    }

    /// Push-mode emission loop; the iterator lock is never held across a
    /// downstream call, so reentrant requests cannot deadlock.
    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            let mut emitted = 0u64;
            loop {
                if self.cancelled.load(Ordering::Acquire) || self.terminated.load(Ordering::Acquire)
                {
                    break;
                }
                let req = self.requested.load(Ordering::Acquire);
                if req != UNBOUNDED && emitted >= req {
                    break;
                }
                match self.next() {
                    Some(v) => {
                        self.down.on_next(v);
                        emitted += 1;
                    }
                    None => {
                        self.terminated.store(true, Ordering::Release);
                        self.down.on_complete();
                        break;
                    }
                }
            }
            if emitted > 0 {
                post_produced(&self.requested, emitted);
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<T: Send + 'static, It: Iterator<Item = T> + Send> Subscription for IterSubscription<T, It> {
    fn request(&self, n: u64) {
        if n == 0 {
            if !self.terminated.swap(true, Ordering::AcqRel) {
                self.down.on_error(FlowError::ZeroRequest);
            }
            return;
        }
        if self.fused.load(Ordering::Acquire) {
            return;
        }
        post_request(&self.requested, n);
        self.drain();
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }
}

impl<T: Send + 'static, It: Iterator<Item = T> + Send> FusedQueue<T> for IterSubscription<T, It> {
    fn enable(&self, requested: FusionMode, _wake: WakeHandle) -> FusionMode {
        if requested == FusionMode::Sync {
            self.fused.store(true, Ordering::Release);
            FusionMode::Sync
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        if self.cancelled.load(Ordering::Acquire) {
            return Ok(None);
        }
        Ok(self.next())
    }

    fn is_empty(&self) -> bool {
        self.iter.lock().unwrap().peek().is_none()
    }

    fn clear(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    // A cold generator is "done" by definition: poll → None is terminal.
    fn is_done(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSubscriber;

    /// range delivers exactly [a, a+n)
    #[test]
    fn test_range_to_list() {
        let probe = TestSubscriber::unbounded();
        range(3, 4).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![3, 4, 5, 6]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// Emission never exceeds the requested amount
    #[test]
    fn test_bounded_demand() {
        let probe = TestSubscriber::with_request(2);
        range(0, 10).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1]);
        assert!(!probe.is_terminated());
        probe.request(3);
        assert_eq!(probe.items(), vec![0, 1, 2, 3, 4]);
        probe.request(crate::flowctl::request::UNBOUNDED);
        assert_eq!(probe.item_count(), 10);
        assert_eq!(probe.completion_count(), 1);
    }

    /// A reentrant request from on_next does not double-emit
    #[test]
    fn test_reentrant_request() {
        use crate::flow::{Link, Subscriber};
        use std::sync::Mutex;

        struct OneByOne {
            seen: Mutex<Vec<i64>>,
            link: Mutex<Option<Link<i64>>>,
        }

        impl Subscriber<i64> for OneByOne {
            fn on_subscribe(&self, link: Link<i64>) {
                *self.link.lock().unwrap() = Some(link.clone());
                link.request(1);
            }

            fn on_next(&self, item: i64) {
                self.seen.lock().unwrap().push(item);
                let link = self.link.lock().unwrap().clone();
                if let Some(link) = link {
                    link.request(1);
                }
            }

            fn on_complete(&self) {}

            fn on_error(&self, _err: FlowError) {}
        }

        let sub = Arc::new(OneByOne {
            seen: Mutex::new(Vec::new()),
            link: Mutex::new(None),
        });
        range(0, 5).subscribe(sub.clone());
        assert_eq!(*sub.seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    /// A Sync-fused consumer polls items directly
    #[test]
    fn test_sync_fusion_poll() {
        use crate::flow::FusionMode;
        use std::sync::Mutex;

        struct Fused {
            polled: Mutex<Vec<i64>>,
        }

        impl Subscriber<i64> for Fused {
            fn on_subscribe(&self, link: Link<i64>) {
                assert_eq!(
                    link.try_fuse(FusionMode::Sync, Link::<i64>::noop_wake()),
                    FusionMode::Sync
                );
                let mut polled = self.polled.lock().unwrap();
                while let Ok(Some(v)) = link.poll() {
                    polled.push(v);
                }
            }

            fn on_next(&self, _item: i64) {
                panic!("fused source must not push");
            }

            fn on_complete(&self) {}

            fn on_error(&self, _err: FlowError) {}
        }

        let sub = Arc::new(Fused {
            polled: Mutex::new(Vec::new()),
        });
        range(0, 4).subscribe(sub.clone());
        assert_eq!(*sub.polled.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}
