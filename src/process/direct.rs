use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::NoopSubscription;
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::op::basic::AdapterPublisher;

/// Hot multicast processor with no buffering of its own: every signal goes
/// to all current subscribers. Demand is tracked per subscriber, and a
/// subscriber that cannot keep up receives [`FlowError::Overflow`] — alone;
/// the rest of the audience is unaffected. Late subscribers only see the
/// terminal if the processor already finished.
pub struct DirectProcessor<T: Clone + Send + 'static> {
    ports: Mutex<Vec<Arc<DirectPort<T>>>>,
    terminal: Mutex<Option<Result<(), FlowError>>>,
    up: crate::flowctl::slot::SubscriptionSlot,
    me: Mutex<Weak<Self>>,
}

struct DirectPort<T: Clone + Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    requested: AtomicU64,
    cancelled: AtomicBool,
}

impl<T: Clone + Send + 'static> DirectProcessor<T> {
    pub fn new() -> Arc<Self> {
        let me = Arc::new(Self {
            ports: Mutex::new(Vec::new()),
            terminal: Mutex::new(None),
            up: crate::flowctl::slot::SubscriptionSlot::new(),
            me: Mutex::new(Weak::new()),
        });
        *me.me.lock().unwrap() = Arc::downgrade(&me);
        me
    }

    /// The publisher face of this processor.
    pub fn flow(&self) -> Flow<T> {
        let weak = self.me.lock().unwrap().clone();
        Flow::new(AdapterPublisher::new(move |down| {
            if let Some(me) = weak.upgrade() {
                me.attach(down);
            }
        }))
    }

    fn attach(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if let Some(terminal) = self.terminal.lock().unwrap().clone() {
            subscriber.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
            match terminal {
                Ok(()) => subscriber.on_complete(),
                Err(e) => subscriber.on_error(e),
            }
            return;
        }
        let Some(me) = self.me.lock().unwrap().upgrade() else {
            return;
        };
        let port = Arc::new(DirectPort {
            down: subscriber.clone(),
            requested: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
        });
        self.ports.lock().unwrap().push(port.clone());
        subscriber.on_subscribe(Link::Direct(Arc::new(PortSubscription {
            parent: me,
            port,
        })));
    }

    pub fn has_subscribers(&self) -> bool {
        !self.ports.lock().unwrap().is_empty()
    }

    fn snapshot(&self) -> Vec<Arc<DirectPort<T>>> {
        self.ports.lock().unwrap().clone()
    }

    fn evict(&self, port: &Arc<DirectPort<T>>) {
        self.ports
            .lock()
            .unwrap()
            .retain(|p| !Arc::ptr_eq(p, port));
    }

    /// Broadcasts an item; slow subscribers are failed individually.
    pub fn next(&self, item: T) {
        if self.terminal.lock().unwrap().is_some() {
            return;
        }
        for port in self.snapshot() {
            if port.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if port.requested.load(Ordering::Acquire) > 0 {
                port.down.on_next(item.clone());
                post_produced(&port.requested, 1);
            } else {
                port.cancelled.store(true, Ordering::Release);
                self.evict(&port);
                port.down.on_error(FlowError::Overflow);
            }
        }
    }

    pub fn complete(&self) {
        self.terminate(Ok(()));
    }

    pub fn error(&self, err: FlowError) {
        self.terminate(Err(err));
    }

    fn terminate(&self, outcome: Result<(), FlowError>) {
        {
            let mut terminal = self.terminal.lock().unwrap();
            if terminal.is_some() {
                if let Err(e) = outcome {
                    crate::hooks::on_undeliverable(e);
                }
                return;
            }
            *terminal = Some(outcome.clone());
        }
        let ports = std::mem::take(&mut *self.ports.lock().unwrap());
        for port in ports {
            if port.cancelled.load(Ordering::Acquire) {
                continue;
            }
            match &outcome {
                Ok(()) => port.down.on_complete(),
                Err(e) => port.down.on_error(e.clone()),
            }
        }
    }

    /// Detaches from the upstream this processor was plugged into.
    pub(crate) fn disconnect(&self) {
        self.up.cancel();
    }
}

/// The processor as a subscriber: plug it downstream of any flow to turn
/// that flow into a hot multicast.
impl<T: Clone + Send + 'static> Subscriber<T> for DirectProcessor<T> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.up.set(link.into_subscription()) {
            // The processor has no buffer; it leans on its subscribers'
            // demand bookkeeping instead.
            self.up.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        self.next(item);
    }

    fn on_complete(&self) {
        self.up.clear();
        self.complete();
    }

    fn on_error(&self, err: FlowError) {
        self.up.clear();
        self.error(err);
    }
}

struct PortSubscription<T: Clone + Send + 'static> {
    parent: Arc<DirectProcessor<T>>,
    port: Arc<DirectPort<T>>,
}

impl<T: Clone + Send + 'static> Subscription for PortSubscription<T> {
    fn request(&self, n: u64) {
        if n > 0 {
            post_request(&self.port.requested, n);
        }
    }

    fn cancel(&self) {
        self.port.cancelled.store(true, Ordering::Release);
        self.parent.evict(&self.port);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSubscriber;

    /// All live subscribers see every broadcast
    #[test]
    fn test_broadcast() {
        let proc = DirectProcessor::new();
        let a = TestSubscriber::unbounded();
        let b = TestSubscriber::unbounded();
        proc.flow().subscribe(a.clone());
        proc.flow().subscribe(b.clone());
        proc.next(1);
        proc.next(2);
        proc.complete();
        assert_eq!(a.items(), vec![1, 2]);
        assert_eq!(b.items(), vec![1, 2]);
        assert_eq!(a.completion_count(), 1);
        assert_eq!(b.completion_count(), 1);
    }

    /// Overproduction fails only the subscriber without demand
    #[test]
    fn test_slow_subscriber_failed_alone() {
        let proc = DirectProcessor::new();
        let fast = TestSubscriber::unbounded();
        let slow = TestSubscriber::with_request(1);
        proc.flow().subscribe(fast.clone());
        proc.flow().subscribe(slow.clone());
        proc.next(1);
        proc.next(2);
        assert_eq!(fast.items(), vec![1, 2]);
        assert_eq!(slow.items(), vec![1]);
        assert!(matches!(slow.first_error(), Some(FlowError::Overflow)));
        proc.complete();
        assert_eq!(fast.completion_count(), 1);
        assert_eq!(slow.completion_count(), 0);
    }

    /// Late subscribers get only the terminal
    #[test]
    fn test_late_subscriber() {
        let proc = DirectProcessor::<i64>::new();
        proc.next(1);
        proc.complete();
        let late = TestSubscriber::unbounded();
        proc.flow().subscribe(late.clone());
        assert_eq!(late.item_count(), 0);
        assert_eq!(late.completion_count(), 1);
    }

    /// The processor relays a cold flow as its subscriber face
    #[test]
    fn test_as_subscriber() {
        let proc = DirectProcessor::new();
        let probe = TestSubscriber::unbounded();
        proc.flow().subscribe(probe.clone());
        crate::source::range(0, 3).subscribe(proc.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);
        assert_eq!(probe.completion_count(), 1);
    }
}
