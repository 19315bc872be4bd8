use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::op::basic::AdapterPublisher;
use crate::process::DirectProcessor;

impl<T: Clone + Send + 'static> Flow<T> {
    /// Turns this cold flow into a connectable hot one: subscribers attach
    /// to a shared multicast hub, and the cold source starts only when
    /// [`ConnectableFlow::connect`] (or an auto/refcount policy) says so.
    pub fn publish(&self) -> ConnectableFlow<T> {
        ConnectableFlow {
            source: self.clone(),
            hub: DirectProcessor::new(),
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

/// A multicast hub over a cold source with an explicit start button.
/// Minimal by design: live signals only, no replay for latecomers.
pub struct ConnectableFlow<T: Clone + Send + 'static> {
    source: Flow<T>,
    hub: Arc<DirectProcessor<T>>,
    connected: Arc<AtomicBool>,
}

impl<T: Clone + Send + 'static> Clone for ConnectableFlow<T> {
    fn clone(&self) -> Self {
        Self {
            source: self.source.clone(),
            hub: self.hub.clone(),
            connected: self.connected.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> ConnectableFlow<T> {
    /// The subscriber-facing flow (does not connect by itself).
    pub fn flow(&self) -> Flow<T> {
        self.hub.flow()
    }

    /// Subscribes the hub to the cold source, once; later calls are no-ops.
    pub fn connect(&self) {
        if !self.connected.swap(true, Ordering::AcqRel) {
            self.source.subscribe(self.hub.clone());
        }
    }

    /// Connects automatically once the `k`-th subscriber attaches.
    pub fn auto_connect(self, k: usize) -> Flow<T> {
        let remaining = Arc::new(AtomicUsize::new(k.max(1)));
        Flow::new(AdapterPublisher::new(move |down| {
            self.flow().subscribe(down);
            if remaining
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |r| r.checked_sub(1))
                .is_ok()
                && remaining.load(Ordering::Acquire) == 0
            {
                self.connect();
            }
        }))
    }

    /// Connects with the first subscriber and cancels the source when the
    /// last one leaves. The next first subscriber starts a fresh cycle.
    pub fn ref_count(self) -> Flow<T> {
        let state = Arc::new(Mutex::new(RefCountState {
            cycle: None,
            count: 0,
        }));
        let source = self.source;
        Flow::new(AdapterPublisher::new(move |down| {
            let hub = {
                let mut guard = state.lock().unwrap();
                guard.count += 1;
                match &guard.cycle {
                    Some(hub) => hub.clone(),
                    None => {
                        let hub = DirectProcessor::new();
                        guard.cycle = Some(hub.clone());
                        hub
                    }
                }
            };
            let is_first = state.lock().unwrap().count == 1;
            hub.flow().subscribe(Arc::new(RefCountRelay {
                down,
                state: state.clone(),
                released: AtomicBool::new(false),
            }));
            if is_first {
                source.subscribe(hub);
            }
        }))
    }
}

struct RefCountState<T: Clone + Send + 'static> {
    cycle: Option<Arc<DirectProcessor<T>>>,
    count: usize,
}

struct RefCountRelay<T: Clone + Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    state: Arc<Mutex<RefCountState<T>>>,
    released: AtomicBool,
}

impl<T: Clone + Send + 'static> RefCountRelay<T> {
    fn release(&self) {
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.state.lock().unwrap();
        guard.count = guard.count.saturating_sub(1);
        if guard.count == 0 {
            // Last one out turns off the source.
            if let Some(hub) = guard.cycle.take() {
                drop(guard);
                hub.disconnect();
            }
        }
    }
}

impl<T: Clone + Send + 'static> Subscriber<T> for RefCountRelay<T> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        let relay = RefCountGuard {
            up,
            state: self.state.clone(),
            released: AtomicBool::new(false),
        };
        self.down.on_subscribe(Link::Direct(Arc::new(relay)));
    }

    fn on_next(&self, item: T) {
        self.down.on_next(item);
    }

    fn on_complete(&self) {
        self.release();
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        self.release();
        self.down.on_error(err);
    }
}

struct RefCountGuard<T: Clone + Send + 'static> {
    up: Arc<dyn Subscription>,
    state: Arc<Mutex<RefCountState<T>>>,
    released: AtomicBool,
}

impl<T: Clone + Send + 'static> Subscription for RefCountGuard<T> {
    fn request(&self, n: u64) {
        self.up.request(n);
    }

    fn cancel(&self) {
        self.up.cancel();
        if self.released.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut guard = self.state.lock().unwrap();
        guard.count = guard.count.saturating_sub(1);
        if guard.count == 0 {
            if let Some(hub) = guard.cycle.take() {
                drop(guard);
                hub.disconnect();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::range;
    use crate::testkit::TestSubscriber;

    /// Nothing flows before connect; everyone attached sees the whole run
    #[test]
    fn test_publish_connect() {
        let published = range(0, 3).publish();
        let a = TestSubscriber::unbounded();
        let b = TestSubscriber::unbounded();
        published.flow().subscribe(a.clone());
        published.flow().subscribe(b.clone());
        assert_eq!(a.item_count(), 0);
        published.connect();
        assert_eq!(a.items(), vec![0, 1, 2]);
        assert_eq!(b.items(), vec![0, 1, 2]);
    }

    /// auto_connect(k) starts the source at the k-th attach
    #[test]
    fn test_auto_connect() {
        let auto = range(0, 3).publish().auto_connect(2);
        let a = TestSubscriber::unbounded();
        auto.subscribe(a.clone());
        assert_eq!(a.item_count(), 0);
        let b = TestSubscriber::unbounded();
        auto.subscribe(b.clone());
        assert_eq!(a.items(), vec![0, 1, 2]);
        assert_eq!(b.items(), vec![0, 1, 2]);
    }

    /// ref_count connects on the first subscriber
    #[test]
    fn test_ref_count_connects() {
        let shared = range(0, 3).publish().ref_count();
        let a = TestSubscriber::unbounded();
        shared.subscribe(a.clone());
        assert_eq!(a.items(), vec![0, 1, 2]);
        assert_eq!(a.completion_count(), 1);
    }
}
