//! In-crate probe subscriber for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::error::FlowError;
use crate::flow::{Link, Subscriber};

/// Records every signal it receives and lets tests issue precise requests.
pub(crate) struct TestSubscriber<T: Send + 'static> {
    items: Mutex<Vec<T>>,
    errors: Mutex<Vec<FlowError>>,
    completions: AtomicUsize,
    subscriptions: AtomicUsize,
    link: Mutex<Option<Link<T>>>,
    initial_request: u64,
}

impl<T: Send + 'static> TestSubscriber<T> {
    /// A probe that requests everything upfront.
    pub(crate) fn unbounded() -> Arc<Self> {
        Self::with_request(crate::flowctl::request::UNBOUNDED)
    }

    /// A probe that requests exactly `n` at subscription time.
    pub(crate) fn with_request(n: u64) -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            completions: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            link: Mutex::new(None),
            initial_request: n,
        })
    }

    pub(crate) fn request(&self, n: u64) {
        let link = self.link.lock().unwrap().clone();
        if let Some(link) = link {
            link.request(n);
        }
    }

    pub(crate) fn cancel(&self) {
        let link = self.link.lock().unwrap().clone();
        if let Some(link) = link {
            link.cancel();
        }
    }

    pub(crate) fn item_count(&self) -> usize {
        self.items.lock().unwrap().len()
    }

    pub(crate) fn completion_count(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub(crate) fn error_count(&self) -> usize {
        self.errors.lock().unwrap().len()
    }

    pub(crate) fn subscription_count(&self) -> usize {
        self.subscriptions.load(Ordering::SeqCst)
    }

    pub(crate) fn first_error(&self) -> Option<FlowError> {
        self.errors.lock().unwrap().first().cloned()
    }

    pub(crate) fn is_terminated(&self) -> bool {
        self.completion_count() > 0 || self.error_count() > 0
    }

    /// Spins (with a sleep) until the probe saw a terminal or the timeout
    /// elapses. Returns whether a terminal arrived.
    pub(crate) fn await_terminal(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.is_terminated() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.is_terminated()
    }

    /// Waits until at least `n` items arrived or the timeout elapses.
    pub(crate) fn await_items(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if self.item_count() >= n {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.item_count() >= n
    }
}

impl<T: Clone + Send + 'static> TestSubscriber<T> {
    pub(crate) fn items(&self) -> Vec<T> {
        self.items.lock().unwrap().clone()
    }
}

impl<T: Send + 'static> Subscriber<T> for TestSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        *self.link.lock().unwrap() = Some(link.clone());
        if self.initial_request > 0 {
            link.request(self.initial_request);
        }
    }

    fn on_next(&self, item: T) {
        self.items.lock().unwrap().push(item);
    }

    fn on_complete(&self) {
        self.completions.fetch_add(1, Ordering::SeqCst);
        self.link.lock().unwrap().take();
    }

    fn on_error(&self, err: FlowError) {
        self.errors.lock().unwrap().push(err);
        self.link.lock().unwrap().take();
    }
}
