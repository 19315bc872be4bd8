//! Flow factories
//!
//! The cold entry points of the runtime: single-value, iterator-backed and
//! timed generators, the resource-scoped `using`, the deferred factory, and
//! the push-style [`create`] adapter with its overflow policies.

mod create;
#[cfg(feature = "futures")]
mod future;
mod iter;
mod timed;

use std::sync::{Arc, Mutex};

pub use create::{Backpressure, Emitter, create};
#[cfg(feature = "futures")]
pub use future::from_future;
pub use iter::{from_iter, range};
pub use timed::{interval, timer};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Publisher, Subscriber, Subscription};
use crate::flowctl::NoopSubscription;
use crate::flowctl::scalar::ScalarSubscription;

/// Emits one value, then completes.
pub fn just<T: Clone + Send + Sync + 'static>(value: T) -> Flow<T> {
    Flow::new(JustPublisher { value })
}

/// Completes immediately, without items.
pub fn empty<T: Send + 'static>() -> Flow<T> {
    Flow::new(EmptyPublisher)
}

/// Never signals anything after the subscription.
pub fn never<T: Send + 'static>() -> Flow<T> {
    Flow::new(NeverPublisher)
}

/// Errors immediately.
pub fn fail<T: Send + 'static>(err: FlowError) -> Flow<T> {
    Flow::new(FailPublisher { err })
}

/// Builds a fresh flow per subscriber, at attach time.
pub fn defer<T: Send + 'static>(
    factory: impl Fn() -> Flow<T> + Send + Sync + 'static,
) -> Flow<T> {
    Flow::new(DeferPublisher {
        factory: Box::new(factory),
    })
}

/// Scopes a resource to one subscription: acquired at attach, released
/// exactly once at terminal or cancel, whichever comes first.
pub fn using<T, R>(
    acquire: impl Fn() -> R + Send + Sync + 'static,
    source_for: impl Fn(&R) -> Flow<T> + Send + Sync + 'static,
    release: impl Fn(R) + Send + Sync + 'static,
) -> Flow<T>
where
    T: Send + 'static,
    R: Send + 'static,
{
    Flow::new(UsingPublisher {
        acquire: Box::new(acquire),
        source_for: Box::new(source_for),
        release: Arc::new(release),
    })
}

struct JustPublisher<T: Clone + Send + Sync + 'static> {
    value: T,
}

impl<T: Clone + Send + Sync + 'static> Publisher<T> for JustPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let scalar = Arc::new(ScalarSubscription::new(subscriber.clone()));
        subscriber.on_subscribe(Link::Fused(scalar.clone()));
        scalar.complete_with(self.value.clone());
    }
}

struct EmptyPublisher;

impl<T: Send + 'static> Publisher<T> for EmptyPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
        subscriber.on_complete();
    }
}

struct NeverPublisher;

impl<T: Send + 'static> Publisher<T> for NeverPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
    }
}

struct FailPublisher {
    err: FlowError,
}

impl<T: Send + 'static> Publisher<T> for FailPublisher {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        subscriber.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
        subscriber.on_error(self.err.clone());
    }
}

struct DeferPublisher<T: Send + 'static> {
    factory: Box<dyn Fn() -> Flow<T> + Send + Sync>,
}

impl<T: Send + 'static> Publisher<T> for DeferPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        (self.factory)().subscribe(subscriber);
    }
}

struct UsingPublisher<T: Send + 'static, R: Send + 'static> {
    acquire: Box<dyn Fn() -> R + Send + Sync>,
    source_for: Box<dyn Fn(&R) -> Flow<T> + Send + Sync>,
    release: Arc<dyn Fn(R) + Send + Sync>,
}

impl<T: Send + 'static, R: Send + 'static> Publisher<T> for UsingPublisher<T, R> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let resource = (self.acquire)();
        let flow = (self.source_for)(&resource);
        flow.subscribe(Arc::new(UsingSubscriber {
            down: subscriber,
            resource: Arc::new(Mutex::new(Some(resource))),
            release: self.release.clone(),
        }));
    }
}

struct UsingSubscriber<T: Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    resource: Arc<Mutex<Option<R>>>,
    release: Arc<dyn Fn(R) + Send + Sync>,
}

impl<T: Send + 'static, R: Send + 'static> UsingSubscriber<T, R> {
    fn dispose(resource: &Mutex<Option<R>>, release: &(dyn Fn(R) + Send + Sync)) {
        if let Some(r) = resource.lock().unwrap().take() {
            release(r);
        }
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for UsingSubscriber<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        let up = link.into_subscription();
        let resource = self.resource.clone();
        let release = self.release.clone();
        self.down.on_subscribe(Link::Direct(Arc::new(UsingSubscription {
            up,
            resource,
            release,
        })));
    }

    fn on_next(&self, item: T) {
        self.down.on_next(item);
    }

    fn on_complete(&self) {
        Self::dispose(&self.resource, &*self.release);
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        Self::dispose(&self.resource, &*self.release);
        self.down.on_error(err);
    }
}

struct UsingSubscription<R: Send + 'static> {
    up: Arc<dyn Subscription>,
    resource: Arc<Mutex<Option<R>>>,
    release: Arc<dyn Fn(R) + Send + Sync>,
}

impl<R: Send + 'static> Subscription for UsingSubscription<R> {
    fn request(&self, n: u64) {
        self.up.request(n);
    }

    fn cancel(&self) {
        self.up.cancel();
        if let Some(r) = self.resource.lock().unwrap().take() {
            (self.release)(r);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSubscriber;

    /// just emits its value once demand arrives, then completes
    #[test]
    fn test_just() {
        let probe = TestSubscriber::with_request(0);
        just(5i64).subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        probe.request(1);
        assert_eq!(probe.items(), vec![5]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// empty completes without items; never stays silent
    #[test]
    fn test_empty_and_never() {
        let probe = TestSubscriber::<i64>::unbounded();
        empty::<i64>().subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert_eq!(probe.completion_count(), 1);

        let quiet = TestSubscriber::<i64>::unbounded();
        never::<i64>().subscribe(quiet.clone());
        assert_eq!(quiet.subscription_count(), 1);
        assert!(!quiet.is_terminated());
    }

    /// fail errors immediately
    #[test]
    fn test_fail() {
        let probe = TestSubscriber::<i64>::unbounded();
        fail::<i64>(FlowError::message("boom")).subscribe(probe.clone());
        assert_eq!(probe.error_count(), 1);
        assert_eq!(probe.first_error().unwrap().to_string(), "boom");
    }

    /// defer builds a fresh flow per subscriber
    #[test]
    fn test_defer() {
        use std::sync::atomic::{AtomicI64, Ordering};
        let counter = Arc::new(AtomicI64::new(0));
        let c = counter.clone();
        let flow = defer(move || just(c.fetch_add(1, Ordering::SeqCst)));
        let a = TestSubscriber::unbounded();
        let b = TestSubscriber::unbounded();
        flow.subscribe(a.clone());
        flow.subscribe(b.clone());
        assert_eq!(a.items(), vec![0]);
        assert_eq!(b.items(), vec![1]);
    }

    /// using releases the resource exactly once, at terminal
    #[test]
    fn test_using_releases() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let released = Arc::new(AtomicUsize::new(0));
        let r = released.clone();
        let flow = using(
            || 3i64,
            |seed| just(*seed),
            move |_| {
                r.fetch_add(1, Ordering::SeqCst);
            },
        );
        let probe = TestSubscriber::unbounded();
        flow.subscribe(probe.clone());
        assert_eq!(probe.items(), vec![3]);
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
