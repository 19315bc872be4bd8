//! Core flow contract
//!
//! Data moves through a chain of *stages*. Each stage is a [`Publisher`]
//! composed from an upstream publisher plus operator state; attaching a
//! [`Subscriber`] builds the operator's adapter, which faces both ways at
//! once: subscriber *to* its upstream, subscription *from* its downstream.
//!
//!```text
//!  Publisher ──subscribe──▶ adapter ──subscribe──▶ Subscriber
//!                             │  ▲
//!              on_next ─────▶ │  │ ◀───── request(n) / cancel
//!```
//!
//! ## Signal protocol
//!
//! | Signal | Count | Rule |
//! |--------|-------|------|
//! | `on_subscribe` | exactly 1 | a second attach is rejected and cancelled |
//! | `on_next` | 0..n | never more than the outstanding requested amount |
//! | `on_complete` / `on_error` | at most 1 total | nothing is delivered after it |
//!
//! After `cancel` the subscriber must not observe further signals; a single
//! in-flight item may still land and is discarded.
//!
//! ## Fusion
//!
//! Adjacent stages at an asynchronous boundary may negotiate direct queue
//! access ([`FusedQueue`]), eliminating one level of per-item dispatch:
//!
//! - `Sync`: upstream is a cold generator; downstream polls it like a queue.
//! - `Async`: upstream pushes into its own queue and calls the wake handle
//!   installed at negotiation; downstream polls when woken.
//!
//! Producers publish queue state *before* the done flag, so a consumer must
//! read [`FusedQueue::is_done`] before polling: `poll → None` after an
//! observed done flag is a definitive terminal.

use std::sync::Arc;

use crate::error::FlowError;
use crate::flowctl::slot::SubscriptionSlot;

/// An immutable factory describing a stream shape. Its sole operation is to
/// attach a subscriber.
pub trait Publisher<T: Send + 'static>: Send + Sync {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>);
}

/// Consumer of a stream. Implementations manage their own interior state;
/// every method takes `&self` because adapters are shared across threads.
pub trait Subscriber<T: Send + 'static>: Send + Sync {
    fn on_subscribe(&self, link: Link<T>);
    fn on_next(&self, item: T);
    fn on_complete(&self);
    fn on_error(&self, err: FlowError);
}

/// The handle a subscriber holds toward its upstream.
pub trait Subscription: Send + Sync {
    /// Declares that up to `n` additional items are acceptable. Saturates at
    /// [`UNBOUNDED`](crate::flowctl::request::UNBOUNDED).
    fn request(&self, n: u64);
    /// Irrevocably detaches. Propagates upstream unconditionally.
    fn cancel(&self);
}

/// Negotiated direct-queue access mode between adjacent stages.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FusionMode {
    None,
    Sync,
    Async,
}

/// Callback installed by a fused consumer; an `Async` producer invokes it
/// when new items or the terminal become observable.
pub type WakeHandle = Arc<dyn Fn() + Send + Sync>;

/// A subscription that additionally exposes its staging queue to the
/// downstream stage.
pub trait FusedQueue<T: Send + 'static>: Subscription {
    /// Negotiates a fusion mode; returns the granted mode (possibly `None`).
    fn enable(&self, requested: FusionMode, wake: WakeHandle) -> FusionMode;
    /// Takes the next item. `Ok(None)` means empty (for `Sync`: exhausted).
    fn poll(&self) -> Result<Option<T>, FlowError>;
    fn is_empty(&self) -> bool;
    /// Discards staged items. Consumer side only.
    fn clear(&self);
    /// True once the terminal is observable. Read this *before* polling.
    fn is_done(&self) -> bool;
}

/// Handle delivered in `on_subscribe`: either a plain subscription or a
/// fusable one. The helpers delegate so operators rarely match on it.
pub enum Link<T: Send + 'static> {
    Direct(Arc<dyn Subscription>),
    Fused(Arc<dyn FusedQueue<T>>),
}

impl<T: Send + 'static> Clone for Link<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Direct(s) => Self::Direct(s.clone()),
            Self::Fused(q) => Self::Fused(q.clone()),
        }
    }
}

impl<T: Send + 'static> Link<T> {
    pub fn request(&self, n: u64) {
        match self {
            Self::Direct(s) => s.request(n),
            Self::Fused(q) => q.request(n),
        }
    }

    pub fn cancel(&self) {
        match self {
            Self::Direct(s) => s.cancel(),
            Self::Fused(q) => q.cancel(),
        }
    }

    /// Attempts fusion; plain subscriptions always answer `None`.
    pub fn try_fuse(&self, requested: FusionMode, wake: WakeHandle) -> FusionMode {
        match self {
            Self::Direct(_) => FusionMode::None,
            Self::Fused(q) => q.enable(requested, wake),
        }
    }

    /// Polls the fused queue. Only meaningful after a successful `try_fuse`.
    pub fn poll(&self) -> Result<Option<T>, FlowError> {
        match self {
            Self::Direct(_) => {
                debug_assert!(false, "poll on an unfused link");
                Ok(None)
            }
            Self::Fused(q) => q.poll(),
        }
    }

    pub fn is_done(&self) -> bool {
        match self {
            Self::Direct(_) => false,
            Self::Fused(q) => q.is_done(),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Direct(_) => true,
            Self::Fused(q) => q.is_empty(),
        }
    }

    pub fn clear(&self) {
        if let Self::Fused(q) = self {
            q.clear();
        }
    }

    /// Erases the fusion capability, leaving a plain subscription.
    pub fn into_subscription(self) -> Arc<dyn Subscription> {
        match self {
            Self::Direct(s) => s,
            Self::Fused(q) => Arc::new(FusedAsPlain(q)),
        }
    }

    /// A wake handle that does nothing; used by `Sync`-mode consumers.
    pub fn noop_wake() -> WakeHandle {
        Arc::new(|| {})
    }
}

/// Adapter dropping the queue capability of a fused subscription.
struct FusedAsPlain<T: Send + 'static>(Arc<dyn FusedQueue<T>>);

impl<T: Send + 'static> Subscription for FusedAsPlain<T> {
    fn request(&self, n: u64) {
        self.0.request(n);
    }

    fn cancel(&self) {
        self.0.cancel();
    }
}

/// Value-like handle to a publisher; cheap to clone, freely sharable, and
/// the carrier of the fluent operator surface.
pub struct Flow<T: Send + 'static> {
    inner: Arc<dyn Publisher<T>>,
}

impl<T: Send + 'static> Clone for Flow<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + 'static> Flow<T> {
    pub fn new(publisher: impl Publisher<T> + 'static) -> Self {
        Self {
            inner: Arc::new(publisher),
        }
    }

    pub fn from_arc(inner: Arc<dyn Publisher<T>>) -> Self {
        Self { inner }
    }

    /// Attaches a subscriber to this flow.
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.inner.subscribe(subscriber);
    }

    /// Subscribes with an item callback and unbounded demand.
    pub fn subscribe_fn(&self, next: impl Fn(T) + Send + Sync + 'static) -> Unsubscriber {
        self.subscribe_each(next, |err| log::error!("unhandled flow error: {err}"), || {})
    }

    /// Subscribes with item/error/complete callbacks and unbounded demand.
    pub fn subscribe_each(
        &self,
        next: impl Fn(T) + Send + Sync + 'static,
        error: impl Fn(FlowError) + Send + Sync + 'static,
        complete: impl Fn() + Send + Sync + 'static,
    ) -> Unsubscriber {
        let sub = Arc::new(LambdaSubscriber {
            next: Box::new(next),
            error: Box::new(error),
            complete: Box::new(complete),
            slot: SubscriptionSlot::new(),
        });
        let handle = Unsubscriber {
            slot: sub.clone() as Arc<dyn CancelOnly>,
        };
        self.subscribe(sub);
        handle
    }
}

impl<T: Send + 'static> Publisher<T> for Flow<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        self.inner.subscribe(subscriber);
    }
}

struct LambdaSubscriber<T: Send + 'static> {
    next: Box<dyn Fn(T) + Send + Sync>,
    error: Box<dyn Fn(FlowError) + Send + Sync>,
    complete: Box<dyn Fn() + Send + Sync>,
    slot: SubscriptionSlot,
}

impl<T: Send + 'static> Subscriber<T> for LambdaSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.slot.set(link.into_subscription()) {
            self.slot.request(crate::flowctl::request::UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if !self.slot.is_cancelled() {
            (self.next)(item);
        }
    }

    fn on_complete(&self) {
        self.slot.clear();
        (self.complete)();
    }

    fn on_error(&self, err: FlowError) {
        self.slot.clear();
        (self.error)(err);
    }
}

/// Detach handle returned by the callback-based subscribe helpers.
pub struct Unsubscriber {
    slot: Arc<dyn CancelOnly>,
}

impl Unsubscriber {
    pub fn cancel(&self) {
        self.slot.cancel_only();
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.cancelled_only()
    }
}

/// Object-safe view of the lambda subscriber's slot.
trait CancelOnly: Send + Sync {
    fn cancel_only(&self);
    fn cancelled_only(&self) -> bool;
}

impl<T: Send + 'static> CancelOnly for LambdaSubscriber<T> {
    fn cancel_only(&self) {
        self.slot.cancel();
    }

    fn cancelled_only(&self) -> bool {
        self.slot.is_cancelled()
    }
}
