//! Once-only subscription slot and demand arbiter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::flow::Subscription;
use crate::flowctl::request::{UNBOUNDED, saturating_add};

/// Atomic holder for the upstream subscription of an operator adapter.
///
/// Rules:
/// - the first `set` wins; later sets immediately cancel their argument
/// - `cancel` is idempotent, sticky, and cancels any current subscription
/// - requests issued before a subscription arrives accumulate and are
///   forwarded on the first `set`
/// - `replace` swaps in a successor subscription (recovery and concat
///   operators) and forwards the *outstanding* demand, i.e. requested minus
///   produced, to it
///
/// The reference swap runs under a short critical section; the cancelled
/// fast-path check is a single atomic load. Upstream calls are always made
/// outside the lock, so a synchronous upstream that reenters (emits during
/// `request`) cannot deadlock.
pub struct SubscriptionSlot {
    inner: Mutex<SlotInner>,
    cancelled: AtomicBool,
}

struct SlotInner {
    current: Option<Arc<dyn Subscription>>,
    /// Requested-but-not-yet-produced demand, `UNBOUNDED`-sticky.
    outstanding: u64,
}

impl Default for SubscriptionSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionSlot {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(SlotInner {
                current: None,
                outstanding: 0,
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    /// First-set-wins install. Returns false (and cancels `subscription`) if
    /// the slot was already set or cancelled.
    pub fn set(&self, subscription: Arc<dyn Subscription>) -> bool {
        let deferred;
        {
            let mut guard = self.inner.lock().unwrap();
            if self.cancelled.load(Ordering::Acquire) {
                drop(guard);
                subscription.cancel();
                return false;
            }
            if guard.current.is_some() {
                drop(guard);
                subscription.cancel();
                log::warn!("subscription slot set twice; extra subscription cancelled");
                return false;
            }
            guard.current = Some(subscription.clone());
            deferred = guard.outstanding;
        }
        if deferred > 0 {
            subscription.request(deferred);
        }
        true
    }

    /// Swaps in a successor subscription without cancelling the previous one
    /// (which has already terminated) and forwards the outstanding demand.
    pub fn replace(&self, subscription: Arc<dyn Subscription>) {
        let deferred;
        {
            let mut guard = self.inner.lock().unwrap();
            if self.cancelled.load(Ordering::Acquire) {
                drop(guard);
                subscription.cancel();
                return;
            }
            guard.current = Some(subscription.clone());
            deferred = guard.outstanding;
        }
        if deferred > 0 {
            subscription.request(deferred);
        }
    }

    /// Adds demand and forwards it to the current subscription, if any.
    pub fn request(&self, n: u64) {
        if n == 0 || self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let target;
        {
            let mut guard = self.inner.lock().unwrap();
            guard.outstanding = saturating_add(guard.outstanding, n);
            target = guard.current.clone();
        }
        if let Some(s) = target {
            s.request(n);
        }
    }

    /// Records `n` delivered items so a later `replace` only forwards the
    /// remainder.
    pub fn produced(&self, n: u64) {
        let mut guard = self.inner.lock().unwrap();
        if guard.outstanding != UNBOUNDED {
            debug_assert!(
                guard.outstanding >= n,
                "produced {n} items against a demand of {}",
                guard.outstanding
            );
            guard.outstanding = guard.outstanding.saturating_sub(n);
        }
    }

    /// Cancels and removes the current subscription while keeping the slot
    /// live and its outstanding demand intact, so a successor (timeout
    /// fallback, recovery flow) can inherit the demand via `replace`.
    pub fn cancel_current(&self) {
        let target = self.inner.lock().unwrap().current.take();
        if let Some(s) = target {
            s.cancel();
        }
    }

    /// Releases the held subscription without cancelling it. Subscribers call
    /// this on terminal so the downstream↔upstream reference cycle breaks
    /// once the chain is dead.
    pub fn clear(&self) {
        self.inner.lock().unwrap().current = None;
    }

    /// Sticky cancel; cancels the current subscription and every later one.
    pub fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let target = self.inner.lock().unwrap().current.take();
        if let Some(s) = target {
            s.cancel();
        }
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct Probe {
        requested: AtomicU64,
        cancelled: AtomicBool,
    }

    impl Subscription for Probe {
        fn request(&self, n: u64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancelled.store(true, Ordering::SeqCst);
        }
    }

    /// Demand accumulated before the subscription arrives is forwarded on set
    #[test]
    fn test_deferred_demand() {
        let slot = SubscriptionSlot::new();
        slot.request(3);
        slot.request(4);
        let probe = Arc::new(Probe::default());
        assert!(slot.set(probe.clone()));
        assert_eq!(probe.requested.load(Ordering::SeqCst), 7);
    }

    /// The second set loses and is cancelled
    #[test]
    fn test_second_set_cancelled() {
        let slot = SubscriptionSlot::new();
        let first = Arc::new(Probe::default());
        let second = Arc::new(Probe::default());
        assert!(slot.set(first));
        assert!(!slot.set(second.clone()));
        assert!(second.cancelled.load(Ordering::SeqCst));
    }

    /// A replacement subscription receives only the unproduced remainder
    #[test]
    fn test_replace_forwards_remainder() {
        let slot = SubscriptionSlot::new();
        let first = Arc::new(Probe::default());
        slot.set(first);
        slot.request(10);
        slot.produced(6);
        let second = Arc::new(Probe::default());
        slot.replace(second.clone());
        assert_eq!(second.requested.load(Ordering::SeqCst), 4);
    }

    /// Cancel is sticky: subscriptions set afterwards are cancelled
    #[test]
    fn test_cancel_sticky() {
        let slot = SubscriptionSlot::new();
        slot.cancel();
        slot.cancel();
        let late = Arc::new(Probe::default());
        assert!(!slot.set(late.clone()));
        assert!(late.cancelled.load(Ordering::SeqCst));
    }
}
