//! Request accounting arithmetic.
//!
//! A request counter is a non-negative 64-bit accumulator; `u64::MAX` encodes
//! "unbounded" and is sticky under further additions. Item delivery
//! decrements unless the counter is unbounded.

use std::sync::atomic::{AtomicU64, Ordering};

/// A request of `UNBOUNDED` means "I will accept any number of items".
pub const UNBOUNDED: u64 = u64::MAX;

/// `min(current + n, UNBOUNDED)`.
#[inline]
pub fn saturating_add(current: u64, n: u64) -> u64 {
    current.saturating_add(n)
}

/// Atomically adds `n` to the counter, saturating at [`UNBOUNDED`]. Returns
/// the value observed *before* the addition, so a 0→n transition (the caller
/// owns the drain now) is distinguishable.
pub(crate) fn post_request(counter: &AtomicU64, n: u64) -> u64 {
    let mut cur = counter.load(Ordering::Relaxed);
    loop {
        if cur == UNBOUNDED {
            return UNBOUNDED;
        }
        let next = cur.saturating_add(n);
        // AcqRel: the requester's prior writes must be visible to the drain
        // that observes the new demand.
        match counter.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return cur,
            Err(actual) => cur = actual,
        }
    }
}

/// Atomically subtracts `n` delivered items from the counter, unless it is
/// unbounded. Returns the remaining demand. Consuming beneath zero is a bug
/// in the calling operator and fails loudly in debug builds.
pub(crate) fn post_produced(counter: &AtomicU64, n: u64) -> u64 {
    let mut cur = counter.load(Ordering::Relaxed);
    loop {
        if cur == UNBOUNDED {
            return UNBOUNDED;
        }
        debug_assert!(cur >= n, "produced {n} items against a demand of {cur}");
        let next = cur.saturating_sub(n);
        match counter.compare_exchange_weak(cur, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return next,
            Err(actual) => cur = actual,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Addition saturates at the unbounded sentinel
    #[test]
    fn test_saturation() {
        assert_eq!(saturating_add(UNBOUNDED - 1, 10), UNBOUNDED);
        assert_eq!(saturating_add(UNBOUNDED, 1), UNBOUNDED);
        assert_eq!(saturating_add(3, 4), 7);
    }

    /// Unbounded demand is sticky and never decremented
    #[test]
    fn test_unbounded_sticky() {
        let counter = AtomicU64::new(0);
        assert_eq!(post_request(&counter, UNBOUNDED), 0);
        assert_eq!(post_request(&counter, 5), UNBOUNDED);
        assert_eq!(post_produced(&counter, 100), UNBOUNDED);
        assert_eq!(counter.load(Ordering::Relaxed), UNBOUNDED);
    }

    /// Production decrements outstanding demand
    #[test]
    fn test_produced() {
        let counter = AtomicU64::new(0);
        post_request(&counter, 10);
        assert_eq!(post_produced(&counter, 4), 6);
        assert_eq!(post_produced(&counter, 6), 0);
    }
}
