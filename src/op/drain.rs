//! Work-in-progress gate for queue-drain loops.
//!
//! Every asynchronous-boundary operator serializes its emissions through the
//! same discipline: callers of `on_next`/`on_complete`/`on_error`/`request`
//! funnel into the drain; whoever transitions the work-in-progress counter
//! 0→1 owns the loop, everyone else has merely marked work as missed and
//! returns. The owner keeps looping until it can retire every increment it
//! observed, which guarantees that demand posted concurrently with the
//! drain's last pass is noticed by somebody.

use std::sync::atomic::{AtomicU32, Ordering};

/// The 0→1-owns-it work counter of the queue-drain pattern.
///
/// ```text
/// caller:  if gate.enter() { loop { ..drain..; if gate.leave(missed) == 0 { break } } }
/// ```
pub(crate) struct DrainGate {
    wip: AtomicU32,
}

impl Default for DrainGate {
    fn default() -> Self {
        Self::new()
    }
}

impl DrainGate {
    pub(crate) fn new() -> Self {
        Self {
            wip: AtomicU32::new(0),
        }
    }

    /// Registers intent to drain. True when the caller took ownership.
    #[inline]
    pub(crate) fn enter(&self) -> bool {
        // AcqRel: the owner must see queue writes made by the callers whose
        // increments it will later retire.
        self.wip.fetch_add(1, Ordering::AcqRel) == 0
    }

    /// Retires `seen` increments; returns the still-pending count. A
    /// non-zero return means more work arrived mid-pass and the owner must
    /// loop again.
    #[inline]
    pub(crate) fn leave(&self, seen: u32) -> u32 {
        self.wip.fetch_sub(seen, Ordering::AcqRel) - seen
    }
}
