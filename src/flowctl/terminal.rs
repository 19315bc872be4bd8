//! Once-only terminal latch.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

use crate::error::FlowError;

const EMPTY: u8 = 0;
const COMPLETED: u8 = 1;
const ERRORED: u8 = 2;

/// Once-only cell holding either *completed* or *error(e)*.
///
/// Producers set the queue contents first and the latch second; drain loops
/// read the latch only after observing an empty queue, which makes the pair
/// an atomic "terminate and publish" primitive.
///
/// State transitions take a mutex (the terminal path is cold); reads are a
/// single acquire load.
pub struct TerminalLatch {
    state: AtomicU8,
    error: Mutex<Option<FlowError>>,
}

impl Default for TerminalLatch {
    fn default() -> Self {
        Self::new()
    }
}

impl TerminalLatch {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(EMPTY),
            error: Mutex::new(None),
        }
    }

    /// Latches completion. Returns false if a terminal was already set.
    pub fn try_complete(&self) -> bool {
        let guard = self.error.lock().unwrap();
        if self.state.load(Ordering::Relaxed) != EMPTY {
            return false;
        }
        drop(guard);
        // Release: pairs with the acquire in `get`, publishing any queue
        // writes the producer made before terminating.
        self.state.store(COMPLETED, Ordering::Release);
        true
    }

    /// Latches an error. Returns false (the error is the caller's to route)
    /// if a terminal was already set.
    pub fn try_error(&self, err: FlowError) -> bool {
        let mut guard = self.error.lock().unwrap();
        if self.state.load(Ordering::Relaxed) != EMPTY {
            return false;
        }
        *guard = Some(err);
        drop(guard);
        self.state.store(ERRORED, Ordering::Release);
        true
    }

    #[inline]
    pub fn is_terminated(&self) -> bool {
        self.state.load(Ordering::Acquire) != EMPTY
    }

    /// Reads the latched terminal, if any. Errors are cloned so the latch
    /// stays readable by racing observers.
    pub fn get(&self) -> Option<Result<(), FlowError>> {
        match self.state.load(Ordering::Acquire) {
            COMPLETED => Some(Ok(())),
            ERRORED => {
                let guard = self.error.lock().unwrap();
                Some(Err(guard.clone().expect("errored latch holds an error")))
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Only the first terminal wins
    #[test]
    fn test_once_only() {
        let latch = TerminalLatch::new();
        assert!(latch.try_complete());
        assert!(!latch.try_error(FlowError::Overflow));
        assert!(matches!(latch.get(), Some(Ok(()))));
    }

    /// An error terminal is observable repeatedly
    #[test]
    fn test_error_readable() {
        let latch = TerminalLatch::new();
        assert!(latch.try_error(FlowError::Overflow));
        assert!(matches!(latch.get(), Some(Err(FlowError::Overflow))));
        assert!(matches!(latch.get(), Some(Err(FlowError::Overflow))));
    }
}
