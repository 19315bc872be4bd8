//! Blocking bridges between flows and ordinary control flow.
//!
//! These are the only places the runtime ever blocks a thread: the consumer
//! parks until items (or the terminal) arrive. Never call them from inside
//! a subscriber callback — parking the emitting thread stalls the pipeline.

use std::sync::Arc;

use crossbeam_utils::sync::{Parker, Unparker};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Subscriber};
use crate::flowctl::slot::SubscriptionSlot;
use crate::flowctl::terminal::TerminalLatch;
use crate::queue::RingQueue;

impl<T: Send + 'static> Flow<T> {
    /// Bridges this flow into a pull iterator. Items are prefetched into a
    /// bounded queue; the iterator parks while it is empty and replenishes
    /// upstream in 75% steps. Dropping the iterator cancels the chain.
    pub fn blocking_iter(&self) -> BlockingIter<T> {
        let prefetch = crate::hooks::buffer_size();
        let parker = Parker::new();
        let bridge = Arc::new(BlockingBridge {
            queue: RingQueue::with_capacity(prefetch),
            latch: TerminalLatch::new(),
            up: SubscriptionSlot::new(),
            unparker: parker.unparker().clone(),
            prefetch: prefetch as u64,
        });
        self.subscribe(bridge.clone());
        BlockingIter {
            bridge,
            parker,
            consumed: 0,
            finished: false,
        }
    }

    /// Runs the flow to completion, collecting every item.
    pub fn blocking_collect(&self) -> Result<Vec<T>, FlowError> {
        let mut out = Vec::new();
        for item in self.blocking_iter() {
            out.push(item?);
        }
        Ok(out)
    }

    /// Waits for the first item, then cancels the rest of the stream.
    pub fn blocking_first(&self) -> Result<Option<T>, FlowError> {
        let mut iter = self.blocking_iter();
        match iter.next() {
            Some(Ok(v)) => {
                iter.bridge.up.cancel();
                Ok(Some(v))
            }
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }

    /// Runs the flow to completion and returns its final item.
    pub fn blocking_last(&self) -> Result<Option<T>, FlowError> {
        let mut last = None;
        for item in self.blocking_iter() {
            last = Some(item?);
        }
        Ok(last)
    }

    /// Runs the flow to completion, feeding each item to `next` on the
    /// calling thread.
    pub fn blocking_subscribe(&self, mut next: impl FnMut(T)) -> Result<(), FlowError> {
        for item in self.blocking_iter() {
            next(item?);
        }
        Ok(())
    }
}

struct BlockingBridge<T: Send + 'static> {
    queue: RingQueue<T>,
    latch: TerminalLatch,
    up: SubscriptionSlot,
    unparker: Unparker,
    prefetch: u64,
}

impl<T: Send + 'static> Subscriber<T> for BlockingBridge<T> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.up.set(link.into_subscription()) {
            self.up.request(self.prefetch);
        }
    }

    fn on_next(&self, item: T) {
        if self.queue.offer(item).is_err() {
            // More than the prefetch window in flight: protocol violation.
            self.up.cancel();
            let _ = self.latch.try_error(FlowError::Overflow);
        }
        self.unparker.unpark();
    }

    fn on_complete(&self) {
        self.up.clear();
        let _ = self.latch.try_complete();
        self.unparker.unpark();
    }

    fn on_error(&self, err: FlowError) {
        self.up.clear();
        if !self.latch.try_error(err) {
            log::debug!("blocking bridge: error after terminal suppressed");
        }
        self.unparker.unpark();
    }
}

/// Iterator face of a flow; see
/// [`blocking_iter`](crate::flow::Flow::blocking_iter).
pub struct BlockingIter<T: Send + 'static> {
    bridge: Arc<BlockingBridge<T>>,
    parker: Parker,
    consumed: u64,
    finished: bool,
}

impl<T: Send + 'static> Iterator for BlockingIter<T> {
    type Item = Result<T, FlowError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            // Terminal flag before the queue: the producer stages first,
            // latches second.
            let done = self.bridge.latch.is_terminated();
            match self.bridge.queue.poll() {
                Some(v) => {
                    self.consumed += 1;
                    let threshold = self.bridge.prefetch - (self.bridge.prefetch >> 2);
                    if self.consumed >= threshold {
                        self.bridge.up.request(self.consumed);
                        self.consumed = 0;
                    }
                    return Some(Ok(v));
                }
                None if done => {
                    self.finished = true;
                    return match self.bridge.latch.get() {
                        Some(Err(e)) => Some(Err(e)),
                        _ => None,
                    };
                }
                None => self.parker.park(),
            }
        }
    }
}

impl<T: Send + 'static> Drop for BlockingIter<T> {
    fn drop(&mut self) {
        self.bridge.up.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec;
    use crate::source::{fail, range};

    /// Law: range(a, n) collected is exactly [a, a+n)
    #[test]
    fn test_collect_range() {
        let items = range(3, 5).blocking_collect().unwrap();
        assert_eq!(items, vec![3, 4, 5, 6, 7]);
    }

    /// The iterator parks across an asynchronous boundary and still sees
    /// every item in order
    #[test]
    fn test_iter_across_threads() {
        let items: Vec<i64> = range(0, 300)
            .observe_on(exec::computation())
            .blocking_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(items, (0..300).collect::<Vec<_>>());
    }

    /// Errors surface through the iterator once, then it is exhausted
    #[test]
    fn test_iter_error() {
        let mut iter = fail::<i64>(FlowError::message("dead")).blocking_iter();
        assert!(matches!(iter.next(), Some(Err(_))));
        assert!(iter.next().is_none());
    }

    /// blocking_first cancels the remainder
    #[test]
    fn test_first() {
        assert_eq!(range(7, 100).blocking_first().unwrap(), Some(7));
        assert_eq!(crate::source::empty::<i64>().blocking_first().unwrap(), None);
    }

    /// blocking_last sees the whole stream out
    #[test]
    fn test_last() {
        assert_eq!(range(0, 10).blocking_last().unwrap(), Some(9));
    }
}
