use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::FlowError;

struct Node<T> {
    next: AtomicPtr<Node<T>>,
    /// `None` only for the stub node.
    value: Option<T>,
}

impl<T> Node<T> {
    fn alloc(value: Option<T>) -> *mut Self {
        Box::into_raw(Box::new(Self {
            next: AtomicPtr::new(ptr::null_mut()),
            value,
        }))
    }
}

/// Unbounded node-per-item SPSC queue (stub-node linked list).
///
/// `offer` swaps the tail and links the previous node, so it stays correct
/// even when the producer role is handed between threads over time (the
/// drain loops serialize producers externally, but the swap makes the queue
/// itself indifferent to it). `poll` is single-consumer: the caller must
/// guarantee only one thread polls at a time.
///
/// Carries the same done-marker decoration as the bounded ring.
pub(crate) struct LinkedQueue<T> {
    /// Consumer end: the current stub; its `next` holds the oldest value.
    head: CachePadded<AtomicPtr<Node<T>>>,
    /// Producer end: the most recently linked node.
    tail: CachePadded<AtomicPtr<Node<T>>>,
    done: AtomicBool,
    failure: Mutex<Option<FlowError>>,
}

impl<T> Default for LinkedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> LinkedQueue<T> {
    pub(crate) fn new() -> Self {
        let stub = Node::alloc(None);
        Self {
            head: CachePadded::new(AtomicPtr::new(stub)),
            tail: CachePadded::new(AtomicPtr::new(stub)),
            done: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    /// Producer appends a value. Never fails, allocates a node per item.
    pub(crate) fn offer(&self, value: T) {
        let node = Node::alloc(Some(value));
        // AcqRel swap: claim the tail position and synchronize with the
        // previous producer's writes to that node.
        let prev = self.tail.swap(node, Ordering::AcqRel);
        // release-store: publish the node (and its value) to the consumer
        unsafe { (*prev).next.store(node, Ordering::Release) };
    }

    /// Consumer takes the oldest value, if any.
    pub(crate) fn poll(&self) -> Option<T> {
        // Single consumer: the only one controlling the head
        let stub = self.head.load(Ordering::Relaxed);
        // acquire-load: observe the producer's writes to the next node
        let next = unsafe { (*stub).next.load(Ordering::Acquire) };
        if next.is_null() {
            return None;
        }
        // The old stub is ours to free; `next` becomes the new stub and its
        // value moves out.
        let value = unsafe { (*next).value.take() };
        self.head.store(next, Ordering::Relaxed);
        drop(unsafe { Box::from_raw(stub) });
        debug_assert!(value.is_some(), "non-stub node holds a value");
        value
    }

    pub(crate) fn is_empty(&self) -> bool {
        let stub = self.head.load(Ordering::Relaxed);
        unsafe { (*stub).next.load(Ordering::Acquire).is_null() }
    }

    /// Consumer-side discard of everything staged.
    pub(crate) fn clear(&self) {
        while self.poll().is_some() {}
    }

    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    pub(crate) fn fail(&self, err: FlowError) {
        *self.failure.lock().unwrap() = Some(err);
        self.done.store(true, Ordering::Release);
    }

    #[inline]
    pub(crate) fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }

    pub(crate) fn take_failure(&self) -> Option<FlowError> {
        self.failure.lock().unwrap().take()
    }
}

unsafe impl<T: Send> Send for LinkedQueue<T> {}
unsafe impl<T: Send> Sync for LinkedQueue<T> {}

impl<T> Drop for LinkedQueue<T> {
    fn drop(&mut self) {
        // Exclusive access: free the whole chain, values included.
        let mut cursor = self.head.load(Ordering::Relaxed);
        while !cursor.is_null() {
            let node = unsafe { Box::from_raw(cursor) };
            cursor = node.next.load(Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// FIFO order under interleaved offers and polls
    #[test]
    fn test_fifo() {
        let q = LinkedQueue::new();
        q.offer(1);
        q.offer(2);
        assert_eq!(q.poll(), Some(1));
        q.offer(3);
        assert_eq!(q.poll(), Some(2));
        assert_eq!(q.poll(), Some(3));
        assert_eq!(q.poll(), None);
        assert!(q.is_empty());
    }

    /// Cross-thread hand-off delivers every item in order
    #[test]
    fn test_cross_thread() {
        let q = Arc::new(LinkedQueue::new());
        let producer = q.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..10_000u64 {
                producer.offer(i);
            }
            producer.mark_done();
        });

        let mut expect = 0u64;
        loop {
            let done = q.is_done();
            match q.poll() {
                Some(v) => {
                    assert_eq!(v, expect);
                    expect += 1;
                }
                None if done => break,
                None => std::hint::spin_loop(),
            }
        }
        handle.join().unwrap();
        assert_eq!(expect, 10_000);
    }

    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Unconsumed nodes and their values are freed with the queue
    #[test]
    fn test_drop_unread_items() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let q = LinkedQueue::new();
            for _ in 0..3 {
                q.offer(DropCounter(drops.clone()));
            }
            let _ = q.poll();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 3);
    }
}
