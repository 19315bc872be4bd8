use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::ptr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::FlowError;

/// Bounded lock-free SPSC ring.
///
/// - **Producer** writes to `slots[tail & mask]`, then increments `tail`
/// - **Consumer** reads from `slots[head & mask]`, then increments `head`
/// - **Full**: `tail - head >= capacity`; `offer` fails, never blocks
/// - **Empty**: `tail == head`; `poll` returns `None`
///
/// | Operation | Memory Ordering | Purpose |
/// |-----------|-----------------|---------|
/// | Read own index | `Relaxed` | Only one side modifies it |
/// | Read other's index | `Acquire` | See their writes to the slots |
/// | Write own index | `Release` | Make slot writes visible |
///
/// Indices are cache-padded so producer and consumer do not false-share.
///
/// The ring doubles as the staging queue of fused sources: `mark_done` is
/// published after the last `offer`, so a consumer that loads the done flag
/// *before* a `poll → None` has observed a definitive terminal.
pub(crate) struct RingQueue<T> {
    slots: Box<[UnsafeCell<MaybeUninit<T>>]>,
    mask: usize,
    /// Consumer's cursor - only modified by the consumer, read by the producer
    head: CachePadded<AtomicUsize>,
    /// Producer's cursor - only modified by the producer, read by the consumer
    tail: CachePadded<AtomicUsize>,
    /// Terminal-after-last-item marker
    done: AtomicBool,
    failure: Mutex<Option<FlowError>>,
}

impl<T> RingQueue<T> {
    /// Builds a ring with at least `capacity` slots, rounded up to a power
    /// of two (minimum 2 so the index mask stays meaningful).
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        let slots = (0..cap)
            .map(|_| UnsafeCell::new(MaybeUninit::uninit()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            mask: cap - 1,
            head: CachePadded::new(AtomicUsize::new(0)),
            tail: CachePadded::new(AtomicUsize::new(0)),
            done: AtomicBool::new(false),
            failure: Mutex::new(None),
        }
    }

    #[inline]
    pub(crate) fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Producer pushes a value. Fails when the consumer is a lap behind.
    pub(crate) fn offer(&self, value: T) -> Result<(), T> {
        // Single producer: the only one controlling the tail
        let tail = self.tail.load(Ordering::Relaxed);
        // acquire-load: observe the reads performed by the consumer via its
        // release-store, so the slot we are about to reuse is truly free
        let head = self.head.load(Ordering::Acquire);

        if tail.wrapping_sub(head) >= self.slots.len() {
            return Err(value);
        }

        let i = tail & self.mask;
        // Safety: the capacity check above guarantees this slot was consumed
        // (or never written); every poll moves the value out, so overwriting
        // without a drop cannot leak.
        unsafe { ptr::write((*self.slots[i].get()).as_mut_ptr(), value) };

        // release-store: publish the slot write to the consumer
        self.tail.store(tail.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer takes the next value, if one is ready.
    pub(crate) fn poll(&self) -> Option<T> {
        // Single consumer: the only one controlling the head
        let head = self.head.load(Ordering::Relaxed);
        // acquire-load: observe the producer's slot writes
        let tail = self.tail.load(Ordering::Acquire);

        if tail == head {
            return None;
        }

        let i = head & self.mask;
        // Safety: head < tail, so the producer published this slot
        let value = unsafe { ptr::read((*self.slots[i].get()).as_ptr()) };

        // release-store: hand the slot back to the producer
        self.head.store(head.wrapping_add(1), Ordering::Release);
        Some(value)
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        tail == head
    }

    /// Consumer-side discard of everything staged.
    pub(crate) fn clear(&self) {
        while self.poll().is_some() {}
    }

    /// Producer marks the terminal; call after the last `offer`.
    pub(crate) fn mark_done(&self) {
        self.done.store(true, Ordering::Release);
    }

    /// Producer records a failure, then marks the terminal.
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

// Safe: the SPSC protocol above confines each slot to one side at a time.
unsafe impl<T: Send> Send for RingQueue<T> {}
unsafe impl<T: Send> Sync for RingQueue<T> {}

// Unconsumed items are dropped with the queue.
impl<T> Drop for RingQueue<T> {
    fn drop(&mut self) {
        // Safe via `get_mut`-style exclusive access: &mut self guarantees no
        // concurrent producer or consumer, and the Arc drop that got us here
        // synchronized with all release-stores.
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Relaxed);
        let count = tail.wrapping_sub(head);
        for s in 0..count {
            let i = head.wrapping_add(s) & self.mask;
            // Safe: these slots were written by the producer and never read
            unsafe { ptr::drop_in_place((*self.slots[i].get()).as_mut_ptr()) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;

    /// Capacity is rounded up to the next power of two
    #[test]
    fn test_capacity_rounding() {
        assert_eq!(RingQueue::<i32>::with_capacity(5).capacity(), 8);
        assert_eq!(RingQueue::<i32>::with_capacity(8).capacity(), 8);
        assert_eq!(RingQueue::<i32>::with_capacity(0).capacity(), 2);
    }

    /// Offer fails when the ring is full, without blocking
    #[test]
    fn test_full() {
        let q = RingQueue::with_capacity(4);
        for i in 0..4 {
            q.offer(i).unwrap();
        }
        assert_eq!(q.offer(99).unwrap_err(), 99);
        assert_eq!(q.poll(), Some(0));
        q.offer(99).unwrap();
    }

    /// FIFO order across a wrap-around
    #[test]
    fn test_fifo_wrap() {
        let q = RingQueue::with_capacity(2);
        for lap in 0..10 {
            q.offer(lap * 2).unwrap();
            q.offer(lap * 2 + 1).unwrap();
            assert_eq!(q.poll(), Some(lap * 2));
            assert_eq!(q.poll(), Some(lap * 2 + 1));
        }
        assert!(q.is_empty());
    }

    /// Done marker is observable only after the staged items
    #[test]
    fn test_done_after_items() {
        let q = RingQueue::with_capacity(4);
        q.offer(1).unwrap();
        q.mark_done();
        assert!(q.is_done());
        assert_eq!(q.poll(), Some(1));
        assert_eq!(q.poll(), None);
    }

    /// Cross-thread hand-off delivers every item exactly once
    #[test]
    fn test_cross_thread() {
        let q = Arc::new(RingQueue::with_capacity(8));
        let producer = q.clone();
        let handle = std::thread::spawn(move || {
            for i in 0..1000u64 {
                let mut v = i;
                loop {
                    match producer.offer(v) {
                        Ok(()) => break,
                        Err(back) => {
                            v = back;
                            std::hint::spin_loop();
                        }
                    }
                }
            }
            producer.mark_done();
        });

        let mut seen = Vec::new();
        loop {
            let done = q.is_done();
            match q.poll() {
                Some(v) => seen.push(v),
                None if done => break,
                None => std::hint::spin_loop(),
            }
        }
        handle.join().unwrap();
        assert_eq!(seen, (0..1000u64).collect::<Vec<_>>());
    }

    #[derive(Debug)]
    struct DropCounter(Arc<AtomicUsize>);
    impl Drop for DropCounter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Items never polled are dropped with the queue (no leak)
    #[test]
    fn test_drop_unread_items() {
        let drops = Arc::new(AtomicUsize::new(0));
        {
            let q = RingQueue::with_capacity(4);
            q.offer(DropCounter(drops.clone())).unwrap();
            q.offer(DropCounter(drops.clone())).unwrap();
            let _ = q.poll();
        }
        assert_eq!(drops.load(Ordering::SeqCst), 2);
    }
}
