//! Count-based segmentation: `buffer` (lists) and `window` (inner flows).

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::request::{UNBOUNDED, saturating_add};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;
use crate::process::UnicastProcessor;

impl<T: Send + 'static> Flow<T> {
    /// Collects items into non-overlapping `Vec`s of `count`.
    pub fn buffer(&self, count: usize) -> Flow<Vec<T>>
    where
        T: Clone,
    {
        self.buffer_skip(count, count)
    }

    /// Collects into `Vec`s of `count`, opening a new one every `skip`
    /// items: `skip < count` overlaps, `skip > count` leaves gaps.
    pub fn buffer_skip(&self, count: usize, skip: usize) -> Flow<Vec<T>>
    where
        T: Clone,
    {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let count = count.max(1);
            let skip = skip.max(1);
            let stage = Arc::new(BufferStage {
                down: down.clone(),
                count,
                skip,
                open: Mutex::new(VecDeque::new()),
                index: AtomicU64::new(0),
                first: AtomicBool::new(true),
                done: AtomicBool::new(false),
                up: SubscriptionSlot::new(),
            });
            down.on_subscribe(Link::Direct(Arc::new(BufferSubscription {
                stage: stage.clone(),
            })));
            source.subscribe(stage);
        }))
    }

    /// Segments the stream into consecutive inner flows of `count` items
    /// each. A request for `n` windows prefetches `n * count` items.
    pub fn window(&self, count: usize) -> Flow<Flow<T>> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let count = count.max(1);
            let stage = Arc::new(WindowStage {
                down: down.clone(),
                count: count as u64,
                filled: AtomicU64::new(0),
                current: Mutex::new(None),
                done: AtomicBool::new(false),
                up: SubscriptionSlot::new(),
            });
            down.on_subscribe(Link::Direct(Arc::new(WindowSubscription {
                stage: stage.clone(),
            })));
            source.subscribe(stage);
        }))
    }
}

struct BufferStage<T: Clone + Send + 'static> {
    down: Arc<dyn Subscriber<Vec<T>>>,
    count: usize,
    skip: usize,
    /// Buffers currently being filled, oldest first.
    open: Mutex<VecDeque<Vec<T>>>,
    index: AtomicU64,
    first: AtomicBool,
    done: AtomicBool,
    up: SubscriptionSlot,
}

impl<T: Clone + Send + 'static> Subscriber<T> for BufferStage<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.up.set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut open = self.open.lock().unwrap();
        let idx = self.index.fetch_add(1, Ordering::Relaxed);
        if idx % self.skip as u64 == 0 {
            open.push_back(Vec::with_capacity(self.count));
        }
        for buf in open.iter_mut() {
            buf.push(item.clone());
        }
        let full = open
            .front()
            .is_some_and(|front| front.len() == self.count);
        let emit = if full { open.pop_front() } else { None };
        drop(open);
        if let Some(buf) = emit {
            self.down.on_next(buf);
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.clear();
            // Partial buffers go out with the completion.
            let leftovers = std::mem::take(&mut *self.open.lock().unwrap());
            for buf in leftovers {
                if !buf.is_empty() {
                    self.down.on_next(buf);
                }
            }
            self.down.on_complete();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.clear();
            self.open.lock().unwrap().clear();
            self.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct BufferSubscription<T: Clone + Send + 'static> {
    stage: Arc<BufferStage<T>>,
}

impl<T: Clone + Send + 'static> Subscription for BufferSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        if n == UNBOUNDED {
            self.stage.up.request(UNBOUNDED);
            return;
        }
        // n buffers close after count + (n-1)*skip items; afterwards each
        // additional buffer costs skip more.
        let items = if self.stage.first.swap(false, Ordering::AcqRel) {
            saturating_add(
                self.stage.count as u64,
                (n - 1).saturating_mul(self.stage.skip as u64),
            )
        } else {
            n.saturating_mul(self.stage.skip as u64)
        };
        self.stage.up.request(items);
    }

    fn cancel(&self) {
        self.stage.done.store(true, Ordering::Release);
        self.stage.up.cancel();
    }
}

struct WindowStage<T: Send + 'static> {
    down: Arc<dyn Subscriber<Flow<T>>>,
    count: u64,
    filled: AtomicU64,
    current: Mutex<Option<Arc<UnicastProcessor<T>>>>,
    done: AtomicBool,
    up: SubscriptionSlot,
}

impl<T: Send + 'static> Subscriber<T> for WindowStage<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.up.set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let mut current = self.current.lock().unwrap();
        let window = match current.as_ref() {
            Some(w) => w.clone(),
            None => {
                let w = UnicastProcessor::new();
                *current = Some(w.clone());
                self.filled.store(0, Ordering::Relaxed);
                drop(current);
                self.down.on_next(w.flow());
                current = self.current.lock().unwrap();
                w
            }
        };
        window.offer(item);
        if self.filled.fetch_add(1, Ordering::Relaxed) + 1 == self.count {
            window.complete();
            current.take();
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.clear();
            if let Some(window) = self.current.lock().unwrap().take() {
                window.complete();
            }
            self.down.on_complete();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.clear();
            if let Some(window) = self.current.lock().unwrap().take() {
                window.error(err.clone());
            }
            self.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct WindowSubscription<T: Send + 'static> {
    stage: Arc<WindowStage<T>>,
}

impl<T: Send + 'static> Subscription for WindowSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        self.stage.up.request(n.saturating_mul(self.stage.count));
    }

    fn cancel(&self) {
        self.stage.done.store(true, Ordering::Release);
        self.stage.up.cancel();
    }
}
