//! Merging coordinator: `flat_map` and `merge`.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::error::{ErrorBag, FlowError};
use crate::flow::{Flow, FusionMode, Link, Subscriber, Subscription};
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;
use crate::op::drain::DrainGate;
use crate::queue::RingQueue;

/// Runs all sources at once; items interleave in round-robin order over the
/// non-empty inner queues.
pub fn merge<T: Send + 'static>(sources: Vec<Flow<T>>) -> Flow<T> {
    crate::source::from_iter(SharedVec(Arc::new(sources))).flat_map(|f| f)
}

/// Clonable iterable over a shared source list (merge subscribes the same
/// flows once per downstream attach).
struct SharedVec<T: Send + 'static>(Arc<Vec<Flow<T>>>);

impl<T: Send + 'static> Clone for SharedVec<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T: Send + 'static> IntoIterator for SharedVec<T> {
    type Item = Flow<T>;
    type IntoIter = std::vec::IntoIter<Flow<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.as_ref().clone().into_iter()
    }
}

impl<T: Send + 'static> Flow<T> {
    /// Maps each item to an inner flow and merges all inner items, with
    /// unlimited concurrency and the default per-inner buffer.
    pub fn flat_map<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
    ) -> Flow<R> {
        self.flat_map_with(f, usize::MAX, crate::hooks::buffer_size(), false)
    }

    /// Full-control [`flat_map`](Flow::flat_map): at most `max_concurrency`
    /// live inner subscriptions, a bounded queue of `buffer_size` per inner,
    /// and optionally delayed errors (inners keep draining; errors are
    /// collected into a composite terminal).
    pub fn flat_map_with<R: Send + 'static>(
        &self,
        f: impl Fn(T) -> Flow<R> + Send + Sync + 'static,
        max_concurrency: usize,
        buffer_size: usize,
        delay_errors: bool,
    ) -> Flow<R> {
        let source = self.clone();
        let f = Arc::new(f);
        Flow::new(AdapterPublisher::new(move |down| {
            let coordinator = Arc::new(MergeCoordinator {
                down: down.clone(),
                mapper: f.clone(),
                max_concurrency: max_concurrency.max(1),
                buffer_size: buffer_size.max(1),
                limit: (buffer_size.max(1) - (buffer_size.max(1) >> 2)) as u64,
                delay_errors,
                requested: AtomicU64::new(0),
                gate: DrainGate::new(),
                cancelled: AtomicBool::new(false),
                outer_done: AtomicBool::new(false),
                delivered: AtomicBool::new(false),
                fatal: AtomicBool::new(false),
                errors: ErrorBag::default(),
                inners: Mutex::new(Vec::new()),
                outer: SubscriptionSlot::new(),
                round: AtomicUsize::new(0),
                me: Mutex::new(Weak::new()),
            });
            *coordinator.me.lock().unwrap() = Arc::downgrade(&coordinator);
            down.on_subscribe(Link::Direct(Arc::new(MergeSubscription {
                parent: coordinator.clone(),
            })));
            source.subscribe(coordinator);
        }))
    }
}

struct MergeCoordinator<T: Send + 'static, R: Send + 'static> {
    down: Arc<dyn Subscriber<R>>,
    mapper: Arc<dyn Fn(T) -> Flow<R> + Send + Sync>,
    max_concurrency: usize,
    buffer_size: usize,
    limit: u64,
    delay_errors: bool,
    requested: AtomicU64,
    gate: DrainGate,
    cancelled: AtomicBool,
    outer_done: AtomicBool,
    delivered: AtomicBool,
    /// Immediate-error mode: an inner failed, tear everything down.
    fatal: AtomicBool,
    errors: ErrorBag,
    /// Live inner subscribers. Mutex is bookkeeping only, never held while
    /// emitting.
    inners: Mutex<Vec<Arc<MergeInner<R>>>>,
    outer: SubscriptionSlot,
    round: AtomicUsize,
    me: Mutex<Weak<Self>>,
}

struct MergeInner<R: Send + 'static> {
    queue: RingQueue<R>,
    done: AtomicBool,
    /// Inner granted Sync fusion: the drain polls its generator directly.
    sync: AtomicBool,
    link: Mutex<Option<Link<R>>>,
    consumed: AtomicU64,
}

impl<R: Send + 'static> MergeInner<R> {
    fn upstream(&self) -> Option<Link<R>> {
        self.link.lock().unwrap().clone()
    }

    fn detach(&self) {
        self.link.lock().unwrap().take();
    }
}

impl<T: Send + 'static, R: Send + 'static> MergeCoordinator<T, R> {
    fn arc(&self) -> Option<Arc<Self>> {
        self.me.lock().unwrap().upgrade()
    }

    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            self.drain_pass();
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }

    fn teardown(&self) {
        self.outer.cancel();
        let inners = std::mem::take(&mut *self.inners.lock().unwrap());
        for inner in inners {
            if let Some(link) = inner.upstream() {
                link.cancel();
            }
            inner.detach();
            inner.queue.clear();
        }
    }

    /// Removes inners that are done with nothing left staged; each removal
    /// frees one concurrency slot, so the outer is replenished by one.
    fn sweep_finished(&self) {
        let mut removed = 0u64;
        {
            let mut inners = self.inners.lock().unwrap();
            inners.retain(|inner| {
                let gone = inner.done.load(Ordering::Acquire)
                    && !inner.sync.load(Ordering::Acquire)
                    && inner.queue.is_empty();
                if gone {
                    inner.detach();
                    removed += 1;
                }
                !gone
            });
        }
        if removed > 0 && !self.outer_done.load(Ordering::Acquire) {
            self.outer.request(removed);
        }
    }

    fn poll_inner(&self, inner: &Arc<MergeInner<R>>) -> Result<Option<R>, FlowError> {
        if inner.sync.load(Ordering::Acquire) {
            match inner.upstream() {
                Some(link) => match link.poll() {
                    Ok(Some(v)) => Ok(Some(v)),
                    Ok(None) => {
                        inner.done.store(true, Ordering::Release);
                        inner.sync.store(false, Ordering::Release);
                        Ok(None)
                    }
                    Err(e) => Err(e),
                },
                None => Ok(None),
            }
        } else {
            Ok(inner.queue.poll())
        }
    }

    fn replenish_inner(&self, inner: &Arc<MergeInner<R>>) {
        if inner.sync.load(Ordering::Acquire) {
            return;
        }
        let consumed = inner.consumed.load(Ordering::Relaxed) + 1;
        if consumed >= self.limit {
            inner.consumed.store(0, Ordering::Relaxed);
            if let Some(link) = inner.upstream() {
                link.request(consumed);
            }
        } else {
            inner.consumed.store(consumed, Ordering::Relaxed);
        }
    }

    fn drain_pass(&self) {
        if self.cancelled.load(Ordering::Acquire) {
            self.teardown();
            return;
        }
        if !self.delay_errors && self.fatal.load(Ordering::Acquire) {
            self.teardown();
            if !self.delivered.swap(true, Ordering::AcqRel) {
                let err = self.errors.take().unwrap_or(FlowError::Overflow);
                self.down.on_error(err);
            }
            return;
        }
        self.sweep_finished();

        // Fair round-robin: one item per non-empty inner per round.
        loop {
            if self.cancelled.load(Ordering::Acquire) {
                self.teardown();
                return;
            }
            if self.requested.load(Ordering::Acquire) == 0 {
                break;
            }
            let snapshot = self.inners.lock().unwrap().clone();
            if snapshot.is_empty() {
                break;
            }
            let n = snapshot.len();
            let start = self.round.fetch_add(1, Ordering::Relaxed) % n;
            let mut progressed = false;
            for i in 0..n {
                if self.requested.load(Ordering::Acquire) == 0 {
                    break;
                }
                let inner = &snapshot[(start + i) % n];
                match self.poll_inner(inner) {
                    Ok(Some(v)) => {
                        self.down.on_next(v);
                        post_produced(&self.requested, 1);
                        self.replenish_inner(inner);
                        progressed = true;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        inner.done.store(true, Ordering::Release);
                        inner.sync.store(false, Ordering::Release);
                        inner.detach();
                        self.errors.push(e);
                        if !self.delay_errors {
                            self.fatal.store(true, Ordering::Release);
                            self.teardown();
                            if !self.delivered.swap(true, Ordering::AcqRel) {
                                let err = self.errors.take().unwrap_or(FlowError::Overflow);
                                self.down.on_error(err);
                            }
                            return;
                        }
                        progressed = true;
                    }
                }
            }
            self.sweep_finished();
            if !progressed {
                break;
            }
        }

        // Terminal: outer finished and no inner is live or staged.
        if self.outer_done.load(Ordering::Acquire)
            && self.inners.lock().unwrap().is_empty()
            && !self.delivered.swap(true, Ordering::AcqRel)
        {
            match self.errors.take() {
                Some(err) => self.down.on_error(err),
                None => self.down.on_complete(),
            }
        }
    }

    fn inner_errored(&self, err: FlowError) {
        self.errors.push(err);
        if !self.delay_errors {
            self.fatal.store(true, Ordering::Release);
        }
        self.drain();
    }
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<T> for MergeCoordinator<T, R> {
    fn on_subscribe(&self, link: Link<T>) {
        if self.outer.set(link.into_subscription()) {
            let upfront = if self.max_concurrency == usize::MAX {
                UNBOUNDED
            } else {
                self.max_concurrency as u64
            };
            self.outer.request(upfront);
        }
    }

    fn on_next(&self, item: T) {
        if self.cancelled.load(Ordering::Acquire) || self.delivered.load(Ordering::Acquire) {
            return;
        }
        let flow = (self.mapper)(item);
        let inner = Arc::new(MergeInner {
            queue: RingQueue::with_capacity(self.buffer_size),
            done: AtomicBool::new(false),
            sync: AtomicBool::new(false),
            link: Mutex::new(None),
            consumed: AtomicU64::new(0),
        });
        self.inners.lock().unwrap().push(inner.clone());
        if let Some(parent) = self.arc() {
            flow.subscribe(Arc::new(MergeInnerSubscriber { parent, inner }));
        }
    }

    fn on_complete(&self) {
        self.outer_done.store(true, Ordering::Release);
        self.outer.clear();
        self.drain();
    }

    fn on_error(&self, err: FlowError) {
        self.outer_done.store(true, Ordering::Release);
        self.outer.clear();
        self.inner_errored(err);
    }
}

struct MergeInnerSubscriber<T: Send + 'static, R: Send + 'static> {
    parent: Arc<MergeCoordinator<T, R>>,
    inner: Arc<MergeInner<R>>,
}

impl<T: Send + 'static, R: Send + 'static> Subscriber<R> for MergeInnerSubscriber<T, R> {
    fn on_subscribe(&self, link: Link<R>) {
        // Synchronous inners (just, from_iter) fuse and are polled directly
        // by the drain, skipping the per-item push entirely.
        let granted = link.try_fuse(FusionMode::Sync, Link::<R>::noop_wake());
        *self.inner.link.lock().unwrap() = Some(link.clone());
        if granted == FusionMode::Sync {
            self.inner.sync.store(true, Ordering::Release);
            self.parent.drain();
        } else {
            link.request(self.parent.buffer_size as u64);
        }
    }

    fn on_next(&self, item: R) {
        if self.inner.queue.offer(item).is_err() {
            // The inner ignored its request bound.
            if let Some(link) = self.inner.upstream() {
                link.cancel();
            }
            self.inner.done.store(true, Ordering::Release);
            self.parent.inner_errored(FlowError::Overflow);
            return;
        }
        self.parent.drain();
    }

    fn on_complete(&self) {
        self.inner.done.store(true, Ordering::Release);
        self.parent.drain();
    }

    fn on_error(&self, err: FlowError) {
        self.inner.done.store(true, Ordering::Release);
        self.inner.detach();
        self.parent.inner_errored(err);
    }
}

struct MergeSubscription<T: Send + 'static, R: Send + 'static> {
    parent: Arc<MergeCoordinator<T, R>>,
}

impl<T: Send + 'static, R: Send + 'static> Subscription for MergeSubscription<T, R> {
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        post_request(&self.parent.requested, n);
        self.parent.drain();
    }

    fn cancel(&self) {
        self.parent.cancelled.store(true, Ordering::Release);
        self.parent.drain();
    }
}
