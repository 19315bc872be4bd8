//! Deferred single-value subscription.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{FusedQueue, FusionMode, Subscriber, Subscription, WakeHandle};

const NO_REQUEST_NO_VALUE: u8 = 0;
const NO_REQUEST_HAS_VALUE: u8 = 1;
const HAS_REQUEST_NO_VALUE: u8 = 2;
const TERMINATED: u8 = 3;
const CANCELLED: u8 = 4;

/// Emits at most one value, once both the value and a positive request have
/// arrived, then completes. The state machine behind `just`, the reductions
/// and the future adapter.
///
/// Offers `Async` fusion: a fused consumer is woken when the value (or a
/// terminal) becomes available and takes it via `poll`.
pub struct ScalarSubscription<T: Send + 'static> {
    state: AtomicU8,
    value: Mutex<Option<T>>,
    down: Mutex<Option<Arc<dyn Subscriber<T>>>>,
    fused: AtomicBool,
    done: AtomicBool,
    failure: Mutex<Option<FlowError>>,
    wake: Mutex<Option<WakeHandle>>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
}

impl<T: Send + 'static> ScalarSubscription<T> {
    pub fn new(down: Arc<dyn Subscriber<T>>) -> Self {
        Self {
            state: AtomicU8::new(NO_REQUEST_NO_VALUE),
            value: Mutex::new(None),
            down: Mutex::new(Some(down)),
            fused: AtomicBool::new(false),
            done: AtomicBool::new(false),
            failure: Mutex::new(None),
            wake: Mutex::new(None),
            upstream: Mutex::new(None),
        }
    }

    /// Ties an upstream subscription to this scalar so a downstream cancel
    /// reaches the source being reduced.
    pub fn hold_upstream(&self, up: Arc<dyn Subscription>) {
        if self.is_cancelled() {
            up.cancel();
        } else {
            *self.upstream.lock().unwrap() = Some(up);
        }
    }

    fn take_down(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.down.lock().unwrap().take()
    }

    fn peek_down(&self) -> Option<Arc<dyn Subscriber<T>>> {
        self.down.lock().unwrap().clone()
    }

    fn wake_consumer(&self) {
        let wake = self.wake.lock().unwrap().clone();
        if let Some(w) = wake {
            w();
        }
    }

    /// Supplies the final value. Emits right away if demand already arrived.
    pub fn complete_with(&self, mut value: T) {
        if self.fused.load(Ordering::Acquire) {
            *self.value.lock().unwrap() = Some(value);
            // Queue contents before the done flag; the consumer reads the
            // flag first, so poll → None after done is a real terminal.
            self.done.store(true, Ordering::Release);
            // The cycle with the fused consumer breaks here; emission runs
            // through poll, not through the subscriber.
            self.take_down();
            self.wake_consumer();
            return;
        }
        loop {
            match self.state.load(Ordering::Acquire) {
                NO_REQUEST_NO_VALUE => {
                    *self.value.lock().unwrap() = Some(value);
                    match self.state.compare_exchange(
                        NO_REQUEST_NO_VALUE,
                        NO_REQUEST_HAS_VALUE,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    ) {
                        Ok(_) => return,
                        Err(_) => {
                            // Lost a race with request or cancel; reclaim the
                            // value and retry from the observed state.
                            let reclaimed = self.value.lock().unwrap().take();
                            match reclaimed {
                                Some(v) => {
                                    value = v;
                                    continue;
                                }
                                None => return,
                            }
                        }
                    }
                }
                HAS_REQUEST_NO_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            HAS_REQUEST_NO_VALUE,
                            TERMINATED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        if let Some(down) = self.take_down() {
                            down.on_next(value);
                            down.on_complete();
                        }
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    /// Terminal without a value.
    pub fn complete_empty(&self) {
        if self.fused.load(Ordering::Acquire) {
            self.done.store(true, Ordering::Release);
            self.take_down();
            self.wake_consumer();
            return;
        }
        let prev = self.state.swap(TERMINATED, Ordering::AcqRel);
        if prev != TERMINATED && prev != CANCELLED {
            if let Some(down) = self.take_down() {
                down.on_complete();
            }
        }
    }

    pub fn error(&self, err: FlowError) {
        if self.fused.load(Ordering::Acquire) {
            *self.failure.lock().unwrap() = Some(err);
            self.done.store(true, Ordering::Release);
            self.take_down();
            self.wake_consumer();
            return;
        }
        let prev = self.state.swap(TERMINATED, Ordering::AcqRel);
        if prev != TERMINATED && prev != CANCELLED {
            if let Some(down) = self.take_down() {
                down.on_error(err);
            }
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::Acquire) == CANCELLED
    }
}

impl<T: Send + 'static> Subscription for ScalarSubscription<T> {
    fn request(&self, n: u64) {
        if n == 0 {
            let down = self.peek_down();
            if let Some(down) = down {
                self.state.store(TERMINATED, Ordering::Release);
                down.on_error(FlowError::ZeroRequest);
            }
            return;
        }
        if self.fused.load(Ordering::Acquire) {
            return;
        }
        loop {
            match self.state.load(Ordering::Acquire) {
                NO_REQUEST_NO_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            NO_REQUEST_NO_VALUE,
                            HAS_REQUEST_NO_VALUE,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        return;
                    }
                }
                NO_REQUEST_HAS_VALUE => {
                    if self
                        .state
                        .compare_exchange(
                            NO_REQUEST_HAS_VALUE,
                            TERMINATED,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        )
                        .is_ok()
                    {
                        let value = self.value.lock().unwrap().take();
                        if let (Some(v), Some(down)) = (value, self.take_down()) {
                            down.on_next(v);
                            down.on_complete();
                        }
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn cancel(&self) {
        let prev = self.state.swap(CANCELLED, Ordering::AcqRel);
        if prev != CANCELLED {
            self.value.lock().unwrap().take();
            self.take_down();
            if let Some(up) = self.upstream.lock().unwrap().take() {
                up.cancel();
            }
        }
    }
}

impl<T: Send + 'static> FusedQueue<T> for ScalarSubscription<T> {
    fn enable(&self, requested: FusionMode, wake: WakeHandle) -> FusionMode {
        if requested == FusionMode::Async {
            *self.wake.lock().unwrap() = Some(wake);
            self.fused.store(true, Ordering::Release);
            FusionMode::Async
        } else {
            FusionMode::None
        }
    }

    fn poll(&self) -> Result<Option<T>, FlowError> {
        if let Some(err) = self.failure.lock().unwrap().take() {
            return Err(err);
        }
        Ok(self.value.lock().unwrap().take())
    }

    fn is_empty(&self) -> bool {
        self.value.lock().unwrap().is_none()
    }

    fn clear(&self) {
        self.value.lock().unwrap().take();
    }

    fn is_done(&self) -> bool {
        self.done.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::Link;
    use std::sync::atomic::AtomicU64;

    #[derive(Default)]
    struct Sink {
        items: Mutex<Vec<i64>>,
        completed: AtomicBool,
        nexts: AtomicU64,
    }

    impl Subscriber<i64> for Sink {
        fn on_subscribe(&self, _link: Link<i64>) {}

        fn on_next(&self, item: i64) {
            self.items.lock().unwrap().push(item);
            self.nexts.fetch_add(1, Ordering::SeqCst);
        }

        fn on_complete(&self) {
            self.completed.store(true, Ordering::SeqCst);
        }

        fn on_error(&self, _err: FlowError) {}
    }

    /// Value arriving before demand is held until the first request
    #[test]
    fn test_value_waits_for_demand() {
        let sink = Arc::new(Sink::default());
        let scalar = Arc::new(ScalarSubscription::new(sink.clone() as Arc<dyn Subscriber<i64>>));
        scalar.complete_with(42);
        assert_eq!(sink.nexts.load(Ordering::SeqCst), 0);
        scalar.request(1);
        assert_eq!(*sink.items.lock().unwrap(), vec![42]);
        assert!(sink.completed.load(Ordering::SeqCst));
    }

    /// Demand arriving before the value triggers emission at completion
    #[test]
    fn test_demand_waits_for_value() {
        let sink = Arc::new(Sink::default());
        let scalar = Arc::new(ScalarSubscription::new(sink.clone() as Arc<dyn Subscriber<i64>>));
        scalar.request(1);
        scalar.complete_with(7);
        assert_eq!(*sink.items.lock().unwrap(), vec![7]);
    }

    /// Cancel before demand suppresses the emission
    #[test]
    fn test_cancel_suppresses() {
        let sink = Arc::new(Sink::default());
        let scalar = Arc::new(ScalarSubscription::new(sink.clone() as Arc<dyn Subscriber<i64>>));
        scalar.complete_with(1);
        scalar.cancel();
        scalar.request(1);
        assert_eq!(sink.nexts.load(Ordering::SeqCst), 0);
    }
}
