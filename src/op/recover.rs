//! Error recovery and resubscription: the terminal-once invariant is kept
//! by letting the replacement subscription supersede the dead one through
//! the demand arbiter.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Subscriber};
use crate::flowctl::NoopSubscription;
use crate::flowctl::scalar::ScalarSubscription;
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;

impl<T: Send + 'static> Flow<T> {
    /// On error, switches to the flow built by `handler`; the replacement
    /// inherits the outstanding demand. A second error (from the
    /// replacement) is terminal.
    pub fn on_error_resume_next(
        &self,
        handler: impl Fn(&FlowError) -> Flow<T> + Send + Sync + 'static,
    ) -> Flow<T> {
        let source = self.clone();
        let handler = Arc::new(handler);
        Flow::new(AdapterPublisher::new(move |down| {
            let arbiter = Arc::new(SubscriptionSlot::new());
            down.on_subscribe(Link::Direct(Arc::new(ArbiterSubscription {
                arbiter: arbiter.clone(),
            })));
            source.subscribe(Arc::new(ResumePrimary {
                down,
                arbiter,
                handler: handler.clone(),
            }));
        }))
    }

    /// On error, emits one final item built from the error, then completes.
    pub fn on_error_return(
        &self,
        f: impl Fn(&FlowError) -> T + Send + Sync + 'static,
    ) -> Flow<T> {
        self.on_error_resume_next(move |err| once_value(f(err)))
    }

    /// Swallows an error into a completion.
    pub fn on_error_complete(&self) -> Flow<T> {
        self.on_error_resume_next(|_| crate::source::empty())
    }

    /// Resubscribes upstream on error, up to `times` retries.
    pub fn retry(&self, times: u64) -> Flow<T> {
        self.retry_if(move |attempt, _| attempt <= times)
    }

    /// Resubscribes upstream on error while the predicate approves; it
    /// receives the 1-based attempt count and the error.
    pub fn retry_if(
        &self,
        predicate: impl Fn(u64, &FlowError) -> bool + Send + Sync + 'static,
    ) -> Flow<T> {
        let source = self.clone();
        let predicate = Arc::new(predicate);
        Flow::new(AdapterPublisher::new(move |down| {
            let state = Arc::new(RedoState {
                source: source.clone(),
                down,
                arbiter: Arc::new(SubscriptionSlot::new()),
                wip: AtomicU32::new(0),
                rounds: AtomicU64::new(0),
            });
            state
                .down
                .on_subscribe(Link::Direct(Arc::new(ArbiterSubscription {
                    arbiter: state.arbiter.clone(),
                })));
            let predicate = predicate.clone();
            RedoState::launch(
                state,
                Arc::new(move |outcome, attempt| match outcome {
                    Err(err) => {
                        if predicate(attempt, err) {
                            Redo::Again
                        } else {
                            Redo::Stop
                        }
                    }
                    Ok(()) => Redo::Stop,
                }),
            );
        }))
    }

    /// Replays the source `times` passes in total (`repeat(1)` is the
    /// identity, `repeat(0)` is empty).
    pub fn repeat(&self, times: u64) -> Flow<T> {
        if times == 0 {
            return crate::source::empty();
        }
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let state = Arc::new(RedoState {
                source: source.clone(),
                down,
                arbiter: Arc::new(SubscriptionSlot::new()),
                wip: AtomicU32::new(0),
                rounds: AtomicU64::new(0),
            });
            state
                .down
                .on_subscribe(Link::Direct(Arc::new(ArbiterSubscription {
                    arbiter: state.arbiter.clone(),
                })));
            RedoState::launch(
                state,
                Arc::new(move |outcome, attempt| match outcome {
                    Ok(()) if attempt < times => Redo::Again,
                    _ => Redo::Stop,
                }),
            );
        }))
    }

    /// Switches to `other` when upstream completes without a single item.
    pub fn switch_if_empty(&self, other: Flow<T>) -> Flow<T> {
        let source = self.clone();
        Flow::new(AdapterPublisher::new(move |down| {
            let arbiter = Arc::new(SubscriptionSlot::new());
            down.on_subscribe(Link::Direct(Arc::new(ArbiterSubscription {
                arbiter: arbiter.clone(),
            })));
            source.subscribe(Arc::new(SwitchEmptyPrimary {
                down,
                arbiter,
                other: other.clone(),
                non_empty: AtomicBool::new(false),
            }));
        }))
    }

    /// Emits `value` when upstream completes without a single item.
    pub fn default_if_empty(&self, value: T) -> Flow<T>
    where
        T: Clone + Sync,
    {
        self.switch_if_empty(crate::source::just(value))
    }
}

/// One-shot publisher over an owned value (no `Clone` needed); built per
/// recovery occurrence, so the single-attach limit never bites.
fn once_value<T: Send + 'static>(value: T) -> Flow<T> {
    let cell = Mutex::new(Some(value));
    Flow::new(AdapterPublisher::new(move |down| {
        match cell.lock().unwrap().take() {
            Some(v) => {
                let scalar = Arc::new(ScalarSubscription::new(down.clone()));
                down.on_subscribe(Link::Fused(scalar.clone()));
                scalar.complete_with(v);
            }
            None => {
                down.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
                down.on_error(FlowError::AlreadySubscribed);
            }
        }
    }))
}

/// Downstream handle over a shared demand arbiter.
struct ArbiterSubscription {
    arbiter: Arc<SubscriptionSlot>,
}

impl crate::flow::Subscription for ArbiterSubscription {
    fn request(&self, n: u64) {
        self.arbiter.request(n);
    }

    fn cancel(&self) {
        self.arbiter.cancel();
    }
}

struct ResumePrimary<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    arbiter: Arc<SubscriptionSlot>,
    handler: Arc<dyn Fn(&FlowError) -> Flow<T> + Send + Sync>,
}

impl<T: Send + 'static> Subscriber<T> for ResumePrimary<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.arbiter.replace(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if !self.arbiter.is_cancelled() {
            self.down.on_next(item);
            self.arbiter.produced(1);
        }
    }

    fn on_complete(&self) {
        self.arbiter.clear();
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        if self.arbiter.is_cancelled() {
            crate::hooks::on_undeliverable(err);
            return;
        }
        let fallback = (self.handler)(&err);
        fallback.subscribe(Arc::new(TailRelay {
            down: self.down.clone(),
            arbiter: self.arbiter.clone(),
        }));
    }
}

/// Terminal-stage relay: forwards everything, inherits demand.
struct TailRelay<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    arbiter: Arc<SubscriptionSlot>,
}

impl<T: Send + 'static> Subscriber<T> for TailRelay<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.arbiter.replace(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if !self.arbiter.is_cancelled() {
            self.down.on_next(item);
            self.arbiter.produced(1);
        }
    }

    fn on_complete(&self) {
        self.arbiter.clear();
        self.down.on_complete();
    }

    fn on_error(&self, err: FlowError) {
        self.arbiter.clear();
        self.down.on_error(err);
    }
}

enum Redo {
    Again,
    Stop,
}

/// Shared machinery of `retry`/`repeat`: a trampolined resubscription loop
/// so synchronous failures do not recurse.
struct RedoState<T: Send + 'static> {
    source: Flow<T>,
    down: Arc<dyn Subscriber<T>>,
    arbiter: Arc<SubscriptionSlot>,
    wip: AtomicU32,
    rounds: AtomicU64,
}

type RedoDecider = Arc<dyn Fn(Result<(), &FlowError>, u64) -> Redo + Send + Sync>;

impl<T: Send + 'static> RedoState<T> {
    fn launch(state: Arc<Self>, decider: RedoDecider) {
        Self::resubscribe(&state, &decider);
    }

    fn resubscribe(state: &Arc<Self>, decider: &RedoDecider) {
        if state.wip.fetch_add(1, Ordering::AcqRel) != 0 {
            return;
        }
        loop {
            if state.arbiter.is_cancelled() {
                return;
            }
            state.source.subscribe(Arc::new(RedoSubscriber {
                state: state.clone(),
                decider: decider.clone(),
            }));
            if state.wip.fetch_sub(1, Ordering::AcqRel) == 1 {
                return;
            }
        }
    }
}

struct RedoSubscriber<T: Send + 'static> {
    state: Arc<RedoState<T>>,
    decider: RedoDecider,
}

impl<T: Send + 'static> Subscriber<T> for RedoSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.state.arbiter.replace(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if !self.state.arbiter.is_cancelled() {
            self.state.down.on_next(item);
            self.state.arbiter.produced(1);
        }
    }

    fn on_complete(&self) {
        let round = self.state.rounds.fetch_add(1, Ordering::AcqRel) + 1;
        match (self.decider)(Ok(()), round) {
            Redo::Again => RedoState::resubscribe(&self.state, &self.decider),
            Redo::Stop => {
                self.state.arbiter.clear();
                self.state.down.on_complete();
            }
        }
    }

    fn on_error(&self, err: FlowError) {
        let round = self.state.rounds.fetch_add(1, Ordering::AcqRel) + 1;
        match (self.decider)(Err(&err), round) {
            Redo::Again => RedoState::resubscribe(&self.state, &self.decider),
            Redo::Stop => {
                self.state.arbiter.clear();
                self.state.down.on_error(err);
            }
        }
    }
}

struct SwitchEmptyPrimary<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    arbiter: Arc<SubscriptionSlot>,
    other: Flow<T>,
    non_empty: AtomicBool,
}

impl<T: Send + 'static> Subscriber<T> for SwitchEmptyPrimary<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.arbiter.replace(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        self.non_empty.store(true, Ordering::Release);
        if !self.arbiter.is_cancelled() {
            self.down.on_next(item);
            self.arbiter.produced(1);
        }
    }

    fn on_complete(&self) {
        if self.non_empty.load(Ordering::Acquire) {
            self.arbiter.clear();
            self.down.on_complete();
        } else {
            self.other.subscribe(Arc::new(TailRelay {
                down: self.down.clone(),
                arbiter: self.arbiter.clone(),
            }));
        }
    }

    fn on_error(&self, err: FlowError) {
        self.arbiter.clear();
        self.down.on_error(err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{empty, fail, from_iter, range};
    use crate::testkit::TestSubscriber;

    /// on_error_return turns the error into one last item
    #[test]
    fn test_on_error_return() {
        let probe = TestSubscriber::unbounded();
        range(0, 2)
            .concat_with_error()
            .on_error_return(|_| 99)
            .subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 99]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// on_error_complete swallows the error
    #[test]
    fn test_on_error_complete() {
        let probe = TestSubscriber::unbounded();
        fail::<i64>(FlowError::message("x"))
            .on_error_complete()
            .subscribe(probe.clone());
        assert_eq!(probe.item_count(), 0);
        assert_eq!(probe.completion_count(), 1);
        assert_eq!(probe.error_count(), 0);
    }

    /// The resume flow inherits the un-consumed demand
    #[test]
    fn test_resume_inherits_demand() {
        let probe = TestSubscriber::with_request(3);
        range(0, 2)
            .concat_with_error()
            .on_error_resume_next(|_| range(10, 10))
            .subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 10]);
        assert!(!probe.is_terminated());
    }

    /// retry gives the source another chance, then surfaces the error
    #[test]
    fn test_retry_exhausted() {
        use std::sync::atomic::AtomicUsize;
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let probe = TestSubscriber::unbounded();
        crate::source::defer(move || {
            a.fetch_add(1, Ordering::SeqCst);
            fail::<i64>(FlowError::message("flaky"))
        })
        .retry(2)
        .subscribe(probe.clone());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(probe.error_count(), 1);
    }

    /// A retry that eventually succeeds delivers the full sequence
    #[test]
    fn test_retry_succeeds() {
        use std::sync::atomic::AtomicUsize;
        let attempts = Arc::new(AtomicUsize::new(0));
        let a = attempts.clone();
        let probe = TestSubscriber::unbounded();
        crate::source::defer(move || {
            if a.fetch_add(1, Ordering::SeqCst) < 2 {
                fail::<i64>(FlowError::message("flaky"))
            } else {
                range(0, 3)
            }
        })
        .retry(5)
        .subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// repeat replays the source the requested number of passes
    #[test]
    fn test_repeat() {
        let probe = TestSubscriber::unbounded();
        range(0, 2).repeat(3).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 0, 1, 0, 1]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// switch_if_empty leaves a non-empty source alone
    #[test]
    fn test_switch_if_empty() {
        let probe = TestSubscriber::unbounded();
        empty::<i64>()
            .switch_if_empty(range(5, 2))
            .subscribe(probe.clone());
        assert_eq!(probe.items(), vec![5, 6]);

        let probe = TestSubscriber::unbounded();
        range(0, 2).switch_if_empty(range(5, 2)).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1]);
    }

    /// default_if_empty supplies the default only on empty upstreams
    #[test]
    fn test_default_if_empty() {
        let probe = TestSubscriber::unbounded();
        empty::<i64>().default_if_empty(7).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![7]);

        let probe = TestSubscriber::unbounded();
        from_iter(vec![1i64]).default_if_empty(7).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![1]);
    }

    impl Flow<i64> {
        /// Test helper: the source followed by a failure.
        fn concat_with_error(&self) -> Flow<i64> {
            crate::op::concat(vec![self.clone(), fail(FlowError::message("boom"))])
        }
    }
}
