use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Link, Subscriber};

enum Signal<T> {
    Next(T),
    Complete,
    Error(FlowError),
}

struct SerializeState<T> {
    emitting: bool,
    backlog: VecDeque<Signal<T>>,
    done: bool,
}

/// Wraps a subscriber so concurrent `on_next`/`on_complete`/`on_error`
/// calls come out strictly one at a time: the caller that finds the wrapper
/// idle becomes the emitter and also plays out whatever the others parked
/// in the backlog meanwhile.
pub struct SerializedSubscriber<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    state: Mutex<SerializeState<T>>,
}

impl<T: Send + 'static> SerializedSubscriber<T> {
    pub fn new(down: Arc<dyn Subscriber<T>>) -> Self {
        Self {
            down,
            state: Mutex::new(SerializeState {
                emitting: false,
                backlog: VecDeque::new(),
                done: false,
            }),
        }
    }

    fn dispatch(&self, signal: Signal<T>) {
        let mut first = {
            let mut state = self.state.lock().unwrap();
            if state.done {
                if let Signal::Error(e) = signal {
                    crate::hooks::on_undeliverable(e);
                }
                return;
            }
            if matches!(signal, Signal::Complete | Signal::Error(_)) {
                state.done = true;
            }
            if state.emitting {
                state.backlog.push_back(signal);
                return;
            }
            state.emitting = true;
            signal
        };
        // Emitter loop: play our own signal, then whatever queued up behind
        // it, never holding the lock across a downstream call.
        loop {
            match first {
                Signal::Next(v) => self.down.on_next(v),
                Signal::Complete => {
                    self.down.on_complete();
                    return;
                }
                Signal::Error(e) => {
                    self.down.on_error(e);
                    return;
                }
            }
            let mut state = self.state.lock().unwrap();
            match state.backlog.pop_front() {
                Some(next) => first = next,
                None => {
                    state.emitting = false;
                    return;
                }
            }
        }
    }
}

impl<T: Send + 'static> Subscriber<T> for SerializedSubscriber<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.down.on_subscribe(link);
    }

    fn on_next(&self, item: T) {
        self.dispatch(Signal::Next(item));
    }

    fn on_complete(&self) {
        self.dispatch(Signal::Complete);
    }

    fn on_error(&self, err: FlowError) {
        self.dispatch(Signal::Error(err));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::TestSubscriber;
    use std::sync::Barrier;

    /// Hammering from several threads still yields one-at-a-time delivery
    /// with the terminal last
    #[test]
    fn test_concurrent_serialization() {
        let probe = TestSubscriber::unbounded();
        let serialized = Arc::new(SerializedSubscriber::new(
            probe.clone() as Arc<dyn Subscriber<i64>>,
        ));
        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let s = serialized.clone();
                let b = barrier.clone();
                std::thread::spawn(move || {
                    b.wait();
                    for i in 0..250 {
                        s.on_next(t * 1000 + i);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        serialized.on_complete();
        assert_eq!(probe.item_count(), 1000);
        assert_eq!(probe.completion_count(), 1);
    }

    /// Nothing is delivered after the terminal
    #[test]
    fn test_done_swallows() {
        let probe = TestSubscriber::unbounded();
        let serialized = SerializedSubscriber::new(probe.clone() as Arc<dyn Subscriber<i64>>);
        serialized.on_next(1);
        serialized.on_complete();
        serialized.on_next(2);
        serialized.on_complete();
        assert_eq!(probe.items(), vec![1i64]);
        assert_eq!(probe.completion_count(), 1);
    }
}
