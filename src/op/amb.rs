//! First-signal-wins racing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::error::FlowError;
use crate::flow::{Flow, Link, Publisher, Subscriber, Subscription};
use crate::flowctl::NoopSubscription;
use crate::flowctl::slot::SubscriptionSlot;

const UNDECIDED: usize = usize::MAX;

/// Subscribes to every source; the first to signal anything wins and the
/// rest are cancelled. From then on the coordinator is a pass-through.
pub fn amb<T: Send + 'static>(sources: Vec<Flow<T>>) -> Flow<T> {
    Flow::new(AmbPublisher { sources })
}

struct AmbPublisher<T: Send + 'static> {
    sources: Vec<Flow<T>>,
}

impl<T: Send + 'static> Publisher<T> for AmbPublisher<T> {
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        if self.sources.is_empty() {
            subscriber.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
            subscriber.on_complete();
            return;
        }
        let race = Arc::new(AmbRace {
            down: subscriber.clone(),
            winner: AtomicUsize::new(UNDECIDED),
            slots: (0..self.sources.len())
                .map(|_| SubscriptionSlot::new())
                .collect(),
        });
        subscriber.on_subscribe(Link::Direct(Arc::new(AmbSubscription {
            race: race.clone(),
        })));
        for (i, source) in self.sources.iter().enumerate() {
            if race.winner.load(Ordering::Acquire) != UNDECIDED {
                // Someone already won synchronously; the rest never attach.
                break;
            }
            source.subscribe(Arc::new(AmbContender {
                race: race.clone(),
                index: i,
            }));
        }
    }
}

struct AmbRace<T: Send + 'static> {
    down: Arc<dyn Subscriber<T>>,
    winner: AtomicUsize,
    slots: Vec<SubscriptionSlot>,
}

impl<T: Send + 'static> AmbRace<T> {
    /// True when `index` is (or just became) the winner.
    fn claim(&self, index: usize) -> bool {
        match self.winner.compare_exchange(
            UNDECIDED,
            index,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                for (i, slot) in self.slots.iter().enumerate() {
                    if i != index {
                        slot.cancel();
                    }
                }
                true
            }
            Err(current) => current == index,
        }
    }
}

struct AmbContender<T: Send + 'static> {
    race: Arc<AmbRace<T>>,
    index: usize,
}

impl<T: Send + 'static> Subscriber<T> for AmbContender<T> {
    fn on_subscribe(&self, link: Link<T>) {
        self.race.slots[self.index].set(link.into_subscription());
    }

    fn on_next(&self, item: T) {
        if self.race.claim(self.index) {
            self.race.down.on_next(item);
        }
    }

    fn on_complete(&self) {
        if self.race.claim(self.index) {
            self.race.slots[self.index].clear();
            self.race.down.on_complete();
        }
    }

    fn on_error(&self, err: FlowError) {
        if self.race.claim(self.index) {
            self.race.slots[self.index].clear();
            self.race.down.on_error(err);
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct AmbSubscription<T: Send + 'static> {
    race: Arc<AmbRace<T>>,
}

impl<T: Send + 'static> Subscription for AmbSubscription<T> {
    fn request(&self, n: u64) {
        let winner = self.race.winner.load(Ordering::Acquire);
        if winner != UNDECIDED {
            self.race.slots[winner].request(n);
        } else {
            // Nobody has spoken: arm everyone; losers get cancelled later.
            for slot in &self.race.slots {
                slot.request(n);
            }
        }
    }

    fn cancel(&self) {
        for slot in &self.race.slots {
            slot.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec;
    use crate::source::{fail, never, range, timer};
    use crate::testkit::TestSubscriber;
    use std::time::Duration;

    /// A synchronous source beats silent contenders
    #[test]
    fn test_amb_sync_winner() {
        let probe = TestSubscriber::unbounded();
        amb(vec![range(0, 3), never()]).subscribe(probe.clone());
        assert_eq!(probe.items(), vec![0, 1, 2]);
        assert_eq!(probe.completion_count(), 1);
    }

    /// The fastest timer wins the race
    #[test]
    fn test_amb_timer_race() {
        let probe = TestSubscriber::unbounded();
        amb(vec![
            timer(Duration::from_millis(200), exec::single()).map(|_| 1i64),
            timer(Duration::from_millis(5), exec::single()).map(|_| 2i64),
        ])
        .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(3)));
        assert_eq!(probe.items(), vec![2]);
    }

    /// An eager error wins like any other signal
    #[test]
    fn test_amb_error_wins() {
        let probe = TestSubscriber::unbounded();
        amb(vec![fail::<i64>(FlowError::message("first")), never()]).subscribe(probe.clone());
        assert_eq!(probe.error_count(), 1);
        assert_eq!(probe.item_count(), 0);
    }
}
