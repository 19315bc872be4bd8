//! Keyed demultiplexing into per-group flows.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::error::FlowError;
use crate::flow::{Flow, Link, Subscriber, Subscription};
use crate::flowctl::request::{UNBOUNDED, post_produced, post_request};
use crate::flowctl::slot::SubscriptionSlot;
use crate::op::basic::AdapterPublisher;
use crate::op::drain::DrainGate;
use crate::process::UnicastProcessor;
use crate::queue::LinkedQueue;

/// One keyed partition of a grouped stream.
pub struct GroupedFlow<K, T: Send + 'static> {
    key: K,
    flow: Flow<T>,
}

impl<K, T: Send + 'static> GroupedFlow<K, T> {
    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn flow(&self) -> Flow<T> {
        self.flow.clone()
    }
}

impl<T: Send + 'static> Flow<T> {
    /// Splits the stream into one inner flow per key. Groups buffer
    /// without bound (a slow group never stalls its siblings); downstream
    /// demand gates only the stream of newly-opened groups. Cancelling a
    /// group drops its items; cancelling the outer flow cancels upstream.
    pub fn group_by<K>(
        &self,
        key_of: impl Fn(&T) -> K + Send + Sync + 'static,
    ) -> Flow<GroupedFlow<K, T>>
    where
        K: Eq + Hash + Clone + Send + 'static,
    {
        let source = self.clone();
        let key_of = Arc::new(key_of);
        Flow::new(AdapterPublisher::new(move |down| {
            let stage = Arc::new(GroupByStage {
                down: down.clone(),
                key_of: key_of.clone(),
                groups: Mutex::new(HashMap::new()),
                fresh: LinkedQueue::new(),
                requested: AtomicU64::new(0),
                gate: DrainGate::new(),
                done: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                up: SubscriptionSlot::new(),
            });
            down.on_subscribe(Link::Direct(Arc::new(GroupBySubscription {
                stage: stage.clone(),
            })));
            source.subscribe(stage);
        }))
    }
}

struct GroupByStage<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    down: Arc<dyn Subscriber<GroupedFlow<K, T>>>,
    key_of: Arc<dyn Fn(&T) -> K + Send + Sync>,
    groups: Mutex<HashMap<K, Arc<UnicastProcessor<T>>>>,
    /// Newly-opened groups waiting for downstream demand.
    fresh: LinkedQueue<GroupedFlow<K, T>>,
    requested: AtomicU64,
    gate: DrainGate,
    done: AtomicBool,
    cancelled: AtomicBool,
    up: SubscriptionSlot,
}

impl<K, T> GroupByStage<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    fn drain(&self) {
        if !self.gate.enter() {
            return;
        }
        let mut missed = 1;
        loop {
            'pass: loop {
                if self.cancelled.load(Ordering::Acquire) {
                    self.fresh.clear();
                    break 'pass;
                }
                let done = self.fresh.is_done();
                if self.requested.load(Ordering::Acquire) > 0 {
                    if let Some(group) = self.fresh.poll() {
                        self.down.on_next(group);
                        post_produced(&self.requested, 1);
                        continue 'pass;
                    }
                }
                if done && self.fresh.is_empty() && !self.cancelled.swap(true, Ordering::AcqRel) {
                    match self.fresh.take_failure() {
                        Some(err) => self.down.on_error(err),
                        None => self.down.on_complete(),
                    }
                }
                break 'pass;
            }
            missed = self.gate.leave(missed);
            if missed == 0 {
                return;
            }
        }
    }
}

impl<K, T> Subscriber<T> for GroupByStage<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    fn on_subscribe(&self, link: Link<T>) {
        if self.up.set(link.into_subscription()) {
            // Groups are discovered from the data; upstream runs free and
            // the per-group queues absorb.
            self.up.request(UNBOUNDED);
        }
    }

    fn on_next(&self, item: T) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let key = (self.key_of)(&item);
        let (group, opened) = {
            let mut groups = self.groups.lock().unwrap();
            match groups.get(&key) {
                Some(g) => (g.clone(), false),
                None => {
                    let g = UnicastProcessor::new();
                    groups.insert(key.clone(), g.clone());
                    (g, true)
                }
            }
        };
        if opened {
            self.fresh.offer(GroupedFlow {
                key,
                flow: group.flow(),
            });
        }
        group.offer(item);
        if opened {
            self.drain();
        }
    }

    fn on_complete(&self) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.clear();
            let groups = std::mem::take(&mut *self.groups.lock().unwrap());
            for group in groups.values() {
                group.complete();
            }
            self.fresh.mark_done();
            self.drain();
        }
    }

    fn on_error(&self, err: FlowError) {
        if !self.done.swap(true, Ordering::AcqRel) {
            self.up.clear();
            let groups = std::mem::take(&mut *self.groups.lock().unwrap());
            for group in groups.values() {
                group.error(err.clone());
            }
            self.fresh.fail(err);
            self.drain();
        } else {
            crate::hooks::on_undeliverable(err);
        }
    }
}

struct GroupBySubscription<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    stage: Arc<GroupByStage<K, T>>,
}

impl<K, T> Subscription for GroupBySubscription<K, T>
where
    K: Eq + Hash + Clone + Send + 'static,
    T: Send + 'static,
{
    fn request(&self, n: u64) {
        if n == 0 {
            return;
        }
        post_request(&self.stage.requested, n);
        self.stage.drain();
    }

    fn cancel(&self) {
        self.stage.cancelled.store(true, Ordering::Release);
        self.stage.up.cancel();
        let groups = std::mem::take(&mut *self.stage.groups.lock().unwrap());
        for group in groups.values() {
            group.complete();
        }
        self.stage.drain();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::range;
    use crate::testkit::TestSubscriber;
    use std::time::Duration;

    /// Items route to their key's flow; group count matches distinct keys
    #[test]
    fn test_group_by_parity() {
        let probe = TestSubscriber::unbounded();
        range(0, 10)
            .group_by(|x| x % 2)
            .flat_map(|g| {
                let key = *g.key();
                g.flow().to_list().map(move |items| (key, items))
            })
            .subscribe(probe.clone());
        assert!(probe.await_terminal(Duration::from_secs(2)));
        let mut items = probe.items();
        items.sort();
        assert_eq!(
            items,
            vec![(0, vec![0, 2, 4, 6, 8]), (1, vec![1, 3, 5, 7, 9])]
        );
    }

    /// A keyed partition carries the key it was opened with
    #[test]
    fn test_group_keys() {
        let probe = TestSubscriber::unbounded();
        range(0, 6)
            .group_by(|x| x % 3)
            .map(|g| *g.key())
            .subscribe(probe.clone());
        assert!(probe.await_items(3, Duration::from_secs(2)));
        assert_eq!(probe.items(), vec![0, 1, 2]);
    }
}
