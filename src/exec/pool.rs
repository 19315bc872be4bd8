use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use super::{Canceller, Executor, PeriodicTask, Task, Worker};

enum TaskKind {
    Once(Task),
    Periodic { f: PeriodicTask, period: Duration },
}

struct TimedEntry {
    at: Instant,
    /// Tie-breaker: same-deadline tasks run in submission order (FIFO).
    seq: u64,
    kind: TaskKind,
    cancel: Canceller,
    /// The owning worker's dispose flag.
    worker: Canceller,
}

impl PartialEq for TimedEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for TimedEntry {}

impl PartialOrd for TimedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimedEntry {
    // Inverted so the std max-heap pops the earliest (deadline, seq) first.
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (other.at, other.seq).cmp(&(self.at, self.seq))
    }
}

/// One timer thread: a deadline-ordered heap drained by a dedicated thread.
/// Non-hot-path locking only; the signal path of operators never touches it.
struct TimerShared {
    heap: Mutex<BinaryHeap<TimedEntry>>,
    cond: Condvar,
    seq: AtomicU64,
    shutdown: AtomicBool,
}

impl TimerShared {
    fn push(&self, entry: TimedEntry) {
        self.heap.lock().unwrap().push(entry);
        self.cond.notify_one();
    }

    fn submit(&self, at: Instant, kind: TaskKind, worker: Canceller) -> Canceller {
        let cancel = Canceller::new();
        self.push(TimedEntry {
            at,
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            kind,
            cancel: cancel.clone(),
            worker,
        });
        cancel
    }

    fn run(&self) {
        log::trace!("timer thread started");
        let mut guard = self.heap.lock().unwrap();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            let now = Instant::now();
            match guard.peek() {
                None => {
                    guard = self.cond.wait(guard).unwrap();
                }
                Some(entry) if entry.at > now => {
                    let at = entry.at;
                    let (g, _) = self.cond.wait_timeout(guard, at - now).unwrap();
                    guard = g;
                }
                Some(_) => {
                    let TimedEntry {
                        at,
                        kind,
                        cancel,
                        worker,
                        ..
                    } = guard.pop().unwrap();
                    let live = || !cancel.is_cancelled() && !worker.is_cancelled();
                    // Run outside the lock so schedulers are never blocked
                    // behind a task.
                    drop(guard);
                    match kind {
                        TaskKind::Once(task) => {
                            if live() {
                                task();
                            }
                        }
                        TaskKind::Periodic { mut f, period } => {
                            if live() {
                                f();
                                if live() {
                                    // Fixed-rate accounting: the next firing
                                    // is measured from the previous deadline.
                                    self.push(TimedEntry {
                                        at: at + period,
                                        seq: self.seq.fetch_add(1, Ordering::Relaxed),
                                        kind: TaskKind::Periodic { f, period },
                                        cancel,
                                        worker,
                                    });
                                }
                            }
                        }
                    }
                    guard = self.heap.lock().unwrap();
                }
            }
        }
        log::trace!("timer thread stopped");
    }
}

fn spawn_timer(name: String) -> Arc<TimerShared> {
    let shared = Arc::new(TimerShared {
        heap: Mutex::new(BinaryHeap::new()),
        cond: Condvar::new(),
        seq: AtomicU64::new(0),
        shutdown: AtomicBool::new(false),
    });
    let runner = shared.clone();
    std::thread::Builder::new()
        .name(name)
        .spawn(move || runner.run())
        .expect("failed to spawn timer thread");
    shared
}

/// A worker bound to one timer thread. All of its tasks run there, FIFO.
struct ThreadWorker {
    shared: Arc<TimerShared>,
    disposed: Canceller,
}

impl Worker for ThreadWorker {
    fn schedule(&self, task: Task) -> Canceller {
        self.shared
            .submit(Instant::now(), TaskKind::Once(task), self.disposed.clone())
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> Canceller {
        self.shared.submit(
            Instant::now() + delay,
            TaskKind::Once(task),
            self.disposed.clone(),
        )
    }

    fn schedule_periodic(
        &self,
        task: PeriodicTask,
        initial: Duration,
        period: Duration,
    ) -> Canceller {
        self.shared.submit(
            Instant::now() + initial,
            TaskKind::Periodic { f: task, period },
            self.disposed.clone(),
        )
    }

    fn dispose(&self) {
        self.disposed.cancel();
    }
}

/// One shared thread for everything scheduled through it.
pub struct SingleExecutor {
    shared: Arc<TimerShared>,
}

impl Default for SingleExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl SingleExecutor {
    pub fn new() -> Self {
        Self {
            shared: spawn_timer("flusso-single".into()),
        }
    }
}

impl Executor for SingleExecutor {
    fn worker(&self) -> Arc<dyn Worker> {
        Arc::new(ThreadWorker {
            shared: self.shared.clone(),
            disposed: Canceller::new(),
        })
    }

    fn execute(&self, task: Task) -> Canceller {
        self.shared
            .submit(Instant::now(), TaskKind::Once(task), Canceller::new())
    }
}

/// Fixed pool of timer threads; workers are assigned round-robin, so each
/// worker keeps single-thread FIFO ordering while the pool spreads load.
pub struct ComputationExecutor {
    threads: Vec<Arc<TimerShared>>,
    next: AtomicUsize,
}

impl ComputationExecutor {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        let threads = (0..size)
            .map(|i| spawn_timer(format!("flusso-computation-{i}")))
            .collect();
        Self {
            threads,
            next: AtomicUsize::new(0),
        }
    }

    fn pick(&self) -> Arc<TimerShared> {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.threads.len();
        self.threads[i].clone()
    }
}

impl Executor for ComputationExecutor {
    fn worker(&self) -> Arc<dyn Worker> {
        Arc::new(ThreadWorker {
            shared: self.pick(),
            disposed: Canceller::new(),
        })
    }

    fn execute(&self, task: Task) -> Canceller {
        self.pick()
            .submit(Instant::now(), TaskKind::Once(task), Canceller::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    /// Tasks on one worker run in submission order
    #[test]
    fn test_worker_fifo() {
        let exec = SingleExecutor::new();
        let worker = exec.worker();
        let (tx, rx) = mpsc::channel();
        for i in 0..64 {
            let tx = tx.clone();
            worker.schedule(Box::new(move || {
                tx.send(i).unwrap();
            }));
        }
        let seen: Vec<i32> = (0..64).map(|_| rx.recv().unwrap()).collect();
        assert_eq!(seen, (0..64).collect::<Vec<_>>());
    }

    /// A delayed task does not fire before its deadline
    #[test]
    fn test_delay() {
        let exec = SingleExecutor::new();
        let worker = exec.worker();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();
        worker.schedule_delayed(
            Box::new(move || {
                tx.send(start.elapsed()).unwrap();
            }),
            Duration::from_millis(30),
        );
        let elapsed = rx.recv().unwrap();
        assert!(elapsed >= Duration::from_millis(30), "fired at {elapsed:?}");
    }

    /// Disposing a worker drops its pending tasks but not other workers'
    #[test]
    fn test_dispose_scoped_to_worker() {
        let exec = SingleExecutor::new();
        let doomed = exec.worker();
        let alive = exec.worker();
        let (tx, rx) = mpsc::channel();
        let tx2 = tx.clone();
        doomed.schedule_delayed(
            Box::new(move || {
                tx2.send("doomed").unwrap();
            }),
            Duration::from_millis(20),
        );
        alive.schedule_delayed(
            Box::new(move || {
                tx.send("alive").unwrap();
            }),
            Duration::from_millis(30),
        );
        doomed.dispose();
        assert_eq!(rx.recv_timeout(Duration::from_millis(500)).unwrap(), "alive");
    }

    /// Periodic tasks keep firing until cancelled
    #[test]
    fn test_periodic() {
        let exec = SingleExecutor::new();
        let worker = exec.worker();
        let (tx, rx) = mpsc::channel();
        let cancel = worker.schedule_periodic(
            Box::new(move || {
                let _ = tx.send(());
            }),
            Duration::from_millis(1),
            Duration::from_millis(1),
        );
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_millis(500)).unwrap();
        }
        cancel.cancel();
    }
}
