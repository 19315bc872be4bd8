//! Executor abstraction
//!
//! The runtime never spins up asynchrony on its own; all timed and
//! thread-hopping operators go through an [`Executor`] that hands out
//! [`Worker`]s. A worker is single-threaded with FIFO ordering, which is
//! what makes the queue-drain operators' "schedule the trampoline, drain on
//! the worker" pattern emission-ordered.
//!
//! Three named executors are provided:
//!
//! | Executor | Threads | Use |
//! |----------|---------|-----|
//! | [`immediate()`] | caller's | tests, bridges; delays block the caller |
//! | [`single()`] | 1 shared | low-volume timed work |
//! | [`computation()`] | fixed pool (`num_cpus`) | observe-on hand-off, timers |
//!
//! Blocking inside a scheduled task stalls every other task bound to the
//! same worker thread.

mod immediate;
mod pool;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

pub use immediate::ImmediateExecutor;
pub use pool::{ComputationExecutor, SingleExecutor};

/// One-shot unit of work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;
/// Repeatedly invoked unit of work.
pub type PeriodicTask = Box<dyn FnMut() + Send + 'static>;

/// Source of workers.
pub trait Executor: Send + Sync {
    /// Returns a fresh single-threaded FIFO worker.
    fn worker(&self) -> Arc<dyn Worker>;

    /// Schedules a one-shot task without a dedicated worker.
    fn execute(&self, task: Task) -> Canceller;
}

/// Single-threaded FIFO task runner.
///
/// `dispose` cancels all pending tasks; a task already running finishes.
pub trait Worker: Send + Sync {
    fn schedule(&self, task: Task) -> Canceller;
    fn schedule_delayed(&self, task: Task, delay: Duration) -> Canceller;
    fn schedule_periodic(
        &self,
        task: PeriodicTask,
        initial: Duration,
        period: Duration,
    ) -> Canceller;
    fn dispose(&self);
}

/// Clonable cancellation flag for a scheduled task (or a whole worker).
#[derive(Clone, Default)]
pub struct Canceller {
    flag: Arc<AtomicBool>,
}

impl Canceller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[inline]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// The shared caller-thread executor.
pub fn immediate() -> Arc<dyn Executor> {
    static CELL: OnceLock<Arc<ImmediateExecutor>> = OnceLock::new();
    CELL.get_or_init(|| Arc::new(ImmediateExecutor)).clone() as Arc<dyn Executor>
}

/// The shared one-thread executor.
pub fn single() -> Arc<dyn Executor> {
    static CELL: OnceLock<Arc<SingleExecutor>> = OnceLock::new();
    CELL.get_or_init(|| Arc::new(SingleExecutor::new())).clone() as Arc<dyn Executor>
}

/// The shared fixed-pool executor, sized by the number of CPUs.
pub fn computation() -> Arc<dyn Executor> {
    static CELL: OnceLock<Arc<ComputationExecutor>> = OnceLock::new();
    CELL.get_or_init(|| Arc::new(ComputationExecutor::new(num_cpus::get().max(1))))
        .clone() as Arc<dyn Executor>
}
