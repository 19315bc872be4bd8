use std::sync::Arc;
use std::time::Duration;

use super::{Canceller, Executor, PeriodicTask, Task, Worker};

/// Runs everything on the calling thread.
///
/// Delayed tasks sleep the caller; periodic tasks loop until cancelled from
/// another thread. Meant for tests and the blocking bridges, where the
/// caller's thread *is* the event loop.
pub struct ImmediateExecutor;

impl Executor for ImmediateExecutor {
    fn worker(&self) -> Arc<dyn Worker> {
        Arc::new(ImmediateWorker {
            disposed: Canceller::new(),
        })
    }

    fn execute(&self, task: Task) -> Canceller {
        task();
        Canceller::new()
    }
}

struct ImmediateWorker {
    disposed: Canceller,
}

impl Worker for ImmediateWorker {
    fn schedule(&self, task: Task) -> Canceller {
        let cancel = Canceller::new();
        if !self.disposed.is_cancelled() {
            task();
        }
        cancel
    }

    fn schedule_delayed(&self, task: Task, delay: Duration) -> Canceller {
        let cancel = Canceller::new();
        std::thread::sleep(delay);
        if !self.disposed.is_cancelled() && !cancel.is_cancelled() {
            task();
        }
        cancel
    }

    fn schedule_periodic(
        &self,
        mut task: PeriodicTask,
        initial: Duration,
        period: Duration,
    ) -> Canceller {
        let cancel = Canceller::new();
        std::thread::sleep(initial);
        while !self.disposed.is_cancelled() && !cancel.is_cancelled() {
            task();
            std::thread::sleep(period);
        }
        cancel
    }

    fn dispose(&self) {
        self.disposed.cancel();
    }
}
