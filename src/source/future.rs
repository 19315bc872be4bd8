use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::Context;

use futures::future::Future;
use futures::task::{ArcWake, waker};

use crate::error::FlowError;
use crate::exec::{Executor, Worker};
use crate::flow::{Flow, Link, Publisher, Subscriber};
use crate::flowctl::NoopSubscription;
use crate::flowctl::scalar::ScalarSubscription;

/// One-shot publisher over a [`Future`]: on attach, the future is polled on
/// a worker of `executor`; its resolution becomes the single item (or the
/// error). Wake-ups reschedule the poll on the same worker, so the future
/// never blocks a caller thread.
///
/// The future is consumed by the first subscriber; later attaches are
/// rejected.
pub fn from_future<F, T>(future: F, executor: Arc<dyn Executor>) -> Flow<T>
where
    F: Future<Output = Result<T, FlowError>> + Send + 'static,
    T: Send + 'static,
{
    Flow::new(FuturePublisher {
        future: Mutex::new(Some(Box::pin(future))),
        executor,
    })
}

struct FuturePublisher<F: Future + Send + 'static> {
    future: Mutex<Option<Pin<Box<F>>>>,
    executor: Arc<dyn Executor>,
}

impl<F, T> Publisher<T> for FuturePublisher<F>
where
    F: Future<Output = Result<T, FlowError>> + Send + 'static,
    T: Send + 'static,
{
    fn subscribe(&self, subscriber: Arc<dyn Subscriber<T>>) {
        let Some(future) = self.future.lock().unwrap().take() else {
            subscriber.on_subscribe(Link::Direct(Arc::new(NoopSubscription)));
            subscriber.on_error(FlowError::AlreadySubscribed);
            return;
        };
        let scalar = Arc::new(ScalarSubscription::new(subscriber.clone()));
        subscriber.on_subscribe(Link::Fused(scalar.clone()));
        let driver = Arc::new(FutureDriver {
            future: Mutex::new(Some(future)),
            scalar,
            worker: self.executor.worker(),
        });
        let first = driver.clone();
        driver.worker.schedule(Box::new(move || {
            FutureDriver::poll_once(&first);
        }));
    }
}

struct FutureDriver<F: Future + Send + 'static, T: Send + 'static> {
    future: Mutex<Option<Pin<Box<F>>>>,
    scalar: Arc<ScalarSubscription<T>>,
    worker: Arc<dyn Worker>,
}

impl<F, T> FutureDriver<F, T>
where
    F: Future<Output = Result<T, FlowError>> + Send + 'static,
    T: Send + 'static,
{
    fn poll_once(me: &Arc<Self>) {
        if me.scalar.is_cancelled() {
            me.future.lock().unwrap().take();
            me.worker.dispose();
            return;
        }
        let mut guard = me.future.lock().unwrap();
        let Some(fut) = guard.as_mut() else {
            return;
        };
        let wk = waker(me.clone());
        let mut cx = Context::from_waker(&wk);
        match fut.as_mut().poll(&mut cx) {
            std::task::Poll::Ready(result) => {
                guard.take();
                drop(guard);
                match result {
                    Ok(v) => me.scalar.complete_with(v),
                    Err(e) => me.scalar.error(e),
                }
                me.worker.dispose();
            }
            std::task::Poll::Pending => {}
        }
    }
}

impl<F, T> ArcWake for FutureDriver<F, T>
where
    F: Future<Output = Result<T, FlowError>> + Send + 'static,
    T: Send + 'static,
{
    fn wake_by_ref(arc_self: &Arc<Self>) {
        let me = arc_self.clone();
        arc_self.worker.schedule(Box::new(move || {
            FutureDriver::poll_once(&me);
        }));
    }
}
