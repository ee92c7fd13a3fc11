//! Invokers: FIFO queues of work bound to an execution context.
//!
//! A [`SerialInvoker`] drains its queue from a single tokio task, one unit at
//! a time; state owned by such a queue needs no further locking. A
//! [`PoolInvoker`] fans work out onto the runtime.

use crate::{AsyncError, Promise, PromiseFuture};
use futures::future::BoxFuture;
use observability_deps::tracing::debug;
use std::{fmt, future::Future, sync::Arc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

enum Work {
    Sync(Box<dyn FnOnce() + Send>),
    Async(BoxFuture<'static, ()>),
}

impl fmt::Debug for Work {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sync(_) => f.write_str("Work::Sync"),
            Self::Async(_) => f.write_str("Work::Async"),
        }
    }
}

/// A FIFO of units of work bound to an execution context.
pub trait Invoker: fmt::Debug + Send + Sync + 'static {
    /// Enqueue a closure.
    fn invoke(&self, task: Box<dyn FnOnce() + Send>);

    /// Enqueue a future. On a serial invoker the future runs to completion
    /// before the next queued unit starts.
    fn invoke_async(&self, task: BoxFuture<'static, ()>);
}

/// Run `f` on `invoker` and observe its result through a future.
pub fn invoke_on<R, F>(invoker: &dyn Invoker, f: F) -> PromiseFuture<R>
where
    R: Send + Sync + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    let promise = Promise::new();
    let future = promise.future();
    invoker.invoke(Box::new(move || {
        promise.try_set(f());
    }));
    future
}

/// Run an async body on `invoker`.
///
/// Canceling the returned future cancels the supplied [`CancellationToken`],
/// which the body observes at its next suspension point.
pub fn async_via<R, F, Fut>(invoker: &dyn Invoker, make: F) -> PromiseFuture<R>
where
    R: Send + Sync + 'static,
    F: FnOnce(CancellationToken) -> Fut + Send + 'static,
    Fut: Future<Output = R> + Send + 'static,
{
    let promise = Promise::new();
    let future = promise.future();

    let token = CancellationToken::new();
    let canceler = token.clone();
    promise.on_canceled(move |_| canceler.cancel());

    invoker.invoke_async(Box::pin(async move {
        let body = make(token.clone());
        tokio::select! {
            value = body => {
                promise.try_set(value);
            }
            _ = token.cancelled() => {
                promise.try_set_error(AsyncError::Canceled("invoker task canceled".to_owned()));
            }
        }
    }));
    future
}

/// A single-consumer FIFO queue drained by one dedicated tokio task.
///
/// This is the "automaton discipline": between suspension points exactly one
/// queued unit executes, in submission order. Mutation application and all
/// per-cell state access happen through one of these.
pub struct SerialInvoker {
    name: &'static str,
    tx: mpsc::UnboundedSender<Work>,
    shutdown: CancellationToken,
}

impl fmt::Debug for SerialInvoker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialInvoker")
            .field("name", &self.name)
            .finish()
    }
}

impl SerialInvoker {
    /// Create a queue and spawn its consumer task onto the ambient runtime.
    pub fn new(name: &'static str) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Work>();
        let shutdown = CancellationToken::new();
        let consumer_shutdown = shutdown.clone();

        tokio::spawn(async move {
            loop {
                let work = tokio::select! {
                    work = rx.recv() => work,
                    _ = consumer_shutdown.cancelled() => None,
                };
                match work {
                    Some(Work::Sync(task)) => task(),
                    Some(Work::Async(task)) => task.await,
                    None => {
                        debug!(invoker = name, "serial invoker stopped");
                        return;
                    }
                }
            }
        });

        Arc::new(Self { name, tx, shutdown })
    }

    /// Stop the consumer; queued work not yet started is dropped.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// The queue name, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl Invoker for SerialInvoker {
    fn invoke(&self, task: Box<dyn FnOnce() + Send>) {
        // Delivery failure means the consumer stopped; dropping the task is
        // the documented behavior.
        let _ = self.tx.send(Work::Sync(task));
    }

    fn invoke_async(&self, task: BoxFuture<'static, ()>) {
        let _ = self.tx.send(Work::Async(task));
    }
}

/// An invoker that fans out onto the tokio runtime without serialization.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolInvoker;

impl PoolInvoker {
    /// Create a pool invoker for the ambient runtime.
    pub fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl Invoker for PoolInvoker {
    fn invoke(&self, task: Box<dyn FnOnce() + Send>) {
        tokio::spawn(async move { task() });
    }

    fn invoke_async(&self, task: BoxFuture<'static, ()>) {
        tokio::spawn(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use parking_lot::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn serial_invoker_is_fifo() {
        let invoker = SerialInvoker::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        for i in 0..100 {
            let order = Arc::clone(&order);
            invoker.invoke(Box::new(move || order.lock().push(i)));
        }
        let done = invoke_on(&*invoker, || ());
        done.await.unwrap();

        assert_eq!(*order.lock(), (0..100).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn async_work_serializes_with_sync_work() {
        let invoker = SerialInvoker::new("test");
        let order = Arc::new(Mutex::new(Vec::new()));

        let captured = Arc::clone(&order);
        invoker.invoke_async(Box::pin(async move {
            // The suspension must not let later queue entries overtake.
            tokio::time::sleep(Duration::from_millis(10)).await;
            captured.lock().push("async");
        }));
        let captured = Arc::clone(&order);
        invoker.invoke(Box::new(move || captured.lock().push("sync")));

        invoke_on(&*invoker, || ()).await.unwrap();
        assert_eq!(*order.lock(), vec!["async", "sync"]);
    }

    #[tokio::test]
    async fn invoke_on_returns_value() {
        let invoker = SerialInvoker::new("test");
        let result = invoke_on(&*invoker, || 6 * 7).await;
        assert_matches!(result, Ok(42));
    }

    #[tokio::test]
    async fn async_via_cancellation_reaches_body() {
        let invoker = PoolInvoker::new();
        let (started_tx, started_rx) = tokio::sync::oneshot::channel();

        let future = async_via(&*invoker, move |token| async move {
            started_tx.send(()).ok();
            token.cancelled().await;
            "observed cancellation"
        });

        started_rx.await.unwrap();
        future.cancel("no longer needed");

        // The body observes the token; the select in async_via resolves with
        // a canceled error either way.
        let result = future.await;
        assert_matches!(result, Err(AsyncError::Canceled(_)) | Ok("observed cancellation"));
    }

    #[tokio::test]
    async fn stopped_invoker_drops_work() {
        let invoker = SerialInvoker::new("test");
        invoker.stop();
        tokio::time::sleep(Duration::from_millis(5)).await;

        let future = invoke_on(&*invoker, || 1);
        // The promise is abandoned once the closure is dropped unexecuted.
        let result = future.await;
        assert_matches!(result, Err(AsyncError::Abandoned));
    }
}
