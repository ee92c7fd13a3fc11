//! A reference-counted promise (write side) / future (read side) pair.
//!
//! The state moves through exactly one terminal transition:
//! unset -> {value, error, abandoned, canceled-error}. Result subscribers run
//! exactly once; cancel subscribers run at most once. Cancellation is
//! advisory: a value that already arrived wins.

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::{
    fmt,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll, Waker},
};

/// The error side of a [`PromiseFuture`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AsyncError {
    /// The consumer canceled the future before a value was produced.
    Canceled(String),
    /// The last promise reference was dropped without producing a value.
    Abandoned,
    /// The producer reported an error.
    Failed(String),
}

impl fmt::Display for AsyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Canceled(reason) => write!(f, "future canceled: {reason}"),
            Self::Abandoned => write!(f, "promise abandoned"),
            Self::Failed(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for AsyncError {}

/// Shorthand for the outcome a future resolves to.
pub type AsyncResult<T> = Result<T, AsyncError>;

type ResultSubscriber<T> = Box<dyn FnOnce(&AsyncResult<T>) + Send>;
type CancelSubscriber = Box<dyn FnOnce(&AsyncError) + Send>;

struct Inner<T> {
    result: Option<Arc<AsyncResult<T>>>,
    canceled: bool,
    cancel_notified: bool,
    result_subscribers: Vec<ResultSubscriber<T>>,
    cancel_subscribers: Vec<CancelSubscriber>,
    wakers: Vec<Waker>,
    promise_refs: usize,
}

impl<T> Inner<T> {
    fn new() -> Self {
        Self {
            result: None,
            canceled: false,
            cancel_notified: false,
            result_subscribers: Vec::new(),
            cancel_subscribers: Vec::new(),
            wakers: Vec::new(),
            promise_refs: 1,
        }
    }
}

struct Core<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Send + Sync + 'static> Core<T> {
    // Install the terminal result and return what must run outside the lock.
    fn try_install(
        &self,
        result: AsyncResult<T>,
    ) -> Option<(Arc<AsyncResult<T>>, Vec<ResultSubscriber<T>>, Vec<Waker>)> {
        let mut inner = self.inner.lock();
        if inner.result.is_some() {
            return None;
        }
        let result = Arc::new(result);
        inner.result = Some(Arc::clone(&result));
        let subscribers = std::mem::take(&mut inner.result_subscribers);
        let wakers = std::mem::take(&mut inner.wakers);
        // A terminal result makes cancel handlers unreachable.
        inner.cancel_subscribers.clear();
        Some((result, subscribers, wakers))
    }

    fn complete(&self, result: AsyncResult<T>) -> bool {
        match self.try_install(result) {
            Some((result, subscribers, wakers)) => {
                for subscriber in subscribers {
                    subscriber(&result);
                }
                for waker in wakers {
                    waker.wake();
                }
                true
            }
            None => false,
        }
    }
}

// Runs abandonment notifications so that subscriber callbacks never execute
// under the thread that happened to release the last promise reference.
static FINALIZER: Lazy<Mutex<std::sync::mpsc::Sender<Box<dyn FnOnce() + Send>>>> =
    Lazy::new(|| {
        let (tx, rx) = std::sync::mpsc::channel::<Box<dyn FnOnce() + Send>>();
        std::thread::Builder::new()
            .name("promise-finalizer".to_owned())
            .spawn(move || {
                while let Ok(task) = rx.recv() {
                    task();
                }
            })
            .expect("failed to spawn promise finalizer thread");
        Mutex::new(tx)
    });

/// The write side. Clones share the same state; the last clone dropped
/// without a value abandons the future.
pub struct Promise<T: Send + Sync + 'static> {
    core: Arc<Core<T>>,
}

impl<T: Send + Sync + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("is_set", &self.is_set())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Promise<T> {
    /// Create an unset promise.
    pub fn new() -> Self {
        Self {
            core: Arc::new(Core {
                inner: Mutex::new(Inner::new()),
            }),
        }
    }

    /// The read side of this promise.
    pub fn future(&self) -> PromiseFuture<T> {
        PromiseFuture {
            core: Arc::clone(&self.core),
        }
    }

    /// Whether a terminal result has been installed.
    pub fn is_set(&self) -> bool {
        self.core.inner.lock().result.is_some()
    }

    /// Whether the consumer has requested cancellation.
    pub fn is_canceled(&self) -> bool {
        self.core.inner.lock().canceled
    }

    /// Install `value`. Panics if a terminal result is already present;
    /// double-setting is a contract violation, use [`Promise::try_set`] when
    /// racing is legal.
    pub fn set(&self, value: T) {
        assert!(self.try_set(value), "promise already set");
    }

    /// Install an error. Panics if a terminal result is already present.
    pub fn set_error(&self, error: AsyncError) {
        assert!(self.try_set_error(error), "promise already set");
    }

    /// Install `value` unless a terminal result is already present.
    pub fn try_set(&self, value: T) -> bool {
        self.core.complete(Ok(value))
    }

    /// Install an error unless a terminal result is already present.
    pub fn try_set_error(&self, error: AsyncError) -> bool {
        self.core.complete(Err(error))
    }

    /// Register a handler invoked at most once if the consumer cancels the
    /// future before a value is produced.
    pub fn on_canceled(&self, handler: impl FnOnce(&AsyncError) + Send + 'static) {
        let fire_now = {
            let mut inner = self.core.inner.lock();
            if inner.result.is_some() {
                return;
            }
            if inner.canceled {
                true
            } else {
                inner.cancel_subscribers.push(Box::new(handler));
                return;
            }
        };
        if fire_now {
            handler(&AsyncError::Canceled("already canceled".to_owned()));
        }
    }
}

impl<T: Send + Sync + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> Clone for Promise<T> {
    fn clone(&self) -> Self {
        self.core.inner.lock().promise_refs += 1;
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + Sync + 'static> Drop for Promise<T> {
    fn drop(&mut self) {
        let abandon = {
            let mut inner = self.core.inner.lock();
            inner.promise_refs -= 1;
            inner.promise_refs == 0 && inner.result.is_none()
        };
        if !abandon {
            return;
        }

        let has_subscribers = !self.core.inner.lock().result_subscribers.is_empty();
        let core = Arc::clone(&self.core);
        if has_subscribers {
            let _ = FINALIZER.lock().send(Box::new(move || {
                core.complete(Err(AsyncError::Abandoned));
            }));
        } else {
            core.complete(Err(AsyncError::Abandoned));
        }
    }
}

/// The read side. Cloneable; implements [`std::future::Future`].
pub struct PromiseFuture<T: Send + Sync + 'static> {
    core: Arc<Core<T>>,
}

impl<T: Send + Sync + 'static> fmt::Debug for PromiseFuture<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseFuture")
            .field("is_set", &self.core.inner.lock().result.is_some())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Clone for PromiseFuture<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: Send + Sync + 'static> PromiseFuture<T> {
    /// The result, if a terminal transition has happened.
    pub fn try_get(&self) -> Option<Arc<AsyncResult<T>>> {
        self.core.inner.lock().result.clone()
    }

    /// Whether a terminal result is present.
    pub fn is_set(&self) -> bool {
        self.core.inner.lock().result.is_some()
    }

    /// Register a result subscriber.
    ///
    /// If the future is already set the subscriber runs synchronously on the
    /// caller; otherwise it runs on whichever thread installs the result.
    pub fn subscribe(&self, subscriber: impl FnOnce(&AsyncResult<T>) + Send + 'static) {
        let ready = {
            let mut inner = self.core.inner.lock();
            match &inner.result {
                Some(result) => Some(Arc::clone(result)),
                None => {
                    inner.result_subscribers.push(Box::new(subscriber));
                    return;
                }
            }
        };
        if let Some(result) = ready {
            subscriber(&result);
        }
    }

    /// Request cancellation.
    ///
    /// Fires cancel subscribers at most once. If the producer registered no
    /// cancel handler the promise is completed with a canceled error. A
    /// future whose value was already produced stays set.
    pub fn cancel(&self, reason: impl Into<String>) {
        let error = AsyncError::Canceled(reason.into());
        let handlers = {
            let mut inner = self.core.inner.lock();
            if inner.result.is_some() || inner.cancel_notified {
                return;
            }
            inner.canceled = true;
            inner.cancel_notified = true;
            std::mem::take(&mut inner.cancel_subscribers)
        };

        if handlers.is_empty() {
            self.core.complete(Err(error));
        } else {
            for handler in handlers {
                handler(&error);
            }
        }
    }
}

impl<T: Clone + Send + Sync + 'static> PromiseFuture<T> {
    /// A future resolving to `f(value)`; errors and cancellation propagate
    /// without invoking `f`, and canceling the returned future cancels this
    /// one.
    pub fn apply<U, F>(&self, f: F) -> PromiseFuture<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        let promise = Promise::new();
        let result_future = promise.future();

        let source = self.clone();
        promise.on_canceled(move |error| {
            let AsyncError::Canceled(reason) = error else {
                return;
            };
            source.cancel(reason.clone());
        });

        self.subscribe(move |result| match result {
            Ok(value) => {
                promise.try_set(f(value.clone()));
            }
            Err(error) => {
                promise.try_set_error(error.clone());
            }
        });
        result_future
    }
}

impl<T: Clone + Send + Sync + 'static> Future for PromiseFuture<T> {
    type Output = AsyncResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut inner = self.core.inner.lock();
        match &inner.result {
            Some(result) => Poll::Ready((**result).clone()),
            None => {
                inner.wakers.push(cx.waker().clone());
                Poll::Pending
            }
        }
    }
}

/// Await `future` for at most `timeout`; on expiry the underlying future is
/// canceled and a canceled error is returned.
pub async fn wait_for<T: Clone + Send + Sync + 'static>(
    future: PromiseFuture<T>,
    timeout: std::time::Duration,
) -> AsyncResult<T> {
    match tokio::time::timeout(timeout, future.clone()).await {
        Ok(result) => result,
        Err(_) => {
            future.cancel("timed out");
            match future.try_get() {
                Some(result) => (*result).clone(),
                None => Err(AsyncError::Canceled("timed out".to_owned())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn set_then_subscribe_runs_synchronously() {
        let promise = Promise::new();
        let future = promise.future();
        promise.set(5);

        let seen = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&seen);
        future.subscribe(move |result| {
            assert_matches!(result, Ok(5));
            captured.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribers_fire_exactly_once_in_order() {
        let promise = Promise::new();
        let future = promise.future();

        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            future.subscribe(move |_| order.lock().push(tag));
        }
        promise.set(());

        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn try_set_is_idempotent_set_panics() {
        let promise = Promise::new();
        assert!(promise.try_set(1));
        assert!(!promise.try_set(2));
        assert!(!promise.try_set_error(AsyncError::Abandoned));
        assert_matches!(promise.future().try_get().unwrap().as_ref(), Ok(1));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| promise.set(3)));
        assert!(result.is_err());
    }

    #[test]
    fn dropping_last_promise_abandons() {
        let promise = Promise::<u32>::new();
        let clone = promise.clone();
        let future = promise.future();

        drop(promise);
        assert!(!future.is_set());

        drop(clone);
        assert_matches!(future.try_get().unwrap().as_ref(), Err(AsyncError::Abandoned));
    }

    #[tokio::test]
    async fn abandonment_with_subscribers_runs_off_thread() {
        let promise = Promise::<u32>::new();
        let future = promise.future();
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Mutex::new(Some(tx));
        future.subscribe(move |result| {
            let name = std::thread::current().name().map(str::to_owned);
            if let Some(tx) = tx.lock().take() {
                let _ = tx.send((result.clone().map(|_| ()), name));
            }
        });

        drop(promise);
        let (result, thread_name) = rx.await.unwrap();
        assert_matches!(result, Err(AsyncError::Abandoned));
        assert_eq!(thread_name.as_deref(), Some("promise-finalizer"));
    }

    #[test]
    fn cancel_without_handler_fails_the_future() {
        let promise = Promise::<u32>::new();
        let future = promise.future();

        future.cancel("not needed anymore");
        assert_matches!(
            future.try_get().unwrap().as_ref(),
            Err(AsyncError::Canceled(reason)) if reason == "not needed anymore"
        );

        // The producer-side set after cancellation is a lost race, not a bug.
        assert!(!promise.try_set(1));
    }

    #[test]
    fn cancel_with_handler_notifies_once() {
        let promise = Promise::<u32>::new();
        let future = promise.future();

        let notifications = Arc::new(AtomicUsize::new(0));
        let captured = Arc::clone(&notifications);
        promise.on_canceled(move |_| {
            captured.fetch_add(1, Ordering::SeqCst);
        });

        future.cancel("first");
        future.cancel("second");
        assert_eq!(notifications.load(Ordering::SeqCst), 1);

        // With a handler registered the promise stays unset; the producer
        // decides how to terminate.
        assert!(!future.is_set());
        assert!(promise.is_canceled());
        promise.set(7);
        assert_matches!(future.try_get().unwrap().as_ref(), Ok(7));
    }

    #[test]
    fn cancel_after_value_is_advisory() {
        let promise = Promise::new();
        let future = promise.future();
        promise.set(11);

        future.cancel("too late");
        assert_matches!(future.try_get().unwrap().as_ref(), Ok(11));
    }

    #[test]
    fn apply_maps_value_and_propagates_errors() {
        let promise = Promise::new();
        let doubled = promise.future().apply(|v: u32| v * 2);
        promise.set(21);
        assert_matches!(doubled.try_get().unwrap().as_ref(), Ok(42));

        let promise = Promise::<u32>::new();
        let mapped = promise.future().apply(|v| v + 1);
        promise.set_error(AsyncError::Failed("boom".to_owned()));
        assert_matches!(
            mapped.try_get().unwrap().as_ref(),
            Err(AsyncError::Failed(message)) if message == "boom"
        );
    }

    #[test]
    fn canceling_applied_future_cancels_source() {
        let promise = Promise::<u32>::new();
        let source = promise.future();
        let mapped = source.apply(|v| v + 1);

        mapped.cancel("downstream gone");
        assert_matches!(
            source.try_get().unwrap().as_ref(),
            Err(AsyncError::Canceled(_))
        );
    }

    #[tokio::test]
    async fn await_resolves_on_set() {
        let promise = Promise::new();
        let future = promise.future();

        let waiter = tokio::spawn(async move { future.await });
        tokio::time::sleep(Duration::from_millis(5)).await;
        promise.set("done".to_owned());

        assert_matches!(waiter.await.unwrap(), Ok(value) if value == "done");
    }

    #[tokio::test]
    async fn wait_for_timeout_cancels_underlying() {
        let promise = Promise::<u32>::new();
        let future = promise.future();

        let result = wait_for(future.clone(), Duration::from_millis(5)).await;
        assert_matches!(result, Err(AsyncError::Canceled(_)));
        assert!(promise.is_canceled());
    }
}
