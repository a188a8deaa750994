//! Single-assignment, shareable results of background work.
//!
//! A [`Promise`] is the read side and a [`Resolver`] the write side. Both
//! point at the same slot; the promise can be cloned freely, the resolver
//! assigns at most once.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};

use parking_lot::Mutex;

type Callback<T> = Box<dyn FnOnce(&T) + Send>;

struct Shared<T> {
    value: Option<T>,
    callbacks: Vec<Callback<T>>,
    wakers: Vec<Waker>,
    disposed: bool,
    on_dispose: Option<Box<dyn FnOnce() + Send>>,
}

impl<T> Shared<T> {
    fn new(value: Option<T>) -> Self {
        Self {
            value,
            callbacks: Vec::new(),
            wakers: Vec::new(),
            disposed: false,
            on_dispose: None,
        }
    }
}

/// The eventual result of an operation.
///
/// Completion can be observed three ways: polling [`is_complete`](Self::is_complete),
/// registering an [`on_complete`](Self::on_complete) callback, or awaiting
/// the promise as a [`Future`]. Awaiting yields `None` only if the promise
/// was disposed or its resolver dropped before completing.
pub struct Promise<T> {
    shared: Arc<Mutex<Shared<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    /// Create an unresolved promise and the resolver that completes it.
    pub fn pending() -> (Promise<T>, Resolver<T>) {
        let shared = Arc::new(Mutex::new(Shared::new(None)));
        (
            Promise {
                shared: shared.clone(),
            },
            Resolver {
                shared,
                resolved: false,
            },
        )
    }

    /// A promise that is already complete.
    pub fn ready(value: T) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared::new(Some(value)))),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.shared.lock().value.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.lock().disposed
    }

    /// A copy of the value, if complete.
    pub fn try_get(&self) -> Option<T> {
        self.shared.lock().value.clone()
    }

    /// Run `callback` once with the value.
    ///
    /// If the promise is already complete the callback runs immediately on
    /// the calling thread, otherwise on whichever thread resolves it. A
    /// disposed promise never runs its callbacks.
    pub fn on_complete(&self, callback: impl FnOnce(&T) + Send + 'static) {
        let mut shared = self.shared.lock();
        if shared.disposed {
            return;
        }
        match shared.value.clone() {
            Some(value) => {
                drop(shared);
                callback(&value);
            }
            None => shared.callbacks.push(Box::new(callback)),
        }
    }

    /// Register a hook that runs when the promise is disposed.
    ///
    /// Used by the producer to release whatever backs the operation.
    pub fn set_release_hook(&self, hook: impl FnOnce() + Send + 'static) {
        let mut shared = self.shared.lock();
        if shared.disposed {
            drop(shared);
            hook();
        } else {
            shared.on_dispose = Some(Box::new(hook));
        }
    }

    /// Release the operation. Pending callbacks are dropped unrun and
    /// waiting futures resolve to `None`. Disposing twice does nothing.
    pub fn dispose(&self) {
        let (hook, wakers) = {
            let mut shared = self.shared.lock();
            if shared.disposed {
                return;
            }
            shared.disposed = true;
            shared.callbacks.clear();
            (shared.on_dispose.take(), std::mem::take(&mut shared.wakers))
        };

        if let Some(hook) = hook {
            hook();
        }
        wakers.into_iter().for_each(Waker::wake);
    }
}

impl<T: Clone + Send + 'static> Future for Promise<T> {
    type Output = Option<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut shared = self.shared.lock();
        if let Some(value) = &shared.value {
            return Poll::Ready(Some(value.clone()));
        }
        if shared.disposed {
            return Poll::Ready(None);
        }
        if !shared.wakers.iter().any(|w| w.will_wake(cx.waker())) {
            shared.wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.shared.lock();
        f.debug_struct("Promise")
            .field("complete", &shared.value.is_some())
            .field("disposed", &shared.disposed)
            .finish()
    }
}

/// Completes a [`Promise`]. Dropping it unresolved disposes the promise.
pub struct Resolver<T> {
    shared: Arc<Mutex<Shared<T>>>,
    resolved: bool,
}

impl<T: Clone + Send + 'static> Resolver<T> {
    /// Assign the value and fire callbacks. Returns `false` if the promise
    /// was disposed first, in which case the value is dropped.
    pub fn resolve(mut self, value: T) -> bool {
        self.resolved = true;
        let (callbacks, wakers) = {
            let mut shared = self.shared.lock();
            if shared.disposed {
                return false;
            }
            shared.value = Some(value.clone());
            (
                std::mem::take(&mut shared.callbacks),
                std::mem::take(&mut shared.wakers),
            )
        };

        for callback in callbacks {
            callback(&value);
        }
        wakers.into_iter().for_each(Waker::wake);
        true
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        if self.resolved {
            return;
        }
        let wakers = {
            let mut shared = self.shared.lock();
            shared.disposed = true;
            shared.callbacks.clear();
            std::mem::take(&mut shared.wakers)
        };
        wakers.into_iter().for_each(Waker::wake);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_ready_promise_fires_callback_immediately() {
        let promise = Promise::ready(7);
        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        promise.on_complete(move |v| {
            s.store(*v, Ordering::SeqCst);
        });
        assert_eq!(seen.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn test_callback_fires_once_on_resolve() {
        let (promise, resolver) = Promise::pending();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        promise.on_complete(move |_: &u32| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!promise.is_complete());

        assert!(resolver.resolve(3));
        assert!(promise.is_complete());
        assert_eq!(promise.try_get(), Some(3));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_await_resolved_on_another_thread() {
        let (promise, resolver) = Promise::pending();
        let worker = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            resolver.resolve(String::from("done"));
        });
        assert_eq!(pollster::block_on(promise), Some("done".to_string()));
        worker.join().unwrap();
    }

    #[test]
    fn test_double_dispose_is_noop() {
        let (promise, resolver) = Promise::<u8>::pending();
        let hooks = Arc::new(AtomicUsize::new(0));
        let h = hooks.clone();
        promise.set_release_hook(move || {
            h.fetch_add(1, Ordering::SeqCst);
        });

        promise.dispose();
        promise.dispose();
        assert_eq!(hooks.load(Ordering::SeqCst), 1);
        assert!(!resolver.resolve(1));
        assert_eq!(pollster::block_on(promise), None);
    }

    #[test]
    fn test_dropped_resolver_disposes() {
        let (promise, resolver) = Promise::<u8>::pending();
        drop(resolver);
        assert!(promise.is_disposed());
        assert_eq!(pollster::block_on(promise), None);
    }
}
