// Cancellation signalling for blocking operations.
//
// A `CancelToken` carries the notion of interrupting a parked caller: a
// set-once atomic flag plus the wakers of every wait currently watching
// the token. A wait that observes the token fire re-validates its own
// completion first; an operation that already completed wins and the
// still-set token is what the caller gets to observe afterwards.

use std::sync::{
    atomic::{AtomicU64, AtomicUsize, Ordering},
    Arc, Mutex,
};

/// Token has not been cancelled.
const UNSET: usize = 0;

/// Token has been cancelled.
const SET: usize = 1;

/// Wakes a parked wait so it can re-evaluate its condition.
pub trait Waker {
    fn wake(&self);
}

/// Function adapter for [`Waker`].
struct FnWaker<F: Fn() + Send + Sync>(F);

impl<F: Fn() + Send + Sync> Waker for FnWaker<F> {
    fn wake(&self) {
        (self.0)();
    }
}

struct CancelInner {
    state: AtomicUsize,
    next_watch_id: AtomicU64,
    watchers: Mutex<Vec<(u64, Arc<dyn Waker + Send + Sync>)>>,
}

/// Cooperative cancellation handle for blocking calls.
///
/// Cloning shares the token; cancelling any clone cancels them all.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<CancelInner>,
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CancelInner {
                state: AtomicUsize::new(UNSET),
                next_watch_id: AtomicU64::new(0),
                watchers: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Cancels the token, waking every watching wait.
    ///
    /// Returns false if the token was already cancelled.
    pub fn cancel(&self) -> bool {
        if self
            .inner
            .state
            .compare_exchange(UNSET, SET, Ordering::SeqCst, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }

        tracing::debug!("cancel token fired");

        // release the registry lock before each wake: wakers take their
        // owner's monitor lock
        loop {
            let next = self.inner.watchers.lock().unwrap().pop();
            match next {
                Some((_, waker)) => waker.wake(),
                None => break,
            }
        }
        true
    }

    /// True once [`CancelToken::cancel`] has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.state.load(Ordering::Acquire) == SET
    }

    /// Registers a waker to be invoked when the token fires; the guard
    /// deregisters it on drop.
    ///
    /// A token that fired before registration invokes nothing, so waits
    /// must still re-check [`CancelToken::is_cancelled`] before parking.
    #[must_use]
    pub fn watch(&self, waker: Arc<dyn Waker + Send + Sync>) -> WatchGuard {
        let id = self.inner.next_watch_id.fetch_add(1, Ordering::Relaxed);
        self.inner.watchers.lock().unwrap().push((id, waker));
        WatchGuard {
            inner: self.inner.clone(),
            id,
        }
    }

    /// [`CancelToken::watch`] for a plain function.
    #[must_use]
    pub fn watch_fn<F>(&self, wake: F) -> WatchGuard
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.watch(Arc::new(FnWaker(wake)))
    }
}

/// Keeps a waker registered with a [`CancelToken`] until dropped.
pub struct WatchGuard {
    inner: Arc<CancelInner>,
    id: u64,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.inner
            .watchers
            .lock()
            .unwrap()
            .retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod test_cancel_token {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingWaker(AtomicUsize);

    impl Waker for CountingWaker {
        fn wake(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn cancel_sets_the_flag_exactly_once() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());

        assert!(token.cancel());
        assert!(token.is_cancelled());
        assert!(!token.cancel());
    }

    #[test]
    fn clones_share_the_flag() {
        let token = CancelToken::new();
        let clone = token.clone();

        token.cancel();
        assert!(clone.is_cancelled());
    }

    #[test]
    fn cancel_wakes_every_watcher() {
        let token = CancelToken::new();
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));

        let _first = token.watch(waker.clone());
        let _second = token.watch(waker.clone());

        token.cancel();
        assert_eq!(2, waker.0.load(Ordering::SeqCst));
    }

    #[test]
    fn dropped_guards_deregister() {
        let token = CancelToken::new();
        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));

        drop(token.watch(waker.clone()));
        token.cancel();

        assert_eq!(0, waker.0.load(Ordering::SeqCst));
    }

    #[test]
    fn watching_a_fired_token_invokes_nothing() {
        let token = CancelToken::new();
        token.cancel();

        let waker = Arc::new(CountingWaker(AtomicUsize::new(0)));
        let _guard = token.watch(waker.clone());

        assert_eq!(0, waker.0.load(Ordering::SeqCst));
        assert!(token.is_cancelled());
    }
}
