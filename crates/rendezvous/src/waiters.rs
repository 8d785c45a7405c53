// The shared shape of a parked request: an atomic
// {Pending, Delivered, Cancelled} state machine, a payload slot and a
// condition variable dedicated to this one waiter.
//
// The CAS out of `Pending` is the linearization point for every
// completion-versus-give-up race: whichever side wins it owns the
// outcome, so a completion observed at wake-up always beats a timeout or
// cancellation that lost the race.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Condvar, Mutex, MutexGuard,
};

use crate::signals::CancelToken;
use crate::timing::WaitBudget;

/// Registered, nothing has happened yet.
const PENDING: usize = 0;

/// Exactly one peer completed the request.
const DELIVERED: usize = 1;

/// The owner (or a shutdown sweep) gave the request up.
const CANCELLED: usize = 2;

/// Why [`WaitCell::wait_while_pending`] returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// The cell left `Pending`; ask [`WaitCell::delivered`] which way.
    Settled,
    /// The budget ran out and this waiter won the give-up race.
    TimedOut,
    /// The token fired and this waiter won the give-up race.
    Cancelled,
}

pub(crate) struct WaitCell<T> {
    state: AtomicUsize,
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

impl<T> WaitCell<T> {
    /// A cell carrying its creator's payload (a sender-side registration).
    pub(crate) fn filled(value: T) -> Self {
        Self {
            state: AtomicUsize::new(PENDING),
            slot: Mutex::new(Some(value)),
            cond: Condvar::new(),
        }
    }

    /// An empty cell awaiting a payload (a receiver-side registration).
    pub(crate) fn empty() -> Self {
        Self {
            state: AtomicUsize::new(PENDING),
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    /// A cell born delivered, for operations that completed on the spot.
    pub(crate) fn settled() -> Self {
        Self {
            state: AtomicUsize::new(DELIVERED),
            slot: Mutex::new(None),
            cond: Condvar::new(),
        }
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.state.load(Ordering::Acquire) == PENDING
    }

    /// True once a peer completed this cell.
    pub(crate) fn delivered(&self) -> bool {
        self.state.load(Ordering::Acquire) == DELIVERED
    }

    /// Claims a filled cell, taking its payload and waking its owner.
    ///
    /// Returns `None` when the owner already gave the cell up; callers
    /// skip such tombstones. Caller must hold the owning monitor.
    pub(crate) fn try_claim(&self) -> Option<T> {
        if self
            .state
            .compare_exchange(PENDING, DELIVERED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return None;
        }
        let value = self.slot.lock().unwrap().take();
        self.cond.notify_one();
        value
    }

    /// Completes an empty cell with `value`, waking its owner; hands the
    /// value back when the owner already gave up. Caller must hold the
    /// owning monitor.
    pub(crate) fn try_complete(&self, value: T) -> Result<(), T> {
        if self
            .state
            .compare_exchange(PENDING, DELIVERED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(value);
        }
        *self.slot.lock().unwrap() = Some(value);
        self.cond.notify_one();
        Ok(())
    }

    /// Completes a filled cell by swapping payloads: the occupant's value
    /// comes out, `value` goes in for the occupant to collect. Caller must
    /// hold the owning monitor.
    pub(crate) fn try_swap(&self, value: T) -> Result<T, T> {
        if self
            .state
            .compare_exchange(PENDING, DELIVERED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(value);
        }
        let theirs = self.slot.lock().unwrap().replace(value);
        self.cond.notify_all();
        match theirs {
            Some(theirs) => Ok(theirs),
            None => unreachable!("a swapped cell always starts filled"),
        }
    }

    /// Gives the cell up, dropping any payload it still holds and waking
    /// anyone parked on it.
    ///
    /// Returns false when a peer settled the cell first: completion wins.
    pub(crate) fn try_abandon(&self) -> bool {
        if self
            .state
            .compare_exchange(PENDING, CANCELLED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        drop(self.slot.lock().unwrap().take());
        self.cond.notify_all();
        true
    }

    /// Takes whatever payload the cell currently holds.
    pub(crate) fn take(&self) -> Option<T> {
        self.slot.lock().unwrap().take()
    }

    /// Wakes the cell's condition without settling it.
    pub(crate) fn notify(&self) {
        self.cond.notify_all();
    }

    /// Parks on this cell's condition until it leaves `Pending`, the
    /// budget runs out or the token fires.
    ///
    /// The caller passes (and gets back) the owning synchronizer's monitor
    /// guard; the timeout and cancellation outcomes are only reported
    /// after winning the give-up CAS, so a racing completion always wins.
    pub(crate) fn wait_while_pending<'a, S>(
        &self,
        mut guard: MutexGuard<'a, S>,
        budget: &WaitBudget,
        cancel: Option<&CancelToken>,
    ) -> (MutexGuard<'a, S>, WaitOutcome) {
        loop {
            if !self.is_pending() {
                return (guard, WaitOutcome::Settled);
            }
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    let won = self.try_abandon();
                    let outcome = if won {
                        WaitOutcome::Cancelled
                    } else {
                        WaitOutcome::Settled
                    };
                    return (guard, outcome);
                }
            }
            match budget.remaining() {
                None => {
                    guard = self.cond.wait(guard).unwrap();
                }
                Some(rem) if rem.is_zero() => {
                    let won = self.try_abandon();
                    let outcome = if won {
                        WaitOutcome::TimedOut
                    } else {
                        WaitOutcome::Settled
                    };
                    return (guard, outcome);
                }
                Some(rem) => {
                    let (next, _) = self.cond.wait_timeout(guard, rem).unwrap();
                    guard = next;
                }
            }
        }
    }
}

/// Removes one record from a registration queue by identity.
pub(crate) fn remove_by_identity<T>(
    queue: &mut std::collections::VecDeque<Arc<WaitCell<T>>>,
    cell: &Arc<WaitCell<T>>,
) {
    if let Some(position) = queue.iter().position(|queued| Arc::ptr_eq(queued, cell)) {
        queue.remove(position);
    }
}
