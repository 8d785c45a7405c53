// Keyed pairwise exchange: the first caller under a key parks with its
// value, the second swaps values with it, and the slot is gone the moment
// the pair settles so a third caller starts a fresh round.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use crate::errors::WaitError;
use crate::signals::CancelToken;
use crate::timing::Wait;
use crate::waiters::{WaitCell, WaitOutcome};

type SlotTable<K, V> = HashMap<K, Arc<WaitCell<V>>>;

/// Pairs callers off by key and swaps their values.
///
/// At most one slot lives under a key at a time; a slot that times out or
/// is cancelled removes itself, so it can never soak up a later partner's
/// value. Clones share the exchanger.
pub struct KeyedExchanger<K, V> {
    slots: Arc<Mutex<SlotTable<K, V>>>,
}

impl<K, V> Clone for KeyedExchanger<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: self.slots.clone(),
        }
    }
}

impl<K, V> Default for KeyedExchanger<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> KeyedExchanger<K, V>
where
    K: Eq + Hash + Clone + Send + 'static,
    V: Send + 'static,
{
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Offers `value` under `key` and blocks for a partner.
    ///
    /// `Ok(Some(theirs))` when a partner arrived within `wait`,
    /// `Ok(None)` on timeout.
    pub fn exchange(&self, key: K, value: V, wait: impl Into<Wait>) -> Result<Option<V>, WaitError> {
        self.exchanging(key, value, wait.into(), None)
    }

    /// [`KeyedExchanger::exchange`] with a cancel token observed while
    /// parked.
    pub fn exchange_with(
        &self,
        key: K,
        value: V,
        wait: impl Into<Wait>,
        cancel: &CancelToken,
    ) -> Result<Option<V>, WaitError> {
        self.exchanging(key, value, wait.into(), Some(cancel))
    }

    fn exchanging(
        &self,
        key: K,
        value: V,
        wait: Wait,
        cancel: Option<&CancelToken>,
    ) -> Result<Option<V>, WaitError> {
        let budget = wait.budget();
        let mut slots = self.slots.lock().unwrap();

        if let Some(occupant) = slots.remove(&key) {
            // second arrival: swap with the parked first arrival
            return match occupant.try_swap(value) {
                Ok(theirs) => {
                    tracing::trace!("paired with a parked exchanger slot");
                    Ok(Some(theirs))
                }
                Err(_) => unreachable!("slots in the table are always pending"),
            };
        }

        let slot = Arc::new(WaitCell::filled(value));
        slots.insert(key.clone(), slot.clone());

        let _watch = cancel.map(|token| {
            let table = self.slots.clone();
            let cell = slot.clone();
            token.watch_fn(move || {
                let _guard = table.lock().unwrap();
                cell.notify();
            })
        });

        let (mut slots, outcome) = slot.wait_while_pending(slots, &budget, cancel);
        match outcome {
            WaitOutcome::Settled => Ok(slot.take()),
            WaitOutcome::TimedOut => {
                slots.remove(&key);
                Ok(None)
            }
            WaitOutcome::Cancelled => {
                slots.remove(&key);
                Err(WaitError::Cancelled)
            }
        }
    }

    /// Callers currently parked awaiting a partner.
    #[must_use]
    pub fn waiting_slots(&self) -> usize {
        self.slots.lock().unwrap().len()
    }
}

#[cfg(test)]
mod test_keyed_exchanger {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn poll_with_no_partner_returns_nothing() {
        let exchanger: KeyedExchanger<&str, u32> = KeyedExchanger::new();
        assert_eq!(Ok(None), exchanger.exchange("k", 1, Wait::Poll));
        assert_eq!(0, exchanger.waiting_slots());
    }

    #[test]
    fn partners_swap_values_both_ways() {
        let exchanger = KeyedExchanger::new();

        let first = {
            let exchanger = exchanger.clone();
            thread::spawn(move || exchanger.exchange("k", 1, Duration::from_secs(5)))
        };

        while exchanger.waiting_slots() == 0 {
            thread::yield_now();
        }

        assert_eq!(Ok(Some(1)), exchanger.exchange("k", 2, Wait::Poll));
        assert_eq!(Ok(Some(2)), first.join().unwrap());
        assert_eq!(0, exchanger.waiting_slots());
    }

    #[test]
    fn keys_pair_independently() {
        let exchanger = KeyedExchanger::new();

        let left = {
            let exchanger = exchanger.clone();
            thread::spawn(move || exchanger.exchange("left", 10, Duration::from_secs(5)))
        };
        let right = {
            let exchanger = exchanger.clone();
            thread::spawn(move || exchanger.exchange("right", 20, Duration::from_secs(5)))
        };

        while exchanger.waiting_slots() < 2 {
            thread::yield_now();
        }

        assert_eq!(Ok(Some(20)), exchanger.exchange("right", 21, Wait::Poll));
        assert_eq!(Ok(Some(10)), exchanger.exchange("left", 11, Wait::Poll));
        assert_eq!(Ok(Some(11)), left.join().unwrap());
        assert_eq!(Ok(Some(21)), right.join().unwrap());
    }

    #[test]
    fn a_slot_serves_exactly_one_partner() {
        let exchanger = KeyedExchanger::new();

        let first = {
            let exchanger = exchanger.clone();
            thread::spawn(move || exchanger.exchange("k", 1, Duration::from_secs(5)))
        };

        while exchanger.waiting_slots() == 0 {
            thread::yield_now();
        }

        assert_eq!(Ok(Some(1)), exchanger.exchange("k", 2, Wait::Poll));
        first.join().unwrap().unwrap();

        // the pair is settled; a third caller starts a fresh round
        assert_eq!(Ok(None), exchanger.exchange("k", 3, Wait::Poll));
    }

    #[test]
    fn timeout_removes_the_slot() {
        let exchanger: KeyedExchanger<&str, u32> = KeyedExchanger::new();

        let start = Instant::now();
        assert_eq!(
            Ok(None),
            exchanger.exchange("k", 1, Duration::from_millis(80))
        );
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert_eq!(0, exchanger.waiting_slots());

        // a later caller must not swap with the expired slot
        assert_eq!(Ok(None), exchanger.exchange("k", 2, Wait::Poll));
    }

    #[test]
    fn cancel_token_unparks_and_removes_the_slot() {
        let exchanger: KeyedExchanger<&str, u32> = KeyedExchanger::new();
        let token = CancelToken::new();

        let first = {
            let exchanger = exchanger.clone();
            let token = token.clone();
            thread::spawn(move || exchanger.exchange_with("k", 1, Wait::Forever, &token))
        };

        while exchanger.waiting_slots() == 0 {
            thread::yield_now();
        }
        token.cancel();

        assert_eq!(Err(WaitError::Cancelled), first.join().unwrap());
        assert_eq!(0, exchanger.waiting_slots());
    }

    #[test]
    fn completion_beats_a_racing_cancel_token() {
        let exchanger = KeyedExchanger::new();
        let token = CancelToken::new();

        let first = {
            let exchanger = exchanger.clone();
            thread::spawn(move || exchanger.exchange("k", 1, Duration::from_secs(5)))
        };

        while exchanger.waiting_slots() == 0 {
            thread::yield_now();
        }

        // the fired token loses to the partner already in the table
        token.cancel();
        assert_eq!(
            Ok(Some(1)),
            exchanger.exchange_with("k", 2, Wait::Forever, &token)
        );
        assert_eq!(Ok(Some(2)), first.join().unwrap());
    }

    #[test]
    fn many_pairs_under_one_key_all_swap() {
        const PAIRS: usize = 8;
        let exchanger = KeyedExchanger::new();

        let callers: Vec<_> = (0..PAIRS * 2)
            .map(|caller| {
                let exchanger = exchanger.clone();
                thread::spawn(move || {
                    exchanger
                        .exchange("k", caller, Duration::from_secs(10))
                        .unwrap()
                        .unwrap()
                })
            })
            .collect();

        let mut received = std::collections::HashSet::new();
        for caller in callers {
            assert!(received.insert(caller.join().unwrap()));
        }
        assert_eq!(PAIRS * 2, received.len());
    }
}
