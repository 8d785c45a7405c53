// Optimistic mailbox: registrations are published through lock-free
// queues so the fast path (a peer is already waiting) never takes the
// monitor at all. The monitor only serializes parking and the
// double-check that closes the race where both sides publish without
// seeing each other.
//
// Settled registrations stay behind in the queues as tombstones; the
// opposite side skips them lazily because claiming or completing a
// tombstone fails its state CAS.

use std::sync::{Arc, Mutex};

use crate::errors::WaitError;
use crate::queue::LockFreeQueue;
use crate::signals::CancelToken;
use crate::timing::Wait;
use crate::waiters::{WaitCell, WaitOutcome};

use super::{PendingMessage, ReceiverTicket, SendBackend, SendHandle};

struct OptimisticShared<T> {
    // Arc'd so cancel wakers can capture the monitor on its own.
    monitor: Arc<Mutex<()>>,
    pending: LockFreeQueue<Arc<PendingMessage<T>>>,
    waiting: LockFreeQueue<Arc<ReceiverTicket<T>>>,
}

/// Rendezvous mailbox with lock-free registration queues.
///
/// Same contract as [`crate::Mailbox`]: each message moves from exactly
/// one sender to exactly one receiver, and either side parks until the
/// other arrives. Clones share the mailbox.
pub struct OptimisticMailbox<T> {
    shared: Arc<OptimisticShared<T>>,
}

impl<T> Clone for OptimisticMailbox<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Default for OptimisticMailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> OptimisticMailbox<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(OptimisticShared {
                monitor: Arc::new(Mutex::new(())),
                pending: LockFreeQueue::new(),
                waiting: LockFreeQueue::new(),
            }),
        }
    }

    /// Offers `value` to the mailbox without blocking.
    ///
    /// Completes the oldest live receiver ticket when one is published;
    /// otherwise parks the message and returns a handle tracking its
    /// delivery.
    pub fn send(&self, value: T) -> SendHandle<T> {
        let mut value = value;
        loop {
            while let Some(ticket) = self.shared.waiting.try_remove() {
                let _guard = self.shared.monitor.lock().unwrap();
                match ticket.try_complete(value) {
                    Ok(()) => {
                        tracing::trace!("message handed to a published ticket");
                        return SendHandle::already_sent();
                    }
                    Err(back) => value = back,
                }
            }

            let message = Arc::new(WaitCell::filled(value));
            self.shared.pending.put(message.clone());

            if self.shared.waiting.is_empty() {
                return SendHandle::parked(message, self.shared.clone());
            }

            // a receiver published a ticket after our scan and may have
            // missed this message; retract it and retry against the
            // ticket, unless that receiver claimed it already
            let _guard = self.shared.monitor.lock().unwrap();
            match message.try_claim() {
                Some(retracted) => value = retracted,
                None => return SendHandle::parked(message, self.shared.clone()),
            }
        }
    }

    /// Blocks until a message arrives or `wait` runs out.
    ///
    /// `Ok(Some(value))` on delivery, `Ok(None)` on timeout.
    pub fn receive(&self, wait: impl Into<Wait>) -> Result<Option<T>, WaitError> {
        self.receiving(wait.into(), None)
    }

    /// [`OptimisticMailbox::receive`] with a cancel token observed while
    /// parked.
    pub fn receive_with(
        &self,
        wait: impl Into<Wait>,
        cancel: &CancelToken,
    ) -> Result<Option<T>, WaitError> {
        self.receiving(wait.into(), Some(cancel))
    }

    fn receiving(&self, wait: Wait, cancel: Option<&CancelToken>) -> Result<Option<T>, WaitError> {
        let budget = wait.budget();

        let ticket = loop {
            while let Some(message) = self.shared.pending.try_remove() {
                let _guard = self.shared.monitor.lock().unwrap();
                if let Some(value) = message.try_claim() {
                    tracing::trace!("claimed a published message");
                    return Ok(Some(value));
                }
            }

            let ticket = Arc::new(WaitCell::empty());
            self.shared.waiting.put(ticket.clone());

            if self.shared.pending.is_empty() {
                break ticket;
            }

            // a sender published a message after our scan and may have
            // missed this ticket; retract the ticket and rescan, unless
            // that sender completed it already
            let guard = self.shared.monitor.lock().unwrap();
            if ticket.try_abandon() {
                drop(guard);
                continue;
            }
            return Ok(ticket.take());
        };

        let _watch = cancel.map(|token| {
            let monitor = self.shared.monitor.clone();
            let cell = ticket.clone();
            token.watch_fn(move || {
                let _guard = monitor.lock().unwrap();
                cell.notify();
            })
        });

        let guard = self.shared.monitor.lock().unwrap();
        let (_guard, outcome) = ticket.wait_while_pending(guard, &budget, cancel);
        match outcome {
            WaitOutcome::Settled => Ok(ticket.take()),
            // the abandoned ticket stays queued as a tombstone
            WaitOutcome::TimedOut => Ok(None),
            WaitOutcome::Cancelled => Err(WaitError::Cancelled),
        }
    }
}

impl<T: Send + 'static> SendBackend<T> for OptimisticShared<T> {
    fn await_delivery(
        &self,
        message: &Arc<PendingMessage<T>>,
        wait: Wait,
        cancel: Option<&CancelToken>,
    ) -> Result<bool, WaitError> {
        let budget = wait.budget();

        let _watch = cancel.map(|token| {
            let monitor = self.monitor.clone();
            let cell = message.clone();
            token.watch_fn(move || {
                let _guard = monitor.lock().unwrap();
                cell.notify();
            })
        });

        let guard = self.monitor.lock().unwrap();
        let (_guard, outcome) = message.wait_while_pending(guard, &budget, cancel);
        match outcome {
            WaitOutcome::Settled => Ok(message.delivered()),
            // the abandoned message stays queued as a tombstone
            WaitOutcome::TimedOut => Ok(false),
            WaitOutcome::Cancelled => Err(WaitError::Cancelled),
        }
    }

    fn forget_message(&self, _message: &Arc<PendingMessage<T>>) {
        // retracted messages are skipped lazily by receivers
    }
}

#[cfg(test)]
mod test_optimistic_mailbox {
    use super::*;
    use std::thread;
    use std::time::{Duration, Instant};

    #[test]
    fn receive_polls_empty_without_blocking() {
        let mailbox: OptimisticMailbox<u32> = OptimisticMailbox::new();
        assert_eq!(Ok(None), mailbox.receive(Wait::Poll));
    }

    #[test]
    fn send_then_receive_hands_over_the_message() {
        let mailbox = OptimisticMailbox::new();
        let handle = mailbox.send(11);
        assert!(!handle.is_sent());

        assert_eq!(Ok(Some(11)), mailbox.receive(Wait::Poll));
        assert!(handle.is_sent());
        assert_eq!(Ok(true), handle.await_sent(Wait::Poll));
        assert_eq!(Ok(None), mailbox.receive(Wait::Poll));
    }

    #[test]
    fn messages_arrive_in_send_order() {
        let mailbox = OptimisticMailbox::new();
        let _a = mailbox.send("a");
        let _b = mailbox.send("b");

        assert_eq!(Ok(Some("a")), mailbox.receive(Wait::Poll));
        assert_eq!(Ok(Some("b")), mailbox.receive(Wait::Poll));
    }

    #[test]
    fn receiver_parked_first_gets_the_message() {
        let mailbox = OptimisticMailbox::new();

        let receiver = {
            let mailbox = mailbox.clone();
            thread::spawn(move || mailbox.receive(Duration::from_secs(5)))
        };

        thread::sleep(Duration::from_millis(60));
        let handle = mailbox.send(77);

        assert_eq!(Ok(Some(77)), receiver.join().unwrap());
        assert_eq!(Ok(true), handle.await_sent(Duration::from_secs(5)));
    }

    #[test]
    fn receive_times_out_and_later_sends_still_work() {
        let mailbox: OptimisticMailbox<u32> = OptimisticMailbox::new();
        let start = Instant::now();
        assert_eq!(Ok(None), mailbox.receive(Duration::from_millis(80)));
        assert!(start.elapsed() >= Duration::from_millis(80));

        // the timed-out ticket must not swallow this message
        let _handle = mailbox.send(4);
        assert_eq!(Ok(Some(4)), mailbox.receive(Wait::Poll));
    }

    #[test]
    fn cancelled_send_is_invisible_to_receivers() {
        let mailbox = OptimisticMailbox::new();
        let handle = mailbox.send(1);

        assert!(handle.try_cancel());
        assert!(!handle.try_cancel());
        assert_eq!(Ok(None), mailbox.receive(Wait::Poll));
        assert_eq!(Ok(false), handle.await_sent(Wait::Poll));
    }

    #[test]
    fn await_sent_times_out_and_retracts() {
        let mailbox = OptimisticMailbox::new();
        let handle = mailbox.send(3);

        assert_eq!(Ok(false), handle.await_sent(Duration::from_millis(60)));
        assert_eq!(Ok(None), mailbox.receive(Wait::Poll));
    }

    #[test]
    fn cancel_token_unparks_a_receiver() {
        let mailbox: OptimisticMailbox<u32> = OptimisticMailbox::new();
        let token = CancelToken::new();

        let receiver = {
            let mailbox = mailbox.clone();
            let token = token.clone();
            thread::spawn(move || mailbox.receive_with(Wait::Forever, &token))
        };

        thread::sleep(Duration::from_millis(60));
        token.cancel();

        assert_eq!(Err(WaitError::Cancelled), receiver.join().unwrap());
    }

    #[test]
    fn delivery_beats_a_racing_cancel_token() {
        let mailbox = OptimisticMailbox::new();
        let token = CancelToken::new();
        token.cancel();

        let _handle = mailbox.send(8);
        assert_eq!(Ok(Some(8)), mailbox.receive_with(Wait::Forever, &token));
        assert!(token.is_cancelled());
    }

    #[test]
    fn concurrent_senders_and_receivers_deliver_each_message_once() {
        const SIDES: usize = 4;
        const PER_SIDE: usize = 50;

        let mailbox = OptimisticMailbox::new();

        let senders: Vec<_> = (0..SIDES)
            .map(|sender| {
                let mailbox = mailbox.clone();
                thread::spawn(move || {
                    for seq in 0..PER_SIDE {
                        let handle = mailbox.send(sender * 1000 + seq);
                        handle.await_sent(Duration::from_secs(10)).unwrap();
                    }
                })
            })
            .collect();

        let receivers: Vec<_> = (0..SIDES)
            .map(|_| {
                let mailbox = mailbox.clone();
                thread::spawn(move || {
                    let mut taken = Vec::new();
                    for _ in 0..PER_SIDE {
                        let value = mailbox.receive(Duration::from_secs(10)).unwrap();
                        taken.push(value.unwrap());
                    }
                    taken
                })
            })
            .collect();

        for sender in senders {
            sender.join().unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        for receiver in receivers {
            for value in receiver.join().unwrap() {
                assert!(seen.insert(value), "message {value} delivered twice");
            }
        }
        assert_eq!(SIDES * PER_SIDE, seen.len());
    }
}
