// Monitor-based mailbox: one mutex guards both registration queues, and
// every parked side sleeps on its own cell's condition variable so a
// completion wakes exactly the thread it is for.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::errors::WaitError;
use crate::signals::CancelToken;
use crate::timing::Wait;
use crate::waiters::{remove_by_identity, WaitCell, WaitOutcome};

use super::{PendingMessage, ReceiverTicket, SendBackend, SendHandle};

struct MailboxInner<T> {
    pending: VecDeque<Arc<PendingMessage<T>>>,
    waiting: VecDeque<Arc<ReceiverTicket<T>>>,
}

struct MonitorShared<T> {
    // Arc'd so cancel wakers can capture the monitor independently of
    // the mailbox handle's lifetime.
    inner: Arc<Mutex<MailboxInner<T>>>,
}

/// Rendezvous mailbox serialized under a single monitor.
///
/// [`Mailbox::send`] parks the calling thread's message until a receiver
/// claims it; [`Mailbox::receive`] parks until a sender offers one. Clones
/// share the mailbox.
pub struct Mailbox<T> {
    shared: Arc<MonitorShared<T>>,
}

impl<T> Clone for Mailbox<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Default for Mailbox<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Mailbox<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MonitorShared {
                inner: Arc::new(Mutex::new(MailboxInner {
                    pending: VecDeque::new(),
                    waiting: VecDeque::new(),
                })),
            }),
        }
    }

    /// Offers `value` to the mailbox.
    ///
    /// Hands the value to the oldest live receiver ticket when one is
    /// waiting; otherwise parks the message and returns a handle tracking
    /// its delivery. Never blocks.
    pub fn send(&self, value: T) -> SendHandle<T> {
        let mut value = value;
        let mut inner = self.shared.inner.lock().unwrap();

        while let Some(ticket) = inner.waiting.pop_front() {
            match ticket.try_complete(value) {
                Ok(()) => {
                    tracing::trace!("message handed to a waiting receiver");
                    return SendHandle::already_sent();
                }
                // the ticket's owner gave up; skip the tombstone
                Err(back) => value = back,
            }
        }

        let message = Arc::new(WaitCell::filled(value));
        inner.pending.push_back(message.clone());
        tracing::trace!(pending = inner.pending.len(), "message parked");
        SendHandle::parked(message, self.shared.clone())
    }

    /// Blocks until a message arrives or `wait` runs out.
    ///
    /// `Ok(Some(value))` on delivery, `Ok(None)` on timeout.
    pub fn receive(&self, wait: impl Into<Wait>) -> Result<Option<T>, WaitError> {
        self.receiving(wait.into(), None)
    }

    /// [`Mailbox::receive`] with a cancel token observed while parked.
    pub fn receive_with(
        &self,
        wait: impl Into<Wait>,
        cancel: &CancelToken,
    ) -> Result<Option<T>, WaitError> {
        self.receiving(wait.into(), Some(cancel))
    }

    fn receiving(&self, wait: Wait, cancel: Option<&CancelToken>) -> Result<Option<T>, WaitError> {
        let budget = wait.budget();
        let mut inner = self.shared.inner.lock().unwrap();

        while let Some(message) = inner.pending.pop_front() {
            // skip messages whose senders retracted them
            if let Some(value) = message.try_claim() {
                tracing::trace!("claimed a parked message");
                return Ok(Some(value));
            }
        }

        let ticket = Arc::new(WaitCell::empty());
        inner.waiting.push_back(ticket.clone());

        let _watch = cancel.map(|token| {
            let monitor = self.shared.inner.clone();
            let cell = ticket.clone();
            token.watch_fn(move || {
                let _guard = monitor.lock().unwrap();
                cell.notify();
            })
        });

        let (mut inner, outcome) = ticket.wait_while_pending(inner, &budget, cancel);
        match outcome {
            WaitOutcome::Settled => Ok(ticket.take()),
            WaitOutcome::TimedOut => {
                remove_by_identity(&mut inner.waiting, &ticket);
                Ok(None)
            }
            WaitOutcome::Cancelled => {
                remove_by_identity(&mut inner.waiting, &ticket);
                Err(WaitError::Cancelled)
            }
        }
    }

    /// Messages currently parked awaiting a receiver.
    #[must_use]
    pub fn pending_messages(&self) -> usize {
        self.shared.inner.lock().unwrap().pending.len()
    }

    /// Receivers currently parked awaiting a message.
    #[must_use]
    pub fn waiting_receivers(&self) -> usize {
        self.shared.inner.lock().unwrap().waiting.len()
    }
}

impl<T: Send + 'static> SendBackend<T> for MonitorShared<T> {
    fn await_delivery(
        &self,
        message: &Arc<PendingMessage<T>>,
        wait: Wait,
        cancel: Option<&CancelToken>,
    ) -> Result<bool, WaitError> {
        let budget = wait.budget();

        let _watch = cancel.map(|token| {
            let monitor = self.inner.clone();
            let cell = message.clone();
            token.watch_fn(move || {
                let _guard = monitor.lock().unwrap();
                cell.notify();
            })
        });

        let inner = self.inner.lock().unwrap();
        let (mut inner, outcome) = message.wait_while_pending(inner, &budget, cancel);
        match outcome {
            WaitOutcome::Settled => Ok(message.delivered()),
            WaitOutcome::TimedOut => {
                remove_by_identity(&mut inner.pending, message);
                Ok(false)
            }
            WaitOutcome::Cancelled => {
                remove_by_identity(&mut inner.pending, message);
                Err(WaitError::Cancelled)
            }
        }
    }

    fn forget_message(&self, message: &Arc<PendingMessage<T>>) {
        let mut inner = self.inner.lock().unwrap();
        remove_by_identity(&mut inner.pending, message);
    }
}
