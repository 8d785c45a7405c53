// Rendezvous mailboxes: a send parks until some receive claims its
// message, a receive parks until some send offers one, and each message
// moves from exactly one sender to exactly one receiver.
//
// Two renditions share one surface. [`Mailbox`] serializes everything
// under a single monitor; [`OptimisticMailbox`] publishes registrations
// through lock-free queues and only takes its monitor to park or to
// resolve a race.

mod monitor;
mod optimistic;

pub use monitor::Mailbox;
pub use optimistic::OptimisticMailbox;

use std::sync::Arc;

use crate::errors::WaitError;
use crate::signals::CancelToken;
use crate::timing::Wait;
use crate::waiters::WaitCell;

/// A sender's parked registration: the message rides in the cell until a
/// receiver claims it.
pub(crate) type PendingMessage<T> = WaitCell<T>;

/// A receiver's parked registration: a sender completes the cell with its
/// message.
pub(crate) type ReceiverTicket<T> = WaitCell<T>;

/// How a mailbox flavor lets a [`SendHandle`] wait on and retract its
/// registration.
pub(crate) trait SendBackend<T>: Send + Sync {
    /// Parks until the message is claimed, the wait runs out or the token
    /// fires. `Ok(true)` means delivered.
    fn await_delivery(
        &self,
        message: &Arc<PendingMessage<T>>,
        wait: Wait,
        cancel: Option<&CancelToken>,
    ) -> Result<bool, WaitError>;

    /// Drops the registration from the mailbox's bookkeeping after the
    /// cell has been abandoned.
    fn forget_message(&self, message: &Arc<PendingMessage<T>>);
}

/// Tracks one message handed to a mailbox.
///
/// The handle observes delivery ([`SendHandle::is_sent`]), blocks for it
/// ([`SendHandle::await_sent`]) and can retract the message while no
/// receiver has claimed it ([`SendHandle::try_cancel`]).
pub struct SendHandle<T> {
    message: Arc<PendingMessage<T>>,
    backend: Option<Arc<dyn SendBackend<T>>>,
}

impl<T> SendHandle<T> {
    /// Handle for a message parked in the mailbox.
    pub(crate) fn parked(
        message: Arc<PendingMessage<T>>,
        backend: Arc<dyn SendBackend<T>>,
    ) -> Self {
        Self {
            message,
            backend: Some(backend),
        }
    }

    /// Handle for a message a receiver took on the spot.
    pub(crate) fn already_sent() -> Self {
        Self {
            message: Arc::new(WaitCell::settled()),
            backend: None,
        }
    }

    /// True once a receiver has claimed the message.
    #[must_use]
    pub fn is_sent(&self) -> bool {
        self.message.delivered()
    }

    /// Retracts the message; false when a receiver already claimed it (or
    /// it was retracted before).
    pub fn try_cancel(&self) -> bool {
        if !self.message.try_abandon() {
            return false;
        }
        if let Some(backend) = &self.backend {
            backend.forget_message(&self.message);
        }
        true
    }

    /// Blocks until the message is delivered or `wait` runs out.
    ///
    /// `Ok(true)` when delivered, `Ok(false)` on timeout. A message
    /// already delivered (or already retracted) resolves immediately.
    pub fn await_sent(&self, wait: impl Into<Wait>) -> Result<bool, WaitError> {
        self.awaiting(wait.into(), None)
    }

    /// [`SendHandle::await_sent`] with a cancel token observed while
    /// parked.
    pub fn await_sent_with(
        &self,
        wait: impl Into<Wait>,
        cancel: &CancelToken,
    ) -> Result<bool, WaitError> {
        self.awaiting(wait.into(), Some(cancel))
    }

    fn awaiting(&self, wait: Wait, cancel: Option<&CancelToken>) -> Result<bool, WaitError> {
        if self.message.delivered() {
            return Ok(true);
        }
        match &self.backend {
            Some(backend) => backend.await_delivery(&self.message, wait, cancel),
            // no backend means the message settled at send time
            None => Ok(true),
        }
    }
}
