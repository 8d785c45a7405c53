// Failure taxonomy shared by the synchronizers. Timeouts are values
// (`Ok(None)` / `Ok(false)`), never errors: a timed-out caller simply got
// no result, whereas the variants below are real failures.

use thiserror::Error;

/// Failure of a blocking wait on a mailbox or exchanger.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The wait's cancel token fired before the operation completed.
    #[error("wait cancelled before the operation completed")]
    Cancelled,
}

/// Failure raised by [`crate::BoundedWorkerPool`] operations.
#[derive(Error, Debug)]
pub enum PoolError {
    /// Work was submitted after shutdown began.
    #[error("pool is shutting down and no longer accepts work")]
    Rejected,

    /// The caller's cancel token fired before the operation completed.
    #[error("wait cancelled before the operation completed")]
    Cancelled,

    /// The host runtime refused to start a worker thread.
    #[error("failed to spawn a worker thread: {0}")]
    Spawn(#[from] std::io::Error),
}
