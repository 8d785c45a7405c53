// Deadline accounting for blocking operations, measured against a
// monotonic clock so wall-clock adjustments cannot skew a wait.

use std::time::{Duration, Instant};

/// How long a blocking operation is willing to wait.
///
/// Mirrors the classic signed-timeout convention: negative waits forever,
/// zero polls without blocking, positive bounds the wait.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Wait {
    /// Block until the operation completes.
    Forever,
    /// Do not block: observe the current state once and return.
    Poll,
    /// Block for at most the given duration.
    For(Duration),
}

impl Wait {
    /// Maps the signed-milliseconds convention onto [`Wait`].
    #[must_use]
    pub fn from_millis(millis: i64) -> Self {
        match millis {
            m if m < 0 => Wait::Forever,
            0 => Wait::Poll,
            m => Wait::For(Duration::from_millis(m as u64)),
        }
    }

    /// Derives the per-call budget for this wait.
    #[must_use]
    pub fn budget(self) -> WaitBudget {
        WaitBudget::new(self)
    }
}

impl From<Duration> for Wait {
    fn from(dur: Duration) -> Self {
        Wait::For(dur)
    }
}

/// A deadline derived once per blocking call.
///
/// Callers re-query [`WaitBudget::remaining`] after every wake-up to decide
/// whether to fail with a timeout rather than block again. Unbounded
/// budgets never expire.
#[derive(Clone, Copy, Debug)]
pub struct WaitBudget {
    deadline: Option<Instant>,
}

impl WaitBudget {
    #[must_use]
    pub fn new(wait: Wait) -> Self {
        let deadline = match wait {
            Wait::Forever => None,
            Wait::Poll => Some(Instant::now()),
            // a deadline past the end of the clock saturates to unbounded
            Wait::For(dur) => Instant::now().checked_add(dur),
        };
        Self { deadline }
    }

    /// False for waits that never expire.
    #[must_use]
    pub fn is_bounded(&self) -> bool {
        self.deadline.is_some()
    }

    /// Time left until the deadline; `None` for unbounded budgets.
    #[must_use]
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|when| when.saturating_duration_since(Instant::now()))
    }

    /// True once a bounded budget has run out.
    #[must_use]
    pub fn expired(&self) -> bool {
        matches!(self.remaining(), Some(rem) if rem.is_zero())
    }
}
