// Bounded worker pool with demand-driven growth and keep-alive decay:
// a submission reuses an idle worker when one is parked, spawns a new
// worker while the pool is below its bound, and otherwise parks until a
// worker frees up. Workers that stay idle past the keep-alive retire, so
// a quiet pool drains back to zero threads.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use crate::errors::PoolError;
use crate::signals::CancelToken;
use crate::timing::Wait;
use crate::waiters::{remove_by_identity, WaitCell, WaitOutcome};

/// Unit of work accepted by [`BoundedWorkerPool`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// A submitter parked with its task until a worker frees up.
type WorkRequest = WaitCell<Task>;

/// An idle worker parked until a submitter hands it a task.
type WorkerSeat = WaitCell<Task>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PoolState {
    Accepting,
    ShuttingDown,
    Terminated,
}

struct PoolInner {
    state: PoolState,
    live: usize,
    next_worker: u64,
    idle: VecDeque<Arc<WorkerSeat>>,
    pending: VecDeque<Arc<WorkRequest>>,
}

struct PoolShared {
    inner: Mutex<PoolInner>,
    termination: Condvar,
    keep_alive: Duration,
    max_pool_size: usize,
    stack_size: Option<usize>,
}

/// Thread pool bounded at `max_pool_size` workers.
///
/// Workers are spawned on demand and retire after sitting idle for the
/// keep-alive, so an unused pool holds no threads. Once every worker is
/// busy, [`BoundedWorkerPool::execute`] parks the submitter until a
/// worker frees up or the wait runs out. Clones share the pool.
pub struct BoundedWorkerPool {
    shared: Arc<PoolShared>,
}

impl Clone for BoundedWorkerPool {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl BoundedWorkerPool {
    /// # Panics
    ///
    /// Panics when `max_pool_size` is zero.
    #[must_use]
    pub fn new(max_pool_size: usize, keep_alive: Duration) -> Self {
        if max_pool_size == 0 {
            panic!("BoundedWorkerPool requires max_pool_size >= 1");
        }
        Self {
            shared: Arc::new(PoolShared {
                inner: Mutex::new(PoolInner {
                    state: PoolState::Accepting,
                    live: 0,
                    next_worker: 0,
                    idle: VecDeque::new(),
                    pending: VecDeque::new(),
                }),
                termination: Condvar::new(),
                keep_alive,
                max_pool_size,
                stack_size: None,
            }),
        }
    }

    /// Sets the stack size for worker threads. Call before the first
    /// submission; existing clones keep the pool shared afterwards.
    #[must_use]
    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        if let Some(shared) = Arc::get_mut(&mut self.shared) {
            shared.stack_size = Some(stack_size);
        }
        self
    }

    /// Submits `work`, blocking for at most `wait` when the pool is
    /// saturated.
    ///
    /// `Ok(true)` once a worker owns the task, `Ok(false)` when the wait
    /// ran out first.
    pub fn execute<F>(&self, work: F, wait: impl Into<Wait>) -> Result<bool, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(work), wait.into(), None)
    }

    /// [`BoundedWorkerPool::execute`] with a cancel token observed while
    /// parked.
    pub fn execute_with<F>(
        &self,
        work: F,
        wait: impl Into<Wait>,
        cancel: &CancelToken,
    ) -> Result<bool, PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit(Box::new(work), wait.into(), Some(cancel))
    }

    fn submit(&self, task: Task, wait: Wait, cancel: Option<&CancelToken>) -> Result<bool, PoolError> {
        let span = tracing::trace_span!("pool_submit");
        let _enter = span.enter();

        let budget = wait.budget();
        let mut task = task;
        let mut inner = self.shared.inner.lock().unwrap();

        if inner.state != PoolState::Accepting {
            return Err(PoolError::Rejected);
        }

        while let Some(seat) = inner.idle.pop_front() {
            match seat.try_complete(task) {
                Ok(()) => {
                    tracing::trace!("task handed to an idle worker");
                    return Ok(true);
                }
                // the seat's worker retired; skip the tombstone
                Err(back) => task = back,
            }
        }

        if inner.live < self.shared.max_pool_size {
            inner.live += 1;
            let id = inner.next_worker;
            inner.next_worker += 1;
            drop(inner);

            tracing::debug!(worker = id, "spawning a worker");
            if let Err(err) = spawn_worker(self.shared.clone(), id, task) {
                let mut inner = self.shared.inner.lock().unwrap();
                note_retirement(&self.shared, &mut inner);
                return Err(PoolError::Spawn(err));
            }
            return Ok(true);
        }

        let request = Arc::new(WaitCell::filled(task));
        inner.pending.push_back(request.clone());
        tracing::debug!(pending = inner.pending.len(), "pool saturated, submission parked");

        let _watch = cancel.map(|token| {
            let shared = self.shared.clone();
            let cell = request.clone();
            token.watch_fn(move || {
                let _guard = shared.inner.lock().unwrap();
                cell.notify();
            })
        });

        let (mut inner, outcome) = request.wait_while_pending(inner, &budget, cancel);
        match outcome {
            WaitOutcome::Settled => Ok(request.delivered()),
            WaitOutcome::TimedOut => {
                remove_by_identity(&mut inner.pending, &request);
                Ok(false)
            }
            WaitOutcome::Cancelled => {
                remove_by_identity(&mut inner.pending, &request);
                Err(PoolError::Cancelled)
            }
        }
    }

    /// Stops accepting work. Idempotent; parked submissions are left to
    /// time out and idle workers retire immediately.
    pub fn shut_down(&self) {
        let mut inner = self.shared.inner.lock().unwrap();
        begin_shutdown(&self.shared, &mut inner);
    }

    /// Shuts the pool down and blocks until every worker has retired or
    /// `wait` runs out. `Ok(true)` once terminated.
    pub fn await_termination(&self, wait: impl Into<Wait>) -> Result<bool, PoolError> {
        self.awaiting_termination(wait.into(), None)
    }

    /// [`BoundedWorkerPool::await_termination`] with a cancel token
    /// observed while parked.
    pub fn await_termination_with(
        &self,
        wait: impl Into<Wait>,
        cancel: &CancelToken,
    ) -> Result<bool, PoolError> {
        self.awaiting_termination(wait.into(), Some(cancel))
    }

    fn awaiting_termination(
        &self,
        wait: Wait,
        cancel: Option<&CancelToken>,
    ) -> Result<bool, PoolError> {
        let budget = wait.budget();

        let _watch = cancel.map(|token| {
            let shared = self.shared.clone();
            token.watch_fn(move || {
                let _guard = shared.inner.lock().unwrap();
                shared.termination.notify_all();
            })
        });

        let mut inner = self.shared.inner.lock().unwrap();
        begin_shutdown(&self.shared, &mut inner);

        loop {
            if inner.state == PoolState::Terminated {
                return Ok(true);
            }
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(PoolError::Cancelled);
                }
            }
            match budget.remaining() {
                None => {
                    inner = self.shared.termination.wait(inner).unwrap();
                }
                Some(rem) if rem.is_zero() => return Ok(false),
                Some(rem) => {
                    let (next, _) = self.shared.termination.wait_timeout(inner, rem).unwrap();
                    inner = next;
                }
            }
        }
    }

    /// Workers currently alive (busy or idle).
    #[must_use]
    pub fn live_workers(&self) -> usize {
        self.shared.inner.lock().unwrap().live
    }

    /// Workers currently parked awaiting a task.
    #[must_use]
    pub fn idle_workers(&self) -> usize {
        self.shared.inner.lock().unwrap().idle.len()
    }

    /// Submissions currently parked awaiting a worker.
    #[must_use]
    pub fn pending_work(&self) -> usize {
        self.shared.inner.lock().unwrap().pending.len()
    }

    /// True once shutdown completed and the last worker retired.
    #[must_use]
    pub fn is_terminated(&self) -> bool {
        self.shared.inner.lock().unwrap().state == PoolState::Terminated
    }
}

fn spawn_worker(shared: Arc<PoolShared>, id: u64, first: Task) -> std::io::Result<()> {
    let mut builder = thread::Builder::new().name(format!("pool-worker-{id}"));
    if let Some(stack_size) = shared.stack_size {
        builder = builder.stack_size(stack_size);
    }
    builder.spawn(move || worker_loop(shared, first))?;
    Ok(())
}

fn worker_loop(shared: Arc<PoolShared>, first: Task) {
    let mut task = Some(first);

    loop {
        if let Some(work) = task.take() {
            if panic::catch_unwind(AssertUnwindSafe(work)).is_err() {
                tracing::error!("task panicked, retiring its worker");
                let mut inner = shared.inner.lock().unwrap();
                note_retirement(&shared, &mut inner);
                return;
            }
        }

        let mut inner = shared.inner.lock().unwrap();
        'acquire: loop {
            while let Some(request) = inner.pending.pop_front() {
                // skip submissions that timed out or were cancelled
                if let Some(work) = request.try_claim() {
                    task = Some(work);
                    break 'acquire;
                }
            }

            if inner.state != PoolState::Accepting {
                note_retirement(&shared, &mut inner);
                return;
            }

            let seat = Arc::new(WaitCell::empty());
            inner.idle.push_back(seat.clone());

            let budget = Wait::For(shared.keep_alive).budget();
            let (next, outcome) = seat.wait_while_pending(inner, &budget, None);
            inner = next;
            match outcome {
                WaitOutcome::Settled => match seat.take() {
                    Some(work) => {
                        task = Some(work);
                        break 'acquire;
                    }
                    // a shutdown sweep abandoned the seat; loop back to
                    // observe the state change
                    None => {}
                },
                WaitOutcome::TimedOut => {
                    remove_by_identity(&mut inner.idle, &seat);
                    tracing::debug!("worker idle past keep-alive, retiring");
                    note_retirement(&shared, &mut inner);
                    return;
                }
                WaitOutcome::Cancelled => {
                    unreachable!("idle seats never watch a cancel token")
                }
            }
        }
        drop(inner);
    }
}

fn begin_shutdown(shared: &Arc<PoolShared>, inner: &mut MutexGuard<'_, PoolInner>) {
    if inner.state != PoolState::Accepting {
        return;
    }
    inner.state = PoolState::ShuttingDown;
    tracing::debug!(live = inner.live, "pool shutting down");

    // wake every idle worker so it can observe the state and retire
    while let Some(seat) = inner.idle.pop_front() {
        seat.try_abandon();
    }

    if inner.live == 0 {
        inner.state = PoolState::Terminated;
        shared.termination.notify_all();
    }
}

fn note_retirement(shared: &Arc<PoolShared>, inner: &mut MutexGuard<'_, PoolInner>) {
    inner.live -= 1;
    tracing::debug!(live = inner.live, "worker retired");
    if inner.live == 0 && inner.state == PoolState::ShuttingDown {
        inner.state = PoolState::Terminated;
        shared.termination.notify_all();
    }
}
