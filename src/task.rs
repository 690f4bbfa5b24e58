//! Concurrent unit-of-work lifecycle
//!
//! A [`Task`] moves through `Pending → Executing → Finished` at most once,
//! with an independent cancellation flag. [`Task::finish`] may be called any
//! number of times from any thread, including before [`Task::start`]; exactly
//! one caller wins and runs the [`Task::will_finish`] hook.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::progress::ProgressSource;

const PENDING: u8 = 0;
const EXECUTING: u8 = 1;
const FINISHED: u8 = 2;

/// Lifecycle position of a task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Created but not started
    Pending,
    /// Started and doing work
    Executing,
    /// Done, successfully or not
    Finished,
}

type FinishObserver = Box<dyn FnOnce() + Send + 'static>;

/// Thread-safe lifecycle state embedded in every task.
pub struct TaskState {
    phase: AtomicU8,
    cancelled: AtomicBool,
    start_claimed: AtomicBool,
    finishing: AtomicBool,
    observers: Mutex<Vec<FinishObserver>>,
    finished: Condvar,
}

impl TaskState {
    /// Create a state in `Pending`
    pub fn new() -> Self {
        Self {
            phase: AtomicU8::new(PENDING),
            cancelled: AtomicBool::new(false),
            start_claimed: AtomicBool::new(false),
            finishing: AtomicBool::new(false),
            observers: Mutex::new(Vec::new()),
            finished: Condvar::new(),
        }
    }

    /// Current lifecycle position
    pub fn status(&self) -> TaskStatus {
        match self.phase.load(Ordering::Acquire) {
            PENDING => TaskStatus::Pending,
            EXECUTING => TaskStatus::Executing,
            _ => TaskStatus::Finished,
        }
    }

    /// `true` while the task is executing
    pub fn is_executing(&self) -> bool {
        self.phase.load(Ordering::Acquire) == EXECUTING
    }

    /// `true` once the task has finished
    pub fn is_finished(&self) -> bool {
        self.phase.load(Ordering::Acquire) == FINISHED
    }

    /// `true` once cancellation has been requested
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Whether `start` has been called
    pub fn is_started(&self) -> bool {
        self.start_claimed.load(Ordering::Acquire)
    }

    /// Run `observer` once the task has finished, immediately if it already has.
    pub fn on_finished<F>(&self, observer: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let mut observers = self.lock_observers();
        if self.is_finished() {
            drop(observers);
            observer();
        } else {
            observers.push(Box::new(observer));
        }
    }

    /// Block the calling thread until the task has finished.
    pub fn wait_until_finished(&self) {
        let mut guard = self.lock_observers();
        while !self.is_finished() {
            guard = self
                .finished
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn claim_start(&self) -> bool {
        !self.start_claimed.swap(true, Ordering::AcqRel)
    }

    fn begin_executing(&self) -> bool {
        if self
            .phase
            .compare_exchange(PENDING, EXECUTING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        // a finish claimed before this point wins and the work never runs
        !self.finishing.load(Ordering::SeqCst)
    }

    fn mark_cancelled(&self) -> bool {
        !self.cancelled.swap(true, Ordering::AcqRel)
    }

    fn begin_finishing(&self) -> bool {
        self.finishing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    fn complete(&self) {
        let observers = {
            let mut observers = self.lock_observers();
            self.phase.store(FINISHED, Ordering::Release);
            std::mem::take(&mut *observers)
        };
        self.finished.notify_all();

        for observer in observers {
            observer();
        }
    }

    fn lock_observers(&self) -> MutexGuard<'_, Vec<FinishObserver>> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for TaskState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskState")
            .field("status", &self.status())
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// An asynchronous unit of work with an explicit lifecycle.
///
/// Implementors embed a [`TaskState`] and provide [`Task::execute`], which
/// begins the work and must eventually lead to [`Task::finish`]. The provided
/// methods implement the thread-safe start/cancel/finish protocol and should
/// not be overridden.
pub trait Task: Send + Sync + 'static {
    /// The embedded lifecycle state
    fn task_state(&self) -> &TaskState;

    /// Begin the work. Called at most once, after the task became `Executing`.
    fn execute(self: Arc<Self>);

    /// Called once, by whichever thread wins the race to finish, just before
    /// the task flips to `Finished`.
    fn will_finish(&self) {}

    /// Called once, right after the cancellation flag is first set on a task
    /// that has not finished.
    fn did_cancel(&self) {}

    /// Byte counters exposed for queue aggregation, if any.
    fn progress_source(&self) -> Option<&dyn ProgressSource> {
        None
    }

    /// Start the task. Subsequent calls are no-ops.
    fn start(self: Arc<Self>) {
        if !self.task_state().claim_start() {
            return;
        }
        if self.task_state().is_cancelled() {
            self.finish();
            return;
        }
        if !self.task_state().begin_executing() {
            // finished before it was started
            return;
        }
        self.execute();
    }

    /// Start the task and block until it has finished, whichever thread
    /// performs the work.
    fn start_and_wait_until_finished(self: Arc<Self>) {
        let waiter = Arc::clone(&self);
        self.start();
        waiter.task_state().wait_until_finished();
    }

    /// Request cancellation. Safe from any thread in any state.
    fn cancel(&self) {
        if self.task_state().is_finished() {
            return;
        }
        if self.task_state().mark_cancelled() {
            self.did_cancel();
        }
    }

    /// Finish the task. Idempotent and safe from any thread at any time.
    fn finish(&self) {
        if !self.task_state().begin_finishing() {
            return;
        }
        self.will_finish();
        self.task_state().complete();
    }

    /// Current lifecycle position
    fn status(&self) -> TaskStatus {
        self.task_state().status()
    }

    /// `true` while executing
    fn is_executing(&self) -> bool {
        self.task_state().is_executing()
    }

    /// `true` once finished
    fn is_finished(&self) -> bool {
        self.task_state().is_finished()
    }

    /// `true` once cancellation was requested
    fn is_cancelled(&self) -> bool {
        self.task_state().is_cancelled()
    }
}
