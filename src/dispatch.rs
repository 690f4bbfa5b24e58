//! Ordered delivery of callback jobs
//!
//! Every [`HttpOperation`](crate::HttpOperation) and
//! [`OperationQueue`](crate::OperationQueue) owns a [`SerialQueue`]; callbacks
//! posted to it run one at a time, in posting order, on a dedicated thread.
//! Alternatively callbacks can be funnelled through the process-wide
//! [`MainQueue`], whose executor a host application may point at its UI
//! thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Arc, Mutex, OnceLock, PoisonError, RwLock};
use std::thread;

/// A unit of work posted to a queue
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Host-provided runner for main queue jobs; must run jobs in the order given.
pub type Executor = Arc<dyn Fn(Job) + Send + Sync + 'static>;

/// Runs jobs one after another on a lazily spawned thread.
///
/// The thread exits once the queue is dropped and every posted job has run.
/// A panicking job is logged and does not stop later ones.
pub struct SerialQueue {
    label: String,
    sender: Mutex<Option<mpsc::Sender<Job>>>,
}

impl SerialQueue {
    /// Create a queue whose thread will carry `label` as its name
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            sender: Mutex::new(None),
        }
    }

    /// Name given to the queue's thread
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Post `job` behind every job posted before it.
    pub fn dispatch(&self, job: Job) {
        let rejected = {
            let mut sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
            let job = match sender.as_ref() {
                Some(tx) => match tx.send(job) {
                    Ok(()) => return,
                    Err(mpsc::SendError(job)) => job,
                },
                None => job,
            };

            match self.spawn_thread() {
                Ok(tx) => {
                    let sent = tx.send(job);
                    *sender = Some(tx);
                    match sent {
                        Ok(()) => return,
                        Err(mpsc::SendError(job)) => job,
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to spawn dispatch thread {}: {}", self.label, e);
                    job
                }
            }
        };

        // no thread to run it on
        run_job(&self.label, rejected);
    }

    /// Post a closure
    pub fn dispatch_fn<F>(&self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispatch(Box::new(f));
    }

    fn spawn_thread(&self) -> std::io::Result<mpsc::Sender<Job>> {
        let (tx, rx) = mpsc::channel::<Job>();
        let label = self.label.clone();
        thread::Builder::new()
            .name(self.label.clone())
            .spawn(move || {
                for job in rx {
                    run_job(&label, job);
                }
                tracing::trace!("Dispatch thread {} exiting", label);
            })?;
        tracing::trace!("Spawned dispatch thread {}", self.label);
        Ok(tx)
    }
}

impl std::fmt::Debug for SerialQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialQueue")
            .field("label", &self.label)
            .finish()
    }
}

fn run_job(label: &str, job: Job) {
    if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
        tracing::warn!("Callback on {} panicked", label);
    }
}

/// The process-wide callback target standing in for a UI thread.
///
/// Until an executor is installed, jobs run in order on a dedicated
/// `ferry-main` thread.
pub struct MainQueue {
    executor: RwLock<Option<Executor>>,
    fallback: SerialQueue,
}

impl MainQueue {
    fn new() -> Self {
        Self {
            executor: RwLock::new(None),
            fallback: SerialQueue::new("ferry-main"),
        }
    }

    /// Route every later job through `executor`.
    pub fn set_executor<F>(&self, executor: F)
    where
        F: Fn(Job) + Send + Sync + 'static,
    {
        *self.executor.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(executor));
    }

    /// Go back to the built-in main thread.
    pub fn clear_executor(&self) {
        *self.executor.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Run `job` through the installed executor, or on the fallback thread.
    pub fn dispatch(&self, job: Job) {
        let executor = self
            .executor
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match executor {
            Some(executor) => executor(job),
            None => self.fallback.dispatch(job),
        }
    }
}

/// The process-wide main queue
pub fn main_queue() -> &'static MainQueue {
    static MAIN: OnceLock<MainQueue> = OnceLock::new();
    MAIN.get_or_init(MainQueue::new)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::channel;
    use std::time::Duration;

    #[test]
    fn test_jobs_run_in_order_off_thread() {
        let queue = SerialQueue::new("ferry-test-order");
        let (tx, rx) = channel();
        let caller = thread::current().id();

        for i in 0..100 {
            let tx = tx.clone();
            queue.dispatch_fn(move || {
                tx.send((i, thread::current().id())).unwrap();
            });
        }

        for expected in 0..100 {
            let (i, thread) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(i, expected);
            assert_ne!(thread, caller);
        }
    }

    #[test]
    fn test_panicking_job_does_not_stop_queue() {
        let queue = SerialQueue::new("ferry-test-panic");
        let (tx, rx) = channel();

        queue.dispatch_fn(|| panic!("boom"));
        queue.dispatch_fn(move || tx.send("after").unwrap());

        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "after");
    }

    #[test]
    fn test_dropped_queue_drains_pending_jobs() {
        let (tx, rx) = channel();
        {
            let queue = SerialQueue::new("ferry-test-drain");
            for i in 0..10 {
                let tx = tx.clone();
                queue.dispatch_fn(move || {
                    thread::sleep(Duration::from_millis(1));
                    tx.send(i).unwrap();
                });
            }
        }
        let received: Vec<_> = (0..10)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).unwrap())
            .collect();
        assert_eq!(received, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn test_main_queue_default_thread() {
        let (tx, rx) = channel();
        main_queue().dispatch(Box::new(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        }));
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(name.is_some());
    }
}
