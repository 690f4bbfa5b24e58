//! Observer of an operation queue

use crate::queue::OperationQueue;

/// Queue-level lifecycle and aggregate progress notifications.
///
/// A queue generation runs from the first operation added to an empty queue
/// until the last one finishes; `did_finish` is the final event of it.
pub trait OperationQueueDelegate: Send + Sync {
    /// A generation is about to start
    fn will_start(&self, _queue: &OperationQueue) {}

    /// A generation started
    fn did_start(&self, _queue: &OperationQueue) {}

    /// Aggregate bytes uploaded so far in this generation
    fn did_upload(&self, _queue: &OperationQueue, _bytes: u64) {}

    /// Aggregate bytes downloaded so far in this generation
    fn did_download(&self, _queue: &OperationQueue, _bytes: u64) {}

    /// Follows every upload or download notification
    fn did_make_progress(&self, _queue: &OperationQueue) {}

    /// The last member of the generation finished
    fn will_finish(&self, _queue: &OperationQueue) {}

    /// Final event of the generation
    fn did_finish(&self, _queue: &OperationQueue) {}
}
