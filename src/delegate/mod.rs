//! Observer interfaces
//!
//! Every method has a no-op default, so implementors only override the
//! notifications they care about. Observers run on the dispatch target of
//! the operation or queue they observe, before any callback registered for
//! the same event.

pub mod operation;
pub mod queue;

pub use operation::HttpOperationDelegate;
pub use queue::OperationQueueDelegate;
