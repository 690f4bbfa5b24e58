//! Concurrent HTTP transfer operations for Rust
//!
//! This crate provides a task abstraction with thread-safe start, cancel and
//! finish semantics, specialised into HTTP operations that stream request
//! bodies and responses on a single long-lived network worker. Operations
//! report progress, expose an observer and per-event callbacks, and can be
//! run standalone or aggregated in an [`OperationQueue`].
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use ferry::{HttpOperation, MultipartBody, OperationQueue, Task};
//!
//! # fn main() -> ferry::Result<()> {
//! let form = MultipartBody::new();
//! form.add_string("note", "hi");
//!
//! let upload = HttpOperation::builder("https://example.com/upload")?
//!     .method(ferry::Method::POST)
//!     .body(Arc::new(form))
//!     .build()?;
//! upload.on_did_fail(|op, error| eprintln!("{} failed: {}", op.id(), error));
//!
//! let queue = OperationQueue::shared();
//! queue.add(upload.clone());
//! queue.wait_until_all_operations_are_finished();
//! println!("{:?}", upload.response_status_code());
//! # Ok(())
//! # }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![deny(missing_docs)]

pub use activity::{ActivitySink, NetworkActivityIndicator};
pub use auth::{Challenge, Credential, TrustPolicy};
pub use cache::{CachedResponse, MemoryCache, ResponseCache};
pub use delegate::{HttpOperationDelegate, OperationQueueDelegate};
pub use error::{Error, Result};
pub use operation::{HttpOperation, HttpOperationBuilder};
pub use progress::{Progress, ProgressEvent, ProgressListener, ProgressSource};
pub use queue::{OperationQueue, QueueTotals};
pub use request::{CachePolicy, Request};
pub use response::Response;
pub use session::{SessionConfiguration, SessionConfigurationBuilder, configure};
pub use task::{Task, TaskState, TaskStatus};
pub use transfer::{OutputSink, TransferOperation};

// Re-export body types
pub use body::{
    BodyStream, DataBody, FileBody, FormBody, JsonBody, MultipartBody, RequestBody,
};

pub use http::{HeaderMap, Method, StatusCode};
pub use url::Url;

pub mod activity;
mod auth;
pub mod body;
mod cache;
pub mod delegate;
pub mod dispatch;
pub mod encoding;
mod error;
pub mod operation;
mod progress;
pub mod queue;
mod request;
mod response;
pub mod session;
mod task;
mod transfer;
