//! Request body strategies
//!
//! Any [`RequestBody`] can serve as the body of a request. The engine calls
//! [`RequestBody::open_stream`] once per transmission attempt, so a body that
//! has to be resent after a redirect or an authentication round is simply
//! opened again.

use std::io::Read;

use crate::Result;

mod data;
mod file;
mod form;
mod json;
mod multipart;

pub use data::DataBody;
pub use file::FileBody;
pub use form::FormBody;
pub use json::JsonBody;
pub use multipart::{DEFAULT_STREAM_BUFFER_LEN, MultipartBody};

/// A fresh, unconsumed reader over body bytes
pub type BodyStream = Box<dyn Read + Send>;

/// Content type assumed when a body does not report one
pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";

/// A source of outgoing HTTP body bytes.
pub trait RequestBody: Send + Sync {
    /// Produce a new stream reflecting the body's current contents.
    ///
    /// Every call returns an independent reader. Fails with
    /// [`Error::SourceUnavailable`](crate::Error::SourceUnavailable) when a
    /// referenced file cannot be opened.
    fn open_stream(&self) -> Result<BodyStream>;

    /// MIME type of the body, `None` for [`DEFAULT_CONTENT_TYPE`]
    fn content_type(&self) -> Option<String> {
        None
    }

    /// Total length in bytes, `None` when unknown
    fn content_length(&self) -> Option<u64> {
        None
    }
}

/// The content type to put on the wire for `body`.
pub(crate) fn effective_content_type(body: &dyn RequestBody) -> String {
    body.content_type()
        .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string())
}

#[cfg(test)]
pub(crate) fn read_all(body: &dyn RequestBody) -> Vec<u8> {
    let mut out = Vec::new();
    body.open_stream()
        .unwrap()
        .read_to_end(&mut out)
        .unwrap();
    out
}
