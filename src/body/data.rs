use bytes::{Buf, Bytes};

use super::{BodyStream, RequestBody};
use crate::Result;

/// An in-memory body.
#[derive(Debug, Clone)]
pub struct DataBody {
    data: Bytes,
    content_type: Option<String>,
}

impl DataBody {
    /// Wrap `data`, sent as `content_type` or `application/octet-stream`
    pub fn new(data: impl Into<Bytes>, content_type: Option<String>) -> Self {
        Self {
            data: data.into(),
            content_type,
        }
    }

    /// A UTF-8 text body
    pub fn text(content: impl Into<String>) -> Self {
        let content: String = content.into();
        Self::new(content, Some("text/plain; charset=utf-8".to_string()))
    }

    /// The wrapped bytes
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl RequestBody for DataBody {
    fn open_stream(&self) -> Result<BodyStream> {
        Ok(Box::new(self.data.clone().reader()))
    }

    fn content_type(&self) -> Option<String> {
        self.content_type.clone()
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}
