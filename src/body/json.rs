use bytes::{Buf, Bytes};
use serde::Serialize;

use super::{BodyStream, RequestBody};
use crate::Result;

const JSON_CONTENT_TYPE: &str = "application/json; charset=utf-8";

/// A JSON body, serialized once at construction.
#[derive(Debug, Clone)]
pub struct JsonBody {
    data: Bytes,
}

impl JsonBody {
    /// Serialize `value`. Fails with [`Error::Json`](crate::Error::Json).
    pub fn from_value<T: Serialize + ?Sized>(value: &T) -> Result<Self> {
        Ok(Self {
            data: serde_json::to_vec(value)?.into(),
        })
    }

    /// Use an already serialized JSON document
    pub fn from_string(json: impl Into<String>) -> Self {
        Self {
            data: Bytes::from(json.into()),
        }
    }

    /// Use raw JSON bytes
    pub fn from_bytes(json: impl Into<Bytes>) -> Self {
        Self { data: json.into() }
    }

    /// The serialized document
    pub fn data(&self) -> &Bytes {
        &self.data
    }
}

impl RequestBody for JsonBody {
    fn open_stream(&self) -> Result<BodyStream> {
        Ok(Box::new(self.data.clone().reader()))
    }

    fn content_type(&self) -> Option<String> {
        Some(JSON_CONTENT_TYPE.to_string())
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}
