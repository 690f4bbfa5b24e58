use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock};

use bytes::{Buf, Bytes};

use super::{BodyStream, RequestBody};
use crate::Result;
use crate::encoding::{self, QueryValue};

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded; charset=utf-8";

/// A `application/x-www-form-urlencoded` body built from named fields.
///
/// Fields are kept sorted by name and encoded each time a stream is opened,
/// so edits made before the operation starts are picked up.
#[derive(Debug, Default)]
pub struct FormBody {
    fields: RwLock<BTreeMap<String, QueryValue>>,
}

impl FormBody {
    /// An empty form
    pub fn new() -> Self {
        Self::default()
    }

    /// A form with the given fields
    pub fn with_fields(fields: BTreeMap<String, QueryValue>) -> Self {
        Self {
            fields: RwLock::new(fields),
        }
    }

    /// Set a field, replacing any previous value
    pub fn insert(&self, name: impl Into<String>, value: impl Into<QueryValue>) {
        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.into(), value.into());
    }

    /// Remove a field
    pub fn remove(&self, name: &str) -> Option<QueryValue> {
        self.fields
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name)
    }

    /// Snapshot of the current fields
    pub fn fields(&self) -> BTreeMap<String, QueryValue> {
        self.fields
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The encoded form as it would be sent now
    pub fn encoded(&self) -> String {
        let fields = self.fields.read().unwrap_or_else(PoisonError::into_inner);
        encoding::form_encode_query(&fields)
    }
}

impl RequestBody for FormBody {
    fn open_stream(&self) -> Result<BodyStream> {
        Ok(Box::new(Bytes::from(self.encoded()).reader()))
    }

    fn content_type(&self) -> Option<String> {
        Some(FORM_CONTENT_TYPE.to_string())
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.encoded().len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::body::read_all;

    #[test]
    fn test_form_encoding() {
        let form = FormBody::new();
        form.insert("model", "458 Italia");
        form.insert("make", "Ferrari");

        assert_eq!(read_all(&form), b"make=Ferrari&model=458+Italia");
        assert_eq!(form.content_length(), Some(29));
        assert_eq!(form.content_type().as_deref(), Some(FORM_CONTENT_TYPE));
    }

    #[test]
    fn test_stream_reflects_current_fields() {
        let form = FormBody::new();
        form.insert("a", "1");
        assert_eq!(read_all(&form), b"a=1");

        form.insert("b", vec!["x", "y z"]);
        form.remove("a");
        assert_eq!(read_all(&form), b"b[0]=x&b[1]=y+z");
    }
}
