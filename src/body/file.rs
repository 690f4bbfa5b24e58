use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use super::{BodyStream, RequestBody};
use crate::{Error, Result};

/// A body streamed from a file on disk.
///
/// The file is not touched until a stream is requested; a missing file
/// surfaces as [`Error::SourceUnavailable`] at that point.
#[derive(Debug, Clone)]
pub struct FileBody {
    path: PathBuf,
    content_type: Option<String>,
}

impl FileBody {
    /// Stream the file at `path`
    pub fn new(path: impl Into<PathBuf>, content_type: Option<String>) -> Self {
        Self {
            path: path.into(),
            content_type,
        }
    }

    /// Path of the file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RequestBody for FileBody {
    fn open_stream(&self) -> Result<BodyStream> {
        let file = open_regular_file(&self.path)?;
        Ok(Box::new(BufReader::new(file)))
    }

    fn content_type(&self) -> Option<String> {
        self.content_type.clone()
    }

    fn content_length(&self) -> Option<u64> {
        std::fs::metadata(&self.path).ok().map(|meta| meta.len())
    }
}

/// Open `path` for reading, rejecting anything that is not a regular file.
pub(crate) fn open_regular_file(path: &Path) -> Result<File> {
    let meta = std::fs::metadata(path).map_err(|e| Error::source_unavailable(path, &e))?;
    if !meta.is_file() {
        let error = io::Error::new(io::ErrorKind::InvalidInput, "not a regular file");
        return Err(Error::source_unavailable(path, &error));
    }
    File::open(path).map_err(|e| Error::source_unavailable(path, &e))
}
