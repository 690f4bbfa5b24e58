use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Buf, Bytes};

use super::file::open_regular_file;
use super::{BodyStream, DEFAULT_CONTENT_TYPE, RequestBody};
use crate::{Error, Result};

/// Default read buffer for file parts
pub const DEFAULT_STREAM_BUFFER_LEN: usize = 64 * 1024;

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

static BOUNDARY_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone)]
enum PartSource {
    Data(Bytes),
    File(PathBuf),
}

#[derive(Debug, Clone)]
struct Part {
    name: String,
    filename: Option<String>,
    content_type: String,
    source: PartSource,
}

impl Part {
    fn header(&self, boundary: &str, first: bool) -> String {
        let mut header = String::new();
        if !first {
            header.push_str("\r\n");
        }
        header.push_str(&format!(
            "--{}\r\nContent-Disposition: form-data; name=\"{}\"",
            boundary,
            escape_quoted(&self.name)
        ));
        if let Some(filename) = &self.filename {
            header.push_str(&format!("; filename=\"{}\"", escape_quoted(filename)));
        }
        header.push_str(&format!("\r\nContent-Type: {}\r\n\r\n", self.content_type));
        header
    }

    fn body_len(&self) -> Option<u64> {
        match &self.source {
            PartSource::Data(data) => Some(data.len() as u64),
            PartSource::File(path) => std::fs::metadata(path).ok().map(|meta| meta.len()),
        }
    }
}

fn trailer(boundary: &str, empty: bool) -> String {
    if empty {
        format!("--{}--\r\n", boundary)
    } else {
        format!("\r\n--{}--\r\n", boundary)
    }
}

fn escape_quoted(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace(['\r', '\n'], " ")
}

fn generate_boundary() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let count = BOUNDARY_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("ferry-boundary-{:x}-{:x}", nanos, count)
}

/// A `multipart/form-data` body.
///
/// Parts are kept in insertion order. The `add_*` methods append a part only
/// when no part with that name exists yet and report whether they did; the
/// `set_*` methods remove every existing part with that name before
/// appending, so a name set this way occurs exactly once on the wire.
///
/// Streams are produced lazily: part headers are generated as the reader
/// reaches them and file parts are opened only when their turn comes.
#[derive(Debug)]
pub struct MultipartBody {
    boundary: String,
    parts: RwLock<Vec<Part>>,
    stream_buffer_len: AtomicUsize,
}

impl Default for MultipartBody {
    fn default() -> Self {
        Self::new()
    }
}

impl MultipartBody {
    /// An empty body with a freshly generated boundary
    pub fn new() -> Self {
        Self {
            boundary: generate_boundary(),
            parts: RwLock::new(Vec::new()),
            stream_buffer_len: AtomicUsize::new(DEFAULT_STREAM_BUFFER_LEN),
        }
    }

    /// A body with one text part per field
    pub fn with_fields<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        let body = Self::new();
        for (name, value) in fields {
            body.add_string(name, value);
        }
        body
    }

    /// The boundary token separating parts
    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Read buffer size used for file parts
    pub fn stream_buffer_len(&self) -> usize {
        self.stream_buffer_len.load(Ordering::Relaxed)
    }

    /// Change the read buffer size used for file parts
    pub fn set_stream_buffer_len(&self, len: usize) {
        self.stream_buffer_len.store(len.max(1), Ordering::Relaxed);
    }

    /// Number of parts
    pub fn part_count(&self) -> usize {
        self.read_parts().len()
    }

    /// Whether a part named `name` exists
    pub fn contains(&self, name: &str) -> bool {
        self.read_parts().iter().any(|part| part.name == name)
    }

    /// Names of all parts, in wire order
    pub fn part_names(&self) -> Vec<String> {
        self.read_parts()
            .iter()
            .map(|part| part.name.clone())
            .collect()
    }

    /// Remove every part named `name`
    pub fn remove(&self, name: &str) {
        self.write_parts().retain(|part| part.name != name);
    }

    /// Append a text part unless `name` is taken.
    pub fn add_string(&self, name: impl Into<String>, value: impl Into<String>) -> bool {
        self.add(text_part(name.into(), value.into()))
    }

    /// Replace all parts named `name` with one text part.
    pub fn set_string(&self, name: impl Into<String>, value: impl Into<String>) {
        self.set(text_part(name.into(), value.into()));
    }

    /// Append an in-memory part unless `name` is taken.
    pub fn add_data(
        &self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
        filename: Option<String>,
        content_type: Option<String>,
    ) -> bool {
        self.add(data_part(name.into(), data.into(), filename, content_type))
    }

    /// Replace all parts named `name` with one in-memory part.
    pub fn set_data(
        &self,
        name: impl Into<String>,
        data: impl Into<Bytes>,
        filename: Option<String>,
        content_type: Option<String>,
    ) {
        self.set(data_part(name.into(), data.into(), filename, content_type));
    }

    /// Append a file part unless `name` is taken.
    ///
    /// The file must exist now; its contents are read when the body is sent.
    /// `filename` defaults to the file's own name.
    pub fn add_file(
        &self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        filename: Option<String>,
        content_type: Option<String>,
    ) -> Result<bool> {
        let part = file_part(name.into(), path.into(), filename, content_type)?;
        Ok(self.add(part))
    }

    /// Replace all parts named `name` with one file part.
    pub fn set_file(
        &self,
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        filename: Option<String>,
        content_type: Option<String>,
    ) -> Result<()> {
        let part = file_part(name.into(), path.into(), filename, content_type)?;
        self.set(part);
        Ok(())
    }

    fn add(&self, part: Part) -> bool {
        let mut parts = self.write_parts();
        if parts.iter().any(|existing| existing.name == part.name) {
            return false;
        }
        parts.push(part);
        true
    }

    fn set(&self, part: Part) {
        let mut parts = self.write_parts();
        parts.retain(|existing| existing.name != part.name);
        parts.push(part);
    }

    fn read_parts(&self) -> std::sync::RwLockReadGuard<'_, Vec<Part>> {
        self.parts.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_parts(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Part>> {
        self.parts.write().unwrap_or_else(PoisonError::into_inner)
    }
}

fn text_part(name: String, value: String) -> Part {
    Part {
        name,
        filename: None,
        content_type: TEXT_CONTENT_TYPE.to_string(),
        source: PartSource::Data(Bytes::from(value)),
    }
}

fn data_part(
    name: String,
    data: Bytes,
    filename: Option<String>,
    content_type: Option<String>,
) -> Part {
    Part {
        name,
        filename,
        content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        source: PartSource::Data(data),
    }
}

fn file_part(
    name: String,
    path: PathBuf,
    filename: Option<String>,
    content_type: Option<String>,
) -> Result<Part> {
    let meta = std::fs::metadata(&path).map_err(|e| Error::source_unavailable(&path, &e))?;
    if !meta.is_file() {
        let error = io::Error::new(io::ErrorKind::InvalidInput, "not a regular file");
        return Err(Error::source_unavailable(&path, &error));
    }

    let filename = filename.or_else(|| {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(str::to_string)
    });

    Ok(Part {
        name,
        filename,
        content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string()),
        source: PartSource::File(path),
    })
}

impl RequestBody for MultipartBody {
    fn open_stream(&self) -> Result<BodyStream> {
        let parts = self.read_parts().clone();

        // fail before the first byte rather than halfway through the body
        for part in &parts {
            if let PartSource::File(path) = &part.source {
                std::fs::metadata(path).map_err(|e| Error::source_unavailable(path, &e))?;
            }
        }

        Ok(Box::new(MultipartReader::new(
            self.boundary.clone(),
            parts,
            self.stream_buffer_len(),
        )))
    }

    fn content_type(&self) -> Option<String> {
        Some(format!("multipart/form-data; boundary={}", self.boundary))
    }

    fn content_length(&self) -> Option<u64> {
        let parts = self.read_parts();
        let mut total = trailer(&self.boundary, parts.is_empty()).len() as u64;
        for (index, part) in parts.iter().enumerate() {
            total += part.header(&self.boundary, index == 0).len() as u64;
            total += part.body_len()?;
        }
        Some(total)
    }
}

enum Stage {
    Header(Bytes),
    Body(Box<dyn Read + Send>),
    Trailer(Bytes),
    Done,
}

/// Sequential reader over a snapshot of the parts.
struct MultipartReader {
    boundary: String,
    parts: Vec<Part>,
    index: usize,
    buffer_len: usize,
    stage: Stage,
}

impl MultipartReader {
    fn new(boundary: String, parts: Vec<Part>, buffer_len: usize) -> Self {
        let stage = match parts.first() {
            Some(first) => Stage::Header(Bytes::from(first.header(&boundary, true))),
            None => Stage::Trailer(Bytes::from(trailer(&boundary, true))),
        };
        Self {
            boundary,
            parts,
            index: 0,
            buffer_len,
            stage,
        }
    }

    fn open_part(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.parts[self.index].source {
            PartSource::Data(data) => Ok(Box::new(data.clone().reader())),
            PartSource::File(path) => {
                let file = open_regular_file(path).map_err(|e| to_io_error(path, e))?;
                Ok(Box::new(BufReader::with_capacity(self.buffer_len, file)))
            }
        }
    }

    fn next_stage(&mut self) -> io::Result<()> {
        self.stage = match &self.stage {
            Stage::Header(_) => Stage::Body(self.open_part()?),
            Stage::Body(_) => {
                self.index += 1;
                match self.parts.get(self.index) {
                    Some(part) => Stage::Header(Bytes::from(part.header(&self.boundary, false))),
                    None => Stage::Trailer(Bytes::from(trailer(&self.boundary, false))),
                }
            }
            Stage::Trailer(_) | Stage::Done => Stage::Done,
        };
        Ok(())
    }
}

fn to_io_error(path: &Path, error: Error) -> io::Error {
    io::Error::new(
        io::ErrorKind::NotFound,
        format!("{}: {}", path.display(), error),
    )
}

impl Read for MultipartReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }

        loop {
            match &mut self.stage {
                Stage::Header(bytes) | Stage::Trailer(bytes) => {
                    if bytes.has_remaining() {
                        let n = bytes.len().min(out.len());
                        bytes.copy_to_slice(&mut out[..n]);
                        return Ok(n);
                    }
                }
                Stage::Body(reader) => {
                    let n = reader.read(out)?;
                    if n > 0 {
                        return Ok(n);
                    }
                }
                Stage::Done => return Ok(0),
            }
            self.next_stage()?;
        }
    }
}
