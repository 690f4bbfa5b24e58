//! Destinations for response bytes

use std::collections::BTreeSet;
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use bytes::Bytes;
use tokio::io::AsyncWriteExt;

use crate::{Error, Result};

/// Where a transfer writes the response body.
#[derive(Default)]
pub enum OutputSink {
    /// Collect into memory, readable through the operation afterwards
    #[default]
    Memory,
    /// Stream into a file, creating parent directories as needed
    File(PathBuf),
    /// Stream into an arbitrary blocking writer
    Writer(Box<dyn Write + Send>),
}

impl fmt::Debug for OutputSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputSink::Memory => f.write_str("Memory"),
            OutputSink::File(path) => f.debug_tuple("File").field(path).finish(),
            OutputSink::Writer(_) => f.write_str("Writer(..)"),
        }
    }
}

static CLAIMED_PATHS: Mutex<BTreeSet<PathBuf>> = Mutex::new(BTreeSet::new());

/// Exclusive use of a file path by one in-flight transfer.
#[derive(Debug)]
pub(crate) struct PathClaim {
    path: PathBuf,
}

impl PathClaim {
    pub(crate) fn acquire(path: &Path) -> Result<Self> {
        let path = std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf());
        let mut claimed = CLAIMED_PATHS.lock().unwrap_or_else(PoisonError::into_inner);
        if !claimed.insert(path.clone()) {
            return Err(Error::SinkInUse(path));
        }
        Ok(Self { path })
    }
}

impl Drop for PathClaim {
    fn drop(&mut self) {
        CLAIMED_PATHS
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}

/// A sink that has been opened for one exchange.
pub(crate) enum OpenSink {
    Memory,
    File {
        file: tokio::fs::File,
        _claim: PathClaim,
    },
    Writer(Option<Box<dyn Write + Send>>),
}

impl OpenSink {
    pub(crate) async fn open(sink: OutputSink) -> Result<Self> {
        match sink {
            OutputSink::Memory => Ok(OpenSink::Memory),
            OutputSink::File(path) => {
                let claim = PathClaim::acquire(&path)?;
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let file = tokio::fs::File::create(&path).await?;
                tracing::trace!("Opened file sink {}", path.display());
                Ok(OpenSink::File {
                    file,
                    _claim: claim,
                })
            }
            OutputSink::Writer(writer) => Ok(OpenSink::Writer(Some(writer))),
        }
    }

    pub(crate) fn is_memory(&self) -> bool {
        matches!(self, OpenSink::Memory)
    }

    pub(crate) async fn write(&mut self, memory: &Mutex<Vec<u8>>, chunk: Bytes) -> Result<()> {
        match self {
            OpenSink::Memory => {
                memory
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .extend_from_slice(&chunk);
                Ok(())
            }
            OpenSink::File { file, .. } => Ok(file.write_all(&chunk).await?),
            OpenSink::Writer(slot) => {
                let mut writer = slot
                    .take()
                    .ok_or_else(|| Error::Internal("Output writer was lost".to_string()))?;
                let (writer, result) = tokio::task::spawn_blocking(move || {
                    let result = writer.write_all(&chunk);
                    (writer, result)
                })
                .await
                .map_err(|e| Error::Internal(format!("Output writer task failed: {}", e)))?;
                *slot = Some(writer);
                Ok(result?)
            }
        }
    }

    pub(crate) async fn flush(&mut self) -> Result<()> {
        match self {
            OpenSink::Memory => Ok(()),
            OpenSink::File { file, .. } => Ok(file.flush().await?),
            OpenSink::Writer(slot) => {
                let Some(mut writer) = slot.take() else {
                    return Ok(());
                };
                let (writer, result) = tokio::task::spawn_blocking(move || {
                    let result = writer.flush();
                    (writer, result)
                })
                .await
                .map_err(|e| Error::Internal(format!("Output writer task failed: {}", e)))?;
                *slot = Some(writer);
                Ok(result?)
            }
        }
    }
}
