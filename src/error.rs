//! Error types and transport error mapping

use std::path::PathBuf;
use thiserror::Error;

/// Result type for this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for transfer operations
#[derive(Debug, Error)]
pub enum Error {
    /// Invalid URL
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// The connection could not be established or was dropped
    #[error("Network error: {message} (code: {code})")]
    Network {
        /// Stable negative error code
        code: i64,
        /// Error message
        message: String,
    },

    /// TLS/Certificate error
    #[error("TLS error: {message}")]
    Tls {
        /// Error message
        message: String,
    },

    /// Timeout error
    #[error("Request timed out")]
    Timeout,

    /// The operation was cancelled before it completed
    #[error("Operation was cancelled")]
    Cancelled,

    /// A request body source could not be opened or read
    #[error("Body source unavailable: {path}: {message}")]
    SourceUnavailable {
        /// Path of the missing or unreadable file
        path: PathBuf,
        /// Error message
        message: String,
    },

    /// UTF-8 conversion error
    #[error("UTF-8 conversion error: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation has already started and can no longer be reconfigured
    #[error("Operation has already started")]
    AlreadyStarted,

    /// A file sink is already bound to another in-flight operation
    #[error("Output file is in use by another operation: {0}")]
    SinkInUse(PathBuf),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Generic transport failure.
pub(crate) const CODE_UNKNOWN: i64 = -1;
/// The host could not be reached.
pub(crate) const CODE_CANNOT_CONNECT: i64 = -1004;
/// The connection dropped mid-exchange.
pub(crate) const CODE_CONNECTION_LOST: i64 = -1005;
/// Redirect limit exceeded.
pub(crate) const CODE_TOO_MANY_REDIRECTS: i64 = -1007;
/// The response body could not be decoded.
pub(crate) const CODE_BAD_RESPONSE: i64 = -1011;

impl Error {
    /// Returns `true` if this error was raised by cancelling the operation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// Convert a reqwest error into our Error type
    pub(crate) fn from_reqwest(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            return Error::Timeout;
        }

        let message = error_chain(&error);
        if looks_like_tls(&message) {
            return Error::Tls { message };
        }

        let code = if error.is_connect() {
            CODE_CANNOT_CONNECT
        } else if error.is_body() || error.is_decode() {
            CODE_BAD_RESPONSE
        } else if error.is_request() {
            CODE_CONNECTION_LOST
        } else {
            CODE_UNKNOWN
        };

        Error::Network { code, message }
    }

    /// Map an I/O error raised while reading a body source.
    pub(crate) fn source_unavailable(path: impl Into<PathBuf>, error: &std::io::Error) -> Self {
        Error::SourceUnavailable {
            path: path.into(),
            message: error.to_string(),
        }
    }
}

fn error_chain(error: &(dyn std::error::Error + 'static)) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(inner) = source {
        message.push_str(": ");
        message.push_str(&inner.to_string());
        source = inner.source();
    }
    message
}

fn looks_like_tls(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("certificate") || lower.contains("tls handshake") || lower.contains("invalid peer")
}
