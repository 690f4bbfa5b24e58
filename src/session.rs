//! Process-wide transport configuration
//!
//! All transfer operations share one network worker and therefore one set of
//! transport settings. Install a [`SessionConfiguration`] with [`configure`]
//! before the first operation starts; the worker reads it exactly once.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue, USER_AGENT};

use crate::{Error, Result};

/// Default redirect hop limit
pub const DEFAULT_MAX_REDIRECTS: usize = 16;
/// Default number of credential rounds per exchange
pub const DEFAULT_MAX_AUTH_ATTEMPTS: u32 = 3;
/// Default read size for request body streams
pub const DEFAULT_STREAM_CHUNK_LEN: usize = 64 * 1024;

/// Transport settings shared by every operation.
#[derive(Debug, Clone)]
pub struct SessionConfiguration {
    pub(crate) user_agent: Option<String>,
    pub(crate) headers: HashMap<String, String>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) max_redirects: usize,
    pub(crate) max_auth_attempts: u32,
    pub(crate) stream_chunk_len: usize,
}

impl Default for SessionConfiguration {
    fn default() -> Self {
        Self {
            user_agent: Some(concat!("ferry/", env!("CARGO_PKG_VERSION")).to_string()),
            headers: HashMap::new(),
            connect_timeout: None,
            timeout: None,
            max_redirects: DEFAULT_MAX_REDIRECTS,
            max_auth_attempts: DEFAULT_MAX_AUTH_ATTEMPTS,
            stream_chunk_len: DEFAULT_STREAM_CHUNK_LEN,
        }
    }
}

impl SessionConfiguration {
    /// Start building a configuration
    pub fn builder() -> SessionConfigurationBuilder {
        SessionConfigurationBuilder::default()
    }

    /// Redirect hop limit
    pub fn max_redirects(&self) -> usize {
        self.max_redirects
    }

    /// Credential rounds per exchange
    pub fn max_auth_attempts(&self) -> u32 {
        self.max_auth_attempts
    }

    /// Read size for request body streams
    pub fn stream_chunk_len(&self) -> usize {
        self.stream_chunk_len
    }

    /// Default request timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) fn default_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Internal(format!("Invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Internal(format!("Invalid header value for {}: {}", name, e)))?;
            headers.insert(name, value);
        }
        if let Some(user_agent) = &self.user_agent {
            let value = HeaderValue::from_str(user_agent)
                .map_err(|e| Error::Internal(format!("Invalid user agent: {}", e)))?;
            headers.insert(USER_AGENT, value);
        }
        Ok(headers)
    }
}

/// Session configuration builder
#[derive(Debug, Default)]
pub struct SessionConfigurationBuilder {
    config: SessionConfiguration,
}

impl SessionConfigurationBuilder {
    /// Create a new configuration builder
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the user agent, or `None` to send none
    pub fn user_agent(mut self, user_agent: Option<String>) -> Self {
        self.config.user_agent = user_agent;
        self
    }

    /// Add a default header sent with every request
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.headers.insert(name.into(), value.into());
        self
    }

    /// Set the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = Some(timeout);
        self
    }

    /// Set the default request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Set the redirect hop limit
    pub fn max_redirects(mut self, max_redirects: usize) -> Self {
        self.config.max_redirects = max_redirects;
        self
    }

    /// Set the number of credential rounds per exchange
    pub fn max_auth_attempts(mut self, attempts: u32) -> Self {
        self.config.max_auth_attempts = attempts;
        self
    }

    /// Set the read size for request body streams
    pub fn stream_chunk_len(mut self, len: usize) -> Self {
        self.config.stream_chunk_len = len.max(1);
        self
    }

    /// Finish building
    pub fn build(self) -> SessionConfiguration {
        self.config
    }
}

static PENDING: Mutex<Option<SessionConfiguration>> = Mutex::new(None);

/// Install the process-wide configuration.
///
/// Returns [`Error::AlreadyStarted`] once the network worker is running.
pub fn configure(config: SessionConfiguration) -> Result<()> {
    let mut pending = PENDING.lock().unwrap_or_else(PoisonError::into_inner);
    if crate::transfer::worker::is_running() {
        return Err(Error::AlreadyStarted);
    }
    tracing::debug!("Session configured: {:?}", config);
    *pending = Some(config);
    Ok(())
}

/// Taken by the network worker when it starts.
pub(crate) fn take_configuration() -> SessionConfiguration {
    PENDING
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .take()
        .unwrap_or_default()
}
