//! Outgoing request description

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use http::header::{HeaderMap, HeaderName, HeaderValue};
use http::Method;
use url::Url;

use crate::body::RequestBody;
use crate::{Error, Result};

/// How a request interacts with the response cache
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CachePolicy {
    /// Load from the network and offer successful responses to the cache
    #[default]
    UseProtocolDefault,
    /// Load from the network and never consult or fill the cache
    ReloadIgnoringCacheData,
    /// Serve a cached response when one exists, otherwise load
    ReturnCacheDataElseLoad,
}

/// A mutable HTTP request description.
///
/// The request body is a shared [`RequestBody`] strategy so that the engine
/// can ask for a fresh stream whenever the exchange has to be retransmitted.
#[derive(Clone)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) url: Url,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Option<Arc<dyn RequestBody>>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) cache_policy: CachePolicy,
}

impl Request {
    /// Create a `GET` request for `url`
    pub fn new(url: Url) -> Self {
        Self {
            method: Method::GET,
            url,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            cache_policy: CachePolicy::default(),
        }
    }

    /// Parse `url` and create a `GET` request for it
    pub fn get(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        Ok(Self::new(url))
    }

    /// HTTP method
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Set the HTTP method
    pub fn set_method(&mut self, method: Method) {
        self.method = method;
    }

    /// Target URL
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Replace the target URL
    pub fn set_url(&mut self, url: Url) {
        self.url = url;
    }

    /// Request headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Mutable request headers
    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    /// Set a header, replacing any previous values.
    pub fn set_header(&mut self, name: &str, value: &str) -> Result<()> {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| Error::Internal(format!("Invalid header name {}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| Error::Internal(format!("Invalid header value for {}: {}", name, e)))?;
        self.headers.insert(name, value);
        Ok(())
    }

    /// Body strategy, if any
    pub fn body(&self) -> Option<&Arc<dyn RequestBody>> {
        self.body.as_ref()
    }

    /// Set or clear the body strategy
    pub fn set_body(&mut self, body: Option<Arc<dyn RequestBody>>) {
        self.body = body;
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Set the per-request timeout
    pub fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    /// Cache policy
    pub fn cache_policy(&self) -> CachePolicy {
        self.cache_policy
    }

    /// Set the cache policy
    pub fn set_cache_policy(&mut self, policy: CachePolicy) {
        self.cache_policy = policy;
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("method", &self.method)
            .field("url", &self.url.as_str())
            .field("headers", &self.headers)
            .field("has_body", &self.body.is_some())
            .field("timeout", &self.timeout)
            .field("cache_policy", &self.cache_policy)
            .finish()
    }
}
