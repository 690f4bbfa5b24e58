//! Response cache storage
//!
//! Eviction is left to the [`ResponseCache`] implementation; the bundled
//! [`MemoryCache`] keeps every entry until it is removed or cleared.

use std::collections::HashMap;
use std::sync::RwLock;

use bytes::Bytes;
use url::Url;

use crate::response::Response;

/// A stored response together with its body.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    /// Response metadata
    pub response: Response,
    /// Complete response body
    pub data: Bytes,
}

impl CachedResponse {
    /// Pair a response with its body
    pub fn new(response: Response, data: impl Into<Bytes>) -> Self {
        Self {
            response,
            data: data.into(),
        }
    }
}

/// Storage for cached `GET` responses, keyed by request URL.
pub trait ResponseCache: Send + Sync {
    /// Look up the entry for `url`
    fn get(&self, url: &Url) -> Option<CachedResponse>;

    /// Store or replace the entry for `url`
    fn put(&self, url: &Url, entry: CachedResponse);

    /// Drop the entry for `url`
    fn remove(&self, url: &Url);
}

/// In-process cache without eviction.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: RwLock<HashMap<String, CachedResponse>>,
}

impl MemoryCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.entries.read().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every entry
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }
}

impl ResponseCache for MemoryCache {
    fn get(&self, url: &Url) -> Option<CachedResponse> {
        self.entries.read().ok()?.get(url.as_str()).cloned()
    }

    fn put(&self, url: &Url, entry: CachedResponse) {
        if let Ok(mut entries) = self.entries.write() {
            entries.insert(url.as_str().to_string(), entry);
        }
    }

    fn remove(&self, url: &Url) {
        if let Ok(mut entries) = self.entries.write() {
            entries.remove(url.as_str());
        }
    }
}
