//! Received response metadata

use http::header::{CONTENT_DISPOSITION, CONTENT_LENGTH, CONTENT_TYPE, HeaderMap};
use http::StatusCode;
use url::Url;

/// Status line and headers of a received HTTP response.
///
/// The body is delivered to the operation's output sink, not stored here.
#[derive(Debug, Clone)]
pub struct Response {
    url: Url,
    status: StatusCode,
    headers: HeaderMap,
}

impl Response {
    pub(crate) fn new(url: Url, status: StatusCode, headers: HeaderMap) -> Self {
        Self {
            url,
            status,
            headers,
        }
    }

    /// Final URL, after any followed redirects
    pub fn url(&self) -> &Url {
        &self.url
    }

    /// HTTP status
    pub fn status(&self) -> StatusCode {
        self.status
    }

    /// Numeric status code
    pub fn status_code(&self) -> u16 {
        self.status.as_u16()
    }

    /// Reason phrase for the status code, e.g. `"Not Found"`
    pub fn status_string(&self) -> String {
        self.status
            .canonical_reason()
            .unwrap_or("Unknown")
            .to_string()
    }

    /// Check if the response status indicates success (2xx)
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Check if the response status indicates a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status.is_client_error()
    }

    /// Check if the response status indicates a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status.is_server_error()
    }

    /// All headers
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    /// Get a header value as a string
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    /// Expected body length from `Content-Length`
    pub fn expected_content_length(&self) -> Option<u64> {
        self.headers
            .get(CONTENT_LENGTH)?
            .to_str()
            .ok()?
            .trim()
            .parse()
            .ok()
    }

    /// MIME type without parameters, lowercased
    pub fn mime_type(&self) -> Option<String> {
        let content_type = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        let mime = content_type.split(';').next()?.trim();
        (!mime.is_empty()).then(|| mime.to_ascii_lowercase())
    }

    /// `charset` parameter of `Content-Type`, if present
    pub fn text_encoding_name(&self) -> Option<String> {
        let content_type = self.headers.get(CONTENT_TYPE)?.to_str().ok()?;
        header_parameter(content_type, "charset")
    }

    /// File name suggested by `Content-Disposition`, falling back to the
    /// last path segment of the URL.
    pub fn suggested_filename(&self) -> Option<String> {
        let from_header = self
            .headers
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| header_parameter(value, "filename"));

        from_header.or_else(|| {
            self.url
                .path_segments()?
                .next_back()
                .filter(|segment| !segment.is_empty())
                .map(str::to_string)
        })
    }
}

fn header_parameter(value: &str, name: &str) -> Option<String> {
    value.split(';').skip(1).find_map(|param| {
        let (key, value) = param.trim().split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case(name)
            .then(|| value.trim().trim_matches('"').to_string())
    })
}
