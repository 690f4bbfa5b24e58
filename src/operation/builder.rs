//! Builder for HTTP operations

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use http::Method;
use serde::Serialize;
use url::Url;

use super::HttpOperation;
use crate::activity::NetworkActivityIndicator;
use crate::auth::{Credential, TrustPolicy};
use crate::body::{FormBody, JsonBody, RequestBody};
use crate::cache::ResponseCache;
use crate::delegate::HttpOperationDelegate;
use crate::encoding::QueryValue;
use crate::request::{CachePolicy, Request};
use crate::transfer::OutputSink;
use crate::{Error, Result};

/// Configure an [`HttpOperation`] before creating it.
///
/// ```rust
/// use ferry::{FormBody, HttpOperation, Method};
/// use std::sync::Arc;
///
/// # fn main() -> ferry::Result<()> {
/// let form = FormBody::new();
/// form.insert("make", "Ferrari");
///
/// let op = HttpOperation::builder("https://example.com/cars")?
///     .method(Method::POST)
///     .header("Accept", "application/json")
///     .body(Arc::new(form))
///     .basic_auth("user", "pass")
///     .build()?;
/// assert_eq!(op.request_method(), Method::POST);
/// # Ok(())
/// # }
/// ```
pub struct HttpOperationBuilder {
    url: Url,
    method: Method,
    headers: Vec<(String, String)>,
    body: Option<Arc<dyn RequestBody>>,
    timeout: Option<Duration>,
    cache_policy: CachePolicy,
    sink: OutputSink,
    credential: Option<Credential>,
    username: Option<String>,
    password: Option<String>,
    trust: TrustPolicy,
    on_main_queue: bool,
    delegate: Option<Arc<dyn HttpOperationDelegate>>,
    activity: Option<Arc<NetworkActivityIndicator>>,
    updates_network_activity: bool,
    response_cache: Option<Arc<dyn ResponseCache>>,
}

impl HttpOperationBuilder {
    pub(crate) fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).map_err(|e| Error::InvalidUrl(format!("{}: {}", url, e)))?;
        Ok(Self {
            url,
            method: Method::GET,
            headers: Vec::new(),
            body: None,
            timeout: None,
            cache_policy: CachePolicy::default(),
            sink: OutputSink::Memory,
            credential: None,
            username: None,
            password: None,
            trust: TrustPolicy::default(),
            on_main_queue: false,
            delegate: None,
            activity: None,
            updates_network_activity: true,
            response_cache: None,
        })
    }

    /// Set the HTTP method
    pub fn method(mut self, method: Method) -> Self {
        self.method = method;
        self
    }

    /// Add a header
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Append query parameters to the URL, sorted and `%20`-escaped
    pub fn query(mut self, params: &BTreeMap<String, QueryValue>) -> Self {
        super::append_query(&mut self.url, params);
        self
    }

    /// Set the request body
    pub fn body(mut self, body: Arc<dyn RequestBody>) -> Self {
        self.body = Some(body);
        self
    }

    /// Set a JSON body
    pub fn json<T: Serialize + ?Sized>(self, value: &T) -> Result<Self> {
        let body = JsonBody::from_value(value)?;
        Ok(self.body(Arc::new(body)))
    }

    /// Set a form body
    pub fn form(self, fields: BTreeMap<String, QueryValue>) -> Self {
        self.body(Arc::new(FormBody::with_fields(fields)))
    }

    /// Set the request timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// How the response cache is consulted
    pub fn cache_policy(mut self, policy: CachePolicy) -> Self {
        self.cache_policy = policy;
        self
    }

    /// Where the response body goes
    pub fn output_sink(mut self, sink: OutputSink) -> Self {
        self.sink = sink;
        self
    }

    /// Stream the response body into a file
    pub fn response_file_path(self, path: impl Into<PathBuf>) -> Self {
        self.output_sink(OutputSink::File(path.into()))
    }

    /// Credential for authentication challenges
    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = Some(credential);
        self
    }

    /// Username and password for basic authentication challenges
    pub fn basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Accept any certificate from any host
    pub fn trust_all_hosts(mut self, trust: bool) -> Self {
        self.trust.trust_all_hosts = trust;
        self
    }

    /// Accept any certificate from `host`
    pub fn trusted_host(mut self, host: impl Into<String>) -> Self {
        self.trust.trusted_hosts.insert(host.into());
        self
    }

    /// Deliver notifications on the main queue
    pub fn performs_callbacks_on_main_queue(mut self, on_main_queue: bool) -> Self {
        self.on_main_queue = on_main_queue;
        self
    }

    /// Observer notified before each callback
    pub fn delegate(mut self, delegate: Arc<dyn HttpOperationDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Count this operation in `indicator` while it runs
    pub fn activity_indicator(mut self, indicator: Arc<NetworkActivityIndicator>) -> Self {
        self.activity = Some(indicator);
        self
    }

    /// Whether the operation counts towards its activity indicator
    pub fn updates_network_activity(mut self, updates: bool) -> Self {
        self.updates_network_activity = updates;
        self
    }

    /// Cache consulted and filled according to the request's cache policy
    pub fn response_cache(mut self, cache: Arc<dyn ResponseCache>) -> Self {
        self.response_cache = Some(cache);
        self
    }

    /// Create the operation
    pub fn build(self) -> Result<Arc<HttpOperation>> {
        let mut request = Request::new(self.url);
        request.set_method(self.method);
        for (name, value) in &self.headers {
            request.set_header(name, value)?;
        }
        request.set_body(self.body);
        request.set_timeout(self.timeout);
        request.set_cache_policy(self.cache_policy);

        let op = HttpOperation::assemble(request, self.activity, self.response_cache);
        op.set_output_sink(self.sink)?;
        op.set_trust_policy(self.trust)?;
        op.set_credential(self.credential);
        op.set_username(self.username);
        op.set_password(self.password);
        op.set_performs_callbacks_on_main_queue(self.on_main_queue);
        op.set_delegate(self.delegate);
        op.set_updates_network_activity(self.updates_network_activity);
        Ok(op)
    }
}
