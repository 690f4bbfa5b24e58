//! HTTP operations
//!
//! [`HttpOperation`] wraps one network exchange with convenience accessors,
//! progress fractions, an observer, per-event callbacks and interception of
//! redirects, caching and authentication challenges.
//!
//! Notifications are delivered in lifecycle order on the operation's own
//! serial queue, or on the [main queue](crate::dispatch::main_queue) when
//! [`set_performs_callbacks_on_main_queue`](HttpOperation::set_performs_callbacks_on_main_queue)
//! is enabled. For every event the observer runs before the callback.
//!
//! ```rust,no_run
//! use ferry::{HttpOperation, Task};
//!
//! # fn main() -> ferry::Result<()> {
//! let op = HttpOperation::builder("https://example.com/cars")?
//!     .header("Accept", "application/json")
//!     .build()?;
//! op.on_did_finish_loading(|op| {
//!     println!("{} -> {:?}", op.id(), op.response_status_code());
//! });
//! op.clone().start_and_wait_until_finished();
//! let body = op.response_string()?;
//! # let _ = body;
//! # Ok(())
//! # }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use http::{HeaderMap, Method};
use serde::de::DeserializeOwned;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::oneshot;
use url::Url;

use crate::activity::NetworkActivityIndicator;
use crate::auth::{Challenge, Credential, TrustPolicy};
use crate::body::RequestBody;
use crate::cache::{CachedResponse, ResponseCache};
use crate::delegate::HttpOperationDelegate;
use crate::dispatch::{self, Job, SerialQueue};
use crate::encoding::{self, QueryValue};
use crate::progress::{AtomicProgress, Progress, ProgressEvent, ProgressSource};
use crate::request::{CachePolicy, Request};
use crate::response::Response;
use crate::task::{Task, TaskState};
use crate::transfer::{self, OutputSink, TransferHandler, TransferState};
use crate::{Error, Result};

mod builder;
mod callbacks;

pub use builder::HttpOperationBuilder;
pub use callbacks::{
    CacheCallback, ChallengeCallback, DataCallback, FailureCallback, OperationCallback,
    RedirectCallback, ResponseCallback,
};
use callbacks::Callbacks;
pub(crate) use callbacks::Slot;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

enum Event {
    WillStart,
    WillNeedNewBodyStream,
    DidStart,
    DidReceiveResponse(Arc<Response>),
    DidReceiveData(u64),
    DidSendData(u64),
    DidFinishLoading,
    DidFail(Arc<Error>),
}

/// An observable HTTP request/response unit of work.
///
/// Created behind an `Arc`; run it with [`Task::start`], block on it with
/// [`Task::start_and_wait_until_finished`], or hand it to an
/// [`OperationQueue`](crate::OperationQueue). Request settings can only be
/// changed before it starts.
pub struct HttpOperation {
    this: Weak<HttpOperation>,
    id: String,
    task: TaskState,
    transfer: TransferState,
    delegate: RwLock<Option<Arc<dyn HttpOperationDelegate>>>,
    callbacks: Callbacks,
    credential: Mutex<Option<Credential>>,
    username: Mutex<Option<String>>,
    password: Mutex<Option<String>>,
    challenge: ArcSwapOption<Challenge>,
    trust: RwLock<TrustPolicy>,
    on_main_queue: AtomicBool,
    queue: SerialQueue,
    start_date: ArcSwapOption<OffsetDateTime>,
    finish_date: ArcSwapOption<OffsetDateTime>,
    download_progress: AtomicProgress,
    upload_progress: AtomicProgress,
    activity: Option<Arc<NetworkActivityIndicator>>,
    updates_network_activity: AtomicBool,
    holds_activity: AtomicBool,
    terminal_delivered: AtomicBool,
    response_cache: Option<Arc<dyn ResponseCache>>,
}

impl HttpOperation {
    /// A `GET` operation for `url`
    pub fn with_url(url: Url) -> Arc<Self> {
        Self::from_request(Request::new(url))
    }

    /// A `GET` operation for `url` with `query` appended to its query string.
    ///
    /// Keys are sorted and values escaped with `%20` for spaces.
    pub fn with_url_and_query(mut url: Url, query: &BTreeMap<String, QueryValue>) -> Arc<Self> {
        append_query(&mut url, query);
        Self::with_url(url)
    }

    /// An operation for a prepared request
    pub fn from_request(request: Request) -> Arc<Self> {
        Self::assemble(request, None, None)
    }

    /// Start configuring an operation for `url`
    pub fn builder(url: &str) -> Result<HttpOperationBuilder> {
        HttpOperationBuilder::new(url)
    }

    pub(crate) fn assemble(
        request: Request,
        activity: Option<Arc<NetworkActivityIndicator>>,
        response_cache: Option<Arc<dyn ResponseCache>>,
    ) -> Arc<Self> {
        let id = format!("ferry-op-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed));
        Arc::new_cyclic(|this| Self {
            this: this.clone(),
            queue: SerialQueue::new(id.clone()),
            id,
            task: TaskState::new(),
            transfer: TransferState::new(request),
            delegate: RwLock::new(None),
            callbacks: Callbacks::default(),
            credential: Mutex::new(None),
            username: Mutex::new(None),
            password: Mutex::new(None),
            challenge: ArcSwapOption::new(None),
            trust: RwLock::new(TrustPolicy::default()),
            on_main_queue: AtomicBool::new(false),
            start_date: ArcSwapOption::new(None),
            finish_date: ArcSwapOption::new(None),
            download_progress: AtomicProgress::new(),
            upload_progress: AtomicProgress::new(),
            activity,
            updates_network_activity: AtomicBool::new(true),
            holds_activity: AtomicBool::new(false),
            terminal_delivered: AtomicBool::new(false),
            response_cache,
        })
    }

    /// Process-unique identifier, `ferry-op-<n>`
    pub fn id(&self) -> &str {
        &self.id
    }

    // ---- request ----

    /// Snapshot of the outgoing request
    pub fn request(&self) -> Request {
        self.transfer.request()
    }

    /// URL of the outgoing request
    pub fn request_url(&self) -> Url {
        self.transfer.request().url
    }

    /// Method of the outgoing request
    pub fn request_method(&self) -> Method {
        self.transfer.request().method
    }

    /// Headers of the outgoing request
    pub fn request_headers(&self) -> HeaderMap {
        self.transfer.request().headers
    }

    /// Replace the whole request. Fails once started.
    pub fn set_request(&self, request: Request) -> Result<()> {
        self.update_request(|current| {
            *current = request;
            Ok(())
        })
    }

    /// Set the request method. Fails once started.
    pub fn set_method(&self, method: Method) -> Result<()> {
        self.update_request(|request| {
            request.set_method(method);
            Ok(())
        })
    }

    /// Set a request header, replacing any previous value
    pub fn set_header(&self, name: &str, value: &str) -> Result<()> {
        self.update_request(|request| request.set_header(name, value))
    }

    /// Set or clear the request body. Fails once started.
    pub fn set_body(&self, body: Option<Arc<dyn RequestBody>>) -> Result<()> {
        self.update_request(|request| {
            request.set_body(body);
            Ok(())
        })
    }

    /// Set the request timeout. Fails once started.
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.update_request(|request| {
            request.set_timeout(timeout);
            Ok(())
        })
    }

    /// Set the cache policy. Fails once started.
    pub fn set_cache_policy(&self, policy: CachePolicy) -> Result<()> {
        self.update_request(|request| {
            request.set_cache_policy(policy);
            Ok(())
        })
    }

    /// Choose where the response body goes. Fails once started.
    pub fn set_output_sink(&self, sink: OutputSink) -> Result<()> {
        self.transfer.set_output_sink(&self.task, sink)
    }

    /// Stream the response body into `path` instead of memory.
    pub fn set_response_file_path(&self, path: impl Into<PathBuf>) -> Result<()> {
        self.set_output_sink(OutputSink::File(path.into()))
    }

    fn update_request<T>(&self, update: impl FnOnce(&mut Request) -> Result<T>) -> Result<T> {
        self.transfer.update_request(&self.task, update)
    }

    // ---- response ----

    /// Response metadata, once received
    pub fn response(&self) -> Option<Arc<Response>> {
        self.transfer.response()
    }

    /// Body collected in memory; empty for file and writer sinks
    pub fn response_data(&self) -> Bytes {
        self.transfer.data()
    }

    /// Body decoded as UTF-8
    pub fn response_string(&self) -> Result<String> {
        Ok(String::from_utf8(self.response_data().to_vec())?)
    }

    /// Body deserialized from JSON
    pub fn response_json<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_slice(&self.response_data())?)
    }

    /// Headers of the final response
    pub fn response_headers(&self) -> Option<HeaderMap> {
        self.response().map(|response| response.headers().clone())
    }

    /// Status code of the final response
    pub fn response_status_code(&self) -> Option<u16> {
        self.response().map(|response| response.status_code())
    }

    /// Reason phrase for the status code, e.g. `Not Found`
    pub fn response_status_string(&self) -> Option<String> {
        self.response().map(|response| response.status_string())
    }

    /// `Content-Length` of the final response, when declared
    pub fn response_expected_content_length(&self) -> Option<u64> {
        self.response()
            .and_then(|response| response.expected_content_length())
    }

    /// File name from `Content-Disposition`, or the last path segment
    pub fn response_expected_file_name(&self) -> Option<String> {
        self.response().and_then(|response| response.suggested_filename())
    }

    /// MIME type without parameters
    pub fn response_mime_type(&self) -> Option<String> {
        self.response().and_then(|response| response.mime_type())
    }

    /// `charset` parameter of the content type
    pub fn response_text_encoding_name(&self) -> Option<String> {
        self.response()
            .and_then(|response| response.text_encoding_name())
    }

    /// Final URL after followed redirects
    pub fn response_url(&self) -> Option<Url> {
        self.response().map(|response| response.url().clone())
    }

    /// Terminal error, if the operation failed
    pub fn error(&self) -> Option<Arc<Error>> {
        self.transfer.error()
    }

    // ---- progress ----

    /// Request body bytes sent in the current transmission
    pub fn bytes_sent(&self) -> u64 {
        self.transfer.bytes_sent()
    }

    /// Response body bytes written to the sink
    pub fn bytes_received(&self) -> u64 {
        self.transfer.bytes_received()
    }

    /// Fraction of the response body received
    pub fn download_progress(&self) -> Progress {
        self.download_progress.load()
    }

    /// Fraction of the request body sent
    pub fn upload_progress(&self) -> Progress {
        self.upload_progress.load()
    }

    /// When execution began
    pub fn start_date(&self) -> Option<OffsetDateTime> {
        self.start_date.load_full().map(|date| *date)
    }

    /// When the operation finished
    pub fn finish_date(&self) -> Option<OffsetDateTime> {
        self.finish_date.load_full().map(|date| *date)
    }

    /// Time from start to finish, or to now while running
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.start_date()?;
        let end = self.finish_date().unwrap_or_else(OffsetDateTime::now_utc);
        Some(Duration::try_from(end - start).unwrap_or_default())
    }

    fn refresh_progress(&self, event: ProgressEvent) {
        match event {
            ProgressEvent::Download => self.download_progress.advance(Progress::from_bytes(
                self.transfer.bytes_received(),
                self.transfer.expected_download(),
            )),
            ProgressEvent::Upload => self.upload_progress.advance(Progress::from_bytes(
                self.transfer.bytes_sent(),
                self.transfer.expected_upload(),
            )),
        }
    }

    // ---- authentication and trust ----

    /// Explicit credential, if set
    pub fn credential(&self) -> Option<Credential> {
        self.credential
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Credential answering authentication challenges.
    ///
    /// Takes precedence over [`set_username`](Self::set_username) and may be
    /// set from a challenge notification.
    pub fn set_credential(&self, credential: Option<Credential>) {
        *self.credential.lock().unwrap_or_else(PoisonError::into_inner) = credential;
    }

    /// Username for basic authentication
    pub fn username(&self) -> Option<String> {
        self.username
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Username for basic authentication
    pub fn set_username(&self, username: Option<String>) {
        *self.username.lock().unwrap_or_else(PoisonError::into_inner) = username;
    }

    /// Password for basic authentication
    pub fn password(&self) -> Option<String> {
        self.password
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Password paired with [`set_username`](Self::set_username)
    pub fn set_password(&self, password: Option<String>) {
        *self.password.lock().unwrap_or_else(PoisonError::into_inner) = password;
    }

    /// Most recent challenge received from the server
    pub fn authentication_challenge(&self) -> Option<Challenge> {
        self.challenge.load_full().map(|challenge| (*challenge).clone())
    }

    fn resolved_credential(&self) -> Option<Credential> {
        if let Some(credential) = self.credential() {
            return Some(credential);
        }
        self.username()
            .map(|username| Credential::basic(username, self.password().unwrap_or_default()))
    }

    /// Certificate trust overrides
    pub fn trust_policy(&self) -> TrustPolicy {
        self.trust
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the certificate trust overrides. Fails once started.
    pub fn set_trust_policy(&self, policy: TrustPolicy) -> Result<()> {
        self.update_trust(|trust| *trust = policy)
    }

    /// Accept any certificate from any host. Fails once started.
    pub fn set_trust_all_hosts(&self, trust_all_hosts: bool) -> Result<()> {
        self.update_trust(|trust| trust.trust_all_hosts = trust_all_hosts)
    }

    /// Accept any certificate from `host`. Fails once started.
    pub fn add_trusted_host(&self, host: impl Into<String>) -> Result<()> {
        let host = host.into();
        self.update_trust(|trust| {
            trust.trusted_hosts.insert(host);
        })
    }

    fn update_trust(&self, update: impl FnOnce(&mut TrustPolicy)) -> Result<()> {
        let mut trust = self.trust.write().unwrap_or_else(PoisonError::into_inner);
        if self.task.is_started() {
            return Err(Error::AlreadyStarted);
        }
        update(&mut trust);
        Ok(())
    }

    // ---- dispatch, observer and activity ----

    /// Whether notifications go to the main queue
    pub fn performs_callbacks_on_main_queue(&self) -> bool {
        self.on_main_queue.load(Ordering::Acquire)
    }

    /// Deliver notifications on the main queue instead of this operation's
    /// own serial queue.
    pub fn set_performs_callbacks_on_main_queue(&self, on_main_queue: bool) {
        self.on_main_queue.store(on_main_queue, Ordering::Release);
    }

    /// Observer notified before each callback
    pub fn delegate(&self) -> Option<Arc<dyn HttpOperationDelegate>> {
        self.delegate
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the observer
    pub fn set_delegate(&self, delegate: Option<Arc<dyn HttpOperationDelegate>>) {
        *self.delegate.write().unwrap_or_else(PoisonError::into_inner) = delegate;
    }

    /// Whether a running operation counts towards its activity indicator
    pub fn updates_network_activity(&self) -> bool {
        self.updates_network_activity.load(Ordering::Acquire)
    }

    /// Whether a running operation counts towards its activity indicator
    pub fn set_updates_network_activity(&self, updates: bool) {
        self.updates_network_activity.store(updates, Ordering::Release);
    }

    // ---- callbacks ----

    /// Called before the exchange begins
    pub fn on_will_start<F>(&self, f: F)
    where
        F: Fn(&HttpOperation) + Send + Sync + 'static,
    {
        self.callbacks.will_start.set(Some(Arc::new(f)));
    }

    /// Called before the body is read again for a redirect or credential retry
    pub fn on_will_need_new_body_stream<F>(&self, f: F)
    where
        F: Fn(&HttpOperation) + Send + Sync + 'static,
    {
        self.callbacks.will_need_new_body_stream.set(Some(Arc::new(f)));
    }

    /// Called for each authentication challenge; may call
    /// [`set_credential`](Self::set_credential) to answer it.
    pub fn on_will_send_authentication_challenge<F>(&self, f: F)
    where
        F: Fn(&HttpOperation, &Challenge) + Send + Sync + 'static,
    {
        self.callbacks
            .will_send_authentication_challenge
            .set(Some(Arc::new(f)));
    }

    /// Called once the exchange runs on the network worker
    pub fn on_did_start<F>(&self, f: F)
    where
        F: Fn(&HttpOperation) + Send + Sync + 'static,
    {
        self.callbacks.did_start.set(Some(Arc::new(f)));
    }

    /// Called with the final response head
    pub fn on_did_receive_response<F>(&self, f: F)
    where
        F: Fn(&HttpOperation, &Response) + Send + Sync + 'static,
    {
        self.callbacks.did_receive_response.set(Some(Arc::new(f)));
    }

    /// Called with the size of each response body chunk
    pub fn on_did_receive_data<F>(&self, f: F)
    where
        F: Fn(&HttpOperation, u64) + Send + Sync + 'static,
    {
        self.callbacks.did_receive_data.set(Some(Arc::new(f)));
    }

    /// Called with the size of each request body chunk
    pub fn on_did_send_data<F>(&self, f: F)
    where
        F: Fn(&HttpOperation, u64) + Send + Sync + 'static,
    {
        self.callbacks.did_send_data.set(Some(Arc::new(f)));
    }

    /// Return a replacement entry, or `None` to skip caching.
    pub fn on_will_cache_response<F>(&self, f: F)
    where
        F: Fn(&HttpOperation, CachedResponse) -> Option<CachedResponse> + Send + Sync + 'static,
    {
        self.callbacks.will_cache_response.set(Some(Arc::new(f)));
    }

    /// Return the request to follow, or `None` to stop at the redirect response.
    pub fn on_will_send_request_for_redirect<F>(&self, f: F)
    where
        F: Fn(&HttpOperation, Request, &Response) -> Option<Request> + Send + Sync + 'static,
    {
        self.callbacks
            .will_send_request_for_redirect
            .set(Some(Arc::new(f)));
    }

    /// Terminal success callback
    pub fn on_did_finish_loading<F>(&self, f: F)
    where
        F: Fn(&HttpOperation) + Send + Sync + 'static,
    {
        self.callbacks.did_finish_loading.set(Some(Arc::new(f)));
    }

    /// Terminal failure callback, including cancellation
    pub fn on_did_fail<F>(&self, f: F)
    where
        F: Fn(&HttpOperation, &Error) + Send + Sync + 'static,
    {
        self.callbacks.did_fail.set(Some(Arc::new(f)));
    }

    // ---- delivery ----

    fn dispatch(&self, job: Job) {
        if self.performs_callbacks_on_main_queue() {
            dispatch::main_queue().dispatch(job);
        } else {
            self.queue.dispatch(job);
        }
    }

    fn post(&self, event: Event) {
        if let Some(op) = self.this.upgrade() {
            self.dispatch(Box::new(move || op.deliver(event)));
        }
    }

    /// Run `question` on the dispatch target and wait for its answer.
    fn ask<T, F>(&self, question: F) -> impl Future<Output = Option<T>> + Send
    where
        T: Send + 'static,
        F: FnOnce(&HttpOperation) -> T + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        if let Some(op) = self.this.upgrade() {
            self.dispatch(Box::new(move || {
                let _ = tx.send(question(&*op));
            }));
        }
        async move { rx.await.ok() }
    }

    fn deliver(&self, event: Event) {
        // nothing is delivered after the terminal notification
        if self.terminal_delivered.load(Ordering::Acquire) {
            return;
        }
        if matches!(event, Event::DidFinishLoading | Event::DidFail(_)) {
            self.terminal_delivered.store(true, Ordering::Release);
        }

        let delegate = self.delegate();
        let delegate = delegate.as_deref();
        let callbacks = &self.callbacks;

        match event {
            Event::WillStart => {
                if let Some(delegate) = delegate {
                    delegate.will_start(self);
                }
                if let Some(f) = callbacks.will_start.get() {
                    f(self);
                }
            }
            Event::WillNeedNewBodyStream => {
                if let Some(delegate) = delegate {
                    delegate.will_need_new_body_stream(self);
                }
                if let Some(f) = callbacks.will_need_new_body_stream.get() {
                    f(self);
                }
            }
            Event::DidStart => {
                if let Some(delegate) = delegate {
                    delegate.did_start(self);
                }
                if let Some(f) = callbacks.did_start.get() {
                    f(self);
                }
            }
            Event::DidReceiveResponse(response) => {
                if let Some(delegate) = delegate {
                    delegate.did_receive_response(self, &response);
                }
                if let Some(f) = callbacks.did_receive_response.get() {
                    f(self, &response);
                }
            }
            Event::DidReceiveData(bytes) => {
                if let Some(delegate) = delegate {
                    delegate.did_receive_data(self, bytes);
                }
                if let Some(f) = callbacks.did_receive_data.get() {
                    f(self, bytes);
                }
            }
            Event::DidSendData(bytes) => {
                if let Some(delegate) = delegate {
                    delegate.did_send_data(self, bytes);
                }
                if let Some(f) = callbacks.did_send_data.get() {
                    f(self, bytes);
                }
            }
            Event::DidFinishLoading => {
                if let Some(delegate) = delegate {
                    delegate.did_finish_loading(self);
                }
                if let Some(f) = callbacks.did_finish_loading.get() {
                    f(self);
                }
            }
            Event::DidFail(error) => {
                if let Some(delegate) = delegate {
                    delegate.did_fail(self, &error);
                }
                if let Some(f) = callbacks.did_fail.get() {
                    f(self, &error);
                }
            }
        }
    }

    fn intercept_redirect(&self, proposed: Request, response: &Response) -> Option<Request> {
        let proposed = match self.delegate() {
            Some(delegate) => delegate.will_send_request_for_redirect(self, proposed, response)?,
            None => proposed,
        };
        match self.callbacks.will_send_request_for_redirect.get() {
            Some(f) => f(self, proposed, response),
            None => Some(proposed),
        }
    }

    fn intercept_cache(&self, entry: CachedResponse) -> Option<CachedResponse> {
        let entry = match self.delegate() {
            Some(delegate) => delegate.will_cache_response(self, entry)?,
            None => entry,
        };
        match self.callbacks.will_cache_response.get() {
            Some(f) => f(self, entry),
            None => Some(entry),
        }
    }

    fn announce_challenge(&self, challenge: &Challenge) -> Option<Credential> {
        if let Some(delegate) = self.delegate() {
            delegate.will_send_authentication_challenge(self, challenge);
        }
        if let Some(f) = self.callbacks.will_send_authentication_challenge.get() {
            f(self, challenge);
        }
        self.resolved_credential()
    }
}

/// Append `query`, strictly encoded, after any query `url` already has.
pub(crate) fn append_query(url: &mut Url, query: &BTreeMap<String, QueryValue>) {
    let encoded = encoding::encode_query(query);
    if encoded.is_empty() {
        return;
    }
    let combined = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{}&{}", existing, encoded),
        _ => encoded,
    };
    url.set_query(Some(&combined));
}

impl Task for HttpOperation {
    fn task_state(&self) -> &TaskState {
        &self.task
    }

    fn execute(self: Arc<Self>) {
        self.start_date
            .store(Some(Arc::new(OffsetDateTime::now_utc())));
        let request = self.transfer.request();
        tracing::debug!(
            "Starting {}: {} {}",
            self.id,
            request.method(),
            request.url()
        );

        if self.updates_network_activity() {
            if let Some(activity) = &self.activity {
                activity.increment();
                self.holds_activity.store(true, Ordering::Release);
            }
        }

        self.transfer.report(|| self.post(Event::WillStart));
        transfer::start(self);
    }

    fn will_finish(&self) {
        transfer::settle(self);
        let now = OffsetDateTime::now_utc();
        self.finish_date.store(Some(Arc::new(now)));

        if self.holds_activity.swap(false, Ordering::AcqRel) {
            if let Some(activity) = &self.activity {
                activity.decrement();
            }
        }

        tracing::debug!(
            "Finished {} at {} with status {:?} after {:?}",
            self.id,
            now.format(&Rfc3339).unwrap_or_default(),
            self.response_status_code(),
            self.elapsed().unwrap_or_default()
        );
    }

    fn did_cancel(&self) {
        tracing::debug!("Cancelling {}", self.id);
        transfer::cancel(self);
    }

    fn progress_source(&self) -> Option<&dyn ProgressSource> {
        Some(&self.transfer)
    }
}

impl TransferHandler for HttpOperation {
    fn transfer(&self) -> &TransferState {
        &self.transfer
    }

    fn finish_transfer(&self) {
        if !self.task.is_started() {
            self.finish();
            return;
        }
        // flip to Finished behind the terminal notification
        match self.this.upgrade() {
            Some(op) => self.dispatch(Box::new(move || op.finish())),
            None => self.finish(),
        }
    }

    fn did_start(&self) {
        self.post(Event::DidStart);
    }

    fn will_need_new_body_stream(&self) {
        self.post(Event::WillNeedNewBodyStream);
    }

    fn did_send_data(&self, bytes: u64) {
        self.refresh_progress(ProgressEvent::Upload);
        self.post(Event::DidSendData(bytes));
    }

    fn did_receive_response(&self, response: &Arc<Response>) {
        self.refresh_progress(ProgressEvent::Upload);
        self.refresh_progress(ProgressEvent::Download);
        self.post(Event::DidReceiveResponse(response.clone()));
    }

    fn did_receive_data(&self, bytes: u64) {
        self.refresh_progress(ProgressEvent::Download);
        self.post(Event::DidReceiveData(bytes));
    }

    fn will_follow_redirect(
        &self,
        proposed: Request,
        response: &Response,
    ) -> impl Future<Output = Option<Request>> + Send {
        let response = response.clone();
        let answer = self.ask(move |op| op.intercept_redirect(proposed, &response));
        async move { answer.await.flatten() }
    }

    fn credential_for(&self, challenge: &Challenge) -> impl Future<Output = Option<Credential>> + Send {
        self.challenge.store(Some(Arc::new(challenge.clone())));
        let challenge = challenge.clone();
        let answer = self.ask(move |op| op.announce_challenge(&challenge));
        async move { answer.await.flatten() }
    }

    fn will_cache_response(
        &self,
        entry: CachedResponse,
    ) -> impl Future<Output = Option<CachedResponse>> + Send {
        let answer = self.ask(move |op| op.intercept_cache(entry));
        async move { answer.await.flatten() }
    }

    fn response_cache(&self) -> Option<Arc<dyn ResponseCache>> {
        self.response_cache.clone()
    }

    fn trusts_host(&self, host: &str) -> bool {
        self.trust
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .trusts(host)
    }

    fn did_finish_loading(&self) {
        self.refresh_progress(ProgressEvent::Upload);
        self.refresh_progress(ProgressEvent::Download);
        self.post(Event::DidFinishLoading);
    }

    fn did_fail(&self, error: &Arc<Error>) {
        self.post(Event::DidFail(error.clone()));
    }
}

impl fmt::Debug for HttpOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpOperation")
            .field("id", &self.id)
            .field("status", &self.task.status())
            .field("cancelled", &self.task.is_cancelled())
            .field("url", &self.request_url().as_str())
            .finish()
    }
}
