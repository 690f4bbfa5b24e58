//! Single request/response exchanges on the shared network worker
//!
//! [`TransferState`] holds everything one exchange reads and produces. It is
//! embedded in both [`TransferOperation`] and
//! [`HttpOperation`](crate::HttpOperation); the exchange drives it through the
//! [`TransferHandler`] hooks.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use tokio::sync::Notify;
use url::Url;

use crate::auth::{Challenge, Credential};
use crate::cache::{CachedResponse, ResponseCache};
use crate::progress::{ProgressEvent, ProgressListener, ProgressSource};
use crate::request::Request;
use crate::response::Response;
use crate::task::{Task, TaskState};
use crate::{Error, Result};

mod exchange;
mod sink;
pub(crate) mod worker;

pub use sink::OutputSink;

const UNKNOWN_LENGTH: u64 = u64::MAX;

enum SinkSlot {
    Pending(OutputSink),
    Taken,
}

/// Shared state of one network exchange.
///
/// Counters and slots are written by the network worker and readable from
/// any thread without locking.
pub(crate) struct TransferState {
    request: Mutex<Request>,
    sink: Mutex<SinkSlot>,
    response: ArcSwapOption<Response>,
    error: ArcSwapOption<Error>,
    data: Mutex<Vec<u8>>,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    expected_upload: AtomicU64,
    cancel_requested: AtomicBool,
    cancel_notify: Notify,
    terminal: AtomicBool,
    listeners: Mutex<Vec<ProgressListener>>,
}

impl TransferState {
    pub(crate) fn new(request: Request) -> Self {
        Self {
            request: Mutex::new(request),
            sink: Mutex::new(SinkSlot::Pending(OutputSink::Memory)),
            response: ArcSwapOption::new(None),
            error: ArcSwapOption::new(None),
            data: Mutex::new(Vec::new()),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            expected_upload: AtomicU64::new(UNKNOWN_LENGTH),
            cancel_requested: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            terminal: AtomicBool::new(false),
            listeners: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of the request
    pub(crate) fn request(&self) -> Request {
        self.request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Mutate the request unless the task has started.
    pub(crate) fn update_request<T>(
        &self,
        task: &TaskState,
        update: impl FnOnce(&mut Request) -> Result<T>,
    ) -> Result<T> {
        let mut request = self.request.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_started() {
            return Err(Error::AlreadyStarted);
        }
        update(&mut request)
    }

    /// Replace the output sink unless the task has started.
    pub(crate) fn set_output_sink(&self, task: &TaskState, sink: OutputSink) -> Result<()> {
        let mut slot = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        if task.is_started() || matches!(*slot, SinkSlot::Taken) {
            return Err(Error::AlreadyStarted);
        }
        *slot = SinkSlot::Pending(sink);
        Ok(())
    }

    fn take_sink(&self) -> Result<OutputSink> {
        let mut slot = self.sink.lock().unwrap_or_else(PoisonError::into_inner);
        match std::mem::replace(&mut *slot, SinkSlot::Taken) {
            SinkSlot::Pending(sink) => Ok(sink),
            SinkSlot::Taken => Err(Error::Internal("Output sink already opened".to_string())),
        }
    }

    pub(crate) fn response(&self) -> Option<Arc<Response>> {
        self.response.load_full()
    }

    pub(crate) fn error(&self) -> Option<Arc<Error>> {
        self.error.load_full()
    }

    /// Bytes collected by an in-memory sink
    pub(crate) fn data(&self) -> Bytes {
        Bytes::copy_from_slice(&self.data.lock().unwrap_or_else(PoisonError::into_inner))
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Acquire)
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Acquire)
    }

    pub(crate) fn expected_upload(&self) -> Option<u64> {
        match self.expected_upload.load(Ordering::Acquire) {
            UNKNOWN_LENGTH => None,
            length => Some(length),
        }
    }

    fn set_expected_upload(&self, length: Option<u64>) {
        self.expected_upload
            .store(length.unwrap_or(UNKNOWN_LENGTH), Ordering::Release);
    }

    pub(crate) fn expected_download(&self) -> Option<u64> {
        self.response
            .load()
            .as_ref()
            .and_then(|response| response.expected_content_length())
    }

    fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::Release);
        self.cancel_notify.notify_one();
    }

    async fn cancelled(&self) {
        while !self.cancel_requested.load(Ordering::Acquire) {
            self.cancel_notify.notified().await;
        }
    }

    fn claim_terminal(&self) -> bool {
        !self.terminal.swap(true, Ordering::AcqRel)
    }

    /// Whether the single terminal outcome has been claimed
    fn is_terminal(&self) -> bool {
        self.terminal.load(Ordering::Acquire)
    }

    /// Run `notify` unless the terminal outcome has been claimed.
    pub(crate) fn report(&self, notify: impl FnOnce()) {
        if !self.is_terminal() {
            notify();
        }
    }

    fn notify_progress(&self, event: ProgressEvent) {
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener(event);
        }
    }
}

impl ProgressSource for TransferState {
    fn bytes_downloaded(&self) -> u64 {
        self.bytes_received()
    }

    fn bytes_uploaded(&self) -> u64 {
        self.bytes_sent()
    }

    fn expected_download_bytes(&self) -> Option<u64> {
        self.expected_download()
    }

    fn expected_upload_bytes(&self) -> Option<u64> {
        self.expected_upload()
    }

    fn add_progress_listener(&self, listener: ProgressListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }
}

/// Hooks an exchange calls while it runs, all on the network worker.
///
/// Interception hooks return futures so implementations may consult code
/// running on other threads before answering.
pub(crate) trait TransferHandler: Task {
    fn transfer(&self) -> &TransferState;

    /// Called once after the terminal hook; must lead to [`Task::finish`].
    fn finish_transfer(&self) {
        self.finish();
    }

    fn did_start(&self) {}

    fn will_need_new_body_stream(&self) {}

    fn did_send_data(&self, _bytes: u64) {}

    fn did_receive_response(&self, _response: &Arc<Response>) {}

    fn did_receive_data(&self, _bytes: u64) {}

    fn will_follow_redirect(
        &self,
        proposed: Request,
        _response: &Response,
    ) -> impl Future<Output = Option<Request>> + Send {
        async move { Some(proposed) }
    }

    fn credential_for(&self, _challenge: &Challenge) -> impl Future<Output = Option<Credential>> + Send {
        async { None }
    }

    fn will_cache_response(
        &self,
        entry: CachedResponse,
    ) -> impl Future<Output = Option<CachedResponse>> + Send {
        async move { Some(entry) }
    }

    fn response_cache(&self) -> Option<Arc<dyn ResponseCache>> {
        None
    }

    fn trusts_host(&self, _host: &str) -> bool {
        false
    }

    fn did_finish_loading(&self) {}

    fn did_fail(&self, _error: &Arc<Error>) {}
}

/// Begin the exchange for `op` on the network worker.
pub(crate) fn start<H: TransferHandler>(op: Arc<H>) {
    match worker::shared() {
        Ok(worker) => worker.spawn_detached(async move {
            let result = tokio::select! {
                biased;
                _ = op.transfer().cancelled() => Err(Error::Cancelled),
                result = exchange::run(&op, worker) => result,
            };
            complete(&*op, result);
        }),
        Err(error) => complete(&*op, Err(error)),
    }
}

/// React to `cancel()`: abandon a running exchange, or fail an unstarted one.
pub(crate) fn cancel<H: TransferHandler>(op: &H) {
    op.transfer().request_cancel();
    if !op.task_state().is_started() {
        tracing::debug!("Cancelled before start");
        complete(op, Err(Error::Cancelled));
    }
}

/// Stop a running exchange and report it cancelled, unless it already
/// reported a terminal outcome.
pub(crate) fn settle<H: TransferHandler>(op: &H) {
    let state = op.transfer();
    if !state.claim_terminal() {
        return;
    }
    state.request_cancel();
    let error = Arc::new(Error::Cancelled);
    state.error.store(Some(error.clone()));
    op.did_fail(&error);
}

/// Record the outcome, fire exactly one terminal hook and finish.
pub(crate) fn complete<H: TransferHandler>(op: &H, result: Result<()>) {
    let state = op.transfer();
    if !state.claim_terminal() {
        return;
    }

    match result {
        Ok(()) => op.did_finish_loading(),
        Err(error) => {
            tracing::debug!("Transfer failed: {}", error);
            let error = Arc::new(error);
            state.error.store(Some(error.clone()));
            op.did_fail(&error);
        }
    }
    op.finish_transfer();
}

/// A bare network exchange without the HTTP conveniences.
///
/// ```rust,no_run
/// use ferry::{Task, TransferOperation};
///
/// # fn main() -> ferry::Result<()> {
/// let transfer = TransferOperation::new("https://example.com/".parse().unwrap());
/// transfer.clone().start_and_wait_until_finished();
/// if let Some(error) = transfer.error() {
///     eprintln!("failed: {}", error);
/// } else {
///     println!("{} bytes", transfer.response_data().len());
/// }
/// # Ok(())
/// # }
/// ```
pub struct TransferOperation {
    task: TaskState,
    transfer: TransferState,
}

impl TransferOperation {
    /// A `GET` exchange for `url`
    pub fn new(url: Url) -> Arc<Self> {
        Self::with_request(Request::new(url))
    }

    /// An exchange for a prepared request
    pub fn with_request(request: Request) -> Arc<Self> {
        Arc::new(Self {
            task: TaskState::new(),
            transfer: TransferState::new(request),
        })
    }

    /// Snapshot of the outgoing request
    pub fn request(&self) -> Request {
        self.transfer.request()
    }

    /// Replace the outgoing request. Fails once started.
    pub fn set_request(&self, request: Request) -> Result<()> {
        self.transfer.update_request(&self.task, |current| {
            *current = request;
            Ok(())
        })
    }

    /// Choose where the response body goes. Fails once started.
    pub fn set_output_sink(&self, sink: OutputSink) -> Result<()> {
        self.transfer.set_output_sink(&self.task, sink)
    }

    /// Response metadata, once received
    pub fn response(&self) -> Option<Arc<Response>> {
        self.transfer.response()
    }

    /// Terminal error, if the exchange failed
    pub fn error(&self) -> Option<Arc<Error>> {
        self.transfer.error()
    }

    /// Body collected by the in-memory sink
    pub fn response_data(&self) -> Bytes {
        self.transfer.data()
    }

    /// Request body bytes sent
    pub fn bytes_sent(&self) -> u64 {
        self.transfer.bytes_sent()
    }

    /// Response body bytes received
    pub fn bytes_received(&self) -> u64 {
        self.transfer.bytes_received()
    }
}

impl Task for TransferOperation {
    fn task_state(&self) -> &TaskState {
        &self.task
    }

    fn execute(self: Arc<Self>) {
        start(self);
    }

    fn will_finish(&self) {
        settle(self);
    }

    fn did_cancel(&self) {
        cancel(self);
    }

    fn progress_source(&self) -> Option<&dyn ProgressSource> {
        Some(&self.transfer)
    }
}

impl TransferHandler for TransferOperation {
    fn transfer(&self) -> &TransferState {
        &self.transfer
    }
}
