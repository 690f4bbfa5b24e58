//! Observer of a single HTTP operation

use crate::auth::Challenge;
use crate::cache::CachedResponse;
use crate::error::Error;
use crate::operation::HttpOperation;
use crate::request::Request;
use crate::response::Response;

/// Notifications about one [`HttpOperation`], in lifecycle order.
///
/// Exactly one of [`did_finish_loading`](Self::did_finish_loading) and
/// [`did_fail`](Self::did_fail) is delivered for an operation that was
/// started or cancelled.
pub trait HttpOperationDelegate: Send + Sync {
    /// The operation is about to begin its exchange.
    fn will_start(&self, _op: &HttpOperation) {}

    /// The request body is about to be read again for a retransmission.
    fn will_need_new_body_stream(&self, _op: &HttpOperation) {}

    /// The server asked for credentials.
    ///
    /// A credential set on `op` before this returns is used for the retry.
    fn will_send_authentication_challenge(&self, _op: &HttpOperation, _challenge: &Challenge) {}

    /// The exchange is running on the network worker.
    fn did_start(&self, _op: &HttpOperation) {}

    /// The final response head arrived; redirect and challenge responses
    /// that were acted on are not reported.
    fn did_receive_response(&self, _op: &HttpOperation, _response: &Response) {}

    /// `bytes` more of the response body were written to the sink.
    fn did_receive_data(&self, _op: &HttpOperation, _bytes: u64) {}

    /// `bytes` more of the request body were handed to the transport.
    fn did_send_data(&self, _op: &HttpOperation, _bytes: u64) {}

    /// Return a replacement entry, or `None` to keep the response out of the cache.
    fn will_cache_response(
        &self,
        _op: &HttpOperation,
        entry: CachedResponse,
    ) -> Option<CachedResponse> {
        Some(entry)
    }

    /// Return the request to follow the redirect with, or `None` to stop
    /// and treat `response` as final.
    fn will_send_request_for_redirect(
        &self,
        _op: &HttpOperation,
        request: Request,
        _response: &Response,
    ) -> Option<Request> {
        Some(request)
    }

    /// Terminal success. Any HTTP status counts.
    fn did_finish_loading(&self, _op: &HttpOperation) {}

    /// Terminal failure, including cancellation.
    fn did_fail(&self, _op: &HttpOperation, _error: &Error) {}
}
