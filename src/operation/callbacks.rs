//! Closure slots for operation events

use std::sync::{Arc, PoisonError, RwLock};

use crate::auth::Challenge;
use crate::cache::CachedResponse;
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;

use super::HttpOperation;

/// Callback taking only the operation
pub type OperationCallback = Arc<dyn Fn(&HttpOperation) + Send + Sync>;
/// Callback for authentication challenges
pub type ChallengeCallback = Arc<dyn Fn(&HttpOperation, &Challenge) + Send + Sync>;
/// Callback for a received response
pub type ResponseCallback = Arc<dyn Fn(&HttpOperation, &Response) + Send + Sync>;
/// Callback for a chunk of body bytes sent or received
pub type DataCallback = Arc<dyn Fn(&HttpOperation, u64) + Send + Sync>;
/// Cache interceptor
pub type CacheCallback =
    Arc<dyn Fn(&HttpOperation, CachedResponse) -> Option<CachedResponse> + Send + Sync>;
/// Redirect interceptor
pub type RedirectCallback =
    Arc<dyn Fn(&HttpOperation, Request, &Response) -> Option<Request> + Send + Sync>;
/// Callback for the terminal failure
pub type FailureCallback = Arc<dyn Fn(&HttpOperation, &Error) + Send + Sync>;

/// A replaceable callback
pub(crate) struct Slot<T>(RwLock<Option<T>>);

impl<T: Clone> Slot<T> {
    pub(crate) fn set(&self, value: Option<T>) {
        *self.0.write().unwrap_or_else(PoisonError::into_inner) = value;
    }

    pub(crate) fn get(&self) -> Option<T> {
        self.0.read().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

impl<T> Default for Slot<T> {
    fn default() -> Self {
        Self(RwLock::new(None))
    }
}

#[derive(Default)]
pub(crate) struct Callbacks {
    pub(crate) will_start: Slot<OperationCallback>,
    pub(crate) will_need_new_body_stream: Slot<OperationCallback>,
    pub(crate) will_send_authentication_challenge: Slot<ChallengeCallback>,
    pub(crate) did_start: Slot<OperationCallback>,
    pub(crate) did_receive_response: Slot<ResponseCallback>,
    pub(crate) did_receive_data: Slot<DataCallback>,
    pub(crate) did_send_data: Slot<DataCallback>,
    pub(crate) will_cache_response: Slot<CacheCallback>,
    pub(crate) will_send_request_for_redirect: Slot<RedirectCallback>,
    pub(crate) did_finish_loading: Slot<OperationCallback>,
    pub(crate) did_fail: Slot<FailureCallback>,
}
