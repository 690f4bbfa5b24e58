//! The request/response loop run on the network worker
//!
//! One call to [`run`] covers every hop of an exchange: the initial request,
//! each followed redirect and each authentication round. Only the final
//! response is reported and streamed into the sink.

use std::io::{self, Read};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex, PoisonError};

use bytes::Bytes;
use futures_util::StreamExt;
use http::header::{
    AUTHORIZATION, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, LOCATION, WWW_AUTHENTICATE,
};
use http::{Method, StatusCode};
use tokio::sync::mpsc;
use url::Url;

use super::sink::OpenSink;
use super::worker::Worker;
use super::TransferHandler;
use crate::auth::{Challenge, Credential};
use crate::body::{BodyStream, effective_content_type};
use crate::cache::CachedResponse;
use crate::error::CODE_TOO_MANY_REDIRECTS;
use crate::progress::ProgressEvent;
use crate::request::{CachePolicy, Request};
use crate::response::Response;
use crate::{Error, Result};

/// First error raised by the body reader of the current attempt.
type ReadFailure = Arc<Mutex<Option<io::Error>>>;

pub(super) async fn run<H: TransferHandler>(op: &Arc<H>, worker: &Worker) -> Result<()> {
    let state = op.transfer();
    let mut sink = OpenSink::open(state.take_sink()?).await?;
    let mut request = state.request();
    let cache_key = request.url.clone();
    let cache = op.response_cache().filter(|_| {
        request.method == Method::GET && request.cache_policy != CachePolicy::ReloadIgnoringCacheData
    });

    state.report(|| op.did_start());

    if request.cache_policy == CachePolicy::ReturnCacheDataElseLoad {
        if let Some(entry) = cache.as_ref().and_then(|cache| cache.get(&cache_key)) {
            tracing::debug!("Serving {} from cache", cache_key);
            return deliver_cached(&**op, &mut sink, entry).await;
        }
    }

    let config = worker.config();
    let mut redirects = 0;
    let mut transmissions = 0u32;
    let mut credential: Option<Credential> = None;
    let mut rejected: Vec<Credential> = Vec::new();

    let (response, current) = loop {
        let failure = ReadFailure::default();
        let builder = prepare(op, worker, &request, credential.as_ref(), transmissions > 0, &failure)?;
        transmissions += 1;

        let response = match builder.send().await {
            Ok(response) => response,
            Err(error) => {
                let read_failure = failure.lock().unwrap_or_else(PoisonError::into_inner).take();
                return Err(match read_failure {
                    Some(read_failure) => Error::Io(read_failure),
                    None => Error::from_reqwest(error),
                });
            }
        };
        let current = Response::new(
            response.url().clone(),
            response.status(),
            response.headers().clone(),
        );

        if let Some(proposed) = redirect_target(&request, &current)? {
            match op.will_follow_redirect(proposed, &current).await {
                Some(_) if redirects >= config.max_redirects() => {
                    return Err(Error::Network {
                        code: CODE_TOO_MANY_REDIRECTS,
                        message: format!("Exceeded {} redirects", config.max_redirects()),
                    });
                }
                Some(next) => {
                    tracing::debug!("Following redirect {} -> {}", request.url, next.url);
                    if !same_origin(&request.url, &next.url) {
                        credential = None;
                    }
                    redirects += 1;
                    request = next;
                    continue;
                }
                None => tracing::debug!("Redirect from {} suppressed", request.url),
            }
        } else if current.status() == StatusCode::UNAUTHORIZED {
            if let Some(used) = credential.take() {
                rejected.push(used);
            }
            let failures = rejected.len() as u32;
            let host = request.url.host_str().unwrap_or_default().to_string();
            let challenge = current
                .header(WWW_AUTHENTICATE.as_str())
                .and_then(|header| Challenge::parse(&host, &header, failures));

            if let Some(challenge) = challenge.filter(|_| failures < config.max_auth_attempts()) {
                tracing::debug!(
                    "Authentication challenge from {} ({}), {} previous failures",
                    challenge.host,
                    challenge.scheme,
                    failures
                );
                match op.credential_for(&challenge).await {
                    Some(next) if !rejected.contains(&next) => {
                        credential = Some(next);
                        continue;
                    }
                    Some(_) => tracing::debug!("Credential for {} was already rejected", host),
                    None => tracing::debug!("No credential supplied for {}", host),
                }
            }
        }

        break (response, current);
    };

    let current = Arc::new(current);
    state.response.store(Some(current.clone()));
    state.report(|| {
        op.did_receive_response(&current);
        state.notify_progress(ProgressEvent::Download);
    });

    let mut body = response.bytes_stream();
    while let Some(chunk) = body.next().await {
        let chunk = chunk.map_err(Error::from_reqwest)?;
        if chunk.is_empty() {
            continue;
        }
        let len = chunk.len() as u64;
        sink.write(&state.data, chunk).await?;
        state.bytes_received.fetch_add(len, Ordering::AcqRel);
        state.report(|| {
            op.did_receive_data(len);
            state.notify_progress(ProgressEvent::Download);
        });
    }
    sink.flush().await?;

    if let Some(cache) = cache.filter(|_| sink.is_memory() && is_cacheable(&request, &current)) {
        let entry = CachedResponse::new((*current).clone(), state.data());
        match op.will_cache_response(entry).await {
            Some(entry) => {
                tracing::debug!("Caching response for {}", cache_key);
                cache.put(&cache_key, entry);
            }
            None => tracing::debug!("Caching of {} suppressed", cache_key),
        }
    }

    Ok(())
}

async fn deliver_cached<H: TransferHandler>(
    op: &H,
    sink: &mut OpenSink,
    entry: CachedResponse,
) -> Result<()> {
    let state = op.transfer();
    let response = Arc::new(entry.response);
    state.response.store(Some(response.clone()));
    state.report(|| op.did_receive_response(&response));

    let len = entry.data.len() as u64;
    if len > 0 {
        sink.write(&state.data, entry.data).await?;
        state.bytes_received.fetch_add(len, Ordering::AcqRel);
        state.report(|| {
            op.did_receive_data(len);
            state.notify_progress(ProgressEvent::Download);
        });
    }
    sink.flush().await
}

fn prepare<H: TransferHandler>(
    op: &Arc<H>,
    worker: &Worker,
    request: &Request,
    credential: Option<&Credential>,
    retransmission: bool,
    failure: &ReadFailure,
) -> Result<reqwest::RequestBuilder> {
    let host = request.url.host_str().unwrap_or_default();
    let mut builder = worker
        .client(op.trusts_host(host))
        .request(request.method.clone(), request.url.clone())
        .headers(request.headers.clone());

    if let Some(timeout) = request.timeout {
        builder = builder.timeout(timeout);
    }
    if let Some(credential) = credential {
        builder = builder.header(AUTHORIZATION, credential.to_header_value());
    }

    let state = op.transfer();
    state.bytes_sent.store(0, Ordering::Release);

    match &request.body {
        Some(body) => {
            if retransmission {
                tracing::debug!("Opening a new body stream for {}", request.url);
                state.report(|| op.will_need_new_body_stream());
            }
            let stream = body.open_stream()?;
            let length = body.content_length();
            state.set_expected_upload(length);

            if !request.headers.contains_key(CONTENT_TYPE) {
                builder = builder.header(CONTENT_TYPE, effective_content_type(body.as_ref()));
            }
            if let Some(length) = length {
                builder = builder.header(CONTENT_LENGTH, length);
            }
            let chunk_len = worker.config().stream_chunk_len();
            builder = builder.body(upload_body(op, stream, chunk_len, failure.clone()));
        }
        None => state.set_expected_upload(Some(0)),
    }

    Ok(builder)
}

/// Stream `reader` to the transport, counting bytes as they are handed over.
fn upload_body<H: TransferHandler>(
    op: &Arc<H>,
    reader: BodyStream,
    chunk_len: usize,
    failure: ReadFailure,
) -> reqwest::Body {
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(1);
    tokio::spawn(pump_body(reader, chunk_len, tx, failure));

    let chunks = futures_util::stream::unfold((rx, Arc::clone(op)), |(mut rx, op)| async move {
        let item = rx.recv().await?;
        if let Ok(chunk) = &item {
            let state = op.transfer();
            let len = chunk.len() as u64;
            state.bytes_sent.fetch_add(len, Ordering::AcqRel);
            state.report(|| {
                op.did_send_data(len);
                state.notify_progress(ProgressEvent::Upload);
            });
        }
        Some((item, (rx, op)))
    });

    reqwest::Body::wrap_stream(chunks)
}

/// Read the blocking body stream off the runtime thread, one chunk at a time.
async fn pump_body(
    mut reader: BodyStream,
    chunk_len: usize,
    tx: mpsc::Sender<io::Result<Bytes>>,
    failure: ReadFailure,
) {
    loop {
        let read = tokio::task::spawn_blocking(move || {
            let mut buf = vec![0; chunk_len];
            let result = loop {
                match reader.read(&mut buf) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            };
            let chunk = result.map(|n| {
                buf.truncate(n);
                Bytes::from(buf)
            });
            (reader, chunk)
        })
        .await;

        let (returned, chunk) = match read {
            Ok(read) => read,
            Err(e) => {
                let _ = tx.send(Err(io::Error::other(e.to_string()))).await;
                return;
            }
        };
        reader = returned;

        match chunk {
            Ok(chunk) if chunk.is_empty() => return,
            Ok(chunk) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    return;
                }
            }
            Err(error) => {
                let message = error.to_string();
                *failure.lock().unwrap_or_else(PoisonError::into_inner) = Some(error);
                let _ = tx.send(Err(io::Error::other(message))).await;
                return;
            }
        }
    }
}

/// The request to issue next when `response` redirects, if it does.
fn redirect_target(request: &Request, response: &Response) -> Result<Option<Request>> {
    let status = response.status();
    if !matches!(status.as_u16(), 301 | 302 | 303 | 307 | 308) {
        return Ok(None);
    }
    let Some(location) = response.header(LOCATION.as_str()) else {
        return Ok(None);
    };

    let url = request
        .url
        .join(&location)
        .map_err(|e| Error::InvalidUrl(format!("{}: {}", location, e)))?;

    let mut next = request.clone();
    let switch_to_get = match status {
        StatusCode::SEE_OTHER => request.method != Method::HEAD,
        StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => request.method == Method::POST,
        _ => false,
    };
    if switch_to_get {
        next.method = Method::GET;
        next.body = None;
        next.headers.remove(CONTENT_TYPE);
        next.headers.remove(CONTENT_LENGTH);
    }
    if !same_origin(&request.url, &url) {
        next.headers.remove(AUTHORIZATION);
    }
    next.url = url;
    Ok(Some(next))
}

fn same_origin(a: &Url, b: &Url) -> bool {
    a.scheme() == b.scheme()
        && a.host_str() == b.host_str()
        && a.port_or_known_default() == b.port_or_known_default()
}

fn is_cacheable(request: &Request, response: &Response) -> bool {
    let no_store = response
        .header(CACHE_CONTROL.as_str())
        .is_some_and(|value| value.to_ascii_lowercase().contains("no-store"));
    request.method == Method::GET && response.status() == StatusCode::OK && !no_store
}
