//! Integration tests for ferry against a local HTTP server

mod common;

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::channel;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{HELLO, TestServer};
use ferry::{
    ActivitySink, CachePolicy, Credential, DataBody, Error, FileBody, FormBody,
    HttpOperation, HttpOperationDelegate, JsonBody, MemoryCache, Method, MultipartBody,
    NetworkActivityIndicator, OperationQueue, OutputSink, Progress, Request, Response, Result,
    Task, TransferOperation, Url,
};
use serde_json::Value;

const WAIT: Duration = Duration::from_secs(10);

fn get(server: &TestServer, path: &str) -> Arc<HttpOperation> {
    HttpOperation::with_url(Url::parse(&server.url(path)).unwrap())
}

fn post(server: &TestServer, path: &str, body: Arc<dyn ferry::RequestBody>) -> Arc<HttpOperation> {
    HttpOperation::builder(&server.url(path))
        .unwrap()
        .method(Method::POST)
        .body(body)
        .build()
        .unwrap()
}

fn record_events(op: &HttpOperation) -> Arc<Mutex<Vec<String>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let log = |name: &'static str| {
        let events = events.clone();
        move |_: &HttpOperation| events.lock().unwrap().push(name.to_string())
    };
    op.on_will_start(log("will_start"));
    op.on_did_start(log("did_start"));
    op.on_will_need_new_body_stream(log("will_need_new_body_stream"));
    op.on_did_finish_loading(log("did_finish_loading"));

    let e = events.clone();
    op.on_did_receive_response(move |_, _| e.lock().unwrap().push("did_receive_response".into()));
    let e = events.clone();
    op.on_did_receive_data(move |_, _| e.lock().unwrap().push("did_receive_data".into()));
    let e = events.clone();
    op.on_did_send_data(move |_, _| e.lock().unwrap().push("did_send_data".into()));
    let e = events.clone();
    op.on_will_send_authentication_challenge(move |_, _| {
        e.lock().unwrap().push("will_send_authentication_challenge".into())
    });
    let e = events.clone();
    op.on_did_fail(move |_, _| e.lock().unwrap().push("did_fail".into()));
    events
}

fn count(events: &Mutex<Vec<String>>, name: &str) -> usize {
    events.lock().unwrap().iter().filter(|e| *e == name).count()
}

fn echo(op: &HttpOperation) -> Value {
    op.response_json().unwrap()
}

#[test]
fn test_get_into_memory() -> Result<()> {
    let server = TestServer::start();
    let op = get(&server, "/hello");
    op.clone().start_and_wait_until_finished();

    assert!(op.error().is_none());
    assert_eq!(op.response_status_code(), Some(200));
    assert_eq!(op.response_status_string().as_deref(), Some("OK"));
    assert_eq!(op.response_string()?, HELLO);
    assert_eq!(op.response_mime_type().as_deref(), Some("text/plain"));
    assert_eq!(op.response_text_encoding_name().as_deref(), Some("utf-8"));
    assert_eq!(op.response_expected_content_length(), Some(HELLO.len() as u64));
    assert_eq!(op.bytes_received(), HELLO.len() as u64);
    assert_eq!(op.download_progress(), Progress::Fraction(1.0));
    assert!(op.start_date().is_some());
    assert!(op.finish_date().is_some());
    assert!(op.elapsed().is_some());
    assert!(op.task_state().is_finished());
    Ok(())
}

#[test]
fn test_notification_order() {
    let server = TestServer::start();
    let op = get(&server, "/hello");
    let events = record_events(&op);
    op.clone().start_and_wait_until_finished();

    let events = events.lock().unwrap().clone();
    assert_eq!(&events[..3], ["will_start", "did_start", "did_receive_response"]);
    assert_eq!(events.last().map(String::as_str), Some("did_finish_loading"));
    assert!(events.iter().any(|e| e == "did_receive_data"));
    assert!(!events.iter().any(|e| e == "did_fail"));
}

#[test]
fn test_delegate_runs_before_callback() {
    struct Recorder(Arc<Mutex<Vec<&'static str>>>);

    impl HttpOperationDelegate for Recorder {
        fn did_finish_loading(&self, _op: &HttpOperation) {
            self.0.lock().unwrap().push("delegate");
        }
    }

    let server = TestServer::start();
    let order = Arc::new(Mutex::new(Vec::new()));
    let op = HttpOperation::builder(&server.url("/hello"))
        .unwrap()
        .delegate(Arc::new(Recorder(order.clone())))
        .build()
        .unwrap();
    let o = order.clone();
    op.on_did_finish_loading(move |_| o.lock().unwrap().push("callback"));

    op.clone().start_and_wait_until_finished();
    assert_eq!(*order.lock().unwrap(), ["delegate", "callback"]);
}

#[test]
fn test_unknown_length() {
    let server = TestServer::start();
    let op = get(&server, "/unsized");
    op.clone().start_and_wait_until_finished();

    assert_eq!(op.response_string().unwrap(), HELLO);
    assert_eq!(op.response_expected_content_length(), None);
    assert!(op.download_progress().is_unknown());
}

#[test]
fn test_suggested_file_name() {
    let server = TestServer::start();
    let op = get(&server, "/attachment");
    op.clone().start_and_wait_until_finished();
    assert_eq!(op.response_expected_file_name().as_deref(), Some("report.txt"));
}

#[test]
fn test_not_found_is_not_a_failure() {
    let server = TestServer::start();
    let op = get(&server, "/missing");
    let events = record_events(&op);
    op.clone().start_and_wait_until_finished();

    assert!(op.error().is_none());
    assert_eq!(op.response_status_code(), Some(404));
    assert_eq!(count(&events, "did_finish_loading"), 1);
    assert_eq!(count(&events, "did_fail"), 0);
}

#[test]
fn test_unreachable_host_fails_once() {
    let op = HttpOperation::with_url(Url::parse("http://127.0.0.1:9/").unwrap());
    let events = record_events(&op);
    op.clone().start_and_wait_until_finished();

    assert!(matches!(op.error().as_deref(), Some(Error::Network { .. })));
    assert_eq!(count(&events, "did_fail"), 1);
    assert_eq!(count(&events, "did_finish_loading"), 0);
    assert!(op.response().is_none());
}

#[test]
fn test_file_sink() {
    let server = TestServer::start();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("hello.txt");

    let op = HttpOperation::builder(&server.url("/hello"))
        .unwrap()
        .response_file_path(&path)
        .build()
        .unwrap();
    op.clone().start_and_wait_until_finished();

    assert!(op.error().is_none());
    assert_eq!(std::fs::read_to_string(&path).unwrap(), HELLO);
    assert!(op.response_data().is_empty());
    assert_eq!(op.bytes_received(), HELLO.len() as u64);
}

#[test]
fn test_file_sink_in_use() {
    let server = TestServer::start();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.bin");

    let (tx, rx) = channel();
    let slow = HttpOperation::builder(&server.url("/slow"))
        .unwrap()
        .response_file_path(&path)
        .build()
        .unwrap();
    slow.on_did_receive_data(move |_, _| {
        let _ = tx.send(());
    });
    slow.clone().start();
    rx.recv_timeout(WAIT).unwrap();

    let second = HttpOperation::builder(&server.url("/hello"))
        .unwrap()
        .response_file_path(&path)
        .build()
        .unwrap();
    second.clone().start_and_wait_until_finished();
    assert!(matches!(second.error().as_deref(), Some(Error::SinkInUse(_))));

    slow.cancel();
    slow.task_state().wait_until_finished();
}

#[test]
fn test_writer_sink() {
    #[derive(Clone, Default)]
    struct Shared(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Shared {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    let server = TestServer::start();
    let shared = Shared::default();
    let op = get(&server, "/hello");
    op.set_output_sink(OutputSink::Writer(Box::new(shared.clone()))).unwrap();
    op.clone().start_and_wait_until_finished();

    assert_eq!(*shared.0.lock().unwrap(), HELLO.as_bytes());
}

#[test]
fn test_redirects_followed() {
    let server = TestServer::start();
    let op = get(&server, "/redirect/3");
    op.clone().start_and_wait_until_finished();

    assert_eq!(op.response_status_code(), Some(200));
    assert_eq!(op.response_string().unwrap(), "arrived");
    assert_eq!(op.response_url().unwrap().path(), "/redirect/0");
    assert_eq!(server.hits("/redirect/1"), 1);
}

#[test]
fn test_redirect_loop_fails() {
    let server = TestServer::start();
    let op = get(&server, "/loop");
    op.clone().start_and_wait_until_finished();

    match op.error().as_deref() {
        Some(Error::Network { code, .. }) => assert_eq!(*code, -1007),
        other => panic!("expected a redirect failure, got {:?}", other),
    }
}

#[test]
fn test_redirect_suppressed() {
    let server = TestServer::start();
    let op = get(&server, "/redirect/2");
    let seen = Arc::new(AtomicUsize::new(0));
    let s = seen.clone();
    op.on_will_send_request_for_redirect(move |_, proposed: Request, response: &Response| {
        s.fetch_add(1, Ordering::SeqCst);
        assert_eq!(response.status_code(), 302);
        assert_eq!(proposed.url().path(), "/redirect/1");
        None
    });
    op.clone().start_and_wait_until_finished();

    assert!(op.error().is_none());
    assert_eq!(op.response_status_code(), Some(302));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    assert_eq!(server.hits("/redirect/1"), 0);
}

#[test]
fn test_redirect_rewritten() {
    let server = TestServer::start();
    let op = get(&server, "/redirect/5");
    let target = server.url("/hello");
    op.on_will_send_request_for_redirect(move |_, mut proposed: Request, _| {
        proposed.set_url(Url::parse(&target).unwrap());
        Some(proposed)
    });
    op.clone().start_and_wait_until_finished();
    assert_eq!(op.response_string().unwrap(), HELLO);
}

#[test]
fn test_see_other_switches_to_get() {
    let server = TestServer::start();
    let op = post(&server, "/see-other", Arc::new(DataBody::text("payload")));
    op.clone().start_and_wait_until_finished();

    let echo = echo(&op);
    assert_eq!(echo["method"], "GET");
    assert_eq!(echo["body_len"], 0);
    assert!(echo["headers"].get("content-type").is_none());
}

#[test]
fn test_temporary_redirect_resends_body() {
    let server = TestServer::start();
    let op = post(&server, "/temporary", Arc::new(DataBody::text("payload")));
    let events = record_events(&op);
    op.clone().start_and_wait_until_finished();

    let echo = echo(&op);
    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["body"], "payload");
    assert_eq!(count(&events, "will_need_new_body_stream"), 1);
}

#[test]
fn test_data_body_upload() {
    let server = TestServer::start();
    let payload = "The quick brown fox jumps over the lazy dog";
    let op = post(&server, "/echo", Arc::new(DataBody::text(payload)));

    let sent = Arc::new(AtomicU64::new(0));
    let s = sent.clone();
    op.on_did_send_data(move |_, bytes| {
        s.fetch_add(bytes, Ordering::SeqCst);
    });
    op.clone().start_and_wait_until_finished();

    let echo = echo(&op);
    assert_eq!(echo["method"], "POST");
    assert_eq!(echo["body"], payload);
    assert!(echo["headers"]["content-type"].as_str().unwrap().starts_with("text/plain"));
    assert_eq!(op.bytes_sent(), payload.len() as u64);
    assert_eq!(sent.load(Ordering::SeqCst), payload.len() as u64);
    assert_eq!(op.upload_progress(), Progress::Fraction(1.0));
}

#[test]
fn test_untyped_data_defaults_to_octet_stream() {
    let server = TestServer::start();
    let op = post(&server, "/echo", Arc::new(DataBody::new(vec![1u8, 2, 3], None)));
    op.clone().start_and_wait_until_finished();

    let echo = echo(&op);
    assert_eq!(echo["headers"]["content-type"], "application/octet-stream");
    assert_eq!(echo["body_len"], 3);
}

#[test]
fn test_form_body_upload() {
    let server = TestServer::start();
    let form = FormBody::new();
    form.insert("make", "Ferrari");
    form.insert("model", "458 Italia");
    let op = post(&server, "/echo", Arc::new(form));
    op.clone().start_and_wait_until_finished();

    let echo = echo(&op);
    assert_eq!(echo["body"], "make=Ferrari&model=458+Italia");
    let content_type = echo["headers"]["content-type"].as_str().unwrap();
    assert!(content_type.starts_with("application/x-www-form-urlencoded"));
}

#[test]
fn test_json_body_upload() {
    let server = TestServer::start();
    let op = HttpOperation::builder(&server.url("/echo"))
        .unwrap()
        .method(Method::PUT)
        .json(&serde_json::json!({"make": "Ferrari", "year": 2010}))
        .unwrap()
        .build()
        .unwrap();
    op.clone().start_and_wait_until_finished();

    let echo = echo(&op);
    assert_eq!(echo["method"], "PUT");
    assert!(echo["headers"]["content-type"].as_str().unwrap().starts_with("application/json"));
    let sent: Value = serde_json::from_str(echo["body"].as_str().unwrap()).unwrap();
    assert_eq!(sent["make"], "Ferrari");
    assert_eq!(sent["year"], 2010);
}

#[test]
fn test_file_body_upload() {
    let server = TestServer::start();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("upload.txt");
    let content = "line\n".repeat(10_000);
    std::fs::write(&path, &content).unwrap();

    let op = post(&server, "/echo", Arc::new(FileBody::new(&path, None)));
    op.clone().start_and_wait_until_finished();

    let echo = echo(&op);
    assert_eq!(echo["body_len"], content.len());
    assert_eq!(op.bytes_sent(), content.len() as u64);
}

#[test]
fn test_missing_file_body_fails() {
    let server = TestServer::start();
    let dir = tempfile::tempdir().unwrap();
    let op = post(&server, "/echo", Arc::new(FileBody::new(dir.path().join("gone.txt"), None)));
    let events = record_events(&op);
    op.clone().start_and_wait_until_finished();

    assert!(matches!(op.error().as_deref(), Some(Error::SourceUnavailable { .. })));
    assert_eq!(count(&events, "did_fail"), 1);
    assert_eq!(count(&events, "did_finish_loading"), 0);
    assert_eq!(server.hits("/echo"), 0);
}

#[test]
fn test_multipart_upload() {
    let server = TestServer::start();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    std::fs::write(&path, "pit stop at lap 32").unwrap();

    let form = MultipartBody::new();
    form.add_string("driver", "Alonso");
    form.add_data("blob", vec![0u8, 159, 146, 150], Some("blob.bin".into()), None);
    form.add_file("notes", &path, None, None).unwrap();
    let expected_len = ferry::RequestBody::content_length(&form).unwrap();
    let boundary = form.boundary().to_string();

    let op = post(&server, "/echo", Arc::new(form));
    op.clone().start_and_wait_until_finished();

    let echo = echo(&op);
    let content_type = echo["headers"]["content-type"].as_str().unwrap();
    assert_eq!(content_type, format!("multipart/form-data; boundary={}", boundary));
    assert_eq!(echo["body_len"], expected_len);
    let body = echo["body"].as_str().unwrap();
    assert!(body.contains("name=\"driver\""));
    assert!(body.contains("Alonso"));
    assert!(body.contains("filename=\"notes.txt\""));
    assert!(body.contains("pit stop at lap 32"));
    assert!(body.trim_end().ends_with(&format!("--{}--", boundary)));
    assert_eq!(op.bytes_sent(), expected_len);
}

#[test]
fn test_basic_auth_from_username() {
    let server = TestServer::start();
    let op = HttpOperation::builder(&server.url("/basic-auth/user/pass"))
        .unwrap()
        .basic_auth("user", "pass")
        .build()
        .unwrap();
    let events = record_events(&op);
    op.clone().start_and_wait_until_finished();

    assert_eq!(op.response_status_code(), Some(200));
    assert_eq!(op.response_string().unwrap(), "authenticated");
    let challenge = op.authentication_challenge().unwrap();
    assert_eq!(challenge.scheme, "Basic");
    assert_eq!(challenge.realm.as_deref(), Some("ferry"));
    assert_eq!(challenge.previous_failure_count, 0);
    assert_eq!(count(&events, "will_send_authentication_challenge"), 1);

    let events = events.lock().unwrap();
    let start = events.iter().position(|e| e == "did_start").unwrap();
    let challenge = events
        .iter()
        .position(|e| e == "will_send_authentication_challenge")
        .unwrap();
    assert!(start < challenge);
}

#[test]
fn test_credential_supplied_by_challenge_callback() {
    let server = TestServer::start();
    let op = get(&server, "/basic-auth/ada/lovelace");
    op.on_will_send_authentication_challenge(|op, challenge| {
        assert_eq!(challenge.previous_failure_count, 0);
        op.set_credential(Some(Credential::basic("ada", "lovelace")));
    });
    op.clone().start_and_wait_until_finished();

    assert_eq!(op.response_status_code(), Some(200));
    assert_eq!(server.hits("/basic-auth/ada/lovelace"), 2);
}

#[test]
fn test_rejected_credential_is_not_resent() {
    let server = TestServer::start();
    let op = HttpOperation::builder(&server.url("/basic-auth/user/pass"))
        .unwrap()
        .basic_auth("user", "wrong")
        .build()
        .unwrap();
    let events = record_events(&op);
    op.clone().start_and_wait_until_finished();

    assert!(op.error().is_none());
    assert_eq!(op.response_status_code(), Some(401));
    assert_eq!(server.hits("/basic-auth/user/pass"), 2);
    assert_eq!(count(&events, "will_send_authentication_challenge"), 2);
    assert_eq!(op.authentication_challenge().unwrap().previous_failure_count, 1);
    assert_eq!(count(&events, "did_finish_loading"), 1);
}

#[test]
fn test_challenge_without_credential_finishes_with_401() {
    let server = TestServer::start();
    let op = get(&server, "/basic-auth/user/pass");
    op.clone().start_and_wait_until_finished();

    assert!(op.error().is_none());
    assert_eq!(op.response_status_code(), Some(401));
    assert_eq!(server.hits("/basic-auth/user/pass"), 1);
}

#[test]
fn test_auth_retransmits_body() {
    let server = TestServer::start();
    let op = HttpOperation::builder(&server.url("/basic-auth/user/pass"))
        .unwrap()
        .method(Method::POST)
        .body(Arc::new(JsonBody::from_string(r#"{"lap":32}"#)))
        .basic_auth("user", "pass")
        .build()
        .unwrap();
    let events = record_events(&op);
    op.clone().start_and_wait_until_finished();

    assert_eq!(op.response_status_code(), Some(200));
    assert_eq!(count(&events, "will_need_new_body_stream"), 1);
    assert_eq!(op.bytes_sent(), 10);
}

#[test]
fn test_cancel_during_download() {
    let server = TestServer::start();
    let op = get(&server, "/slow");
    let events = record_events(&op);

    let (tx, rx) = channel();
    op.on_did_receive_data(move |_, _| {
        let _ = tx.send(());
    });
    op.clone().start();
    rx.recv_timeout(WAIT).unwrap();

    op.cancel();
    op.task_state().wait_until_finished();

    assert!(op.task_state().is_cancelled());
    assert!(op.error().unwrap().is_cancelled());
    assert_eq!(count(&events, "did_fail"), 1);
    assert_eq!(count(&events, "did_finish_loading"), 0);
    assert!(op.bytes_received() < (common::SLOW_CHUNK_LEN * common::SLOW_CHUNKS) as u64);
}

#[test]
fn test_finish_during_download_stops_the_exchange() {
    let server = TestServer::start();
    let op = get(&server, "/slow");
    let events = record_events(&op);

    let (tx, rx) = channel();
    op.on_did_receive_data(move |op, _| {
        let _ = tx.send(op.bytes_received());
    });
    op.clone().start();
    rx.recv_timeout(WAIT).unwrap();

    op.finish();
    assert!(op.task_state().is_finished());
    assert!(op.error().unwrap().is_cancelled());

    let received = op.bytes_received();
    std::thread::sleep(Duration::from_secs(1));
    assert!(op.bytes_received() <= received + 16 * common::SLOW_CHUNK_LEN as u64);

    let events = events.lock().unwrap().clone();
    assert_eq!(events.iter().filter(|e| *e == "did_fail").count(), 1);
    assert_eq!(events.last().map(String::as_str), Some("did_fail"));
    assert!(!events.iter().any(|e| e == "did_finish_loading"));
}

#[test]
fn test_redirect_past_limit_can_be_suppressed() {
    let server = TestServer::start();
    let op = get(&server, "/loop");
    let asked = Arc::new(AtomicUsize::new(0));
    let a = asked.clone();
    op.on_will_send_request_for_redirect(move |_, proposed: Request, _| {
        if a.fetch_add(1, Ordering::SeqCst) < ferry::session::DEFAULT_MAX_REDIRECTS {
            Some(proposed)
        } else {
            None
        }
    });
    op.clone().start_and_wait_until_finished();

    assert!(op.error().is_none());
    assert_eq!(op.response_status_code(), Some(302));
    assert_eq!(asked.load(Ordering::SeqCst), ferry::session::DEFAULT_MAX_REDIRECTS + 1);
}

#[test]
fn test_cache_serves_repeat_requests() {
    let server = TestServer::start();
    let cache = Arc::new(MemoryCache::new());

    let fetch = || {
        let op = HttpOperation::builder(&server.url("/cached"))
            .unwrap()
            .cache_policy(CachePolicy::ReturnCacheDataElseLoad)
            .response_cache(cache.clone())
            .build()
            .unwrap();
        op.clone().start_and_wait_until_finished();
        op
    };

    let first = fetch();
    assert_eq!(first.response_string().unwrap(), "visit 1");
    assert_eq!(cache.len(), 1);

    let second = fetch();
    assert_eq!(second.response_string().unwrap(), "visit 1");
    assert_eq!(second.response_status_code(), Some(200));
    assert_eq!(server.hits("/cached"), 1);
}

#[test]
fn test_cache_reload_ignores_stored_entry() {
    let server = TestServer::start();
    let cache = Arc::new(MemoryCache::new());

    for expected in ["visit 1", "visit 2"] {
        let op = HttpOperation::builder(&server.url("/cached"))
            .unwrap()
            .cache_policy(CachePolicy::ReloadIgnoringCacheData)
            .response_cache(cache.clone())
            .build()
            .unwrap();
        op.clone().start_and_wait_until_finished();
        assert_eq!(op.response_string().unwrap(), expected);
    }
    assert!(cache.is_empty());
}

#[test]
fn test_cache_interceptor_can_refuse() {
    let server = TestServer::start();
    let cache = Arc::new(MemoryCache::new());
    let op = HttpOperation::builder(&server.url("/hello"))
        .unwrap()
        .response_cache(cache.clone())
        .build()
        .unwrap();
    op.on_will_cache_response(|_, _| None);
    op.clone().start_and_wait_until_finished();

    assert_eq!(op.response_string().unwrap(), HELLO);
    assert!(cache.is_empty());
}

#[test]
fn test_no_store_is_not_cached() {
    let server = TestServer::start();
    let cache = Arc::new(MemoryCache::new());
    let op = HttpOperation::builder(&server.url("/no-store"))
        .unwrap()
        .response_cache(cache.clone())
        .build()
        .unwrap();
    op.clone().start_and_wait_until_finished();
    assert!(cache.is_empty());
}

#[test]
fn test_callbacks_on_main_queue() {
    let server = TestServer::start();
    let op = HttpOperation::builder(&server.url("/hello"))
        .unwrap()
        .performs_callbacks_on_main_queue(true)
        .build()
        .unwrap();
    let thread = Arc::new(Mutex::new(None));
    let t = thread.clone();
    op.on_did_finish_loading(move |_| {
        *t.lock().unwrap() = std::thread::current().name().map(str::to_string);
    });
    op.clone().start_and_wait_until_finished();

    assert_eq!(thread.lock().unwrap().as_deref(), Some("ferry-main"));
}

#[test]
fn test_queue_runs_operations() {
    let server = TestServer::start();
    let queue = OperationQueue::new();
    queue.set_max_concurrent_operation_count(2);

    let (tx, rx) = channel();
    queue.on_did_finish(move |queue| {
        let _ = tx.send(queue.bytes_downloaded());
    });

    let ops: Vec<_> = (0..3).map(|_| get(&server, "/hello")).collect();
    for op in &ops {
        queue.add(op.clone());
    }
    queue.wait_until_all_operations_are_finished();

    assert_eq!(rx.recv_timeout(WAIT).unwrap(), 3 * HELLO.len() as u64);
    for op in &ops {
        assert_eq!(op.response_string().unwrap(), HELLO);
    }
    assert_eq!(queue.operation_count(), 0);
    assert_eq!(queue.expected_download_bytes(), Some(3 * HELLO.len() as u64));
    assert_eq!(queue.download_progress(), Progress::Fraction(1.0));
    assert!(queue.elapsed().is_some());
}

#[test]
fn test_queue_cancel_all() {
    let server = TestServer::start();
    let queue = OperationQueue::new();
    queue.set_max_concurrent_operation_count(1);

    let ops: Vec<_> = (0..3).map(|_| get(&server, "/slow")).collect();
    for op in &ops {
        queue.add(op.clone());
    }
    queue.cancel_all_operations();
    queue.wait_until_all_operations_are_finished();

    for op in &ops {
        assert!(op.task_state().is_finished());
        assert!(op.task_state().is_cancelled());
    }
}

#[test]
fn test_activity_indicator() {
    #[derive(Default)]
    struct Recording(Mutex<Vec<bool>>);

    impl ActivitySink for Recording {
        fn set_network_active(&self, active: bool) {
            self.0.lock().unwrap().push(active);
        }
    }

    let server = TestServer::start();
    let sink = Arc::new(Recording::default());
    let indicator = NetworkActivityIndicator::with_idle_delay(sink.clone(), Duration::from_millis(20));

    let op = HttpOperation::builder(&server.url("/hello"))
        .unwrap()
        .activity_indicator(indicator.clone())
        .build()
        .unwrap();
    op.clone().start_and_wait_until_finished();
    assert_eq!(indicator.active_count(), 0);

    for _ in 0..100 {
        if !indicator.is_active() {
            break;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    assert_eq!(*sink.0.lock().unwrap(), [true, false]);
}

#[test]
fn test_transfer_operation() {
    let server = TestServer::start();
    let transfer = TransferOperation::new(Url::parse(&server.url("/hello")).unwrap());
    transfer.clone().start_and_wait_until_finished();

    assert!(transfer.error().is_none());
    assert_eq!(transfer.response().unwrap().status_code(), 200);
    assert_eq!(transfer.response_data(), HELLO.as_bytes());
    assert_eq!(transfer.bytes_received(), HELLO.len() as u64);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_wait_from_async_context() -> Result<()> {
    let server = TestServer::start();
    let op = get(&server, "/hello");

    let waiter = op.clone();
    tokio::task::spawn_blocking(move || waiter.start_and_wait_until_finished())
        .await
        .map_err(|e| Error::Internal(e.to_string()))?;

    assert_eq!(op.response_string()?, HELLO);
    Ok(())
}
