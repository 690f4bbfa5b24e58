//! A small HTTP/1.1 server for exercising operations end to end.
//!
//! Every connection serves one request and is then closed.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};

pub const HELLO: &str = "hello world";
pub const SLOW_CHUNK_LEN: usize = 1024;
pub const SLOW_CHUNKS: usize = 1000;

type Hits = Arc<Mutex<HashMap<String, usize>>>;

pub struct TestServer {
    addr: SocketAddr,
    hits: Hits,
}

impl TestServer {
    /// Start a server on its own thread and runtime
    pub fn start() -> Self {
        let hits = Hits::default();
        let server_hits = hits.clone();
        let (tx, rx) = std::sync::mpsc::channel();

        std::thread::spawn(move || {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            runtime.block_on(async move {
                let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
                tx.send(listener.local_addr().unwrap()).unwrap();
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        continue;
                    };
                    tokio::spawn(handle(stream, server_hits.clone()));
                }
            });
        });

        Self {
            addr: rx.recv().unwrap(),
            hits,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Number of requests received for `path`
    pub fn hits(&self, path: &str) -> usize {
        self.hits.lock().unwrap().get(path).copied().unwrap_or(0)
    }
}

struct IncomingRequest {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl IncomingRequest {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

struct Reply {
    status: u16,
    reason: &'static str,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
    with_length: bool,
}

impl Reply {
    fn new(status: u16, reason: &'static str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status,
            reason,
            headers: Vec::new(),
            body: body.into(),
            with_length: true,
        }
    }

    fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    fn redirect(status: u16, location: &str) -> Self {
        let reason = match status {
            301 => "Moved Permanently",
            303 => "See Other",
            307 => "Temporary Redirect",
            _ => "Found",
        };
        Self::new(status, reason, "").header("Location", location)
    }
}

async fn handle(stream: TcpStream, hits: Hits) {
    let mut reader = BufReader::new(stream);
    let Some(request) = read_request(&mut reader).await else {
        return;
    };
    *hits.lock().unwrap().entry(request.path.clone()).or_default() += 1;

    let mut stream = reader.into_inner();
    if request.path == "/slow" {
        let _ = write_slow(&mut stream).await;
    } else {
        let reply = route(&request, &hits);
        let _ = write_reply(&mut stream, reply).await;
    }
    let _ = stream.shutdown().await;
}

fn route(request: &IncomingRequest, hits: &Hits) -> Reply {
    let path = request.path.split('?').next().unwrap_or_default();
    let text = "text/plain; charset=utf-8";

    match path {
        "/hello" => Reply::new(200, "OK", HELLO).header("Content-Type", text),
        "/unsized" => {
            let mut reply = Reply::new(200, "OK", HELLO).header("Content-Type", text);
            reply.with_length = false;
            reply
        }
        "/attachment" => Reply::new(200, "OK", HELLO)
            .header("Content-Type", "application/octet-stream")
            .header("Content-Disposition", "attachment; filename=\"report.txt\""),
        "/loop" => Reply::redirect(302, "/loop"),
        "/see-other" => Reply::redirect(303, "/echo"),
        "/temporary" => Reply::redirect(307, "/echo"),
        "/echo" => {
            let headers: HashMap<String, String> = request
                .headers
                .iter()
                .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
                .collect();
            let echo = serde_json::json!({
                "method": request.method,
                "path": request.path,
                "headers": headers,
                "body": String::from_utf8_lossy(&request.body),
                "body_len": request.body.len(),
            });
            Reply::new(200, "OK", echo.to_string()).header("Content-Type", "application/json")
        }
        "/cached" => {
            let count = hits.lock().unwrap().get(path).copied().unwrap_or(0);
            Reply::new(200, "OK", format!("visit {}", count)).header("Content-Type", text)
        }
        "/no-store" => Reply::new(200, "OK", HELLO)
            .header("Content-Type", text)
            .header("Cache-Control", "no-store"),
        "/missing" => Reply::new(404, "Not Found", "not found").header("Content-Type", text),
        _ => {
            if let Some(rest) = path.strip_prefix("/redirect/") {
                return match rest.parse::<u32>() {
                    Ok(0) => Reply::new(200, "OK", "arrived").header("Content-Type", text),
                    Ok(n) => Reply::redirect(302, &format!("/redirect/{}", n - 1)),
                    Err(_) => Reply::new(400, "Bad Request", ""),
                };
            }
            if let Some(rest) = path.strip_prefix("/basic-auth/") {
                let expected = format!("Basic {}", STANDARD.encode(rest.replacen('/', ":", 1)));
                return if request.header("authorization") == Some(expected.as_str()) {
                    Reply::new(200, "OK", "authenticated").header("Content-Type", text)
                } else {
                    Reply::new(401, "Unauthorized", "")
                        .header("WWW-Authenticate", "Basic realm=\"ferry\"")
                };
            }
            Reply::new(404, "Not Found", "")
        }
    }
}

async fn read_request(reader: &mut BufReader<TcpStream>) -> Option<IncomingRequest> {
    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = Vec::new();
    loop {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let (name, value) = trimmed.split_once(':')?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let mut request = IncomingRequest {
        method,
        path,
        headers,
        body: Vec::new(),
    };

    if let Some(length) = request.header("content-length") {
        let length: usize = length.parse().ok()?;
        let mut body = vec![0; length];
        reader.read_exact(&mut body).await.ok()?;
        request.body = body;
    } else if request
        .header("transfer-encoding")
        .is_some_and(|value| value.eq_ignore_ascii_case("chunked"))
    {
        request.body = read_chunked(reader).await?;
    }

    Some(request)
}

async fn read_chunked(reader: &mut BufReader<TcpStream>) -> Option<Vec<u8>> {
    let mut body = Vec::new();
    let mut line = String::new();
    loop {
        line.clear();
        reader.read_line(&mut line).await.ok()?;
        let size = line.trim().split(';').next()?;
        let size = usize::from_str_radix(size, 16).ok()?;
        if size == 0 {
            // trailers end with an empty line
            loop {
                line.clear();
                reader.read_line(&mut line).await.ok()?;
                if line.trim_end().is_empty() {
                    return Some(body);
                }
            }
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await.ok()?;
        line.clear();
        reader.read_line(&mut line).await.ok()?;
    }
}

async fn write_reply(stream: &mut TcpStream, reply: Reply) -> std::io::Result<()> {
    let mut head = format!("HTTP/1.1 {} {}\r\nConnection: close\r\n", reply.status, reply.reason);
    for (name, value) in &reply.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    if reply.with_length {
        head.push_str(&format!("Content-Length: {}\r\n", reply.body.len()));
    }
    head.push_str("\r\n");

    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&reply.body).await?;
    stream.flush().await
}

async fn write_slow(stream: &mut TcpStream) -> std::io::Result<()> {
    let total = SLOW_CHUNK_LEN * SLOW_CHUNKS;
    let head = format!(
        "HTTP/1.1 200 OK\r\nConnection: close\r\nContent-Type: application/octet-stream\r\nContent-Length: {}\r\n\r\n",
        total
    );
    stream.write_all(head.as_bytes()).await?;
    let chunk = vec![b'x'; SLOW_CHUNK_LEN];
    for _ in 0..SLOW_CHUNKS {
        stream.write_all(&chunk).await?;
        stream.flush().await?;
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(())
}
