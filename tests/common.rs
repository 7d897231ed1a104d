#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use morphdb::{Engine, KernelConfig, ServiceBindings};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

pub fn payload(value: Value) -> Map<String, Value> {
    value.as_object().expect("object payload").clone()
}

pub fn contact_definition() -> Map<String, Value> {
    payload(json!({
        "name": "string!",
        "email": "string?#",
        "stage": "Lead|Qualified|Customer",
        "qualify": "verb",
    }))
}

pub fn deal_definition() -> Map<String, Value> {
    payload(json!({
        "title": "string!",
        "amount": "number",
        "close": "verb",
    }))
}

pub fn issue_definition() -> Map<String, Value> {
    payload(json!({
        "title": "string!",
        "state": "Open|Closed",
        "close": "verb",
    }))
}

pub fn in_memory_engine() -> Engine {
    Engine::in_memory(ServiceBindings::new(), KernelConfig::default())
}

pub fn in_memory_engine_with(bindings: ServiceBindings) -> Engine {
    Engine::in_memory(bindings, KernelConfig::default())
}

/// Polls an async condition until it yields or the timeout elapses.
pub async fn eventually<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(value) = f().await {
            return value;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}

// =============================================================================
// HTTP Capture Server
// =============================================================================
// Webhook and integration tests need a real endpoint. A bare TCP accept loop
// is enough: read one HTTP/1.1 request, remember it, answer with a fixed
// status.

/// One captured HTTP request.
#[derive(Debug, Clone)]
pub struct CapturedRequest {
    pub method: String,
    pub path: String,
    /// Header names lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// A minimal HTTP server recording every request it receives.
pub struct CaptureServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

impl CaptureServer {
    /// Starts a server answering 200 to everything.
    pub async fn start() -> Self {
        Self::start_with_status(200).await
    }

    /// Starts a server answering a fixed status to everything.
    pub async fn start_with_status(status: u16) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind capture server");
        let addr = listener.local_addr().expect("capture server addr");
        let requests: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));

        let captured = Arc::clone(&requests);
        tokio::spawn(async move {
            loop {
                let (mut socket, _) = match listener.accept().await {
                    Ok(conn) => conn,
                    Err(_) => return,
                };
                let captured = Arc::clone(&captured);
                tokio::spawn(async move {
                    if let Some(request) = read_request(&mut socket).await {
                        captured.lock().expect("capture lock").push(request);
                    }
                    let response = format!(
                        "HTTP/1.1 {} OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
                        status
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        Self { addr, requests }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn url_with_path(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.requests.lock().expect("capture lock").clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().expect("capture lock").len()
    }
}

/// Reads one HTTP/1.1 request (headers + content-length body).
async fn read_request(socket: &mut tokio::net::TcpStream) -> Option<CapturedRequest> {
    let mut buf = Vec::with_capacity(4096);
    let header_end = loop {
        let mut chunk = [0u8; 1024];
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = find_header_end(&buf) {
            break pos;
        }
        if buf.len() > 1 << 20 {
            return None;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next()?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((name, value)) = line.split_once(':') {
            headers.insert(name.trim().to_lowercase(), value.trim().to_string());
        }
    }

    let content_length: usize = headers
        .get("content-length")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut body = buf[header_end + 4..].to_vec();
    while body.len() < content_length {
        let mut chunk = [0u8; 1024];
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&chunk[..n]);
    }
    body.truncate(content_length);

    Some(CapturedRequest {
        method,
        path,
        headers,
        body: String::from_utf8_lossy(&body).to_string(),
    })
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}
