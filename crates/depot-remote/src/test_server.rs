//! In-process HTTP origin for integration tests.
//!
//! Serves files registered with [`TestServer::put_file`] to `GET`/`HEAD`,
//! answers `POST`/`PUT` with a configurable status, and records every request
//! it sees. Dropping the server unblocks and stops its accept loop.

use std::collections::HashMap;
use std::io::Read;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tiny_http::{Method, Response, Server, StatusCode};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub method: String,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
}

impl ReceivedRequest {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Default)]
struct Shared {
    files: Mutex<HashMap<String, Vec<u8>>>,
    received: Mutex<Vec<ReceivedRequest>>,
}

pub struct TestServer {
    pub url: String,
    pub port: u16,
    shared: Arc<Shared>,
    write_status: Arc<AtomicU16>,
    server: Arc<Server>,
    _handle: std::thread::JoinHandle<()>,
}

impl TestServer {
    /// Bind `127.0.0.1:0` and start serving on a background thread.
    pub fn start() -> Self {
        let server =
            Arc::new(Server::http("127.0.0.1:0").expect("failed to bind test HTTP server"));
        let port = server.server_addr().to_ip().expect("not an IP addr").port();
        let url = format!("http://127.0.0.1:{port}");

        let shared = Arc::new(Shared::default());
        let write_status = Arc::new(AtomicU16::new(200));

        let srv = Arc::clone(&server);
        let sh = Arc::clone(&shared);
        let status = Arc::clone(&write_status);
        let handle = std::thread::spawn(move || {
            for request in srv.incoming_requests() {
                serve_one(&sh, &status, request);
            }
        });

        Self {
            url,
            port,
            shared,
            write_status,
            server,
            _handle: handle,
        }
    }

    /// Serve `body` at URL path `path` (leading slash optional).
    pub fn put_file(&self, path: &str, body: &[u8]) {
        let key = format!("/{}", path.trim_start_matches('/'));
        self.shared
            .files
            .lock()
            .expect("files lock")
            .insert(key, body.to_vec());
    }

    /// Status returned to subsequent `POST`/`PUT` requests.
    pub fn set_write_status(&self, code: u16) {
        self.write_status.store(code, Ordering::SeqCst);
    }

    pub fn received(&self) -> Vec<ReceivedRequest> {
        self.shared.received.lock().expect("received lock").clone()
    }

    /// Poll until at least `count` requests arrived or `timeout` passes.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> Vec<ReceivedRequest> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.received();
            if seen.len() >= count || Instant::now() >= deadline {
                return seen;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.server.unblock();
    }
}

fn serve_one(shared: &Shared, write_status: &AtomicU16, mut req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    let headers = req
        .headers()
        .iter()
        .map(|h| (h.field.to_string(), h.value.to_string()))
        .collect();
    let mut body = Vec::new();
    let _ = req.as_reader().read_to_end(&mut body);
    debug!("test server: {method} {url}");

    if let Ok(mut received) = shared.received.lock() {
        received.push(ReceivedRequest {
            method: method.to_string(),
            url: url.clone(),
            headers,
            body,
        });
    }

    let file = shared
        .files
        .lock()
        .ok()
        .and_then(|files| files.get(&url).cloned());
    let response = match (method, file) {
        (Method::Get | Method::Head, Some(data)) => Response::from_data(data),
        (Method::Get | Method::Head, None) => {
            Response::from_data(b"not found".to_vec()).with_status_code(StatusCode(404))
        }
        (Method::Post | Method::Put, _) => Response::from_data(Vec::new())
            .with_status_code(StatusCode(write_status.load(Ordering::SeqCst))),
        _ => Response::from_data(b"method not allowed".to_vec()).with_status_code(StatusCode(405)),
    };
    let _ = req.respond(response);
}
