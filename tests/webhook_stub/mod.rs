use std::collections::HashMap;
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use serde_json::Value;

/// One canned webhook response.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub content_type: String,
    pub body: Vec<u8>,
    /// Content-Length to announce when it differs from the body length.
    pub declared_len: Option<usize>,
}

#[allow(dead_code)]
impl Reply {
    pub fn json(value: Value) -> Self {
        Self::with_type("application/json", value.to_string())
    }

    pub fn with_type(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            content_type: content_type.to_owned(),
            body: body.into(),
            declared_len: None,
        }
    }

    /// Sends `body` but announces more bytes than it has, so the client
    /// fails partway through reading it.
    pub fn truncated(content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        let mut reply = Self::with_type(content_type, body);
        reply.declared_len = Some(reply.body.len() + 64);
        reply
    }

    pub fn error(status: u16, body: &str) -> Self {
        Self {
            status,
            content_type: "text/plain".to_owned(),
            body: body.as_bytes().to_vec(),
            declared_len: None,
        }
    }
}

/// A request the stub received.
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub struct Received {
    pub endpoint: String,
    pub body: Value,
    pub accept: Option<String>,
    pub authorization: Option<String>,
}

/// Webhook backend on a random local port.
///
/// Each endpoint answers with its replies in order; the last one repeats.
pub struct WebhookStub {
    pub base_url: String,
    received: Arc<Mutex<Vec<Received>>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

#[allow(dead_code)]
impl WebhookStub {
    pub fn spawn(routes: Vec<(&str, Vec<Reply>)>) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start webhook stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/webhook");

        let mut routes: HashMap<String, Vec<Reply>> = routes
            .into_iter()
            .map(|(name, replies)| (name.to_owned(), replies))
            .collect();
        let received = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&received);
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();

        let handle = thread::spawn(move || {
            loop {
                if shutdown_rx.try_recv().is_ok() {
                    break;
                }

                let mut request = match server.recv_timeout(Duration::from_millis(50)) {
                    Ok(Some(req)) => req,
                    Ok(None) => continue,
                    Err(_) => break,
                };

                let header = |name: &str| {
                    request
                        .headers()
                        .iter()
                        .find(|h| h.field.to_string().eq_ignore_ascii_case(name))
                        .map(|h| h.value.as_str().to_owned())
                };
                let accept = header("Accept");
                let authorization = header("Authorization");

                let endpoint = request
                    .url()
                    .strip_prefix("/webhook/")
                    .unwrap_or_default()
                    .to_owned();
                let mut body = String::new();
                let _ = request.as_reader().read_to_string(&mut body);
                let body: Value = serde_json::from_str(&body).unwrap_or(Value::Null);
                log.lock().expect("stub log").push(Received {
                    endpoint: endpoint.clone(),
                    body,
                    accept,
                    authorization,
                });

                let reply = match routes.get_mut(&endpoint) {
                    Some(replies) if replies.len() > 1 => Some(replies.remove(0)),
                    Some(replies) => replies.first().cloned(),
                    None => None,
                };
                let Some(reply) = reply else {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                };

                let header = tiny_http::Header::from_bytes(
                    &b"Content-Type"[..],
                    reply.content_type.as_bytes(),
                )
                .expect("build header");
                let declared_len = reply.declared_len.unwrap_or(reply.body.len());
                let response = tiny_http::Response::new(
                    tiny_http::StatusCode(reply.status),
                    vec![header],
                    std::io::Cursor::new(reply.body),
                    Some(declared_len),
                    None,
                );
                let _ = request.respond(response);
            }
        });

        Self {
            base_url,
            received,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn received(&self) -> Vec<Received> {
        self.received.lock().expect("stub log").clone()
    }

    pub fn received_for(&self, endpoint: &str) -> Vec<Received> {
        self.received()
            .into_iter()
            .filter(|r| r.endpoint == endpoint)
            .collect()
    }
}

impl Drop for WebhookStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
