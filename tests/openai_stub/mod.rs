use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use serde_json::Value;

pub const STUB_API_KEY: &str = "sk-test-stub";

/// What the stub answers when a listing contains `marker`.
#[derive(Debug, Clone)]
pub enum StubReply {
    /// Replies with this JSON as the model's output text.
    Events(Value),
    /// Replies with free text that is not JSON.
    Prose(&'static str),
    /// Fails the HTTP call with this status.
    Status(u16),
}

#[derive(Debug, Clone, Default)]
pub struct OpenAiStubConfig {
    pub replies: Vec<(&'static str, StubReply)>,
}

pub struct OpenAiStub {
    pub base_url: String,
    requests: Arc<AtomicUsize>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl OpenAiStub {
    pub fn spawn(config: OpenAiStubConfig) -> Self {
        let server = tiny_http::Server::http("127.0.0.1:0").expect("start openai stub server");
        let addr = server.server_addr();
        let base_url = format!("http://{addr}/v1");
        let requests = Arc::new(AtomicUsize::new(0));
        let counter = requests.clone();

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
                counter.fetch_add(1, Ordering::SeqCst);

                let path = request.url().to_string();
                if request.method() != &tiny_http::Method::Post || path != "/v1/responses" {
                    let _ = request.respond(
                        tiny_http::Response::from_string("not found").with_status_code(404),
                    );
                    continue;
                }

                let authorized = request.headers().iter().any(|h| {
                    h.field.equiv("Authorization")
                        && h.value.as_str() == format!("Bearer {STUB_API_KEY}")
                });
                if !authorized {
                    let _ = request.respond(error_response(401, "invalid api key"));
                    continue;
                }

                let mut body = String::new();
                if request.as_reader().read_to_string(&mut body).is_err() {
                    let _ = request.respond(error_response(400, "invalid request body"));
                    continue;
                }
                let parsed: Value = match serde_json::from_str(&body) {
                    Ok(value) => value,
                    Err(_) => {
                        let _ = request.respond(error_response(400, "invalid json"));
                        continue;
                    }
                };

                let Some(input) = parsed.get("input").and_then(|v| v.as_str()) else {
                    let _ = request.respond(error_response(400, "missing input"));
                    continue;
                };
                let Some(listing) = extract_between(input, "BEGIN_LISTING\n", "\nEND_LISTING")
                else {
                    let _ = request.respond(error_response(400, "missing listing markers"));
                    continue;
                };

                let reply = config
                    .replies
                    .iter()
                    .find(|(marker, _)| listing.contains(marker))
                    .map(|(_, reply)| reply.clone())
                    .unwrap_or_else(|| StubReply::Events(serde_json::json!({ "events": [] })));

                let output_text = match reply {
                    StubReply::Events(value) => value.to_string(),
                    StubReply::Prose(text) => text.to_owned(),
                    StubReply::Status(status) => {
                        let _ = request.respond(error_response(status, "stubbed failure"));
                        continue;
                    }
                };

                let response_body = serde_json::json!({
                    "id": "resp_stub",
                    "object": "response",
                    "model": parsed.get("model").cloned().unwrap_or(Value::String("stub-model".to_owned())),
                    "output": [
                        {
                            "type": "message",
                            "role": "assistant",
                            "content": [
                                { "type": "output_text", "text": output_text }
                            ]
                        }
                    ],
                });
                let _ = request.respond(json_response(200, response_body.to_string()));
            }
        });

        Self {
            base_url,
            requests,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        }
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

impl Drop for OpenAiStub {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn json_response(status: u16, body: String) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    let header = tiny_http::Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..])
        .expect("build header");
    tiny_http::Response::from_string(body)
        .with_status_code(status)
        .with_header(header)
}

fn error_response(status: u16, message: &str) -> tiny_http::Response<std::io::Cursor<Vec<u8>>> {
    json_response(
        status,
        serde_json::json!({ "error": { "message": message } }).to_string(),
    )
}

fn extract_between<'a>(text: &'a str, begin: &str, end: &str) -> Option<&'a str> {
    let start = text.find(begin)? + begin.len();
    let rest = &text[start..];
    let end_rel = rest.find(end)?;
    Some(&rest[..end_rel])
}
