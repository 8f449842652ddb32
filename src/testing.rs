//! Shared test fixtures: a small JSON topic protocol and polling helpers.
//!
//! Wire format used by [`TopicBinding`]:
//!
//! | Frame | Shape |
//! |-------|-------|
//! | subscribe | `{"op":"subscribe","id":1,"topic":"trades"}` |
//! | ack | `{"id":1,"status":"ok"}` / `{"id":1,"status":"error","reason":".."}` |
//! | update | `{"topic":"trades","data":{..}}` |
//! | query | `{"op":"query","id":2,"echo":..}` → `{"id":2,"status":"ok","result":..}` |
//! | auth | `{"op":"auth","id":3,"key":".."}` |
//! | unsubscribe | `{"op":"unsubscribe","topic":"trades"}` |
//! | event | `{"event":"heartbeat"}`, `{"event":"pause"}`, `{"event":"resume"}` |

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;

use crate::error::{Error, Result};
use crate::protocol::ApiBinding;
use crate::transport::Connection;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Installs a test subscriber once; honors `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` for up to two seconds.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn next_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

pub fn subscribe_request(topic: &str) -> Value {
    json!({ "op": "subscribe", "id": next_id(), "topic": topic })
}

pub fn query_request(echo: Value) -> Value {
    json!({ "op": "query", "id": next_id(), "echo": echo })
}

pub fn update(topic: &str, data: Value) -> String {
    json!({ "topic": topic, "data": data }).to_string()
}

/// Counts frames with `op` and, if given, `topic`.
pub fn count_frames(frames: &[String], op: &str, topic: Option<&str>) -> usize {
    frames
        .iter()
        .filter_map(|frame| serde_json::from_str::<Value>(frame).ok())
        .filter(|frame| frame["op"] == op)
        .filter(|frame| topic.is_none_or(|topic| frame["topic"] == topic))
        .count()
}

/// Scripted server for the topic protocol.
///
/// Topics starting with `reject` are refused, topics starting with `silent`
/// and queries with `"silent": true` get no answer, auth with key `bad` fails.
pub fn respond(frame: &str) -> Vec<String> {
    let Ok(request) = serde_json::from_str::<Value>(frame) else {
        return Vec::new();
    };
    let id = request["id"].clone();

    let reply = match request["op"].as_str() {
        Some("subscribe") => {
            let topic = request["topic"].as_str().unwrap_or_default();
            if topic.starts_with("silent") {
                return Vec::new();
            }
            if topic.starts_with("reject") {
                json!({ "id": id, "status": "error", "reason": "unknown topic" })
            } else {
                json!({ "id": id, "status": "ok" })
            }
        }
        Some("query") if request["silent"] == true => return Vec::new(),
        Some("query") => json!({ "id": id, "status": "ok", "result": request["echo"] }),
        Some("auth") if request["key"] == "bad" => {
            json!({ "id": id, "status": "error", "reason": "invalid key" })
        }
        Some("auth") => json!({ "id": id, "status": "ok" }),
        _ => return Vec::new(),
    };

    vec![reply.to_string()]
}

/// [`ApiBinding`] for the topic protocol.
#[derive(Debug)]
pub struct TopicBinding {
    pub key: String,
    pub auth_calls: AtomicUsize,
    pub revitalized: AtomicUsize,
    pub unhandled: AtomicUsize,
}

impl Default for TopicBinding {
    fn default() -> Self {
        Self::with_key("good")
    }
}

impl TopicBinding {
    pub fn with_key(key: &str) -> Self {
        Self {
            key: key.to_string(),
            auth_calls: AtomicUsize::new(0),
            revitalized: AtomicUsize::new(0),
            unhandled: AtomicUsize::new(0),
        }
    }

    fn answer(message: &Value, request: &Value) -> Option<Result<Value>> {
        if message.get("status").is_none() || message["id"] != request["id"] {
            return None;
        }
        Some(match message["status"].as_str() {
            Some("ok") => Ok(message.get("result").cloned().unwrap_or(Value::Null)),
            _ => Err(Error::protocol(message["reason"].to_string())),
        })
    }
}

#[async_trait]
impl ApiBinding for TopicBinding {
    fn matches_query(&self, message: &Value, request: &Value) -> Option<Result<Value>> {
        Self::answer(message, request)
    }

    fn matches_subscribe_response(&self, message: &Value, request: &Value) -> Option<Result<()>> {
        Self::answer(message, request).map(|answer| {
            answer
                .map(|_| ())
                .map_err(|e| Error::subscription_rejected(e.to_string()))
        })
    }

    fn matches_subscription(&self, message: &Value, request: &Value) -> bool {
        message.get("data").is_some() && message["topic"] == request["topic"]
    }

    fn matches_identifier(&self, message: &Value, identifier: &str) -> bool {
        message["event"] == identifier
    }

    async fn authenticate(&self, connection: &Connection) -> Result<()> {
        self.auth_calls.fetch_add(1, Ordering::SeqCst);
        let request = json!({ "op": "auth", "id": next_id(), "key": self.key });
        let expected = request.clone();
        connection
            .send_and_wait(&request, Duration::from_secs(1), move |message| {
                Self::answer(message, &expected)
            })
            .await
            .map(|_| ())
    }

    fn unsubscribe_request(&self, request: &Value) -> Option<Value> {
        Some(json!({ "op": "unsubscribe", "topic": request["topic"] }))
    }

    async fn revitalize_request(&self, mut request: Value) -> Result<Value> {
        self.revitalized.fetch_add(1, Ordering::SeqCst);
        request["revived"] = json!(true);
        Ok(request)
    }

    fn topic(&self, message: &Value) -> Option<String> {
        message["topic"].as_str().map(str::to_string)
    }

    fn pause_signal(&self, message: &Value) -> Option<bool> {
        match message["event"].as_str() {
            Some("pause") => Some(true),
            Some("resume") => Some(false),
            _ => None,
        }
    }

    fn unhandled_message(&self, _message: &Value) {
        self.unhandled.fetch_add(1, Ordering::SeqCst);
    }
}
