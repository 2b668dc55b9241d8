//! Built-in mock provider: serves canned chat completions from a private
//! in-process listener so the full proxy path (including streaming) can run
//! without provider credentials.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};

use super::{sse_data, Provider, StreamEvent, UsageEstimate};
use crate::domain::{ConfigMap, PluginSchema};
use crate::error::{GatewayError, Result};
use crate::pricing::ModelPricing;

const CHUNK_DELAY: Duration = Duration::from_millis(20);

#[derive(Clone)]
pub struct MockProvider {
    http: reqwest::Client,
    upstream: Arc<tokio::sync::OnceCell<SocketAddr>>,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            upstream: Arc::new(tokio::sync::OnceCell::new()),
        }
    }

    /// Binds the loopback upstream on first use and reuses it afterwards.
    async fn upstream_addr(&self) -> Result<SocketAddr> {
        self.upstream
            .get_or_try_init(|| async {
                let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
                    .await
                    .map_err(|err| {
                        GatewayError::Internal(format!("mock upstream bind failed: {err}"))
                    })?;
                let addr = listener.local_addr().map_err(|err| {
                    GatewayError::Internal(format!("mock upstream addr failed: {err}"))
                })?;

                // No inbound cap here; the gateway enforces its own limit
                // before forwarding.
                let app = Router::new()
                    .route("/chat/completions", post(handle_chat))
                    .layer(axum::extract::DefaultBodyLimit::disable());
                tokio::spawn(async move {
                    let _ = axum::serve(listener, app).await;
                });
                Ok(addr)
            })
            .await
            .copied()
    }
}

#[async_trait]
impl Provider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    fn schema(&self) -> PluginSchema {
        PluginSchema::new()
    }

    fn configure(&self, _config: &ConfigMap) -> Result<Arc<dyn Provider>> {
        Ok(Arc::new(self.clone()))
    }

    fn pricing(&self, _model: &str) -> Result<ModelPricing> {
        // The mock is free.
        Ok(ModelPricing {
            input: 0.0,
            output: 0.0,
        })
    }

    fn count_tokens(&self, _model: &str, text: &str) -> usize {
        // Rough approximation: four characters per token.
        text.len() / 4
    }

    async fn prepare_http_request(&self, _model: &str, body: &[u8]) -> Result<reqwest::Request> {
        let addr = self.upstream_addr().await?;
        let request = self
            .http
            .post(format!("http://{addr}/chat/completions"))
            .header("content-type", "application/json")
            .body(body.to_vec())
            .build()?;
        Ok(request)
    }

    fn estimate_usage(&self, model: &str, body: &[u8]) -> Result<UsageEstimate> {
        let probe: Value = serde_json::from_slice(body)
            .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;
        let mut text = String::new();
        if let Some(messages) = probe.get("messages").and_then(Value::as_array) {
            for message in messages {
                if let Some(content) = message.get("content").and_then(Value::as_str) {
                    text.push_str(content);
                }
            }
        }
        Ok(UsageEstimate {
            input_tokens: self.count_tokens(model, &text),
            total_cost: 0.0,
        })
    }

    fn parse_output_usage(&self, model: &str, body: &[u8], stream: bool) -> usize {
        if stream {
            let mut total = 0;
            for line in body.split(|b| *b == b'\n') {
                total += self.parse_stream_chunk(model, line).tokens;
            }
            return total;
        }

        serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|response| {
                response
                    .get("usage")
                    .and_then(|usage| usage.get("completion_tokens"))
                    .and_then(Value::as_u64)
            })
            .map(|tokens| tokens as usize)
            .unwrap_or(body.len() / 4)
    }

    fn parse_stream_chunk(&self, model: &str, line: &[u8]) -> StreamEvent {
        let Some(data) = sse_data(line) else {
            return StreamEvent::default();
        };
        let Ok(chunk) = serde_json::from_slice::<Value>(data) else {
            return StreamEvent::default();
        };
        let delta = chunk
            .get("choices")
            .and_then(Value::as_array)
            .and_then(|choices| choices.first())
            .and_then(|choice| choice.get("delta"))
            .and_then(|delta| delta.get("content"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let tokens = self.count_tokens(model, &delta);
        StreamEvent {
            delta,
            tokens,
            usage: None,
        }
    }

    fn parse_request(&self, body: &[u8]) -> Result<(String, bool)> {
        let probe: Value = serde_json::from_slice(body)
            .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;
        let model = probe
            .get("model")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let stream = probe.get("stream").and_then(Value::as_bool).unwrap_or(false);
        Ok((model, stream))
    }

    async fn get_usage(&self) -> Result<f64> {
        Ok(0.0)
    }
}

async fn handle_chat(Json(request): Json<Value>) -> axum::response::Response {
    let model = request
        .get("model")
        .and_then(Value::as_str)
        .unwrap_or("mock-model")
        .to_string();
    let stream = request
        .get("stream")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let content = request
        .get("messages")
        .and_then(Value::as_array)
        .and_then(|messages| messages.last())
        .and_then(|message| message.get("content"))
        .and_then(Value::as_str)
        .map(|last| format!("Mock response to: \"{last}\""))
        .unwrap_or_else(|| "This is a mock response.".to_string());

    if !stream {
        let message_count = request
            .get("messages")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);
        let completion_tokens = content.len() / 4;
        let body = json!({
            "id": "mock-response-id",
            "object": "chat.completion",
            "model": model,
            "choices": [{
                "index": 0,
                "message": { "role": "assistant", "content": content },
                "finish_reason": "stop"
            }],
            "usage": {
                "prompt_tokens": message_count * 5,
                "completion_tokens": completion_tokens,
                "total_tokens": message_count * 5 + completion_tokens
            }
        });
        return Json(body).into_response();
    }

    // Word-by-word SSE stream with a trailing finish chunk and terminator,
    // paced so clients observe genuinely incremental delivery.
    let mut events: Vec<String> = content
        .split(' ')
        .map(|word| {
            let chunk = json!({
                "id": "mock-response-id",
                "object": "chat.completion.chunk",
                "model": model,
                "choices": [{
                    "index": 0,
                    "delta": { "content": format!("{word} ") },
                    "finish_reason": Value::Null
                }]
            });
            format!("data: {chunk}\n\n")
        })
        .collect();
    let finish = json!({
        "id": "mock-response-id",
        "object": "chat.completion.chunk",
        "model": model,
        "choices": [{ "index": 0, "delta": {}, "finish_reason": "stop" }]
    });
    events.push(format!("data: {finish}\n\n"));
    events.push("data: [DONE]\n\n".to_string());

    let body = axum::body::Body::from_stream(futures_util::stream::unfold(
        events.into_iter(),
        |mut events| async move {
            let event = events.next()?;
            tokio::time::sleep(CHUNK_DELAY).await;
            Some((Ok::<_, std::io::Error>(Bytes::from(event)), events))
        },
    ));

    axum::response::Response::builder()
        .header("content-type", "text/event-stream")
        .header("cache-control", "no-cache")
        .body(body)
        .expect("mock stream response")
}
