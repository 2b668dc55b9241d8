use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use super::{
    count_tokens_bpe, sse_data, Provider, StreamEvent, StreamUsage, UsageEstimate,
};
use crate::domain::{ConfigMap, FieldSchema, FieldType, PluginSchema};
use crate::error::{GatewayError, Result};
use crate::pricing::{ModelPricing, PricingTable};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com/v1";
const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_MAX_TOKENS: u64 = 4096;
const PRICING_JSON: &str = include_str!("pricing/anthropic.json");

#[derive(Clone)]
pub struct Anthropic {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    pricing: Arc<PricingTable>,
}

impl Anthropic {
    pub fn new(api_key: impl Into<String>) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            http,
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: api_key.into(),
            pricing: Arc::new(
                PricingTable::from_json_str(PRICING_JSON).expect("embedded anthropic pricing"),
            ),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Rewrites an OpenAI-shaped chat body into the native Messages API
    /// shape: system messages are promoted to the `system` field, and
    /// `max_tokens` (mandatory upstream) defaults when absent.
    fn to_messages_payload(&self, model: &str, body: &[u8]) -> Result<Value> {
        let source: Value = serde_json::from_slice(body)
            .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;

        let mut system = String::new();
        let mut messages = Vec::new();
        if let Some(entries) = source.get("messages").and_then(Value::as_array) {
            for entry in entries {
                let role = entry.get("role").and_then(Value::as_str).unwrap_or("user");
                let content = match entry.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                if role == "system" {
                    if !system.is_empty() {
                        system.push('\n');
                    }
                    system.push_str(&content);
                } else {
                    messages.push(json!({ "role": role, "content": content }));
                }
            }
        }

        let mut payload = json!({
            "model": model,
            "messages": messages,
            "max_tokens": source
                .get("max_tokens")
                .and_then(Value::as_u64)
                .filter(|tokens| *tokens > 0)
                .unwrap_or(DEFAULT_MAX_TOKENS),
        });
        if !system.is_empty() {
            payload["system"] = Value::String(system);
        }
        if source.get("stream").and_then(Value::as_bool) == Some(true) {
            payload["stream"] = Value::Bool(true);
        }
        if let Some(temperature) = source.get("temperature").and_then(Value::as_f64) {
            payload["temperature"] = json!(temperature);
        }
        Ok(payload)
    }
}

#[async_trait]
impl Provider for Anthropic {
    fn name(&self) -> &str {
        "anthropic"
    }

    fn schema(&self) -> PluginSchema {
        PluginSchema::from([
            (
                "api_key".to_string(),
                FieldSchema::new(FieldType::String)
                    .display_name("API Key")
                    .description("Anthropic API key used for upstream calls"),
            ),
            (
                "base_url".to_string(),
                FieldSchema::new(FieldType::String)
                    .display_name("Base URL")
                    .default_value(DEFAULT_BASE_URL)
                    .description("Anthropic API base URL"),
            ),
        ])
    }

    fn configure(&self, config: &ConfigMap) -> Result<Arc<dyn Provider>> {
        let mut configured = self.clone();
        if let Some(api_key) = config.get("api_key").and_then(|value| value.as_str()) {
            configured.api_key = api_key.to_string();
        }
        if let Some(base_url) = config.get("base_url").and_then(|value| value.as_str()) {
            configured.base_url = base_url.trim_end_matches('/').to_string();
        }
        Ok(Arc::new(configured))
    }

    fn pricing(&self, model: &str) -> Result<ModelPricing> {
        self.pricing
            .price(model)
            .map_err(|err| GatewayError::Validation(err.to_string()))
    }

    fn count_tokens(&self, model: &str, text: &str) -> usize {
        count_tokens_bpe(model, text)
    }

    async fn prepare_http_request(&self, model: &str, body: &[u8]) -> Result<reqwest::Request> {
        let payload = self.to_messages_payload(model, body)?;
        let request = self
            .http
            .post(format!("{}/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&payload)
            .build()?;
        Ok(request)
    }

    fn estimate_usage(&self, model: &str, body: &[u8]) -> Result<UsageEstimate> {
        let source: Value = serde_json::from_slice(body)
            .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;
        let mut text = String::new();
        if let Some(entries) = source.get("messages").and_then(Value::as_array) {
            for entry in entries {
                if let Some(content) = entry.get("content").and_then(Value::as_str) {
                    text.push_str(content);
                }
            }
        }

        let input_tokens = self.count_tokens(model, &text);
        let pricing = self.pricing(model)?;
        Ok(UsageEstimate {
            input_tokens,
            total_cost: input_tokens as f64 / 1000.0 * pricing.input,
        })
    }

    fn parse_output_usage(&self, model: &str, body: &[u8], stream: bool) -> usize {
        if stream {
            let mut total = 0;
            for line in body.split(|b| *b == b'\n') {
                let event = self.parse_stream_chunk(model, line);
                if let Some(usage) = event.usage {
                    return usage.output_tokens;
                }
                total += event.tokens;
            }
            return total;
        }

        serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|response| {
                response
                    .get("usage")
                    .and_then(|usage| usage.get("output_tokens"))
                    .and_then(Value::as_u64)
            })
            .unwrap_or(0) as usize
    }

    fn parse_stream_chunk(&self, model: &str, line: &[u8]) -> StreamEvent {
        let Some(data) = sse_data(line) else {
            return StreamEvent::default();
        };
        let Ok(chunk) = serde_json::from_slice::<Value>(data) else {
            return StreamEvent::default();
        };

        match chunk.get("type").and_then(Value::as_str) {
            Some("content_block_delta") => {
                let delta = chunk
                    .get("delta")
                    .filter(|delta| {
                        delta.get("type").and_then(Value::as_str) == Some("text_delta")
                    })
                    .and_then(|delta| delta.get("text"))
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let tokens = if delta.is_empty() {
                    0
                } else {
                    self.count_tokens(model, &delta)
                };
                StreamEvent {
                    delta,
                    tokens,
                    usage: None,
                }
            }
            // The terminal message_delta event carries the cumulative output
            // token count.
            Some("message_delta") => {
                let output_tokens = chunk
                    .get("usage")
                    .and_then(|usage| usage.get("output_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                if output_tokens == 0 {
                    return StreamEvent::default();
                }
                let input_tokens = chunk
                    .get("usage")
                    .and_then(|usage| usage.get("input_tokens"))
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                let pricing = self.pricing(model).unwrap_or(ModelPricing {
                    input: 0.0,
                    output: 0.0,
                });
                StreamEvent {
                    delta: String::new(),
                    tokens: 0,
                    usage: Some(StreamUsage {
                        input_tokens,
                        output_tokens,
                        total_cost: input_tokens as f64 / 1000.0 * pricing.input
                            + output_tokens as f64 / 1000.0 * pricing.output,
                    }),
                }
            }
            _ => StreamEvent::default(),
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
        // No public spend endpoint to query.
        Ok(0.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Anthropic {
        Anthropic::new("test-key")
    }

    #[test]
    fn system_messages_are_promoted() {
        let body = br#"{
            "model": "claude-3-5-sonnet",
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"}
            ]
        }"#;
        let payload = provider()
            .to_messages_payload("claude-3-5-sonnet", body)
            .expect("payload");
        assert_eq!(payload["system"], "be terse");
        assert_eq!(payload["messages"].as_array().unwrap().len(), 1);
        assert_eq!(payload["max_tokens"], DEFAULT_MAX_TOKENS);
    }

    #[test]
    fn content_block_delta_yields_text() {
        let line = br#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"hey"}}"#;
        let event = provider().parse_stream_chunk("claude-3-5-sonnet", line);
        assert_eq!(event.delta, "hey");
        assert!(event.tokens >= 1);
    }

    #[test]
    fn message_delta_reports_terminal_usage() {
        let line = br#"data: {"type":"message_delta","usage":{"output_tokens":17}}"#;
        let event = provider().parse_stream_chunk("claude-3-5-sonnet", line);
        let usage = event.usage.expect("usage");
        assert_eq!(usage.output_tokens, 17);
        assert!(usage.total_cost > 0.0);
    }

    #[tokio::test]
    async fn prepared_requests_carry_native_headers() {
        let request = provider()
            .prepare_http_request(
                "claude-3-5-sonnet",
                br#"{"model":"claude-3-5-sonnet","messages":[{"role":"user","content":"hi"}]}"#,
            )
            .await
            .expect("request");
        assert!(request.url().path().ends_with("/messages"));
        assert_eq!(
            request.headers().get("anthropic-version").unwrap(),
            ANTHROPIC_VERSION
        );
        assert!(request.headers().contains_key("x-api-key"));
    }
}
