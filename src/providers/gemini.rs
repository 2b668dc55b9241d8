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

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta/models";
const PRICING_JSON: &str = include_str!("pricing/gemini.json");

#[derive(Clone)]
pub struct Gemini {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    pricing: Arc<PricingTable>,
}

impl Gemini {
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
                PricingTable::from_json_str(PRICING_JSON).expect("embedded gemini pricing"),
            ),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Rewrites an OpenAI-shaped chat body into `generateContent` form:
    /// assistant turns become `model`, system turns become the
    /// `systemInstruction` field.
    fn to_generate_payload(&self, body: &[u8]) -> Result<(Value, bool)> {
        let source: Value = serde_json::from_slice(body)
            .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;
        let stream = source.get("stream").and_then(Value::as_bool).unwrap_or(false);

        let mut system_parts = Vec::new();
        let mut contents = Vec::new();
        if let Some(entries) = source.get("messages").and_then(Value::as_array) {
            for entry in entries {
                let role = entry.get("role").and_then(Value::as_str).unwrap_or("user");
                let text = match entry.get("content") {
                    Some(Value::String(text)) => text.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                };
                match role {
                    "system" => system_parts.push(json!({ "text": text })),
                    "assistant" => {
                        contents.push(json!({ "role": "model", "parts": [{ "text": text }] }))
                    }
                    _ => contents.push(json!({ "role": "user", "parts": [{ "text": text }] })),
                }
            }
        }

        let mut payload = json!({ "contents": contents });
        if !system_parts.is_empty() {
            payload["systemInstruction"] = json!({ "parts": system_parts });
        }
        if let Some(temperature) = source.get("temperature").and_then(Value::as_f64) {
            payload["generationConfig"] = json!({ "temperature": temperature });
        }
        Ok((payload, stream))
    }

    fn candidate_text(chunk: &Value) -> String {
        let mut text = String::new();
        if let Some(parts) = chunk
            .get("candidates")
            .and_then(Value::as_array)
            .and_then(|candidates| candidates.first())
            .and_then(|candidate| candidate.get("content"))
            .and_then(|content| content.get("parts"))
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(part_text) = part.get("text").and_then(Value::as_str) {
                    text.push_str(part_text);
                }
            }
        }
        text
    }
}

#[async_trait]
impl Provider for Gemini {
    fn name(&self) -> &str {
        "gemini"
    }

    fn schema(&self) -> PluginSchema {
        PluginSchema::from([
            (
                "api_key".to_string(),
                FieldSchema::new(FieldType::String)
                    .display_name("API Key")
                    .description("Google AI Studio API key"),
            ),
            (
                "base_url".to_string(),
                FieldSchema::new(FieldType::String)
                    .display_name("Base URL")
                    .default_value(DEFAULT_BASE_URL)
                    .description("Gemini API models base URL"),
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
        let (payload, stream) = self.to_generate_payload(body)?;
        // SSE framing comes from alt=sse on the streaming method.
        let url = if stream {
            format!("{}/{model}:streamGenerateContent?alt=sse", self.base_url)
        } else {
            format!("{}/{model}:generateContent", self.base_url)
        };

        let request = self
            .http
            .post(url)
            .header("x-goog-api-key", &self.api_key)
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
            // usageMetadata counts are cumulative; keep the largest seen.
            let mut reported = 0;
            let mut counted = 0;
            for line in body.split(|b| *b == b'\n') {
                let event = self.parse_stream_chunk(model, line);
                if let Some(usage) = event.usage {
                    reported = reported.max(usage.output_tokens);
                }
                counted += event.tokens;
            }
            return if reported > 0 { reported } else { counted };
        }

        serde_json::from_slice::<Value>(body)
            .ok()
            .and_then(|response| {
                response
                    .get("usageMetadata")
                    .and_then(|usage| usage.get("candidatesTokenCount"))
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

        let delta = Self::candidate_text(&chunk);
        let tokens = if delta.is_empty() {
            0
        } else {
            self.count_tokens(model, &delta)
        };

        let usage = chunk
            .get("usageMetadata")
            .and_then(Value::as_object)
            .and_then(|metadata| {
                let output_tokens = metadata
                    .get("candidatesTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                if output_tokens == 0 {
                    return None;
                }
                let input_tokens = metadata
                    .get("promptTokenCount")
                    .and_then(Value::as_u64)
                    .unwrap_or(0) as usize;
                let pricing = self.pricing(model).unwrap_or(ModelPricing {
                    input: 0.0,
                    output: 0.0,
                });
                Some(StreamUsage {
                    input_tokens,
                    output_tokens,
                    total_cost: input_tokens as f64 / 1000.0 * pricing.input
                        + output_tokens as f64 / 1000.0 * pricing.output,
                })
            });

        StreamEvent {
            delta,
            tokens,
            usage,
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

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> Gemini {
        Gemini::new("test-key")
    }

    #[tokio::test]
    async fn streaming_requests_use_the_sse_method() {
        let body = br#"{"model":"gemini-1.5-flash","stream":true,"messages":[{"role":"user","content":"hi"}]}"#;
        let request = provider()
            .prepare_http_request("gemini-1.5-flash", body)
            .await
            .expect("request");
        assert!(request
            .url()
            .path()
            .ends_with("gemini-1.5-flash:streamGenerateContent"));
        assert_eq!(request.url().query(), Some("alt=sse"));
    }

    #[test]
    fn roles_map_to_gemini_contents() {
        let body = br#"{
            "messages": [
                {"role": "system", "content": "be terse"},
                {"role": "user", "content": "hi"},
                {"role": "assistant", "content": "hello"}
            ]
        }"#;
        let (payload, stream) = provider().to_generate_payload(body).expect("payload");
        assert!(!stream);
        let contents = payload["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 2);
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(payload["systemInstruction"]["parts"][0]["text"], "be terse");
    }

    #[test]
    fn stream_chunk_concatenates_parts() {
        let line = br#"data: {"candidates":[{"content":{"parts":[{"text":"a"},{"text":"b"}]}}]}"#;
        let event = provider().parse_stream_chunk("gemini-1.5-flash", line);
        assert_eq!(event.delta, "ab");
    }

    #[test]
    fn usage_metadata_is_terminal() {
        let line = br#"data: {"candidates":[],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":9}}"#;
        let event = provider().parse_stream_chunk("gemini-1.5-flash", line);
        let usage = event.usage.expect("usage");
        assert_eq!(usage.output_tokens, 9);
        assert_eq!(usage.input_tokens, 4);
    }
}
