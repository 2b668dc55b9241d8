use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;

use super::{
    count_tokens_bpe, sse_data, Provider, StreamEvent, StreamUsage, UsageEstimate,
};
use crate::domain::{ConfigMap, FieldSchema, FieldType, PluginSchema};
use crate::error::{GatewayError, Result};
use crate::pricing::{ModelPricing, PricingTable};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const PRICING_JSON: &str = include_str!("pricing/openai.json");

#[derive(Clone)]
pub struct OpenAi {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    pricing: Arc<PricingTable>,
}

impl OpenAi {
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
                PricingTable::from_json_str(PRICING_JSON).expect("embedded openai pricing"),
            ),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn chat_completions_url(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[derive(Debug, Default, Deserialize)]
struct RequestProbe {
    #[serde(default)]
    model: String,
    #[serde(default)]
    stream: bool,
}

#[derive(Debug, Default, Deserialize)]
struct MessagesProbe {
    #[serde(default)]
    messages: Vec<MessageProbe>,
}

#[derive(Debug, Default, Deserialize)]
struct MessageProbe {
    #[serde(default)]
    content: Value,
}

/// Concatenates the string contents of an OpenAI-shaped `messages` array.
fn collect_message_text(body: &[u8]) -> Result<String> {
    let probe: MessagesProbe = serde_json::from_slice(body)
        .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;
    let mut text = String::new();
    for message in probe.messages {
        if let Value::String(content) = message.content {
            text.push_str(&content);
        }
    }
    Ok(text)
}

#[async_trait]
impl Provider for OpenAi {
    fn name(&self) -> &str {
        "openai"
    }

    fn schema(&self) -> PluginSchema {
        PluginSchema::from([
            (
                "api_key".to_string(),
                FieldSchema::new(FieldType::String)
                    .display_name("API Key")
                    .description("OpenAI API key used for upstream calls"),
            ),
            (
                "base_url".to_string(),
                FieldSchema::new(FieldType::String)
                    .display_name("Base URL")
                    .default_value(DEFAULT_BASE_URL)
                    .description("OpenAI-compatible API base URL"),
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

    async fn prepare_http_request(&self, _model: &str, body: &[u8]) -> Result<reqwest::Request> {
        // Ask for the usage trailer on streamed calls so the stream
        // accountant gets authoritative numbers.
        let mut payload: Value = serde_json::from_slice(body)
            .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;
        if payload.get("stream").and_then(Value::as_bool) == Some(true) {
            if let Some(object) = payload.as_object_mut() {
                object
                    .entry("stream_options")
                    .or_insert_with(|| serde_json::json!({ "include_usage": true }));
            }
        }

        let request = self
            .http
            .post(self.chat_completions_url())
            .bearer_auth(&self.api_key)
            .json(&payload)
            .build()?;
        Ok(request)
    }

    fn estimate_usage(&self, model: &str, body: &[u8]) -> Result<UsageEstimate> {
        let input_tokens = self.count_tokens(model, &collect_message_text(body)?);
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

        #[derive(Deserialize)]
        struct UsageProbe {
            #[serde(default)]
            usage: CompletionUsage,
        }
        #[derive(Default, Deserialize)]
        struct CompletionUsage {
            #[serde(default)]
            completion_tokens: usize,
        }

        match serde_json::from_slice::<UsageProbe>(body) {
            Ok(probe) if probe.usage.completion_tokens > 0 => probe.usage.completion_tokens,
            _ => body.len() / 4,
        }
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

        let usage = chunk.get("usage").and_then(Value::as_object).map(|usage| {
            let input_tokens = usage
                .get("prompt_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let output_tokens = usage
                .get("completion_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0) as usize;
            let pricing = self.pricing(model).unwrap_or(ModelPricing {
                input: 0.0,
                output: 0.0,
            });
            StreamUsage {
                input_tokens,
                output_tokens,
                total_cost: input_tokens as f64 / 1000.0 * pricing.input
                    + output_tokens as f64 / 1000.0 * pricing.output,
            }
        });

        let tokens = if delta.is_empty() {
            0
        } else {
            self.count_tokens(model, &delta)
        };

        StreamEvent {
            delta,
            tokens,
            usage,
        }
    }

    fn parse_request(&self, body: &[u8]) -> Result<(String, bool)> {
        let probe: RequestProbe = serde_json::from_slice(body)
            .map_err(|err| GatewayError::Validation(format!("invalid request body: {err}")))?;
        Ok((probe.model, probe.stream))
    }

    /// Month-to-date spend from the legacy dashboard billing endpoint. The
    /// endpoint is deprecated upstream, so failures are expected and the
    /// caller treats this as best-effort.
    async fn get_usage(&self) -> Result<f64> {
        let now = Utc::now();
        let start = now.format("%Y-%m-01").to_string();
        let end = now.format("%Y-%m-%d").to_string();
        let url = format!(
            "{}/dashboard/billing/usage?start_date={start}&end_date={end}",
            self.base_url
        );

        let response = self
            .http
            .get(url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GatewayError::Upstream(format!(
                "openai usage api returned status {}",
                response.status()
            )));
        }

        #[derive(Deserialize)]
        struct BillingUsage {
            // Reported in cents.
            #[serde(default)]
            total_usage: f64,
        }
        let usage: BillingUsage = response
            .json()
            .await
            .map_err(|err| GatewayError::Upstream(err.without_url().to_string()))?;
        Ok(usage.total_usage / 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> OpenAi {
        OpenAi::new("test-key")
    }

    #[test]
    fn parse_request_extracts_model_and_stream() {
        let (model, stream) = provider()
            .parse_request(br#"{"model":"gpt-4o","stream":true,"messages":[]}"#)
            .expect("parse");
        assert_eq!(model, "gpt-4o");
        assert!(stream);
    }

    #[test]
    fn stream_chunk_with_content_counts_tokens() {
        let line = br#"data: {"choices":[{"delta":{"content":"hello world"}}]}"#;
        let event = provider().parse_stream_chunk("gpt-4o-mini", line);
        assert_eq!(event.delta, "hello world");
        assert!(event.tokens >= 2);
        assert!(event.usage.is_none());
    }

    #[test]
    fn stream_chunk_with_usage_is_terminal() {
        let line =
            br#"data: {"choices":[],"usage":{"prompt_tokens":10,"completion_tokens":20}}"#;
        let event = provider().parse_stream_chunk("gpt-4o-mini", line);
        assert_eq!(
            event.usage,
            Some(StreamUsage {
                input_tokens: 10,
                output_tokens: 20,
                total_cost: 10.0 / 1000.0 * 0.00015 + 20.0 / 1000.0 * 0.0006,
            })
        );
    }

    #[test]
    fn done_marker_yields_nothing() {
        let event = provider().parse_stream_chunk("gpt-4o-mini", b"data: [DONE]");
        assert_eq!(event, StreamEvent::default());
    }

    #[test]
    fn estimate_prices_input_tokens() {
        let body = br#"{"model":"gpt-4o-mini","messages":[{"role":"user","content":"hi"}]}"#;
        let estimate = provider()
            .estimate_usage("gpt-4o-mini", body)
            .expect("estimate");
        assert!(estimate.input_tokens >= 1);
        assert!(estimate.total_cost > 0.0);
    }

    #[tokio::test]
    async fn streamed_requests_ask_for_the_usage_trailer() {
        let request = provider()
            .prepare_http_request(
                "gpt-4o-mini",
                br#"{"model":"gpt-4o-mini","stream":true,"messages":[]}"#,
            )
            .await
            .expect("request");

        let body = request.body().and_then(|body| body.as_bytes()).unwrap();
        let payload: Value = serde_json::from_slice(body).expect("json");
        assert_eq!(
            payload["stream_options"]["include_usage"],
            Value::Bool(true)
        );
        assert!(request
            .headers()
            .get("authorization")
            .is_some_and(|auth| auth.to_str().unwrap().starts_with("Bearer ")));
    }

    #[test]
    fn output_usage_prefers_the_reported_count() {
        let body = br#"{"usage":{"completion_tokens":42}}"#;
        assert_eq!(provider().parse_output_usage("gpt-4o", body, false), 42);
    }
}
