//! Provider contract and the built-in adapters (OpenAI, Anthropic, Gemini,
//! mock).

pub mod anthropic;
pub mod gemini;
pub mod mock;
pub mod openai;
mod tokenizer;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{ConfigMap, PluginInfo, PluginSchema};
use crate::error::Result;
use crate::pricing::ModelPricing;

pub use anthropic::Anthropic;
pub use gemini::Gemini;
pub use mock::MockProvider;
pub use openai::OpenAi;
pub use tokenizer::count_tokens_bpe;

/// Pre-flight cost estimate used for budget reservation.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct UsageEstimate {
    pub input_tokens: usize,
    pub total_cost: f64,
}

/// Provider-reported usage extracted from a terminal stream chunk.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct StreamUsage {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_cost: f64,
}

/// Result of parsing one SSE line: the content delta (possibly empty), the
/// tokens counted for that delta, and usage when the chunk carried it.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StreamEvent {
    pub delta: String,
    pub tokens: usize,
    pub usage: Option<StreamUsage>,
}

/// Adapter to one remote LLM backend. Registered once at startup and shared
/// across requests; `configure` derives a per-key instance without mutating
/// the registered one.
#[async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;
    fn schema(&self) -> PluginSchema;
    fn configure(&self, config: &ConfigMap) -> Result<Arc<dyn Provider>>;

    /// Dollar rates per 1k tokens; exact model id first, then longest prefix.
    fn pricing(&self, model: &str) -> Result<ModelPricing>;
    fn count_tokens(&self, model: &str, text: &str) -> usize;

    /// Builds the ready-to-send upstream request, auth attached.
    async fn prepare_http_request(&self, model: &str, body: &[u8]) -> Result<reqwest::Request>;

    fn estimate_usage(&self, model: &str, body: &[u8]) -> Result<UsageEstimate>;
    /// Output token count from a full response body; authoritative when the
    /// provider reports usage, otherwise a best-effort content count.
    fn parse_output_usage(&self, model: &str, body: &[u8], stream: bool) -> usize;
    fn parse_stream_chunk(&self, model: &str, line: &[u8]) -> StreamEvent;
    /// Extracts the two generic fields the pipeline needs from a
    /// provider-native request body.
    fn parse_request(&self, body: &[u8]) -> Result<(String, bool)>;

    /// Provider-side aggregate spend; best-effort, may be zero.
    async fn get_usage(&self) -> Result<f64>;
}

#[derive(Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.providers.contains_key(name)
    }

    pub fn all(&self) -> Vec<Arc<dyn Provider>> {
        self.providers.values().cloned().collect()
    }

    pub fn infos(&self) -> Vec<PluginInfo> {
        self.providers
            .values()
            .map(|provider| PluginInfo {
                id: provider.name().to_string(),
                schema: provider.schema(),
            })
            .collect()
    }
}

/// Strips the SSE framing from one line: returns the payload of a `data: `
/// line, or `None` for other fields, blank lines and the `[DONE]` terminator.
pub(crate) fn sse_data(line: &[u8]) -> Option<&[u8]> {
    let trimmed = trim_ascii(line);
    let rest = trimmed.strip_prefix(b"data:")?;
    let rest = trim_ascii(rest);
    if rest.is_empty() || rest == b"[DONE]" {
        return None;
    }
    Some(rest)
}

pub(crate) fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let end = bytes
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|pos| pos + 1)
        .unwrap_or(start);
    &bytes[start..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sse_data_skips_terminator_and_other_fields() {
        assert_eq!(sse_data(b"data: {\"a\":1}\n"), Some(&b"{\"a\":1}"[..]));
        assert_eq!(sse_data(b"data: [DONE]\n"), None);
        assert_eq!(sse_data(b"event: message\n"), None);
        assert_eq!(sse_data(b"\n"), None);
    }
}
