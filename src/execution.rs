//! Final handler of every chain: dispatches the prepared upstream request
//! and meters the response, inline for buffered calls and through a counting
//! stream wrapper for SSE.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;

use crate::domain::KeyId;
use crate::error::Result;
use crate::keys::UsageCommitter;
use crate::pipeline::{Handler, ProxyRequest, ProxyResponse, ResponseBody};
use crate::providers::{Provider, StreamUsage};

// Bound on buffered partial-line bytes; anything beyond this is not SSE.
const MAX_PENDING_LINE_BYTES: usize = 256 * 1024;

pub struct ExecutionHandler {
    http: reqwest::Client,
}

impl Default for ExecutionHandler {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionHandler {
    pub fn new() -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { http }
    }
}

#[async_trait]
impl Handler for ExecutionHandler {
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let upstream_request = request
            .provider
            .prepare_http_request(&request.model, &request.body)
            .await?;
        let upstream = self.http.execute(upstream_request).await?;

        let status = upstream.status();
        let headers = upstream.headers().clone();

        let estimate = request
            .provider
            .estimate_usage(&request.model, &request.body)
            .ok();
        let prompt_tokens = estimate.map(|usage| usage.input_tokens).unwrap_or(0);
        let input_cost = estimate.map(|usage| usage.total_cost).unwrap_or(0.0);

        if !request.stream {
            let body = upstream.bytes().await?;
            let output_tokens =
                request
                    .provider
                    .parse_output_usage(&request.model, &body, false);
            let output_price = request
                .provider
                .pricing(&request.model)
                .map(|pricing| pricing.output)
                .unwrap_or(0.0);
            let total_cost = input_cost + output_tokens as f64 / 1000.0 * output_price;

            if let (Some(committer), Some(key)) =
                (request.committer.as_ref(), request.key.as_ref())
            {
                if let Err(err) = committer
                    .commit_usage(key.id, request.reserved_cost, total_cost)
                    .await
                {
                    tracing::warn!(key_id = key.id, error = %err, "usage commit failed");
                }
            }

            return Ok(ProxyResponse {
                status,
                headers,
                body: ResponseBody::Buffered(body),
                prompt_tokens,
                output_tokens,
                total_cost,
            });
        }

        // Streaming: hand the body back untouched and settle the budget when
        // the stream finishes or the client goes away.
        let finalizer = request
            .committer
            .as_ref()
            .zip(request.key.as_ref())
            .map(|(committer, key)| StreamFinalizer {
                committer: Arc::clone(committer),
                key_id: key.id,
                reserved: request.reserved_cost,
            });

        let body = counting_stream(
            upstream
                .bytes_stream()
                .map(|chunk| chunk.map_err(io::Error::other))
                .boxed(),
            StreamAccountant::new(Arc::clone(&request.provider), request.model.clone()),
            finalizer,
        );

        Ok(ProxyResponse {
            status,
            headers,
            body: ResponseBody::Stream(body),
            prompt_tokens,
            output_tokens: 0,
            total_cost: input_cost,
        })
    }
}

/// Incremental SSE accountant: splits the byte stream on newlines and feeds
/// complete lines to the provider's chunk parser.
pub struct StreamAccountant {
    provider: Arc<dyn Provider>,
    model: String,
    pending: Vec<u8>,
    total_tokens: usize,
    final_usage: Option<StreamUsage>,
}

impl StreamAccountant {
    pub fn new(provider: Arc<dyn Provider>, model: String) -> Self {
        Self {
            provider,
            model,
            pending: Vec::new(),
            total_tokens: 0,
            final_usage: None,
        }
    }

    pub fn ingest(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(newline) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=newline).collect();
            let event = self.provider.parse_stream_chunk(&self.model, &line);
            if let Some(usage) = event.usage {
                self.final_usage = Some(usage);
            }
            self.total_tokens += event.tokens;
        }

        if self.pending.len() > MAX_PENDING_LINE_BYTES {
            self.pending.clear();
        }
    }

    pub fn output_tokens(&self) -> usize {
        self.final_usage
            .map(|usage| usage.output_tokens)
            .unwrap_or(self.total_tokens)
    }

    /// Reported cost when the provider sent a usage chunk, otherwise the
    /// running token total priced at the output rate.
    fn actual_cost(&self) -> f64 {
        if let Some(usage) = self.final_usage {
            return usage.total_cost;
        }
        let output_price = self
            .provider
            .pricing(&self.model)
            .map(|pricing| pricing.output)
            .unwrap_or(0.0);
        self.total_tokens as f64 / 1000.0 * output_price
    }
}

struct StreamFinalizer {
    committer: Arc<dyn UsageCommitter>,
    key_id: KeyId,
    reserved: f64,
}

impl StreamFinalizer {
    async fn finalize(self, actual: f64) {
        if let Err(err) = self
            .committer
            .commit_usage(self.key_id, self.reserved, actual)
            .await
        {
            tracing::warn!(key_id = self.key_id, error = %err, "stream usage commit failed");
        }
    }
}

struct CountingState {
    upstream: BoxStream<'static, io::Result<Bytes>>,
    accountant: StreamAccountant,
    finalizer: Option<StreamFinalizer>,
}

impl CountingState {
    async fn finalize(&mut self) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        finalizer.finalize(self.accountant.actual_cost()).await;
    }
}

impl Drop for CountingState {
    // Client disconnect path: the response stream is dropped mid-flight, so
    // the commit has to be handed off rather than awaited.
    fn drop(&mut self) {
        let Some(finalizer) = self.finalizer.take() else {
            return;
        };
        let actual = self.accountant.actual_cost();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { finalizer.finalize(actual).await });
            }
            Err(_) => {
                let _ = std::thread::Builder::new()
                    .name("satchel-stream-finalizer".to_string())
                    .spawn(move || {
                        let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                            .enable_all()
                            .build()
                        else {
                            return;
                        };
                        runtime.block_on(finalizer.finalize(actual));
                    });
            }
        }
    }
}

/// Wraps the upstream body: bytes pass through unmodified while the
/// accountant watches them, and the finalizer commits exactly once on end,
/// error, or drop.
fn counting_stream(
    upstream: BoxStream<'static, io::Result<Bytes>>,
    accountant: StreamAccountant,
    finalizer: Option<StreamFinalizer>,
) -> BoxStream<'static, io::Result<Bytes>> {
    let state = CountingState {
        upstream,
        accountant,
        finalizer,
    };

    Box::pin(futures_util::stream::unfold(state, |mut state| async move {
        match state.upstream.next().await {
            Some(Ok(chunk)) => {
                state.accountant.ingest(&chunk);
                Some((Ok(chunk), state))
            }
            Some(Err(err)) => {
                state.finalize().await;
                Some((Err(err), state))
            }
            None => {
                state.finalize().await;
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GatewayError;
    use crate::providers::MockProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingCommitter {
        commits: Mutex<Vec<(KeyId, f64, f64)>>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl UsageCommitter for RecordingCommitter {
        async fn commit_usage(&self, key_id: KeyId, reserved: f64, actual: f64) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.commits
                .lock()
                .unwrap()
                .push((key_id, reserved, actual));
            Ok(())
        }
    }

    impl From<&Arc<RecordingCommitter>> for StreamFinalizer {
        fn from(committer: &Arc<RecordingCommitter>) -> Self {
            StreamFinalizer {
                committer: Arc::clone(committer) as Arc<dyn UsageCommitter>,
                key_id: 7,
                reserved: 0.25,
            }
        }
    }

    fn accountant() -> StreamAccountant {
        StreamAccountant::new(Arc::new(MockProvider::new()), "m".to_string())
    }

    fn sse_chunks(lines: &[&str]) -> Vec<io::Result<Bytes>> {
        lines
            .iter()
            .map(|line| Ok(Bytes::from(format!("data: {line}\n\n"))))
            .collect()
    }

    #[tokio::test]
    async fn commits_once_when_the_stream_completes() {
        let committer = Arc::new(RecordingCommitter::default());
        let chunks = sse_chunks(&[
            r#"{"choices":[{"delta":{"content":"first words"}}]}"#,
            r#"{"choices":[{"delta":{"content":"more words here"}}]}"#,
            "[DONE]",
        ]);

        let mut stream = counting_stream(
            futures_util::stream::iter(chunks).boxed(),
            accountant(),
            Some(StreamFinalizer::from(&committer)),
        );
        while let Some(chunk) = stream.next().await {
            chunk.expect("chunk");
        }
        drop(stream);
        tokio::task::yield_now().await;

        assert_eq!(committer.calls.load(Ordering::SeqCst), 1);
        let commits = committer.commits.lock().unwrap();
        // Mock pricing is zero, so completion settles the reservation to zero.
        assert_eq!(commits[0], (7, 0.25, 0.0));
    }

    #[tokio::test]
    async fn dropping_mid_stream_still_commits_exactly_once() {
        let committer = Arc::new(RecordingCommitter::default());
        let chunks = sse_chunks(&[
            r#"{"choices":[{"delta":{"content":"only chunk seen"}}]}"#,
            r#"{"choices":[{"delta":{"content":"never delivered"}}]}"#,
        ]);

        let mut stream = counting_stream(
            futures_util::stream::iter(chunks).boxed(),
            accountant(),
            Some(StreamFinalizer::from(&committer)),
        );
        stream.next().await.expect("first chunk").expect("bytes");
        drop(stream);

        // The drop path spawns the commit onto the runtime.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(committer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn bytes_pass_through_unmodified() {
        let payload = "data: {\"choices\":[{\"delta\":{\"content\":\"x\"}}]}\n\ndata: [DONE]\n\n";
        let chunks = vec![Ok(Bytes::from(payload))];

        let mut stream = counting_stream(
            futures_util::stream::iter(chunks).boxed(),
            accountant(),
            None,
        );
        let out = stream.next().await.expect("chunk").expect("bytes");
        assert_eq!(out, Bytes::from(payload));
    }

    #[test]
    fn accountant_prefers_provider_reported_usage() {
        let openai = Arc::new(crate::providers::OpenAi::new("k"));
        let mut accountant =
            StreamAccountant::new(openai, "gpt-4o-mini".to_string());
        accountant.ingest(b"data: {\"choices\":[{\"delta\":{\"content\":\"hello there\"}}]}\n");
        accountant
            .ingest(b"data: {\"choices\":[],\"usage\":{\"prompt_tokens\":3,\"completion_tokens\":11}}\n");

        assert_eq!(accountant.output_tokens(), 11);
        assert!(accountant.actual_cost() > 0.0);
    }

    #[test]
    fn accountant_splits_lines_across_chunk_boundaries() {
        let mut accountant = accountant();
        accountant.ingest(b"data: {\"choices\":[{\"delta\":{\"cont");
        assert_eq!(accountant.output_tokens(), 0);
        accountant.ingest(b"ent\":\"twelve chars\"}}]}\n");
        assert_eq!(accountant.output_tokens(), "twelve chars".len() / 4);
    }

    #[tokio::test]
    async fn upstream_connection_failure_maps_to_upstream_error() {
        let handler = ExecutionHandler::new();
        // Nothing listens on this port; the dial fails fast.
        let provider = crate::providers::OpenAi::new("k").with_base_url("http://127.0.0.1:9");
        let request = ProxyRequest {
            key: None,
            provider: Arc::new(provider),
            model: "gpt-4o-mini".to_string(),
            body: Bytes::from_static(b"{\"model\":\"gpt-4o-mini\",\"messages\":[]}"),
            stream: false,
            reserved_cost: 0.0,
            committer: None,
        };

        let result = handler.handle(request).await;
        assert!(matches!(result, Err(GatewayError::Upstream(_))));
    }
}
