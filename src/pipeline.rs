//! Per-request orchestration: the transient request/response pair, the
//! middleware chain, and the pipeline that validates, reserves budget and
//! dispatches to the execution handler.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use axum::http::{HeaderMap, StatusCode};
use bytes::Bytes;
use futures_util::stream::BoxStream;

use crate::domain::{Key, KeyConfiguration};
use crate::error::{GatewayError, Result};
use crate::keys::{KeyService, UsageCommitter};
use crate::middlewares::MiddlewareRegistry;
use crate::providers::Provider;

/// One in-flight proxy call. Lives strictly within the handling of a single
/// inbound HTTP request; dropping the future that owns it cancels the
/// upstream call.
pub struct ProxyRequest {
    pub key: Option<Key>,
    pub provider: Arc<dyn Provider>,
    pub model: String,
    pub body: Bytes,
    pub stream: bool,
    pub reserved_cost: f64,
    pub committer: Option<Arc<dyn UsageCommitter>>,
}

pub enum ResponseBody {
    Buffered(Bytes),
    /// Must be driven (or dropped) by the consumer; accounting side effects
    /// fire when the stream finishes or is dropped.
    Stream(BoxStream<'static, io::Result<Bytes>>),
}

pub struct ProxyResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ResponseBody,
    pub prompt_tokens: usize,
    pub output_tokens: usize,
    pub total_cost: f64,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse>;
}

/// Receives the chained `next` handler and decides whether and when to
/// invoke it. The first middleware configured on a key sees the request
/// first and the response last.
#[async_trait]
pub trait Middleware: Send + Sync {
    async fn execute(
        &self,
        request: ProxyRequest,
        next: Arc<dyn Handler>,
    ) -> Result<ProxyResponse>;
}

pub struct Chain {
    middlewares: Arc<[Arc<dyn Middleware>]>,
    final_handler: Arc<dyn Handler>,
}

impl Chain {
    pub fn new(final_handler: Arc<dyn Handler>, middlewares: Vec<Arc<dyn Middleware>>) -> Self {
        Self {
            middlewares: middlewares.into(),
            final_handler,
        }
    }

    pub async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        let step = ChainStep {
            middlewares: Arc::clone(&self.middlewares),
            final_handler: Arc::clone(&self.final_handler),
            index: 0,
        };
        step.handle(request).await
    }
}

struct ChainStep {
    middlewares: Arc<[Arc<dyn Middleware>]>,
    final_handler: Arc<dyn Handler>,
    index: usize,
}

#[async_trait]
impl Handler for ChainStep {
    async fn handle(&self, request: ProxyRequest) -> Result<ProxyResponse> {
        match self.middlewares.get(self.index) {
            Some(middleware) => {
                let next = Arc::new(ChainStep {
                    middlewares: Arc::clone(&self.middlewares),
                    final_handler: Arc::clone(&self.final_handler),
                    index: self.index + 1,
                });
                middleware.execute(request, next).await
            }
            None => self.final_handler.handle(request).await,
        }
    }
}

pub struct ProxyPipeline {
    final_handler: Arc<dyn Handler>,
    middlewares: Arc<MiddlewareRegistry>,
    keys: Arc<KeyService>,
}

impl ProxyPipeline {
    pub fn new(
        final_handler: Arc<dyn Handler>,
        middlewares: Arc<MiddlewareRegistry>,
        keys: Arc<KeyService>,
    ) -> Self {
        Self {
            final_handler,
            middlewares,
            keys,
        }
    }

    pub async fn execute(&self, mut request: ProxyRequest) -> Result<ProxyResponse> {
        let Some(key) = request.key.as_mut() else {
            return Err(GatewayError::InvalidKey);
        };

        // Expiration and auto-renewal.
        if key.is_expired() {
            if !key.auto_renew {
                return Err(GatewayError::KeyExpired);
            }
            if let Err(err) = self.keys.renew(key).await {
                tracing::warn!(prefix = key.prefix, error = %err, "auto-renew failed");
                return Err(GatewayError::KeyExpired);
            }
            tracing::info!(prefix = key.prefix, "key auto-renewed");
        }

        // Lazy budget reset. Failure is logged but never blocks the request.
        if key.reset_due() {
            match self.keys.reset_usage(key).await {
                Ok(()) => tracing::info!(prefix = key.prefix, "budget reset"),
                Err(err) => {
                    tracing::warn!(prefix = key.prefix, error = %err, "budget reset failed")
                }
            }
        }

        // Reservation: the only admission gate against the budget. On
        // rejection the upstream is never contacted.
        let reserved = request
            .provider
            .estimate_usage(&request.model, &request.body)
            .map(|estimate| estimate.total_cost)
            .unwrap_or(0.0);
        self.keys.reserve_usage(key.id, reserved).await?;

        let key_id = key.id;
        let configuration = key.configuration.clone();
        let committer = Arc::clone(&self.keys) as Arc<dyn UsageCommitter>;
        request.reserved_cost = reserved;
        request.committer = Some(Arc::clone(&committer));

        let chain = self.build_chain(&configuration);
        match chain.handle(request).await {
            Ok(response) => Ok(response),
            Err(err) => {
                // No response was produced, so the commit pair for this
                // reservation settles here with actual = 0 (a full refund).
                if let Err(commit_err) = committer.commit_usage(key_id, reserved, 0.0).await {
                    tracing::warn!(key_id, error = %commit_err,
                        "failed to refund reservation after chain error");
                }
                Err(err)
            }
        }
    }

    fn build_chain(&self, configuration: &KeyConfiguration) -> Chain {
        let mut middlewares = Vec::with_capacity(configuration.middlewares.len());
        for entry in &configuration.middlewares {
            match self.middlewares.instantiate(&entry.id, &entry.config) {
                Some(middleware) => middlewares.push(middleware),
                None => {
                    tracing::warn!(id = entry.id, "unknown middleware, skipping");
                }
            }
        }
        Chain::new(Arc::clone(&self.final_handler), middlewares)
    }
}
