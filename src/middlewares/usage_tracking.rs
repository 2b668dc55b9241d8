use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::keys::KeyService;
use crate::pipeline::{Handler, Middleware, ProxyRequest, ProxyResponse};

/// Legacy accounting path: increments usage by the response's total cost
/// after a successful call. Must not be combined with the reservation gate,
/// which already charges the key; pairing them double-charges.
pub struct UsageTracking {
    keys: Arc<KeyService>,
}

impl UsageTracking {
    pub fn new(keys: Arc<KeyService>) -> Self {
        Self { keys }
    }
}

#[async_trait]
impl Middleware for UsageTracking {
    async fn execute(
        &self,
        request: ProxyRequest,
        next: Arc<dyn Handler>,
    ) -> Result<ProxyResponse> {
        let key = request.key.clone();
        let response = next.handle(request).await?;

        if let Some(key) = key.as_ref() {
            if response.total_cost > 0.0 {
                if let Err(err) = self.keys.increment_usage(key, response.total_cost).await {
                    tracing::warn!(prefix = key.prefix, error = %err,
                        "usage tracking increment failed");
                }
            }
        }
        Ok(response)
    }
}
