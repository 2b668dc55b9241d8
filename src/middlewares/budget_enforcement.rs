use std::sync::Arc;

use async_trait::async_trait;

use super::limit_field;
use crate::domain::{ConfigMap, PluginSchema};
use crate::error::{GatewayError, Result};
use crate::pipeline::{Handler, Middleware, ProxyRequest, ProxyResponse};

pub(super) fn schema() -> PluginSchema {
    PluginSchema::from([(
        "limit".to_string(),
        limit_field("Reject once accumulated usage reaches this many dollars"),
    )])
}

/// Legacy pre-flight budget guard, kept for configurations that predate the
/// reservation gate.
pub struct BudgetEnforcement {
    limit: f64,
}

impl BudgetEnforcement {
    pub fn from_config(config: &ConfigMap) -> Self {
        let limit = config
            .get("limit")
            .and_then(|value| value.as_f64())
            .unwrap_or(0.0);
        Self { limit }
    }
}

#[async_trait]
impl Middleware for BudgetEnforcement {
    async fn execute(
        &self,
        request: ProxyRequest,
        next: Arc<dyn Handler>,
    ) -> Result<ProxyResponse> {
        if self.limit > 0.0 {
            if let Some(key) = request.key.as_ref() {
                if key.budget_usage >= self.limit {
                    return Err(GatewayError::BudgetExceeded {
                        limit: self.limit,
                        attempted: key.budget_usage,
                    });
                }
            }
        }
        next.handle(request).await
    }
}
