use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use super::period_field;
use crate::domain::{ConfigMap, PluginSchema};
use crate::error::Result;
use crate::keys::KeyService;
use crate::pipeline::{Handler, Middleware, ProxyRequest, ProxyResponse};

pub(super) fn schema() -> PluginSchema {
    PluginSchema::from([(
        "period".to_string(),
        period_field("Zero the key's usage once this many seconds have elapsed"),
    )])
}

/// Lazily resets a key's usage once the configured period has elapsed since
/// the last reset.
pub struct BudgetReset {
    keys: Arc<KeyService>,
    period_secs: u64,
}

impl BudgetReset {
    pub fn from_config(keys: Arc<KeyService>, config: &ConfigMap) -> Self {
        let period_secs = config
            .get("period")
            .and_then(|value| value.as_u64())
            .unwrap_or(0);
        Self { keys, period_secs }
    }
}

#[async_trait]
impl Middleware for BudgetReset {
    async fn execute(
        &self,
        mut request: ProxyRequest,
        next: Arc<dyn Handler>,
    ) -> Result<ProxyResponse> {
        if self.period_secs > 0 {
            if let Some(key) = request.key.as_mut() {
                let due = SystemTime::now()
                    > key.last_reset_at + Duration::from_secs(self.period_secs);
                if due {
                    self.keys.reset_usage(key).await?;
                }
            }
        }
        next.handle(request).await
    }
}
