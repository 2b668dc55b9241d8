use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{GatewayError, Result};
use crate::pipeline::{Handler, Middleware, ProxyRequest, ProxyResponse};

/// Re-checks key expiration inside the chain. The pipeline already rejects
/// expired keys before the chain runs; this guards configurations that rely
/// on middleware ordering alone.
pub struct KeyValidation;

#[async_trait]
impl Middleware for KeyValidation {
    async fn execute(
        &self,
        request: ProxyRequest,
        next: Arc<dyn Handler>,
    ) -> Result<ProxyResponse> {
        let Some(key) = request.key.as_ref() else {
            return Err(GatewayError::InvalidKey);
        };
        if key.is_expired() {
            return Err(GatewayError::KeyExpired);
        }
        next.handle(request).await
    }
}
