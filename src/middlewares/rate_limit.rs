//! Per-key token buckets. The bucket map lives for the process; entries are
//! keyed by `(key id, limit, period)` so a key whose rate configuration
//! changes observes a freshly constructed bucket on its next request.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use async_trait::async_trait;

use super::{limit_field, period_field};
use crate::domain::{ConfigMap, KeyId, PluginSchema};
use crate::error::{GatewayError, Result};
use crate::pipeline::{Handler, Middleware, ProxyRequest, ProxyResponse};

pub(super) fn schema() -> PluginSchema {
    PluginSchema::from([
        (
            "limit".to_string(),
            limit_field("Requests admitted per period (also the burst size)"),
        ),
        (
            "period".to_string(),
            period_field("Window length in seconds"),
        ),
    ])
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

/// Non-blocking token bucket: capacity `limit`, refill `limit / period`
/// tokens per second.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    fn new(limit: u32, period_secs: u32) -> Self {
        let capacity = f64::from(limit);
        Self {
            capacity,
            refill_per_sec: capacity / f64::from(period_secs),
            state: Mutex::new(BucketState {
                tokens: capacity,
                refilled_at: Instant::now(),
            }),
        }
    }

    pub fn allow(&self) -> bool {
        let mut state = self.state.lock().expect("bucket poisoned");
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.refilled_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

type BucketKey = (KeyId, u32, u32);

/// Process-lifetime bucket map: read-locked lookup, double-checked insert
/// under the write lock on first use.
#[derive(Debug, Default)]
pub struct RateLimitBuckets {
    buckets: RwLock<HashMap<BucketKey, Arc<TokenBucket>>>,
}

impl RateLimitBuckets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bucket(&self, key_id: KeyId, limit: u32, period_secs: u32) -> Arc<TokenBucket> {
        let bucket_key = (key_id, limit, period_secs);
        {
            let buckets = self.buckets.read().expect("bucket map poisoned");
            if let Some(bucket) = buckets.get(&bucket_key) {
                return Arc::clone(bucket);
            }
        }

        let mut buckets = self.buckets.write().expect("bucket map poisoned");
        Arc::clone(
            buckets
                .entry(bucket_key)
                .or_insert_with(|| Arc::new(TokenBucket::new(limit, period_secs))),
        )
    }
}

pub struct RateLimit {
    buckets: Arc<RateLimitBuckets>,
    limit: u32,
    period_secs: u32,
}

impl RateLimit {
    pub fn from_config(buckets: Arc<RateLimitBuckets>, config: &ConfigMap) -> Self {
        let limit = config
            .get("limit")
            .and_then(|value| value.as_u64())
            .unwrap_or(0) as u32;
        let period_secs = config
            .get("period")
            .and_then(|value| value.as_u64())
            .unwrap_or(0) as u32;
        Self {
            buckets,
            limit,
            period_secs,
        }
    }
}

#[async_trait]
impl Middleware for RateLimit {
    async fn execute(
        &self,
        request: ProxyRequest,
        next: Arc<dyn Handler>,
    ) -> Result<ProxyResponse> {
        if self.limit > 0 && self.period_secs > 0 {
            if let Some(key) = request.key.as_ref() {
                let bucket = self.buckets.bucket(key.id, self.limit, self.period_secs);
                if !bucket.allow() {
                    return Err(GatewayError::RateLimitExceeded);
                }
            }
        }
        next.handle(request).await
    }
}
