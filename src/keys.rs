//! Application key lifecycle and accounting: issuance, verification with a
//! write-through cache, budget reservation and commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant, SystemTime};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::domain::{Key, KeyConfiguration, KeyId, PluginConfig, PluginInfo};
use crate::error::{GatewayError, Result};
use crate::middlewares::MiddlewareRegistry;
use crate::providers::ProviderRegistry;
use crate::storage::KeyRepository;

/// Scheme prefix carried by every issued secret.
pub const KEY_SCHEME_PREFIX: &str = "sa-";
const SECRET_BYTES: usize = 24;
const DISPLAY_PREFIX_CHARS: usize = 8;
const VERIFY_CACHE_TTL: Duration = Duration::from_secs(60);
const DEFAULT_RENEW_PERIOD: Duration = Duration::from_secs(30 * 24 * 60 * 60);

/// Post-response reconciliation of a budget reservation. Implemented by
/// [`KeyService`], consumed by the execution handler and the stream
/// accountant.
#[async_trait]
pub trait UsageCommitter: Send + Sync {
    async fn commit_usage(&self, key_id: KeyId, reserved: f64, actual: f64) -> Result<()>;
}

#[derive(Clone, Debug)]
struct CachedKey {
    key: Key,
    expires_at: Instant,
}

#[derive(Clone, Debug, Default)]
pub struct CreateKeyInput {
    pub name: String,
    pub provider: PluginConfig,
    pub middlewares: Vec<PluginConfig>,
    pub budget_limit: f64,
    pub reset_period_secs: u64,
    pub expires_at: Option<SystemTime>,
    pub auto_renew: bool,
}

#[derive(Clone, Debug, Default)]
pub struct UpdateKeyInput {
    pub id: KeyId,
    pub name: String,
    pub provider: PluginConfig,
    pub middlewares: Vec<PluginConfig>,
    pub budget_limit: f64,
    pub reset_period_secs: u64,
    pub expires_at: Option<SystemTime>,
    pub auto_renew: bool,
}

pub struct KeyService {
    repo: Arc<dyn KeyRepository>,
    providers: Arc<ProviderRegistry>,
    middlewares: Arc<MiddlewareRegistry>,
    cache: RwLock<HashMap<String, CachedKey>>,
}

impl KeyService {
    pub fn new(
        repo: Arc<dyn KeyRepository>,
        providers: Arc<ProviderRegistry>,
        middlewares: Arc<MiddlewareRegistry>,
    ) -> Self {
        Self {
            repo,
            providers,
            middlewares,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Issues a new key. Returns the plaintext secret (shown exactly once)
    /// alongside the stored entity.
    pub async fn create(&self, input: CreateKeyInput) -> Result<(String, Key)> {
        if !input.provider.id.is_empty() && !self.providers.contains(&input.provider.id) {
            return Err(GatewayError::ProviderNotFound(input.provider.id));
        }

        let raw = generate_secret()?;
        let now = SystemTime::now();
        let mut key = Key {
            id: 0,
            name: input.name,
            key_hash: hash_secret(&raw),
            prefix: raw.chars().take(DISPLAY_PREFIX_CHARS).collect(),
            expires_at: input.expires_at,
            auto_renew: input.auto_renew,
            budget_usage: 0.0,
            last_reset_at: now,
            created_at: now,
            configuration: KeyConfiguration {
                provider: input.provider,
                middlewares: input.middlewares,
                budget_limit: input.budget_limit,
                reset_period_secs: input.reset_period_secs,
            },
        };
        key.validate()?;

        key.id = self.repo.save(&key).await?;
        Ok((raw, key))
    }

    /// Resolves a presented secret to its key, via the verification cache.
    /// Returned keys are defensive copies; mutating one never affects the
    /// cache or other callers.
    pub async fn verify(&self, raw: &str) -> Result<Key> {
        let hash = hash_secret(raw);

        {
            let cache = self.cache.read().expect("key cache poisoned");
            if let Some(entry) = cache.get(&hash) {
                if Instant::now() < entry.expires_at {
                    return Ok(entry.key.clone());
                }
            }
        }

        let key = self
            .repo
            .get_by_hash(&hash)
            .await?
            .ok_or(GatewayError::InvalidKey)?;

        let mut cache = self.cache.write().expect("key cache poisoned");
        cache.insert(
            hash,
            CachedKey {
                key: key.clone(),
                expires_at: Instant::now() + VERIFY_CACHE_TTL,
            },
        );
        Ok(key)
    }

    pub async fn list(&self) -> Result<Vec<Key>> {
        Ok(self.repo.list().await?)
    }

    pub async fn update(&self, input: UpdateKeyInput) -> Result<()> {
        let mut key = self
            .repo
            .get_by_id(input.id)
            .await?
            .ok_or(GatewayError::KeyNotFound)?;

        if !input.provider.id.is_empty() && !self.providers.contains(&input.provider.id) {
            return Err(GatewayError::ProviderNotFound(input.provider.id));
        }

        key.name = input.name;
        key.auto_renew = input.auto_renew;
        key.expires_at = input.expires_at;
        key.configuration = KeyConfiguration {
            provider: input.provider,
            middlewares: input.middlewares,
            budget_limit: input.budget_limit,
            reset_period_secs: input.reset_period_secs,
        };
        key.validate()?;

        self.repo.update(&key).await?;
        self.invalidate(&key.key_hash);
        Ok(())
    }

    pub async fn delete(&self, id: KeyId) -> Result<()> {
        let key = self.repo.get_by_id(id).await?;
        self.repo.delete(id).await?;
        if let Some(key) = key {
            self.invalidate(&key.key_hash);
        }
        Ok(())
    }

    /// Zeroes usage and stamps the reset time, atomically with respect to the
    /// persistent counter; the cached entry is mutated in place.
    pub async fn reset_usage(&self, key: &mut Key) -> Result<()> {
        let now = SystemTime::now();
        self.repo.reset_usage(key.id, now).await?;
        key.budget_usage = 0.0;
        key.last_reset_at = now;

        let mut cache = self.cache.write().expect("key cache poisoned");
        if let Some(entry) = cache.get_mut(&key.key_hash) {
            entry.key.budget_usage = 0.0;
            entry.key.last_reset_at = now;
        }
        Ok(())
    }

    /// Auto-renewal for expired keys: usage restarts from zero and the
    /// expiration window is extended by the configured reset period.
    pub async fn renew(&self, key: &mut Key) -> Result<()> {
        let now = SystemTime::now();
        key.budget_usage = 0.0;
        key.last_reset_at = now;

        if key.expires_at.is_some() {
            let period = if key.configuration.reset_period_secs > 0 {
                Duration::from_secs(key.configuration.reset_period_secs)
            } else {
                DEFAULT_RENEW_PERIOD
            };
            key.expires_at = Some(now + period);
        }

        self.repo.update(key).await?;
        self.invalidate(&key.key_hash);
        Ok(())
    }

    pub async fn increment_usage(&self, key: &Key, amount: f64) -> Result<()> {
        self.repo.increment_usage(key.id, amount).await?;
        self.apply_cached_delta(key.id, amount);
        Ok(())
    }

    /// Admission gate: reserves `amount` against the key's budget before the
    /// upstream call. The repository performs the guarded increment in one
    /// serialized statement, so concurrent reservations cannot overcommit.
    pub async fn reserve_usage(&self, key_id: KeyId, amount: f64) -> Result<()> {
        let key = self
            .repo
            .get_by_id(key_id)
            .await?
            .ok_or(GatewayError::KeyNotFound)?;
        let limit = key.configuration.budget_limit;

        let admitted = self.repo.reserve_usage(key_id, amount, limit).await?;
        if !admitted {
            return Err(GatewayError::BudgetExceeded {
                limit,
                attempted: key.budget_usage + amount,
            });
        }
        self.apply_cached_delta(key_id, amount);
        Ok(())
    }

    /// Fans out to every registered provider concurrently; a provider that
    /// fails to report is logged and omitted rather than failing the merge.
    pub async fn provider_usage(&self) -> BTreeMap<String, f64> {
        let providers = self.providers.all();
        let fetches = providers.iter().map(|provider| {
            let provider = Arc::clone(provider);
            async move {
                match provider.get_usage().await {
                    Ok(cost) => Some((provider.name().to_string(), cost)),
                    Err(err) => {
                        tracing::warn!(provider = provider.name(), error = %err,
                            "failed to fetch provider usage");
                        None
                    }
                }
            }
        });
        futures_util::future::join_all(fetches)
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    pub fn list_providers(&self) -> Vec<PluginInfo> {
        self.providers.infos()
    }

    pub fn list_middlewares(&self) -> Vec<PluginInfo> {
        self.middlewares.infos()
    }

    fn invalidate(&self, hash: &str) {
        let mut cache = self.cache.write().expect("key cache poisoned");
        cache.remove(hash);
    }

    fn apply_cached_delta(&self, key_id: KeyId, amount: f64) {
        let mut cache = self.cache.write().expect("key cache poisoned");
        for entry in cache.values_mut() {
            if entry.key.id == key_id {
                entry.key.budget_usage += amount;
                break;
            }
        }
    }
}

#[async_trait]
impl UsageCommitter for KeyService {
    /// Applies `actual - reserved` exactly once per request; the pipeline
    /// guarantees single invocation (inline for buffered responses, on
    /// stream close otherwise).
    async fn commit_usage(&self, key_id: KeyId, reserved: f64, actual: f64) -> Result<()> {
        let diff = actual - reserved;
        if diff == 0.0 {
            return Ok(());
        }
        self.repo.increment_usage(key_id, diff).await?;
        self.apply_cached_delta(key_id, diff);
        Ok(())
    }
}

fn generate_secret() -> Result<String> {
    let mut bytes = [0u8; SECRET_BYTES];
    getrandom::fill(&mut bytes)
        .map_err(|err| GatewayError::Internal(format!("secret generation failed: {err}")))?;
    Ok(format!("{KEY_SCHEME_PREFIX}{}", hex_encode(&bytes)))
}

fn hash_secret(raw: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw.as_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConfigValue;
    use crate::providers::{mock::MockProvider, ProviderRegistry};
    use crate::storage::MemoryRepository;

    fn service() -> KeyService {
        let mut providers = ProviderRegistry::new();
        providers.register(Arc::new(MockProvider::new()));
        KeyService::new(
            Arc::new(MemoryRepository::new()),
            Arc::new(providers),
            Arc::new(MiddlewareRegistry::new()),
        )
    }

    fn mock_input(name: &str) -> CreateKeyInput {
        CreateKeyInput {
            name: name.to_string(),
            provider: PluginConfig::new("mock"),
            ..CreateKeyInput::default()
        }
    }

    #[tokio::test]
    async fn verify_after_create_round_trips() {
        let service = service();
        let (raw, created) = service.create(mock_input("round trip")).await.expect("create");

        assert!(raw.starts_with(KEY_SCHEME_PREFIX));
        assert_eq!(created.prefix, raw.chars().take(8).collect::<String>());

        let verified = service.verify(&raw).await.expect("verify");
        assert_eq!(verified.name, created.name);
        assert_eq!(verified.prefix, created.prefix);
        assert_eq!(verified.configuration, created.configuration);
    }

    #[tokio::test]
    async fn unknown_provider_is_rejected_at_create() {
        let service = service();
        let mut input = mock_input("bad provider");
        input.provider = PluginConfig::new("nonexistent");
        assert!(matches!(
            service.create(input).await,
            Err(GatewayError::ProviderNotFound(_))
        ));
    }

    #[tokio::test]
    async fn cached_keys_are_defensive_copies() {
        let service = service();
        let (raw, _) = service.create(mock_input("copy safety")).await.expect("create");

        let mut first = service.verify(&raw).await.expect("verify");
        first.name = "mutated".to_string();
        first
            .configuration
            .provider
            .config
            .insert("injected".to_string(), ConfigValue::Bool(true));

        let second = service.verify(&raw).await.expect("verify");
        assert_eq!(second.name, "copy safety");
        assert!(second.configuration.provider.config.is_empty());
    }

    #[tokio::test]
    async fn reservation_respects_the_budget_limit() {
        let service = service();
        let mut input = mock_input("budgeted");
        input.budget_limit = 0.05;
        let (_, key) = service.create(input).await.expect("create");

        for _ in 0..5 {
            service.reserve_usage(key.id, 0.01).await.expect("reserve");
        }
        assert!(matches!(
            service.reserve_usage(key.id, 0.01).await,
            Err(GatewayError::BudgetExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn commit_applies_the_signed_difference() {
        let service = service();
        let (raw, key) = service.create(mock_input("committed")).await.expect("create");

        service.reserve_usage(key.id, 0.02).await.expect("reserve");
        service
            .commit_usage(key.id, 0.02, 0.005)
            .await
            .expect("commit");

        // Refund is visible through the cache without waiting for the TTL.
        let cached = service.verify(&raw).await.expect("verify");
        assert!((cached.budget_usage - 0.005).abs() < 1e-9);
    }

    #[tokio::test]
    async fn update_invalidates_the_cache_entry() {
        let service = service();
        let (raw, key) = service.create(mock_input("refresh")).await.expect("create");
        service.verify(&raw).await.expect("warm cache");

        service
            .update(UpdateKeyInput {
                id: key.id,
                name: "renamed".to_string(),
                provider: PluginConfig::new("mock"),
                ..UpdateKeyInput::default()
            })
            .await
            .expect("update");

        let fresh = service.verify(&raw).await.expect("verify");
        assert_eq!(fresh.name, "renamed");
    }
}
