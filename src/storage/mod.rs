//! Key persistence: the repository contract plus the SQLite and in-memory
//! implementations.

mod sqlite;

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::SystemTime;

use async_trait::async_trait;
use thiserror::Error;

use crate::domain::{Key, KeyId};

pub use sqlite::SqliteRepository;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("sqlite join error: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Persistence operations for application keys. `reserve_usage` is the
/// atomic admission gate: it must only report `true` after incrementing
/// usage under the budget guard in a single serialized step.
#[async_trait]
pub trait KeyRepository: Send + Sync {
    async fn save(&self, key: &Key) -> Result<KeyId, StoreError>;
    async fn get_by_id(&self, id: KeyId) -> Result<Option<Key>, StoreError>;
    async fn get_by_hash(&self, hash: &str) -> Result<Option<Key>, StoreError>;
    async fn list(&self) -> Result<Vec<Key>, StoreError>;
    async fn update(&self, key: &Key) -> Result<(), StoreError>;
    async fn delete(&self, id: KeyId) -> Result<(), StoreError>;
    async fn increment_usage(&self, id: KeyId, amount: f64) -> Result<(), StoreError>;
    /// Returns whether the reservation was admitted. A non-positive limit
    /// admits unconditionally.
    async fn reserve_usage(&self, id: KeyId, amount: f64, limit: f64)
        -> Result<bool, StoreError>;
    async fn reset_usage(&self, id: KeyId, last_reset_at: SystemTime) -> Result<(), StoreError>;
}

/// Map-backed repository. Backs unit tests and ephemeral deployments where
/// key state does not need to survive a restart.
#[derive(Debug, Default)]
pub struct MemoryRepository {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    keys: HashMap<KeyId, Key>,
    next_id: KeyId,
}

impl MemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyRepository for MemoryRepository {
    async fn save(&self, key: &Key) -> Result<KeyId, StoreError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        inner.next_id += 1;
        let id = inner.next_id;
        let mut stored = key.clone();
        stored.id = id;
        inner.keys.insert(id, stored);
        Ok(id)
    }

    async fn get_by_id(&self, id: KeyId) -> Result<Option<Key>, StoreError> {
        let inner = self.inner.lock().expect("memory repo poisoned");
        Ok(inner.keys.get(&id).cloned())
    }

    async fn get_by_hash(&self, hash: &str) -> Result<Option<Key>, StoreError> {
        let inner = self.inner.lock().expect("memory repo poisoned");
        Ok(inner.keys.values().find(|key| key.key_hash == hash).cloned())
    }

    async fn list(&self) -> Result<Vec<Key>, StoreError> {
        let inner = self.inner.lock().expect("memory repo poisoned");
        let mut keys: Vec<Key> = inner.keys.values().cloned().collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(keys)
    }

    async fn update(&self, key: &Key) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        if let Some(stored) = inner.keys.get_mut(&key.id) {
            *stored = key.clone();
        }
        Ok(())
    }

    async fn delete(&self, id: KeyId) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        inner.keys.remove(&id);
        Ok(())
    }

    async fn increment_usage(&self, id: KeyId, amount: f64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        if let Some(stored) = inner.keys.get_mut(&id) {
            stored.budget_usage += amount;
        }
        Ok(())
    }

    async fn reserve_usage(
        &self,
        id: KeyId,
        amount: f64,
        limit: f64,
    ) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        let Some(stored) = inner.keys.get_mut(&id) else {
            return Ok(false);
        };
        if limit > 0.0 && stored.budget_usage + amount > limit {
            return Ok(false);
        }
        stored.budget_usage += amount;
        Ok(true)
    }

    async fn reset_usage(&self, id: KeyId, last_reset_at: SystemTime) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("memory repo poisoned");
        if let Some(stored) = inner.keys.get_mut(&id) {
            stored.budget_usage = 0.0;
            stored.last_reset_at = last_reset_at;
        }
        Ok(())
    }
}
