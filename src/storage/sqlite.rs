use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Row};

use super::{KeyRepository, StoreError};
use crate::domain::{ConfigMap, Key, KeyConfiguration, KeyId, PluginConfig};

/// SQLite-backed repository. Connections are opened per operation on the
/// blocking pool; SQLite serializes writers, which is what makes the guarded
/// reservation statement an atomic admission gate.
#[derive(Clone, Debug)]
pub struct SqliteRepository {
    path: PathBuf,
}

impl SqliteRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn init(&self) -> Result<(), StoreError> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let conn = open_connection(path)?;
            init_schema(&conn)?;
            Ok(())
        })
        .await?
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || -> Result<T, StoreError> {
            let mut conn = open_connection(path)?;
            init_schema(&conn)?;
            f(&mut conn)
        })
        .await?
    }
}

const KEY_COLUMNS: &str = "id, name, key_hash, prefix, expires_at, auto_renew, budget_usage, \
                           last_reset_at, created_at, provider_id, provider_config, \
                           budget_limit, reset_period";

#[async_trait]
impl KeyRepository for SqliteRepository {
    async fn save(&self, key: &Key) -> Result<KeyId, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let provider_config = config_to_json(&key.configuration.provider.config)?;
            tx.execute(
                "INSERT INTO app_keys (name, key_hash, prefix, expires_at, auto_renew, \
                 budget_usage, last_reset_at, created_at, provider_id, provider_config, \
                 budget_limit, reset_period)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                rusqlite::params![
                    key.name,
                    key.key_hash,
                    key.prefix,
                    key.expires_at.map(to_unix_secs),
                    key.auto_renew,
                    key.budget_usage,
                    to_unix_secs(key.last_reset_at),
                    to_unix_secs(key.created_at),
                    key.configuration.provider.id,
                    provider_config,
                    key.configuration.budget_limit,
                    key.configuration.reset_period_secs as i64,
                ],
            )?;
            let id = tx.last_insert_rowid();
            insert_middlewares(&tx, id, &key.configuration.middlewares)?;
            tx.commit()?;
            Ok(id)
        })
        .await
    }

    async fn get_by_id(&self, id: KeyId) -> Result<Option<Key>, StoreError> {
        self.with_conn(move |conn| {
            let key = conn
                .query_row(
                    &format!("SELECT {KEY_COLUMNS} FROM app_keys WHERE id = ?1"),
                    rusqlite::params![id],
                    scan_key,
                )
                .optional()?;
            key.map(|key| attach_middlewares(conn, key)).transpose()
        })
        .await
    }

    async fn get_by_hash(&self, hash: &str) -> Result<Option<Key>, StoreError> {
        let hash = hash.to_string();
        self.with_conn(move |conn| {
            let key = conn
                .query_row(
                    &format!("SELECT {KEY_COLUMNS} FROM app_keys WHERE key_hash = ?1"),
                    rusqlite::params![hash],
                    scan_key,
                )
                .optional()?;
            key.map(|key| attach_middlewares(conn, key)).transpose()
        })
        .await
    }

    async fn list(&self) -> Result<Vec<Key>, StoreError> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {KEY_COLUMNS} FROM app_keys ORDER BY created_at DESC, id ASC"
            ))?;
            let rows = stmt.query_map([], scan_key)?;
            let mut keys = Vec::new();
            for row in rows {
                keys.push(row?);
            }
            drop(stmt);
            keys.into_iter()
                .map(|key| attach_middlewares(conn, key))
                .collect()
        })
        .await
    }

    async fn update(&self, key: &Key) -> Result<(), StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let provider_config = config_to_json(&key.configuration.provider.config)?;
            tx.execute(
                "UPDATE app_keys SET name = ?2, expires_at = ?3, auto_renew = ?4, \
                 budget_usage = ?5, last_reset_at = ?6, provider_id = ?7, \
                 provider_config = ?8, budget_limit = ?9, reset_period = ?10
                 WHERE id = ?1",
                rusqlite::params![
                    key.id,
                    key.name,
                    key.expires_at.map(to_unix_secs),
                    key.auto_renew,
                    key.budget_usage,
                    to_unix_secs(key.last_reset_at),
                    key.configuration.provider.id,
                    provider_config,
                    key.configuration.budget_limit,
                    key.configuration.reset_period_secs as i64,
                ],
            )?;
            tx.execute(
                "DELETE FROM app_key_middlewares WHERE app_key_id = ?1",
                rusqlite::params![key.id],
            )?;
            insert_middlewares(&tx, key.id, &key.configuration.middlewares)?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, id: KeyId) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute("DELETE FROM app_keys WHERE id = ?1", rusqlite::params![id])?;
            Ok(())
        })
        .await
    }

    async fn increment_usage(&self, id: KeyId, amount: f64) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE app_keys SET budget_usage = budget_usage + ?2 WHERE id = ?1",
                rusqlite::params![id, amount],
            )?;
            Ok(())
        })
        .await
    }

    async fn reserve_usage(
        &self,
        id: KeyId,
        amount: f64,
        limit: f64,
    ) -> Result<bool, StoreError> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE app_keys SET budget_usage = budget_usage + ?2
                 WHERE id = ?1 AND (?3 <= 0.0 OR budget_usage + ?2 <= ?3)",
                rusqlite::params![id, amount, limit],
            )?;
            Ok(changed == 1)
        })
        .await
    }

    async fn reset_usage(&self, id: KeyId, last_reset_at: SystemTime) -> Result<(), StoreError> {
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE app_keys SET budget_usage = 0, last_reset_at = ?2 WHERE id = ?1",
                rusqlite::params![id, to_unix_secs(last_reset_at)],
            )?;
            Ok(())
        })
        .await
    }
}

fn open_connection(path: PathBuf) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

fn init_schema(conn: &Connection) -> Result<(), rusqlite::Error> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS app_keys (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             name TEXT NOT NULL,
             key_hash TEXT NOT NULL UNIQUE,
             prefix TEXT NOT NULL,
             expires_at INTEGER,
             auto_renew INTEGER NOT NULL DEFAULT 0,
             budget_usage REAL NOT NULL DEFAULT 0,
             last_reset_at INTEGER NOT NULL,
             created_at INTEGER NOT NULL,
             provider_id TEXT NOT NULL,
             provider_config TEXT,
             budget_limit REAL NOT NULL DEFAULT 0,
             reset_period INTEGER NOT NULL DEFAULT 0
         );
         CREATE TABLE IF NOT EXISTS app_key_middlewares (
             app_key_id INTEGER NOT NULL REFERENCES app_keys(id) ON DELETE CASCADE,
             middleware_id TEXT NOT NULL,
             config TEXT,
             priority INTEGER NOT NULL
         );
         CREATE INDEX IF NOT EXISTS idx_app_key_middlewares_key
             ON app_key_middlewares(app_key_id, priority);",
    )
}

fn insert_middlewares(
    tx: &rusqlite::Transaction<'_>,
    key_id: KeyId,
    middlewares: &[PluginConfig],
) -> Result<(), StoreError> {
    for (priority, mw) in middlewares.iter().enumerate() {
        tx.execute(
            "INSERT INTO app_key_middlewares (app_key_id, middleware_id, config, priority)
             VALUES (?1, ?2, ?3, ?4)",
            rusqlite::params![key_id, mw.id, config_to_json(&mw.config)?, priority as i64],
        )?;
    }
    Ok(())
}

fn attach_middlewares(conn: &Connection, mut key: Key) -> Result<Key, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT middleware_id, config FROM app_key_middlewares
         WHERE app_key_id = ?1 ORDER BY priority ASC",
    )?;
    let rows = stmt.query_map(rusqlite::params![key.id], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
    })?;
    let mut middlewares = Vec::new();
    for row in rows {
        let (id, config) = row?;
        middlewares.push(PluginConfig {
            id,
            config: config_from_json(config.as_deref())?,
        });
    }
    key.configuration.middlewares = middlewares;
    Ok(key)
}

fn scan_key(row: &Row<'_>) -> rusqlite::Result<Key> {
    let expires_at: Option<i64> = row.get(4)?;
    let provider_config: Option<String> = row.get(10)?;
    let reset_period: i64 = row.get(12)?;
    Ok(Key {
        id: row.get(0)?,
        name: row.get(1)?,
        key_hash: row.get(2)?,
        prefix: row.get(3)?,
        expires_at: expires_at.map(from_unix_secs),
        auto_renew: row.get(5)?,
        budget_usage: row.get(6)?,
        last_reset_at: from_unix_secs(row.get(7)?),
        created_at: from_unix_secs(row.get(8)?),
        configuration: KeyConfiguration {
            provider: PluginConfig {
                id: row.get(9)?,
                // JSON decode failures surface later via attach; the scan
                // callback can only report sqlite errors.
                config: config_from_json(provider_config.as_deref()).unwrap_or_default(),
            },
            middlewares: Vec::new(),
            budget_limit: row.get(11)?,
            reset_period_secs: reset_period.max(0) as u64,
        },
    })
}

fn config_to_json(config: &ConfigMap) -> Result<Option<String>, StoreError> {
    if config.is_empty() {
        return Ok(None);
    }
    Ok(Some(serde_json::to_string(config)?))
}

fn config_from_json(raw: Option<&str>) -> Result<ConfigMap, StoreError> {
    match raw {
        Some(raw) if !raw.is_empty() => Ok(serde_json::from_str(raw)?),
        _ => Ok(ConfigMap::new()),
    }
}

fn to_unix_secs(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}

fn from_unix_secs(secs: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ConfigValue;

    fn sample_key() -> Key {
        Key {
            id: 0,
            name: "team alpha".to_string(),
            key_hash: "deadbeef".to_string(),
            prefix: "sa-12345".to_string(),
            expires_at: None,
            auto_renew: false,
            budget_usage: 0.0,
            last_reset_at: SystemTime::now(),
            created_at: SystemTime::now(),
            configuration: KeyConfiguration {
                provider: PluginConfig {
                    id: "openai".to_string(),
                    config: [("base_url".to_string(), ConfigValue::from("http://up"))]
                        .into_iter()
                        .collect(),
                },
                middlewares: vec![PluginConfig {
                    id: "rate_limit".to_string(),
                    config: [
                        ("limit".to_string(), ConfigValue::Number(5.0)),
                        ("period".to_string(), ConfigValue::Number(60.0)),
                    ]
                    .into_iter()
                    .collect(),
                }],
                budget_limit: 1.5,
                reset_period_secs: 3600,
            },
        }
    }

    #[tokio::test]
    async fn round_trips_keys_with_middlewares() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SqliteRepository::new(dir.path().join("keys.db"));
        repo.init().await.expect("init");

        let id = repo.save(&sample_key()).await.expect("save");
        let loaded = repo
            .get_by_hash("deadbeef")
            .await
            .expect("get")
            .expect("present");

        assert_eq!(loaded.id, id);
        assert_eq!(loaded.name, "team alpha");
        assert_eq!(loaded.configuration.budget_limit, 1.5);
        assert_eq!(loaded.configuration.middlewares.len(), 1);
        assert_eq!(loaded.configuration.middlewares[0].id, "rate_limit");
        assert_eq!(
            loaded.configuration.provider.config["base_url"].as_str(),
            Some("http://up")
        );
    }

    #[tokio::test]
    async fn guarded_reservation_stops_at_the_limit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SqliteRepository::new(dir.path().join("keys.db"));
        repo.init().await.expect("init");
        let id = repo.save(&sample_key()).await.expect("save");

        assert!(repo.reserve_usage(id, 1.0, 1.5).await.expect("reserve"));
        assert!(repo.reserve_usage(id, 0.5, 1.5).await.expect("reserve"));
        assert!(!repo.reserve_usage(id, 0.01, 1.5).await.expect("reserve"));

        let key = repo.get_by_id(id).await.expect("get").expect("present");
        assert!((key.budget_usage - 1.5).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_limit_reservations_always_admit() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SqliteRepository::new(dir.path().join("keys.db"));
        repo.init().await.expect("init");
        let id = repo.save(&sample_key()).await.expect("save");

        for _ in 0..10 {
            assert!(repo.reserve_usage(id, 5.0, 0.0).await.expect("reserve"));
        }
    }

    #[tokio::test]
    async fn delete_cascades_middleware_rows() {
        let dir = tempfile::tempdir().expect("tempdir");
        let repo = SqliteRepository::new(dir.path().join("keys.db"));
        repo.init().await.expect("init");
        let id = repo.save(&sample_key()).await.expect("save");
        repo.delete(id).await.expect("delete");

        assert!(repo.get_by_id(id).await.expect("get").is_none());
        assert!(repo.list().await.expect("list").is_empty());
    }
}
