//! Session store (C4): a durable key→state map. Grounded in
//! `kftray-commons::utils::db`'s `SqlitePool` + `CREATE TABLE IF NOT EXISTS`
//! pattern for the embedded variant, and kept deliberately dumb — the
//! contract is everything; C5 is the only caller and mediates concurrency.

use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use thiserror::Error;

use crate::model::Session;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session `{0}` not found")]
    NotFound(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] sqlx::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Contract every store variant must satisfy. Reads/writes are atomic for a
/// single key; `save` is last-writer-wins. The serialized form must be a
/// superset of [`Session`] — unknown fields are ignored on read, so an
/// older deployment can read a newer store's rows (JSON already gives us
/// this for free; see [`SqliteStore::load`]).
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError>;
    async fn save(&self, id: &str, session: &Session) -> Result<(), StoreError>;
    async fn delete(&self, id: &str) -> Result<(), StoreError>;
    async fn list(&self) -> Result<Vec<String>, StoreError>;
    async fn close(&self) -> Result<(), StoreError>;

    /// Remove sessions whose `expires_at` is before `now`, returning how
    /// many were removed. A default no-op so stores that rely on C5's own
    /// `garbage_collect` instead of a native TTL sweep need not implement it.
    async fn cleanup_expired(&self, _now: chrono::DateTime<chrono::Utc>) -> Result<u64, StoreError> {
        Ok(0)
    }
}

/// In-memory store, for tests and for a `--no-persistence` mode.
#[derive(Default)]
pub struct MemoryStore {
    sessions: RwLock<HashMap<String, Session>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.sessions.read().expect("memory store lock poisoned").get(id).cloned())
    }

    async fn save(&self, id: &str, session: &Session) -> Result<(), StoreError> {
        self.sessions
            .write()
            .expect("memory store lock poisoned")
            .insert(id.to_string(), session.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.sessions.write().expect("memory store lock poisoned").remove(id);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.sessions.read().expect("memory store lock poisoned").keys().cloned().collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn cleanup_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Result<u64, StoreError> {
        let mut sessions = self.sessions.write().expect("memory store lock poisoned");
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, session)| session.is_expired(now))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &expired {
            sessions.remove(id);
        }
        Ok(expired.len() as u64)
    }
}

/// Embedded single-file KV store (spec §6: one logical bucket "sessions",
/// key = session id, value = serialized Session JSON, file mode 0o600).
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| StoreError::Other(e.into()))?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let _ = tokio::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o755)).await;
            }
        }

        let options = SqliteConnectOptions::new().filename(path).create_if_missing(true);
        let pool = SqlitePoolOptions::new().max_connections(5).connect_with(options).await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                data TEXT NOT NULL,
                expires_at TEXT NOT NULL
            )",
        )
        .execute(&pool)
        .await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await;
        }

        Ok(SqliteStore { pool })
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn load(&self, id: &str) -> Result<Option<Session>, StoreError> {
        let row: Option<(String,)> = sqlx::query_as("SELECT data FROM sessions WHERE session_id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some((data,)) => Ok(Some(serde_json::from_str(&data)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, id: &str, session: &Session) -> Result<(), StoreError> {
        let data = serde_json::to_string(session)?;
        sqlx::query(
            "INSERT INTO sessions (session_id, data, expires_at) VALUES (?, ?, ?)
             ON CONFLICT(session_id) DO UPDATE SET data = excluded.data, expires_at = excluded.expires_at",
        )
        .bind(id)
        .bind(data)
        .bind(session.expires_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE session_id = ?").bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<String>, StoreError> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT session_id FROM sessions").fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }

    async fn close(&self) -> Result<(), StoreError> {
        self.pool.close().await;
        Ok(())
    }

    async fn cleanup_expired(&self, now: chrono::DateTime<chrono::Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at < ?")
            .bind(now.to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn sample_session(id: &str) -> Session {
        Session::new(id, PathBuf::from(format!("/tmp/{id}")), chrono::Duration::hours(1), 1024)
    }

    #[tokio::test]
    async fn memory_store_round_trips() {
        let store = MemoryStore::new();
        let session = sample_session("abc");
        store.save("abc", &session).await.unwrap();
        let loaded = store.load("abc").await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "abc");
        assert_eq!(store.list().await.unwrap(), vec!["abc".to_string()]);
        store.delete("abc").await.unwrap();
        assert!(store.load("abc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn sqlite_store_round_trips_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.db");
        let store = SqliteStore::open(&path).await.unwrap();

        let session = sample_session("xyz");
        store.save("xyz", &session).await.unwrap();
        let loaded = store.load("xyz").await.unwrap().unwrap();
        assert_eq!(loaded.session_id, "xyz");

        // last-writer-wins: saving again with a mutated field overwrites.
        let mut updated = loaded;
        updated.disk_usage = 512;
        store.save("xyz", &updated).await.unwrap();
        let reloaded = store.load("xyz").await.unwrap().unwrap();
        assert_eq!(reloaded.disk_usage, 512);

        store.delete("xyz").await.unwrap();
        assert!(store.load("xyz").await.unwrap().is_none());
        store.close().await.unwrap();
    }

    #[tokio::test]
    async fn sqlite_store_cleanup_expired_removes_only_past_sessions() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("sessions.db")).await.unwrap();

        let mut expired = sample_session("expired");
        expired.expires_at = chrono::Utc::now() - chrono::Duration::hours(1);
        store.save("expired", &expired).await.unwrap();

        let live = sample_session("live");
        store.save("live", &live).await.unwrap();

        let removed = store.cleanup_expired(chrono::Utc::now()).await.unwrap();
        assert_eq!(removed, 1);
        assert!(store.load("expired").await.unwrap().is_none());
        assert!(store.load("live").await.unwrap().is_some());
    }
}
