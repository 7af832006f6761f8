//! Session manager (C5). Owns the in-memory session map and mediates every
//! mutation; C4 is a slave store it keeps in sync with.
//!
//! Per-key serialization follows the design note in spec §9: rather than one
//! global write lock per update, locks are striped by session id via a
//! `DashMap<String, Arc<tokio::sync::Mutex<()>>>`, the same per-key lock
//! shape `kftray-portforward::kube::proxy_recovery` uses for its
//! `RECOVERY_LOCKS`.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration as StdDuration;

use chrono::{Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::gc::{remove_orphaned_workspaces, GcReport};
use crate::model::{Session, SessionFilter, SessionSummary};
use crate::store::{SessionStore, StoreError};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("session limit reached ({0} sessions)")]
    SessionLimitExceeded(usize),

    #[error("per-session disk quota exceeded for `{0}`")]
    SessionDiskQuotaExceeded(String),

    #[error("total disk limit exceeded")]
    TotalDiskLimitExceeded,

    #[error("session `{0}` not found")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    pub workspace_base: PathBuf,
    pub max_sessions: usize,
    pub ttl: ChronoDuration,
    pub max_disk_usage_per_session: u64,
    pub total_disk_limit: u64,
    pub cleanup_interval: StdDuration,
}

impl Default for SessionManagerConfig {
    fn default() -> Self {
        SessionManagerConfig {
            workspace_base: PathBuf::from("/tmp/containerize-assist/sessions"),
            max_sessions: 100,
            ttl: ChronoDuration::hours(24),
            max_disk_usage_per_session: 1024 * 1024 * 1024,
            total_disk_limit: 20 * 1024 * 1024 * 1024,
            cleanup_interval: StdDuration::from_secs(3600),
        }
    }
}

fn generate_session_id() -> String {
    let bytes: [u8; 16] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

pub struct SessionManager {
    config: SessionManagerConfig,
    sessions: RwLock<HashMap<String, Session>>,
    store: Arc<dyn SessionStore>,
    update_locks: DashMap<String, Arc<AsyncMutex<()>>>,
    cleanup_handle: AsyncMutex<Option<JoinHandle<()>>>,
    cleanup_cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(config: SessionManagerConfig, store: Arc<dyn SessionStore>) -> Self {
        SessionManager {
            config,
            sessions: RwLock::new(HashMap::new()),
            store,
            update_locks: DashMap::new(),
            cleanup_handle: AsyncMutex::new(None),
            cleanup_cancel: CancellationToken::new(),
        }
    }

    /// Load every session the store already knows about into memory. Called
    /// once at startup, before serving any request.
    pub async fn hydrate(&self) -> Result<u64, ManagerError> {
        let ids = self.store.list().await?;
        let mut loaded = 0u64;
        let now = Utc::now();
        for id in ids {
            if let Some(session) = self.store.load(&id).await? {
                if !session.is_expired(now) {
                    self.sessions.write().expect("session map lock poisoned").insert(id, session);
                    loaded += 1;
                }
            }
        }
        Ok(loaded)
    }

    fn lock_for(&self, id: &str) -> Arc<AsyncMutex<()>> {
        self.update_locks.entry(id.to_string()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// `get_or_create(id)`. Empty `id` always mints a fresh 128-bit random
    /// session id; a nonempty `id` is looked up in memory, then the store,
    /// before falling through to creation under that exact id.
    pub async fn get_or_create(&self, id: &str) -> Result<Session, ManagerError> {
        if !id.is_empty() {
            let in_memory = self.sessions.read().expect("session map lock poisoned").contains_key(id);
            if in_memory {
                return self.update(id, |_| {}).await;
            }
            if let Some(mut session) = self.store.load(id).await? {
                if !session.is_expired(Utc::now()) {
                    session.touch();
                    self.sessions.write().expect("session map lock poisoned").insert(id.to_string(), session.clone());
                    self.store.save(id, &session).await?;
                    return Ok(session);
                }
            }
        }

        let new_id = if id.is_empty() { generate_session_id() } else { id.to_string() };

        {
            let sessions = self.sessions.read().expect("session map lock poisoned");
            if sessions.len() >= self.config.max_sessions {
                return Err(ManagerError::SessionLimitExceeded(self.config.max_sessions));
            }
            let total_disk: u64 = sessions.values().map(|s| s.disk_usage).sum();
            if total_disk >= self.config.total_disk_limit {
                return Err(ManagerError::TotalDiskLimitExceeded);
            }
        }

        let workspace_dir = self.config.workspace_base.join(&new_id);
        tokio::fs::create_dir_all(&workspace_dir).await.map_err(|e| ManagerError::Other(e.into()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            tokio::fs::set_permissions(&workspace_dir, std::fs::Permissions::from_mode(0o750))
                .await
                .map_err(|e| ManagerError::Other(e.into()))?;
        }

        let session = Session::new(new_id.clone(), workspace_dir, self.config.ttl, self.config.max_disk_usage_per_session);
        self.store.save(&new_id, &session).await?;
        self.sessions.write().expect("session map lock poisoned").insert(new_id, session.clone());
        Ok(session)
    }

    /// `get(id)`. Read-only; never creates, never touches `last_accessed`.
    pub fn get(&self, id: &str) -> Option<Session> {
        self.sessions.read().expect("session map lock poisoned").get(id).cloned()
    }

    /// `update(id, mutator)`. Serialized per id by `update_locks`; all
    /// mutation of a live [`Session`] must flow through here.
    pub async fn update<F>(&self, id: &str, mutator: F) -> Result<Session, ManagerError>
    where
        F: FnOnce(&mut Session),
    {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut session = self
            .sessions
            .read()
            .expect("session map lock poisoned")
            .get(id)
            .cloned()
            .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;

        mutator(&mut session);
        session.touch();

        self.store.save(id, &session).await?;
        self.sessions.write().expect("session map lock poisoned").insert(id.to_string(), session.clone());

        Ok(session)
    }

    /// `delete(id)`. Workspace removal is best-effort and logged on failure;
    /// the in-memory map and the store are always removed.
    pub async fn delete(&self, id: &str) -> Result<(), ManagerError> {
        let workspace = self.sessions.read().expect("session map lock poisoned").get(id).map(|s| s.workspace_dir.clone());
        if let Some(dir) = workspace {
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(session_id = id, error = %e, "failed to remove session workspace directory");
                }
            }
        }
        self.sessions.write().expect("session map lock poisoned").remove(id);
        self.store.delete(id).await?;
        self.update_locks.remove(id);
        Ok(())
    }

    /// `list_summaries(filter)`. Stable by `created_at` ascending as the
    /// insertion-time proxy the design notes call for.
    pub fn list_summaries(&self, filter: &SessionFilter) -> Vec<SessionSummary> {
        let now = Utc::now();
        let sessions = self.sessions.read().expect("session map lock poisoned");
        let mut summaries: Vec<SessionSummary> = sessions
            .values()
            .filter(|session| filter.matches(session, now))
            .map(SessionSummary::from)
            .collect();
        summaries.sort_by_key(|s| s.created_at);
        summaries
    }

    pub async fn add_label(&self, id: &str, label: &str) -> Result<Session, ManagerError> {
        let label = label.to_string();
        self.update(id, move |s| {
            s.labels.insert(label);
        })
        .await
    }

    pub async fn remove_label(&self, id: &str, label: &str) -> Result<Session, ManagerError> {
        let label = label.to_string();
        self.update(id, move |s| {
            s.labels.remove(&label);
        })
        .await
    }

    pub async fn set_labels(&self, id: &str, labels: HashSet<String>) -> Result<Session, ManagerError> {
        self.update(id, move |s| {
            s.labels = labels;
        })
        .await
    }

    pub fn all_labels(&self) -> HashSet<String> {
        self.sessions
            .read()
            .expect("session map lock poisoned")
            .values()
            .flat_map(|s| s.labels.iter().cloned())
            .collect()
    }

    pub async fn set_k8s_label(&self, id: &str, key: &str, value: &str) -> Result<Session, ManagerError> {
        let (key, value) = (key.to_string(), value.to_string());
        self.update(id, move |s| {
            s.k8s_labels.insert(key, value);
        })
        .await
    }

    pub async fn remove_k8s_label(&self, id: &str, key: &str) -> Result<Session, ManagerError> {
        let key = key.to_string();
        self.update(id, move |s| {
            s.k8s_labels.remove(&key);
        })
        .await
    }

    /// `check_disk_quota(id, additional_bytes)`. Advisory: callers must
    /// consult before allocating, but overshoot itself is only detected on
    /// the next resource-monitor snapshot.
    pub fn check_disk_quota(&self, id: &str, additional_bytes: u64) -> Result<(), ManagerError> {
        let sessions = self.sessions.read().expect("session map lock poisoned");
        let session = sessions.get(id).ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
        if session.disk_usage + additional_bytes > session.max_disk_usage {
            return Err(ManagerError::SessionDiskQuotaExceeded(id.to_string()));
        }
        let total: u64 = sessions.values().map(|s| s.disk_usage).sum();
        if total + additional_bytes > self.config.total_disk_limit {
            return Err(ManagerError::TotalDiskLimitExceeded);
        }
        Ok(())
    }

    /// `garbage_collect()`. Expired sessions are deleted through the normal
    /// `delete` path; orphaned workspace directories (no corresponding live
    /// session) are then swept from the workspace base directory.
    pub async fn garbage_collect(&self) -> Result<GcReport, ManagerError> {
        let now = Utc::now();
        let expired_ids: Vec<String> = self
            .sessions
            .read()
            .expect("session map lock poisoned")
            .values()
            .filter(|s| s.is_expired(now))
            .map(|s| s.session_id.clone())
            .collect();

        for id in &expired_ids {
            self.delete(id).await?;
        }

        let live_ids: HashSet<String> = self.sessions.read().expect("session map lock poisoned").keys().cloned().collect();
        let orphans_removed = remove_orphaned_workspaces(&self.config.workspace_base, &live_ids).await;

        let report = GcReport {
            expired_removed: expired_ids.len() as u64,
            orphans_removed,
        };
        if report.expired_removed > 0 || report.orphans_removed > 0 {
            info!(expired = report.expired_removed, orphans = report.orphans_removed, "garbage collection pass complete");
        }
        Ok(report)
    }

    /// Starts the background cleanup ticker (default period one hour, per
    /// `config.cleanup_interval`). Idempotent: calling twice replaces the
    /// previous ticker rather than running two.
    pub fn start_cleanup(self: &Arc<Self>) {
        let manager = self.clone();
        let cancel = self.cleanup_cancel.clone();
        let interval = self.config.cleanup_interval;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = manager.garbage_collect().await {
                            warn!(error = %e, "scheduled garbage collection failed");
                        }
                    }
                    _ = cancel.cancelled() => break,
                }
            }
        });
        if let Ok(mut guard) = self.cleanup_handle.try_lock() {
            *guard = Some(handle);
        }
    }

    /// `stop()`. Idempotent: halts the cleanup ticker, runs one final
    /// `garbage_collect`, then closes the store.
    pub async fn stop(&self) -> Result<(), ManagerError> {
        self.cleanup_cancel.cancel();
        if let Some(handle) = self.cleanup_handle.lock().await.take() {
            let _ = handle.await;
        }
        self.garbage_collect().await?;
        self.store.close().await?;
        Ok(())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.read().expect("session map lock poisoned").len()
    }

    pub fn total_disk_usage(&self) -> u64 {
        self.sessions.read().expect("session map lock poisoned").values().map(|s| s.disk_usage).sum()
    }

    pub fn max_sessions(&self) -> usize {
        self.config.max_sessions
    }

    pub fn total_disk_limit(&self) -> u64 {
        self.config.total_disk_limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager_with(max_sessions: usize) -> Arc<SessionManager> {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionManagerConfig {
            workspace_base: dir.keep(),
            max_sessions,
            ..SessionManagerConfig::default()
        };
        Arc::new(SessionManager::new(config, Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn get_or_create_with_empty_id_mints_a_fresh_session() {
        let manager = manager_with(10);
        let session = manager.get_or_create("").await.unwrap();
        assert_eq!(session.session_id.len(), 32);
        assert!(session.created_at <= session.last_accessed);
        assert!(session.created_at <= session.expires_at);
    }

    #[tokio::test]
    async fn get_or_create_with_known_id_touches_last_accessed() {
        let manager = manager_with(10);
        let session = manager.get_or_create("").await.unwrap();
        tokio::time::sleep(StdDuration::from_millis(5)).await;
        let again = manager.get_or_create(&session.session_id).await.unwrap();
        assert_eq!(again.session_id, session.session_id);
        assert!(again.last_accessed >= session.last_accessed);
    }

    #[tokio::test]
    async fn session_limit_is_enforced() {
        let manager = manager_with(2);
        manager.get_or_create("").await.unwrap();
        manager.get_or_create("").await.unwrap();
        let result = manager.get_or_create("").await;
        assert!(matches!(result, Err(ManagerError::SessionLimitExceeded(2))));
    }

    #[tokio::test]
    async fn update_is_serialized_and_both_mutations_land() {
        let manager = manager_with(10);
        let session = manager.get_or_create("").await.unwrap();
        let id = session.session_id.clone();

        let m1 = manager.clone();
        let id1 = id.clone();
        let t1 = tokio::spawn(async move {
            m1.update(&id1, |s| s.metadata.insert("a".to_string(), serde_json::json!(1))).await
        });
        let m2 = manager.clone();
        let id2 = id.clone();
        let t2 = tokio::spawn(async move {
            m2.update(&id2, |s| s.metadata.insert("b".to_string(), serde_json::json!(2))).await
        });

        t1.await.unwrap().unwrap();
        t2.await.unwrap().unwrap();

        let final_session = manager.get(&id).unwrap();
        assert_eq!(final_session.metadata.get("a"), Some(&serde_json::json!(1)));
        assert_eq!(final_session.metadata.get("b"), Some(&serde_json::json!(2)));
    }

    #[tokio::test]
    async fn expired_session_is_absent_from_active_listing_and_removed_by_gc() {
        let manager = manager_with(10);
        let session = manager.get_or_create("").await.unwrap();
        manager.update(&session.session_id, |s| s.expires_at = Utc::now() - ChronoDuration::seconds(1)).await.unwrap();

        let active = manager.list_summaries(&SessionFilter {
            status: Some(crate::model::SessionStatus::Active),
            ..Default::default()
        });
        assert!(active.is_empty());

        let report = manager.garbage_collect().await.unwrap();
        assert_eq!(report.expired_removed, 1);
        assert!(manager.get(&session.session_id).is_none());
    }

    #[tokio::test]
    async fn disk_quota_rejects_per_session_overshoot() {
        let manager = manager_with(10);
        let session = manager.get_or_create("").await.unwrap();
        manager.update(&session.session_id, |s| s.max_disk_usage = 100).await.unwrap();
        let result = manager.check_disk_quota(&session.session_id, 200);
        assert!(matches!(result, Err(ManagerError::SessionDiskQuotaExceeded(_))));
    }
}
