//! Session data model (spec §3.1).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of an async job tracked under a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    pub pct: f64,
    pub message: String,
    pub step: u32,
    pub total: u32,
}

/// An async job owned by a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInfo {
    pub id: String,
    pub tool: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub progress: Option<JobProgress>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl JobInfo {
    pub fn new(id: impl Into<String>, tool: impl Into<String>) -> Self {
        JobInfo {
            id: id.into(),
            tool: tool.into(),
            status: JobStatus::Pending,
            started_at: Utc::now(),
            progress: None,
            result: None,
            error: None,
        }
    }
}

/// Immutable log record of one step attempt, appended under C5's write lock
/// — never mutated after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolExecution {
    pub tool_name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub success: bool,
    pub error: Option<String>,
    pub dry_run: bool,
    pub tokens_consumed: u64,
}

impl ToolExecution {
    pub fn start(tool_name: impl Into<String>, dry_run: bool) -> Self {
        ToolExecution {
            tool_name: tool_name.into(),
            started_at: Utc::now(),
            ended_at: None,
            duration_ms: None,
            success: false,
            error: None,
            dry_run,
            tokens_consumed: 0,
        }
    }

    pub fn finish(mut self, success: bool, error: Option<String>, tokens_consumed: u64) -> Self {
        let ended_at = Utc::now();
        self.duration_ms = Some((ended_at - self.started_at).num_milliseconds().max(0) as u64);
        self.ended_at = Some(ended_at);
        self.success = success;
        self.error = error;
        self.tokens_consumed = tokens_consumed;
        self
    }
}

/// The unit of work for one client task (spec §3.1). Every field the spec
/// names as optional is `Option`; the fixed-point invariants
/// (`created_at <= last_accessed`, `created_at <= expires_at`,
/// `disk_usage <= max_disk_usage` unless `quota_exceeded`) are enforced by
/// [`crate::manager::SessionManager::update`], not by this type itself —
/// a plain data record has no way to refuse its own construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub session_id: String,
    pub workspace_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,

    pub stage_history: Vec<ToolExecution>,

    pub image_ref: Option<String>,
    pub dockerfile: Option<String>,
    pub manifests: Option<Vec<String>>,
    pub scan_summary: Option<serde_json::Value>,

    pub active_jobs: HashMap<String, JobInfo>,
    pub last_error: Option<String>,

    pub disk_usage: u64,
    pub max_disk_usage: u64,
    pub quota_exceeded: bool,

    pub labels: HashSet<String>,
    pub k8s_labels: HashMap<String, String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl Session {
    pub fn new(session_id: impl Into<String>, workspace_dir: PathBuf, ttl: chrono::Duration, max_disk_usage: u64) -> Self {
        let now = Utc::now();
        Session {
            session_id: session_id.into(),
            workspace_dir,
            created_at: now,
            last_accessed: now,
            expires_at: now + ttl,
            stage_history: Vec::new(),
            image_ref: None,
            dockerfile: None,
            manifests: None,
            scan_summary: None,
            active_jobs: HashMap::new(),
            last_error: None,
            disk_usage: 0,
            max_disk_usage,
            quota_exceeded: false,
            labels: HashSet::new(),
            k8s_labels: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at < now
    }

    pub fn touch(&mut self) {
        self.last_accessed = Utc::now();
    }
}

/// Lightweight, filterable view returned by `list_summaries` — never the
/// full [`Session`], so callers cannot bypass the manager to mutate state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub disk_usage: u64,
    pub quota_exceeded: bool,
    pub labels: HashSet<String>,
    pub image_ref: Option<String>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        SessionSummary {
            session_id: session.session_id.clone(),
            created_at: session.created_at,
            last_accessed: session.last_accessed,
            expires_at: session.expires_at,
            disk_usage: session.disk_usage,
            quota_exceeded: session.quota_exceeded,
            labels: session.labels.clone(),
            image_ref: session.image_ref.clone(),
        }
    }
}

/// Status filter accepted by `list_summaries`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Expired,
    QuotaExceeded,
}

/// Filter set accepted by `list_summaries` (spec §4.5).
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub labels: Vec<String>,
    pub any_label: Vec<String>,
    pub status: Option<SessionStatus>,
    pub repo_url: Option<String>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

impl SessionFilter {
    pub fn matches(&self, session: &Session, now: DateTime<Utc>) -> bool {
        if !self.labels.is_empty() && !self.labels.iter().all(|l| session.labels.contains(l)) {
            return false;
        }
        if !self.any_label.is_empty() && !self.any_label.iter().any(|l| session.labels.contains(l)) {
            return false;
        }
        if let Some(status) = self.status {
            let matches_status = match status {
                SessionStatus::Active => !session.is_expired(now) && !session.quota_exceeded,
                SessionStatus::Expired => session.is_expired(now),
                SessionStatus::QuotaExceeded => session.quota_exceeded,
            };
            if !matches_status {
                return false;
            }
        }
        if let Some(repo_url) = &self.repo_url {
            let recorded = session.metadata.get("repo_url").and_then(|v| v.as_str());
            if recorded != Some(repo_url.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.created_after {
            if session.created_at < after {
                return false;
            }
        }
        if let Some(before) = self.created_before {
            if session.created_at > before {
                return false;
            }
        }
        true
    }
}
