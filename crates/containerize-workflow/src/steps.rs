//! Step bookkeeping for the ten-step pipeline (spec §4.7).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Running,
    Completed,
    Failed,
}

/// One row of the `steps` array in the tool's result shape (spec §6). The
/// `progress` field is rendered `"k/10"` once the step is known, matching
/// the wire shape literally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowStep {
    pub name: String,
    pub status: StepStatus,
    pub progress: String,
    pub message: String,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
    pub retries: u32,
    #[serde(skip)]
    started_at: Option<DateTime<Utc>>,
}

impl WorkflowStep {
    pub fn start(index: u32, name: impl Into<String>, message: impl Into<String>) -> Self {
        WorkflowStep {
            name: name.into(),
            status: StepStatus::Running,
            progress: format!("{index}/10"),
            message: message.into(),
            duration_ms: None,
            error: None,
            retries: 0,
            started_at: Some(Utc::now()),
        }
    }

    pub fn complete(mut self, message: impl Into<String>) -> Self {
        self.status = StepStatus::Completed;
        self.message = message.into();
        self.stamp_duration();
        self
    }

    pub fn fail(mut self, error: impl Into<String>, retries: u32) -> Self {
        self.status = StepStatus::Failed;
        let error = error.into();
        self.message = error.clone();
        self.error = Some(error);
        self.retries = retries;
        self.stamp_duration();
        self
    }

    fn stamp_duration(&mut self) {
        if let Some(started) = self.started_at {
            self.duration_ms = Some((Utc::now() - started).num_milliseconds().max(0) as u64);
        }
    }
}

/// The ten fixed step names, in order, with their `op_tag` and max AI-retry
/// count (spec §4.7's table; `max_attempts = retries + 1`).
pub const STEP_NAMES: [&str; 10] = [
    "analyze_repository",
    "generate_dockerfile",
    "build_image",
    "ensure_cluster",
    "load_image",
    "generate_manifests",
    "apply_manifests",
    "health_probe",
    "vulnerability_scan",
    "finalize",
];

pub const STEP_MAX_RETRIES: [u32; 10] = [2, 2, 2, 0, 1, 2, 2, 1, 3, 0];
