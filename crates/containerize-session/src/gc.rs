//! Garbage collection bookkeeping for the session manager (C5).

use std::collections::HashSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

/// Outcome of one `garbage_collect` pass.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct GcReport {
    pub expired_removed: u64,
    pub orphans_removed: u64,
}

/// Remove any entry under `workspace_base` whose name is not a live session
/// id. Best-effort: a directory that fails to remove is skipped, not fatal
/// to the rest of the sweep.
pub async fn remove_orphaned_workspaces(workspace_base: &Path, live_ids: &HashSet<String>) -> u64 {
    let mut removed = 0u64;
    let mut entries = match tokio::fs::read_dir(workspace_base).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = match entry.file_name().into_string() {
            Ok(name) => name,
            Err(_) => continue,
        };
        if live_ids.contains(&name) {
            continue;
        }
        if tokio::fs::remove_dir_all(entry.path()).await.is_ok() {
            removed += 1;
        }
    }
    removed
}
