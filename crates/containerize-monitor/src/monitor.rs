//! Resource monitor (C6). Owns its own sampling and cleanup tasks, each
//! cancellable independently, following the two-ticker shape spec §4.6
//! describes and the `tokio::select!`-driven cancellable loop
//! `kftray-portforward::kube::proxy_recovery::run_recovery_loop` uses.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration as StdDuration;

use chrono::Utc;
use containerize_session::{SessionFilter, SessionManager};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::rules::{find_cleanup_candidates, shipped_default_rules, ActionKind, CleanupEvent, CleanupRule, ConditionValues};
use crate::snapshot::{resource_score, CurrentResourceUsage, RingBuffer, ResourceSnapshot, SessionDetail};
use crate::thresholds::{ActiveAlert, AlertEvaluator};

/// `15 minutes` with no access marks a session idle, for the total/active/idle
/// counts the snapshot carries. Spec §4.6 names the counts but not the cutoff;
/// this is this crate's documented choice, not a value read from spec text.
const IDLE_CUTOFF_HOURS: f64 = 0.25;

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub monitoring_interval: StdDuration,
    pub cleanup_interval: StdDuration,
    pub max_snapshots: usize,
    pub max_memory_usage_bytes: u64,
    pub max_cleanup_history: usize,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            monitoring_interval: StdDuration::from_secs(30),
            cleanup_interval: StdDuration::from_secs(5 * 60),
            max_snapshots: 100,
            max_memory_usage_bytes: 2 * 1024 * 1024 * 1024,
            max_cleanup_history: 200,
        }
    }
}

#[cfg(unix)]
fn count_open_file_descriptors() -> u64 {
    std::fs::read_dir("/proc/self/fd").map(|entries| entries.count() as u64).unwrap_or(0)
}

#[cfg(not(unix))]
fn count_open_file_descriptors() -> u64 {
    0
}

pub struct ResourceMonitor {
    config: MonitorConfig,
    session_manager: Arc<SessionManager>,
    snapshots: Mutex<RingBuffer<ResourceSnapshot>>,
    current_usage: RwLock<CurrentResourceUsage>,
    alert_evaluator: Mutex<AlertEvaluator>,
    alert_callback: Box<dyn Fn(&ActiveAlert) + Send + Sync>,
    cleanup_rules: RwLock<Vec<CleanupRule>>,
    cleanup_history: Mutex<RingBuffer<CleanupEvent>>,
    system: Mutex<System>,
    sampling_cancel: CancellationToken,
    cleanup_cancel: CancellationToken,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(config: MonitorConfig, session_manager: Arc<SessionManager>, alert_callback: Box<dyn Fn(&ActiveAlert) + Send + Sync>) -> Arc<Self> {
        Arc::new(ResourceMonitor {
            snapshots: Mutex::new(RingBuffer::new(config.max_snapshots)),
            current_usage: RwLock::new(CurrentResourceUsage::from_pressures(0.0, 0.0, 0.0)),
            alert_evaluator: Mutex::new(AlertEvaluator::with_defaults()),
            alert_callback,
            cleanup_rules: RwLock::new(shipped_default_rules()),
            cleanup_history: Mutex::new(RingBuffer::new(config.max_cleanup_history)),
            system: Mutex::new(System::new_all()),
            sampling_cancel: CancellationToken::new(),
            cleanup_cancel: CancellationToken::new(),
            handles: Mutex::new(Vec::new()),
            config,
            session_manager,
        })
    }

    pub fn current_usage(&self) -> CurrentResourceUsage {
        self.current_usage.read().expect("current usage lock poisoned").clone()
    }

    pub fn latest_snapshot(&self) -> Option<ResourceSnapshot> {
        self.snapshots.lock().expect("snapshot buffer lock poisoned").last().cloned()
    }

    pub fn active_alerts(&self) -> Vec<ActiveAlert> {
        self.alert_evaluator.lock().expect("alert evaluator lock poisoned").active_alerts()
    }

    pub fn acknowledge_alert(&self, alert_id: &str) -> bool {
        self.alert_evaluator.lock().expect("alert evaluator lock poisoned").acknowledge(alert_id)
    }

    pub fn cleanup_history(&self) -> Vec<CleanupEvent> {
        self.cleanup_history.lock().expect("cleanup history lock poisoned").iter().cloned().collect()
    }

    /// Spawns the sampling task (`monitoring_interval`) and the cleanup task
    /// (`cleanup_interval`). Both stop on `stop()`.
    pub fn start(self: &Arc<Self>) {
        let sampling_monitor = self.clone();
        let sampling_cancel = self.sampling_cancel.clone();
        let sampling_interval = self.config.monitoring_interval;
        let sampling_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(sampling_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sampling_monitor.sample_once().await,
                    _ = sampling_cancel.cancelled() => break,
                }
            }
        });

        let cleanup_monitor = self.clone();
        let cleanup_cancel = self.cleanup_cancel.clone();
        let cleanup_interval = self.config.cleanup_interval;
        let cleanup_handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = cleanup_monitor.run_cleanup_rules().await {
                            warn!(error = %e, "cleanup rule pass failed");
                        }
                    }
                    _ = cleanup_cancel.cancelled() => break,
                }
            }
        });

        let mut handles = self.handles.lock().expect("handles lock poisoned");
        handles.push(sampling_handle);
        handles.push(cleanup_handle);
    }

    pub async fn stop(&self) {
        self.sampling_cancel.cancel();
        self.cleanup_cancel.cancel();
        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().expect("handles lock poisoned");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// One sampling tick: walk C5's sessions read-only, compute per-session
    /// age/idle/score, append a snapshot, refresh `CurrentResourceUsage`,
    /// and evaluate alert thresholds.
    pub async fn sample_once(&self) {
        let now = Utc::now();
        let summaries = self.session_manager.list_summaries(&SessionFilter::default());

        let mut active = 0u64;
        let mut idle = 0u64;
        let session_details: Vec<SessionDetail> = summaries
            .iter()
            .map(|s| {
                let age_hours = (now - s.created_at).num_seconds() as f64 / 3600.0;
                let idle_hours = (now - s.last_accessed).num_seconds() as f64 / 3600.0;
                if idle_hours > IDLE_CUTOFF_HOURS {
                    idle += 1;
                } else {
                    active += 1;
                }
                let disk_mb = s.disk_usage as f64 / (1024.0 * 1024.0);
                SessionDetail {
                    session_id: s.session_id.clone(),
                    age_hours,
                    idle_hours,
                    score: resource_score(disk_mb, age_hours),
                }
            })
            .collect();

        let used_memory_bytes = {
            let mut system = self.system.lock().expect("system lock poisoned");
            system.refresh_memory();
            system.used_memory()
        };

        let memory_pressure = (used_memory_bytes as f64 / self.config.max_memory_usage_bytes as f64 * 100.0).min(100.0);
        let total_disk_usage = self.session_manager.total_disk_usage();
        let disk_pressure = (total_disk_usage as f64 / self.session_manager.total_disk_limit() as f64 * 100.0).min(100.0);
        let session_pressure = (summaries.len() as f64 / self.session_manager.max_sessions() as f64 * 100.0).min(100.0);

        let snapshot = ResourceSnapshot {
            taken_at: now,
            total_sessions: summaries.len() as u64,
            active_sessions: active,
            idle_sessions: idle,
            memory_pressure,
            disk_pressure,
            session_details,
            file_handle_count: count_open_file_descriptors(),
            task_count: summaries.len() as u64,
        };
        self.snapshots.lock().expect("snapshot buffer lock poisoned").push(snapshot);

        let usage = CurrentResourceUsage::from_pressures(memory_pressure, disk_pressure, session_pressure);
        *self.current_usage.write().expect("current usage lock poisoned") = usage.clone();

        let mut values = HashMap::new();
        values.insert("memory_pressure".to_string(), memory_pressure);
        values.insert("disk_pressure".to_string(), disk_pressure);
        values.insert("session_count".to_string(), session_pressure);

        let created = self.alert_evaluator.lock().expect("alert evaluator lock poisoned").evaluate(&values, now);
        for alert in &created {
            (self.alert_callback)(alert);
        }
    }

    /// One cleanup tick: evaluate every enabled, eligible rule in descending
    /// priority order; run its actions if all conditions hold.
    pub async fn run_cleanup_rules(&self) -> anyhow::Result<()> {
        let now = Utc::now();
        let usage = self.current_usage();
        let latest_snapshot = self.latest_snapshot();
        let max_age_hours_observed = latest_snapshot
            .as_ref()
            .and_then(|s| s.session_details.iter().map(|d| d.age_hours).fold(None, |acc: Option<f64>, x| Some(acc.map_or(x, |a| a.max(x)))))
            .unwrap_or(0.0);

        let values = ConditionValues {
            memory_pressure: usage.memory_pressure,
            disk_pressure: usage.disk_pressure,
            session_count: usage.session_pressure,
            max_age_hours_observed,
            idle_hours_observed: 0.0,
        };

        let mut rules = { self.cleanup_rules.read().expect("cleanup rules lock poisoned").clone() };
        rules.sort_by_key(|r| std::cmp::Reverse(r.priority));

        for rule in &mut rules {
            if !rule.is_eligible(now) || !rule.conditions_hold(&values) {
                continue;
            }

            let mut sessions_removed = 0u64;
            let mut bytes_freed = 0u64;

            for action in &rule.actions {
                match action.kind {
                    ActionKind::Terminate => {
                        let session_details = latest_snapshot.as_ref().map(|s| s.session_details.clone()).unwrap_or_default();
                        let candidates = find_cleanup_candidates(&session_details, action);
                        for id in candidates {
                            if let Some(session) = self.session_manager.get(&id) {
                                bytes_freed += session.disk_usage;
                            }
                            if self.session_manager.delete(&id).await.is_ok() {
                                sessions_removed += 1;
                            }
                        }
                    }
                    ActionKind::Archive | ActionKind::Alert => {
                        info!(rule = %rule.name, action = ?action.kind, "cleanup action placeholder executed");
                    }
                }
            }

            rule.execution_count += 1;
            rule.last_executed = Some(now);

            self.cleanup_history.lock().expect("cleanup history lock poisoned").push(CleanupEvent {
                rule_name: rule.name.clone(),
                executed_at: now,
                sessions_removed,
                bytes_freed,
            });
        }

        *self.cleanup_rules.write().expect("cleanup rules lock poisoned") = rules;
        Ok(())
    }

    pub fn set_cleanup_rules(&self, rules: Vec<CleanupRule>) {
        *self.cleanup_rules.write().expect("cleanup rules lock poisoned") = rules;
    }
}

/// A no-op alert callback, for configurations that don't wire an external
/// notifier (e.g. tests, or a deployment with no alert sink).
pub fn silent_alert_callback() -> Box<dyn Fn(&ActiveAlert) + Send + Sync> {
    Box::new(|_alert| {})
}

#[cfg(test)]
mod tests {
    use super::*;
    use containerize_session::{MemoryStore, SessionManagerConfig};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager(max_sessions: usize) -> Arc<SessionManager> {
        let dir = tempfile::tempdir().unwrap();
        let config = SessionManagerConfig {
            workspace_base: dir.keep(),
            max_sessions,
            ..SessionManagerConfig::default()
        };
        Arc::new(SessionManager::new(config, Arc::new(MemoryStore::new())))
    }

    #[tokio::test]
    async fn sampling_one_session_against_max_one_yields_full_session_pressure() {
        let session_manager = manager(1);
        session_manager.get_or_create("").await.unwrap();

        let monitor = ResourceMonitor::new(MonitorConfig::default(), session_manager, silent_alert_callback());
        monitor.sample_once().await;

        let usage = monitor.current_usage();
        assert!(usage.session_pressure >= 100.0);
        assert_eq!(usage.health_status, crate::snapshot::HealthStatus::Critical);
    }

    #[tokio::test]
    async fn critical_alert_fires_exactly_once_until_pressure_drops() {
        let session_manager = manager(1);
        session_manager.get_or_create("").await.unwrap();
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();

        let monitor = ResourceMonitor::new(
            MonitorConfig::default(),
            session_manager,
            Box::new(move |_alert| {
                fired_clone.fetch_add(1, Ordering::SeqCst);
            }),
        );

        monitor.sample_once().await;
        monitor.sample_once().await;
        monitor.sample_once().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(monitor.active_alerts().len(), 1);
        assert_eq!(monitor.active_alerts()[0].level, crate::thresholds::AlertLevel::Critical);
    }

    #[tokio::test]
    async fn emergency_cleanup_rule_terminates_oldest_sessions_under_memory_pressure() {
        let session_manager = manager(10);
        let session = session_manager.get_or_create("").await.unwrap();
        session_manager.update(&session.session_id, |s| s.created_at = Utc::now() - chrono::Duration::hours(48)).await.unwrap();

        let mut config = MonitorConfig::default();
        config.max_memory_usage_bytes = 1;
        let monitor = ResourceMonitor::new(config, session_manager.clone(), silent_alert_callback());
        monitor.sample_once().await;
        monitor.run_cleanup_rules().await.unwrap();

        assert!(session_manager.get(&session.session_id).is_none());
        let history = monitor.cleanup_history();
        assert!(history.iter().any(|e| e.sessions_removed > 0));
    }
}
