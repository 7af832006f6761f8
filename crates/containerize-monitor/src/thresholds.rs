//! Alert thresholds and active alerts (spec §3.1, §4.6).

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
    MemoryPressure,
    DiskPressure,
    SessionCount,
}

#[derive(Debug, Clone)]
pub struct AlertThreshold {
    pub resource_type: ResourceType,
    pub warning: f64,
    pub critical: f64,
    pub min_duration: chrono::Duration,
    pub enabled: bool,
}

impl AlertThreshold {
    pub fn shipped_defaults() -> Vec<AlertThreshold> {
        vec![
            AlertThreshold {
                resource_type: ResourceType::MemoryPressure,
                warning: 70.0,
                critical: 90.0,
                min_duration: chrono::Duration::zero(),
                enabled: true,
            },
            AlertThreshold {
                resource_type: ResourceType::DiskPressure,
                warning: 75.0,
                critical: 90.0,
                min_duration: chrono::Duration::zero(),
                enabled: true,
            },
            AlertThreshold {
                resource_type: ResourceType::SessionCount,
                warning: 80.0,
                critical: 95.0,
                min_duration: chrono::Duration::zero(),
                enabled: true,
            },
        ]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveAlert {
    pub id: String,
    pub threshold_name: String,
    pub level: AlertLevel,
    pub started_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub current_value: f64,
    pub acknowledged: bool,
}

/// Evaluates the current value for each enabled threshold against its
/// resource type, raising/refreshing/clearing [`ActiveAlert`]s. The passed
/// `on_created` callback fires exactly once per alert *creation*, never on a
/// refresh of an already-active alert (spec §4.6).
///
/// A threshold only raises an alert once the crossing value has held for at
/// least `min_duration`; a crossing that hasn't dwelled long enough is kept
/// in `pending` and re-checked on the next tick rather than firing right
/// away.
pub struct AlertEvaluator {
    thresholds: HashMap<String, AlertThreshold>,
    active: HashMap<String, ActiveAlert>,
    pending: HashMap<String, (AlertLevel, DateTime<Utc>)>,
}

impl AlertEvaluator {
    pub fn new(thresholds: Vec<(String, AlertThreshold)>) -> Self {
        AlertEvaluator {
            thresholds: thresholds.into_iter().collect(),
            active: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        let named = AlertThreshold::shipped_defaults()
            .into_iter()
            .map(|t| {
                let name = match t.resource_type {
                    ResourceType::MemoryPressure => "memory_pressure",
                    ResourceType::DiskPressure => "disk_pressure",
                    ResourceType::SessionCount => "session_count",
                };
                (name.to_string(), t)
            })
            .collect();
        AlertEvaluator::new(named)
    }

    pub fn acknowledge(&mut self, alert_id: &str) -> bool {
        if let Some(alert) = self.active.values_mut().find(|a| a.id == alert_id) {
            alert.acknowledged = true;
            true
        } else {
            false
        }
    }

    pub fn active_alerts(&self) -> Vec<ActiveAlert> {
        self.active.values().cloned().collect()
    }

    /// `current_values` maps threshold name -> observed value for this tick.
    /// Returns the alerts created (not refreshed) this tick, for dispatching
    /// to the one-shot creation callback.
    pub fn evaluate(&mut self, current_values: &HashMap<String, f64>, now: DateTime<Utc>) -> Vec<ActiveAlert> {
        let mut newly_created = Vec::new();

        for (name, threshold) in &self.thresholds {
            if !threshold.enabled {
                continue;
            }
            let value = match current_values.get(name) {
                Some(v) => *v,
                None => continue,
            };

            if value >= threshold.critical {
                let created = self.raise_or_refresh(name, AlertLevel::Critical, value, now, threshold.min_duration);
                if let Some(alert) = created {
                    newly_created.push(alert);
                }
            } else if value >= threshold.warning {
                let created = self.raise_or_refresh(name, AlertLevel::Warning, value, now, threshold.min_duration);
                if let Some(alert) = created {
                    newly_created.push(alert);
                }
            } else {
                self.active.remove(name);
                self.pending.remove(name);
            }
        }

        newly_created
    }

    /// Refreshes an already-active alert unconditionally, or tracks a new
    /// crossing in `pending` until it has dwelled for `min_duration`, at
    /// which point it's promoted to `active` and returned.
    fn raise_or_refresh(
        &mut self,
        name: &str,
        level: AlertLevel,
        value: f64,
        now: DateTime<Utc>,
        min_duration: chrono::Duration,
    ) -> Option<ActiveAlert> {
        if let Some(existing) = self.active.get_mut(name) {
            existing.level = level;
            existing.current_value = value;
            existing.last_updated = now;
            self.pending.remove(name);
            return None;
        }

        let first_seen = match self.pending.get(name) {
            Some((pending_level, first_seen)) if *pending_level == level => *first_seen,
            _ => now,
        };
        self.pending.insert(name.to_string(), (level, first_seen));
        if now - first_seen < min_duration {
            return None;
        }
        self.pending.remove(name);

        let alert = ActiveAlert {
            id: format!("{name}-{}", now.timestamp_millis()),
            threshold_name: name.to_string(),
            level,
            started_at: now,
            last_updated: now,
            current_value: value,
            acknowledged: false,
        };
        self.active.insert(name.to_string(), alert.clone());
        Some(alert)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alert_created_once_then_only_refreshed() {
        let mut evaluator = AlertEvaluator::with_defaults();
        let now = Utc::now();

        let mut values = HashMap::new();
        values.insert("memory_pressure".to_string(), 95.0);

        let created_first = evaluator.evaluate(&values, now);
        assert_eq!(created_first.len(), 1);
        assert_eq!(created_first[0].level, AlertLevel::Critical);

        let created_second = evaluator.evaluate(&values, now + chrono::Duration::seconds(30));
        assert!(created_second.is_empty());
        assert_eq!(evaluator.active_alerts().len(), 1);
    }

    #[test]
    fn dropping_below_warning_clears_the_alert() {
        let mut evaluator = AlertEvaluator::with_defaults();
        let now = Utc::now();

        let mut high = HashMap::new();
        high.insert("disk_pressure".to_string(), 96.0);
        evaluator.evaluate(&high, now);
        assert_eq!(evaluator.active_alerts().len(), 1);

        let mut low = HashMap::new();
        low.insert("disk_pressure".to_string(), 10.0);
        evaluator.evaluate(&low, now);
        assert!(evaluator.active_alerts().is_empty());
    }

    #[test]
    fn sustained_crossing_required_before_raising() {
        let mut evaluator = AlertEvaluator::new(vec![(
            "memory_pressure".to_string(),
            AlertThreshold {
                resource_type: ResourceType::MemoryPressure,
                warning: 70.0,
                critical: 90.0,
                min_duration: chrono::Duration::seconds(60),
                enabled: true,
            },
        )]);
        let now = Utc::now();
        let mut values = HashMap::new();
        values.insert("memory_pressure".to_string(), 95.0);

        let created = evaluator.evaluate(&values, now);
        assert!(created.is_empty(), "a fresh crossing must not fire before min_duration elapses");
        assert!(evaluator.active_alerts().is_empty());

        let created = evaluator.evaluate(&values, now + chrono::Duration::seconds(30));
        assert!(created.is_empty(), "still short of the 60s dwell time");

        let created = evaluator.evaluate(&values, now + chrono::Duration::seconds(61));
        assert_eq!(created.len(), 1, "alert fires once the dwell time has elapsed");
        assert_eq!(evaluator.active_alerts().len(), 1);
    }

    #[test]
    fn dropping_below_warning_during_dwell_resets_pending() {
        let mut evaluator = AlertEvaluator::new(vec![(
            "memory_pressure".to_string(),
            AlertThreshold {
                resource_type: ResourceType::MemoryPressure,
                warning: 70.0,
                critical: 90.0,
                min_duration: chrono::Duration::seconds(60),
                enabled: true,
            },
        )]);
        let now = Utc::now();
        let mut high = HashMap::new();
        high.insert("memory_pressure".to_string(), 95.0);
        evaluator.evaluate(&high, now);

        let mut low = HashMap::new();
        low.insert("memory_pressure".to_string(), 10.0);
        evaluator.evaluate(&low, now + chrono::Duration::seconds(30));

        let created = evaluator.evaluate(&high, now + chrono::Duration::seconds(61));
        assert!(created.is_empty(), "dwell timer restarts after the pressure dropped out");
    }

    #[test]
    fn acknowledgement_does_not_clear_the_alert() {
        let mut evaluator = AlertEvaluator::with_defaults();
        let now = Utc::now();
        let mut values = HashMap::new();
        values.insert("session_count".to_string(), 99.0);
        let created = evaluator.evaluate(&values, now);

        assert!(evaluator.acknowledge(&created[0].id));
        assert_eq!(evaluator.active_alerts().len(), 1);
        assert!(evaluator.active_alerts()[0].acknowledged);
    }
}
