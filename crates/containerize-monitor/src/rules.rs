//! Declarative cleanup rules (spec §3.1, §4.6).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::snapshot::SessionDetail;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionType {
    Memory,
    Disk,
    Count,
    Age,
    Idle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Lt,
    Lte,
    Eq,
    Gte,
    Gt,
}

impl Operator {
    fn holds(&self, observed: f64, threshold: f64) -> bool {
        match self {
            Operator::Lt => observed < threshold,
            Operator::Lte => observed <= threshold,
            Operator::Eq => (observed - threshold).abs() < f64::EPSILON,
            Operator::Gte => observed >= threshold,
            Operator::Gt => observed > threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupCondition {
    pub condition_type: ConditionType,
    pub operator: Operator,
    pub threshold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Terminate,
    Archive,
    Alert,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupAction {
    pub kind: ActionKind,
    pub target_tag: String,
    /// `max_age_hours` / `max_idle_hours` / `max_count` read out of here for
    /// `terminate`'s candidate search (spec §4.6's `find_cleanup_candidates`).
    pub parameters: serde_json::Map<String, serde_json::Value>,
}

impl CleanupAction {
    fn param_f64(&self, key: &str) -> Option<f64> {
        self.parameters.get(key).and_then(|v| v.as_f64())
    }

    fn param_usize(&self, key: &str) -> Option<usize> {
        self.parameters.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
    }
}

#[derive(Debug, Clone)]
pub struct CleanupRule {
    pub name: String,
    pub enabled: bool,
    pub priority: i32,
    pub conditions: Vec<CleanupCondition>,
    pub actions: Vec<CleanupAction>,
    pub cooldown: chrono::Duration,
    pub max_executions: Option<u64>,
    pub execution_count: u64,
    pub last_executed: Option<DateTime<Utc>>,
}

impl CleanupRule {
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        if !self.enabled {
            return false;
        }
        if let Some(max) = self.max_executions {
            if self.execution_count >= max {
                return false;
            }
        }
        if let Some(last) = self.last_executed {
            if now - last < self.cooldown {
                return false;
            }
        }
        true
    }

    pub fn conditions_hold(&self, values: &ConditionValues) -> bool {
        self.conditions.iter().all(|c| {
            let observed = values.get(c.condition_type);
            c.operator.holds(observed, c.threshold)
        })
    }
}

/// Current observed value for each condition type, computed once per tick
/// and consulted by every rule (spec's `getCurrentValueForCondition`).
#[derive(Debug, Clone, Copy, Default)]
pub struct ConditionValues {
    pub memory_pressure: f64,
    pub disk_pressure: f64,
    pub session_count: f64,
    pub max_age_hours_observed: f64,
    /// Per design notes open question (b): the source's idle-value getter
    /// returns 0 pending a defined per-session idle aggregate; treated as
    /// unimplemented here too, always 0 until that aggregate exists.
    pub idle_hours_observed: f64,
}

impl ConditionValues {
    fn get(&self, condition_type: ConditionType) -> f64 {
        match condition_type {
            ConditionType::Memory => self.memory_pressure,
            ConditionType::Disk => self.disk_pressure,
            ConditionType::Count => self.session_count,
            ConditionType::Age => self.max_age_hours_observed,
            ConditionType::Idle => self.idle_hours_observed,
        }
    }
}

/// Select terminate candidates from session details: filter by max age /
/// max idle, cap by max count, oldest first.
pub fn find_cleanup_candidates(sessions: &[SessionDetail], action: &CleanupAction) -> Vec<String> {
    let max_age = action.param_f64("max_age_hours");
    let max_idle = action.param_f64("max_idle_hours");
    let max_count = action.param_usize("max_count");

    let mut candidates: Vec<&SessionDetail> = sessions
        .iter()
        .filter(|s| max_age.map(|max| s.age_hours > max).unwrap_or(true))
        .filter(|s| max_idle.map(|max| s.idle_hours > max).unwrap_or(true))
        .collect();

    candidates.sort_by(|a, b| b.age_hours.partial_cmp(&a.age_hours).unwrap_or(std::cmp::Ordering::Equal));

    if let Some(limit) = max_count {
        candidates.truncate(limit);
    }
    candidates.into_iter().map(|s| s.session_id.clone()).collect()
}

fn param(key: &str, value: serde_json::Value) -> (String, serde_json::Value) {
    (key.to_string(), value)
}

fn params(entries: Vec<(String, serde_json::Value)>) -> serde_json::Map<String, serde_json::Value> {
    entries.into_iter().collect()
}

/// The three rules shipped by default (spec §4.6).
pub fn shipped_default_rules() -> Vec<CleanupRule> {
    vec![
        CleanupRule {
            name: "cleanup_old_sessions".to_string(),
            enabled: true,
            priority: 10,
            conditions: vec![CleanupCondition {
                condition_type: ConditionType::Age,
                operator: Operator::Gt,
                threshold: 24.0,
            }],
            actions: vec![CleanupAction {
                kind: ActionKind::Terminate,
                target_tag: "old_sessions".to_string(),
                parameters: params(vec![param("max_age_hours", serde_json::json!(24.0))]),
            }],
            cooldown: chrono::Duration::hours(1),
            max_executions: None,
            execution_count: 0,
            last_executed: None,
        },
        CleanupRule {
            name: "cleanup_idle_high_memory".to_string(),
            enabled: true,
            priority: 8,
            conditions: vec![CleanupCondition {
                condition_type: ConditionType::Memory,
                operator: Operator::Gt,
                threshold: 80.0,
            }],
            actions: vec![CleanupAction {
                kind: ActionKind::Terminate,
                target_tag: "idle_high_memory".to_string(),
                parameters: params(vec![
                    param("max_idle_hours", serde_json::json!(2.0)),
                    param("max_count", serde_json::json!(5)),
                ]),
            }],
            cooldown: chrono::Duration::minutes(30),
            max_executions: None,
            execution_count: 0,
            last_executed: None,
        },
        CleanupRule {
            name: "emergency_cleanup".to_string(),
            enabled: true,
            priority: 15,
            conditions: vec![CleanupCondition {
                condition_type: ConditionType::Memory,
                operator: Operator::Gt,
                threshold: 95.0,
            }],
            actions: vec![CleanupAction {
                kind: ActionKind::Terminate,
                target_tag: "emergency".to_string(),
                parameters: params(vec![param("max_count", serde_json::json!(10))]),
            }],
            cooldown: chrono::Duration::minutes(5),
            max_executions: None,
            execution_count: 0,
            last_executed: None,
        },
    ]
}

/// One row of the bounded cleanup history ring buffer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupEvent {
    pub rule_name: String,
    pub executed_at: DateTime<Utc>,
    pub sessions_removed: u64,
    pub bytes_freed: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_cleanup_candidates_filters_and_caps() {
        let sessions = vec![
            SessionDetail { session_id: "a".into(), age_hours: 30.0, idle_hours: 1.0, score: 10.0 },
            SessionDetail { session_id: "b".into(), age_hours: 10.0, idle_hours: 1.0, score: 10.0 },
            SessionDetail { session_id: "c".into(), age_hours: 40.0, idle_hours: 1.0, score: 10.0 },
        ];
        let action = CleanupAction {
            kind: ActionKind::Terminate,
            target_tag: "x".to_string(),
            parameters: params(vec![param("max_age_hours", serde_json::json!(20.0)), param("max_count", serde_json::json!(1))]),
        };
        let candidates = find_cleanup_candidates(&sessions, &action);
        assert_eq!(candidates, vec!["c".to_string()]);
    }

    #[test]
    fn rule_respects_cooldown() {
        let mut rule = shipped_default_rules().remove(1);
        let now = Utc::now();
        rule.last_executed = Some(now);
        assert!(!rule.is_eligible(now + chrono::Duration::minutes(5)));
        assert!(rule.is_eligible(now + chrono::Duration::minutes(31)));
    }

    #[test]
    fn rule_respects_max_executions() {
        let mut rule = shipped_default_rules().remove(0);
        rule.max_executions = Some(1);
        rule.execution_count = 1;
        assert!(!rule.is_eligible(Utc::now()));
    }
}
