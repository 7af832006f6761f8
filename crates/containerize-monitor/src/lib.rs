//! Resource monitor (C6): periodic snapshots, pressure scoring, declarative
//! cleanup rules, and alert thresholds.

pub mod monitor;
pub mod rules;
pub mod snapshot;
pub mod thresholds;

pub use monitor::{silent_alert_callback, MonitorConfig, ResourceMonitor};
pub use rules::{ActionKind, CleanupAction, CleanupCondition, CleanupEvent, CleanupRule, ConditionType, Operator};
pub use snapshot::{CurrentResourceUsage, HealthStatus, ResourceSnapshot, SessionDetail};
pub use thresholds::{ActiveAlert, AlertLevel, AlertThreshold, ResourceType};
