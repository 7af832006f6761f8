//! Resource snapshot types (spec §3.1, §4.6). Borrowed, copy-out records —
//! never a reference into [`containerize_session::SessionManager`]'s map, per
//! the design note that C6 must not retain owning references to `Session`
//! objects beyond a sampling tick.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-session detail copied out at sampling time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session_id: String,
    pub age_hours: f64,
    pub idle_hours: f64,
    pub score: f64,
}

/// `score = 100 / (1 + disk_mb / (age_hours + 1))` (spec §4.6).
pub fn resource_score(disk_mb: f64, age_hours: f64) -> f64 {
    100.0 / (1.0 + disk_mb / (age_hours + 1.0))
}

/// A sample at time `t`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub taken_at: DateTime<Utc>,
    pub total_sessions: u64,
    pub active_sessions: u64,
    pub idle_sessions: u64,
    pub memory_pressure: f64,
    pub disk_pressure: f64,
    pub session_details: Vec<SessionDetail>,
    pub file_handle_count: u64,
    pub task_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// Live, continuously-updated view derived from the latest snapshot plus
/// session-count pressure — what `server_status` reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurrentResourceUsage {
    pub memory_pressure: f64,
    pub disk_pressure: f64,
    pub session_pressure: f64,
    pub resource_pressure: f64,
    pub health_status: HealthStatus,
}

impl CurrentResourceUsage {
    pub fn from_pressures(memory_pressure: f64, disk_pressure: f64, session_pressure: f64) -> Self {
        let resource_pressure = memory_pressure.max(disk_pressure).max(session_pressure);
        let health_status = if resource_pressure >= 90.0 {
            HealthStatus::Critical
        } else if resource_pressure >= 70.0 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };
        CurrentResourceUsage {
            memory_pressure,
            disk_pressure,
            session_pressure,
            resource_pressure,
            health_status,
        }
    }
}

/// Fixed-capacity ring buffer. Evicts the oldest entry once full, as spec's
/// "evict oldest if the ring buffer of size `max_snapshots` is full" demands.
pub struct RingBuffer<T> {
    items: std::collections::VecDeque<T>,
    capacity: usize,
}

impl<T> RingBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        RingBuffer {
            items: std::collections::VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.items.len() >= self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_buffer_evicts_oldest_when_full() {
        let mut buf = RingBuffer::new(2);
        buf.push(1);
        buf.push(2);
        buf.push(3);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![2, 3]);
    }

    #[test]
    fn health_status_thresholds() {
        assert_eq!(CurrentResourceUsage::from_pressures(50.0, 50.0, 50.0).health_status, HealthStatus::Healthy);
        assert_eq!(CurrentResourceUsage::from_pressures(75.0, 10.0, 10.0).health_status, HealthStatus::Warning);
        assert_eq!(CurrentResourceUsage::from_pressures(95.0, 10.0, 10.0).health_status, HealthStatus::Critical);
    }

    #[test]
    fn resource_score_decreases_with_disk_and_increases_with_age() {
        let fresh_small = resource_score(10.0, 0.0);
        let old_small = resource_score(10.0, 10.0);
        assert!(old_small > fresh_small);

        let fresh_large = resource_score(10_000.0, 0.0);
        assert!(fresh_small > fresh_large);
    }
}
