//! Progress snapshot model.
//!
//! The snapshot is the single source of truth for any UI. It is written by
//! the progress publisher (coalesced to one repository write per interval)
//! and never read back by workers for control decisions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::stage::StageId;

/// Number of stage events retained in the snapshot log ring.
pub const EVENT_LOG_CAPACITY: usize = 64;

/// One stage-boundary event as retained in the snapshot log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageEventRecord {
    pub doc_id: String,
    pub stage_id: StageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_step: Option<String>,
    pub ts: DateTime<Utc>,
}

/// Sampled resource counters from the pool governor.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ResourceStats {
    pub cpu_percent: f32,
    pub memory_percent: f64,
    pub memory_used_gb: f64,
    pub memory_total_gb: f64,
}

/// Live view of orchestrator activity, written to a single repository row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressSnapshot {
    pub is_processing: bool,
    /// 1-based index of the most recently dispatched document.
    pub current_index: usize,
    pub total_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_file: Option<String>,
    pub success_count: usize,
    pub error_count: usize,
    #[serde(flatten)]
    pub resources: ResourceStats,
    /// Delay inserted between task dispatches while under memory pressure.
    pub throttle_delay_ms: u64,
    /// Number of reactive width adjustments made by the governor.
    pub adjustment_count: u64,
    pub max_parallel: u32,
    pub current_workers: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Ring of the last [`EVENT_LOG_CAPACITY`] stage events, oldest first.
    pub logs: Vec<StageEventRecord>,
    pub updated_at: DateTime<Utc>,
}

impl Default for ProgressSnapshot {
    fn default() -> Self {
        Self {
            is_processing: false,
            current_index: 0,
            total_count: 0,
            current_file: None,
            success_count: 0,
            error_count: 0,
            resources: ResourceStats::default(),
            throttle_delay_ms: 0,
            adjustment_count: 0,
            max_parallel: 0,
            current_workers: 0,
            last_error: None,
            logs: Vec::new(),
            updated_at: Utc::now(),
        }
    }
}

impl ProgressSnapshot {
    /// Append an event, dropping oldest-first beyond the ring capacity.
    pub fn push_event(&mut self, event: StageEventRecord) {
        self.logs.push(event);
        if self.logs.len() > EVENT_LOG_CAPACITY {
            let overflow = self.logs.len() - EVENT_LOG_CAPACITY;
            self.logs.drain(..overflow);
        }
    }
}
