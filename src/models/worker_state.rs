//! Derived worker control cache.
//!
//! Written only by the ops-request applier, read by workers. Never
//! authoritative: it is rebuildable from `ops_requests` at any moment.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Worker-visible control state projected from the ops-request queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerState {
    /// Global stop gate. When set, the orchestrator stops dispatching.
    pub stop_requested: bool,
    /// Workspaces currently stopped or paused.
    pub paused_workspaces: BTreeSet<String>,
    /// Individual documents currently stopped or paused.
    pub paused_documents: BTreeSet<String>,
    /// Configured dispatch width; the pool's reactive width never exceeds
    /// the hard cap regardless of this value.
    pub max_parallel: u32,
    pub updated_at: DateTime<Utc>,
}

impl Default for WorkerState {
    fn default() -> Self {
        Self {
            stop_requested: false,
            paused_workspaces: BTreeSet::new(),
            paused_documents: BTreeSet::new(),
            max_parallel: 8,
            updated_at: Utc::now(),
        }
    }
}

impl WorkerState {
    /// Whether dispatching for the given workspace is currently gated.
    pub fn is_paused(&self, workspace: &str) -> bool {
        self.stop_requested || self.paused_workspaces.contains(workspace)
    }

    /// Whether a specific document is gated.
    pub fn is_document_paused(&self, doc_id: &str) -> bool {
        self.paused_documents.contains(doc_id)
    }

    /// Touch the update timestamp.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
