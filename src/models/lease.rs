//! Processing lease model.
//!
//! A lease is a short-lived, repository-backed single-writer claim on a
//! document. At most one row exists per document; expired rows are treated
//! as absent.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Single-writer claim on a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub doc_id: String,
    pub worker_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl Lease {
    /// Create a fresh lease held by `worker_id` for `ttl_secs`.
    pub fn new(doc_id: String, worker_id: String, ttl_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            doc_id,
            worker_id,
            acquired_at: now,
            expires_at: now + Duration::seconds(ttl_secs),
            heartbeat_at: now,
        }
    }

    /// Whether the lease has expired as of `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
