//! Lease persistence operations.
//!
//! Acquisition is first-writer-wins: a `BEGIN IMMEDIATE` transaction takes
//! the write lock, checks for an unexpired row, and inserts. Losers get
//! `LeaseHeld` and move on. Expired rows are treated as absent.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Row};

use super::{parse_datetime, with_retry, Repository, RepositoryError, Result};
use crate::models::Lease;

fn row_to_lease(row: &Row) -> rusqlite::Result<Lease> {
    let acquired: String = row.get(2)?;
    let expires: String = row.get(3)?;
    let heartbeat: String = row.get(4)?;
    Ok(Lease {
        doc_id: row.get(0)?,
        worker_id: row.get(1)?,
        acquired_at: parse_datetime(&acquired),
        expires_at: parse_datetime(&expires),
        heartbeat_at: parse_datetime(&heartbeat),
    })
}

const LEASE_COLUMNS: &str = "doc_id, worker_id, acquired_at, expires_at, heartbeat_at";

impl Repository {
    /// Atomically acquire the lease for a document. Fails with `LeaseHeld`
    /// if another worker holds an unexpired lease. Lock contention on the
    /// claim transaction is retried with backoff; `LeaseHeld` is not.
    pub fn acquire_lease(&self, doc_id: &str, worker_id: &str, ttl_secs: i64) -> Result<Lease> {
        with_retry(|| self.claim_lease_once(doc_id, worker_id, ttl_secs))
    }

    fn claim_lease_once(&self, doc_id: &str, worker_id: &str, ttl_secs: i64) -> Result<Lease> {
        let conn = self.connect()?;

        conn.execute("BEGIN IMMEDIATE", [])?;

        let result: Result<Lease> = (|| {
            let existing = conn
                .query_row(
                    &format!("SELECT {LEASE_COLUMNS} FROM processing_lock WHERE doc_id = ?"),
                    params![doc_id],
                    row_to_lease,
                )
                .map(Some)
                .or_else(|e| match e {
                    rusqlite::Error::QueryReturnedNoRows => Ok(None),
                    other => Err(RepositoryError::from(other)),
                })?;

            let now = Utc::now();
            if let Some(lease) = existing {
                if !lease.is_expired(now) {
                    return Err(RepositoryError::LeaseHeld(doc_id.to_string()));
                }
                tracing::warn!(
                    "Replacing expired lease on {doc_id} held by {}",
                    lease.worker_id
                );
                conn.execute(
                    "DELETE FROM processing_lock WHERE doc_id = ?",
                    params![doc_id],
                )?;
            }

            let lease = Lease::new(doc_id.to_string(), worker_id.to_string(), ttl_secs);
            conn.execute(
                "INSERT INTO processing_lock \
                     (doc_id, worker_id, acquired_at, expires_at, heartbeat_at) \
                 VALUES (?, ?, ?, ?, ?)",
                params![
                    lease.doc_id,
                    lease.worker_id,
                    lease.acquired_at.to_rfc3339(),
                    lease.expires_at.to_rfc3339(),
                    lease.heartbeat_at.to_rfc3339(),
                ],
            )?;
            Ok(lease)
        })();

        if result.is_ok() {
            conn.execute("COMMIT", [])?;
        } else {
            let _ = conn.execute("ROLLBACK", []);
        }

        result
    }

    /// Extend the lease. No-op (returns false) if the worker does not hold it.
    pub fn renew_lease(&self, doc_id: &str, worker_id: &str, ttl_secs: i64) -> Result<bool> {
        let conn = self.connect()?;
        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE processing_lock SET expires_at = ?, heartbeat_at = ? \
             WHERE doc_id = ? AND worker_id = ?",
            params![
                (now + Duration::seconds(ttl_secs)).to_rfc3339(),
                now.to_rfc3339(),
                doc_id,
                worker_id,
            ],
        )?;
        Ok(changed == 1)
    }

    /// Release the lease. No-op (returns false) if the worker does not hold it.
    pub fn release_lease(&self, doc_id: &str, worker_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "DELETE FROM processing_lock WHERE doc_id = ? AND worker_id = ?",
            params![doc_id, worker_id],
        )?;
        Ok(changed == 1)
    }

    /// All leases whose expiry has passed.
    pub fn expired_leases(&self, now: DateTime<Utc>) -> Result<Vec<Lease>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LEASE_COLUMNS} FROM processing_lock WHERE expires_at <= ?"
        ))?;
        let leases = stmt
            .query_map(params![now.to_rfc3339()], row_to_lease)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(leases)
    }

    /// Administrative removal regardless of holder.
    pub fn force_release_lease(&self, doc_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "DELETE FROM processing_lock WHERE doc_id = ?",
            params![doc_id],
        )?;
        Ok(changed == 1)
    }

    /// Fetch the lease for a document, expired or not.
    pub fn get_lease(&self, doc_id: &str) -> Result<Option<Lease>> {
        let conn = self.connect()?;
        super::to_option(conn.query_row(
            &format!("SELECT {LEASE_COLUMNS} FROM processing_lock WHERE doc_id = ?"),
            params![doc_id],
            row_to_lease,
        ))
    }

    /// All currently held leases.
    pub fn list_leases(&self) -> Result<Vec<Lease>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {LEASE_COLUMNS} FROM processing_lock ORDER BY acquired_at ASC"
        ))?;
        let leases = stmt
            .query_map([], row_to_lease)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(leases)
    }
}
