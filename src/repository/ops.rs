//! Ops-request persistence operations.
//!
//! External callers only append; status transitions happen through the
//! marker operations below and are additionally guarded by database
//! triggers so a terminal row can never go back to `queued`.

use chrono::Utc;
use rusqlite::{params, Row};
use serde::{Deserialize, Serialize};

use super::{parse_datetime, parse_datetime_opt, Repository, RepositoryError, Result};
use crate::models::{OpsRequest, RequestStatus, RequestType, ScopeType};

fn row_to_request(row: &Row) -> rusqlite::Result<OpsRequest> {
    let request_type: String = row.get(1)?;
    let scope_type: String = row.get(2)?;
    let status: String = row.get(4)?;
    let payload: Option<String> = row.get(5)?;
    let created: String = row.get(8)?;
    let applied: Option<String> = row.get(9)?;
    Ok(OpsRequest {
        request_id: row.get(0)?,
        request_type: RequestType::from_str(&request_type).unwrap_or(RequestType::Stop),
        scope_type: ScopeType::from_str(&scope_type).unwrap_or(ScopeType::Global),
        scope_id: row.get(3)?,
        status: RequestStatus::from_str(&status).unwrap_or(RequestStatus::Queued),
        payload: payload.and_then(|s| serde_json::from_str(&s).ok()),
        requested_by: row.get(6)?,
        failure_reason: row.get(7)?,
        created_at: parse_datetime(&created),
        applied_at: parse_datetime_opt(applied),
    })
}

const REQUEST_COLUMNS: &str = "request_id, request_type, scope_type, scope_id, status, payload, \
     requested_by, failure_reason, created_at, applied_at";

/// Evidence row for one RUN invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: String,
    pub requested_by: Option<String>,
    pub payload: Option<serde_json::Value>,
    pub started_at: chrono::DateTime<Utc>,
    pub finished_at: Option<chrono::DateTime<Utc>>,
    pub success_count: Option<u64>,
    pub error_count: Option<u64>,
}

impl Repository {
    /// Append a new operator request with status `queued`.
    pub fn enqueue_ops_request(&self, req: &OpsRequest) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO ops_requests \
                 (request_id, request_type, scope_type, scope_id, status, payload, \
                  requested_by, created_at) \
             VALUES (?, ?, ?, ?, 'queued', ?, ?, ?)",
            params![
                req.request_id,
                req.request_type.as_str(),
                req.scope_type.as_str(),
                req.scope_id,
                req.payload
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                req.requested_by,
                req.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Queued requests in creation order.
    pub fn fetch_queued_ops_requests(&self) -> Result<Vec<OpsRequest>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM ops_requests \
             WHERE status = 'queued' ORDER BY created_at ASC, rowid ASC"
        ))?;
        let requests = stmt
            .query_map([], row_to_request)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    /// Recent requests regardless of status, newest first.
    pub fn list_ops_requests(&self, limit: usize) -> Result<Vec<OpsRequest>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REQUEST_COLUMNS} FROM ops_requests \
             ORDER BY created_at DESC, rowid DESC LIMIT ?"
        ))?;
        let requests = stmt
            .query_map(params![limit as i64], row_to_request)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(requests)
    }

    /// Fetch one request by id.
    pub fn get_ops_request(&self, request_id: &str) -> Result<Option<OpsRequest>> {
        let conn = self.connect()?;
        super::to_option(conn.query_row(
            &format!("SELECT {REQUEST_COLUMNS} FROM ops_requests WHERE request_id = ?"),
            params![request_id],
            row_to_request,
        ))
    }

    /// Transition a queued request to `applied`. `applied_at` is stamped by
    /// the database trigger.
    pub fn mark_ops_request_applied(&self, request_id: &str) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE ops_requests SET status = 'applied' \
             WHERE request_id = ? AND status = 'queued'",
            params![request_id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::InvalidTransition(format!(
                "ops request {request_id} is not queued"
            )));
        }
        Ok(())
    }

    /// Transition a queued request to `failed` with a reason.
    pub fn mark_ops_request_failed(&self, request_id: &str, reason: &str) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE ops_requests SET status = 'failed', failure_reason = ? \
             WHERE request_id = ? AND status = 'queued'",
            params![reason, request_id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::InvalidTransition(format!(
                "ops request {request_id} is not queued"
            )));
        }
        Ok(())
    }

    /// Record the start of a RUN in the evidence table.
    pub fn record_run_started(
        &self,
        run_id: &str,
        requested_by: Option<&str>,
        payload: Option<&serde_json::Value>,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO run_executions (run_id, requested_by, payload, started_at) \
             VALUES (?, ?, ?, ?)",
            params![
                run_id,
                requested_by,
                payload.map(serde_json::to_string).transpose()?,
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Recent RUN evidence rows, newest first.
    pub fn list_run_records(&self, limit: usize) -> Result<Vec<RunRecord>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT run_id, requested_by, payload, started_at, finished_at, \
                    success_count, error_count \
             FROM run_executions ORDER BY started_at DESC LIMIT ?",
        )?;
        let records = stmt
            .query_map(params![limit as i64], |row| {
                let payload: Option<String> = row.get(2)?;
                let started: String = row.get(3)?;
                let finished: Option<String> = row.get(4)?;
                Ok(RunRecord {
                    run_id: row.get(0)?,
                    requested_by: row.get(1)?,
                    payload: payload.and_then(|s| serde_json::from_str(&s).ok()),
                    started_at: parse_datetime(&started),
                    finished_at: parse_datetime_opt(finished),
                    success_count: row.get::<_, Option<i64>>(5)?.map(|n| n as u64),
                    error_count: row.get::<_, Option<i64>>(6)?.map(|n| n as u64),
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(records)
    }

    /// Record RUN completion counters.
    pub fn record_run_finished(
        &self,
        run_id: &str,
        success_count: u64,
        error_count: u64,
    ) -> Result<()> {
        let conn = self.connect()?;
        conn.execute(
            "UPDATE run_executions SET finished_at = ?, success_count = ?, error_count = ? \
             WHERE run_id = ?",
            params![
                Utc::now().to_rfc3339(),
                success_count as i64,
                error_count as i64,
                run_id,
            ],
        )?;
        Ok(())
    }
}
