//! Execution persistence operations.
//!
//! Executions are insert-only for core fields. Only the terminal-transition
//! fields can be patched, and only forward along the lifecycle; the
//! repository re-checks the current status inside the update transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use super::chunks::replace_chunks_tx;
use super::documents::set_active_execution_tx;
use super::{
    parse_datetime, parse_datetime_opt, to_option, with_retry, Repository, RepositoryError, Result,
};
use crate::models::{Chunk, ErrorCode, Execution, ExecutionPatch, ExecutionStatus};

pub(crate) fn row_to_execution(row: &Row) -> rusqlite::Result<Execution> {
    let status: String = row.get(3)?;
    let error_code: Option<String> = row.get(9)?;
    let result: Option<String> = row.get(11)?;
    let created: String = row.get(13)?;
    let completed: Option<String> = row.get(14)?;
    Ok(Execution {
        execution_id: row.get(0)?,
        document_id: row.get(1)?,
        owner_id: row.get(2)?,
        status: ExecutionStatus::from_str(&status).unwrap_or(ExecutionStatus::Queued),
        model_version: row.get(4)?,
        prompt_hash: row.get(5)?,
        input_hash: row.get(6)?,
        normalized_hash: row.get(7)?,
        retry_of_execution_id: row.get(8)?,
        error_code: error_code.as_deref().and_then(ErrorCode::from_str),
        error_message: row.get(10)?,
        result: result.and_then(|s| serde_json::from_str(&s).ok()),
        duration_ms: row.get(12)?,
        created_at: parse_datetime(&created),
        completed_at: parse_datetime_opt(completed),
    })
}

const EXECUTION_COLUMNS: &str = "execution_id, document_id, owner_id, status, model_version, \
     prompt_hash, input_hash, normalized_hash, retry_of_execution_id, error_code, \
     error_message, result, duration_ms, created_at, completed_at";

impl Repository {
    /// Insert a new execution. Enforces parent→child owner consistency
    /// against the document row.
    pub fn insert_execution(&self, exec: &Execution) -> Result<()> {
        if exec.owner_id.trim().is_empty() {
            return Err(RepositoryError::OwnerRequired(format!(
                "execution {}",
                exec.execution_id
            )));
        }

        let conn = self.connect()?;
        let doc_owner: Option<String> = to_option(conn.query_row(
            "SELECT owner_id FROM documents WHERE doc_id = ?",
            params![exec.document_id],
            |row| row.get(0),
        ))?;
        match doc_owner {
            None => {
                return Err(RepositoryError::NotFound(format!(
                    "document {}",
                    exec.document_id
                )))
            }
            Some(owner) if owner != exec.owner_id => {
                return Err(RepositoryError::OwnerMismatch(format!(
                    "execution owner {} != document owner {owner}",
                    exec.owner_id
                )))
            }
            Some(_) => {}
        }

        conn.execute(
            r#"
            INSERT INTO executions
                (execution_id, document_id, owner_id, status, model_version,
                 prompt_hash, input_hash, normalized_hash, retry_of_execution_id,
                 error_code, error_message, result, duration_ms, created_at, completed_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                exec.execution_id,
                exec.document_id,
                exec.owner_id,
                exec.status.as_str(),
                exec.model_version,
                exec.prompt_hash,
                exec.input_hash,
                exec.normalized_hash,
                exec.retry_of_execution_id,
                exec.error_code.map(|c| c.as_str()),
                exec.error_message,
                exec.result
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
                exec.duration_ms,
                exec.created_at.to_rfc3339(),
                exec.completed_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Fetch an execution by id.
    pub fn get_execution(&self, exec_id: &str) -> Result<Option<Execution>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?"),
            params![exec_id],
            row_to_execution,
        ))
    }

    /// Apply a terminal-transition patch. The patch may only move status
    /// forward; anything else is rejected with `InvalidTransition`.
    pub fn update_execution(&self, exec_id: &str, patch: &ExecutionPatch) -> Result<()> {
        with_retry(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;
            update_execution_tx(&tx, exec_id, patch)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Atomically finish a run as succeeded: patch the execution, point the
    /// document's active execution at it, and replace the document's chunks
    /// if the outcome carries a chunk set. One transaction for all three.
    pub fn complete_execution_success(
        &self,
        exec_id: &str,
        patch: &ExecutionPatch,
        chunks: Option<&[Chunk]>,
    ) -> Result<()> {
        if patch.status != Some(ExecutionStatus::Succeeded) {
            return Err(RepositoryError::InvalidTransition(
                "complete_execution_success requires a succeeded patch".to_string(),
            ));
        }

        with_retry(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;

            let doc_id: String = match to_option(tx.query_row(
                "SELECT document_id FROM executions WHERE execution_id = ?",
                params![exec_id],
                |row| row.get(0),
            ))? {
                Some(id) => id,
                None => return Err(RepositoryError::NotFound(format!("execution {exec_id}"))),
            };

            update_execution_tx(&tx, exec_id, patch)?;
            set_active_execution_tx(&tx, &doc_id, exec_id)?;
            if let Some(chunks) = chunks {
                replace_chunks_tx(&tx, &doc_id, exec_id, chunks)?;
            }

            tx.commit()?;
            Ok(())
        })
    }

    /// Most recent succeeded execution with the same input hash, if any.
    /// Enables idempotent re-runs.
    pub fn find_prior_success(&self, doc_id: &str, input_hash: &str) -> Result<Option<Execution>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            &format!(
                "SELECT {EXECUTION_COLUMNS} FROM executions \
                 WHERE document_id = ? AND input_hash = ? AND status = 'succeeded' \
                 ORDER BY created_at DESC LIMIT 1"
            ),
            params![doc_id, input_hash],
            row_to_execution,
        ))
    }

    /// Most-recent-first execution history for a document.
    pub fn execution_history(&self, doc_id: &str, limit: usize) -> Result<Vec<Execution>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EXECUTION_COLUMNS} FROM executions \
             WHERE document_id = ? ORDER BY created_at DESC LIMIT ?"
        ))?;
        let execs = stmt
            .query_map(params![doc_id, limit as i64], row_to_execution)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(execs)
    }

    /// Mark `running` executions whose document no longer holds an
    /// unexpired lease as failed with `TRANSIENT_EXHAUSTED`. Returns the
    /// number of executions swept.
    pub fn sweep_stale_running(&self, now: DateTime<Utc>) -> Result<usize> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT execution_id FROM executions e \
             WHERE e.status = 'running' \
             AND NOT EXISTS (SELECT 1 FROM processing_lock l \
                             WHERE l.doc_id = e.document_id AND l.expires_at > ?)",
        )?;
        let stale: Vec<String> = stmt
            .query_map(params![now.to_rfc3339()], |row| row.get(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        drop(stmt);

        for exec_id in &stale {
            tracing::warn!("Sweeping stale running execution {exec_id}");
            let patch = ExecutionPatch::failed(
                ErrorCode::TransientExhausted,
                "lease expired while execution was running".to_string(),
                0,
            );
            self.update_execution(exec_id, &patch)?;
        }
        Ok(stale.len())
    }
}

/// Apply a terminal-transition patch inside an open transaction.
pub(crate) fn update_execution_tx(
    tx: &Connection,
    exec_id: &str,
    patch: &ExecutionPatch,
) -> Result<()> {
    let current: Option<String> = to_option(tx.query_row(
        "SELECT status FROM executions WHERE execution_id = ?",
        params![exec_id],
        |row| row.get(0),
    ))?;
    let current = match current {
        Some(s) => ExecutionStatus::from_str(&s).unwrap_or(ExecutionStatus::Queued),
        None => return Err(RepositoryError::NotFound(format!("execution {exec_id}"))),
    };

    if let Some(next) = patch.status {
        if !current.can_transition_to(next) {
            return Err(RepositoryError::InvalidTransition(format!(
                "execution {exec_id}: {} -> {}",
                current.as_str(),
                next.as_str()
            )));
        }
    }

    tx.execute(
        "UPDATE executions SET \
             status = COALESCE(?, status), \
             error_code = COALESCE(?, error_code), \
             error_message = COALESCE(?, error_message), \
             result = COALESCE(?, result), \
             duration_ms = COALESCE(?, duration_ms), \
             completed_at = COALESCE(?, completed_at) \
         WHERE execution_id = ?",
        params![
            patch.status.map(|s| s.as_str()),
            patch.error_code.map(|c| c.as_str()),
            patch.error_message,
            patch
                .result
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
            patch.duration_ms,
            patch.completed_at.map(|t| t.to_rfc3339()),
            exec_id,
        ],
    )?;
    Ok(())
}
