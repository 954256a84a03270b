//! Document persistence operations.

use chrono::Utc;
use rusqlite::{params, params_from_iter, types::Value, Connection, Row};

use super::{
    is_unique_violation, parse_datetime, to_option, with_retry, Repository, RepositoryError,
    Result,
};
use crate::models::{Document, ProcessingStatus, StageOutputs};

/// Filter for fetching a batch of pending documents.
#[derive(Debug, Clone, Default)]
pub struct BatchFilter {
    /// Restrict to a single workspace.
    pub workspace: Option<String>,
    /// Restrict to specific documents.
    pub doc_ids: Option<Vec<String>>,
    /// Workspaces excluded by the pause gates.
    pub exclude_workspaces: Vec<String>,
    /// Individual documents excluded by the pause gates.
    pub exclude_documents: Vec<String>,
}

pub(crate) fn row_to_document(row: &Row) -> rusqlite::Result<Document> {
    let status: String = row.get(9)?;
    let created: String = row.get(16)?;
    let updated: String = row.get(17)?;
    Ok(Document {
        doc_id: row.get(0)?,
        owner_id: row.get(1)?,
        workspace: row.get(2)?,
        doc_type: row.get(3)?,
        source_ref: row.get(4)?,
        file_name: row.get(5)?,
        mime_type: row.get(6)?,
        file_path: row.get::<_, Option<String>>(7)?.map(Into::into),
        content_hash: row.get(8)?,
        processing_status: ProcessingStatus::from_str(&status)
            .unwrap_or(ProcessingStatus::Pending),
        active_execution_id: row.get(10)?,
        stage_outputs: StageOutputs {
            extract: row.get(11)?,
            visual: row.get(12)?,
            normalized: row.get(13)?,
            structured: row.get(14)?,
            synthesis: row.get(15)?,
        },
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

const DOCUMENT_COLUMNS: &str = "doc_id, owner_id, workspace, doc_type, source_ref, file_name, \
     mime_type, file_path, content_hash, processing_status, active_execution_id, \
     output_extract, output_visual, output_normalized, output_structured, output_synthesis, \
     created_at, updated_at";

impl Repository {
    /// Insert a new document. Fails with `DuplicateContentHash` if the
    /// content hash is already present and `OwnerRequired` on empty owner.
    pub fn insert_document(&self, doc: &Document) -> Result<()> {
        if doc.owner_id.trim().is_empty() {
            return Err(RepositoryError::OwnerRequired(format!(
                "document {}",
                doc.doc_id
            )));
        }

        let conn = self.connect()?;
        let result = conn.execute(
            r#"
            INSERT INTO documents
                (doc_id, owner_id, workspace, doc_type, source_ref, file_name,
                 mime_type, file_path, content_hash, processing_status,
                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            params![
                doc.doc_id,
                doc.owner_id,
                doc.workspace,
                doc.doc_type,
                doc.source_ref,
                doc.file_name,
                doc.mime_type,
                doc.file_path.as_ref().map(|p| p.display().to_string()),
                doc.content_hash,
                doc.processing_status.as_str(),
                doc.created_at.to_rfc3339(),
                doc.updated_at.to_rfc3339(),
            ],
        );

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e, "content_hash") => Err(
                RepositoryError::DuplicateContentHash(doc.content_hash.clone()),
            ),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetch a document by id.
    pub fn get_document(&self, doc_id: &str) -> Result<Option<Document>> {
        let conn = self.connect()?;
        to_option(conn.query_row(
            &format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE doc_id = ?"),
            params![doc_id],
            row_to_document,
        ))
    }

    /// Fetch pending documents ordered by creation time, oldest first.
    pub fn fetch_pending_batch(&self, filter: &BatchFilter, limit: usize) -> Result<Vec<Document>> {
        let conn = self.connect()?;

        let mut sql = format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents WHERE processing_status = 'pending'"
        );
        let mut binds: Vec<Value> = Vec::new();

        if let Some(ref workspace) = filter.workspace {
            sql.push_str(" AND workspace = ?");
            binds.push(Value::from(workspace.clone()));
        }
        if let Some(ref doc_ids) = filter.doc_ids {
            if doc_ids.is_empty() {
                return Ok(Vec::new());
            }
            sql.push_str(&format!(
                " AND doc_id IN ({})",
                vec!["?"; doc_ids.len()].join(", ")
            ));
            binds.extend(doc_ids.iter().map(|id| Value::from(id.clone())));
        }
        if !filter.exclude_workspaces.is_empty() {
            sql.push_str(&format!(
                " AND workspace NOT IN ({})",
                vec!["?"; filter.exclude_workspaces.len()].join(", ")
            ));
            binds.extend(
                filter
                    .exclude_workspaces
                    .iter()
                    .map(|w| Value::from(w.clone())),
            );
        }
        if !filter.exclude_documents.is_empty() {
            sql.push_str(&format!(
                " AND doc_id NOT IN ({})",
                vec!["?"; filter.exclude_documents.len()].join(", ")
            ));
            binds.extend(
                filter
                    .exclude_documents
                    .iter()
                    .map(|d| Value::from(d.clone())),
            );
        }

        sql.push_str(" ORDER BY created_at ASC, doc_id ASC LIMIT ?");
        binds.push(Value::from(limit as i64));

        let mut stmt = conn.prepare(&sql)?;
        let docs = stmt
            .query_map(params_from_iter(binds), row_to_document)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(docs)
    }

    /// Compare-and-swap the processing status. Returns whether the swap
    /// happened. Used only by lease transitions and administrative resets.
    pub fn update_document_status(
        &self,
        doc_id: &str,
        expected: ProcessingStatus,
        new_status: ProcessingStatus,
    ) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE documents SET processing_status = ?, updated_at = ? \
             WHERE doc_id = ? AND processing_status = ?",
            params![
                new_status.as_str(),
                Utc::now().to_rfc3339(),
                doc_id,
                expected.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    /// Reset a document to `pending` unless it is currently `processing`.
    /// Prior executions and the active pointer are untouched. Returns
    /// whether the reset happened.
    pub fn reset_document_to_pending(&self, doc_id: &str) -> Result<bool> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE documents SET processing_status = 'pending', updated_at = ? \
             WHERE doc_id = ? AND processing_status != 'processing'",
            params![Utc::now().to_rfc3339(), doc_id],
        )?;
        Ok(changed == 1)
    }

    /// Point the document at a succeeded execution. Verifies in the same
    /// transaction that the execution belongs to the document and has
    /// succeeded.
    pub fn set_active_execution(&self, doc_id: &str, exec_id: &str) -> Result<()> {
        with_retry(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;
            set_active_execution_tx(&tx, doc_id, exec_id)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Write one opaque stage output column.
    pub fn update_stage_output(&self, doc_id: &str, column: &str, value: &str) -> Result<()> {
        // Column names come from the closed StageOutputs mapping, never from
        // user input.
        debug_assert!(STAGE_OUTPUT_COLUMNS.contains(&column));
        let conn = self.connect()?;
        let changed = conn.execute(
            &format!("UPDATE documents SET {column} = ?, updated_at = ? WHERE doc_id = ?"),
            params![value, Utc::now().to_rfc3339(), doc_id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("document {doc_id}")));
        }
        Ok(())
    }

    /// Clear all opaque per-stage output columns for a document. Leaves
    /// executions and chunks untouched.
    pub fn clear_stage_outputs(&self, doc_id: &str) -> Result<()> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE documents SET output_extract = NULL, output_visual = NULL, \
             output_normalized = NULL, output_structured = NULL, output_synthesis = NULL, \
             updated_at = ? WHERE doc_id = ?",
            params![Utc::now().to_rfc3339(), doc_id],
        )?;
        if changed == 0 {
            return Err(RepositoryError::NotFound(format!("document {doc_id}")));
        }
        Ok(())
    }

    /// Clear stage outputs for every document in a workspace.
    pub fn clear_stage_outputs_for_workspace(&self, workspace: &str) -> Result<usize> {
        let conn = self.connect()?;
        let changed = conn.execute(
            "UPDATE documents SET output_extract = NULL, output_visual = NULL, \
             output_normalized = NULL, output_structured = NULL, output_synthesis = NULL, \
             updated_at = ? WHERE workspace = ?",
            params![Utc::now().to_rfc3339(), workspace],
        )?;
        Ok(changed)
    }

    /// List documents in a workspace with the given status.
    pub fn documents_with_status(
        &self,
        workspace: &str,
        status: ProcessingStatus,
    ) -> Result<Vec<Document>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {DOCUMENT_COLUMNS} FROM documents \
             WHERE workspace = ? AND processing_status = ? ORDER BY created_at ASC"
        ))?;
        let docs = stmt
            .query_map(params![workspace, status.as_str()], row_to_document)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(docs)
    }

    /// Count documents in a workspace with the given status.
    pub fn count_with_status(&self, workspace: &str, status: ProcessingStatus) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM documents WHERE workspace = ? AND processing_status = ?",
            params![workspace, status.as_str()],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Counts per processing status across all workspaces.
    pub fn status_counts(&self) -> Result<Vec<(String, u64)>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(
            "SELECT processing_status, COUNT(*) FROM documents \
             GROUP BY processing_status ORDER BY processing_status",
        )?;
        let counts = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)? as u64))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(counts)
    }
}

pub(crate) const STAGE_OUTPUT_COLUMNS: [&str; 5] = [
    "output_extract",
    "output_visual",
    "output_normalized",
    "output_structured",
    "output_synthesis",
];

/// Set the active execution inside an open transaction, verifying the
/// pointer discipline: the execution must belong to the document and be
/// succeeded.
pub(crate) fn set_active_execution_tx(
    tx: &Connection,
    doc_id: &str,
    exec_id: &str,
) -> Result<()> {
    let row = to_option(tx.query_row(
        "SELECT document_id, status FROM executions WHERE execution_id = ?",
        params![exec_id],
        |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)),
    ))?;

    let (document_id, status) = match row {
        Some(pair) => pair,
        None => return Err(RepositoryError::NotFound(format!("execution {exec_id}"))),
    };
    if document_id != doc_id {
        return Err(RepositoryError::DataIntegrity(format!(
            "execution {exec_id} belongs to {document_id}, not {doc_id}"
        )));
    }
    if status != "succeeded" {
        return Err(RepositoryError::InvalidTransition(format!(
            "active execution must be succeeded, got {status}"
        )));
    }

    let changed = tx.execute(
        "UPDATE documents SET active_execution_id = ?, updated_at = ? WHERE doc_id = ?",
        params![exec_id, Utc::now().to_rfc3339(), doc_id],
    )?;
    if changed == 0 {
        return Err(RepositoryError::NotFound(format!("document {doc_id}")));
    }
    Ok(())
}
