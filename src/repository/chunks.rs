//! Chunk persistence operations.
//!
//! Chunk replacement is delete-then-insert within one transaction; owner
//! propagation and index contiguity are validated before any row changes.

use rusqlite::{params, Connection, Row};

use super::{to_option, with_retry, Repository, RepositoryError, Result};
use crate::models::{Chunk, ChunkType};

pub(crate) fn row_to_chunk(row: &Row) -> rusqlite::Result<Chunk> {
    let chunk_type: String = row.get(6)?;
    let embedding: Option<String> = row.get(7)?;
    Ok(Chunk {
        chunk_id: row.get(0)?,
        document_id: row.get(1)?,
        execution_id: row.get(2)?,
        owner_id: row.get(3)?,
        chunk_index: row.get(4)?,
        chunk_text: row.get(5)?,
        chunk_type: ChunkType::from_str(&chunk_type).unwrap_or(ChunkType::Body),
        embedding: embedding.and_then(|s| serde_json::from_str(&s).ok()),
    })
}

const CHUNK_COLUMNS: &str =
    "chunk_id, document_id, execution_id, owner_id, chunk_index, chunk_text, chunk_type, embedding";

impl Repository {
    /// Replace all chunks for a document with the given set, atomically.
    pub fn replace_chunks(&self, doc_id: &str, exec_id: &str, chunks: &[Chunk]) -> Result<()> {
        with_retry(|| {
            let mut conn = self.connect()?;
            let tx = conn.transaction()?;
            replace_chunks_tx(&tx, doc_id, exec_id, chunks)?;
            tx.commit()?;
            Ok(())
        })
    }

    /// All chunks for a document ordered by index.
    pub fn chunks_for_document(&self, doc_id: &str) -> Result<Vec<Chunk>> {
        let conn = self.connect()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CHUNK_COLUMNS} FROM chunks WHERE document_id = ? ORDER BY chunk_index ASC"
        ))?;
        let chunks = stmt
            .query_map(params![doc_id], row_to_chunk)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(chunks)
    }

    /// Count chunks for a document.
    pub fn chunk_count(&self, doc_id: &str) -> Result<u64> {
        let conn = self.connect()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM chunks WHERE document_id = ?",
            params![doc_id],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }
}

/// Replace chunks inside an open transaction.
///
/// Validates before touching rows: every chunk belongs to `doc_id` and
/// `exec_id`, carries the document's owner, and indexes are contiguous
/// from zero.
pub(crate) fn replace_chunks_tx(
    tx: &Connection,
    doc_id: &str,
    exec_id: &str,
    chunks: &[Chunk],
) -> Result<()> {
    let doc_owner: Option<String> = to_option(tx.query_row(
        "SELECT owner_id FROM documents WHERE doc_id = ?",
        params![doc_id],
        |row| row.get(0),
    ))?;
    let doc_owner = match doc_owner {
        Some(owner) => owner,
        None => return Err(RepositoryError::NotFound(format!("document {doc_id}"))),
    };

    let mut indexes: Vec<i64> = Vec::with_capacity(chunks.len());
    for chunk in chunks {
        if chunk.owner_id.trim().is_empty() {
            return Err(RepositoryError::OwnerRequired(format!(
                "chunk {}",
                chunk.chunk_id
            )));
        }
        if chunk.owner_id != doc_owner {
            return Err(RepositoryError::OwnerMismatch(format!(
                "chunk owner {} != document owner {doc_owner}",
                chunk.owner_id
            )));
        }
        if chunk.document_id != doc_id || chunk.execution_id != exec_id {
            return Err(RepositoryError::DataIntegrity(format!(
                "chunk {} does not belong to {doc_id}/{exec_id}",
                chunk.chunk_id
            )));
        }
        indexes.push(chunk.chunk_index);
    }
    indexes.sort_unstable();
    for (expected, actual) in indexes.iter().enumerate() {
        if *actual != expected as i64 {
            return Err(RepositoryError::DataIntegrity(format!(
                "chunk indexes are not contiguous from 0 for document {doc_id}"
            )));
        }
    }

    tx.execute("DELETE FROM chunks WHERE document_id = ?", params![doc_id])?;
    for chunk in chunks {
        tx.execute(
            "INSERT INTO chunks \
                 (chunk_id, document_id, execution_id, owner_id, chunk_index, \
                  chunk_text, chunk_type, embedding) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            params![
                chunk.chunk_id,
                chunk.document_id,
                chunk.execution_id,
                chunk.owner_id,
                chunk.chunk_index,
                chunk.chunk_text,
                chunk.chunk_type.as_str(),
                chunk
                    .embedding
                    .as_ref()
                    .map(serde_json::to_string)
                    .transpose()?,
            ],
        )?;
    }
    Ok(())
}
