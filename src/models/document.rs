//! Document model.
//!
//! A document is the logical unit of ingestion. Content is identified by
//! SHA-256 hash; the hash is immutable after first insert and duplicate
//! hashes are rejected at the repository.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::stage::StageId;

/// Processing status of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Canceled,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }
}

/// Opaque per-stage output columns on the document row.
///
/// Written by stages as each completes; cleared wholesale by the
/// CLEAR_STAGES operator request. Executions and chunks are never touched
/// by a clear.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageOutputs {
    /// Consolidated extracted text (Stage E artifact).
    pub extract: Option<String>,
    /// Visual/OCR enrichment JSON (Stage F artifact).
    pub visual: Option<String>,
    /// Normalized text (Stage G/H artifact).
    pub normalized: Option<String>,
    /// Structured metadata JSON (Stage H artifact).
    pub structured: Option<String>,
    /// Summary + tags JSON (Stage I artifact).
    pub synthesis: Option<String>,
}

impl StageOutputs {
    /// Column name that persists the given stage's artifact, if any.
    /// Chunking and embedding persist to the chunks table instead.
    pub fn column_for(stage: StageId) -> Option<&'static str> {
        match stage {
            StageId::Extract => Some("output_extract"),
            StageId::Visual => Some("output_visual"),
            StageId::Format | StageId::Structure => Some("output_normalized"),
            StageId::Synthesize => Some("output_synthesis"),
            StageId::Chunk | StageId::Embed => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.extract.is_none()
            && self.visual.is_none()
            && self.normalized.is_none()
            && self.structured.is_none()
            && self.synthesis.is_none()
    }
}

/// A document with processing state and stage outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    /// Stable unique identifier.
    pub doc_id: String,
    /// Owning principal; never null. Writes without it are rejected.
    pub owner_id: String,
    /// Organizational partition used for routing and gating.
    pub workspace: String,
    /// Fine-grained category used for prompt selection.
    pub doc_type: String,
    /// Opaque reference into the originating source system.
    pub source_ref: Option<String>,
    /// Original file name.
    pub file_name: String,
    /// MIME type of the content.
    pub mime_type: String,
    /// Path to the stored bytes on disk.
    pub file_path: Option<PathBuf>,
    /// SHA-256 hash of the content; immutable after first insert.
    pub content_hash: String,
    /// Current processing status.
    pub processing_status: ProcessingStatus,
    /// The most recent succeeded execution, if any.
    pub active_execution_id: Option<String>,
    /// Opaque per-stage output columns.
    pub stage_outputs: StageOutputs,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Compute SHA-256 hash of content.
    pub fn compute_hash(content: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(content);
        hex::encode(hasher.finalize())
    }

    /// Create a new pending document.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        owner_id: String,
        workspace: String,
        doc_type: String,
        file_name: String,
        mime_type: String,
        content: &[u8],
        file_path: Option<PathBuf>,
        source_ref: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            doc_id: uuid::Uuid::new_v4().to_string(),
            owner_id,
            workspace,
            doc_type,
            source_ref,
            file_name,
            mime_type,
            file_path,
            content_hash: Self::compute_hash(content),
            processing_status: ProcessingStatus::Pending,
            active_execution_id: None,
            stage_outputs: StageOutputs::default(),
            created_at: now,
            updated_at: now,
        }
    }
}
