//! Chunk model.
//!
//! Chunks are the searchable fragments produced by the chunking and
//! embedding stages. `(document_id, chunk_index)` is unique; on re-run the
//! prior set is deleted and replaced atomically with the new set.

use serde::{Deserialize, Serialize};

/// Kind of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkType {
    /// A window over the normalized body text.
    Body,
    /// The synthesized summary, indexed as its own fragment.
    Summary,
}

impl ChunkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Body => "body",
            Self::Summary => "summary",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "body" => Some(Self::Body),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// A searchable fragment of a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub document_id: String,
    /// Execution that produced this chunk.
    pub execution_id: String,
    /// Owner copied from the parent document.
    pub owner_id: String,
    /// 0-based position within the document's chunk set.
    pub chunk_index: i64,
    pub chunk_text: String,
    pub chunk_type: ChunkType,
    /// Fixed-dimension embedding vector, if Stage K ran.
    pub embedding: Option<Vec<f32>>,
}

impl Chunk {
    pub fn new(
        document_id: String,
        execution_id: String,
        owner_id: String,
        chunk_index: i64,
        chunk_text: String,
        chunk_type: ChunkType,
    ) -> Self {
        Self {
            chunk_id: uuid::Uuid::new_v4().to_string(),
            document_id,
            execution_id,
            owner_id,
            chunk_index,
            chunk_text,
            chunk_type,
            embedding: None,
        }
    }
}
