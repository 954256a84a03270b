//! Stage J: deterministic chunking.
//!
//! Splits the normalized text into fixed-size character windows with
//! overlap, then appends the synthesized summary as its own fragment.
//! Splitting is pure: the same input and parameters always yield the same
//! chunk set.

use async_trait::async_trait;

use crate::models::{ChunkType, StageId};
use crate::pipeline::stage::{
    ChunkDraft, DocView, PriorOutputs, Stage, StageContext, StageOutput,
};
use crate::pipeline::StageError;

/// Chunking stage.
pub struct ChunkingStage;

#[async_trait]
impl Stage for ChunkingStage {
    fn id(&self) -> StageId {
        StageId::Chunk
    }

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        _doc: &DocView<'_>,
        prior: &PriorOutputs,
    ) -> Result<StageOutput, StageError> {
        let normalized = prior
            .get(&StageId::Structure)
            .and_then(|o| o.as_structured())
            .map(|a| a.normalized_text.as_str())
            .ok_or_else(|| StageError::Internal("structure stage output missing".to_string()))?;

        let mut drafts: Vec<ChunkDraft> = split_text(normalized, ctx.chunk_size, ctx.chunk_overlap)
            .into_iter()
            .enumerate()
            .map(|(index, text)| ChunkDraft {
                index: index as i64,
                text,
                chunk_type: ChunkType::Body,
                embedding: None,
            })
            .collect();

        if let Some(synthesis) = prior
            .get(&StageId::Synthesize)
            .and_then(|o| o.as_synthesis())
        {
            if !synthesis.summary.trim().is_empty() {
                drafts.push(ChunkDraft {
                    index: drafts.len() as i64,
                    text: synthesis.summary.clone(),
                    chunk_type: ChunkType::Summary,
                    embedding: None,
                });
            }
        }

        if drafts.is_empty() {
            return Err(StageError::Validation(
                "chunking produced no fragments".to_string(),
            ));
        }

        Ok(StageOutput::Chunks(drafts))
    }
}

/// Split text into windows of `size` characters with `overlap` characters
/// shared between consecutive windows. UTF-8 boundary safe.
pub(crate) fn split_text(text: &str, size: usize, overlap: usize) -> Vec<String> {
    let size = size.max(1);
    let overlap = overlap.min(size.saturating_sub(1));
    let step = size - overlap;

    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }

    let mut windows = Vec::new();
    let mut start = 0;
    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let window: String = chars[start..end].iter().collect();
        let trimmed = window.trim();
        if !trimmed.is_empty() {
            windows.push(trimmed.to_string());
        }
        if end == chars.len() {
            break;
        }
        start += step;
    }
    windows
}
