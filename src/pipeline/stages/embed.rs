//! Stage K: embedding.
//!
//! Produces one vector per chunk via the routed embedding model, in
//! bounded batches, and validates every vector against the configured
//! dimension before attaching it.

use async_trait::async_trait;

use crate::models::StageId;
use crate::pipeline::stage::{ChunkDraft, DocView, PriorOutputs, Stage, StageContext, StageOutput};
use crate::pipeline::StageError;

/// Texts per embedding batch.
const EMBED_BATCH_SIZE: usize = 16;

/// Embedding stage.
pub struct EmbedStage;

#[async_trait]
impl Stage for EmbedStage {
    fn id(&self) -> StageId {
        StageId::Embed
    }

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        _doc: &DocView<'_>,
        prior: &PriorOutputs,
    ) -> Result<StageOutput, StageError> {
        let drafts = prior
            .get(&StageId::Chunk)
            .and_then(|o| o.as_chunks())
            .ok_or_else(|| StageError::Internal("chunk stage output missing".to_string()))?;

        let mut embedded: Vec<ChunkDraft> = drafts.to_vec();
        for batch_start in (0..embedded.len()).step_by(EMBED_BATCH_SIZE) {
            ctx.check_canceled()?;

            let batch_end = (batch_start + EMBED_BATCH_SIZE).min(embedded.len());
            let texts: Vec<String> = embedded[batch_start..batch_end]
                .iter()
                .map(|d| d.text.clone())
                .collect();

            let vectors = ctx.embed(&texts).await?;
            if vectors.len() != texts.len() {
                return Err(StageError::ModelOutput(format!(
                    "embedding batch returned {} vectors for {} texts",
                    vectors.len(),
                    texts.len()
                )));
            }

            for (offset, vector) in vectors.into_iter().enumerate() {
                if vector.len() != ctx.embedding_dim {
                    return Err(StageError::ModelOutput(format!(
                        "embedding dimension mismatch: expected {}, got {}",
                        ctx.embedding_dim,
                        vector.len()
                    )));
                }
                embedded[batch_start + offset].embedding = Some(vector);
            }
        }

        Ok(StageOutput::Embedded(embedded))
    }
}
