//! Stage contract and shared artifact types.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::StageError;
use crate::config::Route;
use crate::llm::{ModelClient, ModelUsage};
use crate::models::{ChunkType, Document, StageId};
use crate::progress::{ProgressEvent, ProgressTx};

/// Read-only view of the document a stage operates on.
pub struct DocView<'a> {
    pub doc: &'a Document,
    bytes: &'a [u8],
}

impl<'a> DocView<'a> {
    pub fn new(doc: &'a Document, bytes: &'a [u8]) -> Self {
        Self { doc, bytes }
    }

    /// Raw file bytes as stored at ingest.
    pub fn bytes(&self) -> &[u8] {
        self.bytes
    }

    /// Lossy UTF-8 view of the bytes.
    pub fn text_lossy(&self) -> std::borrow::Cow<'a, str> {
        String::from_utf8_lossy(self.bytes)
    }
}

/// One extraction engine's output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractVariant {
    /// Engine identifier (e.g. "pdftotext", "pdftotext-layout", "direct").
    pub engine: String,
    pub text: String,
}

/// Stage E artifact: engine variants plus the consolidated text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractArtifact {
    pub variants: Vec<ExtractVariant>,
    /// Best variant by non-whitespace volume; the only extract artifact
    /// persisted on the document row.
    pub consolidated: String,
    pub page_count: Option<u32>,
}

/// One detected visual element.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisualElement {
    pub kind: String,
    pub page: u32,
    pub detail: String,
}

/// Stage F artifact: OCR text plus detected elements.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VisualArtifact {
    pub text: String,
    pub elements: Vec<VisualElement>,
    pub pages_scanned: u32,
}

/// Stage H artifact: normalized text plus structured metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredArtifact {
    pub normalized_text: String,
    pub structured: serde_json::Value,
}

/// Stage I artifact: summary and tags.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SynthesisArtifact {
    pub summary: String,
    pub tags: Vec<String>,
}

/// A chunk in flight through stages J and K, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkDraft {
    pub index: i64,
    pub text: String,
    pub chunk_type: ChunkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

/// Output of one stage, keyed into [`PriorOutputs`] for later stages.
#[derive(Debug, Clone)]
pub enum StageOutput {
    Extracted(ExtractArtifact),
    Visual(VisualArtifact),
    Formatted(String),
    Structured(StructuredArtifact),
    Synthesis(SynthesisArtifact),
    Chunks(Vec<ChunkDraft>),
    Embedded(Vec<ChunkDraft>),
}

impl StageOutput {
    pub fn as_extract(&self) -> Option<&ExtractArtifact> {
        match self {
            Self::Extracted(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_visual(&self) -> Option<&VisualArtifact> {
        match self {
            Self::Visual(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_formatted(&self) -> Option<&str> {
        match self {
            Self::Formatted(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_structured(&self) -> Option<&StructuredArtifact> {
        match self {
            Self::Structured(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_synthesis(&self) -> Option<&SynthesisArtifact> {
        match self {
            Self::Synthesis(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_chunks(&self) -> Option<&[ChunkDraft]> {
        match self {
            Self::Chunks(c) | Self::Embedded(c) => Some(c),
            _ => None,
        }
    }
}

/// Keyed map of outputs from earlier stages.
pub type PriorOutputs = HashMap<StageId, StageOutput>;

/// Per-stage execution context: cancellation, model route, chunking
/// parameters, and the progress sink.
pub struct StageContext<'a> {
    pub stage: StageId,
    pub cancel: &'a CancellationToken,
    pub models: &'a dyn ModelClient,
    /// Resolved model/prompt for this stage.
    pub route: Route,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub embedding_dim: usize,
    pub max_content_chars: usize,
    pub reprompt_on_bad_output: bool,
    pub(crate) progress: &'a ProgressTx,
    pub(crate) doc_id: String,
    pub(crate) usage: &'a Mutex<ModelUsage>,
}

impl StageContext<'_> {
    /// Record model usage against the current execution.
    pub fn add_usage(&self, usage: ModelUsage) {
        if let Ok(mut total) = self.usage.lock() {
            total.merge(usage);
        }
    }

    /// Emit a sub-step progress event for heavy internal phases.
    pub async fn sub_step(&self, name: &str) {
        let _ = self
            .progress
            .send(ProgressEvent::StageCompleted {
                doc_id: self.doc_id.clone(),
                stage: self.stage,
                sub_step: Some(name.to_string()),
            })
            .await;
    }

    /// Run a generation call against this stage's route, honoring
    /// cancellation at the model-call suspension point.
    pub async fn generate(&self, prompt: &str) -> Result<String, StageError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StageError::Canceled),
            result = self.models.generate(&self.route.model_id, prompt) => {
                let output = result.map_err(StageError::from)?;
                self.add_usage(output.usage);
                Ok(output.text)
            }
        }
    }

    /// Run an embedding call against this stage's route, honoring
    /// cancellation at the model-call suspension point.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, StageError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(StageError::Canceled),
            result = self.models.embed(&self.route.model_id, texts) => {
                let vectors = result.map_err(StageError::from)?;
                self.add_usage(ModelUsage {
                    embed_calls: texts.len() as u64,
                    input_chars: texts.iter().map(|t| t.len() as u64).sum(),
                    ..Default::default()
                });
                Ok(vectors)
            }
        }
    }

    /// Check for cancellation at an explicit point inside a stage.
    pub fn check_canceled(&self) -> Result<(), StageError> {
        if self.cancel.is_cancelled() {
            Err(StageError::Canceled)
        } else {
            Ok(())
        }
    }
}

/// One step of the processing pipeline.
///
/// Stages may read only outputs of prior stages and must honor the
/// context's cancellation token at internal suspension points.
#[async_trait]
pub trait Stage: Send + Sync {
    fn id(&self) -> StageId;

    /// Whether this stage applies to the document. Non-applicable stages
    /// are skipped without error (Stage F on born-digital text, say).
    fn applies(&self, _doc: &DocView<'_>) -> bool {
        true
    }

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        doc: &DocView<'_>,
        prior: &PriorOutputs,
    ) -> Result<StageOutput, StageError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_accessors() {
        let output = StageOutput::Formatted("text".to_string());
        assert_eq!(output.as_formatted(), Some("text"));
        assert!(output.as_extract().is_none());

        let chunks = StageOutput::Chunks(vec![ChunkDraft {
            index: 0,
            text: "c".to_string(),
            chunk_type: ChunkType::Body,
            embedding: None,
        }]);
        assert_eq!(chunks.as_chunks().unwrap().len(), 1);
    }

    #[test]
    fn test_embedded_also_exposes_chunks() {
        let embedded = StageOutput::Embedded(vec![ChunkDraft {
            index: 0,
            text: "c".to_string(),
            chunk_type: ChunkType::Body,
            embedding: Some(vec![0.1]),
        }]);
        assert!(embedded.as_chunks().is_some());
    }
}
