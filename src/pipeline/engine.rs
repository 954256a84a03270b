//! Stage engine.
//!
//! Drives one document through the ordered stage list. Owns per-stage
//! wall-clock timeouts, in-stage retry with exponential backoff and
//! jitter, cancellation checks at stage boundaries, persistence of the
//! opaque stage output columns, and progress emission.

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio_util::sync::CancellationToken;

use super::stage::{ChunkDraft, DocView, PriorOutputs, Stage, StageContext, StageOutput};
use super::stages::{
    ChunkingStage, EmbedStage, ExtractStage, FormatStage, StructureStage, SynthesizeStage,
    VisualStage,
};
use super::StageError;
use crate::config::{Config, RetryConfig, RoutingTable};
use crate::llm::{ModelClient, ModelUsage};
use crate::models::{Document, StageId};
use crate::progress::{ProgressEvent, ProgressTx};
use crate::repository::Repository;

/// Result of a full pipeline pass over one document.
#[derive(Debug)]
pub struct EngineOutcome {
    pub outputs: PriorOutputs,
    pub chunks: Vec<ChunkDraft>,
    pub usage: ModelUsage,
}

impl EngineOutcome {
    /// Opaque result payload recorded on the execution row. Embeddings are
    /// excluded; they live in the chunks table.
    pub fn result_payload(&self) -> serde_json::Value {
        let mut stages = serde_json::Map::new();
        for (stage, output) in &self.outputs {
            let value = match output {
                StageOutput::Extracted(a) => serde_json::to_value(a).ok(),
                StageOutput::Visual(a) => serde_json::to_value(a).ok(),
                StageOutput::Formatted(text) => {
                    Some(serde_json::json!({ "chars": text.chars().count() }))
                }
                StageOutput::Structured(a) => serde_json::to_value(a).ok(),
                StageOutput::Synthesis(a) => serde_json::to_value(a).ok(),
                StageOutput::Chunks(_) | StageOutput::Embedded(_) => None,
            };
            if let Some(value) = value {
                stages.insert(stage.as_str().to_string(), value);
            }
        }

        serde_json::json!({
            "stages": stages,
            "chunk_count": self.chunks.len(),
            "usage": self.usage,
        })
    }
}

/// Ordered stage runner.
pub struct StageEngine {
    repo: Repository,
    config: Arc<Config>,
    routing: RoutingTable,
    models: Arc<dyn ModelClient>,
    stages: Vec<Arc<dyn Stage>>,
}

impl StageEngine {
    pub fn new(config: Arc<Config>, models: Arc<dyn ModelClient>, repo: Repository) -> Self {
        let stages: Vec<Arc<dyn Stage>> = vec![
            Arc::new(ExtractStage),
            Arc::new(VisualStage::new()),
            Arc::new(FormatStage::new()),
            Arc::new(StructureStage),
            Arc::new(SynthesizeStage),
            Arc::new(ChunkingStage),
            Arc::new(EmbedStage),
        ];
        let routing = config.routing_table();
        Self {
            repo,
            config,
            routing,
            models,
            stages,
        }
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    /// Run every applicable stage in order for one document.
    pub async fn run_document(
        &self,
        doc: &Document,
        cancel: &CancellationToken,
        progress: &ProgressTx,
    ) -> Result<EngineOutcome, StageError> {
        let bytes = self.read_bytes(doc)?;
        let view = DocView::new(doc, &bytes);
        let usage = Mutex::new(ModelUsage::default());
        let mut outputs = PriorOutputs::new();

        for stage in &self.stages {
            if cancel.is_cancelled() {
                return Err(StageError::Canceled);
            }
            if !stage.applies(&view) {
                tracing::debug!(
                    "Stage {} does not apply to {} ({})",
                    stage.id(),
                    doc.doc_id,
                    doc.mime_type
                );
                continue;
            }

            let ctx = StageContext {
                stage: stage.id(),
                cancel,
                models: self.models.as_ref(),
                route: self
                    .routing
                    .resolve(stage.id(), &doc.workspace, &doc.doc_type),
                chunk_size: self.config.chunk_size_for(&doc.workspace),
                chunk_overlap: self.config.chunk_overlap_for(&doc.workspace),
                embedding_dim: self.config.embedding_dim_for(&doc.workspace),
                max_content_chars: self.config.llm.max_content_chars,
                reprompt_on_bad_output: self.config.processing.reprompt_on_bad_output,
                progress,
                doc_id: doc.doc_id.clone(),
                usage: &usage,
            };

            let output = self
                .run_stage_with_retry(stage.as_ref(), &ctx, &view, &outputs)
                .await?;
            self.persist_stage_output(doc, &output)?;

            let _ = progress
                .send(ProgressEvent::StageCompleted {
                    doc_id: doc.doc_id.clone(),
                    stage: stage.id(),
                    sub_step: None,
                })
                .await;

            outputs.insert(stage.id(), output);
        }

        let chunks = outputs
            .get(&StageId::Embed)
            .and_then(|o| o.as_chunks())
            .map(|c| c.to_vec())
            .unwrap_or_default();
        let usage = usage.into_inner().unwrap_or_default();

        Ok(EngineOutcome {
            outputs,
            chunks,
            usage,
        })
    }

    fn read_bytes(&self, doc: &Document) -> Result<Vec<u8>, StageError> {
        match &doc.file_path {
            Some(path) => std::fs::read(path).map_err(|e| {
                StageError::Validation(format!("cannot read stored file {}: {e}", path.display()))
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Run one stage under its timeout, retrying transient failures with
    /// exponential backoff until the configured attempt cap.
    async fn run_stage_with_retry(
        &self,
        stage: &dyn Stage,
        ctx: &StageContext<'_>,
        view: &DocView<'_>,
        prior: &PriorOutputs,
    ) -> Result<StageOutput, StageError> {
        let retry = &self.config.processing.retry;
        let timeout = self.config.processing.stage_timeouts.for_stage(stage.id());
        let mut attempt = 1u32;

        loop {
            ctx.check_canceled()?;

            let result = match tokio::time::timeout(timeout, stage.run(ctx, view, prior)).await {
                Ok(result) => result,
                Err(_) => Err(StageError::Transient(format!(
                    "stage {} timed out after {}s",
                    stage.id(),
                    timeout.as_secs()
                ))),
            };

            match result {
                Ok(output) => return Ok(output),
                Err(e) if e.is_transient() && attempt < retry.max_attempts => {
                    let delay = backoff_delay(retry, attempt);
                    tracing::debug!(
                        "Stage {} attempt {}/{} failed transiently ({e}); retrying in {:?}",
                        stage.id(),
                        attempt,
                        retry.max_attempts,
                        delay
                    );
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => return Err(StageError::Canceled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Write the document-level artifact column(s) for a completed stage.
    fn persist_stage_output(&self, doc: &Document, output: &StageOutput) -> Result<(), StageError> {
        let internal = |e: crate::repository::RepositoryError| StageError::Internal(e.to_string());
        match output {
            StageOutput::Extracted(a) => {
                self.repo
                    .update_stage_output(&doc.doc_id, "output_extract", &a.consolidated)
                    .map_err(internal)?;
            }
            StageOutput::Visual(a) => {
                let json = serde_json::to_string(a)
                    .map_err(|e| StageError::Internal(e.to_string()))?;
                self.repo
                    .update_stage_output(&doc.doc_id, "output_visual", &json)
                    .map_err(internal)?;
            }
            StageOutput::Formatted(text) => {
                self.repo
                    .update_stage_output(&doc.doc_id, "output_normalized", text)
                    .map_err(internal)?;
            }
            StageOutput::Structured(a) => {
                self.repo
                    .update_stage_output(&doc.doc_id, "output_normalized", &a.normalized_text)
                    .map_err(internal)?;
                self.repo
                    .update_stage_output(
                        &doc.doc_id,
                        "output_structured",
                        &a.structured.to_string(),
                    )
                    .map_err(internal)?;
            }
            StageOutput::Synthesis(a) => {
                let json = serde_json::to_string(a)
                    .map_err(|e| StageError::Internal(e.to_string()))?;
                self.repo
                    .update_stage_output(&doc.doc_id, "output_synthesis", &json)
                    .map_err(internal)?;
            }
            StageOutput::Chunks(_) | StageOutput::Embedded(_) => {}
        }
        Ok(())
    }
}

/// Backoff delay with ±jitter around `base * factor^(attempt-1)`.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let base = retry.base_ms as f64 * retry.factor.powi(attempt.saturating_sub(1) as i32);
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    let unit = (nanos % 1000) as f64 / 1000.0;
    let factor = 1.0 + retry.jitter * (2.0 * unit - 1.0);
    Duration::from_millis((base * factor).max(1.0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockModelClient;
    use crate::models::ChunkType;
    use tempfile::TempDir;

    fn backoff_bounds(attempt: u32) -> (u64, u64) {
        let retry = RetryConfig::default();
        let base = retry.base_ms as f64 * retry.factor.powi(attempt as i32 - 1);
        (
            (base * (1.0 - retry.jitter)) as u64,
            (base * (1.0 + retry.jitter)) as u64 + 1,
        )
    }

    #[test]
    fn test_backoff_grows_with_attempts() {
        let retry = RetryConfig::default();
        for attempt in 1..=3 {
            let delay = backoff_delay(&retry, attempt).as_millis() as u64;
            let (lo, hi) = backoff_bounds(attempt);
            assert!(delay >= lo && delay <= hi, "attempt {attempt}: {delay}ms");
        }
    }

    fn engine_fixture(dim: usize) -> (TempDir, StageEngine, Repository, Arc<MockModelClient>) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::new(&dir.path().join("docmill.db")).unwrap();
        let mut config = Config::default();
        config.processing.embedding_dim = dim;
        config.processing.retry.base_ms = 1; // keep retry sleeps out of tests
        let models = Arc::new(MockModelClient::new(dim));
        let engine = StageEngine::new(Arc::new(config), models.clone(), repo.clone());
        (dir, engine, repo, models)
    }

    fn text_document(dir: &TempDir, repo: &Repository, content: &str) -> Document {
        let path = dir.path().join("note.txt");
        std::fs::write(&path, content).unwrap();
        let doc = Document::new(
            "owner-1".to_string(),
            "household".to_string(),
            "note".to_string(),
            "note.txt".to_string(),
            "text/plain".to_string(),
            content.as_bytes(),
            Some(path),
            None,
        );
        repo.insert_document(&doc).unwrap();
        doc
    }

    #[tokio::test]
    async fn test_full_pipeline_over_text_document() {
        let (dir, engine, repo, models) = engine_fixture(8);
        let doc = text_document(&dir, &repo, "The quick brown fox jumps over the lazy dog.");

        let cancel = CancellationToken::new();
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let outcome = engine.run_document(&doc, &cancel, &tx).await.unwrap();

        // Chunks exist, are indexed from zero, and all carry vectors.
        assert!(!outcome.chunks.is_empty());
        for (i, chunk) in outcome.chunks.iter().enumerate() {
            assert_eq!(chunk.index, i as i64);
            assert_eq!(chunk.embedding.as_ref().unwrap().len(), 8);
        }
        // The summary fragment rides at the end.
        assert_eq!(
            outcome.chunks.last().unwrap().chunk_type,
            ChunkType::Summary
        );

        // Stage columns were persisted.
        let stored = repo.get_document(&doc.doc_id).unwrap().unwrap();
        assert!(stored.stage_outputs.extract.is_some());
        assert!(stored.stage_outputs.normalized.is_some());
        assert!(stored.stage_outputs.structured.is_some());
        assert!(stored.stage_outputs.synthesis.is_some());

        // Progress events were emitted for completed stages.
        drop(tx);
        let mut stage_events = 0;
        while let Some(event) = rx.recv().await {
            if matches!(event, ProgressEvent::StageCompleted { .. }) {
                stage_events += 1;
            }
        }
        assert!(stage_events >= 5);

        // Model usage was accumulated (structure + synthesis calls).
        assert!(outcome.usage.generate_calls >= 3);
        assert!(models.embed_calls() >= 1);

        // Result payload carries the artifact map.
        let payload = outcome.result_payload();
        assert!(payload["stages"]["extract"].is_object());
        assert_eq!(payload["chunk_count"], outcome.chunks.len());
    }

    #[tokio::test]
    async fn test_canceled_before_first_stage() {
        let (dir, engine, repo, _models) = engine_fixture(8);
        let doc = text_document(&dir, &repo, "content");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let err = engine.run_document(&doc, &cancel, &tx).await.unwrap_err();
        assert!(matches!(err, StageError::Canceled));
    }

    #[tokio::test]
    async fn test_transient_model_failure_is_retried_in_stage() {
        let (dir, engine, repo, models) = engine_fixture(8);
        let doc = text_document(&dir, &repo, "retry me please");

        // Fail the structuring call twice; the third attempt succeeds.
        models.fail_generates_containing(
            "normalized_text",
            2,
            crate::llm::MockFailureKind::Transient,
        );

        let cancel = CancellationToken::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let outcome = engine.run_document(&doc, &cancel, &tx).await.unwrap();
        assert!(!outcome.chunks.is_empty());
    }

    #[tokio::test]
    async fn test_transient_exhaustion_fails_the_run() {
        let (dir, engine, repo, models) = engine_fixture(8);
        let doc = text_document(&dir, &repo, "never succeeds");

        models.fail_generates_containing(
            "normalized_text",
            10,
            crate::llm::MockFailureKind::Transient,
        );

        let cancel = CancellationToken::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let err = engine.run_document(&doc, &cancel, &tx).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(
            err.error_code(),
            crate::models::ErrorCode::TransientExhausted
        );
    }

    #[tokio::test]
    async fn test_malformed_json_recovers_via_reprompt() {
        let (dir, engine, repo, models) = engine_fixture(8);
        let doc = text_document(&dir, &repo, "fix the json");

        models.fail_generates_containing(
            "normalized_text",
            1,
            crate::llm::MockFailureKind::MalformedJson,
        );

        let cancel = CancellationToken::new();
        let (tx, _rx) = tokio::sync::mpsc::channel(64);
        let outcome = engine.run_document(&doc, &cancel, &tx).await.unwrap();
        assert!(!outcome.chunks.is_empty());
    }
}
