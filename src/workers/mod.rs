//! Worker pool.
//!
//! A bounded set of concurrent document tasks. The dispatch width is the
//! governor's reactive `max_parallel`; a throttle delay is inserted
//! between dispatches under memory pressure. Each task claims the
//! document's lease, drives the stage engine, and records the terminal
//! execution. A panic in one task never takes down its siblings: the
//! execution is failed with `INTERNAL_PANIC` and the lease released.

mod governor;
mod sampler;

pub use governor::{GovernorState, ResourceGovernor};
pub use sampler::{ResourceSample, ResourceSampler, ScriptedSampler, SystemSampler};

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::lease::LeaseManager;
use crate::models::{Chunk, Document, ErrorCode, Execution, ProcessingStatus, StageId};
use crate::pipeline::{StageEngine, StageError};
use crate::progress::{ProgressEvent, ProgressTx};
use crate::repository::Repository;
use crate::store::{ExecutionStore, RunOutcome};

/// Counters for one batch dispatched through the pool.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchStats {
    pub dispatched: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub canceled: usize,
    pub skipped: usize,
}

/// How one task resolved.
#[derive(Debug, Clone)]
enum TaskResolution {
    Succeeded { reused: bool },
    Failed(String),
    Canceled,
    Skipped,
}

/// Bounded, cancellation-aware document pool.
pub struct WorkerPool {
    repo: Repository,
    store: ExecutionStore,
    engine: Arc<StageEngine>,
    leases: LeaseManager,
    governor: Arc<GovernorState>,
    progress: ProgressTx,
    config: Arc<Config>,
    cancel: CancellationToken,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        repo: Repository,
        store: ExecutionStore,
        engine: Arc<StageEngine>,
        leases: LeaseManager,
        governor: Arc<GovernorState>,
        progress: ProgressTx,
        config: Arc<Config>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            repo,
            store,
            engine,
            leases,
            governor,
            progress,
            config,
            cancel,
        }
    }

    /// Dispatch a batch of documents, one task per document, respecting
    /// the reactive width and throttle. Returns when every dispatched task
    /// reached a terminal state.
    pub async fn run_batch(&self, docs: Vec<Document>) -> BatchStats {
        let mut stats = BatchStats::default();
        let mut join_set: JoinSet<TaskResolution> = JoinSet::new();

        for (position, doc) in docs.into_iter().enumerate() {
            // Wait for a slot under the current reactive width.
            while join_set.len() >= self.governor.max_parallel().max(1) as usize {
                if let Some(result) = join_set.join_next().await {
                    absorb(result, &mut stats);
                }
            }

            if self.cancel.is_cancelled() {
                tracing::info!("Dispatch gate closed; leaving remaining documents pending");
                break;
            }

            let throttle = self.governor.throttle_delay();
            if !throttle.is_zero() {
                tokio::select! {
                    _ = self.cancel.cancelled() => break,
                    _ = tokio::time::sleep(throttle) => {}
                }
            }

            let _ = self
                .progress
                .send(ProgressEvent::DocStarted {
                    index: position + 1,
                    doc_id: doc.doc_id.clone(),
                    file_name: doc.file_name.clone(),
                })
                .await;
            stats.dispatched += 1;

            let task = DocumentTask {
                repo: self.repo.clone(),
                store: self.store.clone(),
                engine: self.engine.clone(),
                leases: self.leases.clone(),
                progress: self.progress.clone(),
                config: self.config.clone(),
            };
            let cancel = self.cancel.child_token();
            join_set.spawn(async move { task.run(doc, cancel).await });
        }

        while let Some(result) = join_set.join_next().await {
            absorb(result, &mut stats);
        }
        stats
    }
}

fn absorb(
    result: Result<TaskResolution, tokio::task::JoinError>,
    stats: &mut BatchStats,
) {
    match result {
        Ok(TaskResolution::Succeeded { .. }) => stats.succeeded += 1,
        Ok(TaskResolution::Failed(_)) => stats.failed += 1,
        Ok(TaskResolution::Canceled) => stats.canceled += 1,
        Ok(TaskResolution::Skipped) => stats.skipped += 1,
        Err(e) => {
            // catch_unwind inside the task makes this unreachable short of
            // an abort; account it as a failure either way.
            tracing::error!("Worker task join error: {e}");
            stats.failed += 1;
        }
    }
}

/// One document's journey through lease, engine, and execution store.
struct DocumentTask {
    repo: Repository,
    store: ExecutionStore,
    engine: Arc<StageEngine>,
    leases: LeaseManager,
    progress: ProgressTx,
    config: Arc<Config>,
}

impl DocumentTask {
    async fn run(self, doc: Document, cancel: CancellationToken) -> TaskResolution {
        let guard = match self.leases.try_claim(&doc) {
            Ok(Some(guard)) => guard,
            Ok(None) => {
                tracing::debug!("Document {} is taken; skipping", doc.doc_id);
                let _ = self
                    .progress
                    .send(ProgressEvent::DocSkipped {
                        doc_id: doc.doc_id.clone(),
                    })
                    .await;
                return TaskResolution::Skipped;
            }
            Err(e) => {
                tracing::warn!("Lease acquisition failed for {}: {e}", doc.doc_id);
                let _ = self
                    .progress
                    .send(ProgressEvent::DocSkipped {
                        doc_id: doc.doc_id.clone(),
                    })
                    .await;
                return TaskResolution::Skipped;
            }
        };

        // Track the created execution so a panic can still fail it.
        let exec_slot: Arc<Mutex<Option<Execution>>> = Arc::new(Mutex::new(None));
        let resolution = match AssertUnwindSafe(self.execute(&doc, &cancel, &exec_slot))
            .catch_unwind()
            .await
        {
            Ok(resolution) => resolution,
            Err(_) => {
                tracing::error!("Worker panicked while processing {}", doc.doc_id);
                let exec = exec_slot
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .take();
                if let Some(exec) = exec {
                    let _ = self.store.finish_run(
                        &exec,
                        RunOutcome::Failed {
                            code: ErrorCode::InternalPanic,
                            message: "worker task panicked".to_string(),
                        },
                    );
                }
                TaskResolution::Failed("worker task panicked".to_string())
            }
        };

        let (final_status, success, error) = match &resolution {
            TaskResolution::Succeeded { reused } => {
                if *reused {
                    tracing::debug!("Document {} completed via prior-success reuse", doc.doc_id);
                }
                (ProcessingStatus::Completed, true, None)
            }
            TaskResolution::Failed(message) => {
                (ProcessingStatus::Failed, false, Some(message.clone()))
            }
            TaskResolution::Canceled => (ProcessingStatus::Canceled, false, None),
            // Unreachable: skips return before the lease is held.
            TaskResolution::Skipped => (ProcessingStatus::Pending, false, None),
        };

        if let Err(e) = guard.release(final_status).await {
            tracing::warn!("Lease release failed for {}: {e}", doc.doc_id);
        }
        let _ = self
            .progress
            .send(ProgressEvent::DocFinished {
                doc_id: doc.doc_id.clone(),
                success,
                error,
            })
            .await;
        resolution
    }

    async fn execute(
        &self,
        doc: &Document,
        cancel: &CancellationToken,
        exec_slot: &Arc<Mutex<Option<Execution>>>,
    ) -> TaskResolution {
        let routing = self.engine.routing();
        let model_version = routing
            .resolve(StageId::Structure, &doc.workspace, &doc.doc_type)
            .model_id;
        let prompt_hash = routing.prompt_fingerprint(&doc.workspace, &doc.doc_type);

        let exec = match self.store.create_run(doc, &model_version, &prompt_hash, None) {
            Ok(exec) => exec,
            Err(e) => {
                tracing::warn!("Could not create execution for {}: {e}", doc.doc_id);
                return TaskResolution::Failed(e.to_string());
            }
        };
        *exec_slot.lock().unwrap_or_else(|p| p.into_inner()) = Some(exec.clone());

        // Idempotent re-run: short-circuit by copying the prior success
        // into a fresh execution row, preserving history.
        if self.config.processing.reuse_prior_success {
            match self.store.find_prior_success(&doc.doc_id, &exec.input_hash) {
                Ok(Some(prior)) => return self.reuse_prior(doc, &exec, &prior).await,
                Ok(None) => {}
                Err(e) => tracing::warn!("Prior-success lookup failed for {}: {e}", doc.doc_id),
            }
        }

        if let Err(e) = self.store.start_run(&exec.execution_id) {
            return TaskResolution::Failed(e.to_string());
        }

        match self.engine.run_document(doc, cancel, &self.progress).await {
            Ok(outcome) => {
                let result = outcome.result_payload();
                let chunks: Vec<Chunk> = outcome
                    .chunks
                    .iter()
                    .map(|draft| Chunk {
                        chunk_id: uuid::Uuid::new_v4().to_string(),
                        document_id: doc.doc_id.clone(),
                        execution_id: exec.execution_id.clone(),
                        owner_id: doc.owner_id.clone(),
                        chunk_index: draft.index,
                        chunk_text: draft.text.clone(),
                        chunk_type: draft.chunk_type,
                        embedding: draft.embedding.clone(),
                    })
                    .collect();

                match self
                    .store
                    .finish_run(&exec, RunOutcome::Succeeded { result, chunks })
                {
                    Ok(()) => TaskResolution::Succeeded { reused: false },
                    Err(e) => {
                        tracing::error!("Recording success failed for {}: {e}", doc.doc_id);
                        let _ = self.store.finish_run(
                            &exec,
                            RunOutcome::Failed {
                                code: ErrorCode::DataIntegrity,
                                message: e.to_string(),
                            },
                        );
                        TaskResolution::Failed(e.to_string())
                    }
                }
            }
            Err(StageError::Canceled) => {
                let _ = self.store.finish_run(&exec, RunOutcome::Canceled);
                TaskResolution::Canceled
            }
            Err(stage_err) => {
                let message = stage_err.to_string();
                let _ = self.store.finish_run(
                    &exec,
                    RunOutcome::Failed {
                        code: stage_err.error_code(),
                        message: message.clone(),
                    },
                );
                TaskResolution::Failed(message)
            }
        }
    }

    /// Record a re-use event: a fresh succeeded execution carrying the
    /// prior result, with the chunk set re-stamped to the new producer.
    async fn reuse_prior(
        &self,
        doc: &Document,
        exec: &Execution,
        prior: &Execution,
    ) -> TaskResolution {
        tracing::info!(
            "Reusing prior success {} for {} (matching input hash)",
            prior.execution_id,
            doc.doc_id
        );

        if let Err(e) = self.store.start_run(&exec.execution_id) {
            return TaskResolution::Failed(e.to_string());
        }

        let prior_chunks = match self.repo.chunks_for_document(&doc.doc_id) {
            Ok(chunks) => chunks,
            Err(e) => return TaskResolution::Failed(e.to_string()),
        };
        let chunks: Vec<Chunk> = prior_chunks
            .into_iter()
            .map(|chunk| Chunk {
                chunk_id: uuid::Uuid::new_v4().to_string(),
                execution_id: exec.execution_id.clone(),
                ..chunk
            })
            .collect();

        let result = serde_json::json!({
            "reused_from": prior.execution_id,
            "result": prior.result,
        });
        match self
            .store
            .finish_run(exec, RunOutcome::Succeeded { result, chunks })
        {
            Ok(()) => TaskResolution::Succeeded { reused: true },
            Err(e) => TaskResolution::Failed(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockModelClient;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        repo: Repository,
        pool: WorkerPool,
        cancel: CancellationToken,
        _rx: tokio::sync::mpsc::Receiver<ProgressEvent>,
    }

    fn fixture(max_parallel: u32) -> Fixture {
        let dir = TempDir::new().unwrap();
        let repo = Repository::new(&dir.path().join("docmill.db")).unwrap();
        let mut config = Config::default();
        config.processing.max_parallel = max_parallel;
        config.processing.embedding_dim = 8;
        config.processing.retry.base_ms = 1;
        let config = Arc::new(config);

        let models = Arc::new(MockModelClient::new(8));
        let engine = Arc::new(StageEngine::new(config.clone(), models, repo.clone()));
        let store = ExecutionStore::new(repo.clone());
        let leases = LeaseManager::new(repo.clone(), &config.processing);
        let governor = GovernorState::new(max_parallel);
        let (tx, rx) = tokio::sync::mpsc::channel(1024);
        let cancel = CancellationToken::new();
        let pool = WorkerPool::new(
            repo.clone(),
            store,
            engine,
            leases,
            governor,
            tx,
            config,
            cancel.clone(),
        );
        Fixture {
            _dir: dir,
            repo,
            pool,
            cancel,
            _rx: rx,
        }
    }

    fn seed_doc(fixture: &Fixture, n: usize) -> Document {
        let path = fixture._dir.path().join(format!("doc-{n}.txt"));
        let content = format!("document number {n} with some body text to process");
        std::fs::write(&path, &content).unwrap();
        let doc = Document::new(
            "owner-1".to_string(),
            "household".to_string(),
            "note".to_string(),
            format!("doc-{n}.txt"),
            "text/plain".to_string(),
            content.as_bytes(),
            Some(path),
            None,
        );
        fixture.repo.insert_document(&doc).unwrap();
        doc
    }

    #[tokio::test]
    async fn test_batch_processes_all_documents() {
        let fixture = fixture(2);
        let docs: Vec<Document> = (0..4).map(|n| seed_doc(&fixture, n)).collect();

        let stats = fixture.pool.run_batch(docs.clone()).await;
        assert_eq!(stats.dispatched, 4);
        assert_eq!(stats.succeeded, 4);
        assert_eq!(stats.failed, 0);

        for doc in &docs {
            let after = fixture.repo.get_document(&doc.doc_id).unwrap().unwrap();
            assert_eq!(after.processing_status, ProcessingStatus::Completed);
            assert!(after.active_execution_id.is_some());
            assert!(fixture.repo.chunk_count(&doc.doc_id).unwrap() > 0);
            // All leases are gone.
            assert!(fixture.repo.get_lease(&doc.doc_id).unwrap().is_none());
        }
    }

    #[tokio::test]
    async fn test_cancel_before_dispatch_leaves_pending() {
        let fixture = fixture(2);
        let docs: Vec<Document> = (0..3).map(|n| seed_doc(&fixture, n)).collect();

        fixture.cancel.cancel();
        let stats = fixture.pool.run_batch(docs.clone()).await;
        assert_eq!(stats.dispatched, 0);

        for doc in &docs {
            let after = fixture.repo.get_document(&doc.doc_id).unwrap().unwrap();
            assert_eq!(after.processing_status, ProcessingStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_reuse_creates_new_execution_row() {
        let fixture = fixture(1);
        let doc = seed_doc(&fixture, 0);

        // First pass processes for real.
        let stats = fixture.pool.run_batch(vec![doc.clone()]).await;
        assert_eq!(stats.succeeded, 1);
        let first_exec = fixture
            .repo
            .get_document(&doc.doc_id)
            .unwrap()
            .unwrap()
            .active_execution_id
            .unwrap();

        // Reset and run again: same bytes, same routing -> reuse.
        fixture
            .repo
            .update_document_status(
                &doc.doc_id,
                ProcessingStatus::Completed,
                ProcessingStatus::Pending,
            )
            .unwrap();
        let doc_again = fixture.repo.get_document(&doc.doc_id).unwrap().unwrap();
        let stats = fixture.pool.run_batch(vec![doc_again]).await;
        assert_eq!(stats.succeeded, 1);

        let history = fixture.repo.execution_history(&doc.doc_id, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].input_hash, history[1].input_hash);

        let second_exec = &history[0];
        assert_ne!(second_exec.execution_id, first_exec);
        // The new row records the reuse.
        let result = second_exec.result.as_ref().unwrap();
        assert_eq!(result["reused_from"], first_exec);

        // Chunks were re-stamped to the new execution.
        let chunks = fixture.repo.chunks_for_document(&doc.doc_id).unwrap();
        assert!(chunks
            .iter()
            .all(|c| c.execution_id == second_exec.execution_id));
    }

    #[tokio::test]
    async fn test_taken_document_is_skipped() {
        let fixture = fixture(1);
        let doc = seed_doc(&fixture, 0);
        // Another worker holds the lease.
        fixture
            .repo
            .acquire_lease(&doc.doc_id, "other-worker", 300)
            .unwrap();

        let stats = fixture.pool.run_batch(vec![doc.clone()]).await;
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.succeeded, 0);

        // The foreign lease is untouched.
        let lease = fixture.repo.get_lease(&doc.doc_id).unwrap().unwrap();
        assert_eq!(lease.worker_id, "other-worker");
    }
}
