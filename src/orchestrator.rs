//! Top-level orchestrator.
//!
//! One bounded RUN per invocation: read the worker-state gate, fetch a
//! batch of pending documents filtered by the pause sets, hand them to the
//! worker pool, and finalize counters and the terminal progress snapshot.
//! Long-lived operation is external scheduling of bounded runs; there is
//! no continuous-loop mode.
//!
//! The process hosts a fixed background task set for the duration of a
//! RUN: the resource governor, the ops-request applier, the lease janitor,
//! the progress publisher, and a stop watcher that closes the dispatch
//! gate when a STOP lands mid-batch.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::lease::{Janitor, LeaseManager};
use crate::llm::ModelClient;
use crate::ops::OpsApplier;
use crate::pipeline::StageEngine;
use crate::progress::{ProgressEvent, ProgressPublisher};
use crate::repository::{BatchFilter, Repository};
use crate::store::ExecutionStore;
use crate::workers::{
    BatchStats, GovernorState, ResourceGovernor, ResourceSampler, SystemSampler, WorkerPool,
};

/// How often the applier projects queued requests and the stop watcher
/// re-reads the gate during a RUN.
const CONTROL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Parameters of one bounded RUN.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Maximum documents to process in this run.
    pub limit: usize,
    /// Restrict the batch to one workspace.
    pub workspace: Option<String>,
    /// Process exactly one document.
    pub doc_id: Option<String>,
}

/// Outcome of one bounded RUN.
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Documents fetched into the batch.
    pub fetched: usize,
    pub stats: BatchStats,
    /// The gate was closed before or during dispatch.
    pub gate_closed: bool,
}

/// Top-level loop, one per process.
pub struct Orchestrator {
    repo: Repository,
    config: Arc<Config>,
    models: Arc<dyn ModelClient>,
    sampler: std::sync::Mutex<Option<Box<dyn ResourceSampler>>>,
}

impl Orchestrator {
    pub fn new(repo: Repository, config: Arc<Config>, models: Arc<dyn ModelClient>) -> Self {
        Self {
            repo,
            config,
            models,
            sampler: std::sync::Mutex::new(None),
        }
    }

    /// Inject a sampler for the next RUN (tests use a scripted one).
    pub fn with_sampler(self, sampler: Box<dyn ResourceSampler>) -> Self {
        *self
            .sampler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(sampler);
        self
    }

    /// Execute one bounded RUN.
    pub async fn run(&self, opts: RunOptions) -> anyhow::Result<RunReport> {
        let processing = &self.config.processing;
        let root_cancel = CancellationToken::new();

        // Progress publisher.
        let (publisher, progress_tx) = ProgressPublisher::new(
            self.repo.clone(),
            processing.progress_interval_ms,
            processing.max_parallel,
        );
        let publisher_handle = tokio::spawn(publisher.run());

        // Resource governor.
        let governor_state = GovernorState::new(processing.max_parallel.min(processing.hard_cap));
        let sampler = self
            .sampler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
            .unwrap_or_else(|| Box::new(SystemSampler::new()));
        let governor = ResourceGovernor::new(
            governor_state.clone(),
            processing.clone(),
            sampler,
            progress_tx.clone(),
        );
        let governor_handle = tokio::spawn(governor.run(root_cancel.child_token()));

        // Ops applier: one synchronous pass up front so a STOP enqueued
        // before this RUN gates it, then periodic projection.
        let applier = OpsApplier::new(self.repo.clone());
        applier.apply_pending()?;
        let applier_handle = tokio::spawn(
            applier
                .clone()
                .run(CONTROL_POLL_INTERVAL, root_cancel.child_token()),
        );

        // Lease janitor: reclaim crashed workers before fetching, then
        // keep sweeping at the heartbeat cadence.
        let janitor = Janitor::new(self.repo.clone());
        janitor.tick()?;
        let janitor_handle = tokio::spawn(
            janitor
                .clone()
                .run(processing.heartbeat_interval(), root_cancel.child_token()),
        );

        let report = self
            .dispatch(&opts, &root_cancel, &governor_state, &progress_tx)
            .await;

        // Tear down the background set and flush the terminal snapshot.
        let _ = progress_tx.send(ProgressEvent::RunFinished).await;
        drop(progress_tx);
        root_cancel.cancel();
        let _ = governor_handle.await;
        let _ = applier_handle.await;
        let _ = janitor_handle.await;
        let _ = publisher_handle.await;

        report
    }

    async fn dispatch(
        &self,
        opts: &RunOptions,
        root_cancel: &CancellationToken,
        governor_state: &Arc<GovernorState>,
        progress_tx: &crate::progress::ProgressTx,
    ) -> anyhow::Result<RunReport> {
        let state = self.repo.read_worker_state()?;
        if state.stop_requested {
            tracing::info!("Stop requested; gate closed, not dispatching");
            return Ok(RunReport {
                gate_closed: true,
                ..Default::default()
            });
        }

        let filter = BatchFilter {
            workspace: opts.workspace.clone(),
            doc_ids: opts.doc_id.clone().map(|id| vec![id]),
            exclude_workspaces: state.paused_workspaces.iter().cloned().collect(),
            exclude_documents: state.paused_documents.iter().cloned().collect(),
        };
        let limit = if opts.doc_id.is_some() {
            1
        } else {
            opts.limit.max(1)
        };
        let docs = self.repo.fetch_pending_batch(&filter, limit)?;
        let fetched = docs.len();
        tracing::info!("Fetched {fetched} pending documents (limit {limit})");

        let run_id = uuid::Uuid::new_v4().to_string();
        self.repo.record_run_started(
            &run_id,
            Some("process"),
            Some(&serde_json::json!({
                "limit": opts.limit,
                "workspace": opts.workspace,
                "doc_id": opts.doc_id,
            })),
        )?;
        let _ = progress_tx
            .send(ProgressEvent::RunStarted { total: fetched })
            .await;

        // Stop watcher: a STOP applied mid-batch closes the dispatch gate
        // and cancels in-flight tasks at their next stage boundary.
        let pool_cancel = root_cancel.child_token();
        let watcher_handle = tokio::spawn(stop_watcher(
            self.repo.clone(),
            pool_cancel.clone(),
        ));

        let engine = Arc::new(StageEngine::new(
            self.config.clone(),
            self.models.clone(),
            self.repo.clone(),
        ));
        let pool = WorkerPool::new(
            self.repo.clone(),
            ExecutionStore::new(self.repo.clone()),
            engine,
            LeaseManager::new(self.repo.clone(), &self.config.processing),
            governor_state.clone(),
            progress_tx.clone(),
            self.config.clone(),
            pool_cancel.clone(),
        );
        let stats = pool.run_batch(docs).await;

        watcher_handle.abort();
        let gate_closed = pool_cancel.is_cancelled();

        self.repo.record_run_finished(
            &run_id,
            stats.succeeded as u64,
            (stats.failed + stats.canceled) as u64,
        )?;

        Ok(RunReport {
            fetched,
            stats,
            gate_closed,
        })
    }
}

/// Poll the worker-state gate and close the pool's token on stop.
async fn stop_watcher(repo: Repository, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        if cancel.is_cancelled() {
            break;
        }
        match repo.read_worker_state() {
            Ok(state) if state.stop_requested => {
                tracing::info!("Stop observed mid-run; closing dispatch gate");
                cancel.cancel();
                break;
            }
            Ok(_) => {}
            Err(e) => tracing::debug!("Stop watcher read failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::MockModelClient;
    use crate::models::{Document, OpsRequest, ProcessingStatus, RequestType};
    use tempfile::TempDir;

    fn fixture() -> (TempDir, Repository, Orchestrator) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::new(&dir.path().join("docmill.db")).unwrap();
        let mut config = Config::default();
        config.processing.embedding_dim = 8;
        config.processing.retry.base_ms = 1;
        let models = Arc::new(MockModelClient::new(8));
        let orchestrator = Orchestrator::new(repo.clone(), Arc::new(config), models);
        (dir, repo, orchestrator)
    }

    fn seed_doc(dir: &TempDir, repo: &Repository, workspace: &str, n: usize) -> Document {
        let path = dir.path().join(format!("{workspace}-{n}.txt"));
        let content = format!("text for {workspace} number {n}");
        std::fs::write(&path, &content).unwrap();
        let doc = Document::new(
            "owner-1".to_string(),
            workspace.to_string(),
            "note".to_string(),
            format!("{workspace}-{n}.txt"),
            "text/plain".to_string(),
            content.as_bytes(),
            Some(path),
            None,
        );
        repo.insert_document(&doc).unwrap();
        doc
    }

    #[tokio::test]
    async fn test_bounded_run_processes_batch() {
        let (dir, repo, orchestrator) = fixture();
        for n in 0..3 {
            seed_doc(&dir, &repo, "household", n);
        }

        let report = orchestrator
            .run(RunOptions {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.fetched, 3);
        assert_eq!(report.stats.succeeded, 3);
        assert!(!report.gate_closed);

        let snapshot = repo.read_progress().unwrap().unwrap();
        assert_eq!(snapshot.success_count, 3);
        assert!(!snapshot.is_processing);
    }

    #[tokio::test]
    async fn test_stop_before_run_closes_gate() {
        let (dir, repo, orchestrator) = fixture();
        seed_doc(&dir, &repo, "household", 0);
        repo.enqueue_ops_request(&OpsRequest::global(RequestType::Stop, None))
            .unwrap();

        let report = orchestrator
            .run(RunOptions {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        assert!(report.gate_closed);
        assert_eq!(report.fetched, 0);
        // Document untouched.
        let docs = repo
            .fetch_pending_batch(&BatchFilter::default(), 10)
            .unwrap();
        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn test_paused_workspace_is_excluded() {
        let (dir, repo, orchestrator) = fixture();
        seed_doc(&dir, &repo, "household", 0);
        seed_doc(&dir, &repo, "classroom", 0);
        repo.enqueue_ops_request(&OpsRequest::for_workspace(
            RequestType::Pause,
            "classroom",
            None,
        ))
        .unwrap();

        let report = orchestrator
            .run(RunOptions {
                limit: 10,
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.fetched, 1);
        assert_eq!(report.stats.succeeded, 1);

        // The classroom document is still pending.
        let remaining = repo
            .fetch_pending_batch(&BatchFilter::default(), 10)
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].workspace, "classroom");
    }

    #[tokio::test]
    async fn test_single_document_mode() {
        let (dir, repo, orchestrator) = fixture();
        let target = seed_doc(&dir, &repo, "household", 0);
        seed_doc(&dir, &repo, "household", 1);

        let report = orchestrator
            .run(RunOptions {
                limit: 10,
                doc_id: Some(target.doc_id.clone()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(report.fetched, 1);
        let after = repo.get_document(&target.doc_id).unwrap().unwrap();
        assert_eq!(after.processing_status, ProcessingStatus::Completed);
    }
}
