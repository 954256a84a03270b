//! End-to-end orchestrator scenarios against a real on-disk database and a
//! scripted model client.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use docmill::config::Config;
use docmill::llm::{MockFailureKind, MockModelClient};
use docmill::models::{
    Document, ErrorCode, ExecutionPatch, ExecutionStatus, OpsRequest, ProcessingStatus,
    RequestStatus, RequestType,
};
use docmill::ops::OpsApplier;
use docmill::orchestrator::{Orchestrator, RunOptions};
use docmill::repository::{BatchFilter, Repository};

const DIM: usize = 8;

struct Harness {
    dir: TempDir,
    repo: Repository,
    config: Config,
    models: Arc<MockModelClient>,
}

impl Harness {
    fn new() -> Self {
        Self::with_models(MockModelClient::new(DIM))
    }

    fn with_models(models: MockModelClient) -> Self {
        let dir = TempDir::new().unwrap();
        let repo = Repository::new(&dir.path().join("docmill.db")).unwrap();
        let mut config = Config::default();
        config.processing.embedding_dim = DIM;
        config.processing.retry.base_ms = 1;
        Self {
            dir,
            repo,
            config,
            models: Arc::new(models),
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        Orchestrator::new(
            self.repo.clone(),
            Arc::new(self.config.clone()),
            self.models.clone(),
        )
    }

    fn ingest(&self, name: &str, content: &str) -> Document {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        let doc = Document::new(
            "owner-1".to_string(),
            "household".to_string(),
            "note".to_string(),
            name.to_string(),
            "text/plain".to_string(),
            content.as_bytes(),
            Some(path),
            None,
        );
        self.repo.insert_document(&doc).unwrap();
        doc
    }

    fn apply_ops(&self) {
        OpsApplier::new(self.repo.clone()).apply_pending().unwrap();
    }
}

/// Scenario 1: happy path. One pending document processes to a succeeded
/// execution, an active pointer, contiguous chunks, and clean counters.
#[tokio::test]
async fn happy_path_produces_execution_chunks_and_progress() {
    let harness = Harness::new();
    let doc = harness.ingest("d1.txt", "the document body that will be processed end to end");

    let report = harness
        .orchestrator()
        .run(RunOptions {
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.stats.succeeded, 1);

    let after = harness.repo.get_document(&doc.doc_id).unwrap().unwrap();
    assert_eq!(after.processing_status, ProcessingStatus::Completed);
    let exec_id = after.active_execution_id.expect("active execution set");

    let exec = harness.repo.get_execution(&exec_id).unwrap().unwrap();
    assert_eq!(exec.status, ExecutionStatus::Succeeded);
    assert_eq!(exec.document_id, doc.doc_id);

    // Chunks carry indexes 0..K-1, the producer's id, and vectors.
    let chunks = harness.repo.chunks_for_document(&doc.doc_id).unwrap();
    assert!(!chunks.is_empty());
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64);
        assert_eq!(chunk.execution_id, exec_id);
        assert_eq!(chunk.owner_id, "owner-1");
        assert_eq!(chunk.embedding.as_ref().unwrap().len(), DIM);
    }

    let snapshot = harness.repo.read_progress().unwrap().unwrap();
    assert_eq!(snapshot.success_count, 1);
    assert_eq!(snapshot.error_count, 0);
    assert!(!snapshot.is_processing);
}

/// Scenario 2: transient retry then success. Stage H fails twice with a
/// transient error, succeeds on the third attempt, all inside a single
/// execution row.
#[tokio::test]
async fn transient_retry_succeeds_within_one_execution() {
    let models = MockModelClient::new(DIM);
    models.fail_generates_containing("normalized_text", 2, MockFailureKind::Transient);
    let harness = Harness::with_models(models);
    let doc = harness.ingest("d1.txt", "needs three attempts at structuring");

    let report = harness
        .orchestrator()
        .run(RunOptions {
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.stats.succeeded, 1);
    assert_eq!(report.stats.failed, 0);

    let history = harness.repo.execution_history(&doc.doc_id, 10).unwrap();
    assert_eq!(history.len(), 1, "retries share the execution");
    assert_eq!(history[0].status, ExecutionStatus::Succeeded);
    assert!(history[0].error_code.is_none());
    // Accumulated duration includes the backoff sleeps.
    assert!(history[0].duration_ms.unwrap() >= 0);
}

/// Scenario 3: a permanent failure after a prior success leaves the
/// active pointer and chunks untouched.
#[tokio::test]
async fn permanent_failure_preserves_prior_success() {
    let harness = {
        let mut h = Harness::new();
        // Reuse would short-circuit the second run; this scenario needs
        // the pipeline to actually re-run and fail.
        h.config.processing.reuse_prior_success = false;
        h
    };
    let doc = harness.ingest("d1.txt", "first run succeeds, second fails");

    let report = harness
        .orchestrator()
        .run(RunOptions {
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.stats.succeeded, 1);

    let first = harness
        .repo
        .get_document(&doc.doc_id)
        .unwrap()
        .unwrap()
        .active_execution_id
        .unwrap();
    let first_chunks = harness.repo.chunk_count(&doc.doc_id).unwrap();
    assert!(first_chunks > 0);

    // Re-enqueue via RESET_DOC and force Stage H to refuse permanently.
    harness
        .repo
        .enqueue_ops_request(&OpsRequest::for_document(
            RequestType::ResetDoc,
            &doc.doc_id,
            None,
        ))
        .unwrap();
    harness.apply_ops();
    harness
        .models
        .fail_generates_containing("normalized_text", 100, MockFailureKind::Refusal);

    let report = harness
        .orchestrator()
        .run(RunOptions {
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.stats.failed, 1);

    let after = harness.repo.get_document(&doc.doc_id).unwrap().unwrap();
    assert_eq!(after.processing_status, ProcessingStatus::Failed);
    // Non-destructive: the pointer still names the first success.
    assert_eq!(after.active_execution_id.as_deref(), Some(first.as_str()));
    assert_eq!(harness.repo.chunk_count(&doc.doc_id).unwrap(), first_chunks);

    let history = harness.repo.execution_history(&doc.doc_id, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].status, ExecutionStatus::Failed);
    assert_eq!(history[0].error_code, Some(ErrorCode::ModelOutput));
}

/// Scenario 4: a STOP during a batch halts dispatch, leaves undispatched
/// documents pending, and releases every lease.
#[tokio::test]
async fn stop_during_batch_halts_dispatch_and_releases_leases() {
    let models = MockModelClient::new(DIM).with_latency(Duration::from_millis(300));
    let mut harness = Harness::with_models(models);
    harness.config.processing.max_parallel = 4;
    let harness = harness;

    let docs: Vec<Document> = (0..20)
        .map(|n| harness.ingest(&format!("d{n}.txt"), &format!("document body {n}")))
        .collect();

    // Enqueue the STOP while the batch runs; the in-process applier
    // projects it and the stop watcher closes the gate.
    let repo = harness.repo.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(400)).await;
        repo.enqueue_ops_request(&OpsRequest::global(RequestType::Stop, None))
            .unwrap();
    });

    let report = harness
        .orchestrator()
        .run(RunOptions {
            limit: 20,
            ..Default::default()
        })
        .await
        .unwrap();
    stopper.await.unwrap();

    // Not everything ran; whatever was dispatched reached a terminal state.
    let terminal = report.stats.succeeded + report.stats.failed + report.stats.canceled;
    assert!(report.stats.dispatched < 20, "dispatch halted early");
    assert_eq!(terminal + report.stats.skipped, report.stats.dispatched);

    // Undispatched (and any skipped) documents stayed pending; all leases
    // are gone.
    let pending = harness
        .repo
        .fetch_pending_batch(&BatchFilter::default(), 100)
        .unwrap();
    assert_eq!(
        pending.len(),
        20 - report.stats.dispatched + report.stats.skipped
    );
    assert!(harness.repo.list_leases().unwrap().is_empty());

    // No document is stuck in processing.
    for doc in &docs {
        let status = harness
            .repo
            .get_document(&doc.doc_id)
            .unwrap()
            .unwrap()
            .processing_status;
        assert_ne!(status, ProcessingStatus::Processing);
    }
}

/// Scenario 5: crash recovery. An expired lease is reclaimed by the
/// janitor, the document re-runs, and the orphaned running execution is
/// swept to TRANSIENT_EXHAUSTED.
#[tokio::test]
async fn crash_recovery_reclaims_and_sweeps() {
    let harness = Harness::new();
    let doc = harness.ingest("d3.txt", "the worker died while processing this");

    // Simulate the dead worker: expired lease, doc processing, execution
    // stuck in running.
    harness
        .repo
        .acquire_lease(&doc.doc_id, "worker-that-died", 0)
        .unwrap();
    harness
        .repo
        .update_document_status(
            &doc.doc_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
        )
        .unwrap();
    let stuck = docmill::models::Execution::new(
        doc.doc_id.clone(),
        doc.owner_id.clone(),
        "model".to_string(),
        "prompt".to_string(),
        "input".to_string(),
        "normalized".to_string(),
        None,
    );
    harness.repo.insert_execution(&stuck).unwrap();
    harness
        .repo
        .update_execution(&stuck.execution_id, &ExecutionPatch::started())
        .unwrap();

    // The next run's janitor pass reclaims, then the batch picks it up.
    let report = harness
        .orchestrator()
        .run(RunOptions {
            limit: 5,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(report.stats.succeeded, 1);

    let swept = harness
        .repo
        .get_execution(&stuck.execution_id)
        .unwrap()
        .unwrap();
    assert_eq!(swept.status, ExecutionStatus::Failed);
    assert_eq!(swept.error_code, Some(ErrorCode::TransientExhausted));

    let after = harness.repo.get_document(&doc.doc_id).unwrap().unwrap();
    assert_eq!(after.processing_status, ProcessingStatus::Completed);
    let active = after.active_execution_id.unwrap();
    assert_ne!(active, stuck.execution_id);
}

/// Scenario 6: ops idempotence. Two identical STOPs both apply, the flag
/// is set once, and nothing else changes.
#[tokio::test]
async fn duplicate_stop_requests_are_idempotent() {
    let harness = Harness::new();
    let first = OpsRequest::global(RequestType::Stop, Some("admin".to_string()));
    let second = OpsRequest::global(RequestType::Stop, Some("admin".to_string()));
    harness.repo.enqueue_ops_request(&first).unwrap();
    harness.repo.enqueue_ops_request(&second).unwrap();

    harness.apply_ops();

    for id in [&first.request_id, &second.request_id] {
        let request = harness.repo.get_ops_request(id).unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::Applied);
        assert!(request.applied_at.is_some());
    }
    let state = harness.repo.read_worker_state().unwrap();
    assert!(state.stop_requested);
    assert!(state.paused_workspaces.is_empty());
}

/// Idempotent re-run: identical bytes and routing produce a matching
/// input hash, and the second run short-circuits by reusing the first's
/// result while still writing a new execution row.
#[tokio::test]
async fn idempotent_rerun_short_circuits_with_new_row() {
    let harness = Harness::new();
    let doc = harness.ingest("d1.txt", "same bytes both times");

    let orchestrator = harness.orchestrator();
    orchestrator
        .run(RunOptions {
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();
    let generates_after_first = harness.models.generate_calls();

    harness
        .repo
        .enqueue_ops_request(&OpsRequest::for_document(
            RequestType::ResetDoc,
            &doc.doc_id,
            None,
        ))
        .unwrap();
    harness.apply_ops();

    orchestrator
        .run(RunOptions {
            limit: 1,
            ..Default::default()
        })
        .await
        .unwrap();

    let history = harness.repo.execution_history(&doc.doc_id, 10).unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].input_hash, history[1].input_hash);
    assert_eq!(history[0].status, ExecutionStatus::Succeeded);
    assert_eq!(
        history[0].result.as_ref().unwrap()["reused_from"],
        history[1].execution_id
    );
    // The second run made no model calls.
    assert_eq!(harness.models.generate_calls(), generates_after_first);
}
