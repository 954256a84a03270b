//! Invariant tests over the public orchestrator surface.

use std::sync::Arc;

use tempfile::TempDir;

use docmill::config::{Config, ProcessingConfig};
use docmill::llm::MockModelClient;
use docmill::models::{
    Chunk, ChunkType, Document, ExecutionPatch, ExecutionStatus, OpsRequest, RequestType,
};
use docmill::orchestrator::{Orchestrator, RunOptions};
use docmill::repository::{Repository, RepositoryError};
use docmill::store::{ExecutionStore, RunOutcome};
use docmill::workers::{GovernorState, ResourceGovernor, ScriptedSampler};

const DIM: usize = 8;

fn repo_in(dir: &TempDir) -> Repository {
    Repository::new(&dir.path().join("docmill.db")).unwrap()
}

fn seed_doc(dir: &TempDir, repo: &Repository, name: &str, content: &str) -> Document {
    let path = dir.path().join(name);
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
    repo.insert_document(&doc).unwrap();
    doc
}

fn small_config() -> Config {
    let mut config = Config::default();
    config.processing.embedding_dim = DIM;
    config.processing.retry.base_ms = 1;
    config
}

/// Single writer: two orchestrators racing over one pending document
/// produce exactly one execution; the loser treats the document as taken.
#[tokio::test]
async fn single_writer_under_contention() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir);
    let doc = seed_doc(&dir, &repo, "contested.txt", "both runners want this");

    let config = Arc::new(small_config());
    let a = Orchestrator::new(
        repo.clone(),
        config.clone(),
        Arc::new(MockModelClient::new(DIM).with_latency(std::time::Duration::from_millis(50))),
    );
    let b = Orchestrator::new(
        repo.clone(),
        config.clone(),
        Arc::new(MockModelClient::new(DIM).with_latency(std::time::Duration::from_millis(50))),
    );

    let opts = RunOptions {
        limit: 1,
        ..Default::default()
    };
    let (ra, rb) = tokio::join!(a.run(opts.clone()), b.run(opts));
    let (ra, rb) = (ra.unwrap(), rb.unwrap());

    // Exactly one processed it; the other saw it taken or found nothing
    // pending.
    assert_eq!(ra.stats.succeeded + rb.stats.succeeded, 1);

    let history = repo.execution_history(&doc.doc_id, 10).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].status, ExecutionStatus::Succeeded);
    assert!(repo.list_leases().unwrap().is_empty());
}

/// Monotonic executions: observed status sequences are prefixes of
/// queued → running → terminal; every backward patch is refused.
#[test]
fn executions_only_move_forward() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir);
    let doc = seed_doc(&dir, &repo, "d.txt", "x");
    let store = ExecutionStore::new(repo.clone());

    let exec = store.create_run(&doc, "m", "p", None).unwrap();
    store.start_run(&exec.execution_id).unwrap();
    store
        .finish_run(
            &exec,
            RunOutcome::Failed {
                code: docmill::models::ErrorCode::Validation,
                message: "bad".to_string(),
            },
        )
        .unwrap();

    // Terminal is terminal: no re-running, no re-finishing.
    assert!(repo
        .update_execution(&exec.execution_id, &ExecutionPatch::started())
        .is_err());
    assert!(store
        .finish_run(
            &exec,
            RunOutcome::Succeeded {
                result: serde_json::json!({}),
                chunks: Vec::new(),
            },
        )
        .is_err());
}

/// Active pointer discipline: the pointer can only name a succeeded
/// execution of the same document.
#[test]
fn active_pointer_requires_succeeded_same_document() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir);
    let doc_a = seed_doc(&dir, &repo, "a.txt", "a");
    let doc_b = seed_doc(&dir, &repo, "b.txt", "b");
    let store = ExecutionStore::new(repo.clone());

    // Queued execution cannot be the active pointer.
    let queued = store.create_run(&doc_a, "m", "p", None).unwrap();
    assert!(repo
        .set_active_execution(&doc_a.doc_id, &queued.execution_id)
        .is_err());

    // A succeeded execution of another document cannot either.
    let exec_b = store.create_run(&doc_b, "m", "p", None).unwrap();
    store.start_run(&exec_b.execution_id).unwrap();
    store
        .finish_run(
            &exec_b,
            RunOutcome::Succeeded {
                result: serde_json::json!({}),
                chunks: Vec::new(),
            },
        )
        .unwrap();
    let err = repo
        .set_active_execution(&doc_a.doc_id, &exec_b.execution_id)
        .unwrap_err();
    assert!(matches!(err, RepositoryError::DataIntegrity(_)));
}

/// Owner propagation: chunk and execution writes that break the owner
/// chain are refused before any row changes.
#[test]
fn owner_propagation_is_enforced() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir);
    let doc = seed_doc(&dir, &repo, "d.txt", "x");
    let store = ExecutionStore::new(repo.clone());
    let exec = store.create_run(&doc, "m", "p", None).unwrap();

    let mut chunk = Chunk::new(
        doc.doc_id.clone(),
        exec.execution_id.clone(),
        doc.owner_id.clone(),
        0,
        "text".to_string(),
        ChunkType::Body,
    );
    chunk.owner_id = "intruder".to_string();

    let err = repo
        .replace_chunks(&doc.doc_id, &exec.execution_id, &[chunk])
        .unwrap_err();
    assert!(matches!(err, RepositoryError::OwnerMismatch(_)));
    assert_eq!(repo.chunk_count(&doc.doc_id).unwrap(), 0);
}

/// Chunk replacement atomicity: a bad set leaves the previous set fully
/// intact; a good set lands contiguous and complete.
#[test]
fn chunk_replacement_is_all_or_nothing() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir);
    let doc = seed_doc(&dir, &repo, "d.txt", "x");
    let store = ExecutionStore::new(repo.clone());
    let exec = store.create_run(&doc, "m", "p", None).unwrap();
    store.start_run(&exec.execution_id).unwrap();

    let good: Vec<Chunk> = (0..4)
        .map(|i| {
            Chunk::new(
                doc.doc_id.clone(),
                exec.execution_id.clone(),
                doc.owner_id.clone(),
                i,
                format!("chunk {i}"),
                ChunkType::Body,
            )
        })
        .collect();
    store
        .finish_run(
            &exec,
            RunOutcome::Succeeded {
                result: serde_json::json!({}),
                chunks: good,
            },
        )
        .unwrap();

    // A replacement with a gap is rejected wholesale.
    let holey: Vec<Chunk> = [0i64, 1, 3]
        .iter()
        .map(|&i| {
            Chunk::new(
                doc.doc_id.clone(),
                exec.execution_id.clone(),
                doc.owner_id.clone(),
                i,
                format!("new {i}"),
                ChunkType::Body,
            )
        })
        .collect();
    assert!(repo
        .replace_chunks(&doc.doc_id, &exec.execution_id, &holey)
        .is_err());

    let chunks = repo.chunks_for_document(&doc.doc_id).unwrap();
    assert_eq!(chunks.len(), 4);
    for (i, chunk) in chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, i as i64);
        assert_eq!(chunk.chunk_text, format!("chunk {i}"));
    }
}

/// Ops-request monotonicity: terminal rows never return to queued, even
/// via raw SQL; applied_at is stamped by the database itself.
#[test]
fn ops_requests_never_go_backward() {
    let dir = TempDir::new().unwrap();
    let repo = repo_in(&dir);
    let request = OpsRequest::global(RequestType::Stop, None);
    repo.enqueue_ops_request(&request).unwrap();
    repo.mark_ops_request_applied(&request.request_id).unwrap();

    let applied = repo.get_ops_request(&request.request_id).unwrap().unwrap();
    assert!(applied.applied_at.is_some());

    // Straight to the database, around the repository API: the trigger
    // still refuses the backward transition.
    let conn = rusqlite::Connection::open(dir.path().join("docmill.db")).unwrap();
    let result = conn.execute(
        "UPDATE ops_requests SET status = 'queued' WHERE request_id = ?",
        rusqlite::params![request.request_id],
    );
    assert!(result.is_err());
}

/// Resource reactivity: sustained high memory walks the width down to the
/// floor; recovery walks it back to the configured width; never both in
/// one sample.
#[tokio::test]
async fn governor_reacts_to_memory_pressure() {
    let config = ProcessingConfig {
        max_parallel: 4,
        floor: 1,
        embedding_dim: DIM,
        ..Default::default()
    };
    let state = GovernorState::new(config.max_parallel);
    let (tx, _rx) = tokio::sync::mpsc::channel(256);
    let script = vec![0.90, 0.90, 0.90, 0.90, 0.60, 0.60, 0.60, 0.60];
    let mut governor = ResourceGovernor::new(
        state.clone(),
        config,
        Box::new(ScriptedSampler::new(script)),
        tx,
    );

    let mut widths = vec![state.max_parallel()];
    for _ in 0..8 {
        governor.tick().await;
        widths.push(state.max_parallel());
    }

    // Phase one strictly decreases until the floor, then holds.
    assert_eq!(&widths[..5], &[4, 3, 2, 1, 1]);
    // Phase two strictly increases until the cap, then holds.
    assert_eq!(&widths[5..], &[2, 3, 4, 4]);
    // Every step moved by at most one.
    for pair in widths.windows(2) {
        assert!(pair[0].abs_diff(pair[1]) <= 1);
    }
}
