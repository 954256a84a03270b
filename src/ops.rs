//! Ops-request applier.
//!
//! The single component authorized to transition `ops_requests` out of
//! `queued` and to write `worker_state`. Requests are interpreted in
//! creation order; workers never write either table, so a stop cannot be
//! undone by a race.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::models::{
    OpsRequest, ProcessingStatus, RequestType, RunPayload, ScopeType, WorkerState,
};
use crate::repository::{Repository, RepositoryError, Result};

/// Counters from one applier pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AppliedSummary {
    pub applied: usize,
    pub failed: usize,
}

enum ApplyError {
    /// Validation failure: the request transitions to `failed` with this
    /// reason and the pass continues.
    Reject(String),
    /// Infrastructure failure: the pass aborts, requests stay queued.
    Repo(RepositoryError),
}

impl From<RepositoryError> for ApplyError {
    fn from(e: RepositoryError) -> Self {
        Self::Repo(e)
    }
}

/// Projects operator intents onto worker-visible state.
#[derive(Clone)]
pub struct OpsApplier {
    repo: Repository,
}

impl OpsApplier {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// One applier cycle: fetch queued requests in creation order, apply
    /// each, and persist the projected worker state.
    pub fn apply_pending(&self) -> Result<AppliedSummary> {
        let requests = self.repo.fetch_queued_ops_requests()?;
        if requests.is_empty() {
            return Ok(AppliedSummary::default());
        }

        let mut state = self.repo.read_worker_state()?;
        let mut summary = AppliedSummary::default();

        for request in requests {
            match self.apply_one(&request, &mut state) {
                Ok(()) => {
                    self.repo.mark_ops_request_applied(&request.request_id)?;
                    summary.applied += 1;
                    tracing::info!(
                        "Applied {} ({:?} {:?})",
                        request.request_type.as_str(),
                        request.scope_type,
                        request.scope_id
                    );
                }
                Err(ApplyError::Reject(reason)) => {
                    self.repo
                        .mark_ops_request_failed(&request.request_id, &reason)?;
                    summary.failed += 1;
                    tracing::warn!(
                        "Rejected {} request {}: {reason}",
                        request.request_type.as_str(),
                        request.request_id
                    );
                }
                Err(ApplyError::Repo(e)) => return Err(e),
            }
        }

        state.touch();
        self.repo.write_worker_state(&state)?;
        Ok(summary)
    }

    fn apply_one(
        &self,
        request: &OpsRequest,
        state: &mut WorkerState,
    ) -> std::result::Result<(), ApplyError> {
        match request.request_type {
            // STOP and PAUSE are distinct intents for audit but project
            // identically: workers treat both as a closed gate.
            RequestType::Stop | RequestType::Pause => match request.scope_type {
                ScopeType::Global => {
                    state.stop_requested = true;
                    Ok(())
                }
                ScopeType::Workspace => {
                    state.paused_workspaces.insert(scope_id(request)?);
                    Ok(())
                }
                ScopeType::Document => {
                    state.paused_documents.insert(scope_id(request)?);
                    Ok(())
                }
            },
            RequestType::Resume => match request.scope_type {
                ScopeType::Global => {
                    state.stop_requested = false;
                    Ok(())
                }
                ScopeType::Workspace => {
                    state.paused_workspaces.remove(&scope_id(request)?);
                    Ok(())
                }
                ScopeType::Document => {
                    state.paused_documents.remove(&scope_id(request)?);
                    Ok(())
                }
            },
            RequestType::ReleaseLease => match request.scope_type {
                ScopeType::Document => {
                    let doc_id = scope_id(request)?;
                    self.release_one(&doc_id)?;
                    Ok(())
                }
                ScopeType::Workspace => {
                    let workspace = scope_id(request)?;
                    for doc in self
                        .repo
                        .documents_with_status(&workspace, ProcessingStatus::Processing)?
                    {
                        self.release_one(&doc.doc_id)?;
                    }
                    Ok(())
                }
                ScopeType::Global => Err(ApplyError::Reject(
                    "RELEASE_LEASE requires workspace or document scope".to_string(),
                )),
            },
            RequestType::ResetDoc => {
                let doc_id = scope_id(request)?;
                let doc = self
                    .repo
                    .get_document(&doc_id)?
                    .ok_or_else(|| ApplyError::Reject(format!("document {doc_id} not found")))?;
                if doc.processing_status == ProcessingStatus::Processing {
                    return Err(ApplyError::Reject("DocumentBusy".to_string()));
                }
                self.repo.reset_document_to_pending(&doc_id)?;
                Ok(())
            }
            RequestType::ResetWorkspace => {
                let workspace = scope_id(request)?;
                let busy = self
                    .repo
                    .count_with_status(&workspace, ProcessingStatus::Processing)?;
                if busy > 0 {
                    // Caller is expected to STOP first.
                    return Err(ApplyError::Reject("WorkspaceBusy".to_string()));
                }
                for status in [
                    ProcessingStatus::Completed,
                    ProcessingStatus::Failed,
                    ProcessingStatus::Canceled,
                ] {
                    for doc in self.repo.documents_with_status(&workspace, status)? {
                        self.repo.reset_document_to_pending(&doc.doc_id)?;
                    }
                }
                Ok(())
            }
            RequestType::ClearStages => match request.scope_type {
                ScopeType::Document => {
                    let doc_id = scope_id(request)?;
                    match self.repo.clear_stage_outputs(&doc_id) {
                        Ok(()) => Ok(()),
                        Err(RepositoryError::NotFound(m)) => Err(ApplyError::Reject(m)),
                        Err(e) => Err(e.into()),
                    }
                }
                ScopeType::Workspace => {
                    let workspace = scope_id(request)?;
                    self.repo.clear_stage_outputs_for_workspace(&workspace)?;
                    Ok(())
                }
                ScopeType::Global => Err(ApplyError::Reject(
                    "CLEAR_STAGES requires workspace or document scope".to_string(),
                )),
            },
            // RUN intents are evidence-recorded; the next bounded `process`
            // invocation performs the batch. Nothing here may set a flag
            // that causes continuous processing.
            RequestType::Run => {
                if let Some(payload) = &request.payload {
                    if serde_json::from_value::<RunPayload>(payload.clone()).is_err() {
                        return Err(ApplyError::Reject("invalid RUN payload".to_string()));
                    }
                }
                self.repo.record_run_started(
                    &request.request_id,
                    request.requested_by.as_deref(),
                    request.payload.as_ref(),
                )?;
                Ok(())
            }
        }
    }

    /// Force-release one document's lease and, if it was mid-processing,
    /// return it to the pending queue.
    fn release_one(&self, doc_id: &str) -> Result<()> {
        self.repo.force_release_lease(doc_id)?;
        let reset = self.repo.update_document_status(
            doc_id,
            ProcessingStatus::Processing,
            ProcessingStatus::Pending,
        )?;
        if reset {
            tracing::info!("Released lease and re-queued {doc_id}");
        }
        Ok(())
    }

    /// Apply cycles on an interval until canceled.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.apply_pending() {
                        tracing::warn!("Applier cycle failed: {e}");
                    }
                }
            }
        }
    }
}

fn scope_id(request: &OpsRequest) -> std::result::Result<String, ApplyError> {
    request
        .scope_id
        .clone()
        .ok_or_else(|| ApplyError::Reject("missing scope id".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Document, RequestStatus};
    use tempfile::TempDir;

    fn setup() -> (TempDir, Repository, OpsApplier) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::new(&dir.path().join("docmill.db")).unwrap();
        let applier = OpsApplier::new(repo.clone());
        (dir, repo, applier)
    }

    fn seed_doc(repo: &Repository, workspace: &str, content: &[u8]) -> Document {
        let doc = Document::new(
            "owner-1".to_string(),
            workspace.to_string(),
            "note".to_string(),
            "f.txt".to_string(),
            "text/plain".to_string(),
            content,
            None,
            None,
        );
        repo.insert_document(&doc).unwrap();
        doc
    }

    #[test]
    fn test_stop_projects_into_worker_state() {
        let (_dir, repo, applier) = setup();
        repo.enqueue_ops_request(&OpsRequest::global(RequestType::Stop, None))
            .unwrap();

        let summary = applier.apply_pending().unwrap();
        assert_eq!(summary, AppliedSummary { applied: 1, failed: 0 });
        assert!(repo.read_worker_state().unwrap().stop_requested);
    }

    #[test]
    fn test_duplicate_stops_are_idempotent() {
        let (_dir, repo, applier) = setup();
        repo.enqueue_ops_request(&OpsRequest::global(RequestType::Stop, None))
            .unwrap();
        repo.enqueue_ops_request(&OpsRequest::global(RequestType::Stop, None))
            .unwrap();

        let summary = applier.apply_pending().unwrap();
        assert_eq!(summary.applied, 2);
        assert!(repo.read_worker_state().unwrap().stop_requested);

        // Both rows reached `applied`; a second pass is a no-op.
        let again = applier.apply_pending().unwrap();
        assert_eq!(again, AppliedSummary::default());
    }

    #[test]
    fn test_pause_then_resume_workspace() {
        let (_dir, repo, applier) = setup();
        repo.enqueue_ops_request(&OpsRequest::for_workspace(
            RequestType::Pause,
            "classroom",
            None,
        ))
        .unwrap();
        applier.apply_pending().unwrap();
        assert!(repo
            .read_worker_state()
            .unwrap()
            .is_paused("classroom"));

        repo.enqueue_ops_request(&OpsRequest::for_workspace(
            RequestType::Resume,
            "classroom",
            None,
        ))
        .unwrap();
        applier.apply_pending().unwrap();
        assert!(!repo.read_worker_state().unwrap().is_paused("classroom"));
    }

    #[test]
    fn test_release_lease_resets_processing_document() {
        let (_dir, repo, applier) = setup();
        let doc = seed_doc(&repo, "household", b"a");
        repo.acquire_lease(&doc.doc_id, "dead-worker", 300).unwrap();
        repo.update_document_status(
            &doc.doc_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
        )
        .unwrap();

        repo.enqueue_ops_request(&OpsRequest::for_document(
            RequestType::ReleaseLease,
            &doc.doc_id,
            None,
        ))
        .unwrap();
        applier.apply_pending().unwrap();

        assert!(repo.get_lease(&doc.doc_id).unwrap().is_none());
        let after = repo.get_document(&doc.doc_id).unwrap().unwrap();
        assert_eq!(after.processing_status, ProcessingStatus::Pending);
    }

    #[test]
    fn test_reset_doc_requires_not_processing() {
        let (_dir, repo, applier) = setup();
        let doc = seed_doc(&repo, "household", b"a");
        repo.update_document_status(
            &doc.doc_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
        )
        .unwrap();

        repo.enqueue_ops_request(&OpsRequest::for_document(
            RequestType::ResetDoc,
            &doc.doc_id,
            None,
        ))
        .unwrap();
        let summary = applier.apply_pending().unwrap();
        assert_eq!(summary.failed, 1);

        let request = &repo.list_ops_requests(1).unwrap()[0];
        assert_eq!(request.status, RequestStatus::Failed);
        assert_eq!(request.failure_reason.as_deref(), Some("DocumentBusy"));
    }

    #[test]
    fn test_reset_workspace_fails_when_busy() {
        let (_dir, repo, applier) = setup();
        let busy = seed_doc(&repo, "business", b"a");
        let idle = seed_doc(&repo, "business", b"b");
        repo.update_document_status(
            &busy.doc_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
        )
        .unwrap();
        repo.update_document_status(
            &idle.doc_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Completed,
        )
        .unwrap();

        repo.enqueue_ops_request(&OpsRequest::for_workspace(
            RequestType::ResetWorkspace,
            "business",
            None,
        ))
        .unwrap();
        let summary = applier.apply_pending().unwrap();
        assert_eq!(summary.failed, 1);
        let request = &repo.list_ops_requests(1).unwrap()[0];
        assert_eq!(request.failure_reason.as_deref(), Some("WorkspaceBusy"));

        // The idle document was not reset.
        let after = repo.get_document(&idle.doc_id).unwrap().unwrap();
        assert_eq!(after.processing_status, ProcessingStatus::Completed);
    }

    #[test]
    fn test_reset_workspace_resets_terminal_documents() {
        let (_dir, repo, applier) = setup();
        let done = seed_doc(&repo, "business", b"a");
        let failed = seed_doc(&repo, "business", b"b");
        let elsewhere = seed_doc(&repo, "household", b"c");
        repo.update_document_status(
            &done.doc_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Completed,
        )
        .unwrap();
        repo.update_document_status(
            &failed.doc_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Failed,
        )
        .unwrap();
        repo.update_document_status(
            &elsewhere.doc_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Completed,
        )
        .unwrap();

        repo.enqueue_ops_request(&OpsRequest::for_workspace(
            RequestType::ResetWorkspace,
            "business",
            None,
        ))
        .unwrap();
        applier.apply_pending().unwrap();

        for doc_id in [&done.doc_id, &failed.doc_id] {
            let after = repo.get_document(doc_id).unwrap().unwrap();
            assert_eq!(after.processing_status, ProcessingStatus::Pending);
        }
        // Other workspaces untouched.
        let other = repo.get_document(&elsewhere.doc_id).unwrap().unwrap();
        assert_eq!(other.processing_status, ProcessingStatus::Completed);
    }

    #[test]
    fn test_clear_stages_leaves_chunks_and_executions() {
        let (_dir, repo, applier) = setup();
        let doc = seed_doc(&repo, "household", b"a");
        repo.update_stage_output(&doc.doc_id, "output_extract", "text")
            .unwrap();

        repo.enqueue_ops_request(&OpsRequest::for_document(
            RequestType::ClearStages,
            &doc.doc_id,
            None,
        ))
        .unwrap();
        applier.apply_pending().unwrap();

        let after = repo.get_document(&doc.doc_id).unwrap().unwrap();
        assert!(after.stage_outputs.is_empty());
    }

    #[test]
    fn test_run_request_records_evidence() {
        let (_dir, repo, applier) = setup();
        let request = OpsRequest::new(
            RequestType::Run,
            ScopeType::Global,
            None,
            Some(serde_json::json!({"max_items": 5})),
            Some("scheduler".to_string()),
        );
        repo.enqueue_ops_request(&request).unwrap();
        applier.apply_pending().unwrap();

        let records = repo.list_run_records(10).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].run_id, request.request_id);
        // No worker-state flag was set.
        assert!(!repo.read_worker_state().unwrap().stop_requested);
    }
}
