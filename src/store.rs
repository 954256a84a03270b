//! Execution store.
//!
//! Append-only history of pipeline runs layered on the repository. Every
//! run is an immutable record; a document points at its most recent
//! succeeded run through `active_execution_id`, and a failed or canceled
//! run never disturbs that pointer.

use sha2::{Digest, Sha256};

use crate::models::{Chunk, Document, ErrorCode, Execution, ExecutionPatch};
use crate::repository::{Repository, Result};

/// Terminal outcome handed to [`ExecutionStore::finish_run`].
pub enum RunOutcome {
    /// Success with the result payload and the replacement chunk set.
    Succeeded {
        result: serde_json::Value,
        chunks: Vec<Chunk>,
    },
    /// Classified failure.
    Failed { code: ErrorCode, message: String },
    /// Cooperative cancellation.
    Canceled,
}

/// Store for execution lifecycle operations.
#[derive(Clone)]
pub struct ExecutionStore {
    repo: Repository,
}

impl ExecutionStore {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// Canonical input string hashed into `input_hash`. Identical bytes
    /// and routing yield identical canonical forms across runs.
    pub fn canonical_input(doc: &Document, model_version: &str, prompt_hash: &str) -> String {
        format!(
            "{}\n{}\n{}\n{}\n{}",
            doc.content_hash, doc.mime_type, doc.doc_type, model_version, prompt_hash
        )
    }

    /// Lowercased view with whitespace runs collapsed, hashed into
    /// `normalized_hash`.
    fn normalized_view(canonical: &str) -> String {
        canonical
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn sha256_hex(input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Create a queued execution for a document.
    pub fn create_run(
        &self,
        doc: &Document,
        model_version: &str,
        prompt_hash: &str,
        retry_of: Option<String>,
    ) -> Result<Execution> {
        let canonical = Self::canonical_input(doc, model_version, prompt_hash);
        let input_hash = Self::sha256_hex(&canonical);
        let normalized_hash = Self::sha256_hex(&Self::normalized_view(&canonical));

        let exec = Execution::new(
            doc.doc_id.clone(),
            doc.owner_id.clone(),
            model_version.to_string(),
            prompt_hash.to_string(),
            input_hash,
            normalized_hash,
            retry_of,
        );
        self.repo.insert_execution(&exec)?;
        Ok(exec)
    }

    /// Transition `queued → running`.
    pub fn start_run(&self, exec_id: &str) -> Result<()> {
        self.repo.update_execution(exec_id, &ExecutionPatch::started())
    }

    /// Apply the terminal transition for a run.
    ///
    /// On success the document's active pointer moves and the chunk set is
    /// replaced in the same transaction. Failures and cancellations only
    /// touch the execution row.
    pub fn finish_run(&self, exec: &Execution, outcome: RunOutcome) -> Result<()> {
        let duration_ms = (chrono::Utc::now() - exec.created_at).num_milliseconds();
        match outcome {
            RunOutcome::Succeeded { result, chunks } => {
                let patch = ExecutionPatch::succeeded(result, duration_ms);
                self.repo
                    .complete_execution_success(&exec.execution_id, &patch, Some(&chunks))
            }
            RunOutcome::Failed { code, message } => {
                let patch = ExecutionPatch::failed(code, message, duration_ms);
                self.repo.update_execution(&exec.execution_id, &patch)
            }
            RunOutcome::Canceled => {
                let patch = ExecutionPatch::canceled(duration_ms);
                self.repo.update_execution(&exec.execution_id, &patch)
            }
        }
    }

    /// Most recent succeeded execution with the same input hash, if any.
    pub fn find_prior_success(&self, doc_id: &str, input_hash: &str) -> Result<Option<Execution>> {
        self.repo.find_prior_success(doc_id, input_hash)
    }

    /// Most-recent-first run history for inspection.
    pub fn history(&self, doc_id: &str, limit: usize) -> Result<Vec<Execution>> {
        self.repo.execution_history(doc_id, limit)
    }
}
