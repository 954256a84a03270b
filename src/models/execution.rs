//! Execution model.
//!
//! An execution is one full pipeline attempt on a document. Rows are
//! insert-only for core fields; only the terminal-transition fields may be
//! updated, and only forward along `queued → running → {succeeded | failed
//! | canceled}`. A failed run never clears the document's active pointer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a pipeline execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Running,
    Succeeded,
    Failed,
    Canceled,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "succeeded" => Some(Self::Succeeded),
            "failed" => Some(Self::Failed),
            "canceled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Canceled)
    }

    /// Whether a transition to `next` moves forward along the lifecycle.
    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        matches!(
            (self, next),
            (Self::Queued, ExecutionStatus::Running)
                | (Self::Queued, ExecutionStatus::Canceled)
                | (Self::Running, ExecutionStatus::Succeeded)
                | (Self::Running, ExecutionStatus::Failed)
                | (Self::Running, ExecutionStatus::Canceled)
        )
    }
}

/// Classified error kinds carried by terminal executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Input preconditions violated; non-retryable.
    Validation,
    /// Transient infrastructure failure with the retry cap exceeded.
    TransientExhausted,
    /// Structured refusal or schema violation in model output.
    ModelOutput,
    /// Memory pressure escalated above the hard cap.
    ResourceExhausted,
    /// Integrity violation (owner mismatch, ordinal collision).
    DataIntegrity,
    /// Cooperative cancellation observed at a boundary.
    Canceled,
    /// Programming error or panic.
    InternalPanic,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "VALIDATION",
            Self::TransientExhausted => "TRANSIENT_EXHAUSTED",
            Self::ModelOutput => "MODEL_OUTPUT",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::DataIntegrity => "DATA_INTEGRITY",
            Self::Canceled => "CANCELED",
            Self::InternalPanic => "INTERNAL_PANIC",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "VALIDATION" => Some(Self::Validation),
            "TRANSIENT_EXHAUSTED" => Some(Self::TransientExhausted),
            "MODEL_OUTPUT" => Some(Self::ModelOutput),
            "RESOURCE_EXHAUSTED" => Some(Self::ResourceExhausted),
            "DATA_INTEGRITY" => Some(Self::DataIntegrity),
            "CANCELED" => Some(Self::Canceled),
            "INTERNAL_PANIC" => Some(Self::InternalPanic),
            _ => None,
        }
    }
}

/// One pipeline run for a document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub execution_id: String,
    pub document_id: String,
    /// Owner copied from the parent document; consistency is enforced at
    /// the repository.
    pub owner_id: String,
    pub status: ExecutionStatus,
    /// Model version resolved for this run.
    pub model_version: String,
    /// SHA-256 over the resolved prompt templates.
    pub prompt_hash: String,
    /// SHA-256 of the canonicalized input; identical bytes and routing
    /// yield identical hashes across runs.
    pub input_hash: String,
    /// SHA-256 of the lowercased, whitespace-normalized canonical view.
    pub normalized_hash: String,
    /// Lineage link for retries; roots at the first attempt.
    pub retry_of_execution_id: Option<String>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    /// Opaque result payload (stage artifacts, usage counters).
    pub result: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Execution {
    /// Create a new queued execution.
    pub fn new(
        document_id: String,
        owner_id: String,
        model_version: String,
        prompt_hash: String,
        input_hash: String,
        normalized_hash: String,
        retry_of_execution_id: Option<String>,
    ) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            document_id,
            owner_id,
            status: ExecutionStatus::Queued,
            model_version,
            prompt_hash,
            input_hash,
            normalized_hash,
            retry_of_execution_id,
            error_code: None,
            error_message: None,
            result: None,
            duration_ms: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }
}

/// Patch restricted to terminal-transition fields.
///
/// This is the only shape `UpdateExecution` accepts; core fields cannot be
/// rewritten after insert.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPatch {
    pub status: Option<ExecutionStatus>,
    pub error_code: Option<ErrorCode>,
    pub error_message: Option<String>,
    pub result: Option<serde_json::Value>,
    pub duration_ms: Option<i64>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExecutionPatch {
    /// Patch for the `queued → running` transition.
    pub fn started() -> Self {
        Self {
            status: Some(ExecutionStatus::Running),
            ..Default::default()
        }
    }

    /// Patch for a successful terminal transition.
    pub fn succeeded(result: serde_json::Value, duration_ms: i64) -> Self {
        Self {
            status: Some(ExecutionStatus::Succeeded),
            result: Some(result),
            duration_ms: Some(duration_ms),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Patch for a failed terminal transition.
    pub fn failed(code: ErrorCode, message: String, duration_ms: i64) -> Self {
        Self {
            status: Some(ExecutionStatus::Failed),
            error_code: Some(code),
            error_message: Some(message),
            duration_ms: Some(duration_ms),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Patch for a canceled terminal transition.
    pub fn canceled(duration_ms: i64) -> Self {
        Self {
            status: Some(ExecutionStatus::Canceled),
            error_code: Some(ErrorCode::Canceled),
            error_message: Some("canceled at stage boundary".to_string()),
            duration_ms: Some(duration_ms),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}
