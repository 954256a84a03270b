//! Multi-stage processing pipeline.
//!
//! A document runs through the ordered stages extract → visual → format →
//! structure → synthesize → chunk → embed. Stages are pure functions over
//! the document view and prior stage outputs; the engine owns ordering,
//! per-stage timeouts, in-stage retry with backoff, cancellation, and
//! progress emission.

mod engine;
mod stage;
pub mod stages;

pub use engine::{EngineOutcome, StageEngine};
pub use stage::{
    ChunkDraft, DocView, ExtractArtifact, ExtractVariant, PriorOutputs, Stage, StageContext,
    StageOutput, StructuredArtifact, SynthesisArtifact, VisualArtifact, VisualElement,
};

use thiserror::Error;

use crate::llm::ModelError;
use crate::models::ErrorCode;

/// Classified stage failure.
#[derive(Debug, Error)]
pub enum StageError {
    /// Input preconditions violated; never retried.
    #[error("validation: {0}")]
    Validation(String),
    /// Infrastructure hiccup; retried inside the stage with backoff.
    #[error("transient: {0}")]
    Transient(String),
    /// Model produced unusable output (refusal, schema violation).
    #[error("model output: {0}")]
    ModelOutput(String),
    /// Resource pressure escalated beyond recovery.
    #[error("resource: {0}")]
    Resource(String),
    /// Integrity violation detected mid-pipeline.
    #[error("data integrity: {0}")]
    DataIntegrity(String),
    /// Cooperative cancellation observed at a boundary.
    #[error("canceled")]
    Canceled,
    /// Programming error.
    #[error("internal: {0}")]
    Internal(String),
}

impl StageError {
    /// Whether the stage engine may retry this failure in place.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// The error code recorded on the terminal execution.
    pub fn error_code(&self) -> ErrorCode {
        match self {
            Self::Validation(_) => ErrorCode::Validation,
            Self::Transient(_) => ErrorCode::TransientExhausted,
            Self::ModelOutput(_) => ErrorCode::ModelOutput,
            Self::Resource(_) => ErrorCode::ResourceExhausted,
            Self::DataIntegrity(_) => ErrorCode::DataIntegrity,
            Self::Canceled => ErrorCode::Canceled,
            Self::Internal(_) => ErrorCode::InternalPanic,
        }
    }
}

impl From<ModelError> for StageError {
    fn from(err: ModelError) -> Self {
        if err.is_transient() {
            Self::Transient(err.to_string())
        } else {
            Self::ModelOutput(err.to_string())
        }
    }
}
