//! Core data models.
//!
//! This module contains the persistent entities of the orchestrator:
//! - `document`: a logical unit of ingestion with per-stage output columns
//! - `execution`: an immutable record of one pipeline run
//! - `chunk`: a searchable fragment produced by the chunking/embedding stages
//! - `lease`: a single-writer claim on a document
//! - `ops_request`: a persisted operator intent
//! - `worker_state`: the derived control cache read by workers
//! - `progress`: the live snapshot written by the progress publisher
//! - `stage`: the closed set of pipeline stage ids

mod chunk;
mod document;
mod execution;
mod lease;
mod ops_request;
mod progress;
mod stage;
mod worker_state;

pub use chunk::{Chunk, ChunkType};
pub use document::{Document, ProcessingStatus, StageOutputs};
pub use execution::{ErrorCode, Execution, ExecutionPatch, ExecutionStatus};
pub use lease::Lease;
pub use ops_request::{OpsRequest, RequestStatus, RequestType, RunPayload, ScopeType};
pub use progress::{ProgressSnapshot, ResourceStats, StageEventRecord, EVENT_LOG_CAPACITY};
pub use stage::StageId;
pub use worker_state::WorkerState;
