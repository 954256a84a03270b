//! Docmill - document processing orchestrator.
//!
//! Ingested documents are driven through an ordered multi-stage pipeline
//! (extract, visual enrichment, structuring, synthesis, chunking, embedding)
//! by a bounded worker pool with crash-safe single-writer leases,
//! non-destructive execution history, and a persisted operator control queue.

pub mod cli;
pub mod config;
pub mod lease;
pub mod llm;
pub mod models;
pub mod ops;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod repository;
pub mod store;
pub mod workers;
