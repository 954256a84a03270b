//! Model clients for generation and embedding.
//!
//! The pipeline talks to models through the [`ModelClient`] trait; the
//! production implementation is an Ollama backend. Tests inject
//! [`MockModelClient`] with scripted failures.

mod client;
mod mock;

pub use client::{
    GenerateOutput, LlmConfig, ModelClient, ModelError, ModelUsage, OllamaClient,
    DEFAULT_STRUCTURE_PROMPT, DEFAULT_SUMMARY_PROMPT, DEFAULT_TAGS_PROMPT,
};
pub(crate) use client::{parse_tags, truncate_content};
pub use mock::{MockFailureKind, MockModelClient};
