//! Model client for document structuring, synthesis, and embedding.
//!
//! Supports the Ollama API for local inference.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Default prompt for the structuring stage. Expects a strict-JSON reply
/// carrying normalized text plus structured metadata.
pub const DEFAULT_STRUCTURE_PROMPT: &str = r#"You are structuring a document for search indexing. Read the ENTIRE content.

Respond with ONLY a JSON object, no prose and no code fences, shaped exactly like:
{"normalized_text": "...", "structured": {"title": "...", "doc_kind": "...", "entities": ["..."], "dates": ["..."]}}

- normalized_text: the full document text, cleaned of artifacts, in reading order
- title: the best title for the document
- doc_kind: a short lowercase kind (e.g. invoice, memo, syllabus, letter)
- entities: up to 10 people, organizations, or places that appear
- dates: dates that appear, ISO formatted where possible

Document Title: {title}

Document Content:
{content}"#;

/// Default prompt for generating a document summary.
pub const DEFAULT_SUMMARY_PROMPT: &str = r#"You are summarizing a document for a searchable archive. Read the ENTIRE content and identify the MAIN SUBJECT and KEY FACTS - not just what's in the opening lines.

Your summary should answer:
1. What is this document ABOUT?
2. What are the KEY FACTS it records? (amounts, dates, names, decisions)
3. Why would someone come back to it?

Document Title: {title}

Document Content:
{content}

Respond with ONLY a 2-3 sentence summary. No formatting or preamble."#;

/// Default prompt for generating document tags.
pub const DEFAULT_TAGS_PROMPT: &str = r#"You are tagging a document to make it FINDABLE. Read the ENTIRE document before tagging.

Generate 3-5 simple, lowercase tags that capture:
- The document kind (e.g. invoice, syllabus, warranty, lease)
- The main subject matter (e.g. car-insurance, math-homework, utilities)
- Key entities if significant (e.g. acme-corp, lincoln-high)

CRITICAL INSTRUCTIONS:
1. Be SPECIFIC - "car-insurance" is better than "finance"
2. Use lowercase with hyphens for multi-word tags
3. Avoid vague tags like "document", "information", "file"

Document Title: {title}

Document Content:
{content}

Respond with ONLY 3-5 comma-separated lowercase tags. Example: invoice, utilities, acme-corp"#;

/// Configuration for the model backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Ollama API endpoint (default: http://localhost:11434)
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Maximum tokens in generation responses.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Temperature for generation (0.0 - 1.0)
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// Maximum characters of document content to send per call.
    #[serde(default = "default_max_content_chars")]
    pub max_content_chars: usize,
}

fn default_endpoint() -> String {
    "http://localhost:11434".to_string()
}
fn default_timeout_secs() -> u64 {
    300
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_temperature() -> f32 {
    0.2
}
fn default_max_content_chars() -> usize {
    12000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            timeout_secs: default_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_content_chars: default_max_content_chars(),
        }
    }
}

/// Errors that can occur during model operations.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Failed to reach the model service (network, timeout).
    #[error("Connection error: {0}")]
    Connection(String),
    /// API returned an error status.
    #[error("API error (HTTP {status}): {message}")]
    Api { status: u16, message: String },
    /// Failed to parse the response.
    #[error("Parse error: {0}")]
    Parse(String),
    /// The model declined to produce usable output.
    #[error("Model refusal: {0}")]
    Refusal(String),
    /// Returned vector does not match the configured dimension.
    #[error("Embedding dimension mismatch: expected {expected}, got {actual}")]
    Dimension { expected: usize, actual: usize },
}

impl ModelError {
    /// Whether the caller may retry with backoff.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Connection(_) => true,
            Self::Api { status, .. } => *status >= 500 || *status == 429,
            Self::Parse(_) | Self::Refusal(_) | Self::Dimension { .. } => false,
        }
    }
}

/// Accumulated usage counters for one execution.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ModelUsage {
    pub generate_calls: u64,
    pub embed_calls: u64,
    pub input_chars: u64,
    pub output_chars: u64,
}

impl ModelUsage {
    pub fn merge(&mut self, other: ModelUsage) {
        self.generate_calls += other.generate_calls;
        self.embed_calls += other.embed_calls;
        self.input_chars += other.input_chars;
        self.output_chars += other.output_chars;
    }
}

/// Result of a generation call.
#[derive(Debug, Clone)]
pub struct GenerateOutput {
    pub text: String,
    pub usage: ModelUsage,
}

/// Opaque model backend invoked per stage.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Run a generation prompt against the given model.
    async fn generate(&self, model_id: &str, prompt: &str) -> Result<GenerateOutput, ModelError>;

    /// Embed a batch of texts, one vector per text.
    async fn embed(&self, model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError>;
}

/// Ollama-backed model client.
pub struct OllamaClient {
    config: LlmConfig,
    client: Client,
}

/// Ollama generate request format.
#[derive(Debug, Serialize)]
struct OllamaGenerateRequest {
    model: String,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct OllamaGenerateResponse {
    response: String,
    #[allow(dead_code)]
    done: bool,
}

#[derive(Debug, Serialize)]
struct OllamaEmbedRequest {
    model: String,
    prompt: String,
}

#[derive(Debug, Deserialize)]
struct OllamaEmbedResponse {
    embedding: Vec<f32>,
}

impl OllamaClient {
    /// Create a new client with the given configuration.
    pub fn new(config: LlmConfig) -> Result<Self, ModelError> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ModelError::Connection(e.to_string()))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &LlmConfig {
        &self.config
    }

    /// Check if the model service is reachable.
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/api/tags", self.config.endpoint);
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(_) => false,
        }
    }

    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T, ModelError> {
        let url = format!("{}{}", self.config.endpoint, path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| ModelError::Connection(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(ModelError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        resp.json().await.map_err(|e| ModelError::Parse(e.to_string()))
    }
}

#[async_trait]
impl ModelClient for OllamaClient {
    async fn generate(&self, model_id: &str, prompt: &str) -> Result<GenerateOutput, ModelError> {
        debug!("Generating with {model_id} ({} prompt chars)", prompt.len());
        let request = OllamaGenerateRequest {
            model: model_id.to_string(),
            prompt: prompt.to_string(),
            stream: false,
            options: OllamaOptions {
                temperature: self.config.temperature,
                num_predict: self.config.max_tokens,
            },
        };

        let response: OllamaGenerateResponse = self.post_json("/api/generate", &request).await?;
        if response.response.trim().is_empty() {
            return Err(ModelError::Refusal("empty model response".to_string()));
        }

        Ok(GenerateOutput {
            usage: ModelUsage {
                generate_calls: 1,
                embed_calls: 0,
                input_chars: prompt.len() as u64,
                output_chars: response.response.len() as u64,
            },
            text: response.response,
        })
    }

    async fn embed(&self, model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut vectors = Vec::with_capacity(texts.len());
        for text in texts {
            let request = OllamaEmbedRequest {
                model: model_id.to_string(),
                prompt: text.clone(),
            };
            let response: OllamaEmbedResponse = self.post_json("/api/embeddings", &request).await?;
            vectors.push(response.embedding);
        }
        Ok(vectors)
    }
}

/// Truncate content to a maximum length at a valid UTF-8 boundary.
pub(crate) fn truncate_content(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut end = max_chars;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Parse tags from a model response.
pub(crate) fn parse_tags(response: &str) -> Vec<String> {
    let cleaned = response
        .trim()
        .trim_start_matches("Tags:")
        .trim_start_matches("TAGS:")
        .trim_start_matches('[')
        .trim_end_matches(']')
        .trim();

    cleaned
        .split(',')
        .map(|t| {
            t.trim()
                .to_lowercase()
                .trim_matches(|c: char| !c.is_alphanumeric() && c != '-' && c != '_')
                .to_string()
        })
        .filter(|t| !t.is_empty() && t.len() <= 50)
        .take(10)
        .collect()
}
