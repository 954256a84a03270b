//! Scripted model client for tests.
//!
//! Recognizes the built-in prompt shapes and returns plausible canned
//! output; failures can be scripted per prompt marker so a test can make a
//! single stage fail transiently or permanently.

use std::sync::Mutex;

use async_trait::async_trait;

use super::client::{GenerateOutput, ModelClient, ModelError, ModelUsage};

/// Kind of scripted failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailureKind {
    /// Connection-style error; retryable.
    Transient,
    /// Structured refusal; permanent.
    Refusal,
    /// Returns syntactically invalid JSON instead of erroring.
    MalformedJson,
}

#[derive(Debug)]
struct ScriptedFailure {
    marker: String,
    remaining: u32,
    kind: MockFailureKind,
}

#[derive(Debug, Default)]
struct MockState {
    generate_calls: u64,
    embed_calls: u64,
    failures: Vec<ScriptedFailure>,
}

/// Deterministic in-process model client.
pub struct MockModelClient {
    embedding_dim: usize,
    latency: std::time::Duration,
    state: Mutex<MockState>,
}

impl MockModelClient {
    pub fn new(embedding_dim: usize) -> Self {
        Self {
            embedding_dim,
            latency: std::time::Duration::ZERO,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Simulate per-call model latency.
    pub fn with_latency(mut self, latency: std::time::Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Script `count` failures for any generate call whose prompt contains
    /// `marker`.
    pub fn fail_generates_containing(&self, marker: &str, count: u32, kind: MockFailureKind) {
        let mut state = self.state.lock().unwrap();
        state.failures.push(ScriptedFailure {
            marker: marker.to_string(),
            remaining: count,
            kind,
        });
    }

    /// Total generate calls observed.
    pub fn generate_calls(&self) -> u64 {
        self.state.lock().unwrap().generate_calls
    }

    /// Total embed calls observed.
    pub fn embed_calls(&self) -> u64 {
        self.state.lock().unwrap().embed_calls
    }

    fn canned_response(prompt: &str) -> String {
        if prompt.contains("normalized_text") {
            // Structuring prompt: reply with the expected strict JSON.
            let body = prompt
                .split("Document Content:")
                .nth(1)
                .unwrap_or("")
                .trim()
                .replace(['"', '\n', '\r'], " ");
            serde_json::json!({
                "normalized_text": body.trim(),
                "structured": {
                    "title": "Structured Document",
                    "doc_kind": "memo",
                    "entities": ["Acme Corp"],
                    "dates": ["2026-01-15"],
                }
            })
            .to_string()
        } else if prompt.contains("comma-separated lowercase tags") {
            "memo, acme-corp, archive".to_string()
        } else {
            "A concise summary of the document's subject and key facts.".to_string()
        }
    }
}

#[async_trait]
impl ModelClient for MockModelClient {
    async fn generate(&self, _model_id: &str, prompt: &str) -> Result<GenerateOutput, ModelError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut state = self.state.lock().unwrap();
        state.generate_calls += 1;

        if let Some(failure) = state
            .failures
            .iter_mut()
            .find(|f| f.remaining > 0 && prompt.contains(&f.marker))
        {
            failure.remaining -= 1;
            match failure.kind {
                MockFailureKind::Transient => {
                    return Err(ModelError::Connection("scripted timeout".to_string()))
                }
                MockFailureKind::Refusal => {
                    return Err(ModelError::Refusal("scripted refusal".to_string()))
                }
                MockFailureKind::MalformedJson => {
                    return Ok(GenerateOutput {
                        text: "{ this is not json".to_string(),
                        usage: ModelUsage {
                            generate_calls: 1,
                            ..Default::default()
                        },
                    })
                }
            }
        }

        let text = Self::canned_response(prompt);
        Ok(GenerateOutput {
            usage: ModelUsage {
                generate_calls: 1,
                embed_calls: 0,
                input_chars: prompt.len() as u64,
                output_chars: text.len() as u64,
            },
            text,
        })
    }

    async fn embed(&self, _model_id: &str, texts: &[String]) -> Result<Vec<Vec<f32>>, ModelError> {
        let mut state = self.state.lock().unwrap();
        state.embed_calls += 1;
        drop(state);

        Ok(texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                let seed = (text.len() + i) as f32;
                (0..self.embedding_dim)
                    .map(|d| ((seed + d as f32) % 97.0) / 97.0)
                    .collect()
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_structure_prompt_gets_json() {
        let client = MockModelClient::new(8);
        let prompt = crate::llm::DEFAULT_STRUCTURE_PROMPT
            .replace("{title}", "t")
            .replace("{content}", "hello world");
        let output = client.generate("m", &prompt).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&output.text).unwrap();
        assert!(parsed.get("normalized_text").is_some());
    }

    #[tokio::test]
    async fn test_scripted_transient_failures_run_out() {
        let client = MockModelClient::new(8);
        client.fail_generates_containing("MARKER", 2, MockFailureKind::Transient);

        assert!(client.generate("m", "with MARKER inside").await.is_err());
        assert!(client.generate("m", "with MARKER inside").await.is_err());
        assert!(client.generate("m", "with MARKER inside").await.is_ok());
        assert_eq!(client.generate_calls(), 3);
    }

    #[tokio::test]
    async fn test_embeddings_have_requested_dimension() {
        let client = MockModelClient::new(16);
        let vectors = client
            .embed("m", &["one".to_string(), "two".to_string()])
            .await
            .unwrap();
        assert_eq!(vectors.len(), 2);
        assert!(vectors.iter().all(|v| v.len() == 16));
    }
}
