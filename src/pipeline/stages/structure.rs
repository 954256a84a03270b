//! Stage H: model-driven structuring.
//!
//! Sends the formatted text through the routed model and expects strict
//! JSON back: normalized text plus structured metadata. A schema violation
//! gets one corrective re-prompt when configured, then fails the run with
//! a model-output error.

use async_trait::async_trait;

use crate::llm::{truncate_content, DEFAULT_STRUCTURE_PROMPT};
use crate::models::StageId;
use crate::pipeline::stage::{
    DocView, PriorOutputs, Stage, StageContext, StageOutput, StructuredArtifact,
};
use crate::pipeline::StageError;

/// Structuring stage.
pub struct StructureStage;

#[async_trait]
impl Stage for StructureStage {
    fn id(&self) -> StageId {
        StageId::Structure
    }

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        doc: &DocView<'_>,
        prior: &PriorOutputs,
    ) -> Result<StageOutput, StageError> {
        let formatted = prior
            .get(&StageId::Format)
            .and_then(|o| o.as_formatted())
            .ok_or_else(|| StageError::Internal("format stage output missing".to_string()))?;

        let template = ctx
            .route
            .prompt_template
            .as_deref()
            .unwrap_or(DEFAULT_STRUCTURE_PROMPT);
        let prompt = template
            .replace("{title}", &doc.doc.file_name)
            .replace("{content}", truncate_content(formatted, ctx.max_content_chars));

        let response = ctx.generate(&prompt).await?;
        let artifact = match parse_structured(&response) {
            Ok(artifact) => artifact,
            Err(first_err) if ctx.reprompt_on_bad_output => {
                tracing::debug!(
                    "Structuring output invalid for {}, re-prompting once: {first_err}",
                    doc.doc.doc_id
                );
                let retry_prompt = format!(
                    "{prompt}\n\nYour previous reply was not valid JSON. \
                     Respond with ONLY the JSON object described above."
                );
                let retry = ctx.generate(&retry_prompt).await?;
                parse_structured(&retry).map_err(StageError::ModelOutput)?
            }
            Err(err) => return Err(StageError::ModelOutput(err)),
        };

        Ok(StageOutput::Structured(artifact))
    }
}

/// Parse and validate the structuring reply.
fn parse_structured(response: &str) -> Result<StructuredArtifact, String> {
    let stripped = strip_code_fences(response);
    let value: serde_json::Value =
        serde_json::from_str(stripped).map_err(|e| format!("invalid JSON: {e}"))?;

    let normalized_text = value
        .get("normalized_text")
        .and_then(|v| v.as_str())
        .ok_or_else(|| "missing normalized_text field".to_string())?;
    if normalized_text.trim().is_empty() {
        return Err("normalized_text is empty".to_string());
    }
    let structured = value
        .get("structured")
        .filter(|v| v.is_object())
        .ok_or_else(|| "missing structured object".to_string())?;

    Ok(StructuredArtifact {
        normalized_text: normalized_text.to_string(),
        structured: structured.clone(),
    })
}

/// Models love markdown fences; tolerate them.
fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open.strip_suffix("```").unwrap_or(without_open).trim()
}
