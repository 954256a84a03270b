//! Stage I: synthesis.
//!
//! Generates a summary and search tags over the normalized text. The two
//! calls run sequentially to keep model memory pressure bounded.

use async_trait::async_trait;

use crate::llm::{parse_tags, truncate_content, DEFAULT_SUMMARY_PROMPT, DEFAULT_TAGS_PROMPT};
use crate::models::StageId;
use crate::pipeline::stage::{
    DocView, PriorOutputs, Stage, StageContext, StageOutput, SynthesisArtifact,
};
use crate::pipeline::StageError;

/// Synthesis stage.
pub struct SynthesizeStage;

#[async_trait]
impl Stage for SynthesizeStage {
    fn id(&self) -> StageId {
        StageId::Synthesize
    }

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        doc: &DocView<'_>,
        prior: &PriorOutputs,
    ) -> Result<StageOutput, StageError> {
        let normalized = prior
            .get(&StageId::Structure)
            .and_then(|o| o.as_structured())
            .map(|a| a.normalized_text.as_str())
            .ok_or_else(|| StageError::Internal("structure stage output missing".to_string()))?;

        let content = truncate_content(normalized, ctx.max_content_chars);

        let summary_prompt = fill(
            ctx.route
                .prompt_template
                .as_deref()
                .unwrap_or(DEFAULT_SUMMARY_PROMPT),
            &doc.doc.file_name,
            content,
        );
        let summary = ctx.generate(&summary_prompt).await?.trim().to_string();
        if summary.is_empty() {
            return Err(StageError::ModelOutput("empty summary response".to_string()));
        }

        ctx.check_canceled()?;

        let tags_prompt = fill(DEFAULT_TAGS_PROMPT, &doc.doc.file_name, content);
        let tags_response = ctx.generate(&tags_prompt).await?;
        let tags = parse_tags(&tags_response);
        if tags.is_empty() {
            return Err(StageError::ModelOutput(
                "no tags parsed from response".to_string(),
            ));
        }

        Ok(StageOutput::Synthesis(SynthesisArtifact { summary, tags }))
    }
}

fn fill(template: &str, title: &str, content: &str) -> String {
    template
        .replace("{title}", title)
        .replace("{content}", content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_substitutes_both_placeholders() {
        let prompt = fill("t={title} c={content}", "report.pdf", "body");
        assert_eq!(prompt, "t=report.pdf c=body");
    }
}
