//! Stage G: deterministic formatting.
//!
//! Merges the extracted and OCR texts (keeping OCR when it carries
//! materially more content) and normalizes the result: line endings,
//! control characters, trailing whitespace, and blank-line runs.

use async_trait::async_trait;
use regex::Regex;

use super::content_chars;
use crate::models::StageId;
use crate::pipeline::stage::{DocView, PriorOutputs, Stage, StageContext, StageOutput};
use crate::pipeline::StageError;

/// Formatting stage.
pub struct FormatStage {
    blank_runs: Regex,
}

impl Default for FormatStage {
    fn default() -> Self {
        Self {
            blank_runs: Regex::new(r"\n{3,}").expect("static regex"),
        }
    }
}

impl FormatStage {
    pub fn new() -> Self {
        Self::default()
    }

    fn normalize(&self, text: &str) -> String {
        let unified = text.replace("\r\n", "\n").replace('\r', "\n");
        let cleaned: String = unified
            .chars()
            .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
            .collect();
        let trimmed = cleaned
            .lines()
            .map(str::trim_end)
            .collect::<Vec<_>>()
            .join("\n");
        self.blank_runs
            .replace_all(&trimmed, "\n\n")
            .trim()
            .to_string()
    }
}

#[async_trait]
impl Stage for FormatStage {
    fn id(&self) -> StageId {
        StageId::Format
    }

    async fn run(
        &self,
        _ctx: &StageContext<'_>,
        doc: &DocView<'_>,
        prior: &PriorOutputs,
    ) -> Result<StageOutput, StageError> {
        let extracted = prior
            .get(&StageId::Extract)
            .and_then(|o| o.as_extract())
            .map(|a| a.consolidated.as_str())
            .unwrap_or("");
        let ocr = prior
            .get(&StageId::Visual)
            .and_then(|o| o.as_visual())
            .map(|a| a.text.as_str())
            .unwrap_or("");

        // OCR wins when it carries >20% more content than the extraction.
        let extracted_chars = content_chars(extracted);
        let ocr_chars = content_chars(ocr);
        let merged = if ocr_chars > extracted_chars + (extracted_chars / 5) {
            ocr
        } else {
            extracted
        };

        let formatted = self.normalize(merged);
        if formatted.is_empty() {
            return Err(StageError::Validation(format!(
                "no text available for document {}",
                doc.doc.doc_id
            )));
        }

        Ok(StageOutput::Formatted(formatted))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::stage::{ExtractArtifact, VisualArtifact};

    #[test]
    fn test_normalize_line_endings_and_blanks() {
        let stage = FormatStage::new();
        let text = "a\r\nb\r\r\n\n\n\nc   \n";
        let normalized = stage.normalize(text);
        assert_eq!(normalized, "a\nb\n\nc");
    }

    #[test]
    fn test_normalize_strips_control_chars() {
        let stage = FormatStage::new();
        let normalized = stage.normalize("a\u{0000}b\tc");
        assert_eq!(normalized, "ab\tc");
    }

    fn prior_with(extract: &str, ocr: &str) -> PriorOutputs {
        let mut prior = PriorOutputs::new();
        prior.insert(
            StageId::Extract,
            StageOutput::Extracted(ExtractArtifact {
                variants: Vec::new(),
                consolidated: extract.to_string(),
                page_count: None,
            }),
        );
        prior.insert(
            StageId::Visual,
            StageOutput::Visual(VisualArtifact {
                text: ocr.to_string(),
                elements: Vec::new(),
                pages_scanned: 1,
            }),
        );
        prior
    }

    #[test]
    fn test_ocr_preferred_when_materially_larger() {
        let prior = prior_with("tiny", "this ocr text is considerably longer than the extract");
        let extracted = prior
            .get(&StageId::Extract)
            .and_then(|o| o.as_extract())
            .unwrap();
        let ocr = prior.get(&StageId::Visual).and_then(|o| o.as_visual()).unwrap();

        let extracted_chars = content_chars(&extracted.consolidated);
        let ocr_chars = content_chars(&ocr.text);
        assert!(ocr_chars > extracted_chars + (extracted_chars / 5));
    }
}
