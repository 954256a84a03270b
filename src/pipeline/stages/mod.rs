//! Built-in stage implementations.
//!
//! - `extract`: text extraction engine variants (Stage E)
//! - `visual`: OCR enrichment via pdftoppm + tesseract (Stage F)
//! - `format`: deterministic cleanup and merge (Stage G)
//! - `structure`: model-driven normalization + structured JSON (Stage H)
//! - `synthesize`: summary and tags (Stage I)
//! - `chunking`: deterministic window splitting (Stage J)
//! - `embed`: one vector per chunk (Stage K)

mod chunking;
mod embed;
mod extract;
mod format;
mod structure;
mod synthesize;
mod visual;

pub use chunking::ChunkingStage;
pub use embed::EmbedStage;
pub use extract::ExtractStage;
pub use format::FormatStage;
pub use structure::StructureStage;
pub use synthesize::SynthesizeStage;
pub use visual::VisualStage;

use std::path::Path;
use std::process::Command;

use super::StageError;

/// Handle command output, extracting stdout on success.
pub(crate) fn handle_cmd_output(
    result: std::io::Result<std::process::Output>,
    tool_name: &str,
    error_prefix: &str,
) -> Result<String, StageError> {
    match result {
        Ok(output) => {
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).to_string())
            } else {
                let stderr = String::from_utf8_lossy(&output.stderr);
                Err(StageError::Validation(format!(
                    "{}: {}",
                    error_prefix, stderr
                )))
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(StageError::Validation(format!(
            "external tool not found: {tool_name}"
        ))),
        Err(e) => Err(StageError::Transient(format!("{tool_name}: {e}"))),
    }
}

/// Whether an external tool is available on PATH.
pub(crate) fn tool_available(name: &str) -> bool {
    which::which(name).is_ok()
}

/// Get the page count of a PDF via pdfinfo.
pub(crate) fn pdf_page_count(file_path: &Path) -> Option<u32> {
    let output = Command::new("pdfinfo").arg(file_path).output().ok()?;
    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .find(|line| line.starts_with("Pages:"))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|count| count.parse().ok())
}

/// Count non-whitespace characters; the comparison metric between
/// extraction variants.
pub(crate) fn content_chars(text: &str) -> usize {
    text.chars().filter(|c| !c.is_whitespace()).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_chars_ignores_whitespace() {
        assert_eq!(content_chars("a b\nc\t"), 3);
        assert_eq!(content_chars("   "), 0);
        assert_eq!(content_chars(""), 0);
    }
}
