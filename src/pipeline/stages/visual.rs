//! Stage F: visual / OCR enrichment.
//!
//! Renders PDF pages with pdftoppm and OCRs them with tesseract; images
//! are OCRed directly. The stage is optional per document type: it only
//! applies to PDFs and images, and a missing OCR toolchain degrades to an
//! empty enrichment rather than failing the run.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;
use tempfile::TempDir;

use super::{handle_cmd_output, tool_available};
use crate::models::StageId;
use crate::pipeline::stage::{
    DocView, PriorOutputs, Stage, StageContext, StageOutput, VisualArtifact, VisualElement,
};
use crate::pipeline::StageError;

/// Maximum pages rendered per document. Beyond this the enrichment is
/// truncated, not failed.
const MAX_OCR_PAGES: u32 = 10;

/// OCR enrichment stage.
pub struct VisualStage {
    tesseract_lang: String,
}

impl Default for VisualStage {
    fn default() -> Self {
        Self {
            tesseract_lang: "eng".to_string(),
        }
    }
}

impl VisualStage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Stage for VisualStage {
    fn id(&self) -> StageId {
        StageId::Visual
    }

    fn applies(&self, doc: &DocView<'_>) -> bool {
        let mime = doc.doc.mime_type.as_str();
        mime == "application/pdf" || mime.starts_with("image/")
    }

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        doc: &DocView<'_>,
        prior: &PriorOutputs,
    ) -> Result<StageOutput, StageError> {
        if !tool_available("tesseract") {
            tracing::warn!(
                "tesseract not found on PATH; skipping visual enrichment for {}",
                doc.doc.doc_id
            );
            return Ok(StageOutput::Visual(VisualArtifact::default()));
        }

        let path = match doc.doc.file_path.clone() {
            Some(path) => path,
            None => {
                return Err(StageError::Validation(
                    "document has no stored file".to_string(),
                ))
            }
        };

        let mime = doc.doc.mime_type.as_str();
        if mime.starts_with("image/") {
            let lang = self.tesseract_lang.clone();
            let text = tokio::task::spawn_blocking(move || ocr_image(&path, &lang))
                .await
                .map_err(|e| StageError::Internal(e.to_string()))??;
            let artifact = VisualArtifact {
                elements: vec![VisualElement {
                    kind: "ocr_image".to_string(),
                    page: 1,
                    detail: format!("{} chars", text.len()),
                }],
                text,
                pages_scanned: 1,
            };
            return Ok(StageOutput::Visual(artifact));
        }

        // PDF: render page images then OCR each, emitting a sub-step per
        // page so long scans surface in the progress log.
        if !tool_available("pdftoppm") {
            tracing::warn!("pdftoppm not found on PATH; skipping visual enrichment");
            return Ok(StageOutput::Visual(VisualArtifact::default()));
        }

        let page_count = prior
            .get(&StageId::Extract)
            .and_then(|o| o.as_extract())
            .and_then(|a| a.page_count)
            .unwrap_or(1)
            .min(MAX_OCR_PAGES);

        let mut artifact = VisualArtifact::default();
        for page in 1..=page_count {
            ctx.check_canceled()?;
            ctx.sub_step(&format!("F-{page}")).await;

            let path = path.clone();
            let lang = self.tesseract_lang.clone();
            let page_text =
                tokio::task::spawn_blocking(move || ocr_pdf_page(&path, page, &lang))
                    .await
                    .map_err(|e| StageError::Internal(e.to_string()))?;

            match page_text {
                Ok(text) => {
                    artifact.elements.push(VisualElement {
                        kind: "ocr_page".to_string(),
                        page,
                        detail: format!("{} chars", text.len()),
                    });
                    if !text.trim().is_empty() {
                        artifact.text.push_str(&text);
                        artifact.text.push('\n');
                    }
                    artifact.pages_scanned += 1;
                }
                Err(e) => {
                    tracing::debug!("OCR failed for page {page}: {e}");
                }
            }
        }

        Ok(StageOutput::Visual(artifact))
    }
}

/// Render one PDF page to an image and OCR it.
fn ocr_pdf_page(file_path: &Path, page: u32, lang: &str) -> Result<String, StageError> {
    let temp_dir =
        TempDir::new().map_err(|e| StageError::Transient(format!("tempdir: {e}")))?;
    let prefix = temp_dir.path().join("page");

    let status = Command::new("pdftoppm")
        .args(["-png", "-r", "150"])
        .arg("-f")
        .arg(page.to_string())
        .arg("-l")
        .arg(page.to_string())
        .arg(file_path)
        .arg(&prefix)
        .status();
    match status {
        Ok(s) if s.success() => {}
        Ok(_) => {
            return Err(StageError::Validation(format!(
                "pdftoppm failed to render page {page}"
            )))
        }
        Err(e) => return Err(StageError::Transient(format!("pdftoppm: {e}"))),
    }

    let image = find_rendered_page(temp_dir.path()).ok_or_else(|| {
        StageError::Validation(format!("pdftoppm produced no image for page {page}"))
    })?;
    ocr_image(&image, lang)
}

/// pdftoppm names output files with zero-padded page numbers; take
/// whatever single PNG it produced.
fn find_rendered_page(dir: &Path) -> Option<PathBuf> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .find(|path| path.extension().is_some_and(|ext| ext == "png"))
}

/// OCR an image file with tesseract.
fn ocr_image(file_path: &Path, lang: &str) -> Result<String, StageError> {
    let output = Command::new("tesseract")
        .arg(file_path)
        .arg("stdout")
        .args(["-l", lang])
        .output();
    handle_cmd_output(output, "tesseract", "tesseract failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;

    fn doc_with_mime(mime: &str) -> Document {
        Document::new(
            "owner-1".to_string(),
            "household".to_string(),
            "scan".to_string(),
            "file".to_string(),
            mime.to_string(),
            b"bytes",
            None,
            None,
        )
    }

    #[test]
    fn test_applies_only_to_visual_types() {
        let stage = VisualStage::new();
        let pdf = doc_with_mime("application/pdf");
        let png = doc_with_mime("image/png");
        let txt = doc_with_mime("text/plain");

        assert!(stage.applies(&DocView::new(&pdf, b"")));
        assert!(stage.applies(&DocView::new(&png, b"")));
        assert!(!stage.applies(&DocView::new(&txt, b"")));
    }

    #[test]
    fn test_find_rendered_page_picks_png() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("page-01.png"), b"x").unwrap();
        std::fs::write(dir.path().join("ignore.txt"), b"x").unwrap();

        let found = find_rendered_page(dir.path()).unwrap();
        assert_eq!(found.extension().unwrap(), "png");
    }
}
