//! Stage E: text extraction.
//!
//! Runs up to five engine variants depending on the MIME type and
//! consolidates the best one by non-whitespace volume. PDFs go through
//! pdftotext in raw and layout modes; HTML is stripped with a DOM parser;
//! email bodies come out of the RFC 822 parser; everything text-like is
//! read directly.

use std::path::{Path, PathBuf};
use std::process::Command;

use async_trait::async_trait;

use super::{content_chars, handle_cmd_output, pdf_page_count};
use crate::pipeline::stage::{
    DocView, ExtractArtifact, ExtractVariant, PriorOutputs, Stage, StageContext, StageOutput,
};
use crate::pipeline::StageError;
use crate::models::StageId;

/// Text extraction stage.
pub struct ExtractStage;

#[async_trait]
impl Stage for ExtractStage {
    fn id(&self) -> StageId {
        StageId::Extract
    }

    async fn run(
        &self,
        ctx: &StageContext<'_>,
        doc: &DocView<'_>,
        _prior: &PriorOutputs,
    ) -> Result<StageOutput, StageError> {
        let mime = doc.doc.mime_type.as_str();
        let mut variants: Vec<ExtractVariant> = Vec::new();
        let mut page_count = None;

        match mime {
            "application/pdf" => {
                let path = stored_path(doc)?;
                page_count = pdf_page_count(&path);

                ctx.sub_step("pdftotext").await;
                match extract_pdf_text(&path, false) {
                    Ok(text) => variants.push(ExtractVariant {
                        engine: "pdftotext".to_string(),
                        text,
                    }),
                    Err(e) => tracing::debug!("pdftotext raw failed: {e}"),
                }

                ctx.check_canceled()?;
                ctx.sub_step("pdftotext-layout").await;
                match extract_pdf_text(&path, true) {
                    Ok(text) => variants.push(ExtractVariant {
                        engine: "pdftotext-layout".to_string(),
                        text,
                    }),
                    Err(e) => tracing::debug!("pdftotext layout failed: {e}"),
                }

                if variants.is_empty() {
                    return Err(StageError::Validation(
                        "no PDF extraction engine produced text (is pdftotext installed?)"
                            .to_string(),
                    ));
                }
            }
            "text/html" => {
                variants.push(ExtractVariant {
                    engine: "html-strip".to_string(),
                    text: strip_html(&doc.text_lossy()),
                });
            }
            "message/rfc822" => {
                variants.push(ExtractVariant {
                    engine: "email-body".to_string(),
                    text: extract_email_body(doc.bytes())?,
                });
            }
            mime if mime.starts_with("image/") => {
                // Nothing to extract; Stage F carries the OCR enrichment.
            }
            "text/plain" | "text/markdown" | "text/csv" => {
                variants.push(ExtractVariant {
                    engine: "direct".to_string(),
                    text: doc.text_lossy().into_owned(),
                });
            }
            other => {
                if std::str::from_utf8(doc.bytes()).is_ok() {
                    variants.push(ExtractVariant {
                        engine: "direct".to_string(),
                        text: doc.text_lossy().into_owned(),
                    });
                } else {
                    return Err(StageError::Validation(format!(
                        "unsupported mime type: {other}"
                    )));
                }
            }
        }

        // Consolidate: keep whichever variant carries the most content.
        let consolidated = variants
            .iter()
            .max_by_key(|v| content_chars(&v.text))
            .map(|v| v.text.clone())
            .unwrap_or_default();

        Ok(StageOutput::Extracted(ExtractArtifact {
            variants,
            consolidated,
            page_count,
        }))
    }
}

fn stored_path(doc: &DocView<'_>) -> Result<PathBuf, StageError> {
    doc.doc
        .file_path
        .clone()
        .ok_or_else(|| StageError::Validation("document has no stored file".to_string()))
}

/// Extract text from a whole PDF using pdftotext.
fn extract_pdf_text(file_path: &Path, layout: bool) -> Result<String, StageError> {
    let mut cmd = Command::new("pdftotext");
    if layout {
        cmd.arg("-layout");
    }
    let output = cmd.arg(file_path).arg("-").output();
    handle_cmd_output(output, "pdftotext", "pdftotext failed")
}

/// Strip an HTML document down to its visible text.
fn strip_html(html: &str) -> String {
    let document = scraper::Html::parse_document(html);
    let mut text = String::new();
    collect_visible_text(document.root_element(), &mut text);
    text
}

fn collect_visible_text(element: scraper::ElementRef<'_>, out: &mut String) {
    if matches!(
        element.value().name(),
        "script" | "style" | "noscript" | "head" | "template"
    ) {
        return;
    }
    for child in element.children() {
        if let Some(t) = child.value().as_text() {
            let trimmed = t.trim();
            if !trimmed.is_empty() {
                out.push_str(trimmed);
                out.push('\n');
            }
        } else if let Some(child_element) = scraper::ElementRef::wrap(child) {
            collect_visible_text(child_element, out);
        }
    }
}

/// Extract subject + text body from an RFC 822 message.
fn extract_email_body(bytes: &[u8]) -> Result<String, StageError> {
    let message = mail_parser::MessageParser::new()
        .parse(bytes)
        .ok_or_else(|| StageError::Validation("unparseable email message".to_string()))?;

    let mut text = String::new();
    if let Some(subject) = message.subject() {
        text.push_str(subject);
        text.push_str("\n\n");
    }
    if let Some(body) = message.body_text(0) {
        text.push_str(&body);
    } else if let Some(html) = message.body_html(0) {
        text.push_str(&strip_html(&html));
    }

    if text.trim().is_empty() {
        return Err(StageError::Validation(
            "email message has no text body".to_string(),
        ));
    }
    Ok(text)
}
