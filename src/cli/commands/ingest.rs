//! `docmill ingest` - enqueue local files as pending documents.
//!
//! Reads each file, sniffs the MIME type from content, stores the bytes
//! under the documents directory, and inserts a `pending` document row.
//! Duplicate content hashes are reported and skipped, not errors.

use std::path::Path;

use console::style;

use crate::config::Settings;
use crate::models::Document;
use crate::repository::{Repository, RepositoryError};

pub async fn cmd_ingest(
    settings: &Settings,
    paths: &[std::path::PathBuf],
    owner: &str,
    workspace: &str,
    doc_type: Option<&str>,
    source_ref: Option<&str>,
) -> anyhow::Result<i32> {
    if paths.is_empty() {
        eprintln!("No files given");
        return Ok(2);
    }

    settings.ensure_directories()?;
    let repo = Repository::new(&settings.database_path())?;

    let mut ingested = 0usize;
    let mut duplicates = 0usize;
    for path in paths {
        let bytes = std::fs::read(path)
            .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", path.display()))?;
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();

        let mime = sniff_mime(&bytes, path);
        let doc_type = doc_type
            .map(str::to_string)
            .unwrap_or_else(|| default_doc_type(&mime).to_string());

        let hash = Document::compute_hash(&bytes);
        let stored = settings
            .documents_dir
            .join(format!("{}_{file_name}", &hash[..12]));
        std::fs::write(&stored, &bytes)?;

        let doc = Document::new(
            owner.to_string(),
            workspace.to_string(),
            doc_type,
            file_name.clone(),
            mime,
            &bytes,
            Some(stored),
            source_ref.map(str::to_string),
        );

        match repo.insert_document(&doc) {
            Ok(()) => {
                ingested += 1;
                println!(
                    "  {} {} ({}, {})",
                    style("+").green(),
                    file_name,
                    doc.mime_type,
                    doc.doc_id
                );
            }
            Err(RepositoryError::DuplicateContentHash(_)) => {
                duplicates += 1;
                println!(
                    "  {} {} already ingested (same content hash)",
                    style("=").dim(),
                    file_name
                );
            }
            Err(e) => return Err(e.into()),
        }
    }

    println!(
        "{} Ingested {ingested} documents ({duplicates} duplicates skipped)",
        style("✓").green()
    );
    Ok(0)
}

/// Sniff MIME from content, falling back to the file extension.
fn sniff_mime(bytes: &[u8], path: &Path) -> String {
    if let Some(kind) = infer::get(bytes) {
        return kind.mime_type().to_string();
    }
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("txt") => "text/plain",
        Some("md") => "text/markdown",
        Some("csv") => "text/csv",
        Some("html") | Some("htm") => "text/html",
        Some("eml") => "message/rfc822",
        _ => {
            if std::str::from_utf8(bytes).is_ok() {
                "text/plain"
            } else {
                "application/octet-stream"
            }
        }
    }
    .to_string()
}

/// Default document type by MIME family, used for prompt routing when the
/// caller does not specify one.
fn default_doc_type(mime: &str) -> &'static str {
    match mime {
        "application/pdf" => "document",
        "message/rfc822" => "email",
        "text/html" => "page",
        m if m.starts_with("image/") => "scan",
        _ => "note",
    }
}
