//! `docmill history` - execution history for one document.

use console::style;

use crate::config::Settings;
use crate::models::ExecutionStatus;
use crate::repository::Repository;
use crate::store::ExecutionStore;

pub async fn cmd_history(settings: &Settings, doc_id: &str, limit: usize) -> anyhow::Result<i32> {
    let repo = Repository::new(&settings.database_path())?;
    let doc = match repo.get_document(doc_id)? {
        Some(doc) => doc,
        None => {
            eprintln!("Document not found: {doc_id}");
            return Ok(5);
        }
    };

    let store = ExecutionStore::new(repo.clone());
    let history = store.history(doc_id, limit)?;

    println!(
        "{} {} ({}, {})",
        style("Document").bold(),
        doc.file_name,
        doc.processing_status.as_str(),
        doc.doc_id
    );
    if let Some(active) = &doc.active_execution_id {
        println!("  active execution: {active}");
    }

    if history.is_empty() {
        println!("  no executions yet");
        return Ok(0);
    }

    for exec in history {
        let status = match exec.status {
            ExecutionStatus::Succeeded => style(exec.status.as_str()).green(),
            ExecutionStatus::Failed => style(exec.status.as_str()).red(),
            ExecutionStatus::Canceled => style(exec.status.as_str()).yellow(),
            _ => style(exec.status.as_str()).dim(),
        };
        println!(
            "  {} {status:<9} {} {}ms{}{}",
            exec.created_at.format("%Y-%m-%d %H:%M:%S"),
            &exec.execution_id[..8.min(exec.execution_id.len())],
            exec.duration_ms.unwrap_or(0),
            exec.error_code
                .map(|c| format!("  {}", c.as_str()))
                .unwrap_or_default(),
            exec.retry_of_execution_id
                .as_deref()
                .map(|id| format!("  retry-of {}", &id[..8.min(id.len())]))
                .unwrap_or_default()
        );
        if let Some(message) = &exec.error_message {
            println!("      {}", style(message).dim());
        }
    }
    Ok(0)
}
