//! `docmill ops` - enqueue operator requests and inspect the queue.

use console::style;

use super::OpsScope;
use crate::config::Settings;
use crate::models::{OpsRequest, RequestStatus, RequestType, ScopeType};
use crate::ops::OpsApplier;
use crate::repository::Repository;

fn requested_by() -> Option<String> {
    std::env::var("USER").ok().filter(|u| !u.is_empty())
}

fn scoped_request(request_type: RequestType, scope: &OpsScope) -> OpsRequest {
    match (&scope.workspace, &scope.doc_id) {
        (Some(workspace), _) => {
            OpsRequest::for_workspace(request_type, workspace, requested_by())
        }
        (None, Some(doc_id)) => OpsRequest::for_document(request_type, doc_id, requested_by()),
        (None, None) => OpsRequest::global(request_type, requested_by()),
    }
}

/// Enqueue one request; with `--apply`, run a single applier pass too.
pub async fn cmd_enqueue(
    settings: &Settings,
    request_type: RequestType,
    scope: &OpsScope,
) -> anyhow::Result<i32> {
    let repo = Repository::new(&settings.database_path())?;
    let request = scoped_request(request_type, scope);
    repo.enqueue_ops_request(&request)?;
    println!(
        "{} Enqueued {} ({} scope)",
        style("✓").green(),
        request.request_type.as_str(),
        request.scope_type.as_str()
    );

    if scope.apply {
        apply_once(&repo)?;
    }
    Ok(0)
}

/// `ops reset-status` maps to RESET_DOC or RESET_WORKSPACE by scope.
pub async fn cmd_reset_status(settings: &Settings, scope: &OpsScope) -> anyhow::Result<i32> {
    let repo = Repository::new(&settings.database_path())?;
    let request = match (&scope.workspace, &scope.doc_id) {
        (Some(workspace), _) => {
            OpsRequest::for_workspace(RequestType::ResetWorkspace, workspace, requested_by())
        }
        (None, Some(doc_id)) => {
            OpsRequest::for_document(RequestType::ResetDoc, doc_id, requested_by())
        }
        (None, None) => {
            eprintln!("reset-status requires --workspace or --doc-id");
            return Ok(2);
        }
    };
    repo.enqueue_ops_request(&request)?;
    println!(
        "{} Enqueued {}",
        style("✓").green(),
        request.request_type.as_str()
    );

    if scope.apply {
        apply_once(&repo)?;
    }
    Ok(0)
}

/// List recent requests; with `--apply`, run one applier pass first.
pub async fn cmd_requests(settings: &Settings, apply: bool) -> anyhow::Result<i32> {
    let repo = Repository::new(&settings.database_path())?;
    if apply {
        apply_once(&repo)?;
    }

    let requests = repo.list_ops_requests(50)?;
    if requests.is_empty() {
        println!("No operator requests");
        return Ok(0);
    }

    for request in requests {
        let status = match request.status {
            RequestStatus::Queued => style("queued ").yellow(),
            RequestStatus::Applied => style("applied").green(),
            RequestStatus::Failed => style("failed ").red(),
        };
        let scope = match request.scope_type {
            ScopeType::Global => "global".to_string(),
            _ => format!(
                "{}:{}",
                request.scope_type.as_str(),
                request.scope_id.as_deref().unwrap_or("?")
            ),
        };
        println!(
            "  {status} {:<16} {:<28} {}{}",
            request.request_type.as_str(),
            scope,
            request.created_at.format("%Y-%m-%d %H:%M:%S"),
            request
                .failure_reason
                .as_deref()
                .map(|r| format!("  ({r})"))
                .unwrap_or_default()
        );
    }
    Ok(0)
}

fn apply_once(repo: &Repository) -> anyhow::Result<()> {
    let summary = OpsApplier::new(repo.clone()).apply_pending()?;
    println!(
        "{} Applier pass: {} applied, {} failed",
        style("✓").green(),
        summary.applied,
        summary.failed
    );
    Ok(())
}
