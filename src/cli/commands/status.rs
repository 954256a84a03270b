//! `docmill status` - show document counts, gates, leases, and progress.

use console::style;

use crate::config::Settings;
use crate::repository::Repository;

pub async fn cmd_status(settings: &Settings, json: bool) -> anyhow::Result<i32> {
    let repo = Repository::new(&settings.database_path())?;

    let counts = repo.status_counts()?;
    let state = repo.read_worker_state()?;
    let leases = repo.list_leases()?;
    let queued = repo.fetch_queued_ops_requests()?;
    let progress = repo.read_progress()?;
    let runs = repo.list_run_records(5)?;

    if json {
        let payload = serde_json::json!({
            "documents": counts.iter().cloned().collect::<std::collections::BTreeMap<_, _>>(),
            "worker_state": state,
            "leases": leases,
            "queued_requests": queued,
            "progress": progress,
            "recent_runs": runs,
        });
        println!("{}", serde_json::to_string_pretty(&payload)?);
        return Ok(0);
    }

    println!("{}", style("Documents").bold());
    if counts.is_empty() {
        println!("  none ingested");
    }
    for (status, count) in &counts {
        println!("  {status:<12} {count}");
    }

    println!("{}", style("Gates").bold());
    println!(
        "  stop_requested     {}",
        if state.stop_requested {
            style("yes").red().to_string()
        } else {
            "no".to_string()
        }
    );
    if !state.paused_workspaces.is_empty() {
        println!(
            "  paused workspaces  {}",
            state
                .paused_workspaces
                .iter()
                .cloned()
                .collect::<Vec<_>>()
                .join(", ")
        );
    }
    if !state.paused_documents.is_empty() {
        println!("  paused documents   {}", state.paused_documents.len());
    }

    if !leases.is_empty() {
        println!("{}", style("Held leases").bold());
        for lease in &leases {
            println!(
                "  {} by {} (expires {})",
                lease.doc_id,
                lease.worker_id,
                lease.expires_at.format("%H:%M:%S")
            );
        }
    }

    if !queued.is_empty() {
        println!("{}", style("Queued requests").bold());
        for request in &queued {
            println!(
                "  {} ({})",
                request.request_type.as_str(),
                request.scope_id.as_deref().unwrap_or("global")
            );
        }
    }

    if let Some(snapshot) = progress {
        println!("{}", style("Last run").bold());
        println!(
            "  {} of {} processed, {} succeeded, {} failed{}",
            snapshot.current_index,
            snapshot.total_count,
            snapshot.success_count,
            snapshot.error_count,
            if snapshot.is_processing {
                " (in progress)"
            } else {
                ""
            }
        );
        if let Some(error) = &snapshot.last_error {
            println!("  last error: {error}");
        }
    }

    if !runs.is_empty() {
        println!("{}", style("Recent runs").bold());
        for run in &runs {
            println!(
                "  {} started {} ({}/{} ok/err)",
                &run.run_id[..8.min(run.run_id.len())],
                run.started_at.format("%Y-%m-%d %H:%M:%S"),
                run.success_count.unwrap_or(0),
                run.error_count.unwrap_or(0)
            );
        }
    }

    Ok(0)
}
