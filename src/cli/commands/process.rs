//! `docmill process` - run one bounded processing batch.

use std::sync::Arc;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use crate::config::{Config, Settings};
use crate::llm::OllamaClient;
use crate::orchestrator::{Orchestrator, RunOptions};
use crate::repository::Repository;

pub async fn cmd_process(
    settings: &Settings,
    config: &Config,
    limit: usize,
    workspace: Option<String>,
    doc_id: Option<String>,
    quiet: bool,
) -> anyhow::Result<i32> {
    if !settings.database_exists() {
        eprintln!("Database not initialized; run `docmill init` first");
        return Ok(3);
    }
    let repo = Repository::new(&settings.database_path())?;

    let models = OllamaClient::new(config.llm.clone())
        .map_err(|e| anyhow::anyhow!("model client: {e}"))?;
    if !models.is_available().await {
        eprintln!(
            "{} Model endpoint {} is unreachable; stages that call models will retry and fail",
            style("!").yellow(),
            config.llm.endpoint
        );
    }

    let orchestrator = Orchestrator::new(
        repo.clone(),
        Arc::new(config.clone()),
        Arc::new(models),
    );

    // The snapshot row is the single source of truth for progress; the
    // bar just mirrors it.
    let bar_task = if quiet {
        None
    } else {
        Some(tokio::spawn(progress_bar_loop(repo.clone())))
    };

    let result = orchestrator
        .run(RunOptions {
            limit,
            workspace,
            doc_id,
        })
        .await;

    if let Some(task) = bar_task {
        task.abort();
        let _ = task.await;
    }

    match result {
        Ok(report) => {
            if report.gate_closed {
                println!(
                    "{} Gate closed (stop requested); {} processed before halt",
                    style("■").yellow(),
                    report.stats.succeeded
                );
            } else {
                println!(
                    "{} Batch drained: {} succeeded, {} failed, {} canceled, {} skipped",
                    style("✓").green(),
                    report.stats.succeeded,
                    report.stats.failed,
                    report.stats.canceled,
                    report.stats.skipped
                );
            }
            Ok(0)
        }
        Err(e) => {
            eprintln!("{} Run aborted: {e:#}", style("✗").red());
            // Unrecoverable orchestration error for this run.
            Ok(1)
        }
    }
}

/// Mirror the repository progress snapshot into a terminal bar.
async fn progress_bar_loop(repo: Repository) {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::with_template(
            "{spinner:.cyan} [{bar:30.cyan/dim}] {pos}/{len} {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> "),
    );

    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        ticker.tick().await;
        let snapshot = match repo.read_progress() {
            Ok(Some(snapshot)) => snapshot,
            _ => continue,
        };

        bar.set_length(snapshot.total_count as u64);
        bar.set_position((snapshot.success_count + snapshot.error_count) as u64);
        bar.set_message(format!(
            "{} workers, mem {:.0}%{}",
            snapshot.current_workers,
            snapshot.resources.memory_percent * 100.0,
            snapshot
                .current_file
                .as_deref()
                .map(|f| format!(" - {f}"))
                .unwrap_or_default()
        ));
    }
}
