//! Progress publisher.
//!
//! Collects events from the stage engine, worker pool, and resource
//! governor into an in-memory snapshot, and writes that snapshot to the
//! repository's single progress row. Writes coalesce: at most one
//! repository write per configured interval regardless of event rate.

use chrono::Utc;
use tokio::sync::mpsc;

use crate::models::{ProgressSnapshot, ResourceStats, StageEventRecord, StageId};
use crate::repository::Repository;

/// Events flowing into the publisher.
#[derive(Debug, Clone)]
pub enum ProgressEvent {
    /// A RUN began with a known batch size.
    RunStarted { total: usize },
    /// A document was dispatched to a worker.
    DocStarted {
        index: usize,
        doc_id: String,
        file_name: String,
    },
    /// A stage (or an internal sub-step) completed for a document.
    StageCompleted {
        doc_id: String,
        stage: StageId,
        sub_step: Option<String>,
    },
    /// A document reached a terminal status.
    DocFinished {
        doc_id: String,
        success: bool,
        error: Option<String>,
    },
    /// A dispatched document was skipped (lease already held elsewhere).
    DocSkipped { doc_id: String },
    /// Fresh resource counters from the governor.
    Resources(ResourceStats),
    /// The governor adjusted the pool width or throttle.
    PoolAdjusted {
        max_parallel: u32,
        throttle_delay_ms: u64,
    },
    /// The RUN drained or was gated closed.
    RunFinished,
}

/// Sender half used by every event producer.
pub type ProgressTx = mpsc::Sender<ProgressEvent>;

/// Channel depth for progress events. Senders drop events rather than
/// block when the publisher falls behind.
pub const PROGRESS_CHANNEL_DEPTH: usize = 256;

/// Single consumer that folds events into the snapshot and persists it.
pub struct ProgressPublisher {
    repo: Repository,
    rx: mpsc::Receiver<ProgressEvent>,
    write_interval: std::time::Duration,
    snapshot: ProgressSnapshot,
}

impl ProgressPublisher {
    /// Create a publisher and its sender half.
    pub fn new(
        repo: Repository,
        write_interval_ms: u64,
        initial_max_parallel: u32,
    ) -> (Self, ProgressTx) {
        let (tx, rx) = mpsc::channel(PROGRESS_CHANNEL_DEPTH);
        let mut snapshot = ProgressSnapshot::default();
        snapshot.max_parallel = initial_max_parallel;
        (
            Self {
                repo,
                rx,
                write_interval: std::time::Duration::from_millis(write_interval_ms.max(1)),
                snapshot,
            },
            tx,
        )
    }

    /// Consume events until all senders drop, then flush a terminal
    /// snapshot. Intended to run as its own task for the life of a RUN.
    pub async fn run(mut self) {
        let mut dirty = false;
        let mut ticker = tokio::time::interval(self.write_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = self.rx.recv() => {
                    match event {
                        Some(event) => {
                            self.apply(event);
                            dirty = true;
                        }
                        None => break,
                    }
                }
                _ = ticker.tick() => {
                    if dirty {
                        self.write();
                        dirty = false;
                    }
                }
            }
        }

        // Terminal flush so readers see the final counters.
        self.snapshot.is_processing = false;
        self.write();
    }

    fn apply(&mut self, event: ProgressEvent) {
        match event {
            ProgressEvent::RunStarted { total } => {
                self.snapshot.is_processing = true;
                self.snapshot.total_count = total;
                self.snapshot.current_index = 0;
                self.snapshot.success_count = 0;
                self.snapshot.error_count = 0;
                self.snapshot.last_error = None;
            }
            ProgressEvent::DocStarted {
                index,
                doc_id: _,
                file_name,
            } => {
                self.snapshot.current_index = index;
                self.snapshot.current_file = Some(file_name);
                self.snapshot.current_workers = self.snapshot.current_workers.saturating_add(1);
            }
            ProgressEvent::StageCompleted {
                doc_id,
                stage,
                sub_step,
            } => {
                self.snapshot.push_event(StageEventRecord {
                    doc_id,
                    stage_id: stage,
                    sub_step,
                    ts: Utc::now(),
                });
            }
            ProgressEvent::DocFinished { success, error, .. } => {
                self.snapshot.current_workers = self.snapshot.current_workers.saturating_sub(1);
                if success {
                    self.snapshot.success_count += 1;
                } else {
                    self.snapshot.error_count += 1;
                    if let Some(error) = error {
                        self.snapshot.last_error = Some(error);
                    }
                }
            }
            ProgressEvent::DocSkipped { .. } => {
                self.snapshot.current_workers = self.snapshot.current_workers.saturating_sub(1);
            }
            ProgressEvent::Resources(stats) => {
                self.snapshot.resources = stats;
            }
            ProgressEvent::PoolAdjusted {
                max_parallel,
                throttle_delay_ms,
            } => {
                self.snapshot.adjustment_count += 1;
                self.snapshot.max_parallel = max_parallel;
                self.snapshot.throttle_delay_ms = throttle_delay_ms;
            }
            ProgressEvent::RunFinished => {
                self.snapshot.is_processing = false;
                self.snapshot.current_file = None;
            }
        }
    }

    fn write(&mut self) {
        self.snapshot.updated_at = Utc::now();
        if let Err(e) = self.repo.write_progress(&self.snapshot) {
            tracing::warn!("Failed to write progress snapshot: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_repo() -> (TempDir, Repository) {
        let dir = TempDir::new().unwrap();
        let repo = Repository::new(&dir.path().join("docmill.db")).unwrap();
        (dir, repo)
    }

    #[tokio::test]
    async fn test_counters_fold_and_flush() {
        let (_dir, repo) = test_repo();
        let (publisher, tx) = ProgressPublisher::new(repo.clone(), 10, 8);
        let handle = tokio::spawn(publisher.run());

        tx.send(ProgressEvent::RunStarted { total: 2 }).await.unwrap();
        for (index, success) in [(1, true), (2, false)] {
            tx.send(ProgressEvent::DocStarted {
                index,
                doc_id: format!("doc-{index}"),
                file_name: format!("file-{index}.pdf"),
            })
            .await
            .unwrap();
            tx.send(ProgressEvent::DocFinished {
                doc_id: format!("doc-{index}"),
                success,
                error: (!success).then(|| "stage failed".to_string()),
            })
            .await
            .unwrap();
        }
        tx.send(ProgressEvent::RunFinished).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        let snapshot = repo.read_progress().unwrap().unwrap();
        assert_eq!(snapshot.success_count, 1);
        assert_eq!(snapshot.error_count, 1);
        assert_eq!(snapshot.total_count, 2);
        assert!(!snapshot.is_processing);
        assert_eq!(snapshot.last_error.as_deref(), Some("stage failed"));
        assert_eq!(snapshot.current_workers, 0);
    }

    #[tokio::test]
    async fn test_stage_events_land_in_log_ring() {
        let (_dir, repo) = test_repo();
        let (publisher, tx) = ProgressPublisher::new(repo.clone(), 10, 8);
        let handle = tokio::spawn(publisher.run());

        tx.send(ProgressEvent::StageCompleted {
            doc_id: "doc-1".to_string(),
            stage: StageId::Extract,
            sub_step: None,
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        let snapshot = repo.read_progress().unwrap().unwrap();
        assert_eq!(snapshot.logs.len(), 1);
        assert_eq!(snapshot.logs[0].stage_id, StageId::Extract);
    }

    #[tokio::test]
    async fn test_adjustments_accumulate() {
        let (_dir, repo) = test_repo();
        let (publisher, tx) = ProgressPublisher::new(repo.clone(), 10, 8);
        let handle = tokio::spawn(publisher.run());

        for width in [7, 6] {
            tx.send(ProgressEvent::PoolAdjusted {
                max_parallel: width,
                throttle_delay_ms: 500,
            })
            .await
            .unwrap();
        }
        drop(tx);
        handle.await.unwrap();

        let snapshot = repo.read_progress().unwrap().unwrap();
        assert_eq!(snapshot.adjustment_count, 2);
        assert_eq!(snapshot.max_parallel, 6);
        assert_eq!(snapshot.throttle_delay_ms, 500);
    }
}
