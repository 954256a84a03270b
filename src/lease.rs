//! Lease manager.
//!
//! Enforces at most one concurrent running execution per document. A
//! worker claims a document by acquiring the repository-backed lease and
//! flipping the document status `pending → processing` in a CAS; a
//! background heartbeater renews the lease at `ttl / heartbeat_fraction`.
//! The janitor reclaims documents whose holders died: expired leases are
//! force-released, their documents reset to `pending`, and orphaned
//! `running` executions swept to failed.

use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;

use crate::config::ProcessingConfig;
use crate::models::{Document, ProcessingStatus};
use crate::repository::{Repository, RepositoryError, Result};

/// Stable identity for this worker process.
pub fn process_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown-host".to_string());
    format!("{host}:{}", std::process::id())
}

/// Claims and maintains single-writer leases for one worker process.
#[derive(Clone)]
pub struct LeaseManager {
    repo: Repository,
    worker_id: String,
    ttl_secs: i64,
    heartbeat_interval: Duration,
}

impl LeaseManager {
    pub fn new(repo: Repository, config: &ProcessingConfig) -> Self {
        Self {
            repo,
            worker_id: process_worker_id(),
            ttl_secs: config.lease_ttl_secs,
            heartbeat_interval: config.heartbeat_interval(),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Try to claim a document for processing.
    ///
    /// Returns `None` when another worker holds the lease or the document
    /// already left `pending` - both mean "taken, move on". On success the
    /// returned guard keeps the lease renewed until released.
    pub fn try_claim(&self, doc: &Document) -> Result<Option<LeaseGuard>> {
        match self
            .repo
            .acquire_lease(&doc.doc_id, &self.worker_id, self.ttl_secs)
        {
            Ok(_lease) => {}
            Err(RepositoryError::LeaseHeld(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        // The status flip is what makes `processing` iff a lease is held.
        let swapped = self.repo.update_document_status(
            &doc.doc_id,
            ProcessingStatus::Pending,
            ProcessingStatus::Processing,
        )?;
        if !swapped {
            // Lost the race on status; undo the row claim.
            let _ = self.repo.release_lease(&doc.doc_id, &self.worker_id);
            return Ok(None);
        }

        let heartbeat_cancel = CancellationToken::new();
        let heartbeat = tokio::spawn(heartbeat_loop(
            self.repo.clone(),
            doc.doc_id.clone(),
            self.worker_id.clone(),
            self.ttl_secs,
            self.heartbeat_interval,
            heartbeat_cancel.clone(),
        ));

        Ok(Some(LeaseGuard {
            repo: self.repo.clone(),
            doc_id: doc.doc_id.clone(),
            worker_id: self.worker_id.clone(),
            heartbeat_cancel,
            heartbeat,
        }))
    }
}

async fn heartbeat_loop(
    repo: Repository,
    doc_id: String,
    worker_id: String,
    ttl_secs: i64,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick fires immediately; skip it, the lease is fresh.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match repo.renew_lease(&doc_id, &worker_id, ttl_secs) {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::warn!(
                            "Lost lease on {doc_id} (renewal found no row for {worker_id})"
                        );
                        break;
                    }
                    Err(e) => {
                        tracing::warn!("Lease renewal failed for {doc_id}: {e}");
                    }
                }
            }
        }
    }
}

/// Held lease with a live heartbeater. Must be released explicitly with
/// the document's terminal status.
pub struct LeaseGuard {
    repo: Repository,
    doc_id: String,
    worker_id: String,
    heartbeat_cancel: CancellationToken,
    heartbeat: tokio::task::JoinHandle<()>,
}

impl LeaseGuard {
    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Stop the heartbeater, move the document out of `processing`, and
    /// release the lease row.
    pub async fn release(self, final_status: ProcessingStatus) -> Result<()> {
        self.heartbeat_cancel.cancel();
        let _ = self.heartbeat.await;

        let swapped = self.repo.update_document_status(
            &self.doc_id,
            ProcessingStatus::Processing,
            final_status,
        )?;
        if !swapped {
            tracing::warn!(
                "Document {} was not in processing at release (status moved externally)",
                self.doc_id
            );
        }
        self.repo.release_lease(&self.doc_id, &self.worker_id)?;
        Ok(())
    }
}

/// Summary of one janitor pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct JanitorReport {
    /// Expired leases force-released.
    pub released: usize,
    /// Documents reset from `processing` to `pending`.
    pub reset: usize,
    /// Orphaned running executions marked failed.
    pub swept: usize,
}

/// Background task reclaiming crashed workers' documents.
#[derive(Clone)]
pub struct Janitor {
    repo: Repository,
}

impl Janitor {
    pub fn new(repo: Repository) -> Self {
        Self { repo }
    }

    /// One reclamation pass.
    pub fn tick(&self) -> Result<JanitorReport> {
        let now = Utc::now();
        let mut report = JanitorReport::default();

        for lease in self.repo.expired_leases(now)? {
            tracing::warn!(
                "Reclaiming expired lease on {} held by {} (expired {})",
                lease.doc_id,
                lease.worker_id,
                lease.expires_at
            );
            self.repo.force_release_lease(&lease.doc_id)?;
            report.released += 1;

            let reset = self.repo.update_document_status(
                &lease.doc_id,
                ProcessingStatus::Processing,
                ProcessingStatus::Pending,
            )?;
            if reset {
                report.reset += 1;
            }
        }

        report.swept = self.repo.sweep_stale_running(now)?;
        Ok(report)
    }

    /// Run ticks on an interval until canceled. The cadence is the
    /// heartbeat interval, well inside one lease TTL.
    pub async fn run(self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.tick() {
                        Ok(report) if report.released > 0 || report.swept > 0 => {
                            tracing::info!(
                                "Janitor reclaimed {} leases, reset {} documents, swept {} executions",
                                report.released, report.reset, report.swept
                            );
                        }
                        Ok(_) => {}
                        Err(e) => tracing::warn!("Janitor pass failed: {e}"),
                    }
                }
            }
        }
    }
}
