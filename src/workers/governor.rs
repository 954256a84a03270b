//! Resource governor.
//!
//! Samples memory and CPU on a fixed period and adjusts the pool's
//! dispatch width reactively: at or above the HIGH watermark it inserts a
//! throttle delay and shrinks the width by one per interval down to the
//! floor; at or below LOW it restores one per interval up to the
//! configured width. At most one adjustment happens per sample, so the
//! width never thrashes faster than the sample period.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use super::sampler::ResourceSampler;
use crate::config::ProcessingConfig;
use crate::progress::{ProgressEvent, ProgressTx};

/// Shared reactive pool parameters, read by the dispatcher on every task.
#[derive(Debug)]
pub struct GovernorState {
    max_parallel: AtomicU32,
    throttle_delay_ms: AtomicU64,
    adjustment_count: AtomicU64,
}

impl GovernorState {
    pub fn new(initial_max_parallel: u32) -> Arc<Self> {
        Arc::new(Self {
            max_parallel: AtomicU32::new(initial_max_parallel.max(1)),
            throttle_delay_ms: AtomicU64::new(0),
            adjustment_count: AtomicU64::new(0),
        })
    }

    /// Current dispatch width.
    pub fn max_parallel(&self) -> u32 {
        self.max_parallel.load(Ordering::Relaxed)
    }

    /// Current inter-dispatch delay; zero when not throttling.
    pub fn throttle_delay(&self) -> Duration {
        Duration::from_millis(self.throttle_delay_ms.load(Ordering::Relaxed))
    }

    /// Number of adjustments made so far.
    pub fn adjustment_count(&self) -> u64 {
        self.adjustment_count.load(Ordering::Relaxed)
    }
}

/// Periodic sampler + adjuster task.
pub struct ResourceGovernor {
    state: Arc<GovernorState>,
    config: ProcessingConfig,
    sampler: Box<dyn ResourceSampler>,
    progress: ProgressTx,
}

impl ResourceGovernor {
    pub fn new(
        state: Arc<GovernorState>,
        config: ProcessingConfig,
        sampler: Box<dyn ResourceSampler>,
        progress: ProgressTx,
    ) -> Self {
        Self {
            state,
            config,
            sampler,
            progress,
        }
    }

    /// One sample-and-adjust pass. Returns whether anything changed.
    pub async fn tick(&mut self) -> bool {
        let sample = self.sampler.sample();
        let _ = self
            .progress
            .send(ProgressEvent::Resources(sample.stats()))
            .await;

        let current = self.state.max_parallel();
        let floor = self.config.floor.max(1);
        let restore_cap = self.config.max_parallel.min(self.config.hard_cap).max(floor);

        let mut changed = false;
        if sample.memory_percent >= self.config.memory_high {
            let throttled_before = self.state.throttle_delay_ms.load(Ordering::Relaxed);
            self.state
                .throttle_delay_ms
                .store(self.config.throttle_delay_ms, Ordering::Relaxed);
            changed = throttled_before != self.config.throttle_delay_ms;

            if current > floor {
                self.state
                    .max_parallel
                    .store(current - 1, Ordering::Relaxed);
                changed = true;
            }
            if changed {
                tracing::info!(
                    "Memory at {:.0}%: throttling, width {} -> {}",
                    sample.memory_percent * 100.0,
                    current,
                    self.state.max_parallel()
                );
            }
        } else if sample.memory_percent <= self.config.memory_low {
            let throttling = self.state.throttle_delay_ms.load(Ordering::Relaxed) > 0
                || current < restore_cap;
            if throttling {
                self.state.throttle_delay_ms.store(0, Ordering::Relaxed);
                if current < restore_cap {
                    self.state
                        .max_parallel
                        .store(current + 1, Ordering::Relaxed);
                }
                changed = true;
                tracing::info!(
                    "Memory back to {:.0}%: width {} -> {}",
                    sample.memory_percent * 100.0,
                    current,
                    self.state.max_parallel()
                );
            }
        }
        // Between LOW and HIGH the width holds steady.

        if changed {
            self.state.adjustment_count.fetch_add(1, Ordering::Relaxed);
            let _ = self
                .progress
                .send(ProgressEvent::PoolAdjusted {
                    max_parallel: self.state.max_parallel(),
                    throttle_delay_ms: self.state.throttle_delay_ms.load(Ordering::Relaxed),
                })
                .await;
        }
        changed
    }

    /// Sample on the configured period until canceled.
    pub async fn run(mut self, cancel: CancellationToken) {
        let period = Duration::from_secs(self.config.sample_interval_secs.max(1));
        let mut ticker = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }
}
