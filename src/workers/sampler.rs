//! Resource sampling.
//!
//! The governor reads memory and CPU through the [`ResourceSampler`]
//! trait; production uses the system sampler, tests inject a scripted one.

use crate::models::ResourceStats;

/// One observation of process-host resources.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceSample {
    /// Used fraction of total memory, 0.0 - 1.0.
    pub memory_percent: f64,
    pub memory_used_bytes: u64,
    pub memory_total_bytes: u64,
    pub cpu_percent: f32,
}

impl ResourceSample {
    /// Convert to the snapshot representation.
    pub fn stats(&self) -> ResourceStats {
        const GB: f64 = 1024.0 * 1024.0 * 1024.0;
        ResourceStats {
            cpu_percent: self.cpu_percent,
            memory_percent: self.memory_percent,
            memory_used_gb: self.memory_used_bytes as f64 / GB,
            memory_total_gb: self.memory_total_bytes as f64 / GB,
        }
    }
}

/// Source of resource observations.
pub trait ResourceSampler: Send {
    fn sample(&mut self) -> ResourceSample;
}

/// sysinfo-backed sampler for the host/container.
pub struct SystemSampler {
    system: sysinfo::System,
}

impl Default for SystemSampler {
    fn default() -> Self {
        Self {
            system: sysinfo::System::new(),
        }
    }
}

impl SystemSampler {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceSampler for SystemSampler {
    fn sample(&mut self) -> ResourceSample {
        self.system.refresh_memory();
        self.system.refresh_cpu_usage();

        let total = self.system.total_memory();
        let used = self.system.used_memory();
        let memory_percent = if total > 0 {
            used as f64 / total as f64
        } else {
            0.0
        };

        ResourceSample {
            memory_percent,
            memory_used_bytes: used,
            memory_total_bytes: total,
            cpu_percent: self.system.global_cpu_usage(),
        }
    }
}

/// Sampler that replays a fixed memory-percent script, then holds the last
/// value. CPU is reported as zero.
pub struct ScriptedSampler {
    script: Vec<f64>,
    position: usize,
}

impl ScriptedSampler {
    pub fn new(script: Vec<f64>) -> Self {
        Self {
            script,
            position: 0,
        }
    }
}

impl ResourceSampler for ScriptedSampler {
    fn sample(&mut self) -> ResourceSample {
        let memory_percent = self
            .script
            .get(self.position)
            .or_else(|| self.script.last())
            .copied()
            .unwrap_or(0.0);
        if self.position < self.script.len() {
            self.position += 1;
        }

        const TOTAL: u64 = 8 * 1024 * 1024 * 1024;
        ResourceSample {
            memory_percent,
            memory_used_bytes: (TOTAL as f64 * memory_percent) as u64,
            memory_total_bytes: TOTAL,
            cpu_percent: 0.0,
        }
    }
}
