//! Resource guardrails
//!
//! CPU and memory are sampled on a fixed interval and averaged over a
//! rolling window. A sustained average above a soft limit throttles the
//! rate controller; memory above the hard limit, or free disk below the
//! minimum, stops the crawl with a named guardrail.

use crate::config::GuardrailConfig;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::path::{Path, PathBuf};
use sysinfo::{Disks, System};

/// A hard limit that can fail a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Guardrail {
    Memory,
    Disk,
}

impl fmt::Display for Guardrail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory => f.write_str("memory"),
            Self::Disk => f.write_str("disk"),
        }
    }
}

/// One reading of system load
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LoadSample {
    pub cpu_percent: f32,
    pub memory_percent: f32,
    /// Free space on the volume holding the database, when known
    pub free_disk_mb: Option<u64>,
}

/// What the monitor concluded from the latest sample
#[derive(Debug, Clone, PartialEq)]
pub enum LoadSignal {
    Normal,
    /// Sustained load above a soft limit
    Soft(String),
    Hard(Guardrail),
}

/// Source of load samples
pub trait LoadSampler: Send {
    fn sample(&mut self) -> LoadSample;
}

/// Reads the host machine through `sysinfo`
pub struct SystemSampler {
    system: System,
    disks: Disks,
    data_path: PathBuf,
}

impl SystemSampler {
    /// Sampler watching the volume that holds `data_path`
    pub fn new(data_path: &Path) -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system,
            disks: Disks::new_with_refreshed_list(),
            data_path: data_path
                .canonicalize()
                .unwrap_or_else(|_| data_path.to_path_buf()),
        }
    }

    fn free_disk_mb(&mut self) -> Option<u64> {
        self.disks.refresh();
        // Longest mount point containing the data path
        self.disks
            .list()
            .iter()
            .filter(|disk| self.data_path.starts_with(disk.mount_point()))
            .max_by_key(|disk| disk.mount_point().as_os_str().len())
            .map(|disk| disk.available_space() / (1024 * 1024))
    }
}

impl LoadSampler for SystemSampler {
    fn sample(&mut self) -> LoadSample {
        self.system.refresh_cpu();
        self.system.refresh_memory();

        let total = self.system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            (self.system.used_memory() as f64 / total as f64 * 100.0) as f32
        };

        LoadSample {
            cpu_percent: self.system.global_cpu_info().cpu_usage(),
            memory_percent,
            free_disk_mb: self.free_disk_mb(),
        }
    }
}

/// Rolling-window evaluation of load samples
pub struct LoadMonitor {
    config: GuardrailConfig,
    window: VecDeque<LoadSample>,
    sampler: Box<dyn LoadSampler>,
}

impl LoadMonitor {
    pub fn new(config: &GuardrailConfig, sampler: Box<dyn LoadSampler>) -> Self {
        Self {
            config: config.clone(),
            window: VecDeque::with_capacity(config.window.max(1)),
            sampler,
        }
    }

    /// Monitor over the real machine
    pub fn system(config: &GuardrailConfig, data_path: &Path) -> Self {
        Self::new(config, Box::new(SystemSampler::new(data_path)))
    }

    /// Takes a sample and evaluates it
    pub fn check(&mut self) -> LoadSignal {
        let sample = self.sampler.sample();
        self.observe(sample)
    }

    /// Adds a sample to the window and evaluates the window
    pub fn observe(&mut self, sample: LoadSample) -> LoadSignal {
        let capacity = self.config.window.max(1);
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(sample);

        if let Some(free) = sample.free_disk_mb {
            if free < self.config.min_free_disk_mb {
                return LoadSignal::Hard(Guardrail::Disk);
            }
        }

        // Only a full window counts as sustained
        if self.window.len() < capacity {
            return LoadSignal::Normal;
        }

        let n = self.window.len() as f32;
        let cpu = self.window.iter().map(|s| s.cpu_percent).sum::<f32>() / n;
        let memory = self.window.iter().map(|s| s.memory_percent).sum::<f32>() / n;

        if memory >= self.config.memory_hard_percent {
            LoadSignal::Hard(Guardrail::Memory)
        } else if memory >= self.config.memory_soft_percent {
            LoadSignal::Soft(format!("memory at {:.0}%", memory))
        } else if cpu >= self.config.cpu_soft_percent {
            LoadSignal::Soft(format!("cpu at {:.0}%", cpu))
        } else {
            LoadSignal::Normal
        }
    }
}
