//! Process memory sampling between sources.

use sysinfo::{MemoryRefreshKind, Pid, ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::info;

/// One memory sample, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemorySample {
    /// Resident set size of this process.
    pub resident: u64,
    /// Virtual memory of this process.
    pub virtual_memory: u64,
    /// Memory in use system-wide.
    pub system_used: u64,
}

/// Samples the resident memory of the current process.
pub struct MemoryReporter {
    system: System,
    pid: Option<Pid>,
}

impl MemoryReporter {
    pub fn new() -> Self {
        Self {
            system: System::new(),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Takes a sample, or `None` if the platform does not expose process
    /// memory.
    pub fn sample(&mut self) -> Option<MemorySample> {
        let pid = self.pid?;
        self.system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );
        self.system
            .refresh_memory_specifics(MemoryRefreshKind::nothing().with_ram());

        let process = self.system.process(pid)?;
        Some(MemorySample {
            resident: process.memory(),
            virtual_memory: process.virtual_memory(),
            system_used: self.system.used_memory(),
        })
    }

    /// Logs a sample labelled with what just finished.
    pub fn report(&mut self, after: &str) {
        if let Some(sample) = self.sample() {
            info!(
                after,
                resident_mb = sample.resident / (1024 * 1024),
                virtual_mb = sample.virtual_memory / (1024 * 1024),
                system_used_mb = sample.system_used / (1024 * 1024),
                "Memory usage"
            );
        }
    }
}

impl Default for MemoryReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryReporter")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_current_process() {
        let mut reporter = MemoryReporter::new();
        if let Some(sample) = reporter.sample() {
            assert!(sample.resident > 0);
        }
    }
}
