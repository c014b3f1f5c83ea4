use std::fmt::Debug;

use sysinfo::{Process, ProcessRefreshKind, ProcessesToUpdate, RefreshKind, System};

/// Admission ceilings checked synchronously when a job is submitted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ResourceLimits {
    /// Maximum pending plus running jobs.
    pub max_total_jobs: Option<usize>,
    /// Maximum resident memory of this process, in bytes.
    pub max_memory_bytes: Option<u64>,
}

pub trait MemoryProbe: Send + Sync + Debug {
    /// Resident memory of the current process in bytes, if it can be read.
    fn resident_bytes(&self) -> Option<u64>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SysinfoMemoryProbe;

impl MemoryProbe for SysinfoMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        let pid = sysinfo::get_current_pid().ok()?;

        let mut system = System::new_with_specifics(RefreshKind::nothing());
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            false,
            ProcessRefreshKind::nothing().with_memory(),
        );

        system.process(pid).map(Process::memory)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FixedMemoryProbe(pub u64);

impl MemoryProbe for FixedMemoryProbe {
    fn resident_bytes(&self) -> Option<u64> {
        Some(self.0)
    }
}
