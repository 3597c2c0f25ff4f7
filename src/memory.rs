// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! Memory usage of the running process, used by the runner's memory-limit safeguard.

#[cfg(test)]
use mockall::automock;
#[cfg(all(feature = "mocks", not(test)))]
use mockall::automock;
use std::sync::Mutex;
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

#[cfg_attr(any(test, feature = "mocks"), automock)]
pub trait MemoryProbe: Send + Sync {
    /// Resident memory of the process in bytes, `None` when it cannot be read.
    fn current_usage(&self) -> Option<u64>;
}

/// Reads the resident memory of the current process from the OS.
pub struct ProcessMemoryProbe {
    pid: Option<Pid>,
    system: Mutex<System>,
}

impl ProcessMemoryProbe {
    pub fn new() -> ProcessMemoryProbe {
        ProcessMemoryProbe {
            pid: sysinfo::get_current_pid().ok(),
            system: Mutex::new(System::new()),
        }
    }
}

impl Default for ProcessMemoryProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for ProcessMemoryProbe {
    fn current_usage(&self) -> Option<u64> {
        let pid = self.pid?;
        let mut system = self.system.lock().ok()?;

        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );

        system.process(pid).map(|process| process.memory())
    }
}
