//! Host capacity discovery and the share given to the guest.

use sysinfo::System;

/// Minimum vCPUs handed to the guest.
pub const MIN_CPUS: usize = 2;

/// Minimum guest memory.
pub const MIN_MEMORY_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// What the host has.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostResources {
    pub cpus: usize,
    pub memory_bytes: u64,
}

impl HostResources {
    pub fn discover() -> Self {
        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        let cpus = match sys.cpus().len() {
            0 => std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            n => n,
        };
        let resources = Self {
            cpus,
            memory_bytes: sys.total_memory(),
        };
        tracing::debug!(cpus = resources.cpus, memory_bytes = resources.memory_bytes, "Discovered host resources");
        resources
    }

    /// Three quarters of the host, never below the floors.
    pub fn guest_share(&self) -> GuestAllocation {
        GuestAllocation {
            cpus: (self.cpus * 3 / 4).max(MIN_CPUS),
            memory_bytes: (self.memory_bytes / 4 * 3).max(MIN_MEMORY_BYTES),
        }
    }
}

/// What the guest gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GuestAllocation {
    pub cpus: usize,
    pub memory_bytes: u64,
}
