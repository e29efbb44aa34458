use std::sync::{Mutex, PoisonError};
use sysinfo::System;

/// Source of memory-pressure readings for the throttle and the adaptive
/// controller.
pub trait MemoryProbe: Send + Sync {
    /// Fraction of memory in use, in `[0, 1]`.
    fn occupancy(&self) -> f64;

    /// Bytes that can still be allocated without pressure.
    fn available_bytes(&self) -> u64;
}

/// Host memory as reported by the operating system.
///
/// Rust has no managed heap to sample, so occupancy is `used / total` for the
/// whole machine (or container, where the OS exposes the cgroup limit).
pub struct SystemMemory {
    system: Mutex<System>,
}

impl SystemMemory {
    #[must_use]
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }

    fn refreshed<T>(&self, read: impl FnOnce(&System) -> T) -> T {
        let mut system = self.system.lock().unwrap_or_else(PoisonError::into_inner);
        system.refresh_memory();
        read(&system)
    }
}

impl Default for SystemMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryProbe for SystemMemory {
    fn occupancy(&self) -> f64 {
        self.refreshed(|s| {
            let total = s.total_memory();
            if total == 0 {
                return 0.0;
            }
            let available = s.available_memory().min(total);
            (total - available) as f64 / total as f64
        })
    }

    fn available_bytes(&self) -> u64 {
        self.refreshed(System::available_memory)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_readings_are_sane() {
        let probe = SystemMemory::new();
        let occ = probe.occupancy();
        assert!((0.0..=1.0).contains(&occ));
        assert!(probe.available_bytes() > 0);
    }
}
