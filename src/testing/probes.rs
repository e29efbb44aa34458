//! Memory probes with predictable readings.

use crate::backpressure::MemoryProbe;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

/// Always reports the same occupancy and free memory.
#[derive(Debug)]
pub struct FixedProbe {
    occupancy: AtomicU64,
    available: u64,
}

impl FixedProbe {
    #[must_use]
    pub fn new(occupancy: f64, available_bytes: u64) -> Self {
        Self {
            occupancy: AtomicU64::new(occupancy.to_bits()),
            available: available_bytes,
        }
    }

    /// Plenty of memory, no pressure.
    #[must_use]
    pub fn relaxed() -> Self {
        Self::new(0.1, 16 * 1024 * 1024 * 1024)
    }

    /// Change the reported occupancy.
    pub fn set(&self, occupancy: f64) {
        self.occupancy.store(occupancy.to_bits(), Ordering::Relaxed);
    }
}

impl MemoryProbe for FixedProbe {
    fn occupancy(&self) -> f64 {
        f64::from_bits(self.occupancy.load(Ordering::Relaxed))
    }

    fn available_bytes(&self) -> u64 {
        self.available
    }
}

/// Replays a script of occupancy readings, one per sample, then repeats the
/// last one forever.
#[derive(Debug)]
pub struct ScriptedProbe {
    script: Mutex<VecDeque<f64>>,
    last: AtomicU64,
    reads: AtomicU64,
    available: u64,
}

impl ScriptedProbe {
    pub fn new(script: impl IntoIterator<Item = f64>) -> Self {
        Self {
            script: Mutex::new(script.into_iter().collect()),
            last: AtomicU64::new(0f64.to_bits()),
            reads: AtomicU64::new(0),
            available: 16 * 1024 * 1024 * 1024,
        }
    }

    /// Number of occupancy readings taken so far.
    #[must_use]
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }
}

impl MemoryProbe for ScriptedProbe {
    fn occupancy(&self) -> f64 {
        self.reads.fetch_add(1, Ordering::Relaxed);
        let next = self
            .script
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        match next {
            Some(v) => {
                self.last.store(v.to_bits(), Ordering::Relaxed);
                v
            }
            None => f64::from_bits(self.last.load(Ordering::Relaxed)),
        }
    }

    fn available_bytes(&self) -> u64 {
        self.available
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_then_repeat() {
        let p = ScriptedProbe::new([0.5, 0.9]);
        let seen: Vec<f64> = (0..4).map(|_| p.occupancy()).collect();
        assert_eq!(seen, vec![0.5, 0.9, 0.9, 0.9]);
        assert_eq!(p.reads(), 4);
    }
}
