//! Size-aware worker, batch and buffer sizing.
//!
//! Before bulk processing starts, the pipeline samples the first records of
//! the stream (they are replayed downstream first, so nothing is lost or
//! reordered) and derives a [`ScalingPlan`] from their average serialized
//! size:
//!
//! ```text
//! per_worker_memory = overhead_factor * min(records_per_batch * avg, bytes_per_batch)
//! workers           = max(1, min(requested, tier.max_workers, heap_budget / per_worker_memory))
//! records_per_batch = clamp(target_batch_memory / avg, 1, configured)
//! buffer_depth      = clamp(workers * tier.buffer_factor, min_buffer_depth, max_buffer_depth)
//! ```
//!
//! The constants are tuning defaults, not correctness guarantees; every one
//! of them is an [`AdaptiveConfig`] field.

use crate::error::{IngestError, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// A band of average record sizes and the concurrency it tolerates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeTier {
    pub name: String,
    /// Inclusive upper bound on the average record size; `None` is unbounded.
    pub max_avg_bytes: Option<usize>,
    pub max_workers: usize,
    /// Buffered records per worker.
    pub buffer_factor: usize,
}

impl SizeTier {
    fn new(name: &str, max_avg_bytes: Option<usize>, max_workers: usize, buffer_factor: usize) -> Self {
        Self {
            name: name.to_string(),
            max_avg_bytes,
            max_workers,
            buffer_factor,
        }
    }
}

/// Tiers from tiny (<500 B) to dense (>10 KiB).
#[must_use]
pub fn default_tiers() -> Vec<SizeTier> {
    vec![
        SizeTier::new("tiny", Some(499), 100, 100),
        SizeTier::new("small", Some(2047), 50, 100),
        SizeTier::new("medium", Some(5119), 25, 50),
        SizeTier::new("large", Some(10 * 1024), 10, 20),
        SizeTier::new("dense", None, 5, 10),
    ]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveConfig {
    pub enabled: bool,
    /// Records inspected at the head of the stream.
    pub sample_size: usize,
    /// Known average record size; skips sampling.
    pub avg_record_size_hint: Option<usize>,
    /// In-flight memory per worker as a multiple of the batch payload.
    pub overhead_factor: f64,
    /// Memory budget for in-flight batches. Defaults to
    /// `available_memory * heap_fraction`.
    pub heap_budget_bytes: Option<u64>,
    pub heap_fraction: f64,
    /// Payload a single batch should stay under.
    pub target_batch_memory: usize,
    pub min_buffer_depth: usize,
    pub max_buffer_depth: usize,
    /// Ordered by ascending `max_avg_bytes`; the last should be unbounded.
    pub tiers: Vec<SizeTier>,
}

impl Default for AdaptiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sample_size: 100,
            avg_record_size_hint: None,
            overhead_factor: 3.0,
            heap_budget_bytes: None,
            heap_fraction: 0.5,
            target_batch_memory: 8 * 1024 * 1024,
            min_buffer_depth: 100,
            max_buffer_depth: 50_000,
            tiers: default_tiers(),
        }
    }
}

impl AdaptiveConfig {
    /// # Errors
    /// Returns [`IngestError::Config`] for unusable tuning values.
    pub fn validate(&self) -> Result<()> {
        let bad = |msg: &str| Err(IngestError::Config(format!("adaptive: {msg}")));
        if self.tiers.is_empty() {
            return bad("at least one size tier is required");
        }
        if self.tiers.iter().any(|t| t.max_workers == 0) {
            return bad("tier max_workers must be non-zero");
        }
        if self.overhead_factor <= 0.0 || !(0.0..=1.0).contains(&self.heap_fraction) {
            return bad("overhead_factor must be positive and heap_fraction within [0, 1]");
        }
        if self.min_buffer_depth == 0 || self.min_buffer_depth > self.max_buffer_depth {
            return bad("buffer depth bounds are inverted or zero");
        }
        if self.target_batch_memory == 0 {
            return bad("target_batch_memory must be non-zero");
        }
        Ok(())
    }

    /// The tier `avg` falls into; sizes past every bound land in the last.
    #[must_use]
    pub fn tier_for(&self, avg: usize) -> Option<&SizeTier> {
        self.tiers
            .iter()
            .find(|t| t.max_avg_bytes.is_none_or(|max| avg <= max))
            .or_else(|| self.tiers.last())
    }
}

/// What the controller is asked to size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScalingInput {
    pub avg_record_size: usize,
    pub requested_workers: usize,
    pub records_per_batch: usize,
    pub bytes_per_batch: usize,
    pub heap_budget: u64,
}

/// Settings derived for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScalingPlan {
    pub tier: String,
    pub avg_record_size: usize,
    pub workers: usize,
    pub records_per_batch: usize,
    pub buffer_depth: usize,
    pub per_worker_memory: u64,
}

/// Derive a plan. Returns `None` only if `config` has no tiers.
#[must_use]
pub fn plan(config: &AdaptiveConfig, input: ScalingInput) -> Option<ScalingPlan> {
    let avg = input.avg_record_size.max(1);
    let tier = config.tier_for(avg)?;

    let records_per_batch = (config.target_batch_memory / avg).clamp(1, input.records_per_batch.max(1));
    let payload = (records_per_batch.saturating_mul(avg)).min(input.bytes_per_batch) as f64;
    let per_worker_memory = (config.overhead_factor * payload).ceil().max(1.0) as u64;
    let memory_cap = usize::try_from(input.heap_budget / per_worker_memory).unwrap_or(usize::MAX);

    let workers = input
        .requested_workers
        .min(tier.max_workers)
        .min(memory_cap)
        .max(1);
    let buffer_depth = workers
        .saturating_mul(tier.buffer_factor)
        .clamp(config.min_buffer_depth, config.max_buffer_depth);

    let plan = ScalingPlan {
        tier: tier.name.clone(),
        avg_record_size: avg,
        workers,
        records_per_batch,
        buffer_depth,
        per_worker_memory,
    };
    info!(
        tier = %plan.tier,
        avg_record_size = avg,
        requested_workers = input.requested_workers,
        workers = plan.workers,
        records_per_batch = plan.records_per_batch,
        buffer_depth = plan.buffer_depth,
        "adaptive scaling plan"
    );
    Some(plan)
}

/// Average serialized size of `sizes`, or `None` for an empty sample.
#[must_use]
pub fn average(sizes: &[usize]) -> Option<usize> {
    if sizes.is_empty() {
        return None;
    }
    Some(sizes.iter().sum::<usize>() / sizes.len())
}
