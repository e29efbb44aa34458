//! Bounded record buffer between blocking decoders and the async pipeline.
//!
//! A [`BufferQueue`] is a FIFO of decoded records with a running byte
//! estimate. Decoder threads push through a [`QueueProducer`] and block while
//! the queue is at its depth limit or the memory throttle is paused; the
//! pipeline pops through a [`QueueConsumer`] and is never held back by the
//! throttle, so a paused run keeps draining what it already read.
//!
//! The throttle itself is a sampler task (see [`BufferQueue::spawn_sampler`])
//! that reads a [`MemoryProbe`] on an interval and flips the pause gate at
//! high and low water marks. Nothing in the queue is ever discarded.
//!
//! A paused producer may still refill an *empty* queue one record at a time,
//! so memory held by some other process can slow a run but never stall it.

mod memory;
mod throttle;

pub use memory::{MemoryProbe, SystemMemory};

use crate::error::{IngestError, Result};
use crate::record::{Record, serialized_len};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;

/// Throttle and queue tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// Run the memory sampler at all.
    pub enabled: bool,
    /// Pause producers above this occupancy.
    pub high_water: f64,
    /// Resume them below this occupancy.
    pub low_water: f64,
    pub sample_interval_ms: u64,
    /// Sampling interval while paused.
    pub paused_interval_ms: u64,
    /// Initial queue depth in records; the adaptive controller may change it.
    pub depth: usize,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            high_water: 0.85,
            low_water: 0.70,
            sample_interval_ms: 100,
            paused_interval_ms: 1000,
            depth: 5000,
        }
    }
}

impl ThrottleConfig {
    /// # Errors
    /// Returns [`IngestError::Config`] for inverted or out-of-range marks.
    pub fn validate(&self) -> Result<()> {
        if !(0.0 < self.low_water && self.low_water < self.high_water && self.high_water <= 1.0) {
            return Err(IngestError::Config(format!(
                "throttle marks must satisfy 0 < low_water ({}) < high_water ({}) <= 1",
                self.low_water, self.high_water
            )));
        }
        if self.sample_interval_ms == 0 || self.paused_interval_ms == 0 {
            return Err(IngestError::Config(
                "throttle intervals must be non-zero".into(),
            ));
        }
        if self.depth == 0 {
            return Err(IngestError::Config("throttle depth must be non-zero".into()));
        }
        Ok(())
    }

    #[must_use]
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    #[must_use]
    pub fn paused_interval(&self) -> Duration {
        Duration::from_millis(self.paused_interval_ms)
    }
}

/// Point-in-time view of a queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Records waiting.
    pub queued: usize,
    /// Current depth limit.
    pub depth: usize,
    pub bytes_queued: usize,
    pub pauses: u64,
    pub resumes: u64,
    /// Records handed to the consumer so far.
    pub processed: u64,
    pub paused: bool,
    pub last_occupancy: f64,
}

#[derive(Default)]
struct Inner {
    items: VecDeque<(Record, usize)>,
    bytes: usize,
    producers: usize,
    consumer_gone: bool,
    error: Option<IngestError>,
}

struct Shared {
    inner: Mutex<Inner>,
    /// Producers wait here for room or for the gate to open.
    space: Condvar,
    /// The consumer waits here for records or end of input.
    ready: Notify,
    depth: AtomicUsize,
    paused: AtomicBool,
    pauses: AtomicU64,
    resumes: AtomicU64,
    processed: AtomicU64,
    last_occupancy: AtomicU64,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Handle to a buffer queue, used for stats and tuning. Cheap to clone.
#[derive(Clone)]
pub struct BufferQueue {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for BufferQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferQueue")
            .field("stats", &self.stats())
            .finish()
    }
}

impl BufferQueue {
    /// Create a queue with one producer and its consumer.
    #[must_use]
    pub fn new(depth: usize) -> (QueueProducer, QueueConsumer) {
        let shared = Arc::new(Shared {
            inner: Mutex::new(Inner {
                producers: 1,
                ..Inner::default()
            }),
            space: Condvar::new(),
            ready: Notify::new(),
            depth: AtomicUsize::new(depth.max(1)),
            paused: AtomicBool::new(false),
            pauses: AtomicU64::new(0),
            resumes: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            last_occupancy: AtomicU64::new(0f64.to_bits()),
        });
        (
            QueueProducer {
                queue: Self {
                    shared: Arc::clone(&shared),
                },
            },
            QueueConsumer {
                queue: Self { shared },
            },
        )
    }

    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let s = &self.shared;
        let (queued, bytes_queued) = {
            let inner = s.lock();
            (inner.items.len(), inner.bytes)
        };
        QueueStats {
            queued,
            depth: s.depth.load(Ordering::Relaxed),
            bytes_queued,
            pauses: s.pauses.load(Ordering::Relaxed),
            resumes: s.resumes.load(Ordering::Relaxed),
            processed: s.processed.load(Ordering::Relaxed),
            paused: s.paused.load(Ordering::Acquire),
            last_occupancy: f64::from_bits(s.last_occupancy.load(Ordering::Relaxed)),
        }
    }

    /// Change the depth limit. Waiting producers re-check immediately.
    pub fn set_depth(&self, depth: usize) {
        self.shared.depth.store(depth.max(1), Ordering::Relaxed);
        let _guard = self.shared.lock();
        self.shared.space.notify_all();
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Close the gate. Returns false if it was already closed.
    pub(crate) fn pause(&self) -> bool {
        let was = self.shared.paused.swap(true, Ordering::AcqRel);
        if !was {
            self.shared.pauses.fetch_add(1, Ordering::Relaxed);
        }
        !was
    }

    /// Open the gate and wake producers. Returns false if it was already open.
    pub(crate) fn resume(&self) -> bool {
        let was = self.shared.paused.swap(false, Ordering::AcqRel);
        if was {
            self.shared.resumes.fetch_add(1, Ordering::Relaxed);
            let _guard = self.shared.lock();
            self.shared.space.notify_all();
        }
        was
    }

    pub(crate) fn record_occupancy(&self, occupancy: f64) {
        self.shared
            .last_occupancy
            .store(occupancy.to_bits(), Ordering::Relaxed);
    }

    /// True once the consumer is gone, or every producer is done and the
    /// queue has drained.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        let inner = self.shared.lock();
        inner.consumer_gone || (inner.producers == 0 && inner.items.is_empty())
    }
}

/// Blocking write side. Meant for decoder threads, never async tasks.
pub struct QueueProducer {
    queue: BufferQueue,
}

impl QueueProducer {
    /// Enqueue `record`, blocking while the queue is full or paused.
    ///
    /// The pause gate only holds while records are queued: a paused producer
    /// may still refill an empty queue one record at a time, so it runs at
    /// consumer speed instead of stopping.
    ///
    /// Returns false if the consumer has gone away; the caller should stop
    /// producing.
    pub fn push(&self, record: Record) -> bool {
        let size = serialized_len(&record);
        let s = &self.queue.shared;
        let mut inner = s.lock();
        loop {
            if inner.consumer_gone {
                return false;
            }
            let len = inner.items.len();
            let full = len >= s.depth.load(Ordering::Relaxed);
            let gated = s.paused.load(Ordering::Acquire) && len > 0;
            if !full && !gated {
                break;
            }
            // The timeout only bounds how stale a depth change can be; every
            // state change that matters also notifies.
            inner = s
                .space
                .wait_timeout(inner, Duration::from_millis(250))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        inner.items.push_back((record, size));
        inner.bytes += size;
        drop(inner);
        s.ready.notify_one();
        true
    }

    /// Report a terminal error to the consumer. Records already queued are
    /// delivered first.
    pub fn fail(&self, err: IngestError) {
        let s = &self.queue.shared;
        s.lock().error.get_or_insert(err);
        s.ready.notify_one();
    }

    /// True if the consumer has gone away.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.queue.shared.lock().consumer_gone
    }

    #[must_use]
    pub fn handle(&self) -> BufferQueue {
        self.queue.clone()
    }
}

impl Drop for QueueProducer {
    fn drop(&mut self) {
        let s = &self.queue.shared;
        s.lock().producers -= 1;
        s.ready.notify_one();
    }
}

/// Async read side.
pub struct QueueConsumer {
    queue: BufferQueue,
}

impl QueueConsumer {
    /// Next record in FIFO order, a producer error, or `None` at end of input.
    pub async fn pop(&mut self) -> Option<Result<Record>> {
        let s = Arc::clone(&self.queue.shared);
        loop {
            {
                let mut inner = s.lock();
                if let Some((record, size)) = inner.items.pop_front() {
                    inner.bytes -= size;
                    drop(inner);
                    s.processed.fetch_add(1, Ordering::Relaxed);
                    s.space.notify_one();
                    return Some(Ok(record));
                }
                if let Some(err) = inner.error.take() {
                    return Some(Err(err));
                }
                if inner.producers == 0 {
                    return None;
                }
            }
            s.ready.notified().await;
        }
    }

    #[must_use]
    pub fn handle(&self) -> BufferQueue {
        self.queue.clone()
    }
}

impl Drop for QueueConsumer {
    fn drop(&mut self) {
        let s = &self.queue.shared;
        s.lock().consumer_gone = true;
        s.space.notify_all();
    }
}
