//! Degradation counters
//!
//! The hot path never reports errors, so everything that goes wrong (or
//! merely happens) on the way to the collector is counted here instead.
//! Counters are relaxed atomics shared between application threads, the
//! dispatch thread and the timer thread.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Diagnostics {
    /// Events appended to a batch
    pub encoded_batched: AtomicU64,
    /// Oversized events sent without a batch
    pub encoded_raw: AtomicU64,
    /// Forced flushes that found a non-empty batch
    pub flushed: AtomicU64,
    /// Batches restarted after finalizing
    pub resets: AtomicU64,
    /// Batch frames offered to the ring buffer
    pub batches: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub failed_sends: AtomicU64,
    /// Sends delayed to let a slow receiver catch up
    pub jittered_sends: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    ///
    /// Ring, cache and thread-table figures are filled in by the engine.
    pub fn snapshot(&self) -> DiagnosticsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        DiagnosticsSnapshot {
            encoded_batched: load(&self.encoded_batched),
            encoded_raw: load(&self.encoded_raw),
            flushed: load(&self.flushed),
            resets: load(&self.resets),
            batches: load(&self.batches),
            bytes_sent: load(&self.bytes_sent),
            failed_sends: load(&self.failed_sends),
            jittered_sends: load(&self.jittered_sends),
            ..DiagnosticsSnapshot::default()
        }
    }
}

/// Serializable view of [`Diagnostics`] plus engine-level figures
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct DiagnosticsSnapshot {
    pub encoded_batched: u64,
    pub encoded_raw: u64,
    pub flushed: u64,
    pub resets: u64,
    pub batches: u64,
    /// High-water mark of ring buffer occupancy in bytes
    pub max_buf_used: u64,
    pub bytes_sent: u64,
    pub failed_sends: u64,
    pub jittered_sends: u64,
    /// Frames dropped because the ring buffer was full
    pub ring_rejections: u64,
    /// Function ids handed out
    pub methods: u64,
    /// Methods that classified as blacklisted
    pub blacklisted_methods: u64,
    /// Tids handed out
    pub threads: u64,
    pub ring_used: u64,
    pub ring_capacity: u64,
}

impl DiagnosticsSnapshot {
    /// Fraction of frames lost to a full ring buffer (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        let offered = self.batches + self.encoded_raw;
        if offered == 0 {
            0.0
        } else {
            self.ring_rejections as f64 / offered as f64
        }
    }

    /// Current ring buffer utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.ring_capacity == 0 {
            0.0
        } else {
            self.ring_used as f64 / self.ring_capacity as f64
        }
    }
}
