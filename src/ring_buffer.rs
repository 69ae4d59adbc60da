//! Bounded byte ring between batching and dispatch
//!
//! This module decouples the hot path (encoding and batching on application
//! threads) from the cold path (socket I/O on the dispatch thread).
//!
//! # Design
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ APPLICATION THREADS (Hot Path)                                  │
//! │   hook → encode → batcher.append() → ring.offer(frame)          │
//! └─────────────────────────────────────────────────────────────────┘
//!                          │
//!                          │ HeapRb<u8>, length-framed chunks
//!                          ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │ DISPATCH THREAD (Cold Path)                                     │
//! │   loop {                                                        │
//! │     peek i16 length → poll frame → transport.send(frame)        │
//! │   }                                                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every frame starts with its own little-endian `i16` length, so the
//! consumer never needs side-channel bookkeeping. Offers are all-or-nothing:
//! a frame that does not fit is rejected whole and the caller decides what
//! to do with it (the batcher drops it and counts the rejection).

use crate::error::{Result, TraceError};
use parking_lot::Mutex;
use ringbuf::{traits::*, HeapRb};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Default ring capacity: 10 MiB
pub const DEFAULT_RING_CAPACITY: usize = 10 * 1024 * 1024;

/// State of the next frame in the ring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Peek {
    /// Nothing buffered
    Empty,
    /// A complete frame of this many bytes is available
    Frame(usize),
    /// The length prefix is unusable; the consumer must stop
    Desync(i64),
}

/// Length-framed byte ring shared by producers and one consumer
pub struct ByteRing {
    buffer: Mutex<HeapRb<u8>>,
    capacity: usize,

    /// Metrics: frames accepted
    total_offered: AtomicU64,

    /// Metrics: frames rejected (backpressure)
    total_rejected: AtomicU64,

    /// Metrics: occupancy high-water mark in bytes
    max_used: AtomicU64,
}

impl fmt::Debug for ByteRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ByteRing")
            .field("capacity", &self.capacity)
            .field("used", &self.used())
            .finish()
    }
}

impl ByteRing {
    /// Create a ring holding at most `capacity` bytes
    ///
    /// # Errors
    ///
    /// Returns [`TraceError::ZeroCapacity`] if capacity is 0.
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(TraceError::ZeroCapacity);
        }
        Ok(Self {
            buffer: Mutex::new(HeapRb::<u8>::new(capacity)),
            capacity,
            total_offered: AtomicU64::new(0),
            total_rejected: AtomicU64::new(0),
            max_used: AtomicU64::new(0),
        })
    }

    /// Enqueue one self-describing frame (hot path)
    ///
    /// Returns `false` without writing anything when the frame does not fit.
    pub fn offer(&self, frame: &[u8]) -> bool {
        let mut buffer = self.buffer.lock();
        if buffer.vacant_len() < frame.len() {
            drop(buffer);
            self.total_rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        buffer.push_slice(frame);
        let used = buffer.occupied_len();
        drop(buffer);
        self.total_offered.fetch_add(1, Ordering::Relaxed);
        self.max_used.fetch_max(used as u64, Ordering::Relaxed);
        true
    }

    /// Inspect the next frame's declared length without consuming it
    pub fn peek(&self) -> Peek {
        Self::peek_locked(&self.buffer.lock())
    }

    fn peek_locked(buffer: &HeapRb<u8>) -> Peek {
        let (head, tail) = buffer.as_slices();
        let mut bytes = head.iter().chain(tail.iter());
        let (Some(&lo), Some(&hi)) = (bytes.next(), bytes.next()) else {
            return Peek::Empty;
        };
        let declared = i16::from_le_bytes([lo, hi]);
        if declared <= 0 || declared as usize > buffer.occupied_len() {
            return Peek::Desync(declared as i64);
        }
        Peek::Frame(declared as usize)
    }

    /// Move the next frame into `out`, replacing its contents
    ///
    /// Returns the same [`Peek`] a call to [`ByteRing::peek`] would have;
    /// only `Peek::Frame` consumes bytes.
    pub fn poll(&self, out: &mut Vec<u8>) -> Peek {
        let mut buffer = self.buffer.lock();
        let next = Self::peek_locked(&buffer);
        if let Peek::Frame(len) = next {
            out.clear();
            out.resize(len, 0);
            buffer.pop_slice(out);
        }
        next
    }

    /// Bytes currently buffered
    pub fn used(&self) -> usize {
        self.buffer.lock().occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.used() == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Get buffer statistics
    pub fn stats(&self) -> RingStats {
        RingStats {
            total_offered: self.total_offered.load(Ordering::Relaxed),
            total_rejected: self.total_rejected.load(Ordering::Relaxed),
            max_used: self.max_used.load(Ordering::Relaxed),
            current_size: self.used(),
            capacity: self.capacity,
        }
    }
}

/// Ring buffer statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RingStats {
    pub total_offered: u64,
    pub total_rejected: u64,
    pub max_used: u64,
    pub current_size: usize,
    pub capacity: usize,
}

impl RingStats {
    /// Calculate drop rate (0.0 to 1.0)
    pub fn drop_rate(&self) -> f64 {
        let attempts = self.total_offered + self.total_rejected;
        if attempts == 0 {
            0.0
        } else {
            self.total_rejected as f64 / attempts as f64
        }
    }

    /// Calculate buffer utilization (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        self.current_size as f64 / self.capacity as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(len: usize, fill: u8) -> Vec<u8> {
        let mut f = vec![fill; len];
        f[..2].copy_from_slice(&(len as i16).to_le_bytes());
        f
    }

    #[test]
    fn test_ring_buffer_creation() {
        let ring = ByteRing::new(1024).unwrap();
        let stats = ring.stats();
        assert_eq!(stats.capacity, 1024);
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.total_offered, 0);
        assert_eq!(stats.total_rejected, 0);
        assert_eq!(ring.peek(), Peek::Empty);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        assert!(matches!(ByteRing::new(0), Err(TraceError::ZeroCapacity)));
    }

    #[test]
    fn test_offer_poll_preserves_frames() {
        let ring = ByteRing::new(1024).unwrap();
        assert!(ring.offer(&frame(10, 0xaa)));
        assert!(ring.offer(&frame(20, 0xbb)));
        assert_eq!(ring.used(), 30);
        assert_eq!(ring.peek(), Peek::Frame(10));

        let mut out = Vec::new();
        assert_eq!(ring.poll(&mut out), Peek::Frame(10));
        assert_eq!(out, frame(10, 0xaa));
        assert_eq!(ring.poll(&mut out), Peek::Frame(20));
        assert_eq!(out, frame(20, 0xbb));
        assert_eq!(ring.poll(&mut out), Peek::Empty);
        assert!(ring.is_empty());
    }

    #[test]
    fn test_backpressure_rejects_whole_frame() {
        let ring = ByteRing::new(32).unwrap();
        assert!(ring.offer(&frame(20, 1)));
        assert!(!ring.offer(&frame(20, 2)));
        assert_eq!(ring.used(), 20);

        let stats = ring.stats();
        assert_eq!(stats.total_offered, 1);
        assert_eq!(stats.total_rejected, 1);
        assert_eq!(stats.drop_rate(), 0.5);
    }

    #[test]
    fn test_frames_wrap_around() {
        let ring = ByteRing::new(50).unwrap();
        let mut out = Vec::new();
        for round in 0..10u8 {
            assert!(ring.offer(&frame(30, round)));
            assert_eq!(ring.poll(&mut out), Peek::Frame(30));
            assert_eq!(out[29], round);
        }
        assert_eq!(ring.stats().max_used, 30);
    }

    #[test]
    fn test_bad_length_is_desync() {
        let ring = ByteRing::new(64).unwrap();
        assert!(ring.offer(&[0, 0, 1, 2]));
        assert_eq!(ring.peek(), Peek::Desync(0));
        let mut out = Vec::new();
        assert_eq!(ring.poll(&mut out), Peek::Desync(0));
        assert_eq!(ring.used(), 4);
    }

    #[test]
    fn test_utilization_calculation() {
        let stats = RingStats {
            total_offered: 95,
            total_rejected: 5,
            max_used: 50,
            current_size: 50,
            capacity: 1024,
        };
        assert_eq!(stats.drop_rate(), 0.05);
        assert_eq!(stats.utilization(), 50.0 / 1024.0);
    }
}
