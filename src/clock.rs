//! Wall clock and engine identities
//!
//! Event timestamps are microseconds since the Unix epoch, matching the
//! `PROCESS_FREQUENCY` the engine announces. Engine identities come from a
//! process-wide monotonic counter and feed exception correlation ids.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Microseconds since the Unix epoch
///
/// A clock set before the epoch reads as 0.
pub fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

/// Monotonic sequence of identities
///
/// Usable as a `static`; increments are lock-free.
#[derive(Debug)]
pub struct Sequence {
    counter: AtomicU64,
}

impl Sequence {
    pub const fn new() -> Self {
        Self {
            counter: AtomicU64::new(0),
        }
    }

    /// Next identity, starting at 1
    pub fn next(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last identity handed out (0 if none)
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

static ENGINES: Sequence = Sequence::new();

/// Identity for a newly created engine
pub fn next_engine_id() -> u64 {
    ENGINES.next()
}
