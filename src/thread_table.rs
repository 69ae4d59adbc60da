//! Runtime thread to shadow thread mapping
//!
//! Lookups are lock-free. Registration takes the table lock, which also
//! guards the monotonic tid counter; tids are never reused, even after a
//! thread ends.

use crate::protocol::THREAD_ORPHANED;
use crate::shadow_stack::ThreadRecord;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::trace;

/// Opaque identity of a runtime thread, supplied by the host
pub type ThreadKey = u64;

/// Shared handle to a thread record
pub type ThreadHandle = Arc<Mutex<ThreadRecord>>;

#[derive(Default)]
pub struct ThreadTable {
    threads: SkipMap<ThreadKey, ThreadHandle>,
    next_tid: Mutex<u32>,
}

impl ThreadTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: ThreadKey) -> Option<ThreadHandle> {
        self.threads.get(&key).map(|e| Arc::clone(e.value()))
    }

    /// Wire tid of a known thread
    pub fn tid_of(&self, key: ThreadKey) -> Option<u32> {
        self.threads.get(&key).map(|e| e.value().lock().tid)
    }

    /// Record for `key`, registering it as orphaned if it was never started
    pub fn get_or_register(&self, key: ThreadKey) -> ThreadHandle {
        if let Some(handle) = self.get(key) {
            return handle;
        }
        let mut next = self.next_tid.lock();
        if let Some(handle) = self.get(key) {
            return handle;
        }
        *next += 1;
        let handle = Arc::new(Mutex::new(ThreadRecord::orphaned(*next)));
        self.threads.insert(key, Arc::clone(&handle));
        trace!(thread = key, tid = *next, "registered unseen thread");
        handle
    }

    /// Register a newly started thread under its parent
    ///
    /// The parent's tid is recorded when the parent is known, otherwise the
    /// thread is orphaned. Returns the new record.
    pub fn start(&self, key: ThreadKey, parent: ThreadKey) -> ThreadHandle {
        let parent_tid = self.tid_of(parent).unwrap_or(THREAD_ORPHANED);
        let mut next = self.next_tid.lock();
        *next += 1;
        let handle = Arc::new(Mutex::new(ThreadRecord::new(*next, parent_tid)));
        self.threads.insert(key, Arc::clone(&handle));
        trace!(thread = key, tid = *next, parent_tid, "thread started");
        handle
    }

    /// Forget a thread, returning its tid
    pub fn remove(&self, key: ThreadKey) -> Option<u32> {
        let _guard = self.next_tid.lock();
        self.threads.remove(&key).map(|e| e.value().lock().tid)
    }

    /// Number of live thread records
    pub fn len(&self) -> usize {
        self.threads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.is_empty()
    }

    /// Total tids handed out
    pub fn tids_assigned(&self) -> u32 {
        *self.next_tid.lock()
    }
}
