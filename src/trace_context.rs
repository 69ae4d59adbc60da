// Trace contexts: one traced unit of work per thread-ancestry group.
//
// A context is opened by the thread that starts the trace. While it is
// active, events from that thread and from any thread in the same group are
// reported; everything else is noise. Starting a second context for a group
// that already has one is a no-op, and contexts only ever end explicitly.

use crate::thread_table::ThreadKey;
use crossbeam_skiplist::SkipMap;
use parking_lot::Mutex;
use std::fmt;

/// Opaque identity of a thread-ancestry group, supplied by the host
pub type GroupKey = u64;

/// Lifecycle of a trace context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Active,
    Ended,
}

/// One traced unit of work
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub group: GroupKey,
    /// Thread that opened the context
    pub thread: ThreadKey,
    /// Wire tid of that thread
    pub tid: u32,
    /// Microseconds since the Unix epoch
    pub started_at: i64,
    pub state: ContextState,
}

impl TraceContext {
    pub fn new(group: GroupKey, thread: ThreadKey, tid: u32, started_at: i64) -> Self {
        Self {
            group,
            thread,
            tid,
            started_at,
            state: ContextState::Active,
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == ContextState::Active
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "trace(group={}, tid={}, started_at={}, {:?})",
            self.group, self.tid, self.started_at, self.state
        )
    }
}

/// Trace context lifecycle errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceContextError {
    /// A context is already active for this group
    AlreadyActive(GroupKey),
    /// No context is active for this group
    NotActive(GroupKey),
}

impl fmt::Display for TraceContextError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AlreadyActive(group) => {
                write!(f, "Trace already active for thread group {}", group)
            }
            Self::NotActive(group) => write!(f, "No active trace for thread group {}", group),
        }
    }
}

impl std::error::Error for TraceContextError {}

/// Active trace contexts keyed by thread group
#[derive(Default)]
pub struct ContextTable {
    active: SkipMap<GroupKey, TraceContext>,
    lifecycle: Mutex<()>,
}

impl ContextTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a context; fails if the group already has one
    pub fn begin(&self, context: TraceContext) -> Result<(), TraceContextError> {
        let _guard = self.lifecycle.lock();
        if self.active.contains_key(&context.group) {
            return Err(TraceContextError::AlreadyActive(context.group));
        }
        self.active.insert(context.group, context);
        Ok(())
    }

    /// Close and return the group's context
    pub fn end(&self, group: GroupKey) -> Result<TraceContext, TraceContextError> {
        let _guard = self.lifecycle.lock();
        let entry = self
            .active
            .remove(&group)
            .ok_or(TraceContextError::NotActive(group))?;
        let mut context = entry.value().clone();
        context.state = ContextState::Ended;
        Ok(context)
    }

    /// Lock-free check used by every hook
    pub fn is_active(&self, group: GroupKey) -> bool {
        self.active.contains_key(&group)
    }

    pub fn get(&self, group: GroupKey) -> Option<TraceContext> {
        self.active.get(&group).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.active.len()
    }

    pub fn is_empty(&self) -> bool {
        self.active.is_empty()
    }
}
