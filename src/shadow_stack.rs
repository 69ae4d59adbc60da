//! Per-thread shadow call stacks
//!
//! A `ThreadRecord` mirrors the classified frames of one runtime thread.
//! The runtime's own call depth keeps counting past the shadow stack's
//! capacity; frames deeper than that are simply not tracked and their
//! returns are recognised by depth, so overflow never corrupts the stack.

use crate::protocol::{MethodSource, MAX_STACK_DEPTH, THREAD_FRAMELESS, THREAD_ORPHANED};
use serde::Serialize;
use std::fmt;

/// A tracked frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Frame {
    pub function_id: u32,
    pub source: MethodSource,
    /// Runtime call depth at which this frame was entered
    pub depth: i32,
}

/// Returned by [`ShadowStack::push`] when the stack is full
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackOverflow {
    pub capacity: usize,
}

impl fmt::Display for StackOverflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "shadow stack full ({} frames)", self.capacity)
    }
}

impl std::error::Error for StackOverflow {}

/// Fixed-capacity frame stack
#[derive(Clone)]
pub struct ShadowStack {
    frames: [Frame; MAX_STACK_DEPTH],
    len: usize,
}

impl Default for ShadowStack {
    fn default() -> Self {
        Self {
            frames: [Frame::default(); MAX_STACK_DEPTH],
            len: 0,
        }
    }
}

impl fmt::Debug for ShadowStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.frames()).finish()
    }
}

impl ShadowStack {
    pub fn push(&mut self, frame: Frame) -> Result<(), StackOverflow> {
        if self.is_full() {
            return Err(StackOverflow {
                capacity: MAX_STACK_DEPTH,
            });
        }
        self.frames[self.len] = frame;
        self.len += 1;
        Ok(())
    }

    pub fn pop(&mut self) -> Option<Frame> {
        if self.len == 0 {
            return None;
        }
        self.len -= 1;
        Some(self.frames[self.len])
    }

    pub fn peek(&self) -> Option<&Frame> {
        self.frames[..self.len].last()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == MAX_STACK_DEPTH
    }

    /// Index of the top frame, or `THREAD_FRAMELESS` when empty
    pub fn top_index(&self) -> i32 {
        self.len as i32 - 1
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }
}

/// What a call-entry hook should do with a resolved method
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallAction {
    /// Frame pushed; emit BEGIN
    Emit,
    /// Tracked but silent (nested library or synchronization call)
    Suppress,
}

/// Shadow state of one runtime thread
#[derive(Debug, Clone)]
pub struct ThreadRecord {
    pub tid: u32,
    pub parent_tid: u32,
    pub stack: ShadowStack,
    /// Runtime call depth, `THREAD_FRAMELESS` before the first call
    pub vm_depth: i32,
    /// Nesting level inside known-library frames
    pub lib_depth: u32,
    /// Depth at which the stack overflowed, if currently overflowing
    overflow_depth: Option<i32>,
}

impl ThreadRecord {
    pub fn new(tid: u32, parent_tid: u32) -> Self {
        Self {
            tid,
            parent_tid,
            stack: ShadowStack::default(),
            vm_depth: THREAD_FRAMELESS,
            lib_depth: 0,
            overflow_depth: None,
        }
    }

    /// A thread first seen mid-flight with no known parent
    pub fn orphaned(tid: u32) -> Self {
        Self::new(tid, THREAD_ORPHANED)
    }

    /// Clear all frame tracking (trace start)
    pub fn reset(&mut self) {
        self.stack.clear();
        self.vm_depth = THREAD_FRAMELESS;
        self.lib_depth = 0;
        self.overflow_depth = None;
    }

    /// Account for a runtime call entry; returns the call's depth, or `None`
    /// when the shadow stack is full and the call is not tracked
    pub fn enter(&mut self) -> Option<i32> {
        self.vm_depth += 1;
        if self.overflow_depth.is_some() {
            return None;
        }
        if self.stack.is_full() {
            self.overflow_depth = Some(self.vm_depth);
            return None;
        }
        Some(self.vm_depth)
    }

    /// Account for a runtime call return; returns the returning call's
    /// depth, or `None` when that call was beyond the tracked region
    pub fn leave(&mut self) -> Option<i32> {
        let depth = self.vm_depth;
        self.vm_depth -= 1;
        if let Some(overflow) = self.overflow_depth {
            if depth >= overflow {
                if depth == overflow {
                    self.overflow_depth = None;
                }
                return None;
            }
            self.overflow_depth = None;
        }
        Some(depth)
    }

    /// Apply library-depth suppression for a call and push its frame
    pub fn push_call(&mut self, frame: Frame) -> CallAction {
        match frame.source {
            MethodSource::KnownLibrary => {
                self.lib_depth += 1;
                if self.lib_depth > 1 {
                    return CallAction::Suppress;
                }
            }
            MethodSource::Synchronization if self.lib_depth > 0 => {
                return CallAction::Suppress;
            }
            _ => {}
        }
        match self.stack.push(frame) {
            Ok(()) => CallAction::Emit,
            Err(_) => CallAction::Suppress,
        }
    }

    /// Mirror of [`ThreadRecord::push_call`] for a return at `depth`;
    /// yields the frame to close with an END event
    pub fn pop_return(&mut self, source: MethodSource, depth: i32) -> Option<Frame> {
        match source {
            MethodSource::KnownLibrary => {
                self.lib_depth = self.lib_depth.saturating_sub(1);
                if self.lib_depth > 0 {
                    return None;
                }
            }
            MethodSource::Synchronization if self.lib_depth > 0 => return None,
            _ => {}
        }
        match self.stack.peek() {
            Some(top) if top.depth == depth => self.stack.pop(),
            _ => None,
        }
    }

    /// Close the frame opened at `depth` for a method that is now
    /// blacklisted, undoing its library depth
    pub fn close_frame(&mut self, depth: i32) -> Option<Frame> {
        match self.stack.peek() {
            Some(top) if top.depth == depth => {
                let frame = self.stack.pop()?;
                if frame.source == MethodSource::KnownLibrary {
                    self.lib_depth = self.lib_depth.saturating_sub(1);
                }
                Some(frame)
            }
            _ => None,
        }
    }

    pub fn snapshot(&self) -> ThreadSnapshot {
        ThreadSnapshot {
            tid: self.tid,
            parent_tid: self.parent_tid,
            stack_depth: self.stack.len(),
            vm_depth: self.vm_depth,
            lib_depth: self.lib_depth,
        }
    }
}

/// Point-in-time view of a thread record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ThreadSnapshot {
    pub tid: u32,
    pub parent_tid: u32,
    pub stack_depth: usize,
    pub vm_depth: i32,
    pub lib_depth: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(function_id: u32, source: MethodSource, depth: i32) -> Frame {
        Frame {
            function_id,
            source,
            depth,
        }
    }

    #[test]
    fn test_stack_push_pop() {
        let mut stack = ShadowStack::default();
        assert_eq!(stack.top_index(), THREAD_FRAMELESS);
        stack.push(frame(1, MethodSource::User, 0)).unwrap();
        stack.push(frame(2, MethodSource::User, 1)).unwrap();
        assert_eq!(stack.len(), 2);
        assert_eq!(stack.peek().unwrap().function_id, 2);
        assert_eq!(stack.pop().unwrap().function_id, 2);
        assert_eq!(stack.pop().unwrap().function_id, 1);
        assert_eq!(stack.pop(), None);
    }

    #[test]
    fn test_stack_overflow_signal() {
        let mut stack = ShadowStack::default();
        for i in 0..MAX_STACK_DEPTH {
            stack.push(frame(i as u32, MethodSource::User, i as i32)).unwrap();
        }
        assert!(stack.is_full());
        let err = stack.push(frame(999, MethodSource::User, 999)).unwrap_err();
        assert_eq!(err.capacity, MAX_STACK_DEPTH);
        assert_eq!(stack.len(), MAX_STACK_DEPTH);
    }

    #[test]
    fn test_enter_leave_tracks_depth() {
        let mut th = ThreadRecord::new(1, THREAD_ORPHANED);
        assert_eq!(th.enter(), Some(0));
        assert_eq!(th.enter(), Some(1));
        assert_eq!(th.leave(), Some(1));
        assert_eq!(th.leave(), Some(0));
        assert_eq!(th.vm_depth, THREAD_FRAMELESS);
    }

    #[test]
    fn test_overflow_region_is_untracked() {
        let mut th = ThreadRecord::new(1, 0);
        for _ in 0..MAX_STACK_DEPTH {
            let depth = th.enter().unwrap();
            assert_eq!(th.push_call(frame(1, MethodSource::User, depth)), CallAction::Emit);
        }
        assert_eq!(th.enter(), None);
        assert_eq!(th.enter(), None);
        assert_eq!(th.leave(), None);
        assert_eq!(th.leave(), None);
        let depth = th.leave().unwrap();
        assert_eq!(depth, MAX_STACK_DEPTH as i32 - 1);
        assert!(th.pop_return(MethodSource::User, depth).is_some());
    }

    #[test]
    fn test_library_depth_suppresses_nested_calls() {
        let mut th = ThreadRecord::new(1, 0);
        let outer = th.enter().unwrap();
        assert_eq!(
            th.push_call(frame(5, MethodSource::KnownLibrary, outer)),
            CallAction::Emit
        );
        let inner = th.enter().unwrap();
        assert_eq!(
            th.push_call(frame(6, MethodSource::KnownLibrary, inner)),
            CallAction::Suppress
        );
        let sync = th.enter().unwrap();
        assert_eq!(
            th.push_call(frame(7, MethodSource::Synchronization, sync)),
            CallAction::Suppress
        );
        assert_eq!(th.lib_depth, 2);

        let d = th.leave().unwrap();
        assert_eq!(th.pop_return(MethodSource::Synchronization, d), None);
        let d = th.leave().unwrap();
        assert_eq!(th.pop_return(MethodSource::KnownLibrary, d), None);
        let d = th.leave().unwrap();
        assert_eq!(
            th.pop_return(MethodSource::KnownLibrary, d).unwrap().function_id,
            5
        );
        assert_eq!(th.lib_depth, 0);
        assert!(th.stack.is_empty());
    }

    #[test]
    fn test_synchronization_outside_library_is_traced() {
        let mut th = ThreadRecord::new(1, 0);
        let d = th.enter().unwrap();
        assert_eq!(
            th.push_call(frame(3, MethodSource::Synchronization, d)),
            CallAction::Emit
        );
    }

    #[test]
    fn test_close_frame_by_depth() {
        let mut th = ThreadRecord::new(1, 0);
        let d = th.enter().unwrap();
        th.push_call(frame(8, MethodSource::KnownLibrary, d));
        assert_eq!(th.lib_depth, 1);

        // Wrong depth leaves the frame alone
        assert_eq!(th.close_frame(d + 1), None);
        let d = th.leave().unwrap();
        assert_eq!(th.close_frame(d).unwrap().function_id, 8);
        assert_eq!(th.lib_depth, 0);
        assert!(th.stack.is_empty());
    }

    #[test]
    fn test_return_without_matching_frame() {
        let mut th = ThreadRecord::new(1, 0);
        // Return from a frame entered before tracking started
        let d = th.leave().unwrap();
        assert_eq!(th.pop_return(MethodSource::User, d), None);
    }

    #[test]
    fn test_reset_clears_counters() {
        let mut th = ThreadRecord::new(3, 1);
        let d = th.enter().unwrap();
        th.push_call(frame(1, MethodSource::KnownLibrary, d));
        th.reset();
        let snap = th.snapshot();
        assert_eq!(snap.stack_depth, 0);
        assert_eq!(snap.vm_depth, THREAD_FRAMELESS);
        assert_eq!(snap.lib_depth, 0);
        assert_eq!(snap.tid, 3);
        assert_eq!(snap.parent_tid, 1);
    }
}
