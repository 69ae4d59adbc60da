//! MTU-aware event batching
//!
//! Encoded events are packed into batch frames no larger than
//! [`BATCH_PACKET_SIZE`] and handed to the ring buffer:
//!
//! ```text
//! ┌────────┬──────┬──────────┬──────────┬─────┬─────────┬─────────┬───
//! │ len i16│ 0xfa │ count i16│ seq u32  │ pid │ event 1 │ event 2 │ ...
//! └────────┴──────┴──────────┴──────────┴─────┴─────────┴─────────┴───
//! ```
//!
//! Each event takes exactly one of four paths:
//!
//! - fits the current batch: appended
//! - fits a fresh batch: current batch finalized, event appended to the next
//! - fits the extended bound: current batch finalized, event sent in a
//!   dedicated single-event batch
//! - larger still: sent raw, unbatched
//!
//! Append-or-flush is one critical section since application threads and
//! the timer's forced flush both call it. Empty batches are never sent.

use crate::diagnostics::Diagnostics;
use crate::error::DecodeError;
use crate::event::Event;
use crate::protocol::{
    EventType, BATCH_HEADER_LEN, BATCH_PACKET_SIZE, MAX_BATCH_PACKET_SIZE,
};
use crate::ring_buffer::ByteRing;
use crate::wire::{WireReader, WireWriter};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use tracing::{trace, warn};

struct BatchState {
    buf: Box<[u8; MAX_BATCH_PACKET_SIZE]>,
    len: usize,
    count: u16,
    sequence: u32,
}

impl BatchState {
    fn is_empty(&self) -> bool {
        self.len == BATCH_HEADER_LEN
    }

    fn push(&mut self, event: &[u8]) {
        self.buf[self.len..self.len + event.len()].copy_from_slice(event);
        self.len += event.len();
        self.count += 1;
    }
}

/// Packs encoded events into batch frames on their way to the ring buffer
pub struct Batcher {
    state: Mutex<BatchState>,
    ring: Arc<ByteRing>,
    diagnostics: Arc<Diagnostics>,
    pid: u32,
}

impl Batcher {
    pub fn new(pid: u32, ring: Arc<ByteRing>, diagnostics: Arc<Diagnostics>) -> Self {
        Self {
            state: Mutex::new(BatchState {
                buf: Box::new([0u8; MAX_BATCH_PACKET_SIZE]),
                len: BATCH_HEADER_LEN,
                count: 0,
                sequence: 0,
            }),
            ring,
            diagnostics,
            pid,
        }
    }

    /// Queue one encoded event
    pub fn append(&self, event: &[u8]) {
        self.append_or_flush(Some(event));
    }

    /// Finalize the current batch if it holds anything
    pub fn flush(&self) {
        self.append_or_flush(None);
    }

    fn append_or_flush(&self, event: Option<&[u8]>) {
        let mut state = self.state.lock();
        let n = event.map_or(0, <[u8]>::len);

        if let Some(bytes) = event {
            if state.len + n <= BATCH_PACKET_SIZE {
                state.push(bytes);
                Diagnostics::incr(&self.diagnostics.encoded_batched);
                return;
            }
        }

        if event.is_none() || BATCH_HEADER_LEN + n <= BATCH_PACKET_SIZE {
            if state.is_empty() {
                return;
            }
            if event.is_none() {
                Diagnostics::incr(&self.diagnostics.flushed);
            }
            self.finalize(&mut state);
            if let Some(bytes) = event {
                state.push(bytes);
                Diagnostics::incr(&self.diagnostics.encoded_batched);
            }
            return;
        }

        let Some(bytes) = event else { return };
        if BATCH_HEADER_LEN + n > MAX_BATCH_PACKET_SIZE {
            trace!(size = n, "sending oversized event unbatched");
            Diagnostics::incr(&self.diagnostics.encoded_raw);
            if !self.ring.offer(bytes) {
                warn!(size = n, "ring buffer full, dropped raw event");
            }
            return;
        }

        trace!(size = n, "sending event in a dedicated batch");
        if !state.is_empty() {
            self.finalize(&mut state);
        }
        state.push(bytes);
        Diagnostics::incr(&self.diagnostics.encoded_batched);
        self.finalize(&mut state);
    }

    fn finalize(&self, state: &mut BatchState) {
        let len = state.len;
        let header = BatchHeader {
            length: len as i16,
            count: state.count as i16,
            sequence: state.sequence,
            pid: self.pid,
        };
        header.encode(&mut state.buf[..BATCH_HEADER_LEN]);

        Diagnostics::incr(&self.diagnostics.batches);
        if !self.ring.offer(&state.buf[..len]) {
            warn!(
                sequence = state.sequence,
                events = state.count,
                "ring buffer full, dropped batch"
            );
        }
        trace!(sequence = state.sequence, events = state.count, len, "batch finalized");

        state.sequence = state.sequence.wrapping_add(1);
        state.len = BATCH_HEADER_LEN;
        state.count = 0;
        Diagnostics::incr(&self.diagnostics.resets);
    }

    /// Bytes and events in the current, unsent batch
    pub fn pending(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.len - BATCH_HEADER_LEN, state.count as usize)
    }

    /// Sequence number the next batch will carry
    pub fn next_sequence(&self) -> u32 {
        self.state.lock().sequence
    }
}

/// Fixed header of a batch frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BatchHeader {
    pub length: i16,
    pub count: i16,
    pub sequence: u32,
    pub pid: u32,
}

impl BatchHeader {
    fn encode(&self, buf: &mut [u8]) {
        let mut w = WireWriter::new(buf);
        w.put_i16(self.length);
        w.put_u8(EventType::Batch.as_u8());
        w.put_i16(self.count);
        w.put_u32(self.sequence);
        w.put_u32(self.pid);
    }

    fn decode(r: &mut WireReader<'_>) -> Result<Self, DecodeError> {
        let length = r.i16()?;
        let tag = r.u8()?;
        if tag != EventType::Batch.as_u8() {
            return Err(DecodeError::UnknownEventType(tag));
        }
        Ok(Self {
            length,
            count: r.i16()?,
            sequence: r.u32()?,
            pid: r.u32()?,
        })
    }
}

/// One transport unit: a batch or a raw, unbatched event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    Batch {
        header: BatchHeader,
        events: Vec<Event<'static>>,
    },
    Event {
        event: Event<'static>,
    },
}

impl Frame {
    /// Number of events carried
    pub fn event_count(&self) -> usize {
        match self {
            Frame::Batch { events, .. } => events.len(),
            Frame::Event { .. } => 1,
        }
    }

    /// Events in wire order
    pub fn events(&self) -> &[Event<'static>] {
        match self {
            Frame::Batch { events, .. } => events,
            Frame::Event { event } => std::slice::from_ref(event),
        }
    }

    pub fn into_events(self) -> Vec<Event<'static>> {
        match self {
            Frame::Batch { events, .. } => events,
            Frame::Event { event } => vec![event],
        }
    }
}

/// Decode one frame from the front of `bytes`
///
/// Returns the frame and the number of bytes consumed.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), DecodeError> {
    if bytes.len() < 3 {
        return Err(DecodeError::Truncated {
            needed: 3,
            available: bytes.len(),
        });
    }
    if bytes[2] != EventType::Batch.as_u8() {
        let (event, used) = Event::decode(bytes)?;
        return Ok((Frame::Event { event }, used));
    }

    let mut r = WireReader::new(bytes);
    let header = BatchHeader::decode(&mut r)?;
    if header.length < BATCH_HEADER_LEN as i16 {
        return Err(DecodeError::NegativeLength(header.length as i64));
    }
    let length = header.length as usize;
    if bytes.len() < length {
        return Err(DecodeError::Truncated {
            needed: length,
            available: bytes.len(),
        });
    }

    let mut events = Vec::with_capacity(header.count.max(0) as usize);
    let mut offset = BATCH_HEADER_LEN;
    while offset < length {
        let (event, used) = Event::decode(&bytes[offset..length])?;
        events.push(event);
        offset += used;
    }
    if events.len() != header.count.max(0) as usize {
        return Err(DecodeError::LengthMismatch {
            declared: header.count.max(0) as usize,
            actual: events.len(),
        });
    }
    Ok((Frame::Batch { header, events }, length))
}

/// Decode back-to-back frames until `bytes` is exhausted
pub fn decode_stream(mut bytes: &[u8]) -> Result<Vec<Frame>, DecodeError> {
    let mut frames = Vec::new();
    while !bytes.is_empty() {
        let (frame, used) = decode_frame(bytes)?;
        frames.push(frame);
        bytes = &bytes[used..];
    }
    Ok(frames)
}
