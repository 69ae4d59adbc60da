//! Wire protocol constants
//!
//! Every event on the wire starts with a fixed 19 byte header
//! (`length:i16, type:u8, pid:u32, tid:u32, timestamp:i64`), all
//! little-endian. Batches wrap a run of encoded events behind a 13 byte
//! batch header (`length:i16, type:u8, count:i16, sequence:u32, pid:u32`).
//!
//! The numeric values in this module are a contract with external
//! collectors and must never change.

use serde::Serialize;
use std::fmt;

/// Size of the common event header in bytes
pub const HEADER_LEN: usize = 2 + 1 + 4 + 4 + 8;

/// Size of the batch frame header in bytes
pub const BATCH_HEADER_LEN: usize = 2 + 1 + 2 + 4 + 4;

/// Normal packet bound for a batch (fits a typical MTU)
pub const BATCH_PACKET_SIZE: usize = 1400;

/// Extended bound for a dedicated single-event batch
pub const MAX_BATCH_PACKET_SIZE: usize = 4096;

/// Bound for length-prefixed strings
pub const MAX_STRING_SIZE: usize = 4096;

/// Bound for 8-bit length-prefixed short strings
pub const MAX_SHORT_STRING_SIZE: usize = 127;

/// Bound for variable names
pub const MAX_VARIABLE_NAME: usize = 200;

/// Most call arguments a BEGIN event carries; the rest are dropped
pub const MAX_ARGS: usize = 16;

/// Capacity of a per-thread shadow stack
pub const MAX_STACK_DEPTH: usize = 256;

/// Frequency reported in PROCESS_FREQUENCY (timestamps are microseconds)
pub const TIMESTAMP_FREQUENCY: u64 = 1_000_000;

/// Parent tid recorded for threads observed without a known parent
pub const THREAD_ORPHANED: u32 = 0;

/// Marker for a thread that has no tracked frames
pub const THREAD_FRAMELESS: i32 = -1;

/// Method name of the reserved frame that wraps every trace
pub const TRACE_ENTRYPOINT: &str = "Ruby_APM_profiler_trace";

/// Event type tags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum EventType {
    Begin = 0x01,
    End = 0x02,
    ThreadEnded = 0x08,
    ProcessEnded = 0x0a,
    ProcessFrequency = 0x0b,
    ProcessType = 0x0c,
    MethodInfo = 0x0f,
    BeginTransaction = 0x10,
    EndTransaction = 0x11,
    ExceptionThrown = 0x12,
    ThreadStarted = 0x13,
    Sql = 0x64,
    HttpIn = 0x65,
    HttpOut = 0x66,
    Batch = 0xfa,
}

impl EventType {
    /// Map a raw tag byte back to an event type
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => EventType::Begin,
            0x02 => EventType::End,
            0x08 => EventType::ThreadEnded,
            0x0a => EventType::ProcessEnded,
            0x0b => EventType::ProcessFrequency,
            0x0c => EventType::ProcessType,
            0x0f => EventType::MethodInfo,
            0x10 => EventType::BeginTransaction,
            0x11 => EventType::EndTransaction,
            0x12 => EventType::ExceptionThrown,
            0x13 => EventType::ThreadStarted,
            0x64 => EventType::Sql,
            0x65 => EventType::HttpIn,
            0x66 => EventType::HttpOut,
            0xfa => EventType::Batch,
            _ => return None,
        })
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EventType::Begin => "BEGIN",
            EventType::End => "END",
            EventType::ThreadEnded => "THREAD_ENDED",
            EventType::ProcessEnded => "PROCESS_ENDED",
            EventType::ProcessFrequency => "PROCESS_FREQUENCY",
            EventType::ProcessType => "PROCESS_TYPE",
            EventType::MethodInfo => "METHODINFO",
            EventType::BeginTransaction => "BEGIN_TRANSACTION",
            EventType::EndTransaction => "END_TRANSACTION",
            EventType::ExceptionThrown => "EXCEPTION_THROWN",
            EventType::ThreadStarted => "THREAD_STARTED",
            EventType::Sql => "SQL",
            EventType::HttpIn => "HTTP_IN",
            EventType::HttpOut => "HTTP_OUT",
            EventType::Batch => "BATCH",
        };
        f.write_str(name)
    }
}

/// Character encoding tag carried by encoded strings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[repr(u8)]
pub enum StringEncoding {
    None = 0,
    #[default]
    Utf16Le = 1,
    Utf16Be = 2,
    Ascii = 3,
    Utf7 = 4,
    Utf8 = 5,
    Utf32Le = 6,
}

impl StringEncoding {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => StringEncoding::None,
            1 => StringEncoding::Utf16Le,
            2 => StringEncoding::Utf16Be,
            3 => StringEncoding::Ascii,
            4 => StringEncoding::Utf7,
            5 => StringEncoding::Utf8,
            6 => StringEncoding::Utf32Le,
            _ => return None,
        })
    }
}

/// Type tags for captured variables (arguments and return values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[repr(u8)]
pub enum VariableType {
    Void = 0x01,
    Boolean = 0x02,
    Byte = 0x03,
    Short = 0x04,
    UShort = 0x05,
    Int32 = 0x06,
    UInt32 = 0x07,
    Long = 0x08,
    ULong = 0x09,
    Float = 0x0a,
    Double = 0x0b,
    String = 0x0c,
    EmptyString = 0x10,
    NullString = 0x11,
    NullObject = 0x12,
    LargeString = 0x13,
}

impl VariableType {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0x01 => VariableType::Void,
            0x02 => VariableType::Boolean,
            0x03 => VariableType::Byte,
            0x04 => VariableType::Short,
            0x05 => VariableType::UShort,
            0x06 => VariableType::Int32,
            0x07 => VariableType::UInt32,
            0x08 => VariableType::Long,
            0x09 => VariableType::ULong,
            0x0a => VariableType::Float,
            0x0b => VariableType::Double,
            0x0c => VariableType::String,
            0x10 => VariableType::EmptyString,
            0x11 => VariableType::NullString,
            0x12 => VariableType::NullObject,
            0x13 => VariableType::LargeString,
            _ => return None,
        })
    }
}

/// Where a resolved method comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[repr(u8)]
pub enum MethodSource {
    #[default]
    User = 0,
    System = 1,
    KnownLibrary = 2,
    WaitForUserInput = 3,
    Synchronization = 4,
    Jit = 5,
    Gc = 6,
}

impl MethodSource {
    pub fn from_u8(tag: u8) -> Option<Self> {
        Some(match tag {
            0 => MethodSource::User,
            1 => MethodSource::System,
            2 => MethodSource::KnownLibrary,
            3 => MethodSource::WaitForUserInput,
            4 => MethodSource::Synchronization,
            5 => MethodSource::Jit,
            6 => MethodSource::Gc,
            _ => return None,
        })
    }
}

impl fmt::Display for MethodSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MethodSource::User => "user",
            MethodSource::System => "system",
            MethodSource::KnownLibrary => "known-library",
            MethodSource::WaitForUserInput => "wait-for-user-input",
            MethodSource::Synchronization => "synchronization",
            MethodSource::Jit => "jit",
            MethodSource::Gc => "gc",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_sizes() {
        assert_eq!(HEADER_LEN, 19);
        assert_eq!(BATCH_HEADER_LEN, 13);
    }

    #[test]
    fn test_event_type_tags_round_trip() {
        for tag in 0u8..=255 {
            if let Some(kind) = EventType::from_u8(tag) {
                assert_eq!(kind.as_u8(), tag);
            }
        }
        assert_eq!(EventType::from_u8(0x03), None);
        assert_eq!(EventType::Batch.as_u8(), 0xfa);
        assert_eq!(EventType::Sql.as_u8(), 0x64);
    }

    #[test]
    fn test_default_encoding_is_utf16le() {
        assert_eq!(StringEncoding::default(), StringEncoding::Utf16Le);
        assert_eq!(StringEncoding::from_u8(5), Some(StringEncoding::Utf8));
        assert_eq!(StringEncoding::from_u8(7), None);
    }

    #[test]
    fn test_variable_type_gaps() {
        assert_eq!(VariableType::from_u8(0x0d), None);
        assert_eq!(VariableType::from_u8(0x13), Some(VariableType::LargeString));
    }

    #[test]
    fn test_method_source_display() {
        assert_eq!(MethodSource::KnownLibrary.to_string(), "known-library");
        assert_eq!(MethodSource::from_u8(4), Some(MethodSource::Synchronization));
    }
}
