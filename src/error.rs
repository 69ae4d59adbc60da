//! Error types for calltrace
//!
//! Setup failures are loud and synchronous (`TraceError`). Steady-state
//! tracing never returns errors; it degrades and counts the degradation.
//! Wire decoding has its own `DecodeError` since it is driven by untrusted
//! bytes from a socket or a capture file.

use thiserror::Error;

/// Errors raised while configuring the engine
#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Only one profiler sink can be set!")]
    SinkAlreadySet,

    #[error("Invalid sink configuration: {0}")]
    InvalidSink(String),

    #[error("Sink I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration value for {key}: {value}")]
    InvalidConfig { key: String, value: String },

    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    #[error("Failed to parse configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Ring buffer capacity must be > 0")]
    ZeroCapacity,

    #[error("Failed to spawn background thread: {0}")]
    Spawn(String),
}

/// Errors raised while decoding wire bytes
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Truncated input: needed {needed} bytes, {available} available")]
    Truncated { needed: usize, available: usize },

    #[error("Unknown event type tag 0x{0:02x}")]
    UnknownEventType(u8),

    #[error("Unknown variable type tag 0x{0:02x}")]
    UnknownVariableType(u8),

    #[error("Unknown string encoding tag {0}")]
    UnknownEncoding(u8),

    #[error("Unknown method source {0}")]
    UnknownMethodSource(u8),

    #[error("Declared length {declared} does not match decoded length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("Negative length prefix {0}")]
    NegativeLength(i64),
}

/// Result type for engine setup operations
pub type Result<T> = std::result::Result<T, TraceError>;
