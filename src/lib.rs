//! Calltrace - in-process method tracer with a compact binary wire protocol
//!
//! This library provides the engine a language runtime embeds to report
//! method calls, returns, exceptions and thread lifecycle to an external
//! collector: rule-based method classification, per-thread shadow stacks,
//! and a batching ring buffer drained by a background dispatch thread.

pub mod batch;
pub mod classifier;
pub mod cli;
pub mod clock;
pub mod config;
pub mod diagnostics;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod filter;
pub mod output;
pub mod prefix_map;
pub mod protocol;
pub mod ring_buffer;
pub mod rules_file;
pub mod shadow_stack;
pub mod sink;
pub mod thread_table;
pub mod trace_context;
pub mod tracer;
pub mod variable;
pub mod wire;

pub use batch::{decode_frame, decode_stream, Frame};
pub use classifier::MethodKey;
pub use config::{EngineConfig, Environment, LogLevel};
pub use diagnostics::DiagnosticsSnapshot;
pub use error::{DecodeError, Result, TraceError};
pub use event::{Body, Event};
pub use filter::Verdict;
pub use protocol::{EventType, MethodSource};
pub use sink::SinkConfig;
pub use tracer::{Engine, ThreadRef};
pub use variable::{Value, VariableInfo};
