//! Event records and their wire codec
//!
//! Every event shares the fixed header defined in [`crate::protocol`] and a
//! kind-specific payload. Encoding is deterministic, writes into a
//! caller-provided buffer and never allocates:
//!
//! ```text
//! ┌────────┬──────┬─────┬─────┬───────────┬─────────────────┐
//! │ len i16│ type │ pid │ tid │ ts i64 µs │ payload ...     │
//! └────────┴──────┴─────┴─────┴───────────┴─────────────────┘
//! ```
//!
//! [`Event::encoded_size`] is the pre-flight size computation. It always
//! equals the number of bytes [`Event::encode`] writes; debug builds
//! assert it on every encode.
//!
//! # Example
//!
//! ```
//! use calltrace::event::{Body, Event};
//!
//! let event = Event::new(42, 1, 1_700_000_000_000_000, Body::ThreadStarted { parent_tid: 0 });
//! let bytes = event.encode_to_vec();
//! assert_eq!(bytes.len(), event.encoded_size());
//!
//! let (decoded, used) = Event::decode(&bytes).unwrap();
//! assert_eq!(used, bytes.len());
//! assert_eq!(decoded, event);
//! ```

use crate::error::DecodeError;
use crate::protocol::{EventType, MethodSource, HEADER_LEN, MAX_ARGS};
use crate::variable::VariableInfo;
use crate::wire::{
    encoded_str_size, short_str_size, str_size, EncodedStr, ShortStr, WireReader, WireStr,
    WireWriter,
};
use serde::Serialize;
use std::borrow::Cow;

/// HTTP request summary shared by HTTP_IN and HTTP_OUT
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Http<'a> {
    pub url: WireStr<'a>,
    pub verb: ShortStr<'a>,
    pub status: u16,
    pub duration: i64,
}

/// Kind-specific payload of an event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind")]
pub enum Body<'a> {
    Begin {
        function_id: u32,
        instance_id: u64,
        args: Cow<'a, [VariableInfo<'a>]>,
    },
    End {
        function_id: u32,
        tail_call: bool,
        return_value: VariableInfo<'a>,
    },
    MethodInfo {
        function_id: u32,
        class_name: WireStr<'a>,
        method_name: WireStr<'a>,
        source: MethodSource,
    },
    ExceptionThrown {
        exception_id: u64,
        class_name: WireStr<'a>,
        correlation_id: WireStr<'a>,
    },
    ThreadStarted {
        parent_tid: u32,
    },
    ThreadEnded,
    ProcessEnded,
    ProcessFrequency {
        frequency: u64,
    },
    ProcessType {
        technology_type: WireStr<'a>,
        process_type: WireStr<'a>,
    },
    BeginTransaction {
        api_key: WireStr<'a>,
        technology_type: WireStr<'a>,
        process_type: WireStr<'a>,
    },
    EndTransaction,
    Sql {
        provider: EncodedStr<'a>,
        host: EncodedStr<'a>,
        database: EncodedStr<'a>,
        query: EncodedStr<'a>,
        duration: i64,
    },
    HttpIn(Http<'a>),
    HttpOut(Http<'a>),
}

/// A single wire event: header fields plus payload
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event<'a> {
    pub pid: u32,
    pub tid: u32,
    /// Microseconds since the Unix epoch
    pub timestamp: i64,
    #[serde(flatten)]
    pub body: Body<'a>,
}

impl<'a> Body<'a> {
    pub fn event_type(&self) -> EventType {
        match self {
            Body::Begin { .. } => EventType::Begin,
            Body::End { .. } => EventType::End,
            Body::MethodInfo { .. } => EventType::MethodInfo,
            Body::ExceptionThrown { .. } => EventType::ExceptionThrown,
            Body::ThreadStarted { .. } => EventType::ThreadStarted,
            Body::ThreadEnded => EventType::ThreadEnded,
            Body::ProcessEnded => EventType::ProcessEnded,
            Body::ProcessFrequency { .. } => EventType::ProcessFrequency,
            Body::ProcessType { .. } => EventType::ProcessType,
            Body::BeginTransaction { .. } => EventType::BeginTransaction,
            Body::EndTransaction => EventType::EndTransaction,
            Body::Sql { .. } => EventType::Sql,
            Body::HttpIn(_) => EventType::HttpIn,
            Body::HttpOut(_) => EventType::HttpOut,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Body::Begin { args, .. } => {
                4 + 8
                    + 1
                    + wire_args(args)
                        .iter()
                        .map(VariableInfo::encoded_size)
                        .sum::<usize>()
            }
            Body::End { return_value, .. } => 4 + 1 + return_value.encoded_size(),
            Body::MethodInfo {
                class_name,
                method_name,
                ..
            } => 4 + str_size(class_name) + str_size(method_name) + 1,
            Body::ExceptionThrown {
                class_name,
                correlation_id,
                ..
            } => 8 + str_size(class_name) + str_size(correlation_id),
            Body::ThreadStarted { .. } => 4,
            Body::ThreadEnded | Body::ProcessEnded | Body::EndTransaction => 0,
            Body::ProcessFrequency { .. } => 8,
            Body::ProcessType {
                technology_type,
                process_type,
            } => str_size(technology_type) + str_size(process_type),
            Body::BeginTransaction {
                api_key,
                technology_type,
                process_type,
            } => str_size(api_key) + str_size(technology_type) + str_size(process_type),
            Body::Sql {
                provider,
                host,
                database,
                query,
                ..
            } => {
                encoded_str_size(provider)
                    + encoded_str_size(host)
                    + encoded_str_size(database)
                    + encoded_str_size(query)
                    + 8
            }
            Body::HttpIn(http) | Body::HttpOut(http) => {
                str_size(&http.url) + short_str_size(&http.verb) + 2 + 8
            }
        }
    }

    fn encode_payload(&self, w: &mut WireWriter<'_>) {
        match self {
            Body::Begin {
                function_id,
                instance_id,
                args,
            } => {
                w.put_u32(*function_id);
                w.put_u64(*instance_id);
                let args = wire_args(args);
                w.put_u8(args.len() as u8);
                for arg in args {
                    arg.encode(w);
                }
            }
            Body::End {
                function_id,
                tail_call,
                return_value,
            } => {
                w.put_u32(*function_id);
                w.put_u8(u8::from(*tail_call));
                return_value.encode(w);
            }
            Body::MethodInfo {
                function_id,
                class_name,
                method_name,
                source,
            } => {
                w.put_u32(*function_id);
                w.put_str(class_name);
                w.put_str(method_name);
                w.put_u8(*source as u8);
            }
            Body::ExceptionThrown {
                exception_id,
                class_name,
                correlation_id,
            } => {
                w.put_u64(*exception_id);
                w.put_str(class_name);
                w.put_str(correlation_id);
            }
            Body::ThreadStarted { parent_tid } => w.put_u32(*parent_tid),
            Body::ThreadEnded | Body::ProcessEnded | Body::EndTransaction => {}
            Body::ProcessFrequency { frequency } => w.put_u64(*frequency),
            Body::ProcessType {
                technology_type,
                process_type,
            } => {
                w.put_str(technology_type);
                w.put_str(process_type);
            }
            Body::BeginTransaction {
                api_key,
                technology_type,
                process_type,
            } => {
                w.put_str(api_key);
                w.put_str(technology_type);
                w.put_str(process_type);
            }
            Body::Sql {
                provider,
                host,
                database,
                query,
                duration,
            } => {
                w.put_encoded_str(provider);
                w.put_encoded_str(host);
                w.put_encoded_str(database);
                w.put_encoded_str(query);
                w.put_i64(*duration);
            }
            Body::HttpIn(http) | Body::HttpOut(http) => {
                w.put_str(&http.url);
                w.put_short_str(&http.verb);
                w.put_u16(http.status);
                w.put_i64(http.duration);
            }
        }
    }

    fn decode_payload(
        kind: EventType,
        r: &mut WireReader<'_>,
    ) -> Result<Body<'static>, DecodeError> {
        Ok(match kind {
            EventType::Begin => {
                let function_id = r.u32()?;
                let instance_id = r.u64()?;
                let argc = r.u8()?;
                let args = (0..argc)
                    .map(|_| VariableInfo::decode(r))
                    .collect::<Result<Vec<_>, _>>()?;
                Body::Begin {
                    function_id,
                    instance_id,
                    args: Cow::Owned(args),
                }
            }
            EventType::End => Body::End {
                function_id: r.u32()?,
                tail_call: r.u8()? != 0,
                return_value: VariableInfo::decode(r)?,
            },
            EventType::MethodInfo => {
                let function_id = r.u32()?;
                let class_name = r.str()?;
                let method_name = r.str()?;
                let tag = r.u8()?;
                Body::MethodInfo {
                    function_id,
                    class_name,
                    method_name,
                    source: MethodSource::from_u8(tag)
                        .ok_or(DecodeError::UnknownMethodSource(tag))?,
                }
            }
            EventType::ExceptionThrown => Body::ExceptionThrown {
                exception_id: r.u64()?,
                class_name: r.str()?,
                correlation_id: r.str()?,
            },
            EventType::ThreadStarted => Body::ThreadStarted {
                parent_tid: r.u32()?,
            },
            EventType::ThreadEnded => Body::ThreadEnded,
            EventType::ProcessEnded => Body::ProcessEnded,
            EventType::ProcessFrequency => Body::ProcessFrequency {
                frequency: r.u64()?,
            },
            EventType::ProcessType => Body::ProcessType {
                technology_type: r.str()?,
                process_type: r.str()?,
            },
            EventType::BeginTransaction => Body::BeginTransaction {
                api_key: r.str()?,
                technology_type: r.str()?,
                process_type: r.str()?,
            },
            EventType::EndTransaction => Body::EndTransaction,
            EventType::Sql => Body::Sql {
                provider: r.encoded_str()?,
                host: r.encoded_str()?,
                database: r.encoded_str()?,
                query: r.encoded_str()?,
                duration: r.i64()?,
            },
            EventType::HttpIn => Body::HttpIn(decode_http(r)?),
            EventType::HttpOut => Body::HttpOut(decode_http(r)?),
            EventType::Batch => return Err(DecodeError::UnknownEventType(kind.as_u8())),
        })
    }

    pub fn into_owned(self) -> Body<'static> {
        match self {
            Body::Begin {
                function_id,
                instance_id,
                args,
            } => Body::Begin {
                function_id,
                instance_id,
                args: Cow::Owned(
                    args.into_owned()
                        .into_iter()
                        .map(VariableInfo::into_owned)
                        .collect(),
                ),
            },
            Body::End {
                function_id,
                tail_call,
                return_value,
            } => Body::End {
                function_id,
                tail_call,
                return_value: return_value.into_owned(),
            },
            Body::MethodInfo {
                function_id,
                class_name,
                method_name,
                source,
            } => Body::MethodInfo {
                function_id,
                class_name: class_name.into_owned(),
                method_name: method_name.into_owned(),
                source,
            },
            Body::ExceptionThrown {
                exception_id,
                class_name,
                correlation_id,
            } => Body::ExceptionThrown {
                exception_id,
                class_name: class_name.into_owned(),
                correlation_id: correlation_id.into_owned(),
            },
            Body::ThreadStarted { parent_tid } => Body::ThreadStarted { parent_tid },
            Body::ThreadEnded => Body::ThreadEnded,
            Body::ProcessEnded => Body::ProcessEnded,
            Body::ProcessFrequency { frequency } => Body::ProcessFrequency { frequency },
            Body::ProcessType {
                technology_type,
                process_type,
            } => Body::ProcessType {
                technology_type: technology_type.into_owned(),
                process_type: process_type.into_owned(),
            },
            Body::BeginTransaction {
                api_key,
                technology_type,
                process_type,
            } => Body::BeginTransaction {
                api_key: api_key.into_owned(),
                technology_type: technology_type.into_owned(),
                process_type: process_type.into_owned(),
            },
            Body::EndTransaction => Body::EndTransaction,
            Body::Sql {
                provider,
                host,
                database,
                query,
                duration,
            } => Body::Sql {
                provider: provider.into_owned(),
                host: host.into_owned(),
                database: database.into_owned(),
                query: query.into_owned(),
                duration,
            },
            Body::HttpIn(http) => Body::HttpIn(http.into_owned()),
            Body::HttpOut(http) => Body::HttpOut(http.into_owned()),
        }
    }
}

impl Http<'_> {
    pub fn into_owned(self) -> Http<'static> {
        Http {
            url: self.url.into_owned(),
            verb: self.verb.into_owned(),
            status: self.status,
            duration: self.duration,
        }
    }
}

/// Arguments that make it onto the wire; sizing and encoding both go
/// through here so the argc byte always matches the records written
fn wire_args<'s, 'a>(args: &'s [VariableInfo<'a>]) -> &'s [VariableInfo<'a>] {
    &args[..args.len().min(MAX_ARGS)]
}

fn decode_http(r: &mut WireReader<'_>) -> Result<Http<'static>, DecodeError> {
    Ok(Http {
        url: r.str()?,
        verb: r.short_str()?,
        status: r.u16()?,
        duration: r.i64()?,
    })
}

impl<'a> Event<'a> {
    pub fn new(pid: u32, tid: u32, timestamp: i64, body: Body<'a>) -> Self {
        Self {
            pid,
            tid,
            timestamp,
            body,
        }
    }

    pub fn event_type(&self) -> EventType {
        self.body.event_type()
    }

    /// Exact number of bytes `encode` will write
    pub fn encoded_size(&self) -> usize {
        HEADER_LEN + self.body.payload_size()
    }

    /// Encode into `buf`, returning the number of bytes written
    ///
    /// # Panics
    ///
    /// Panics if `buf` is shorter than [`Event::encoded_size`].
    pub fn encode(&self, buf: &mut [u8]) -> usize {
        let size = self.encoded_size();
        let mut w = WireWriter::new(&mut buf[..size]);
        w.put_i16(size as i16);
        w.put_u8(self.event_type().as_u8());
        w.put_u32(self.pid);
        w.put_u32(self.tid);
        w.put_i64(self.timestamp);
        self.body.encode_payload(&mut w);
        debug_assert_eq!(w.position(), size, "encoded size mismatch for {}", self.event_type());
        w.position()
    }

    /// Encode into a freshly allocated vector (cold paths and tests)
    pub fn encode_to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_size()];
        self.encode(&mut buf);
        buf
    }

    /// Decode one event from the front of `bytes`
    ///
    /// Returns the event and the number of bytes consumed.
    pub fn decode(bytes: &[u8]) -> Result<(Event<'static>, usize), DecodeError> {
        let mut r = WireReader::new(bytes);
        let declared = r.i16()?;
        if declared < 0 {
            return Err(DecodeError::NegativeLength(declared as i64));
        }
        let tag = r.u8()?;
        let kind = EventType::from_u8(tag).ok_or(DecodeError::UnknownEventType(tag))?;
        let pid = r.u32()?;
        let tid = r.u32()?;
        let timestamp = r.i64()?;
        let body = Body::decode_payload(kind, &mut r)?;
        let used = r.position();
        if used != declared as usize {
            return Err(DecodeError::LengthMismatch {
                declared: declared as usize,
                actual: used,
            });
        }
        Ok((Event::new(pid, tid, timestamp, body), used))
    }

    pub fn into_owned(self) -> Event<'static> {
        Event {
            pid: self.pid,
            tid: self.tid,
            timestamp: self.timestamp,
            body: self.body.into_owned(),
        }
    }
}
