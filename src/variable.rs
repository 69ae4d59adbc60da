//! Captured variable values (call arguments and return values)
//!
//! Layout: `length:i16, type:u8, name_length:u8, name, value`. The length
//! field counts the type, name length and name bytes, but not the value.
//! The nameless void value that closes every END event is written with a
//! length of zero.

use crate::error::DecodeError;
use crate::protocol::{VariableType, MAX_STRING_SIZE, MAX_VARIABLE_NAME};
use crate::wire::{truncated, WireReader, WireStr, WireWriter};
use serde::Serialize;
use std::borrow::Cow;

/// Typed value carried by a `VariableInfo`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum Value<'a> {
    Void,
    Boolean(bool),
    Byte(u8),
    Short(i16),
    UShort(u16),
    Int32(i32),
    UInt32(u32),
    Long(i64),
    ULong(u64),
    Float(f32),
    String(WireStr<'a>),
    EmptyString,
    NullString,
    NullObject,
    #[serde(serialize_with = "serialize_lossy")]
    LargeString(Cow<'a, [u8]>),
}

fn serialize_lossy<S: serde::Serializer>(bytes: &Cow<'_, [u8]>, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(&String::from_utf8_lossy(bytes))
}

impl Value<'_> {
    pub fn variable_type(&self) -> VariableType {
        match self {
            Value::Void => VariableType::Void,
            Value::Boolean(_) => VariableType::Boolean,
            Value::Byte(_) => VariableType::Byte,
            Value::Short(_) => VariableType::Short,
            Value::UShort(_) => VariableType::UShort,
            Value::Int32(_) => VariableType::Int32,
            Value::UInt32(_) => VariableType::UInt32,
            Value::Long(_) => VariableType::Long,
            Value::ULong(_) => VariableType::ULong,
            Value::Float(_) => VariableType::Float,
            Value::String(_) => VariableType::String,
            Value::EmptyString => VariableType::EmptyString,
            Value::NullString => VariableType::NullString,
            Value::NullObject => VariableType::NullObject,
            Value::LargeString(_) => VariableType::LargeString,
        }
    }

    fn payload_size(&self) -> usize {
        match self {
            Value::Void | Value::EmptyString | Value::NullString | Value::NullObject => 0,
            Value::Boolean(_) | Value::Byte(_) => 1,
            Value::Short(_) | Value::UShort(_) => 2,
            Value::Int32(_) | Value::UInt32(_) | Value::Float(_) => 4,
            Value::Long(_) | Value::ULong(_) => 8,
            Value::String(s) => 2 + s.wire_bytes().len(),
            Value::LargeString(bytes) => 4 + bytes.len(),
        }
    }

    pub fn into_owned(self) -> Value<'static> {
        match self {
            Value::Void => Value::Void,
            Value::Boolean(v) => Value::Boolean(v),
            Value::Byte(v) => Value::Byte(v),
            Value::Short(v) => Value::Short(v),
            Value::UShort(v) => Value::UShort(v),
            Value::Int32(v) => Value::Int32(v),
            Value::UInt32(v) => Value::UInt32(v),
            Value::Long(v) => Value::Long(v),
            Value::ULong(v) => Value::ULong(v),
            Value::Float(v) => Value::Float(v),
            Value::String(s) => Value::String(s.into_owned()),
            Value::EmptyString => Value::EmptyString,
            Value::NullString => Value::NullString,
            Value::NullObject => Value::NullObject,
            Value::LargeString(b) => Value::LargeString(Cow::Owned(b.into_owned())),
        }
    }
}

/// A named, typed value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VariableInfo<'a> {
    #[serde(serialize_with = "serialize_lossy")]
    pub name: Cow<'a, [u8]>,
    pub value: Value<'a>,
}

impl<'a> VariableInfo<'a> {
    pub fn new(name: &'a str, value: Value<'a>) -> Self {
        Self {
            name: Cow::Borrowed(name.as_bytes()),
            value,
        }
    }

    /// The nameless void value attached to END events
    pub const fn void_return() -> VariableInfo<'static> {
        VariableInfo {
            name: Cow::Borrowed(&[]),
            value: Value::Void,
        }
    }

    fn name_bytes(&self) -> &[u8] {
        truncated(&self.name, MAX_VARIABLE_NAME)
    }

    fn declared_length(&self) -> i16 {
        if self.name.is_empty() && self.value == Value::Void {
            0
        } else {
            (2 + self.name_bytes().len()) as i16
        }
    }

    /// Encoded size in bytes
    pub fn encoded_size(&self) -> usize {
        2 + 1 + 1 + self.name_bytes().len() + self.value.payload_size()
    }

    pub fn encode(&self, w: &mut WireWriter<'_>) {
        let name = self.name_bytes();
        w.put_i16(self.declared_length());
        w.put_u8(self.value.variable_type() as u8);
        w.put_u8(name.len() as u8);
        w.put_bytes(name);
        match &self.value {
            Value::Void | Value::EmptyString | Value::NullString | Value::NullObject => {}
            Value::Boolean(v) => w.put_u8(u8::from(*v)),
            Value::Byte(v) => w.put_u8(*v),
            Value::Short(v) => w.put_i16(*v),
            Value::UShort(v) => w.put_u16(*v),
            Value::Int32(v) => w.put_i32(*v),
            Value::UInt32(v) => w.put_u32(*v),
            Value::Long(v) => w.put_i64(*v),
            Value::ULong(v) => w.put_u64(*v),
            Value::Float(v) => w.put_f32(*v),
            Value::String(s) => w.put_str(s),
            Value::LargeString(bytes) => {
                w.put_u32(bytes.len() as u32);
                w.put_bytes(bytes);
            }
        }
    }

    pub fn decode(r: &mut WireReader<'_>) -> Result<VariableInfo<'static>, DecodeError> {
        let _declared = r.i16()?;
        let tag = r.u8()?;
        let kind = VariableType::from_u8(tag).ok_or(DecodeError::UnknownVariableType(tag))?;
        let name_len = r.u8()? as usize;
        let name = Cow::Owned(r.take(name_len)?.to_vec());
        let value = match kind {
            VariableType::Void => Value::Void,
            VariableType::Boolean => Value::Boolean(r.u8()? != 0),
            VariableType::Byte => Value::Byte(r.u8()?),
            VariableType::Short => Value::Short(r.i16()?),
            VariableType::UShort => Value::UShort(r.u16()?),
            VariableType::Int32 => Value::Int32(r.i32()?),
            VariableType::UInt32 => Value::UInt32(r.u32()?),
            VariableType::Long => Value::Long(r.i64()?),
            VariableType::ULong => Value::ULong(r.u64()?),
            VariableType::Float => Value::Float(r.f32()?),
            VariableType::String => Value::String(r.str()?),
            VariableType::EmptyString => Value::EmptyString,
            VariableType::NullString => Value::NullString,
            VariableType::NullObject => Value::NullObject,
            VariableType::LargeString => {
                let len = r.u32()? as usize;
                Value::LargeString(Cow::Owned(r.take(len)?.to_vec()))
            }
            // Doubles are coerced to floats before capture and never reach the wire
            VariableType::Double => return Err(DecodeError::UnknownVariableType(tag)),
        };
        Ok(VariableInfo { name, value })
    }

    pub fn into_owned(self) -> VariableInfo<'static> {
        VariableInfo {
            name: Cow::Owned(self.name.into_owned()),
            value: self.value.into_owned(),
        }
    }
}

/// Build a large string value, truncated at the string bound
pub fn large_string(bytes: &[u8]) -> Value<'_> {
    Value::LargeString(Cow::Borrowed(truncated(bytes, MAX_STRING_SIZE)))
}
