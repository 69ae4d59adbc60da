//! Byte-level cursors for the wire protocol
//!
//! `WireWriter` writes into a caller-provided slice and never allocates.
//! Callers size the slice with the matching `encoded_size` functions first,
//! so running out of room is a programming error and is caught by a debug
//! assertion rather than reported at runtime.
//!
//! `WireReader` is the inverse and reports every short read as a
//! `DecodeError::Truncated`.

use crate::error::DecodeError;
use crate::protocol::{StringEncoding, MAX_SHORT_STRING_SIZE, MAX_STRING_SIZE};
use serde::{Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;

/// Length-prefixed byte string, truncated at `MAX_STRING_SIZE` on encode
#[derive(Clone, PartialEq, Eq, Default)]
pub struct WireStr<'a>(pub Cow<'a, [u8]>);

impl<'a> WireStr<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        WireStr(Cow::Borrowed(bytes))
    }

    pub fn owned(bytes: Vec<u8>) -> WireStr<'static> {
        WireStr(Cow::Owned(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Bytes that actually reach the wire
    pub fn wire_bytes(&self) -> &[u8] {
        truncated(&self.0, MAX_STRING_SIZE)
    }

    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    pub fn into_owned(self) -> WireStr<'static> {
        WireStr(Cow::Owned(self.0.into_owned()))
    }
}

impl<'a> From<&'a str> for WireStr<'a> {
    fn from(s: &'a str) -> Self {
        WireStr(Cow::Borrowed(s.as_bytes()))
    }
}

impl From<String> for WireStr<'static> {
    fn from(s: String) -> Self {
        WireStr(Cow::Owned(s.into_bytes()))
    }
}

impl fmt::Debug for WireStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for WireStr<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(&self.0))
    }
}

/// String with an explicit encoding tag (SQL payload fields)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct EncodedStr<'a> {
    pub encoding: StringEncoding,
    pub value: WireStr<'a>,
}

impl<'a> EncodedStr<'a> {
    pub fn new(encoding: StringEncoding, bytes: &'a [u8]) -> Self {
        Self {
            encoding,
            value: WireStr::new(bytes),
        }
    }

    /// UTF-8 text tagged as such
    pub fn utf8(text: &'a str) -> Self {
        Self::new(StringEncoding::Utf8, text.as_bytes())
    }

    pub fn into_owned(self) -> EncodedStr<'static> {
        EncodedStr {
            encoding: self.encoding,
            value: self.value.into_owned(),
        }
    }
}

/// 8-bit length-prefixed string, truncated at `MAX_SHORT_STRING_SIZE`
#[derive(Clone, PartialEq, Eq, Default)]
pub struct ShortStr<'a>(pub Cow<'a, [u8]>);

impl<'a> ShortStr<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ShortStr(Cow::Borrowed(bytes))
    }

    pub fn wire_bytes(&self) -> &[u8] {
        truncated(&self.0, MAX_SHORT_STRING_SIZE)
    }

    pub fn into_owned(self) -> ShortStr<'static> {
        ShortStr(Cow::Owned(self.0.into_owned()))
    }
}

impl<'a> From<&'a str> for ShortStr<'a> {
    fn from(s: &'a str) -> Self {
        ShortStr(Cow::Borrowed(s.as_bytes()))
    }
}

impl fmt::Debug for ShortStr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for ShortStr<'_> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&String::from_utf8_lossy(&self.0))
    }
}

pub(crate) fn truncated(bytes: &[u8], bound: usize) -> &[u8] {
    &bytes[..bytes.len().min(bound)]
}

/// Encoded size of a `WireStr`: i16 length plus bytes
pub(crate) fn str_size(s: &WireStr<'_>) -> usize {
    2 + s.wire_bytes().len()
}

/// Encoded size of an `EncodedStr`: encoding tag, i16 length plus bytes
pub(crate) fn encoded_str_size(s: &EncodedStr<'_>) -> usize {
    1 + str_size(&s.value)
}

/// Encoded size of a `ShortStr`: u8 length plus bytes
pub(crate) fn short_str_size(s: &ShortStr<'_>) -> usize {
    1 + s.wire_bytes().len()
}

/// Allocation-free little-endian writer over a borrowed buffer
pub struct WireWriter<'b> {
    buf: &'b mut [u8],
    pos: usize,
}

impl<'b> WireWriter<'b> {
    pub fn new(buf: &'b mut [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes written so far
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        let end = self.pos + bytes.len();
        debug_assert!(end <= self.buf.len(), "wire buffer too small");
        self.buf[self.pos..end].copy_from_slice(bytes);
        self.pos = end;
    }

    pub fn put_u8(&mut self, v: u8) {
        self.put_bytes(&[v]);
    }

    pub fn put_i8(&mut self, v: i8) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_i16(&mut self, v: i16) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_u16(&mut self, v: u16) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_i64(&mut self, v: i64) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_f32(&mut self, v: f32) {
        self.put_bytes(&v.to_le_bytes());
    }

    pub fn put_str(&mut self, s: &WireStr<'_>) {
        let bytes = s.wire_bytes();
        self.put_i16(bytes.len() as i16);
        self.put_bytes(bytes);
    }

    pub fn put_encoded_str(&mut self, s: &EncodedStr<'_>) {
        self.put_u8(s.encoding as u8);
        self.put_str(&s.value);
    }

    pub fn put_short_str(&mut self, s: &ShortStr<'_>) {
        let bytes = s.wire_bytes();
        self.put_u8(bytes.len() as u8);
        self.put_bytes(bytes);
    }
}

/// Little-endian reader over a borrowed buffer
pub struct WireReader<'b> {
    buf: &'b [u8],
    pos: usize,
}

impl<'b> WireReader<'b> {
    pub fn new(buf: &'b [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'b [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated {
                needed: n,
                available: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.array::<1>()?[0])
    }

    pub fn i8(&mut self) -> Result<i8, DecodeError> {
        Ok(i8::from_le_bytes(self.array()?))
    }

    pub fn i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.array()?))
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    pub fn i64(&mut self) -> Result<i64, DecodeError> {
        Ok(i64::from_le_bytes(self.array()?))
    }

    pub fn u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.array()?))
    }

    pub fn f32(&mut self) -> Result<f32, DecodeError> {
        Ok(f32::from_le_bytes(self.array()?))
    }

    pub fn str(&mut self) -> Result<WireStr<'static>, DecodeError> {
        let len = self.i16()?;
        if len < 0 {
            return Err(DecodeError::NegativeLength(len as i64));
        }
        Ok(WireStr::owned(self.take(len as usize)?.to_vec()))
    }

    pub fn encoded_str(&mut self) -> Result<EncodedStr<'static>, DecodeError> {
        let tag = self.u8()?;
        let encoding = StringEncoding::from_u8(tag).ok_or(DecodeError::UnknownEncoding(tag))?;
        Ok(EncodedStr {
            encoding,
            value: self.str()?,
        })
    }

    pub fn short_str(&mut self) -> Result<ShortStr<'static>, DecodeError> {
        let len = self.u8()? as usize;
        Ok(ShortStr(Cow::Owned(self.take(len)?.to_vec())))
    }
}
