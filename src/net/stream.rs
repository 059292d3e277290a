//! Binary codec for the client wire protocol
//!
//! `StreamWriter` and `StreamReader` are paired cursors over a contiguous byte
//! buffer. All multi-byte values are little-endian, booleans are one byte
//! (0 or 1), strings carry a u16 byte length and arrays a u16 element count.
//! Every length is checked against a caller-supplied cap on both sides, so an
//! oversize value fails instead of being truncated.

use crate::util::vec2::Vec2;

/// Errors raised while writing a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EncodeError {
    #[error("String too long: {0} bytes (max {1})")]
    StringTooLong(usize, usize),
    #[error("Array too long: {0} elements (max {1})")]
    ArrayTooLong(usize, usize),
}

/// Errors raised while reading a frame
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("Unexpected end of buffer: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEnd { needed: usize, remaining: usize },
    #[error("String too long: {0} bytes (max {1})")]
    StringTooLong(usize, usize),
    #[error("Array too long: {0} elements (max {1})")]
    ArrayTooLong(usize, usize),
    #[error("Invalid UTF-8 in string")]
    InvalidUtf8,
    #[error("Invalid boolean byte: {0}")]
    InvalidBool(u8),
    #[error("Unknown entity type: {0}")]
    UnknownEntityType(u8),
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u8),
    #[error("{0} trailing bytes after message")]
    TrailingBytes(usize),
}

/// A type that can be written to and read back from the wire
///
/// `deserialize` must consume exactly the bytes `serialize` produced.
pub trait NetMessage: Sized {
    fn serialize(&self, w: &mut StreamWriter) -> Result<(), EncodeError>;
    fn deserialize(r: &mut StreamReader<'_>) -> Result<Self, DecodeError>;
}

/// Encode a message into a fresh buffer
pub fn encode<T: NetMessage>(message: &T) -> Result<Vec<u8>, EncodeError> {
    let mut w = StreamWriter::new();
    message.serialize(&mut w)?;
    Ok(w.into_bytes())
}

/// Decode a message that must span the whole buffer
pub fn decode<T: NetMessage>(data: &[u8]) -> Result<T, DecodeError> {
    let mut r = StreamReader::new(data);
    let message = T::deserialize(&mut r)?;
    r.finish()?;
    Ok(message)
}

/// Write cursor
#[derive(Debug, Default)]
pub struct StreamWriter {
    buffer: Vec<u8>,
}

impl StreamWriter {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(256),
        }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    pub fn write_bytes(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    pub fn write_u8(&mut self, value: u8) {
        self.buffer.push(value);
    }

    pub fn write_u16(&mut self, value: u16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_u32(&mut self, value: u32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i8(&mut self, value: i8) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i16(&mut self, value: i16) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_i32(&mut self, value: i32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_f32(&mut self, value: f32) {
        self.buffer.extend_from_slice(&value.to_le_bytes());
    }

    pub fn write_bool(&mut self, value: bool) {
        self.buffer.push(value as u8);
    }

    pub fn write_vec2(&mut self, value: Vec2) {
        self.write_f32(value.x);
        self.write_f32(value.y);
    }

    /// Write a u16-length-prefixed UTF-8 string of at most `max_len` bytes
    pub fn write_string(&mut self, value: &str, max_len: usize) -> Result<(), EncodeError> {
        let len = value.len();
        if len > max_len || len > u16::MAX as usize {
            return Err(EncodeError::StringTooLong(len, max_len));
        }
        self.write_u16(len as u16);
        self.buffer.extend_from_slice(value.as_bytes());
        Ok(())
    }

    /// Write a u16-count-prefixed array, one element at a time through `write_elem`
    pub fn write_array<T, F>(&mut self, items: &[T], max_len: usize, mut write_elem: F) -> Result<(), EncodeError>
    where
        F: FnMut(&mut Self, &T) -> Result<(), EncodeError>,
    {
        let len = items.len();
        if len > max_len || len > u16::MAX as usize {
            return Err(EncodeError::ArrayTooLong(len, max_len));
        }
        self.write_u16(len as u16);
        for item in items {
            write_elem(self, item)?;
        }
        Ok(())
    }

    /// Write a u32-length-prefixed opaque byte payload
    pub fn write_blob(&mut self, data: &[u8], max_len: usize) -> Result<(), EncodeError> {
        if data.len() > max_len {
            return Err(EncodeError::ArrayTooLong(data.len(), max_len));
        }
        self.write_u32(data.len() as u32);
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }
}

/// Read cursor
pub struct StreamReader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> StreamReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, position: 0 }
    }

    /// Read exactly `n` bytes or fail without moving the cursor
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        let remaining = self.remaining();
        if n > remaining {
            return Err(DecodeError::UnexpectedEnd {
                needed: n,
                remaining,
            });
        }
        let slice = &self.data[self.position..self.position + n];
        self.position += n;
        Ok(slice)
    }

    fn read_array_of<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, DecodeError> {
        self.read_array_of().map(u16::from_le_bytes)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        self.read_array_of().map(u32::from_le_bytes)
    }

    pub fn read_i8(&mut self) -> Result<i8, DecodeError> {
        self.read_array_of().map(i8::from_le_bytes)
    }

    pub fn read_i16(&mut self) -> Result<i16, DecodeError> {
        self.read_array_of().map(i16::from_le_bytes)
    }

    pub fn read_i32(&mut self) -> Result<i32, DecodeError> {
        self.read_array_of().map(i32::from_le_bytes)
    }

    pub fn read_f32(&mut self) -> Result<f32, DecodeError> {
        self.read_array_of().map(f32::from_le_bytes)
    }

    pub fn read_bool(&mut self) -> Result<bool, DecodeError> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            other => Err(DecodeError::InvalidBool(other)),
        }
    }

    pub fn read_vec2(&mut self) -> Result<Vec2, DecodeError> {
        let x = self.read_f32()?;
        let y = self.read_f32()?;
        Ok(Vec2::new(x, y))
    }

    pub fn read_string(&mut self, max_len: usize) -> Result<String, DecodeError> {
        let len = self.read_u16()? as usize;
        if len > max_len {
            return Err(DecodeError::StringTooLong(len, max_len));
        }
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_owned)
            .map_err(|_| DecodeError::InvalidUtf8)
    }

    /// Read a u16-count-prefixed array; the count is checked against
    /// `max_len` before any element is read
    pub fn read_array<T, F>(&mut self, max_len: usize, mut read_elem: F) -> Result<Vec<T>, DecodeError>
    where
        F: FnMut(&mut Self) -> Result<T, DecodeError>,
    {
        let len = self.read_u16()? as usize;
        if len > max_len {
            return Err(DecodeError::ArrayTooLong(len, max_len));
        }
        let mut items = Vec::with_capacity(len.min(self.remaining()));
        for _ in 0..len {
            items.push(read_elem(self)?);
        }
        Ok(items)
    }

    pub fn read_blob(&mut self, max_len: usize) -> Result<Vec<u8>, DecodeError> {
        let len = self.read_u32()? as usize;
        if len > max_len {
            return Err(DecodeError::ArrayTooLong(len, max_len));
        }
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.position
    }

    pub fn has_remaining(&self) -> bool {
        self.position < self.data.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    /// Fail if any bytes were left unread
    pub fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_integer_boundaries_round_trip() {
        let mut w = StreamWriter::new();
        for v in [0u8, 1, u8::MAX] {
            w.write_u8(v);
        }
        for v in [0u16, u16::MAX] {
            w.write_u16(v);
        }
        for v in [0u32, u32::MAX] {
            w.write_u32(v);
        }
        w.write_i8(i8::MIN);
        w.write_i8(i8::MAX);
        w.write_i16(i16::MIN);
        w.write_i32(i32::MIN);
        w.write_i32(-1);
        let data = w.into_bytes();

        let mut r = StreamReader::new(&data);
        assert_eq!(r.read_u8(), Ok(0));
        assert_eq!(r.read_u8(), Ok(1));
        assert_eq!(r.read_u8(), Ok(u8::MAX));
        assert_eq!(r.read_u16(), Ok(0));
        assert_eq!(r.read_u16(), Ok(u16::MAX));
        assert_eq!(r.read_u32(), Ok(0));
        assert_eq!(r.read_u32(), Ok(u32::MAX));
        assert_eq!(r.read_i8(), Ok(i8::MIN));
        assert_eq!(r.read_i8(), Ok(i8::MAX));
        assert_eq!(r.read_i16(), Ok(i16::MIN));
        assert_eq!(r.read_i32(), Ok(i32::MIN));
        assert_eq!(r.read_i32(), Ok(-1));
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_floats_are_bit_exact() {
        let values = [0.0f32, -0.0, 1.5, f32::MAX, f32::MIN_POSITIVE, f32::INFINITY];
        let mut w = StreamWriter::new();
        for v in values {
            w.write_f32(v);
        }
        let data = w.into_bytes();
        let mut r = StreamReader::new(&data);
        for v in values {
            assert_eq!(r.read_f32().unwrap().to_bits(), v.to_bits());
        }
    }

    #[test]
    fn test_bool_encoding() {
        let mut w = StreamWriter::new();
        w.write_bool(true);
        w.write_bool(false);
        assert_eq!(w.as_bytes(), &[1, 0]);

        let mut r = StreamReader::new(&[2]);
        assert_eq!(r.read_bool(), Err(DecodeError::InvalidBool(2)));
    }

    #[test]
    fn test_strings() {
        let mut w = StreamWriter::new();
        w.write_string("", 8).unwrap();
        w.write_string("héllo", 8).unwrap();
        let data = w.into_bytes();

        let mut r = StreamReader::new(&data);
        assert_eq!(r.read_string(8).unwrap(), "");
        assert_eq!(r.read_string(8).unwrap(), "héllo");
        assert!(!r.has_remaining());
    }

    #[test]
    fn test_string_over_cap() {
        let mut w = StreamWriter::new();
        assert_eq!(
            w.write_string("too long", 4),
            Err(EncodeError::StringTooLong(8, 4))
        );
        assert!(w.is_empty());

        let mut w = StreamWriter::new();
        w.write_string("too long", 32).unwrap();
        let data = w.into_bytes();
        let mut r = StreamReader::new(&data);
        assert_eq!(r.read_string(4), Err(DecodeError::StringTooLong(8, 4)));
    }

    #[test]
    fn test_invalid_utf8() {
        let data = [2u8, 0, 0xff, 0xfe];
        let mut r = StreamReader::new(&data);
        assert_eq!(r.read_string(8), Err(DecodeError::InvalidUtf8));
    }

    #[test]
    fn test_arrays_empty_and_full() {
        let full: Vec<u16> = (0..16).collect();
        let mut w = StreamWriter::new();
        w.write_array(&[] as &[u16], 16, |w, v| {
            w.write_u16(*v);
            Ok(())
        })
        .unwrap();
        w.write_array(&full, 16, |w, v| {
            w.write_u16(*v);
            Ok(())
        })
        .unwrap();
        let data = w.into_bytes();

        let mut r = StreamReader::new(&data);
        let empty = r.read_array(16, |r| r.read_u16()).unwrap();
        assert!(empty.is_empty());
        assert_eq!(r.read_array(16, |r| r.read_u16()).unwrap(), full);
        assert!(r.finish().is_ok());
    }

    #[test]
    fn test_oversize_array_fails_decode() {
        let items = vec![7u8; 5];
        let mut w = StreamWriter::new();
        w.write_array(&items, 10, |w, v| {
            w.write_u8(*v);
            Ok(())
        })
        .unwrap();
        let data = w.into_bytes();

        let mut r = StreamReader::new(&data);
        assert_eq!(
            r.read_array(4, |r| r.read_u8()),
            Err(DecodeError::ArrayTooLong(5, 4))
        );
    }

    #[test]
    fn test_oversize_array_fails_encode() {
        let mut w = StreamWriter::new();
        let result = w.write_array(&[1u8, 2, 3], 2, |w, v| {
            w.write_u8(*v);
            Ok(())
        });
        assert_eq!(result, Err(EncodeError::ArrayTooLong(3, 2)));
    }

    #[test]
    fn test_lying_array_count_does_not_overrun() {
        // Claims 1000 elements but carries two
        let data = [0xe8u8, 0x03, 1, 2];
        let mut r = StreamReader::new(&data);
        let result = r.read_array(2000, |r| r.read_u8());
        assert!(matches!(result, Err(DecodeError::UnexpectedEnd { .. })));
    }

    #[test]
    fn test_read_past_end() {
        let data = [1u8, 2, 3];
        let mut r = StreamReader::new(&data);
        assert!(r.read_u16().is_ok());
        assert_eq!(
            r.read_u32(),
            Err(DecodeError::UnexpectedEnd {
                needed: 4,
                remaining: 1
            })
        );
        // Failed read leaves the cursor in place
        assert_eq!(r.position(), 2);
        assert_eq!(r.read_u8(), Ok(3));
        assert_eq!(r.read_u8(), Err(DecodeError::UnexpectedEnd { needed: 1, remaining: 0 }));
    }

    #[test]
    fn test_blob() {
        let mut w = StreamWriter::new();
        w.write_blob(&[9, 8, 7], 16).unwrap();
        w.write_blob(&[], 16).unwrap();
        let data = w.into_bytes();
        let mut r = StreamReader::new(&data);
        assert_eq!(r.read_blob(16).unwrap(), vec![9, 8, 7]);
        assert!(r.read_blob(16).unwrap().is_empty());
    }

    #[test]
    fn test_finish_rejects_trailing_bytes() {
        let data = [1u8, 2];
        let mut r = StreamReader::new(&data);
        r.read_u8().unwrap();
        assert_eq!(r.finish(), Err(DecodeError::TrailingBytes(1)));
    }

    #[test]
    fn test_vec2() {
        let mut w = StreamWriter::with_capacity(8);
        w.write_vec2(Vec2::new(-12.5, 300.25));
        assert_eq!(w.len(), 8);
        let data = w.into_bytes();
        let mut r = StreamReader::new(&data);
        assert_eq!(r.read_vec2().unwrap(), Vec2::new(-12.5, 300.25));
    }
}
