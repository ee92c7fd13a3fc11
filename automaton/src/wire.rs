//! Deterministic wire encoding for mutation payloads and snapshots.
//!
//! All integers are little-endian; byte strings are length-prefixed with a
//! `u32`. Every value has exactly one encoding, which is what makes snapshot
//! save -> load -> save byte-stable.

use bytes::Bytes;
use snafu::Snafu;

/// Wire decoding errors.
#[derive(Debug, Snafu, PartialEq, Eq)]
#[allow(missing_docs)]
#[snafu(visibility(pub))]
pub enum WireError {
    #[snafu(display("unexpected end of payload: needed {needed} more bytes"))]
    UnexpectedEof { needed: usize },

    #[snafu(display("{remaining} trailing bytes after payload"))]
    TrailingBytes { remaining: usize },

    #[snafu(display("invalid boolean byte {value:#x}"))]
    InvalidBool { value: u8 },

    #[snafu(display("invalid utf-8 in wire string"))]
    InvalidUtf8,

    #[snafu(display("malformed payload: {message}"))]
    Malformed { message: String },
}

/// Result alias for wire decoding.
pub type WireResult<T> = Result<T, WireError>;

/// Serializes values into a growing byte buffer.
#[derive(Debug, Default)]
pub struct WireWriter {
    buf: Vec<u8>,
}

impl WireWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Finish and take the encoded bytes.
    pub fn finish(self) -> Bytes {
        Bytes::from(self.buf)
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Write a `u8`.
    pub fn write_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    /// Write a `u16`.
    pub fn write_u16(&mut self, value: u16) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a `u32`.
    pub fn write_u32(&mut self, value: u32) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a `u64`.
    pub fn write_u64(&mut self, value: u64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write an `i64`.
    pub fn write_i64(&mut self, value: i64) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a `u128`.
    pub fn write_u128(&mut self, value: u128) {
        self.buf.extend_from_slice(&value.to_le_bytes());
    }

    /// Write a boolean as one byte.
    pub fn write_bool(&mut self, value: bool) {
        self.buf.push(value as u8);
    }

    /// Write a length-prefixed byte string.
    pub fn write_bytes(&mut self, value: &[u8]) {
        self.write_u32(value.len() as u32);
        self.buf.extend_from_slice(value);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_string(&mut self, value: &str) {
        self.write_bytes(value.as_bytes());
    }
}

/// Deserializes values from a byte slice.
#[derive(Debug)]
pub struct WireReader<'a> {
    buf: &'a [u8],
}

impl<'a> WireReader<'a> {
    /// Read from `buf`.
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }

    /// Fail unless the payload was fully consumed.
    pub fn expect_eof(&self) -> WireResult<()> {
        if self.buf.is_empty() {
            Ok(())
        } else {
            TrailingBytesSnafu {
                remaining: self.buf.len(),
            }
            .fail()
        }
    }

    fn take(&mut self, len: usize) -> WireResult<&'a [u8]> {
        if self.buf.len() < len {
            return UnexpectedEofSnafu {
                needed: len - self.buf.len(),
            }
            .fail();
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    /// Read a `u8`.
    pub fn read_u8(&mut self) -> WireResult<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a `u16`.
    pub fn read_u16(&mut self) -> WireResult<u16> {
        Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
    }

    /// Read a `u32`.
    pub fn read_u32(&mut self) -> WireResult<u32> {
        Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
    }

    /// Read a `u64`.
    pub fn read_u64(&mut self) -> WireResult<u64> {
        Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Read an `i64`.
    pub fn read_i64(&mut self) -> WireResult<i64> {
        Ok(i64::from_le_bytes(self.take(8)?.try_into().unwrap()))
    }

    /// Read a `u128`.
    pub fn read_u128(&mut self) -> WireResult<u128> {
        Ok(u128::from_le_bytes(self.take(16)?.try_into().unwrap()))
    }

    /// Read a boolean.
    pub fn read_bool(&mut self) -> WireResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            value => InvalidBoolSnafu { value }.fail(),
        }
    }

    /// Read a length-prefixed byte string.
    pub fn read_bytes(&mut self) -> WireResult<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_string(&mut self) -> WireResult<String> {
        String::from_utf8(self.read_bytes()?).map_err(|_| WireError::InvalidUtf8)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_all_scalars() {
        let mut writer = WireWriter::new();
        writer.write_u8(0xab);
        writer.write_u16(0xcdef);
        writer.write_u32(0xdead_beef);
        writer.write_u64(u64::MAX - 1);
        writer.write_i64(-42);
        writer.write_u128(u128::MAX / 3);
        writer.write_bool(true);
        writer.write_bytes(b"hello");
        writer.write_string("world");
        let encoded = writer.finish();

        let mut reader = WireReader::new(&encoded);
        assert_eq!(reader.read_u8().unwrap(), 0xab);
        assert_eq!(reader.read_u16().unwrap(), 0xcdef);
        assert_eq!(reader.read_u32().unwrap(), 0xdead_beef);
        assert_eq!(reader.read_u64().unwrap(), u64::MAX - 1);
        assert_eq!(reader.read_i64().unwrap(), -42);
        assert_eq!(reader.read_u128().unwrap(), u128::MAX / 3);
        assert!(reader.read_bool().unwrap());
        assert_eq!(reader.read_bytes().unwrap(), b"hello");
        assert_eq!(reader.read_string().unwrap(), "world");
        reader.expect_eof().unwrap();
    }

    #[test]
    fn truncated_payload_is_an_error() {
        let mut writer = WireWriter::new();
        writer.write_u64(7);
        let encoded = writer.finish();

        let mut reader = WireReader::new(&encoded[..4]);
        assert_eq!(
            reader.read_u64().unwrap_err(),
            WireError::UnexpectedEof { needed: 4 }
        );
    }

    #[test]
    fn trailing_bytes_are_detected() {
        let mut writer = WireWriter::new();
        writer.write_u8(1);
        writer.write_u8(2);
        let encoded = writer.finish();

        let mut reader = WireReader::new(&encoded);
        reader.read_u8().unwrap();
        assert!(matches!(
            reader.expect_eof(),
            Err(WireError::TrailingBytes { remaining: 1 })
        ));
    }

    #[test]
    fn bad_bool_is_rejected() {
        let mut reader = WireReader::new(&[7]);
        assert_eq!(
            reader.read_bool().unwrap_err(),
            WireError::InvalidBool { value: 7 }
        );
    }
}
