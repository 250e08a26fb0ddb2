//! Sequential reader over a packet payload.
//!
//! Decodes the fixed-width and length-encoded integers and strings used
//! throughout the protocol. Running past the end of the payload is a
//! decode error for the whole packet.

#![allow(clippy::cast_possible_truncation)]

use mywire_core::{Error, Result};

/// Marker byte that stands for SQL NULL in a length-encoded position.
pub const NULL_MARKER: u8 = 0xFB;

/// A cursor over a borrowed payload.
#[derive(Debug)]
pub struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    /// Create a new cursor positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current offset into the payload.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read.
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Peek at the next byte without advancing.
    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.remaining() < len {
            return Err(Error::decode(format!(
                "unexpected end of packet: need {} bytes at offset {}, {} remaining",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16_le(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Read a 3-byte little-endian integer.
    pub fn read_u24_le(&mut self) -> Result<u32> {
        let b = self.take(3)?;
        Ok(u32::from(b[0]) | (u32::from(b[1]) << 8) | (u32::from(b[2]) << 16))
    }

    pub fn read_u32_le(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_u64_le(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    /// Read a length-encoded integer.
    ///
    /// - 0x00-0xFA: the byte itself
    /// - 0xFB: NULL, reported as 0
    /// - 0xFC: 2-byte value follows
    /// - 0xFD: 3-byte value follows
    /// - 0xFE: 8-byte value follows
    pub fn read_encoded_len(&mut self) -> Result<u64> {
        let first = self.read_u8()?;
        match first {
            0x00..=0xFA => Ok(u64::from(first)),
            NULL_MARKER => Ok(0),
            0xFC => self.read_u16_le().map(u64::from),
            0xFD => self.read_u24_le().map(u64::from),
            0xFE => self.read_u64_le(),
            0xFF => Err(Error::decode(format!(
                "invalid length-encoded integer prefix 0xFF at offset {}",
                self.pos - 1
            ))),
        }
    }

    /// Read `len` bytes as UTF-8 text.
    pub fn read_encoded_string(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        Ok(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Read a length-encoded string (length prefix followed by the text).
    pub fn read_lenenc_string(&mut self) -> Result<String> {
        let len = self.read_length()?;
        self.read_encoded_string(len)
    }

    /// Read a length-encoded byte slice.
    pub fn read_lenenc_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_length()?;
        self.take(len)
    }

    fn read_length(&mut self) -> Result<usize> {
        let len = self.read_encoded_len()?;
        usize::try_from(len)
            .map_err(|_| Error::decode(format!("length {} does not fit in memory", len)))
    }

    /// Read a NUL-terminated string. A missing terminator consumes the rest.
    pub fn read_null_string(&mut self) -> String {
        let rest = &self.data[self.pos.min(self.data.len())..];
        let end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let s = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += (end + 1).min(rest.len());
        s
    }

    /// Read a fixed number of bytes.
    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.take(len)
    }

    /// Read remaining bytes.
    pub fn read_rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos.min(self.data.len())..];
        self.pos = self.data.len();
        rest
    }

    /// Read remaining data as a string.
    pub fn read_rest_string(&mut self) -> String {
        String::from_utf8_lossy(self.read_rest()).into_owned()
    }

    /// Skip `n` bytes.
    pub fn skip(&mut self, n: usize) -> Result<()> {
        self.take(n).map(|_| ())
    }
}
