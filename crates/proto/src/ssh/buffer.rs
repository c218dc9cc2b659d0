//! SSH wire-format scratch buffer.
//!
//! [`Buffer`] holds an SSH message payload under construction or under
//! decoding. Writes append the RFC 4251 Section 5 field encodings (byte,
//! boolean, uint32, string); reads consume them from a cursor and report
//! truncation as [`SkeinError::Protocol`].
//!
//! # Example
//!
//! ```rust
//! use skein_proto::ssh::buffer::Buffer;
//!
//! let mut buffer = Buffer::with_capacity(32);
//! buffer.put_string("tcpip-forward");
//! buffer.put_bool(true);
//! buffer.put_u32(8080);
//!
//! assert_eq!(buffer.get_string().unwrap(), "tcpip-forward");
//! assert!(buffer.get_bool().unwrap());
//! assert_eq!(buffer.get_u32().unwrap(), 8080);
//! ```

use bytes::{BufMut, BytesMut};
use skein_platform::{SkeinError, SkeinResult};

/// Growable byte buffer with SSH field encoding and a read cursor.
#[derive(Debug, Default, Clone)]
pub struct Buffer {
    data: BytesMut,
    rpos: usize,
}

impl Buffer {
    /// Creates an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty buffer with the given capacity hint.
    pub fn with_capacity(hint: usize) -> Self {
        Self {
            data: BytesMut::with_capacity(hint),
            rpos: 0,
        }
    }

    /// Creates a buffer holding `data`, ready to be read from the start.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: BytesMut::from(&data[..]),
            rpos: 0,
        }
    }

    /// Total number of bytes written.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Number of bytes left to read.
    pub fn available(&self) -> usize {
        self.data.len() - self.rpos
    }

    /// The full written contents, ignoring the read cursor.
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Appends a raw byte.
    pub fn put_u8(&mut self, value: u8) {
        self.data.put_u8(value);
    }

    /// Appends an SSH boolean (single byte, 0 or 1).
    pub fn put_bool(&mut self, value: bool) {
        self.data.put_u8(u8::from(value));
    }

    /// Appends a big-endian uint32.
    pub fn put_u32(&mut self, value: u32) {
        self.data.put_u32(value);
    }

    /// Appends an SSH string (uint32 length prefix + bytes).
    pub fn put_string(&mut self, value: &str) {
        self.put_bytes(value.as_bytes());
    }

    /// Appends a length-prefixed byte block.
    pub fn put_bytes(&mut self, value: &[u8]) {
        self.data.put_u32(value.len() as u32);
        self.data.put_slice(value);
    }

    /// Reads a raw byte.
    pub fn get_u8(&mut self) -> SkeinResult<u8> {
        self.check_available(1)?;
        let value = self.data[self.rpos];
        self.rpos += 1;
        Ok(value)
    }

    /// Reads an SSH boolean; any non-zero byte is `true`.
    pub fn get_bool(&mut self) -> SkeinResult<bool> {
        Ok(self.get_u8()? != 0)
    }

    /// Reads a big-endian uint32.
    pub fn get_u32(&mut self) -> SkeinResult<u32> {
        self.check_available(4)?;
        let value = u32::from_be_bytes([
            self.data[self.rpos],
            self.data[self.rpos + 1],
            self.data[self.rpos + 2],
            self.data[self.rpos + 3],
        ]);
        self.rpos += 4;
        Ok(value)
    }

    /// Reads a length-prefixed byte block.
    pub fn get_bytes(&mut self) -> SkeinResult<Vec<u8>> {
        let length = self.get_u32()? as usize;
        self.check_available(length)?;
        let bytes = self.data[self.rpos..self.rpos + length].to_vec();
        self.rpos += length;
        Ok(bytes)
    }

    /// Reads an SSH string, validating UTF-8.
    pub fn get_string(&mut self) -> SkeinResult<String> {
        let bytes = self.get_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| SkeinError::Protocol("String contains invalid UTF-8".to_string()))
    }

    fn check_available(&self, needed: usize) -> SkeinResult<()> {
        if self.available() < needed {
            return Err(SkeinError::Protocol(format!(
                "Buffer truncated: need {} bytes at offset {}, have {}",
                needed,
                self.rpos,
                self.available()
            )));
        }
        Ok(())
    }
}
