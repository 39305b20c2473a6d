//! Wire buffer primitives.
//!
//! Big-endian integers and NUL-terminated strings over `bytes` buffers.
//! Reads never panic: running past the end of the body is a decode error.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{PgError, PgResult};

/// Growable buffer used to build message bodies.
#[derive(Debug, Default)]
pub struct WireBuffer {
    buf: BytesMut,
}

impl WireBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    #[inline]
    pub fn write_u8(&mut self, v: u8) {
        self.buf.put_u8(v);
    }

    #[inline]
    pub fn write_i16(&mut self, v: i16) {
        self.buf.put_i16(v);
    }

    #[inline]
    pub fn write_i32(&mut self, v: i32) {
        self.buf.put_i32(v);
    }

    #[inline]
    pub fn write_bytes(&mut self, v: &[u8]) {
        self.buf.put_slice(v);
    }

    /// Append the string followed by a single NUL.
    pub fn write_cstring(&mut self, s: &str) {
        self.buf.put_slice(s.as_bytes());
        self.buf.put_u8(0);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> BytesMut {
        self.buf
    }
}

/// Cursor over a received message body.
#[derive(Debug, Clone)]
pub struct ReadBuffer {
    buf: Bytes,
}

impl ReadBuffer {
    pub fn new(buf: Bytes) -> Self {
        Self { buf }
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn ensure(&self, n: usize, what: &str) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::Decode(format!(
                "unexpected end of message reading {} ({} of {} bytes available)",
                what,
                self.buf.remaining(),
                n
            )));
        }
        Ok(())
    }

    pub fn read_u8(&mut self) -> PgResult<u8> {
        self.ensure(1, "byte")?;
        Ok(self.buf.get_u8())
    }

    pub fn read_i16(&mut self) -> PgResult<i16> {
        self.ensure(2, "int16")?;
        Ok(self.buf.get_i16())
    }

    pub fn read_i32(&mut self) -> PgResult<i32> {
        self.ensure(4, "int32")?;
        Ok(self.buf.get_i32())
    }

    /// Split off exactly `n` bytes without copying.
    pub fn read_bytes(&mut self, n: usize) -> PgResult<Bytes> {
        self.ensure(n, "bytes")?;
        Ok(self.buf.split_to(n))
    }

    /// Read up to and excluding the next NUL.
    pub fn read_cstring(&mut self) -> PgResult<String> {
        let end = self
            .buf
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| PgError::Decode("missing NUL terminator in string".to_string()))?;

        let raw = self.buf.split_to(end);
        self.buf.advance(1);

        String::from_utf8(raw.to_vec())
            .map_err(|e| PgError::Decode(format!("invalid UTF-8 in string: {}", e)))
    }

    /// Take everything that is left.
    pub fn read_rest(&mut self) -> Bytes {
        self.buf.split_to(self.buf.remaining())
    }

    /// Fail if the decoder of message `msg_type` left bytes behind.
    pub fn finish(&self, msg_type: u8) -> PgResult<()> {
        if self.buf.has_remaining() {
            return Err(PgError::Decode(format!(
                "{} unread bytes left in message ({})",
                self.buf.remaining(),
                msg_type as char
            )));
        }
        Ok(())
    }
}
