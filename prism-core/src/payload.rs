//! Positional payload cursor.
//!
//! Payload layouts are fixed by the protocol, not self-describing:
//! every field is read at an explicit cursor position, in order, and
//! `cursor == payload.len()` is a valid end-of-payload. Fixed-width
//! integers are little-endian. Composite primitives:
//!
//! ```text
//! string          <u32 length><utf8 bytes>
//! string_list     <u32 count> count × string
//! parameter_list  <u32 count> count × <string name><u32 type>
//! ```

use bytes::{BufMut, Bytes, BytesMut};

use crate::datatype::{DataType, Parameter};
use crate::error::PrismError;

// ── PayloadReader ────────────────────────────────────────────────

/// Cursor-bearing reader over one message payload.
pub struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes left after the cursor.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// True once every payload byte has been consumed.
    pub fn at_end(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PrismError> {
        if self.remaining() < n {
            return Err(PrismError::Truncated {
                wanted: n,
                remaining: self.remaining(),
            });
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn u32(&mut self) -> Result<u32, PrismError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn i32(&mut self) -> Result<i32, PrismError> {
        Ok(self.u32()? as i32)
    }

    pub fn u64(&mut self) -> Result<u64, PrismError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// Read exactly `n` raw bytes.
    pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], PrismError> {
        self.take(n)
    }

    /// Consume everything after the cursor.
    pub fn rest(&mut self) -> &'a [u8] {
        let slice = &self.buf[self.pos..];
        self.pos = self.buf.len();
        slice
    }

    pub fn string(&mut self) -> Result<String, PrismError> {
        let len = self.u32()? as usize;
        let raw = self.take(len)?;
        Ok(String::from_utf8(raw.to_vec())?)
    }

    /// An enum tag field; the caller converts with `DataType::try_from`
    /// or `Opcode::try_from`.
    pub fn data_type(&mut self) -> Result<DataType, PrismError> {
        DataType::try_from(self.u32()?)
    }

    pub fn string_list(&mut self) -> Result<Vec<String>, PrismError> {
        let count = self.u32()?;
        (0..count).map(|_| self.string()).collect()
    }

    pub fn parameter_list(&mut self) -> Result<Vec<Parameter>, PrismError> {
        let count = self.u32()?;
        (0..count)
            .map(|_| {
                Ok(Parameter {
                    name: self.string()?,
                    ty: self.data_type()?,
                })
            })
            .collect()
    }
}

// ── PayloadWriter ────────────────────────────────────────────────

/// Growing little-endian payload builder, the mirror of
/// [`PayloadReader`].
#[derive(Default)]
pub struct PayloadWriter {
    buf: BytesMut,
}

impl PayloadWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(&mut self, v: u32) -> &mut Self {
        self.buf.put_u32_le(v);
        self
    }

    pub fn i32(&mut self, v: i32) -> &mut Self {
        self.buf.put_i32_le(v);
        self
    }

    pub fn u64(&mut self, v: u64) -> &mut Self {
        self.buf.put_u64_le(v);
        self
    }

    pub fn data_type(&mut self, ty: DataType) -> &mut Self {
        self.u32(ty as u32)
    }

    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.put_slice(bytes);
        self
    }

    pub fn string(&mut self, s: &str) -> &mut Self {
        self.u32(s.len() as u32);
        self.buf.put_slice(s.as_bytes());
        self
    }

    pub fn string_list(&mut self, items: &[String]) -> &mut Self {
        self.u32(items.len() as u32);
        for item in items {
            self.string(item);
        }
        self
    }

    pub fn parameter_list(&mut self, items: &[Parameter]) -> &mut Self {
        self.u32(items.len() as u32);
        for p in items {
            self.string(&p.name);
            self.u32(p.ty as u32);
        }
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}
