//! Bounds-checked little-endian reads over a byte slice.

use crate::error::{Error, Result};

/// A read position over `buf[..limit]`.
///
/// Every read checks the remaining length first and fails with
/// [`Error::TruncatedRecord`] instead of reading out of bounds.
#[derive(Debug, Clone)]
pub struct ByteCursor<'a>
{
    buf: &'a [u8],
    pos: usize,
    limit: usize,
}

impl<'a> ByteCursor<'a>
{
    pub fn new(buf: &'a [u8]) -> Self
    {
        Self {
            buf,
            pos: 0,
            limit: buf.len(),
        }
    }

    pub fn position(&self) -> usize
    {
        self.pos
    }

    pub fn remaining(&self) -> usize
    {
        self.limit - self.pos
    }

    pub fn is_empty(&self) -> bool
    {
        self.remaining() == 0
    }

    /// Split off the next `len` bytes as their own cursor and advance past them.
    pub fn sub_cursor(&mut self, len: usize) -> Result<ByteCursor<'a>>
    {
        let bytes = self.read_bytes(len)?;
        Ok(ByteCursor::new(bytes))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]>
    {
        if len > self.remaining()
        {
            return Err(Error::TruncatedRecord {
                expected: len,
                available: self.remaining(),
            });
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    /// The unread rest of the cursor.
    pub fn read_rest(&mut self) -> &'a [u8]
    {
        let rest = &self.buf[self.pos..self.limit];
        self.pos = self.limit;
        rest
    }

    pub fn skip(&mut self, len: usize) -> Result<()>
    {
        self.read_bytes(len).map(|_| ())
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N]>
    {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8>
    {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16>
    {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    pub fn read_i32(&mut self) -> Result<i32>
    {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u32(&mut self) -> Result<u32>
    {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    pub fn read_u64(&mut self) -> Result<u64>
    {
        Ok(u64::from_le_bytes(self.read_array()?))
    }
}
