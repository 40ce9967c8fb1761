//! Bounds-checked little-endian reads over byte buffers.
//!
//! Every header, table and opcode stream the loader interprets is read
//! through [`ByteReader`], so a truncated or lying file turns into an
//! [`ObjectFormatError::Truncated`] instead of an out-of-bounds access.

use crate::ObjectFormatError;

type Result<T> = core::result::Result<T, ObjectFormatError>;

#[derive(Clone, Copy, Debug)]
pub struct ByteReader<'a> {
    data: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Borrow `len` bytes starting at `offset`.
    pub fn bytes(&self, offset: u64, len: u64) -> Result<&'a [u8]> {
        let truncated = || ObjectFormatError::Truncated { offset, len };
        let start = usize::try_from(offset).map_err(|_| truncated())?;
        let len_usize = usize::try_from(len).map_err(|_| truncated())?;
        let end = start.checked_add(len_usize).ok_or_else(truncated)?;
        self.data.get(start..end).ok_or_else(truncated)
    }

    /// A reader over `[offset, offset + len)`.
    pub fn sub(&self, offset: u64, len: u64) -> Result<ByteReader<'a>> {
        Ok(ByteReader::new(self.bytes(offset, len)?))
    }

    /// A reader over everything from `offset` to the end.
    pub fn tail(&self, offset: u64) -> Result<ByteReader<'a>> {
        let rest = (self.data.len() as u64)
            .checked_sub(offset)
            .ok_or(ObjectFormatError::Truncated { offset, len: 0 })?;
        self.sub(offset, rest)
    }

    fn array<const N: usize>(&self, offset: u64) -> Result<[u8; N]> {
        let bytes = self.bytes(offset, N as u64)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn u8(&self, offset: u64) -> Result<u8> {
        Ok(self.array::<1>(offset)?[0])
    }

    pub fn u16(&self, offset: u64) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array(offset)?))
    }

    pub fn u32(&self, offset: u64) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array(offset)?))
    }

    pub fn i32(&self, offset: u64) -> Result<i32> {
        Ok(i32::from_le_bytes(self.array(offset)?))
    }

    pub fn u64(&self, offset: u64) -> Result<u64> {
        Ok(u64::from_le_bytes(self.array(offset)?))
    }

    pub fn i64(&self, offset: u64) -> Result<i64> {
        Ok(i64::from_le_bytes(self.array(offset)?))
    }

    /// NUL-terminated string at `offset`. The terminator must be inside the buffer.
    pub fn cstr(&self, offset: u64) -> Result<&'a str> {
        let rest = self.tail(offset)?.data;
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(ObjectFormatError::Truncated {
                offset,
                len: rest.len() as u64 + 1,
            })?;
        core::str::from_utf8(&rest[..end]).map_err(|_| ObjectFormatError::InvalidString { offset })
    }

    /// Unsigned LEB128 at `offset`; returns the value and the encoded length.
    pub fn uleb128(&self, offset: u64) -> Result<(u64, u64)> {
        let mut result = 0u64;
        let mut shift = 0u32;
        let mut consumed = 0u64;
        loop {
            let byte = self.u8(offset + consumed)?;
            consumed += 1;
            if shift < 64 {
                result |= u64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                return Ok((result, consumed));
            }
        }
    }

    /// Signed LEB128 at `offset`; returns the value and the encoded length.
    pub fn sleb128(&self, offset: u64) -> Result<(i64, u64)> {
        let mut result = 0i64;
        let mut shift = 0u32;
        let mut consumed = 0u64;
        loop {
            let byte = self.u8(offset + consumed)?;
            consumed += 1;
            if shift < 64 {
                result |= i64::from(byte & 0x7f) << shift;
            }
            shift += 7;
            if byte & 0x80 == 0 {
                if shift < 64 && byte & 0x40 != 0 {
                    result |= -1i64 << shift;
                }
                return Ok((result, consumed));
            }
        }
    }
}
