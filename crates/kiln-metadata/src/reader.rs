use crate::error::{Error, Result};

/// Little-endian cursor over a byte slice.
#[derive(Debug, Clone)]
pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn at(bytes: &'a [u8], offset: usize) -> Result<Self> {
        if offset > bytes.len() {
            return Err(Error::UnexpectedEof);
        }
        Ok(Self { bytes, pos: offset })
    }

    pub(crate) fn position(&self) -> usize {
        self.pos
    }

    pub(crate) fn skip(&mut self, len: usize) -> Result<()> {
        self.read_bytes(len).map(|_| ())
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(Error::UnexpectedEof)?;
        if end > self.bytes.len() {
            return Err(Error::UnexpectedEof);
        }
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    /// Reads a null-terminated byte string (terminator consumed, not returned).
    pub(crate) fn read_cstr(&mut self, max_len: usize) -> Result<&'a [u8]> {
        let tail = &self.bytes[self.pos..];
        let len = tail
            .iter()
            .take(max_len + 1)
            .position(|b| *b == 0)
            .ok_or(Error::Other("unterminated or oversized name"))?;
        let out = &tail[..len];
        self.pos += len + 1;
        Ok(out)
    }

    pub(crate) fn read_u1(&mut self) -> Result<u8> {
        Ok(self.read_bytes(1)?[0])
    }

    pub(crate) fn peek_u1(&self) -> Result<u8> {
        self.bytes.get(self.pos).copied().ok_or(Error::UnexpectedEof)
    }

    pub(crate) fn read_u2(&mut self) -> Result<u16> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub(crate) fn read_u4(&mut self) -> Result<u32> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub(crate) fn read_u8(&mut self) -> Result<u64> {
        let b = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    /// ECMA-335 II.23.2 compressed unsigned integer.
    pub(crate) fn read_compressed_u32(&mut self) -> Result<u32> {
        let first = self.read_u1()?;
        if first & 0x80 == 0 {
            return Ok(u32::from(first));
        }
        if first & 0xC0 == 0x80 {
            let second = self.read_u1()?;
            return Ok((u32::from(first & 0x3F) << 8) | u32::from(second));
        }
        if first & 0xE0 == 0xC0 {
            let rest = self.read_bytes(3)?;
            return Ok((u32::from(first & 0x1F) << 24)
                | (u32::from(rest[0]) << 16)
                | (u32::from(rest[1]) << 8)
                | u32::from(rest[2]));
        }
        Err(Error::InvalidCompressedInteger)
    }

    /// ECMA-335 II.23.2 compressed signed integer (used for array lower bounds).
    pub(crate) fn read_compressed_i32(&mut self) -> Result<i32> {
        let width = match self.peek_u1()? {
            b if b & 0x80 == 0 => 1,
            b if b & 0xC0 == 0x80 => 2,
            b if b & 0xE0 == 0xC0 => 4,
            _ => return Err(Error::InvalidCompressedInteger),
        };
        let raw = self.read_compressed_u32()?;
        let negative = raw & 1 == 1;
        let magnitude = (raw >> 1) as i32;
        if !negative {
            return Ok(magnitude);
        }
        let bias = match width {
            1 => 0x40,
            2 => 0x2000,
            _ => 0x1000_0000,
        };
        Ok(magnitude - bias)
    }

    pub(crate) fn align_to(&mut self, alignment: usize) -> Result<()> {
        let rem = self.pos % alignment;
        if rem != 0 {
            self.skip(alignment - rem)?;
        }
        Ok(())
    }
}
