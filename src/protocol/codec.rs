//! Little-endian field reader and writer for ZCL records.

use crate::error::{DecodeError, EncodeError};

/// Cursor over a received payload.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < n {
            return Err(DecodeError::Truncated);
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    pub fn u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.take(1)?[0])
    }

    pub fn u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    pub fn u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    /// Everything not yet consumed.
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Append-only little-endian writer over a fixed-capacity buffer.
pub trait PutLe {
    fn put_slice(&mut self, data: &[u8]) -> Result<(), EncodeError>;

    fn put_u8(&mut self, v: u8) -> Result<(), EncodeError> {
        self.put_slice(&[v])
    }

    fn put_u16(&mut self, v: u16) -> Result<(), EncodeError> {
        self.put_slice(&v.to_le_bytes())
    }

    fn put_u32(&mut self, v: u32) -> Result<(), EncodeError> {
        self.put_slice(&v.to_le_bytes())
    }
}

impl<const N: usize> PutLe for heapless::Vec<u8, N> {
    fn put_slice(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        self.extend_from_slice(data).map_err(|()| EncodeError::BufferFull)
    }
}

/// Growable writer for host-side tooling (building OTA files).
impl PutLe for Vec<u8> {
    fn put_slice(&mut self, data: &[u8]) -> Result<(), EncodeError> {
        self.extend_from_slice(data);
        Ok(())
    }
}
