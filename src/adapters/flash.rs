//! Staging region over any NOR flash.
//!
//! [`NorFlashStaging`] maps the page-oriented [`StagingPort`] onto an
//! `embedded-storage` [`NorFlash`], one erase sector per page.
//! [`MemFlash`] is a RAM-backed NOR part for the host and tests: erase sets
//! bytes to `0xFF` and writes can only clear bits, like the real thing.

use embedded_storage::nor_flash::{
    ErrorType, NorFlash, NorFlashError, NorFlashErrorKind, ReadNorFlash, check_erase, check_read,
    check_write,
};
use log::warn;

use crate::app::ports::StagingPort;
use crate::error::StorageError;

// ═══════════════════════════════════════════════════════════════
//  In-memory NOR flash
// ═══════════════════════════════════════════════════════════════

pub const MEM_FLASH_SECTOR: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemFlashError(NorFlashErrorKind);

impl NorFlashError for MemFlashError {
    fn kind(&self) -> NorFlashErrorKind {
        self.0
    }
}

#[derive(Debug, Clone)]
pub struct MemFlash {
    data: Vec<u8>,
    /// Reject every operation (simulated dead part).
    failing: bool,
}

impl MemFlash {
    /// Erased flash of `capacity` bytes, rounded down to whole sectors.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity - capacity % MEM_FLASH_SECTOR;
        Self {
            data: vec![0xFF; capacity],
            failing: false,
        }
    }

    pub fn set_failing(&mut self, failing: bool) {
        self.failing = failing;
    }

    /// Flip every bit of one byte behind the driver's back.
    pub fn corrupt(&mut self, offset: usize) {
        if let Some(b) = self.data.get_mut(offset) {
            *b ^= 0xFF;
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    fn check_alive(&self) -> Result<(), MemFlashError> {
        if self.failing {
            Err(MemFlashError(NorFlashErrorKind::Other))
        } else {
            Ok(())
        }
    }
}

impl ErrorType for MemFlash {
    type Error = MemFlashError;
}

impl ReadNorFlash for MemFlash {
    const READ_SIZE: usize = 1;

    fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
        self.check_alive()?;
        check_read(self, offset, bytes.len()).map_err(MemFlashError)?;
        let start = offset as usize;
        bytes.copy_from_slice(&self.data[start..start + bytes.len()]);
        Ok(())
    }

    fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl NorFlash for MemFlash {
    const WRITE_SIZE: usize = 1;
    const ERASE_SIZE: usize = MEM_FLASH_SECTOR;

    fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
        self.check_alive()?;
        check_erase(self, from, to).map_err(MemFlashError)?;
        self.data[from as usize..to as usize].fill(0xFF);
        Ok(())
    }

    fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
        self.check_alive()?;
        check_write(self, offset, bytes.len()).map_err(MemFlashError)?;
        let start = offset as usize;
        for (cell, b) in self.data[start..start + bytes.len()].iter_mut().zip(bytes) {
            *cell &= *b;
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════
//  StagingPort adapter
// ═══════════════════════════════════════════════════════════════

pub struct NorFlashStaging<F> {
    flash: F,
    open: bool,
}

impl<F: NorFlash> NorFlashStaging<F> {
    pub fn new(flash: F) -> Self {
        Self { flash, open: false }
    }

    pub fn flash(&self) -> &F {
        &self.flash
    }

    pub fn flash_mut(&mut self) -> &mut F {
        &mut self.flash
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    /// Absolute flash address of `page`+`offset`, after bounds checks.
    fn address(&self, page: u32, offset: u32, len: usize) -> Result<u32, StorageError> {
        if !self.open {
            return Err(StorageError::NotOpen);
        }
        let page_size = F::ERASE_SIZE as u64;
        if page >= self.page_count() || u64::from(offset) + len as u64 > page_size {
            return Err(StorageError::OutOfRange);
        }
        Ok((u64::from(page) * page_size + u64::from(offset)) as u32)
    }
}

fn io<E: NorFlashError>(e: E) -> StorageError {
    match e.kind() {
        NorFlashErrorKind::OutOfBounds => StorageError::OutOfRange,
        kind => {
            warn!("NorFlashStaging: flash error {kind:?}");
            StorageError::Io
        }
    }
}

impl<F: NorFlash> StagingPort for NorFlashStaging<F> {
    fn open(&mut self) -> Result<(), StorageError> {
        self.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.open = false;
    }

    fn page_size(&self) -> u32 {
        F::ERASE_SIZE as u32
    }

    fn page_count(&self) -> u32 {
        (self.flash.capacity() / F::ERASE_SIZE) as u32
    }

    fn read_page(&mut self, page: u32, offset: u32, buf: &mut [u8]) -> Result<(), StorageError> {
        let addr = self.address(page, offset, buf.len())?;
        self.flash.read(addr, buf).map_err(io)
    }

    fn write_page(&mut self, page: u32, offset: u32, data: &[u8]) -> Result<(), StorageError> {
        let addr = self.address(page, offset, data.len())?;
        self.flash.write(addr, data).map_err(io)
    }

    fn erase_page(&mut self, page: u32) -> Result<(), StorageError> {
        let addr = self.address(page, 0, 0)?;
        self.flash
            .erase(addr, addr + F::ERASE_SIZE as u32)
            .map_err(io)
    }
}
