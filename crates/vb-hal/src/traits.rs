// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! HAL trait definitions
//!
//! Platform-agnostic interfaces the boot core needs from its environment.
//! Firmware implements them over real storage and buses; host tools and tests
//! implement them over memory.

use crate::error::{HalError, HalResult};

/// Sector-addressed boot device
pub trait BlockDevice {
    /// Logical sector size in bytes
    fn sector_size(&self) -> u32;

    /// Number of sectors on the device
    fn sector_count(&self) -> u64;

    /// Read whole sectors starting at `lba`
    ///
    /// `buffer.len()` must be a multiple of the sector size.
    fn read_sectors(&mut self, lba: u64, buffer: &mut [u8]) -> HalResult<()>;

    /// Write whole sectors starting at `lba`
    fn write_sectors(&mut self, lba: u64, data: &[u8]) -> HalResult<()>;

    /// Read an arbitrary byte range that starts on a sector boundary
    ///
    /// The tail of a partial sector is read through a bounce buffer.
    fn read_bytes(&mut self, lba: u64, buffer: &mut [u8]) -> HalResult<()> {
        let sector = self.sector_size() as usize;
        if sector == 0 || sector > MAX_BOUNCE_SECTOR {
            return Err(HalError::InvalidParameter);
        }
        let whole = buffer.len() - buffer.len() % sector;
        if whole > 0 {
            self.read_sectors(lba, &mut buffer[..whole])?;
        }
        let rest = buffer.len() - whole;
        if rest > 0 {
            let mut bounce = [0u8; MAX_BOUNCE_SECTOR];
            let tail_lba = lba + (whole / sector) as u64;
            self.read_sectors(tail_lba, &mut bounce[..sector])?;
            buffer[whole..].copy_from_slice(&bounce[..rest]);
        }
        Ok(())
    }

    /// Device size in bytes
    fn size_bytes(&self) -> u64 {
        self.sector_count() * u64::from(self.sector_size())
    }
}

/// Largest sector size the default byte reader supports
pub const MAX_BOUNCE_SECTOR: usize = 4096;

/// Ordinary non-volatile storage holding the NV record blob
pub trait NvBlobStore {
    /// Load the stored blob into `buffer`, returning its length
    fn load_blob(&mut self, buffer: &mut [u8]) -> HalResult<usize>;

    /// Persist `data`
    fn store_blob(&mut self, data: &[u8]) -> HalResult<()>;
}

/// Request/response transport to the security module
pub trait TpmTransport {
    /// Send one request frame and wait for its response
    ///
    /// Returns the number of response bytes written into `response`.
    /// A response not received within `timeout_ms` yields
    /// [`HalError::Timeout`].
    fn transmit(&mut self, request: &[u8], response: &mut [u8], timeout_ms: u32)
        -> HalResult<usize>;
}

impl<T: BlockDevice + ?Sized> BlockDevice for &mut T {
    fn sector_size(&self) -> u32 {
        (**self).sector_size()
    }

    fn sector_count(&self) -> u64 {
        (**self).sector_count()
    }

    fn read_sectors(&mut self, lba: u64, buffer: &mut [u8]) -> HalResult<()> {
        (**self).read_sectors(lba, buffer)
    }

    fn write_sectors(&mut self, lba: u64, data: &[u8]) -> HalResult<()> {
        (**self).write_sectors(lba, data)
    }
}

impl<T: TpmTransport + ?Sized> TpmTransport for &mut T {
    fn transmit(
        &mut self,
        request: &[u8],
        response: &mut [u8],
        timeout_ms: u32,
    ) -> HalResult<usize> {
        (**self).transmit(request, response, timeout_ms)
    }
}
