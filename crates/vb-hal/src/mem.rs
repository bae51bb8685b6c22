// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Memory-backed devices

use alloc::vec;
use alloc::vec::Vec;

use crate::error::{HalError, HalResult};
use crate::traits::{BlockDevice, NvBlobStore};

/// Disk image held in memory
#[derive(Debug, Clone)]
pub struct MemoryDisk {
    data: Vec<u8>,
    sector_size: u32,
    writes: usize,
    fail_reads: bool,
}

impl MemoryDisk {
    /// Zero-filled disk of `sectors` sectors
    #[must_use]
    pub fn new(sectors: u64, sector_size: u32) -> Self {
        let len = usize::try_from(sectors * u64::from(sector_size)).unwrap_or(0);
        Self {
            data: vec![0u8; len],
            sector_size,
            writes: 0,
            fail_reads: false,
        }
    }

    /// Wrap an existing image; a trailing partial sector is ignored
    #[must_use]
    pub fn from_image(data: Vec<u8>, sector_size: u32) -> Self {
        Self {
            data,
            sector_size,
            writes: 0,
            fail_reads: false,
        }
    }

    /// Raw image bytes
    #[must_use]
    pub fn image(&self) -> &[u8] {
        &self.data
    }

    /// Mutable raw image bytes
    pub fn image_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Consume the disk and return its image
    #[must_use]
    pub fn into_image(self) -> Vec<u8> {
        self.data
    }

    /// Number of `write_sectors` calls so far
    #[must_use]
    pub const fn write_count(&self) -> usize {
        self.writes
    }

    /// Make every subsequent read fail
    pub fn fail_reads(&mut self, fail: bool) {
        self.fail_reads = fail;
    }

    fn range(&self, lba: u64, len: usize) -> HalResult<core::ops::Range<usize>> {
        let sector = self.sector_size as usize;
        if sector == 0 || len % sector != 0 {
            return Err(HalError::Misaligned);
        }
        let start = usize::try_from(lba)
            .ok()
            .and_then(|l| l.checked_mul(sector))
            .ok_or(HalError::OutOfBounds)?;
        let end = start.checked_add(len).ok_or(HalError::OutOfBounds)?;
        if end > self.data.len() - self.data.len() % sector {
            return Err(HalError::OutOfBounds);
        }
        Ok(start..end)
    }
}

impl BlockDevice for MemoryDisk {
    fn sector_size(&self) -> u32 {
        self.sector_size
    }

    fn sector_count(&self) -> u64 {
        if self.sector_size == 0 {
            return 0;
        }
        (self.data.len() / self.sector_size as usize) as u64
    }

    fn read_sectors(&mut self, lba: u64, buffer: &mut [u8]) -> HalResult<()> {
        if self.fail_reads {
            return Err(HalError::ReadFailed);
        }
        let range = self.range(lba, buffer.len())?;
        buffer.copy_from_slice(&self.data[range]);
        Ok(())
    }

    fn write_sectors(&mut self, lba: u64, data: &[u8]) -> HalResult<()> {
        let range = self.range(lba, data.len())?;
        self.data[range].copy_from_slice(data);
        self.writes += 1;
        Ok(())
    }
}

/// NV record store held in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryNvStore {
    blob: Vec<u8>,
    stores: usize,
    fail_store: bool,
}

impl MemoryNvStore {
    /// Empty store (a fresh device)
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-loaded with `blob`
    #[must_use]
    pub fn with_blob(blob: &[u8]) -> Self {
        Self {
            blob: blob.to_vec(),
            stores: 0,
            fail_store: false,
        }
    }

    /// Current blob
    #[must_use]
    pub fn blob(&self) -> &[u8] {
        &self.blob
    }

    /// Number of successful stores
    #[must_use]
    pub const fn store_count(&self) -> usize {
        self.stores
    }

    /// Make every subsequent store fail
    pub fn fail_store(&mut self, fail: bool) {
        self.fail_store = fail;
    }
}

impl NvBlobStore for MemoryNvStore {
    fn load_blob(&mut self, buffer: &mut [u8]) -> HalResult<usize> {
        let n = self.blob.len().min(buffer.len());
        buffer[..n].copy_from_slice(&self.blob[..n]);
        Ok(n)
    }

    fn store_blob(&mut self, data: &[u8]) -> HalResult<()> {
        if self.fail_store {
            return Err(HalError::NvStorageError);
        }
        self.blob.clear();
        self.blob.extend_from_slice(data);
        self.stores += 1;
        Ok(())
    }
}
