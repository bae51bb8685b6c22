// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Kernel partition verification
//!
//! Ties the key block and preamble stages together for a partition laid out
//! as `[key block][preamble][body]`, and maps the stored combined rollback
//! value onto per-stage floors.

use vb_common::BootMode;

use super::body::verify_body;
use super::common::{VerifyError, VerifyResult};
use super::keyblock::{verify_key_block, VerifiedKeyBlock};
use super::preamble::{verify_preamble, VerifiedPreamble};
use super::public_key::PublicKey;

/// Combined rollback floor, `key_version << 16 | kernel_version`
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct VersionFloor {
    /// Combined value
    pub combined: u32,
}

impl VersionFloor {
    /// No floor
    pub const NONE: Self = Self { combined: 0 };

    /// Floor from a combined value
    #[must_use]
    pub const fn new(combined: u32) -> Self {
        Self { combined }
    }

    /// Combine key and kernel versions
    #[must_use]
    pub const fn combine(key_version: u32, kernel_version: u32) -> u32 {
        (key_version << 16) | (kernel_version & 0xFFFF)
    }

    /// Minimum data key version
    #[must_use]
    pub const fn key_floor(self) -> u32 {
        self.combined >> 16
    }

    /// Minimum kernel version for a data key of `key_version`
    ///
    /// A key newer than the floor resets the kernel floor.
    #[must_use]
    pub const fn kernel_floor_for(self, key_version: u32) -> u32 {
        if key_version == self.key_floor() {
            self.combined & 0xFFFF
        } else {
            0
        }
    }
}

/// Verified key block and preamble of a kernel partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelHeader {
    /// Verified key block
    pub keyblock: VerifiedKeyBlock,
    /// Verified preamble
    pub preamble: VerifiedPreamble,
}

impl KernelHeader {
    /// Offset of the body from the start of the partition
    #[must_use]
    pub const fn body_offset(&self) -> u64 {
        (self.keyblock.size + self.preamble.size) as u64
    }

    /// Combined version of this kernel
    #[must_use]
    pub const fn combined_version(&self) -> u32 {
        VersionFloor::combine(
            self.keyblock.data_key.key_version(),
            self.preamble.kernel_version,
        )
    }

    /// Data key for the body
    #[must_use]
    pub const fn data_key(&self) -> &PublicKey {
        &self.keyblock.data_key
    }
}

/// Verify the key block and preamble at the start of a kernel partition
///
/// `header` holds at least the key block and preamble; `partition_bytes` is
/// the full partition size, which must hold the body. Floors are enforced
/// only when `mode` enforces rollback.
///
/// # Errors
///
/// The first failing stage.
pub fn verify_kernel_header(
    header: &[u8],
    trusted: &PublicKey,
    mode: BootMode,
    floor: VersionFloor,
    partition_bytes: u64,
) -> VerifyResult<KernelHeader> {
    let floor = if mode.enforces_rollback() {
        floor
    } else {
        VersionFloor::NONE
    };

    let keyblock = verify_key_block(header, trusted, mode, floor.key_floor())?;
    let rest = header
        .get(keyblock.size..)
        .ok_or(VerifyError::PreambleFormat)?;
    let available = partition_bytes
        .checked_sub(keyblock.size as u64)
        .ok_or(VerifyError::SizeMismatch)?;
    let min_kernel = floor.kernel_floor_for(keyblock.data_key.key_version());
    let preamble = verify_preamble(rest, &keyblock.data_key, min_kernel, available)?;

    Ok(KernelHeader { keyblock, preamble })
}

/// Verify a whole kernel partition image held in memory
///
/// # Errors
///
/// The first failing stage.
pub fn verify_kernel_image(
    image: &[u8],
    trusted: &PublicKey,
    mode: BootMode,
    floor: VersionFloor,
) -> VerifyResult<KernelHeader> {
    let header = verify_kernel_header(image, trusted, mode, floor, image.len() as u64)?;
    let start = usize::try_from(header.body_offset()).map_err(|_| VerifyError::SizeMismatch)?;
    let len = usize::try_from(header.preamble.body_size).map_err(|_| VerifyError::SizeMismatch)?;
    let body = start
        .checked_add(len)
        .and_then(|end| image.get(start..end))
        .ok_or(VerifyError::SizeMismatch)?;
    verify_body(body, &header.preamble, header.data_key())?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_split() {
        let floor = VersionFloor::new(VersionFloor::combine(2, 7));
        assert_eq!(floor.combined, 0x0002_0007);
        assert_eq!(floor.key_floor(), 2);
        assert_eq!(floor.kernel_floor_for(2), 7);
        assert_eq!(floor.kernel_floor_for(3), 0);
    }

    #[test]
    fn test_floor_ordering_matches_combined() {
        let older = VersionFloor::new(VersionFloor::combine(1, 0xFFFF));
        let newer = VersionFloor::new(VersionFloor::combine(2, 0));
        assert!(older < newer);
    }
}
