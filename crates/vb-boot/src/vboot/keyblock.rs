// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Key block
//!
//! Binds a data key and its version to the key of the previous stage.
//!
//! ```text
//! Offset  Size  Field
//! 0x00    8     Magic "CHROMEOS"
//! 0x08    4     Header version major (2)
//! 0x0C    4     Header version minor (>= 1)
//! 0x10    8     Key block size
//! 0x18    24    Signature descriptor
//! 0x30    24    Checksum descriptor (SHA-512)
//! 0x48    8     Flags
//! 0x50    32    Data key descriptor
//! ```
//!
//! The signature and the checksum cover the same leading bytes of the key
//! block, which must include the header and the data key.

use vb_common::constants::{
    KEYBLOCK_HEADER_SIZE, KEYBLOCK_MAGIC, KEYBLOCK_VERSION_MAJOR, KEYBLOCK_VERSION_MINOR,
};
use vb_common::BootMode;
use vb_crypto::{constant_time_eq, HashAlgorithm};

use super::common::{
    member, read_u32, read_u64, SignatureDescriptor, VerifyError, VerifyResult, VerifyStage,
};
use super::public_key::{PublicKey, PublicKeyDescriptor};

/// Key block flags
pub mod flags {
    /// Usable with the developer switch off
    pub const DEVELOPER_0: u64 = 0x01;
    /// Usable with the developer switch on
    pub const DEVELOPER_1: u64 = 0x02;
    /// Usable outside recovery
    pub const RECOVERY_0: u64 = 0x04;
    /// Usable in recovery
    pub const RECOVERY_1: u64 = 0x08;
    /// Every defined flag
    pub const ALL: u64 = DEVELOPER_0 | DEVELOPER_1 | RECOVERY_0 | RECOVERY_1;
}

pub(crate) const SIGNATURE_AT: usize = 0x18;
pub(crate) const CHECKSUM_AT: usize = 0x30;
pub(crate) const FLAGS_AT: usize = 0x48;
pub(crate) const DATA_KEY_AT: usize = 0x50;

/// Whether key block `value` flags allow booting in `mode`
#[must_use]
pub const fn flags_allow(value: u64, mode: BootMode) -> bool {
    let (dev, rec) = match mode {
        BootMode::Normal => (flags::DEVELOPER_0, flags::RECOVERY_0),
        BootMode::Developer => (flags::DEVELOPER_1, flags::RECOVERY_0),
        BootMode::Recovery => (flags::DEVELOPER_0 | flags::DEVELOPER_1, flags::RECOVERY_1),
    };
    value & dev != 0 && value & rec != 0
}

/// Structurally valid, not yet verified key block
#[derive(Debug, Clone, Copy)]
pub struct KeyBlock<'a> {
    raw: &'a [u8],
    signature: SignatureDescriptor,
    checksum: SignatureDescriptor,
    flags: u64,
    data_key: PublicKeyDescriptor,
}

impl<'a> KeyBlock<'a> {
    /// Parse the key block at the start of `data`
    ///
    /// # Errors
    ///
    /// `KeyBlockFormat` for a bad magic or version, a size outside `data`, or
    /// any member outside the key block.
    pub fn parse(data: &'a [u8]) -> VerifyResult<Self> {
        let bad = VerifyError::KeyBlockFormat;
        if data.len() < KEYBLOCK_HEADER_SIZE || data[..8] != KEYBLOCK_MAGIC {
            return Err(bad);
        }
        let major = read_u32(data, 0x08).ok_or(bad)?;
        let minor = read_u32(data, 0x0C).ok_or(bad)?;
        if major != KEYBLOCK_VERSION_MAJOR || minor < KEYBLOCK_VERSION_MINOR {
            return Err(bad);
        }

        let size = read_u64(data, 0x10)
            .and_then(|s| usize::try_from(s).ok())
            .ok_or(bad)?;
        if size < KEYBLOCK_HEADER_SIZE {
            return Err(bad);
        }
        let raw = data.get(..size).ok_or(bad)?;

        let signature = SignatureDescriptor::parse(raw, SIGNATURE_AT).ok_or(bad)?;
        let checksum = SignatureDescriptor::parse(raw, CHECKSUM_AT).ok_or(bad)?;
        let flags = read_u64(raw, FLAGS_AT).ok_or(bad)?;
        let data_key = PublicKeyDescriptor::parse(raw, DATA_KEY_AT).ok_or(bad)?;

        signature.signature(raw).ok_or(bad)?;
        let covered = signature.signed_data(raw).ok_or(bad)?.len();
        if covered < KEYBLOCK_HEADER_SIZE {
            return Err(bad);
        }
        // The data key must be covered by the signature
        let key_end = data_key
            .key_offset
            .checked_add(data_key.key_size)
            .ok_or(bad)?;
        if key_end > covered as u64 {
            return Err(bad);
        }

        if checksum.sig_size != HashAlgorithm::Sha512.output_size() as u64
            || checksum.data_size != signature.data_size
        {
            return Err(bad);
        }
        checksum.signature(raw).ok_or(bad)?;

        Ok(Self {
            raw,
            signature,
            checksum,
            flags,
            data_key,
        })
    }

    /// Key block size in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.raw.len()
    }

    /// Flags
    #[must_use]
    pub const fn flags(&self) -> u64 {
        self.flags
    }

    /// Declared data key version
    #[must_use]
    pub const fn declared_key_version(&self) -> u64 {
        self.data_key.key_version
    }

    fn covered(&self) -> VerifyResult<&'a [u8]> {
        self.signature
            .signed_data(self.raw)
            .ok_or(VerifyError::KeyBlockFormat)
    }

    /// Check the signature under `key`
    ///
    /// # Errors
    ///
    /// `BadSignature(KeyBlock)` on mismatch.
    pub fn verify_signature(&self, key: &PublicKey) -> VerifyResult<()> {
        let sig = self
            .signature
            .signature(self.raw)
            .ok_or(VerifyError::KeyBlockFormat)?;
        key.verify(self.covered()?, sig, VerifyStage::KeyBlock)
    }

    /// Check the SHA-512 checksum
    ///
    /// # Errors
    ///
    /// `KeyBlockChecksum` on mismatch.
    pub fn verify_checksum(&self) -> VerifyResult<()> {
        let expected = self
            .checksum
            .signature(self.raw)
            .ok_or(VerifyError::KeyBlockFormat)?;
        let digest = HashAlgorithm::Sha512
            .digest(self.covered()?)
            .ok_or(VerifyError::KeyBlockChecksum)?;
        if constant_time_eq(digest.as_ref(), expected) {
            Ok(())
        } else {
            Err(VerifyError::KeyBlockChecksum)
        }
    }

    /// Check the flags allow `mode`
    ///
    /// # Errors
    ///
    /// `FlagsMismatch` if not.
    pub const fn check_flags(&self, mode: BootMode) -> VerifyResult<()> {
        if flags_allow(self.flags, mode) {
            Ok(())
        } else {
            Err(VerifyError::FlagsMismatch)
        }
    }

    /// Parse the embedded data key
    ///
    /// # Errors
    ///
    /// As for [`PublicKey::from_descriptor`].
    pub fn data_key(&self) -> VerifyResult<PublicKey> {
        PublicKey::from_descriptor(self.raw, DATA_KEY_AT)
    }

    /// Packed data key bytes
    #[must_use]
    pub fn data_key_bytes(&self) -> Option<&'a [u8]> {
        member(self.raw, self.data_key.key_offset, self.data_key.key_size)
    }
}

/// Key block that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedKeyBlock {
    /// Key block size in bytes
    pub size: usize,
    /// Flags
    pub flags: u64,
    /// Data key for the preamble and body
    pub data_key: PublicKey,
}

/// Verify the key block at the start of `data`
///
/// Checks, in order: structure, signature under `trusted`, checksum, flags
/// against `mode`, data key structure, data key version against
/// `min_key_version`.
///
/// # Errors
///
/// The first failing check.
pub fn verify_key_block(
    data: &[u8],
    trusted: &PublicKey,
    mode: BootMode,
    min_key_version: u32,
) -> VerifyResult<VerifiedKeyBlock> {
    let block = KeyBlock::parse(data)?;
    block.verify_signature(trusted)?;
    block.verify_checksum()?;
    block.check_flags(mode)?;
    let data_key = block.data_key()?;
    if data_key.key_version() < min_key_version {
        return Err(VerifyError::KeyVersionRollback);
    }
    Ok(VerifiedKeyBlock {
        size: block.size(),
        flags: block.flags(),
        data_key,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags_per_mode() {
        let normal = flags::DEVELOPER_0 | flags::RECOVERY_0;
        assert!(flags_allow(normal, BootMode::Normal));
        assert!(!flags_allow(normal, BootMode::Developer));
        assert!(!flags_allow(normal, BootMode::Recovery));
        assert!(flags_allow(flags::ALL, BootMode::Recovery));
        assert!(flags_allow(
            flags::DEVELOPER_1 | flags::RECOVERY_1,
            BootMode::Recovery
        ));
    }

    #[test]
    fn test_parse_rejects_short_and_bad_magic() {
        assert_eq!(
            KeyBlock::parse(&[0u8; 16]).unwrap_err(),
            VerifyError::KeyBlockFormat
        );
        let mut raw = [0u8; KEYBLOCK_HEADER_SIZE];
        raw[..8].copy_from_slice(b"CHROMEOX");
        assert_eq!(
            KeyBlock::parse(&raw).unwrap_err(),
            VerifyError::KeyBlockFormat
        );
    }

    #[test]
    fn test_parse_rejects_oversized_block() {
        let mut raw = [0u8; KEYBLOCK_HEADER_SIZE];
        raw[..8].copy_from_slice(&KEYBLOCK_MAGIC);
        raw[8..12].copy_from_slice(&KEYBLOCK_VERSION_MAJOR.to_le_bytes());
        raw[12..16].copy_from_slice(&KEYBLOCK_VERSION_MINOR.to_le_bytes());
        raw[16..24].copy_from_slice(&u64::MAX.to_le_bytes());
        assert_eq!(
            KeyBlock::parse(&raw).unwrap_err(),
            VerifyError::KeyBlockFormat
        );
    }
}
