// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Kernel preamble
//!
//! ```text
//! Offset  Size  Field
//! 0x00    8     Preamble size
//! 0x08    24    Preamble signature descriptor
//! 0x20    4     Header version major (2)
//! 0x24    4     Header version minor
//! 0x28    8     Kernel version
//! 0x30    8     Body load address
//! 0x38    8     Bootloader address
//! 0x40    8     Bootloader size
//! 0x48    24    Body signature descriptor
//! ```
//!
//! The body signature descriptor's `data_size` is the body size.

use alloc::vec::Vec;

use vb_common::constants::{MAX_COMPONENT_VERSION, PREAMBLE_HEADER_SIZE, PREAMBLE_VERSION_MAJOR};

use super::common::{read_u32, read_u64, SignatureDescriptor, VerifyError, VerifyResult, VerifyStage};
use super::public_key::PublicKey;

pub(crate) const SIGNATURE_AT: usize = 0x08;
pub(crate) const BODY_SIGNATURE_AT: usize = 0x48;

/// Structurally valid, not yet verified preamble
#[derive(Debug, Clone, Copy)]
pub struct Preamble<'a> {
    raw: &'a [u8],
    signature: SignatureDescriptor,
    kernel_version: u32,
    body_load_address: u64,
    bootloader_address: u64,
    bootloader_size: u64,
    body_signature: SignatureDescriptor,
}

impl<'a> Preamble<'a> {
    /// Parse the preamble at the start of `data`
    ///
    /// # Errors
    ///
    /// `PreambleFormat` for a bad size or version, a kernel version above
    /// 0xFFFF, or any member outside the preamble.
    pub fn parse(data: &'a [u8]) -> VerifyResult<Self> {
        let bad = VerifyError::PreambleFormat;
        let size = read_u64(data, 0)
            .and_then(|s| usize::try_from(s).ok())
            .ok_or(bad)?;
        if size < PREAMBLE_HEADER_SIZE {
            return Err(bad);
        }
        let raw = data.get(..size).ok_or(bad)?;

        if read_u32(raw, 0x20).ok_or(bad)? != PREAMBLE_VERSION_MAJOR {
            return Err(bad);
        }
        let signature = SignatureDescriptor::parse(raw, SIGNATURE_AT).ok_or(bad)?;
        signature.signature(raw).ok_or(bad)?;
        if signature.signed_data(raw).ok_or(bad)?.len() < PREAMBLE_HEADER_SIZE {
            return Err(bad);
        }

        let kernel_version = read_u64(raw, 0x28)
            .and_then(|v| u32::try_from(v).ok())
            .filter(|&v| v <= MAX_COMPONENT_VERSION)
            .ok_or(bad)?;

        let body_signature = SignatureDescriptor::parse(raw, BODY_SIGNATURE_AT).ok_or(bad)?;
        body_signature.signature(raw).ok_or(bad)?;

        Ok(Self {
            raw,
            signature,
            kernel_version,
            body_load_address: read_u64(raw, 0x30).ok_or(bad)?,
            bootloader_address: read_u64(raw, 0x38).ok_or(bad)?,
            bootloader_size: read_u64(raw, 0x40).ok_or(bad)?,
            body_signature,
        })
    }

    /// Preamble size in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        self.raw.len()
    }

    /// Declared kernel version
    #[must_use]
    pub const fn kernel_version(&self) -> u32 {
        self.kernel_version
    }

    /// Declared body size
    #[must_use]
    pub const fn body_size(&self) -> u64 {
        self.body_signature.data_size
    }

    /// Check the signature under the data key
    ///
    /// # Errors
    ///
    /// `BadSignature(Preamble)` on mismatch.
    pub fn verify_signature(&self, data_key: &PublicKey) -> VerifyResult<()> {
        let bad = VerifyError::PreambleFormat;
        let sig = self.signature.signature(self.raw).ok_or(bad)?;
        let covered = self.signature.signed_data(self.raw).ok_or(bad)?;
        data_key.verify(covered, sig, VerifyStage::Preamble)
    }

    fn body_signature_bytes(&self) -> VerifyResult<&'a [u8]> {
        self.body_signature
            .signature(self.raw)
            .ok_or(VerifyError::PreambleFormat)
    }
}

/// Preamble that passed every check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedPreamble {
    /// Preamble size in bytes
    pub size: usize,
    /// Kernel version
    pub kernel_version: u32,
    /// Address the body is loaded to
    pub body_load_address: u64,
    /// Bootloader address inside the loaded body
    pub bootloader_address: u64,
    /// Bootloader size
    pub bootloader_size: u64,
    /// Body size in bytes
    pub body_size: u64,
    /// Signature over the body
    pub body_signature: Vec<u8>,
}

/// Verify the preamble at the start of `data`
///
/// `available` is the number of partition bytes from the start of the
/// preamble; the preamble and body must fit in it.
///
/// Checks, in order: structure, signature under `data_key`, body signature
/// size, kernel version against `min_kernel_version`, size.
///
/// # Errors
///
/// The first failing check.
pub fn verify_preamble(
    data: &[u8],
    data_key: &PublicKey,
    min_kernel_version: u32,
    available: u64,
) -> VerifyResult<VerifiedPreamble> {
    let preamble = Preamble::parse(data)?;
    preamble.verify_signature(data_key)?;

    let body_signature = preamble.body_signature_bytes()?;
    if body_signature.len() != data_key.algorithm().signature_size() {
        return Err(VerifyError::PreambleFormat);
    }

    if preamble.kernel_version() < min_kernel_version {
        return Err(VerifyError::KernelVersionRollback);
    }

    let needed = (preamble.size() as u64)
        .checked_add(preamble.body_size())
        .ok_or(VerifyError::SizeMismatch)?;
    if needed > available {
        return Err(VerifyError::SizeMismatch);
    }

    Ok(VerifiedPreamble {
        size: preamble.size(),
        kernel_version: preamble.kernel_version(),
        body_load_address: preamble.body_load_address,
        bootloader_address: preamble.bootloader_address,
        bootloader_size: preamble.bootloader_size,
        body_size: preamble.body_size(),
        body_signature: body_signature.to_vec(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(size: u64, version: u32) -> [u8; PREAMBLE_HEADER_SIZE] {
        let mut raw = [0u8; PREAMBLE_HEADER_SIZE];
        raw[0..8].copy_from_slice(&size.to_le_bytes());
        raw[0x20..0x24].copy_from_slice(&version.to_le_bytes());
        raw[0x18..0x20].copy_from_slice(&(PREAMBLE_HEADER_SIZE as u64).to_le_bytes());
        raw
    }

    #[test]
    fn test_minimal_header_parses() {
        let raw = header(PREAMBLE_HEADER_SIZE as u64, PREAMBLE_VERSION_MAJOR);
        let p = Preamble::parse(&raw).unwrap();
        assert_eq!(p.size(), PREAMBLE_HEADER_SIZE);
        assert_eq!(p.body_size(), 0);
    }

    #[test]
    fn test_wrong_version_rejected() {
        let raw = header(PREAMBLE_HEADER_SIZE as u64, 3);
        assert_eq!(Preamble::parse(&raw).unwrap_err(), VerifyError::PreambleFormat);
    }

    #[test]
    fn test_size_past_data_rejected() {
        let raw = header(PREAMBLE_HEADER_SIZE as u64 + 1, PREAMBLE_VERSION_MAJOR);
        assert_eq!(Preamble::parse(&raw).unwrap_err(), VerifyError::PreambleFormat);
    }

    #[test]
    fn test_kernel_version_range() {
        let mut raw = header(PREAMBLE_HEADER_SIZE as u64, PREAMBLE_VERSION_MAJOR);
        raw[0x28..0x30].copy_from_slice(&0x1_0000u64.to_le_bytes());
        assert_eq!(Preamble::parse(&raw).unwrap_err(), VerifyError::PreambleFormat);
    }
}
