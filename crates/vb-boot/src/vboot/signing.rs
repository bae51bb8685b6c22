// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Building signed structures for host tools and tests
//!
//! Produced layouts:
//!
//! ```text
//! key block: [header 112][packed data key][SHA-512 checksum][signature]
//! preamble:  [header 96][body signature][preamble signature]
//! ```
//!
//! Signatures and the checksum cover the header and the data that follows it
//! up to, but excluding, the checksum or signature bytes.

use alloc::vec::Vec;

use vb_common::constants::{
    KEYBLOCK_HEADER_SIZE, KEYBLOCK_MAGIC, KEYBLOCK_VERSION_MAJOR, KEYBLOCK_VERSION_MINOR,
    MAX_COMPONENT_VERSION, PREAMBLE_HEADER_SIZE, PREAMBLE_VERSION_MAJOR,
};
use vb_crypto::{HashAlgorithm, SigningKey};

use super::common::{SignatureDescriptor, VerifyError, VerifyResult};
use super::keyblock::{CHECKSUM_AT, DATA_KEY_AT, FLAGS_AT, SIGNATURE_AT as KEYBLOCK_SIGNATURE_AT};
use super::preamble::{BODY_SIGNATURE_AT, SIGNATURE_AT as PREAMBLE_SIGNATURE_AT};
use super::public_key::PublicKey;

/// Public key of `signer` with `key_version`
///
/// # Errors
///
/// `KeyFormat` if the key cannot be represented.
pub fn public_key_of(signer: &SigningKey, key_version: u32) -> VerifyResult<PublicKey> {
    let key = signer.verifying_key().map_err(|_| VerifyError::KeyFormat)?;
    PublicKey::new(key, key_version)
}

/// Standalone key blob for `signer` with `key_version`
///
/// # Errors
///
/// `KeyFormat` if the key cannot be represented.
pub fn public_key_blob(signer: &SigningKey, key_version: u32) -> VerifyResult<Vec<u8>> {
    public_key_of(signer, key_version)?.to_blob()
}

fn sign(signer: &SigningKey, data: &[u8]) -> VerifyResult<Vec<u8>> {
    signer.sign(data).map_err(|_| VerifyError::SigningFailed)
}

/// Key block builder
#[derive(Debug, Clone)]
pub struct KeyBlockBuilder {
    data_key: PublicKey,
    flags: u64,
}

impl KeyBlockBuilder {
    /// Key block carrying `data_key`
    #[must_use]
    pub const fn new(data_key: PublicKey, flags: u64) -> Self {
        Self { data_key, flags }
    }

    /// Sign with `signer`
    ///
    /// # Errors
    ///
    /// `KeyFormat` if the data key cannot be packed, `SigningFailed` if
    /// signing fails.
    pub fn sign(&self, signer: &SigningKey) -> VerifyResult<Vec<u8>> {
        let packed = self.data_key.packed()?;
        let checksum_size = HashAlgorithm::Sha512.output_size();
        let sig_size = signer.algorithm().signature_size();

        let data_size = KEYBLOCK_HEADER_SIZE + packed.len();
        let checksum_offset = data_size;
        let sig_offset = checksum_offset + checksum_size;
        let total = sig_offset + sig_size;

        let mut out = Vec::with_capacity(total);
        out.resize(KEYBLOCK_HEADER_SIZE, 0);
        out[..8].copy_from_slice(&KEYBLOCK_MAGIC);
        out[0x08..0x0C].copy_from_slice(&KEYBLOCK_VERSION_MAJOR.to_le_bytes());
        out[0x0C..0x10].copy_from_slice(&KEYBLOCK_VERSION_MINOR.to_le_bytes());
        out[0x10..0x18].copy_from_slice(&(total as u64).to_le_bytes());
        put(
            &mut out,
            KEYBLOCK_SIGNATURE_AT,
            &SignatureDescriptor {
                sig_offset: sig_offset as u64,
                sig_size: sig_size as u64,
                data_size: data_size as u64,
            }
            .encode(),
        );
        put(
            &mut out,
            CHECKSUM_AT,
            &SignatureDescriptor {
                sig_offset: checksum_offset as u64,
                sig_size: checksum_size as u64,
                data_size: data_size as u64,
            }
            .encode(),
        );
        out[FLAGS_AT..FLAGS_AT + 8].copy_from_slice(&self.flags.to_le_bytes());
        put(
            &mut out,
            DATA_KEY_AT,
            &self.data_key.descriptor(KEYBLOCK_HEADER_SIZE as u64).encode(),
        );
        out.extend_from_slice(&packed);

        let checksum = HashAlgorithm::Sha512
            .digest(&out)
            .ok_or(VerifyError::SigningFailed)?;
        let signature = sign(signer, &out)?;
        out.extend_from_slice(checksum.as_ref());
        out.extend_from_slice(&signature);
        Ok(out)
    }
}

/// Preamble builder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PreambleBuilder {
    /// Kernel version
    pub kernel_version: u32,
    /// Body load address
    pub body_load_address: u64,
    /// Bootloader address
    pub bootloader_address: u64,
    /// Bootloader size
    pub bootloader_size: u64,
}

impl PreambleBuilder {
    /// Preamble for `kernel_version` with zero addresses
    #[must_use]
    pub const fn new(kernel_version: u32) -> Self {
        Self {
            kernel_version,
            body_load_address: 0,
            bootloader_address: 0,
            bootloader_size: 0,
        }
    }

    /// Set the body load address
    #[must_use]
    pub const fn with_load_address(mut self, address: u64) -> Self {
        self.body_load_address = address;
        self
    }

    /// Set the bootloader location
    #[must_use]
    pub const fn with_bootloader(mut self, address: u64, size: u64) -> Self {
        self.bootloader_address = address;
        self.bootloader_size = size;
        self
    }

    /// Sign a preamble for `body` with the data key `signer`
    ///
    /// # Errors
    ///
    /// `PreambleFormat` for a kernel version above 0xFFFF, `SigningFailed` if
    /// signing fails.
    pub fn sign(&self, body: &[u8], signer: &SigningKey) -> VerifyResult<Vec<u8>> {
        if self.kernel_version > MAX_COMPONENT_VERSION {
            return Err(VerifyError::PreambleFormat);
        }
        let body_signature = sign(signer, body)?;
        let sig_size = signer.algorithm().signature_size();

        let data_size = PREAMBLE_HEADER_SIZE + body_signature.len();
        let total = data_size + sig_size;

        let mut out = Vec::with_capacity(total);
        out.resize(PREAMBLE_HEADER_SIZE, 0);
        out[0..8].copy_from_slice(&(total as u64).to_le_bytes());
        put(
            &mut out,
            PREAMBLE_SIGNATURE_AT,
            &SignatureDescriptor {
                sig_offset: data_size as u64,
                sig_size: sig_size as u64,
                data_size: data_size as u64,
            }
            .encode(),
        );
        out[0x20..0x24].copy_from_slice(&PREAMBLE_VERSION_MAJOR.to_le_bytes());
        out[0x28..0x30].copy_from_slice(&u64::from(self.kernel_version).to_le_bytes());
        out[0x30..0x38].copy_from_slice(&self.body_load_address.to_le_bytes());
        out[0x38..0x40].copy_from_slice(&self.bootloader_address.to_le_bytes());
        out[0x40..0x48].copy_from_slice(&self.bootloader_size.to_le_bytes());
        put(
            &mut out,
            BODY_SIGNATURE_AT,
            &SignatureDescriptor {
                sig_offset: PREAMBLE_HEADER_SIZE as u64,
                sig_size: body_signature.len() as u64,
                data_size: body.len() as u64,
            }
            .encode(),
        );
        out.extend_from_slice(&body_signature);

        let signature = sign(signer, &out)?;
        out.extend_from_slice(&signature);
        Ok(out)
    }
}

fn put(out: &mut [u8], at: usize, bytes: &[u8]) {
    out[at..at + bytes.len()].copy_from_slice(bytes);
}

/// Concatenate the parts of a kernel partition
#[must_use]
pub fn build_kernel_partition(keyblock: &[u8], preamble: &[u8], body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(keyblock.len() + preamble.len() + body.len());
    out.extend_from_slice(keyblock);
    out.extend_from_slice(preamble);
    out.extend_from_slice(body);
    out
}
