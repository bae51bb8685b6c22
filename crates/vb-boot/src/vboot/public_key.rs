// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Public keys
//!
//! A key is referenced by a 32-byte descriptor
//! (`key_offset, key_size, algorithm, key_version`) whose offset points at the
//! packed key data inside the containing structure. A standalone key blob is a
//! descriptor followed by its key data.

use alloc::vec::Vec;

use vb_common::constants::{MAX_COMPONENT_VERSION, PUBLIC_KEY_DESCRIPTOR_SIZE};
use vb_crypto::{CryptoError, SignatureAlgorithm, VerifyingKey};

use super::common::{member, read_u64, VerifyError, VerifyResult, VerifyStage};

/// Raw public key descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublicKeyDescriptor {
    /// Offset of the packed key data
    pub key_offset: u64,
    /// Size of the packed key data
    pub key_size: u64,
    /// Algorithm id
    pub algorithm: u64,
    /// Key version
    pub key_version: u64,
}

impl PublicKeyDescriptor {
    /// Parse the descriptor at `at`
    #[must_use]
    pub fn parse(data: &[u8], at: usize) -> Option<Self> {
        Some(Self {
            key_offset: read_u64(data, at)?,
            key_size: read_u64(data, at.checked_add(8)?)?,
            algorithm: read_u64(data, at.checked_add(16)?)?,
            key_version: read_u64(data, at.checked_add(24)?)?,
        })
    }

    /// Encode into 32 bytes
    #[must_use]
    pub fn encode(&self) -> [u8; PUBLIC_KEY_DESCRIPTOR_SIZE] {
        let mut out = [0u8; PUBLIC_KEY_DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&self.key_offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.key_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.algorithm.to_le_bytes());
        out[24..32].copy_from_slice(&self.key_version.to_le_bytes());
        out
    }
}

/// Validated public key with its version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicKey {
    key: VerifyingKey,
    key_version: u32,
}

impl PublicKey {
    /// Wrap a verifying key
    ///
    /// # Errors
    ///
    /// `KeyFormat` if the version does not fit in 16 bits.
    pub fn new(key: VerifyingKey, key_version: u32) -> VerifyResult<Self> {
        if key_version > MAX_COMPONENT_VERSION {
            return Err(VerifyError::KeyFormat);
        }
        Ok(Self { key, key_version })
    }

    /// Parse and validate the key described at `at` inside `parent`
    ///
    /// # Errors
    ///
    /// - `KeyFormat` for an unknown algorithm, a key that does not fit its
    ///   parent, a size that does not match the algorithm, or an
    ///   inconsistent packed key
    /// - `UnsupportedAlgorithm` for SHA-1 algorithms
    pub fn from_descriptor(parent: &[u8], at: usize) -> VerifyResult<Self> {
        let desc = PublicKeyDescriptor::parse(parent, at).ok_or(VerifyError::KeyFormat)?;
        let algorithm =
            SignatureAlgorithm::from_id(desc.algorithm).map_err(|_| VerifyError::KeyFormat)?;
        if !algorithm.is_accepted() {
            return Err(VerifyError::UnsupportedAlgorithm);
        }
        if desc.key_size != algorithm.packed_key_size() as u64 {
            return Err(VerifyError::KeyFormat);
        }
        let data =
            member(parent, desc.key_offset, desc.key_size).ok_or(VerifyError::KeyFormat)?;
        let key = VerifyingKey::from_packed(algorithm, data).map_err(|e| match e {
            CryptoError::UnsupportedAlgorithm => VerifyError::UnsupportedAlgorithm,
            _ => VerifyError::KeyFormat,
        })?;
        let key_version = u32::try_from(desc.key_version).map_err(|_| VerifyError::KeyFormat)?;
        Self::new(key, key_version)
    }

    /// Parse a standalone key blob (descriptor at offset 0)
    ///
    /// # Errors
    ///
    /// As for [`Self::from_descriptor`].
    pub fn from_blob(blob: &[u8]) -> VerifyResult<Self> {
        Self::from_descriptor(blob, 0)
    }

    /// Signature algorithm
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.key.algorithm()
    }

    /// Key version
    #[must_use]
    pub const fn key_version(&self) -> u32 {
        self.key_version
    }

    /// Underlying verifying key
    #[must_use]
    pub const fn verifying_key(&self) -> &VerifyingKey {
        &self.key
    }

    /// Verify `signature` over `data`, reporting failures against `stage`
    ///
    /// # Errors
    ///
    /// `BadSignature(stage)` on any mismatch.
    pub fn verify(&self, data: &[u8], signature: &[u8], stage: VerifyStage) -> VerifyResult<()> {
        self.key
            .verify(data, signature)
            .map_err(|_| VerifyError::BadSignature(stage))
    }

    /// Packed key data
    ///
    /// # Errors
    ///
    /// `KeyFormat` if the key cannot be packed.
    pub fn packed(&self) -> VerifyResult<Vec<u8>> {
        self.key.to_packed().map_err(|_| VerifyError::KeyFormat)
    }

    /// Descriptor for this key with its data at `key_offset`
    #[must_use]
    pub fn descriptor(&self, key_offset: u64) -> PublicKeyDescriptor {
        PublicKeyDescriptor {
            key_offset,
            key_size: self.algorithm().packed_key_size() as u64,
            algorithm: self.algorithm().id(),
            key_version: u64::from(self.key_version),
        }
    }

    /// Standalone key blob: descriptor followed by the packed key
    ///
    /// # Errors
    ///
    /// `KeyFormat` if the key cannot be packed.
    pub fn to_blob(&self) -> VerifyResult<Vec<u8>> {
        let packed = self.packed()?;
        let mut out = Vec::with_capacity(PUBLIC_KEY_DESCRIPTOR_SIZE + packed.len());
        out.extend_from_slice(&self.descriptor(PUBLIC_KEY_DESCRIPTOR_SIZE as u64).encode());
        out.extend_from_slice(&packed);
        Ok(out)
    }
}
