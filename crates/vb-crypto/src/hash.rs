// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Hash function implementations
//!
//! SHA-256 and SHA-512 over the `sha2` crate, plus a runtime-selected
//! [`HashContext`] for structures whose digest algorithm is only known after
//! parsing their key.

use crate::traits::Hash;
use sha2::{Digest as _, Sha256 as Sha256Impl, Sha512 as Sha512Impl};

/// Largest digest produced by any supported algorithm
pub const MAX_DIGEST_SIZE: usize = 64;

/// Digest algorithms used by the boot structures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HashAlgorithm {
    /// SHA-1; recognized in algorithm ids but never accepted
    Sha1,
    /// SHA-256
    Sha256,
    /// SHA-512
    Sha512,
}

impl HashAlgorithm {
    /// Digest size in bytes
    #[must_use]
    pub const fn output_size(self) -> usize {
        match self {
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha512 => 64,
        }
    }

    /// Whether digests of this algorithm may be relied upon
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        !matches!(self, Self::Sha1)
    }

    /// One-shot digest, `None` for rejected algorithms
    #[must_use]
    pub fn digest(self, data: &[u8]) -> Option<DigestValue> {
        let mut ctx = HashContext::new(self)?;
        ctx.update(data);
        Some(ctx.finalize())
    }
}

/// Digest of runtime-selected length
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct DigestValue {
    bytes: [u8; MAX_DIGEST_SIZE],
    len: usize,
}

impl DigestValue {
    /// Build from a digest slice; longer input is truncated
    #[must_use]
    pub fn from_slice(data: &[u8]) -> Self {
        let len = data.len().min(MAX_DIGEST_SIZE);
        let mut bytes = [0u8; MAX_DIGEST_SIZE];
        bytes[..len].copy_from_slice(&data[..len]);
        Self { bytes, len }
    }
}

impl AsRef<[u8]> for DigestValue {
    fn as_ref(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl core::fmt::Debug for DigestValue {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for b in self.as_ref() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// Incremental hasher for a runtime-selected algorithm
#[derive(Clone)]
pub enum HashContext {
    /// SHA-256 state
    Sha256(Sha256),
    /// SHA-512 state
    Sha512(Sha512),
}

impl HashContext {
    /// Start a digest, `None` for rejected algorithms
    #[must_use]
    pub fn new(algorithm: HashAlgorithm) -> Option<Self> {
        match algorithm {
            HashAlgorithm::Sha1 => None,
            HashAlgorithm::Sha256 => Some(Self::Sha256(Sha256::new())),
            HashAlgorithm::Sha512 => Some(Self::Sha512(Sha512::new())),
        }
    }

    /// Algorithm of this context
    #[must_use]
    pub const fn algorithm(&self) -> HashAlgorithm {
        match self {
            Self::Sha256(_) => HashAlgorithm::Sha256,
            Self::Sha512(_) => HashAlgorithm::Sha512,
        }
    }

    /// Absorb data
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Self::Sha256(h) => h.update(data),
            Self::Sha512(h) => h.update(data),
        }
    }

    /// Finish the digest
    #[must_use]
    pub fn finalize(self) -> DigestValue {
        match self {
            Self::Sha256(h) => DigestValue::from_slice(h.finalize().as_ref()),
            Self::Sha512(h) => DigestValue::from_slice(h.finalize().as_ref()),
        }
    }
}

/// SHA-256 hash output
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sha256Output([u8; 32]);

impl Sha256Output {
    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Sha256Output {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// SHA-256 hasher
#[derive(Clone)]
pub struct Sha256 {
    inner: Sha256Impl,
}

impl Hash for Sha256 {
    const ALGORITHM: HashAlgorithm = HashAlgorithm::Sha256;
    const OUTPUT_SIZE: usize = 32;

    type Output = Sha256Output;

    fn hash(message: &[u8]) -> Self::Output {
        let result = Sha256Impl::digest(message);
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        Sha256Output(output)
    }

    fn new() -> Self {
        Self {
            inner: Sha256Impl::new(),
        }
    }

    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.inner, data);
    }

    fn finalize(self) -> Self::Output {
        let result = self.inner.finalize();
        let mut output = [0u8; 32];
        output.copy_from_slice(&result);
        Sha256Output(output)
    }

    fn reset(&mut self) {
        sha2::Digest::reset(&mut self.inner);
    }
}

impl Default for Sha256 {
    fn default() -> Self {
        Self::new()
    }
}

/// SHA-512 hash output
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Sha512Output([u8; 64]);

impl Sha512Output {
    /// Create from bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Sha512Output {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// SHA-512 hasher
#[derive(Clone)]
pub struct Sha512 {
    inner: Sha512Impl,
}

impl Hash for Sha512 {
    const ALGORITHM: HashAlgorithm = HashAlgorithm::Sha512;
    const OUTPUT_SIZE: usize = 64;

    type Output = Sha512Output;

    fn hash(message: &[u8]) -> Self::Output {
        let result = Sha512Impl::digest(message);
        let mut output = [0u8; 64];
        output.copy_from_slice(&result);
        Sha512Output(output)
    }

    fn new() -> Self {
        Self {
            inner: Sha512Impl::new(),
        }
    }

    fn update(&mut self, data: &[u8]) {
        sha2::Digest::update(&mut self.inner, data);
    }

    fn finalize(self) -> Self::Output {
        let result = self.inner.finalize();
        let mut output = [0u8; 64];
        output.copy_from_slice(&result);
        Sha512Output(output)
    }

    fn reset(&mut self) {
        sha2::Digest::reset(&mut self.inner);
    }
}

impl Default for Sha512 {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sha256_known_answer() {
        let hash = Sha256::hash(b"abc");
        assert_eq!(
            hash.as_ref()[..4],
            [0xba, 0x78, 0x16, 0xbf],
        );
    }

    #[test]
    fn test_sha512_incremental() {
        let one_shot = Sha512::hash(b"hello world");

        let mut hasher = Sha512::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        let incremental = hasher.finalize();

        assert_eq!(one_shot.as_ref(), incremental.as_ref());
    }

    #[test]
    fn test_context_matches_typed_hasher() {
        let digest = HashAlgorithm::Sha256.digest(b"abc").unwrap();
        assert_eq!(digest.as_ref(), Sha256::hash(b"abc").as_ref());
        let digest = HashAlgorithm::Sha512.digest(b"abc").unwrap();
        assert_eq!(digest.as_ref().len(), 64);
    }

    #[test]
    fn test_sha1_rejected() {
        assert!(HashAlgorithm::Sha1.digest(b"abc").is_none());
        assert!(!HashAlgorithm::Sha1.is_accepted());
    }
}
