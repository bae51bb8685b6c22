// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! RSA PKCS#1 v1.5 signature verification
//!
//! Public keys travel in the firmware's packed form, all little-endian:
//!
//! ```text
//! arrsize  u32            modulus length in 32-bit words
//! n0inv    u32            -1 / n mod 2^32
//! modulus  [u32; arrsize]  least significant word first
//! rr       [u32; arrsize]  R^2 mod n, R = 2^(32 * arrsize)
//! ```
//!
//! The precomputed values are checked against the modulus when a key is
//! unpacked, so a key that parses is internally consistent. The public
//! exponent is fixed at 65537.

use alloc::vec::Vec;

use rsa::traits::PublicKeyParts;
use rsa::{BigUint, Pkcs1v15Sign, RsaPublicKey};
use sha2::{Sha256, Sha512};

use crate::error::{CryptoError, CryptoResult};
use crate::hash::{DigestValue, HashAlgorithm};
use vb_common::constants::RSA_PUBLIC_EXPONENT;

/// Largest supported modulus in bits
pub const MAX_RSA_BITS: usize = 8192;

/// Signature algorithm, numbered as stored in key descriptors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SignatureAlgorithm {
    /// RSA-1024 with SHA-1 (not accepted)
    Rsa1024Sha1 = 0,
    /// RSA-1024 with SHA-256
    Rsa1024Sha256 = 1,
    /// RSA-1024 with SHA-512
    Rsa1024Sha512 = 2,
    /// RSA-2048 with SHA-1 (not accepted)
    Rsa2048Sha1 = 3,
    /// RSA-2048 with SHA-256
    Rsa2048Sha256 = 4,
    /// RSA-2048 with SHA-512
    Rsa2048Sha512 = 5,
    /// RSA-4096 with SHA-1 (not accepted)
    Rsa4096Sha1 = 6,
    /// RSA-4096 with SHA-256
    Rsa4096Sha256 = 7,
    /// RSA-4096 with SHA-512
    Rsa4096Sha512 = 8,
    /// RSA-8192 with SHA-1 (not accepted)
    Rsa8192Sha1 = 9,
    /// RSA-8192 with SHA-256
    Rsa8192Sha256 = 10,
    /// RSA-8192 with SHA-512
    Rsa8192Sha512 = 11,
}

impl SignatureAlgorithm {
    /// Every algorithm id, in numeric order
    pub const ALL: [Self; 12] = [
        Self::Rsa1024Sha1,
        Self::Rsa1024Sha256,
        Self::Rsa1024Sha512,
        Self::Rsa2048Sha1,
        Self::Rsa2048Sha256,
        Self::Rsa2048Sha512,
        Self::Rsa4096Sha1,
        Self::Rsa4096Sha256,
        Self::Rsa4096Sha512,
        Self::Rsa8192Sha1,
        Self::Rsa8192Sha256,
        Self::Rsa8192Sha512,
    ];

    /// Look up an algorithm id
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::UnknownAlgorithm` for ids outside the table.
    pub fn from_id(id: u64) -> CryptoResult<Self> {
        usize::try_from(id)
            .ok()
            .and_then(|i| Self::ALL.get(i).copied())
            .ok_or(CryptoError::UnknownAlgorithm)
    }

    /// Numeric id
    #[must_use]
    pub const fn id(self) -> u64 {
        self as u64
    }

    /// Modulus size in bits
    #[must_use]
    pub const fn key_bits(self) -> usize {
        match (self as u8) / 3 {
            0 => 1024,
            1 => 2048,
            2 => 4096,
            _ => 8192,
        }
    }

    /// Signature size in bytes
    #[must_use]
    pub const fn signature_size(self) -> usize {
        self.key_bits() / 8
    }

    /// Packed key size in bytes
    #[must_use]
    pub const fn packed_key_size(self) -> usize {
        8 + 2 * self.signature_size()
    }

    /// Digest algorithm
    #[must_use]
    pub const fn hash(self) -> HashAlgorithm {
        match (self as u8) % 3 {
            0 => HashAlgorithm::Sha1,
            1 => HashAlgorithm::Sha256,
            _ => HashAlgorithm::Sha512,
        }
    }

    /// Whether signatures of this algorithm are accepted
    #[must_use]
    pub const fn is_accepted(self) -> bool {
        self.hash().is_accepted()
    }

    /// Algorithm for a key size and digest
    #[must_use]
    pub fn for_params(key_bits: usize, hash: HashAlgorithm) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|a| a.key_bits() == key_bits && a.hash() == hash)
    }

    /// Digest `data` with this algorithm's hash
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::UnsupportedAlgorithm` for SHA-1 algorithms.
    pub fn digest(self, data: &[u8]) -> CryptoResult<DigestValue> {
        self.hash()
            .digest(data)
            .ok_or(CryptoError::UnsupportedAlgorithm)
    }
}

/// Validated RSA verification key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyingKey {
    algorithm: SignatureAlgorithm,
    key: RsaPublicKey,
}

impl VerifyingKey {
    /// Unpack and validate a packed key for `algorithm`
    ///
    /// # Errors
    ///
    /// - `UnsupportedAlgorithm` for SHA-1 algorithms
    /// - `InvalidKey` if the length, modulus size, `n0inv` or `rr` do not
    ///   match
    pub fn from_packed(algorithm: SignatureAlgorithm, data: &[u8]) -> CryptoResult<Self> {
        if !algorithm.is_accepted() {
            return Err(CryptoError::UnsupportedAlgorithm);
        }
        if data.len() != algorithm.packed_key_size() {
            return Err(CryptoError::InvalidKey);
        }

        let arrsize = read_u32(data, 0)? as usize;
        let words = algorithm.key_bits() / 32;
        if arrsize != words {
            return Err(CryptoError::InvalidKey);
        }
        let n0inv = read_u32(data, 4)?;

        let n_bytes = words * 4;
        let modulus = &data[8..8 + n_bytes];
        let rr = &data[8 + n_bytes..8 + 2 * n_bytes];

        // Words are little-endian and stored least significant first, so the
        // whole array is one little-endian integer.
        let n = BigUint::from_bytes_le(modulus);
        if n.bits() != algorithm.key_bits() {
            return Err(CryptoError::InvalidKey);
        }
        if n0inv != compute_n0inv(read_u32(modulus, 0)?)? {
            return Err(CryptoError::InvalidKey);
        }
        if BigUint::from_bytes_le(rr) != compute_rr(&n, words) {
            return Err(CryptoError::InvalidKey);
        }

        let key = RsaPublicKey::new_with_max_size(
            n,
            BigUint::from(RSA_PUBLIC_EXPONENT),
            MAX_RSA_BITS,
        )
        .map_err(|_| CryptoError::InvalidKey)?;

        Ok(Self { algorithm, key })
    }

    /// Wrap an existing key
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if the modulus size or exponent does not fit
    /// `algorithm`.
    pub fn from_public_key(algorithm: SignatureAlgorithm, key: RsaPublicKey) -> CryptoResult<Self> {
        if !algorithm.is_accepted() {
            return Err(CryptoError::UnsupportedAlgorithm);
        }
        if key.n().bits() != algorithm.key_bits()
            || *key.e() != BigUint::from(RSA_PUBLIC_EXPONENT)
        {
            return Err(CryptoError::InvalidKey);
        }
        Ok(Self { algorithm, key })
    }

    /// Algorithm of this key
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Underlying public key
    #[must_use]
    pub const fn public_key(&self) -> &RsaPublicKey {
        &self.key
    }

    /// Serialize into the packed form
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if the modulus is even.
    pub fn to_packed(&self) -> CryptoResult<Vec<u8>> {
        pack_public_key(self.algorithm, &self.key)
    }

    /// Verify `signature` over `data`
    ///
    /// # Errors
    ///
    /// Returns `InvalidSignature` on any mismatch, including a signature of
    /// the wrong length.
    pub fn verify(&self, data: &[u8], signature: &[u8]) -> CryptoResult<()> {
        let digest = self.algorithm.digest(data)?;
        self.verify_digest(digest.as_ref(), signature)
    }

    /// Verify `signature` over a precomputed digest
    ///
    /// # Errors
    ///
    /// Returns `InvalidSignature` on any mismatch.
    pub fn verify_digest(&self, digest: &[u8], signature: &[u8]) -> CryptoResult<()> {
        if signature.len() != self.algorithm.signature_size()
            || digest.len() != self.algorithm.hash().output_size()
        {
            return Err(CryptoError::InvalidSignature);
        }
        let scheme = match self.algorithm.hash() {
            HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
            HashAlgorithm::Sha1 => return Err(CryptoError::UnsupportedAlgorithm),
        };
        self.key
            .verify(scheme, digest, signature)
            .map_err(|_| CryptoError::InvalidSignature)
    }
}

/// Pack an RSA public key for `algorithm`
///
/// # Errors
///
/// Returns `InvalidKey` if the key does not match the algorithm or the
/// modulus is even.
pub fn pack_public_key(algorithm: SignatureAlgorithm, key: &RsaPublicKey) -> CryptoResult<Vec<u8>> {
    let words = algorithm.key_bits() / 32;
    let n_bytes = words * 4;
    if key.n().bits() != algorithm.key_bits() {
        return Err(CryptoError::InvalidKey);
    }

    let modulus = le_padded(key.n(), n_bytes)?;
    let n0inv = compute_n0inv(read_u32(&modulus, 0)?)?;
    let rr = le_padded(&compute_rr(key.n(), words), n_bytes)?;

    let mut out = Vec::with_capacity(algorithm.packed_key_size());
    out.extend_from_slice(&u32::try_from(words).map_err(|_| CryptoError::InvalidKey)?.to_le_bytes());
    out.extend_from_slice(&n0inv.to_le_bytes());
    out.extend_from_slice(&modulus);
    out.extend_from_slice(&rr);
    Ok(out)
}

/// -1 / n0 mod 2^32 for odd `n0`
fn compute_n0inv(n0: u32) -> CryptoResult<u32> {
    if n0 & 1 == 0 {
        return Err(CryptoError::InvalidKey);
    }
    // Newton iteration doubles the number of correct low bits each round.
    let mut inv: u32 = n0;
    for _ in 0..5 {
        inv = inv.wrapping_mul(2u32.wrapping_sub(n0.wrapping_mul(inv)));
    }
    Ok(inv.wrapping_neg())
}

/// R^2 mod n for R = 2^(32 * words)
fn compute_rr(n: &BigUint, words: usize) -> BigUint {
    (BigUint::from(1u32) << (64 * words)) % n
}

fn le_padded(value: &BigUint, len: usize) -> CryptoResult<Vec<u8>> {
    let mut bytes = value.to_bytes_le();
    if bytes.len() > len {
        return Err(CryptoError::InvalidKey);
    }
    bytes.resize(len, 0);
    Ok(bytes)
}

fn read_u32(data: &[u8], offset: usize) -> CryptoResult<u32> {
    data.get(offset..offset + 4)
        .and_then(|b| b.try_into().ok())
        .map(u32::from_le_bytes)
        .ok_or(CryptoError::InvalidKey)
}
