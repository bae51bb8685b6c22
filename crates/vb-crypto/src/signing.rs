// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! RSA signing for host tools and tests

use alloc::string::String;
use alloc::vec::Vec;

use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::{Pkcs1v15Sign, RsaPrivateKey};
use sha2::{Sha256, Sha512};

use crate::error::{CryptoError, CryptoResult};
use crate::hash::HashAlgorithm;
use crate::signature::{SignatureAlgorithm, VerifyingKey};

/// RSA private key bound to a signature algorithm
#[derive(Clone)]
pub struct SigningKey {
    algorithm: SignatureAlgorithm,
    inner: RsaPrivateKey,
}

impl SigningKey {
    /// Generate a fresh key with the thread RNG
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedAlgorithm` for SHA-1 algorithms and `RngFailure`
    /// if generation fails.
    pub fn generate(algorithm: SignatureAlgorithm) -> CryptoResult<Self> {
        Self::generate_with_rng(algorithm, &mut rand::thread_rng())
    }

    /// Generate a fresh key with a caller-supplied RNG
    ///
    /// # Errors
    ///
    /// Returns `UnsupportedAlgorithm` for SHA-1 algorithms and `RngFailure`
    /// if generation fails.
    pub fn generate_with_rng<R>(algorithm: SignatureAlgorithm, rng: &mut R) -> CryptoResult<Self>
    where
        R: rand::CryptoRng + rand::RngCore,
    {
        if !algorithm.is_accepted() {
            return Err(CryptoError::UnsupportedAlgorithm);
        }
        let inner = RsaPrivateKey::new(rng, algorithm.key_bits())
            .map_err(|_| CryptoError::RngFailure)?;
        Ok(Self { algorithm, inner })
    }

    /// Load a PKCS#8 or PKCS#1 PEM private key
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if the PEM cannot be decoded or its size does not
    /// match `algorithm`.
    pub fn from_pem(algorithm: SignatureAlgorithm, pem: &str) -> CryptoResult<Self> {
        let inner = RsaPrivateKey::from_pkcs8_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(pem))
            .map_err(|_| CryptoError::InvalidKey)?;
        let key = Self { algorithm, inner };
        // Rejects size and exponent mismatches.
        key.verifying_key()?;
        Ok(key)
    }

    /// Encode as PKCS#8 PEM
    ///
    /// # Errors
    ///
    /// Returns `InternalError` if encoding fails.
    pub fn to_pem(&self) -> CryptoResult<String> {
        self.inner
            .to_pkcs8_pem(LineEnding::LF)
            .map(|pem| String::from(pem.as_str()))
            .map_err(|_| CryptoError::InternalError)
    }

    /// Signature algorithm
    #[must_use]
    pub const fn algorithm(&self) -> SignatureAlgorithm {
        self.algorithm
    }

    /// Matching verification key
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if the key does not fit the algorithm.
    pub fn verifying_key(&self) -> CryptoResult<VerifyingKey> {
        VerifyingKey::from_public_key(self.algorithm, self.inner.to_public_key())
    }

    /// Public key in packed form
    ///
    /// # Errors
    ///
    /// Returns `InvalidKey` if the key does not fit the algorithm.
    pub fn packed_public_key(&self) -> CryptoResult<Vec<u8>> {
        self.verifying_key()?.to_packed()
    }

    /// Sign `data`, returning a signature of exactly
    /// `algorithm.signature_size()` bytes
    ///
    /// # Errors
    ///
    /// Returns `SigningFailed` if the RSA operation fails.
    pub fn sign(&self, data: &[u8]) -> CryptoResult<Vec<u8>> {
        let digest = self.algorithm.digest(data)?;
        let scheme = match self.algorithm.hash() {
            HashAlgorithm::Sha256 => Pkcs1v15Sign::new::<Sha256>(),
            HashAlgorithm::Sha512 => Pkcs1v15Sign::new::<Sha512>(),
            HashAlgorithm::Sha1 => return Err(CryptoError::UnsupportedAlgorithm),
        };
        self.inner
            .sign(scheme, digest.as_ref())
            .map_err(|_| CryptoError::SigningFailed)
    }
}

impl core::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SigningKey")
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}
