// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Cryptographic error types

use core::fmt;

/// Error type for cryptographic operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CryptoError {
    /// Invalid key format or size
    InvalidKey,
    /// Signature verification failed
    InvalidSignature,
    /// Digest comparison failed
    DigestMismatch,
    /// Signing operation failed
    SigningFailed,
    /// Random number generator failure
    RngFailure,
    /// Buffer is too small for the operation
    BufferTooSmall,
    /// Algorithm recognized but not supported
    UnsupportedAlgorithm,
    /// Algorithm identifier not recognized
    UnknownAlgorithm,
    /// Internal error (should not occur)
    InternalError,
}

impl CryptoError {
    /// Get error code for logging/debugging
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::InvalidKey => 0x0201,
            Self::InvalidSignature => 0x0202,
            Self::DigestMismatch => 0x0203,
            Self::SigningFailed => 0x0204,
            Self::RngFailure => 0x0205,
            Self::BufferTooSmall => 0x0206,
            Self::UnsupportedAlgorithm => 0x0207,
            Self::UnknownAlgorithm => 0x0208,
            Self::InternalError => 0x02FF,
        }
    }

    /// Get error description
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::InvalidKey => "invalid key",
            Self::InvalidSignature => "invalid signature",
            Self::DigestMismatch => "digest mismatch",
            Self::SigningFailed => "signing operation failed",
            Self::RngFailure => "RNG failure",
            Self::BufferTooSmall => "buffer too small",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::UnknownAlgorithm => "unknown algorithm",
            Self::InternalError => "internal error",
        }
    }
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:04X}] {}", self.code(), self.description())
    }
}

impl From<CryptoError> for vb_common::Error {
    fn from(e: CryptoError) -> Self {
        match e {
            CryptoError::InvalidKey | CryptoError::UnknownAlgorithm => Self::InvalidKeyFormat,
            CryptoError::InvalidSignature => Self::BadSignature,
            CryptoError::DigestMismatch => Self::HashMismatch,
            CryptoError::UnsupportedAlgorithm => Self::UnsupportedAlgorithm,
            CryptoError::BufferTooSmall => Self::BufferTooSmall,
            CryptoError::SigningFailed | CryptoError::RngFailure | CryptoError::InternalError => {
                Self::InternalError
            }
        }
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
