// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Shared pieces of the verification structures: error type, little-endian
//! field readers and the signature descriptor.

use core::fmt;

use vb_common::constants::SIGNATURE_DESCRIPTOR_SIZE;
use vb_common::Error;

// ============================================================================
// Errors
// ============================================================================

/// Pipeline stage, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyStage {
    /// Public key structure
    PublicKey,
    /// Key block
    KeyBlock,
    /// Kernel preamble
    Preamble,
    /// Kernel body
    Body,
}

impl VerifyStage {
    /// Stage name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PublicKey => "public key",
            Self::KeyBlock => "key block",
            Self::Preamble => "preamble",
            Self::Body => "body",
        }
    }
}

impl fmt::Display for VerifyStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    /// Public key blob malformed or algorithm unknown
    KeyFormat,
    /// Algorithm recognized but not accepted
    UnsupportedAlgorithm,
    /// Key block header or members malformed
    KeyBlockFormat,
    /// Preamble header or members malformed
    PreambleFormat,
    /// Signature did not verify
    BadSignature(VerifyStage),
    /// Key block SHA-512 checksum mismatch
    KeyBlockChecksum,
    /// Key block flags do not allow the boot mode
    FlagsMismatch,
    /// Data key version below the floor
    KeyVersionRollback,
    /// Kernel version below the floor
    KernelVersionRollback,
    /// Body does not fit the partition or the supplied data
    SizeMismatch,
    /// Body digest does not match the preamble
    BodyHashMismatch,
    /// Building a structure failed
    SigningFailed,
}

impl VerifyError {
    /// Stage that failed
    #[must_use]
    pub const fn stage(&self) -> VerifyStage {
        match self {
            Self::KeyFormat | Self::UnsupportedAlgorithm => VerifyStage::PublicKey,
            Self::KeyBlockFormat
            | Self::KeyBlockChecksum
            | Self::FlagsMismatch
            | Self::KeyVersionRollback
            | Self::SigningFailed => VerifyStage::KeyBlock,
            Self::PreambleFormat | Self::KernelVersionRollback | Self::SizeMismatch => {
                VerifyStage::Preamble
            }
            Self::BadSignature(stage) => *stage,
            Self::BodyHashMismatch => VerifyStage::Body,
        }
    }

    /// Get error code for logging/debugging
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::KeyFormat => 0x0131,
            Self::UnsupportedAlgorithm => 0x0132,
            Self::KeyBlockFormat => 0x0133,
            Self::PreambleFormat => 0x0134,
            Self::BadSignature(_) => 0x0135,
            Self::KeyBlockChecksum => 0x0136,
            Self::FlagsMismatch => 0x0137,
            Self::KeyVersionRollback => 0x0138,
            Self::KernelVersionRollback => 0x0139,
            Self::SizeMismatch => 0x013A,
            Self::BodyHashMismatch => 0x013B,
            Self::SigningFailed => 0x013C,
        }
    }

    /// Get error description
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::KeyFormat => "malformed public key",
            Self::UnsupportedAlgorithm => "algorithm not accepted",
            Self::KeyBlockFormat => "malformed key block",
            Self::PreambleFormat => "malformed preamble",
            Self::BadSignature(_) => "signature mismatch",
            Self::KeyBlockChecksum => "key block checksum mismatch",
            Self::FlagsMismatch => "key block flags do not allow boot mode",
            Self::KeyVersionRollback => "key version below floor",
            Self::KernelVersionRollback => "kernel version below floor",
            Self::SizeMismatch => "body size mismatch",
            Self::BodyHashMismatch => "body digest mismatch",
            Self::SigningFailed => "signing failed",
        }
    }
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[0x{:04X}] {}: {}",
            self.code(),
            self.stage(),
            self.description()
        )
    }
}

impl From<VerifyError> for Error {
    fn from(e: VerifyError) -> Self {
        match e {
            VerifyError::KeyFormat => Error::InvalidKeyFormat,
            VerifyError::UnsupportedAlgorithm => Error::UnsupportedAlgorithm,
            VerifyError::KeyBlockFormat => Error::InvalidKeyBlock,
            VerifyError::PreambleFormat => Error::InvalidPreamble,
            VerifyError::BadSignature(_) => Error::BadSignature,
            VerifyError::KeyBlockChecksum | VerifyError::BodyHashMismatch => Error::HashMismatch,
            VerifyError::FlagsMismatch => Error::KeyBlockFlagsMismatch,
            VerifyError::KeyVersionRollback => Error::KeyVersionRollback,
            VerifyError::KernelVersionRollback => Error::KernelVersionRollback,
            VerifyError::SizeMismatch => Error::SizeMismatch,
            VerifyError::SigningFailed => Error::InternalError,
        }
    }
}

/// Result type for verification
pub type VerifyResult<T> = core::result::Result<T, VerifyError>;

// ============================================================================
// Field Access
// ============================================================================

/// Little-endian u32 at `offset`, if in bounds
#[must_use]
pub fn read_u32(data: &[u8], offset: usize) -> Option<u32> {
    let bytes = data.get(offset..offset.checked_add(4)?)?;
    let mut out = [0u8; 4];
    out.copy_from_slice(bytes);
    Some(u32::from_le_bytes(out))
}

/// Little-endian u64 at `offset`, if in bounds
#[must_use]
pub fn read_u64(data: &[u8], offset: usize) -> Option<u64> {
    let bytes = data.get(offset..offset.checked_add(8)?)?;
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    Some(u64::from_le_bytes(out))
}

/// The `size` bytes at `offset` inside `parent`, if they fit
#[must_use]
pub fn member(parent: &[u8], offset: u64, size: u64) -> Option<&[u8]> {
    let start = usize::try_from(offset).ok()?;
    let len = usize::try_from(size).ok()?;
    parent.get(start..start.checked_add(len)?)
}

// ============================================================================
// Signature Descriptor
// ============================================================================

/// Location of a signature and the length of the data it covers
///
/// Offsets are relative to the start of the containing structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SignatureDescriptor {
    /// Offset of the signature bytes
    pub sig_offset: u64,
    /// Size of the signature bytes
    pub sig_size: u64,
    /// Number of bytes covered, from the start of the containing structure
    pub data_size: u64,
}

impl SignatureDescriptor {
    /// Parse the descriptor at `at`
    #[must_use]
    pub fn parse(data: &[u8], at: usize) -> Option<Self> {
        Some(Self {
            sig_offset: read_u64(data, at)?,
            sig_size: read_u64(data, at.checked_add(8)?)?,
            data_size: read_u64(data, at.checked_add(16)?)?,
        })
    }

    /// Encode into 24 bytes
    #[must_use]
    pub fn encode(&self) -> [u8; SIGNATURE_DESCRIPTOR_SIZE] {
        let mut out = [0u8; SIGNATURE_DESCRIPTOR_SIZE];
        out[0..8].copy_from_slice(&self.sig_offset.to_le_bytes());
        out[8..16].copy_from_slice(&self.sig_size.to_le_bytes());
        out[16..24].copy_from_slice(&self.data_size.to_le_bytes());
        out
    }

    /// Signature bytes inside `parent`, if they fit
    #[must_use]
    pub fn signature<'a>(&self, parent: &'a [u8]) -> Option<&'a [u8]> {
        member(parent, self.sig_offset, self.sig_size)
    }

    /// Covered bytes of `parent`, if they fit
    #[must_use]
    pub fn signed_data<'a>(&self, parent: &'a [u8]) -> Option<&'a [u8]> {
        member(parent, 0, self.data_size)
    }
}
