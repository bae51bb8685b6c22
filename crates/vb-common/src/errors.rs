// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Error types for the verified boot core
//!
//! This module defines the unified error type used throughout the boot chain.
//! Every layer keeps its own precise error enum and converts into [`Error`]
//! at its boundary. The [`ErrorCategory`] of an error decides whether the
//! kernel selector moves on to the next candidate or aborts the whole boot.

use core::fmt;

/// Result type alias for verified boot operations
pub type Result<T> = core::result::Result<T, Error>;

/// Coarse classification of an error, used for propagation decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Malformed input: checksums, geometry, key or header format
    Structural,
    /// Signature or hash verification failure
    Cryptographic,
    /// Otherwise valid but stale image
    Rollback,
    /// Security module or storage failure; no floor can be established
    Infrastructure,
    /// Selection outcome (no candidate left)
    Selection,
    /// Everything else
    General,
}

impl ErrorCategory {
    /// Whether an error of this category must abort the boot attempt
    /// instead of moving on to the next candidate.
    #[must_use]
    pub const fn is_fatal_to_boot(self) -> bool {
        matches!(self, Self::Infrastructure)
    }
}

/// Unified error type for the verified boot core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Structural Errors (0x01xx)
    // =========================================================================
    /// Partition table header or entry array checksum mismatch
    BadTableChecksum,
    /// Partition geometry outside the device or conflicting entries
    BadTableGeometry,
    /// Public key blob is malformed or uses an unknown algorithm
    InvalidKeyFormat,
    /// Key block header is malformed
    InvalidKeyBlock,
    /// Preamble header is malformed
    InvalidPreamble,
    /// Declared body does not fit the partition or the provided data
    SizeMismatch,
    /// Key block flags do not permit the current boot mode
    KeyBlockFlagsMismatch,

    // =========================================================================
    // Cryptographic Errors (0x02xx)
    // =========================================================================
    /// Signature verification failed
    BadSignature,
    /// Body or key block digest mismatch
    HashMismatch,
    /// Algorithm is recognized but not accepted
    UnsupportedAlgorithm,

    // =========================================================================
    // Rollback Errors (0x03xx)
    // =========================================================================
    /// Key block version below the key floor
    KeyVersionRollback,
    /// Preamble kernel version below the kernel floor
    KernelVersionRollback,
    /// Attempt to set the stored floor below the secure floor
    RollbackViolation,
    /// Rollback space is write-locked for this boot
    Locked,

    // =========================================================================
    // Infrastructure Errors (0x04xx)
    // =========================================================================
    /// Security module did not respond or transport failed
    ModuleUnavailable,
    /// Security module returned malformed data or a corrupt space
    ModuleCorrupt,
    /// Security module command not valid in the current session state
    ModuleState,
    /// Block device read or write failed
    DeviceIo,
    /// Non-volatile record storage failed
    NvStorageFailed,

    // =========================================================================
    // Selection Errors (0x05xx)
    // =========================================================================
    /// No candidate passed verification
    NoValidKernel,

    // =========================================================================
    // General Errors (0xFFxx)
    // =========================================================================
    /// Buffer is too small for operation
    BufferTooSmall,
    /// Invalid parameter provided
    InvalidParameter,
    /// Internal error (should not occur)
    InternalError,
}

impl Error {
    /// Get the error code for this error
    ///
    /// Error codes are organized by category:
    /// - 0x01xx: Structural errors
    /// - 0x02xx: Cryptographic errors
    /// - 0x03xx: Rollback errors
    /// - 0x04xx: Infrastructure errors
    /// - 0x05xx: Selection errors
    /// - 0xFFxx: General errors
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::BadTableChecksum => 0x0101,
            Self::BadTableGeometry => 0x0102,
            Self::InvalidKeyFormat => 0x0103,
            Self::InvalidKeyBlock => 0x0104,
            Self::InvalidPreamble => 0x0105,
            Self::SizeMismatch => 0x0106,
            Self::KeyBlockFlagsMismatch => 0x0107,

            Self::BadSignature => 0x0201,
            Self::HashMismatch => 0x0202,
            Self::UnsupportedAlgorithm => 0x0203,

            Self::KeyVersionRollback => 0x0301,
            Self::KernelVersionRollback => 0x0302,
            Self::RollbackViolation => 0x0303,
            Self::Locked => 0x0304,

            Self::ModuleUnavailable => 0x0401,
            Self::ModuleCorrupt => 0x0402,
            Self::ModuleState => 0x0403,
            Self::DeviceIo => 0x0404,
            Self::NvStorageFailed => 0x0405,

            Self::NoValidKernel => 0x0501,

            Self::BufferTooSmall => 0xFF01,
            Self::InvalidParameter => 0xFF02,
            Self::InternalError => 0xFFFF,
        }
    }

    /// Category of this error, derived from the code prefix
    #[must_use]
    pub const fn category(&self) -> ErrorCategory {
        match self.code() >> 8 {
            0x01 => ErrorCategory::Structural,
            0x02 => ErrorCategory::Cryptographic,
            0x03 => ErrorCategory::Rollback,
            0x04 => ErrorCategory::Infrastructure,
            0x05 => ErrorCategory::Selection,
            _ => ErrorCategory::General,
        }
    }

    /// Get a short description of the error
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::BadTableChecksum => "partition table checksum mismatch",
            Self::BadTableGeometry => "partition table geometry invalid",
            Self::InvalidKeyFormat => "invalid public key format",
            Self::InvalidKeyBlock => "invalid key block",
            Self::InvalidPreamble => "invalid preamble",
            Self::SizeMismatch => "size mismatch",
            Self::KeyBlockFlagsMismatch => "key block flags mismatch",
            Self::BadSignature => "bad signature",
            Self::HashMismatch => "hash mismatch",
            Self::UnsupportedAlgorithm => "unsupported algorithm",
            Self::KeyVersionRollback => "key version rollback",
            Self::KernelVersionRollback => "kernel version rollback",
            Self::RollbackViolation => "rollback violation",
            Self::Locked => "rollback space locked",
            Self::ModuleUnavailable => "security module unavailable",
            Self::ModuleCorrupt => "security module corrupt",
            Self::ModuleState => "security module state",
            Self::DeviceIo => "device I/O error",
            Self::NvStorageFailed => "NV storage failed",
            Self::NoValidKernel => "no valid kernel",
            Self::BufferTooSmall => "buffer too small",
            Self::InvalidParameter => "invalid parameter",
            Self::InternalError => "internal error",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:04X}] {}", self.code(), self.description())
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Error {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "[0x{:04X}] {}", self.code(), self.description());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_infrastructure_is_fatal() {
        assert!(Error::ModuleUnavailable.category().is_fatal_to_boot());
        assert!(Error::ModuleCorrupt.category().is_fatal_to_boot());
        assert!(!Error::BadSignature.category().is_fatal_to_boot());
        assert!(!Error::KernelVersionRollback.category().is_fatal_to_boot());
        assert!(!Error::BadTableGeometry.category().is_fatal_to_boot());
    }

    #[test]
    fn test_categories() {
        assert_eq!(Error::SizeMismatch.category(), ErrorCategory::Structural);
        assert_eq!(Error::HashMismatch.category(), ErrorCategory::Cryptographic);
        assert_eq!(Error::KeyVersionRollback.category(), ErrorCategory::Rollback);
        assert_eq!(Error::NoValidKernel.category(), ErrorCategory::Selection);
        assert_eq!(Error::InternalError.category(), ErrorCategory::General);
    }
}
