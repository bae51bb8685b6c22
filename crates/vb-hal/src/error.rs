// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! HAL error types

use core::fmt;

/// HAL error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HalError {
    /// Device not present or not initialized
    NotInitialized,
    /// Block read failed
    ReadFailed,
    /// Block write failed
    WriteFailed,
    /// Access beyond the end of the device
    OutOfBounds,
    /// Buffer length is not a whole number of sectors
    Misaligned,
    /// NV record storage failed
    NvStorageError,
    /// Transport did not answer within the timeout
    Timeout,
    /// Transport-level I/O failure
    TransportError,
    /// Response did not fit the caller's buffer
    BufferTooSmall,
    /// Invalid parameter
    InvalidParameter,
}

impl HalError {
    /// Get error code
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::NotInitialized => 0x0801,
            Self::ReadFailed => 0x0810,
            Self::WriteFailed => 0x0811,
            Self::OutOfBounds => 0x0812,
            Self::Misaligned => 0x0813,
            Self::NvStorageError => 0x0820,
            Self::Timeout => 0x0830,
            Self::TransportError => 0x0831,
            Self::BufferTooSmall => 0x08F0,
            Self::InvalidParameter => 0x08F1,
        }
    }

    /// Get error description
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::NotInitialized => "not initialized",
            Self::ReadFailed => "block read failed",
            Self::WriteFailed => "block write failed",
            Self::OutOfBounds => "access out of bounds",
            Self::Misaligned => "buffer not sector aligned",
            Self::NvStorageError => "NV storage error",
            Self::Timeout => "transport timeout",
            Self::TransportError => "transport error",
            Self::BufferTooSmall => "buffer too small",
            Self::InvalidParameter => "invalid parameter",
        }
    }
}

impl fmt::Display for HalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:04X}] {}", self.code(), self.description())
    }
}

impl From<HalError> for vb_common::Error {
    fn from(e: HalError) -> Self {
        match e {
            HalError::NotInitialized
            | HalError::ReadFailed
            | HalError::WriteFailed
            | HalError::OutOfBounds
            | HalError::Misaligned => Self::DeviceIo,
            HalError::NvStorageError => Self::NvStorageFailed,
            HalError::Timeout | HalError::TransportError => Self::ModuleUnavailable,
            HalError::BufferTooSmall => Self::BufferTooSmall,
            HalError::InvalidParameter => Self::InvalidParameter,
        }
    }
}

/// HAL Result type
pub type HalResult<T> = Result<T, HalError>;
