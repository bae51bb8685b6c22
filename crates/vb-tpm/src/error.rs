// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Security-module error types

use core::fmt;

use crate::session::SessionState;
use vb_hal::HalError;

/// Error type for security-module operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpmError {
    /// No response within the per-command timeout
    Timeout,
    /// Transport failed to deliver the command
    Transport,
    /// Response frame is malformed (tag, size or payload)
    MalformedResponse,
    /// Module answered with a non-success return code
    ReturnCode(u32),
    /// Command not valid in the current session state
    InvalidState(SessionState),
    /// Command parameters do not fit a frame
    BufferTooSmall,
    /// Module was enabled or activated; takes effect after a reboot
    RebootRequired,
}

impl TpmError {
    /// Get error code for logging/debugging
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::Timeout => 0x0411,
            Self::Transport => 0x0412,
            Self::MalformedResponse => 0x0413,
            Self::ReturnCode(_) => 0x0414,
            Self::InvalidState(_) => 0x0415,
            Self::BufferTooSmall => 0x0416,
            Self::RebootRequired => 0x0417,
        }
    }

    /// Get error description
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Timeout => "security module timeout",
            Self::Transport => "security module transport error",
            Self::MalformedResponse => "malformed security module response",
            Self::ReturnCode(_) => "security module command failed",
            Self::InvalidState(_) => "command invalid in session state",
            Self::BufferTooSmall => "command too large",
            Self::RebootRequired => "reboot required",
        }
    }

    /// Module return code, if this error carries one
    #[must_use]
    pub const fn return_code(&self) -> Option<u32> {
        match self {
            Self::ReturnCode(rc) => Some(*rc),
            _ => None,
        }
    }
}

impl fmt::Display for TpmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReturnCode(rc) => write!(
                f,
                "[0x{:04X}] {} (rc 0x{:X})",
                self.code(),
                self.description(),
                rc
            ),
            _ => write!(f, "[0x{:04X}] {}", self.code(), self.description()),
        }
    }
}

impl From<HalError> for TpmError {
    fn from(e: HalError) -> Self {
        match e {
            HalError::Timeout => Self::Timeout,
            HalError::BufferTooSmall => Self::MalformedResponse,
            _ => Self::Transport,
        }
    }
}

impl From<TpmError> for vb_common::Error {
    fn from(e: TpmError) -> Self {
        match e {
            TpmError::Timeout | TpmError::Transport | TpmError::ReturnCode(_) => {
                Self::ModuleUnavailable
            }
            TpmError::MalformedResponse => Self::ModuleCorrupt,
            TpmError::InvalidState(_) | TpmError::RebootRequired => Self::ModuleState,
            TpmError::BufferTooSmall => Self::BufferTooSmall,
        }
    }
}

/// Result type for security-module operations
pub type TpmResult<T> = Result<T, TpmError>;
