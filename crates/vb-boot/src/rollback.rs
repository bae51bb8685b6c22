// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Rollback Protection
//!
//! Keeps the minimum acceptable kernel version in two security-module NV
//! spaces:
//!
//! - the kernel space holds the *stored* floor, raised by the selector after
//!   a confirmed boot and write-locked for the rest of each boot;
//! - the secure space holds the *secure* floor, written and locked by earlier
//!   firmware; the stored floor may never be set below it.
//!
//! Both spaces share one 13-byte layout:
//!
//! ```text
//! Offset  Size  Field
//! 0       1     Structure version (2)
//! 1       4     UID "GRWL" (LE)
//! 5       4     Combined kernel versions (LE)
//! 9       3     Reserved
//! 12      1     CRC-8 over bytes 0..12
//! ```
//!
//! A kernel space that does not exist yet is the first-boot bootstrap state:
//! versions read as 0 and the first write defines the space.

use core::fmt;

use vb_common::constants::{ROLLBACK_SPACE_SIZE, ROLLBACK_SPACE_UID, ROLLBACK_SPACE_VERSION};
use vb_common::crc::crc8;
use vb_common::{BootConfig, Error};
use vb_hal::TpmTransport;
use vb_tpm::command::{perm, rc};
use vb_tpm::{SessionState, TpmError, TpmSession};

use crate::vboot::VersionFloor;

// ============================================================================
// Errors
// ============================================================================

/// Rollback protection error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RollbackError {
    /// Security-module command failed
    Module(TpmError),
    /// Space contents fail their integrity checks
    Corrupt,
    /// Requested floor is below a current floor
    Violation,
    /// Kernel space is locked for this boot
    Locked,
}

impl RollbackError {
    /// Get error code for logging/debugging
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::Module(_) => 0x0141,
            Self::Corrupt => 0x0142,
            Self::Violation => 0x0143,
            Self::Locked => 0x0144,
        }
    }

    /// Get error description
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::Module(_) => "security module failure",
            Self::Corrupt => "rollback space corrupt",
            Self::Violation => "rollback violation",
            Self::Locked => "rollback space locked",
        }
    }
}

impl fmt::Display for RollbackError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Module(e) => write!(f, "[0x{:04X}] {}: {}", self.code(), self.description(), e),
            _ => write!(f, "[0x{:04X}] {}", self.code(), self.description()),
        }
    }
}

impl From<TpmError> for RollbackError {
    fn from(e: TpmError) -> Self {
        Self::Module(e)
    }
}

impl From<RollbackError> for Error {
    fn from(e: RollbackError) -> Self {
        match e {
            RollbackError::Module(inner) => inner.into(),
            RollbackError::Corrupt => Error::ModuleCorrupt,
            RollbackError::Violation => Error::RollbackViolation,
            RollbackError::Locked => Error::Locked,
        }
    }
}

/// Result type for rollback protection
pub type RollbackResult<T> = core::result::Result<T, RollbackError>;

// ============================================================================
// Space Layout
// ============================================================================

/// Encode a rollback space holding `kernel_versions`
#[must_use]
pub fn encode_space(kernel_versions: u32) -> [u8; ROLLBACK_SPACE_SIZE] {
    let mut out = [0u8; ROLLBACK_SPACE_SIZE];
    out[0] = ROLLBACK_SPACE_VERSION;
    out[1..5].copy_from_slice(&ROLLBACK_SPACE_UID.to_le_bytes());
    out[5..9].copy_from_slice(&kernel_versions.to_le_bytes());
    out[12] = crc8(&out[..12]);
    out
}

/// Decode a rollback space, returning its combined kernel versions
///
/// # Errors
///
/// `Corrupt` for a bad CRC, UID or structure version.
pub fn decode_space(raw: &[u8; ROLLBACK_SPACE_SIZE]) -> RollbackResult<u32> {
    if crc8(&raw[..12]) != raw[12] {
        return Err(RollbackError::Corrupt);
    }
    let mut uid = [0u8; 4];
    uid.copy_from_slice(&raw[1..5]);
    if raw[0] != ROLLBACK_SPACE_VERSION || u32::from_le_bytes(uid) != ROLLBACK_SPACE_UID {
        return Err(RollbackError::Corrupt);
    }
    let mut versions = [0u8; 4];
    versions.copy_from_slice(&raw[5..9]);
    Ok(u32::from_le_bytes(versions))
}

// ============================================================================
// State
// ============================================================================

/// Rollback floors read at boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RollbackState {
    /// Stored floor (kernel space)
    pub stored: u32,
    /// Secure floor (secure space)
    pub secure: u32,
    /// Kernel space locked for this boot
    pub locked: bool,
    /// Kernel space not defined yet
    pub bootstrap: bool,
}

impl RollbackState {
    /// Floor enforced by verification
    #[must_use]
    pub fn floor(&self) -> VersionFloor {
        VersionFloor::new(self.stored.max(self.secure))
    }
}

/// Rollback protection over a security-module session
pub struct RollbackProtection<T: TpmTransport> {
    session: TpmSession<T>,
    kernel_index: u32,
    secure_index: u32,
    state: Option<RollbackState>,
    locked: bool,
}

impl<T: TpmTransport> RollbackProtection<T> {
    /// Rollback protection using the NV indices of `config`
    pub const fn new(session: TpmSession<T>, config: &BootConfig) -> Self {
        Self {
            session,
            kernel_index: config.kernel_nv_index,
            secure_index: config.secure_nv_index,
            state: None,
            locked: false,
        }
    }

    /// Underlying session
    pub fn session_mut(&mut self) -> &mut TpmSession<T> {
        &mut self.session
    }

    /// Give back the session
    pub fn into_session(self) -> TpmSession<T> {
        self.session
    }

    /// Last state read or written
    #[must_use]
    pub const fn cached(&self) -> Option<RollbackState> {
        self.state
    }

    /// Whether the kernel space is locked for this boot
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    fn ensure_ready(&mut self) -> RollbackResult<()> {
        if self.session.state() != SessionState::Ready {
            self.session.init()?;
        }
        Ok(())
    }

    /// Read a space; `None` if it is not defined
    fn read_space(&mut self, index: u32) -> RollbackResult<Option<u32>> {
        let mut raw = [0u8; ROLLBACK_SPACE_SIZE];
        match self.session.nv_read(index, &mut raw) {
            Ok(()) => decode_space(&raw).map(Some),
            Err(e) if e.return_code() == Some(rc::BADINDEX) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Read both floors
    ///
    /// Initializes the session first if needed.
    ///
    /// # Errors
    ///
    /// `Module` for command failures (timeouts included), `Corrupt` for a
    /// space that fails its integrity checks.
    pub fn read(&mut self) -> RollbackResult<RollbackState> {
        self.ensure_ready()?;
        let kernel = self.read_space(self.kernel_index)?;
        let secure = self.read_space(self.secure_index)?.unwrap_or(0);
        let state = RollbackState {
            stored: kernel.unwrap_or(0),
            secure,
            locked: self.locked,
            bootstrap: kernel.is_none(),
        };
        self.state = Some(state);
        Ok(state)
    }

    fn current(&mut self) -> RollbackResult<RollbackState> {
        match self.state {
            Some(state) => Ok(state),
            None => self.read(),
        }
    }

    fn define_kernel_space(&mut self) -> RollbackResult<()> {
        self.session.assert_physical_presence()?;
        self.session
            .define_space(self.kernel_index, perm::WRITE_STCLEAR, ROLLBACK_SPACE_SIZE as u32)?;
        self.session.nv_write(self.kernel_index, &encode_space(0))?;
        if let Some(state) = self.state.as_mut() {
            state.bootstrap = false;
        }
        Ok(())
    }

    /// Set the stored floor to `new_version`
    ///
    /// Writing the current value again succeeds.
    ///
    /// # Errors
    ///
    /// - `Locked` after [`Self::lock_for_boot`]
    /// - `Violation` if `new_version` is below the secure or stored floor
    /// - `Module` / `Corrupt` as for [`Self::read`]
    pub fn write(&mut self, new_version: u32) -> RollbackResult<()> {
        if self.locked {
            return Err(RollbackError::Locked);
        }
        let state = self.current()?;
        if new_version < state.secure || new_version < state.stored {
            return Err(RollbackError::Violation);
        }
        if state.bootstrap {
            self.define_kernel_space()?;
        }
        match self
            .session
            .nv_write(self.kernel_index, &encode_space(new_version))
        {
            Ok(()) => {}
            Err(e) if e.return_code() == Some(rc::AREA_LOCKED) => {
                self.locked = true;
                return Err(RollbackError::Locked);
            }
            Err(e) => return Err(e.into()),
        }
        self.state = Some(RollbackState {
            stored: new_version,
            bootstrap: false,
            ..state
        });
        Ok(())
    }

    /// Write-lock the kernel space until the next boot
    ///
    /// Idempotent. Defines the space first on a bootstrap boot so the lock
    /// has something to hold.
    ///
    /// # Errors
    ///
    /// `Corrupt` if the space cannot be locked per boot; `Module` for command
    /// failures.
    pub fn lock_for_boot(&mut self) -> RollbackResult<()> {
        if self.locked {
            return Ok(());
        }
        self.ensure_ready()?;
        let info = match self.session.get_permissions(self.kernel_index) {
            Ok(info) => info,
            Err(e) if e.return_code() == Some(rc::BADINDEX) => {
                self.define_kernel_space()?;
                self.session.get_permissions(self.kernel_index)?
            }
            Err(e) => return Err(e.into()),
        };
        if !TpmSession::<T>::is_boot_lockable(&info) {
            return Err(RollbackError::Corrupt);
        }
        self.session.write_lock(self.kernel_index)?;
        self.locked = true;
        if let Some(state) = self.state.as_mut() {
            state.locked = true;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_space_layout() {
        let raw = encode_space(0x0002_0005);
        assert_eq!(raw[0], 2);
        assert_eq!(&raw[1..5], b"LWRG");
        assert_eq!(decode_space(&raw), Ok(0x0002_0005));
    }

    #[test]
    fn test_space_corruption() {
        let mut raw = encode_space(7);
        raw[6] ^= 1;
        assert_eq!(decode_space(&raw), Err(RollbackError::Corrupt));

        let mut raw = encode_space(7);
        raw[1] = b'X';
        raw[12] = crc8(&raw[..12]);
        assert_eq!(decode_space(&raw), Err(RollbackError::Corrupt));
    }

    #[test]
    fn test_floor_is_max() {
        let state = RollbackState {
            stored: 3,
            secure: 9,
            ..RollbackState::default()
        };
        assert_eq!(state.floor().combined, 9);
    }

    #[test]
    fn test_error_mapping() {
        assert_eq!(
            Error::from(RollbackError::Module(TpmError::Timeout)),
            Error::ModuleUnavailable
        );
        assert_eq!(Error::from(RollbackError::Corrupt), Error::ModuleCorrupt);
        assert_eq!(Error::from(RollbackError::Locked), Error::Locked);
    }
}
