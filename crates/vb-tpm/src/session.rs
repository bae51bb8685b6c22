// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Security-module session
//!
//! The module is driven through a fixed sequence before it may be used:
//!
//! ```text
//! Uninitialized --startup--> Started --self-test--> SelfTested --ready--> Ready
//! ```
//!
//! NV space and PCR commands are accepted only in `Ready`. Administrative
//! commands (physical presence, enable, deactivate, force-clear, flag reads)
//! are accepted in `SelfTested` and `Ready`. Anything else is refused locally
//! with [`TpmError::InvalidState`] before a frame is sent.
//!
//! Each command is a single request followed by a bounded wait for its
//! response. A timeout is reported, never retried here.

use heapless::Vec;

use crate::command::{
    ordinal, perm, presence, rc, Command, Frame, Reader, Response, AUTH_SIZE, CAP_FLAG,
    CAP_FLAG_PERMANENT, CAP_NV_INDEX, PCR_DIGEST_SIZE, STARTUP_CLEAR, TAG_PERMANENT_FLAGS,
};
use crate::error::{TpmError, TpmResult};
use vb_common::constants::TPM_MAX_FRAME;
use vb_hal::TpmTransport;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No command sent yet
    Uninitialized,
    /// Startup accepted
    Started,
    /// Self-test completed
    SelfTested,
    /// Enabled and activated; NV commands allowed
    Ready,
}

/// Permanent flags reported by the module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PermanentFlags {
    /// Module is disabled
    pub disable: bool,
    /// An owner may be installed
    pub ownership: bool,
    /// Module is deactivated
    pub deactivated: bool,
    /// NV access control is enforced
    pub nv_locked: bool,
}

/// Public description of an NV space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceInfo {
    /// NV index
    pub index: u32,
    /// Permission bits
    pub permissions: u32,
    /// Data size in bytes
    pub size: u32,
}

/// Decoded reply: return code and payload copy
struct Reply {
    return_code: u32,
    data: Frame,
}

impl Reply {
    fn success(&self) -> TpmResult<Reader<'_>> {
        if self.return_code == rc::SUCCESS {
            Ok(Reader::new(&self.data))
        } else {
            Err(TpmError::ReturnCode(self.return_code))
        }
    }
}

/// Stateful client of the security module
pub struct TpmSession<T: TpmTransport> {
    transport: T,
    state: SessionState,
    timeout_ms: u32,
}

impl<T: TpmTransport> TpmSession<T> {
    /// Create a session over `transport`
    pub const fn new(transport: T, timeout_ms: u32) -> Self {
        Self {
            transport,
            state: SessionState::Uninitialized,
            timeout_ms,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Per-command timeout
    #[must_use]
    pub const fn timeout_ms(&self) -> u32 {
        self.timeout_ms
    }

    /// Access the transport
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    /// Consume the session and return the transport
    pub fn into_transport(self) -> T {
        self.transport
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    fn require(&self, allowed: &[SessionState]) -> TpmResult<()> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(TpmError::InvalidState(self.state))
        }
    }

    fn require_admin(&self) -> TpmResult<()> {
        self.require(&[SessionState::SelfTested, SessionState::Ready])
    }

    fn require_ready(&self) -> TpmResult<()> {
        self.require(&[SessionState::Ready])
    }

    fn exchange(&mut self, request: &[u8]) -> TpmResult<Reply> {
        let mut buffer = [0u8; TPM_MAX_FRAME];
        let len = self
            .transport
            .transmit(request, &mut buffer, self.timeout_ms)?;
        let frame = buffer.get(..len).ok_or(TpmError::MalformedResponse)?;
        let response = Response::parse(frame)?;
        let mut data = Vec::new();
        data.extend_from_slice(response.data())
            .map_err(|_| TpmError::MalformedResponse)?;
        Ok(Reply {
            return_code: response.return_code(),
            data,
        })
    }

    fn simple(&mut self, command: Command) -> TpmResult<()> {
        let frame = command.finish();
        self.exchange(&frame)?.success().map(|_| ())
    }

    // ========================================================================
    // Setup
    // ========================================================================

    /// Send TPM_Startup(CLEAR)
    ///
    /// A module already started by earlier firmware answers
    /// `INVALID_POSTINIT`, which counts as success.
    ///
    /// # Errors
    ///
    /// `InvalidState` unless the session is uninitialized; transport and
    /// return-code errors otherwise.
    pub fn startup(&mut self) -> TpmResult<()> {
        self.require(&[SessionState::Uninitialized])?;
        let frame = Command::new(ordinal::STARTUP).u16(STARTUP_CLEAR)?.finish();
        let reply = self.exchange(&frame)?;
        match reply.return_code {
            rc::SUCCESS | rc::INVALID_POSTINIT => {
                self.state = SessionState::Started;
                Ok(())
            }
            code => Err(TpmError::ReturnCode(code)),
        }
    }

    /// Run the full self-test
    ///
    /// # Errors
    ///
    /// `InvalidState` before startup; transport and return-code errors
    /// otherwise.
    pub fn self_test_full(&mut self) -> TpmResult<()> {
        self.require(&[
            SessionState::Started,
            SessionState::SelfTested,
            SessionState::Ready,
        ])?;
        self.simple(Command::new(ordinal::SELF_TEST_FULL))?;
        if self.state == SessionState::Started {
            self.state = SessionState::SelfTested;
        }
        Ok(())
    }

    /// Complete a self-test started by earlier firmware
    ///
    /// # Errors
    ///
    /// `InvalidState` before startup; transport and return-code errors
    /// otherwise.
    pub fn continue_self_test(&mut self) -> TpmResult<()> {
        self.require(&[
            SessionState::Started,
            SessionState::SelfTested,
            SessionState::Ready,
        ])?;
        self.simple(Command::new(ordinal::CONTINUE_SELF_TEST))?;
        if self.state == SessionState::Started {
            self.state = SessionState::SelfTested;
        }
        Ok(())
    }

    /// Check the module is enabled and activated, then enter `Ready`
    ///
    /// A disabled or deactivated module is enabled and activated under
    /// physical presence; that only takes effect after a reboot, so
    /// `RebootRequired` is returned and the session stays `SelfTested`.
    ///
    /// # Errors
    ///
    /// `RebootRequired` as above; transport and return-code errors otherwise.
    pub fn enter_ready(&mut self) -> TpmResult<()> {
        self.require_admin()?;
        let flags = self.get_flags()?;
        if flags.disable || flags.deactivated {
            self.assert_physical_presence()?;
            self.physical_enable()?;
            self.set_deactivated(false)?;
            return Err(TpmError::RebootRequired);
        }
        self.state = SessionState::Ready;
        Ok(())
    }

    /// Startup, self-test and ready check in one call
    ///
    /// # Errors
    ///
    /// Any error of the individual steps.
    pub fn init(&mut self) -> TpmResult<()> {
        if self.state == SessionState::Uninitialized {
            self.startup()?;
        }
        if self.state == SessionState::Started {
            self.self_test_full()?;
        }
        if self.state == SessionState::SelfTested {
            self.enter_ready()?;
        }
        Ok(())
    }

    // ========================================================================
    // Administrative Commands
    // ========================================================================

    /// Read the permanent flags
    ///
    /// # Errors
    ///
    /// `MalformedResponse` if the structure is short or mistagged.
    pub fn get_flags(&mut self) -> TpmResult<PermanentFlags> {
        self.require_admin()?;
        let frame = Command::new(ordinal::GET_CAPABILITY)
            .u32(CAP_FLAG)?
            .u32(4)?
            .u32(CAP_FLAG_PERMANENT)?
            .finish();
        let reply = self.exchange(&frame)?;
        let mut r = reply.success()?;
        let size = r.u32()? as usize;
        if size < 6 || r.remaining() < size {
            return Err(TpmError::MalformedResponse);
        }
        if r.u16()? != TAG_PERMANENT_FLAGS {
            return Err(TpmError::MalformedResponse);
        }
        Ok(PermanentFlags {
            disable: r.u8()? != 0,
            ownership: r.u8()? != 0,
            deactivated: r.u8()? != 0,
            nv_locked: r.u8()? != 0,
        })
    }

    fn physical_presence(&mut self, bits: u16) -> TpmResult<()> {
        self.require_admin()?;
        self.simple(Command::new(ordinal::PHYSICAL_PRESENCE).u16(bits)?)
    }

    /// Enable the presence command and assert physical presence
    ///
    /// # Errors
    ///
    /// Transport and return-code errors.
    pub fn assert_physical_presence(&mut self) -> TpmResult<()> {
        self.physical_presence(presence::CMD_ENABLE)?;
        self.physical_presence(presence::PRESENT)
    }

    /// Lock physical presence until the next startup
    ///
    /// # Errors
    ///
    /// Transport and return-code errors.
    pub fn lock_physical_presence(&mut self) -> TpmResult<()> {
        self.physical_presence(presence::LOCK)
    }

    /// Enable the module (requires physical presence)
    ///
    /// # Errors
    ///
    /// Transport and return-code errors.
    pub fn physical_enable(&mut self) -> TpmResult<()> {
        self.require_admin()?;
        self.simple(Command::new(ordinal::PHYSICAL_ENABLE))
    }

    /// Set or clear the deactivated flag (requires physical presence)
    ///
    /// # Errors
    ///
    /// Transport and return-code errors.
    pub fn set_deactivated(&mut self, deactivated: bool) -> TpmResult<()> {
        self.require_admin()?;
        self.simple(Command::new(ordinal::PHYSICAL_SET_DEACTIVATED).u8(u8::from(deactivated))?)
    }

    /// Clear the owner (requires physical presence)
    ///
    /// # Errors
    ///
    /// Transport and return-code errors.
    pub fn force_clear(&mut self) -> TpmResult<()> {
        self.require_admin()?;
        self.simple(Command::new(ordinal::FORCE_CLEAR))
    }

    // ========================================================================
    // NV Spaces
    // ========================================================================

    /// Define an NV space
    ///
    /// # Errors
    ///
    /// `InvalidState` unless ready; return-code errors such as
    /// `BAD_PRESENCE` otherwise.
    pub fn define_space(&mut self, index: u32, permissions: u32, size: u32) -> TpmResult<()> {
        self.require_ready()?;
        self.simple(
            Command::new(ordinal::NV_DEFINE_SPACE)
                .u32(index)?
                .u32(permissions)?
                .u32(size)?
                .bytes(&[0u8; AUTH_SIZE])?,
        )
    }

    /// Read exactly `buffer.len()` bytes from the start of a space
    ///
    /// # Errors
    ///
    /// `ReturnCode(BADINDEX)` for an undefined space; `MalformedResponse` if
    /// the module returns a different length.
    pub fn nv_read(&mut self, index: u32, buffer: &mut [u8]) -> TpmResult<()> {
        self.require_ready()?;
        let len = u32::try_from(buffer.len()).map_err(|_| TpmError::BufferTooSmall)?;
        let frame = Command::new(ordinal::NV_READ_VALUE)
            .u32(index)?
            .u32(0)?
            .u32(len)?
            .finish();
        let reply = self.exchange(&frame)?;
        let mut r = reply.success()?;
        let size = r.u32()? as usize;
        if size != buffer.len() {
            return Err(TpmError::MalformedResponse);
        }
        buffer.copy_from_slice(r.bytes(size)?);
        Ok(())
    }

    /// Write `data` at the start of a space
    ///
    /// # Errors
    ///
    /// `ReturnCode(AREA_LOCKED)` once the space is write-locked.
    pub fn nv_write(&mut self, index: u32, data: &[u8]) -> TpmResult<()> {
        self.require_ready()?;
        let len = u32::try_from(data.len()).map_err(|_| TpmError::BufferTooSmall)?;
        self.simple(
            Command::new(ordinal::NV_WRITE_VALUE)
                .u32(index)?
                .u32(0)?
                .u32(len)?
                .bytes(data)?,
        )
    }

    /// Write-lock a space (zero-length write)
    ///
    /// # Errors
    ///
    /// Transport and return-code errors.
    pub fn write_lock(&mut self, index: u32) -> TpmResult<()> {
        self.nv_write(index, &[])
    }

    /// Read-lock a space (zero-length read)
    ///
    /// # Errors
    ///
    /// Transport and return-code errors.
    pub fn read_lock(&mut self, index: u32) -> TpmResult<()> {
        self.nv_read(index, &mut [])
    }

    /// Public description of a space
    ///
    /// # Errors
    ///
    /// `ReturnCode(BADINDEX)` for an undefined space.
    pub fn get_permissions(&mut self, index: u32) -> TpmResult<SpaceInfo> {
        self.require_ready()?;
        let frame = Command::new(ordinal::GET_CAPABILITY)
            .u32(CAP_NV_INDEX)?
            .u32(4)?
            .u32(index)?
            .finish();
        let reply = self.exchange(&frame)?;
        let mut r = reply.success()?;
        let size = r.u32()? as usize;
        if size < 12 || r.remaining() < size {
            return Err(TpmError::MalformedResponse);
        }
        let info = SpaceInfo {
            index: r.u32()?,
            permissions: r.u32()?,
            size: r.u32()?,
        };
        if info.index != index {
            return Err(TpmError::MalformedResponse);
        }
        Ok(info)
    }

    /// Whether a space's permissions allow per-boot write locking
    #[must_use]
    pub const fn is_boot_lockable(info: &SpaceInfo) -> bool {
        info.permissions & (perm::WRITE_STCLEAR | perm::WRITEDEFINE) != 0
    }

    // ========================================================================
    // Measurement
    // ========================================================================

    /// Extend a PCR, returning its new value
    ///
    /// # Errors
    ///
    /// Transport and return-code errors.
    pub fn extend(
        &mut self,
        pcr: u32,
        digest: &[u8; PCR_DIGEST_SIZE],
    ) -> TpmResult<[u8; PCR_DIGEST_SIZE]> {
        self.require_ready()?;
        let frame = Command::new(ordinal::EXTEND)
            .u32(pcr)?
            .bytes(digest)?
            .finish();
        let reply = self.exchange(&frame)?;
        let mut r = reply.success()?;
        let mut out = [0u8; PCR_DIGEST_SIZE];
        out.copy_from_slice(r.bytes(PCR_DIGEST_SIZE)?);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vb_hal::{HalError, HalResult};

    /// Transport that answers every command with a fixed return code
    struct Fixed(u32);

    impl TpmTransport for Fixed {
        fn transmit(&mut self, _request: &[u8], response: &mut [u8], _timeout_ms: u32) -> HalResult<usize> {
            let frame = crate::command::build_response(self.0, &[]);
            response[..frame.len()].copy_from_slice(&frame);
            Ok(frame.len())
        }
    }

    struct Dead;

    impl TpmTransport for Dead {
        fn transmit(&mut self, _request: &[u8], _response: &mut [u8], _timeout_ms: u32) -> HalResult<usize> {
            Err(HalError::Timeout)
        }
    }

    #[test]
    fn test_nv_refused_before_ready() {
        let mut session = TpmSession::new(Fixed(rc::SUCCESS), 10);
        let mut buf = [0u8; 4];
        assert_eq!(
            session.nv_read(0x1008, &mut buf),
            Err(TpmError::InvalidState(SessionState::Uninitialized))
        );
        session.startup().unwrap();
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(
            session.force_clear(),
            Err(TpmError::InvalidState(SessionState::Started))
        );
    }

    #[test]
    fn test_postinit_is_success() {
        let mut session = TpmSession::new(Fixed(rc::INVALID_POSTINIT), 10);
        session.startup().unwrap();
        assert_eq!(session.state(), SessionState::Started);
        assert_eq!(
            session.startup(),
            Err(TpmError::InvalidState(SessionState::Started))
        );
    }

    #[test]
    fn test_timeout_reported() {
        let mut session = TpmSession::new(Dead, 10);
        assert_eq!(session.startup(), Err(TpmError::Timeout));
        assert_eq!(session.state(), SessionState::Uninitialized);
    }
}
