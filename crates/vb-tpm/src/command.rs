// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Command and response framing
//!
//! Every exchange is one request frame and one response frame, all fields
//! big-endian:
//!
//! ```text
//! request:  tag u16 (0x00C1) | size u32 | ordinal u32     | params
//! response: tag u16 (0x00C4) | size u32 | return code u32 | data
//! ```
//!
//! `size` counts the whole frame including the 10-byte header.

use heapless::Vec;

use crate::error::{TpmError, TpmResult};
use vb_common::constants::TPM_MAX_FRAME;

// ============================================================================
// Tags and Ordinals
// ============================================================================

/// Request tag (no authorization)
pub const TAG_RQU_COMMAND: u16 = 0x00C1;

/// Response tag (no authorization)
pub const TAG_RSP_COMMAND: u16 = 0x00C4;

/// Frame header size in bytes
pub const HEADER_SIZE: usize = 10;

/// Command ordinals
pub mod ordinal {
    /// TPM_Startup
    pub const STARTUP: u32 = 0x99;
    /// TPM_SelfTestFull
    pub const SELF_TEST_FULL: u32 = 0x50;
    /// TPM_ContinueSelfTest
    pub const CONTINUE_SELF_TEST: u32 = 0x53;
    /// TPM_NV_DefineSpace
    pub const NV_DEFINE_SPACE: u32 = 0xCC;
    /// TPM_NV_WriteValue
    pub const NV_WRITE_VALUE: u32 = 0xCD;
    /// TPM_NV_ReadValue
    pub const NV_READ_VALUE: u32 = 0xCF;
    /// TPM_GetCapability
    pub const GET_CAPABILITY: u32 = 0x65;
    /// TPM_Extend
    pub const EXTEND: u32 = 0x14;
    /// TSC_PhysicalPresence
    pub const PHYSICAL_PRESENCE: u32 = 0x4000_000A;
    /// TPM_PhysicalEnable
    pub const PHYSICAL_ENABLE: u32 = 0x6F;
    /// TPM_PhysicalSetDeactivated
    pub const PHYSICAL_SET_DEACTIVATED: u32 = 0x72;
    /// TPM_ForceClear
    pub const FORCE_CLEAR: u32 = 0x5D;
}

/// Return codes the core interprets
pub mod rc {
    /// Success
    pub const SUCCESS: u32 = 0x00;
    /// NV index not defined
    pub const BADINDEX: u32 = 0x02;
    /// Bad parameter
    pub const BAD_PARAMETER: u32 = 0x03;
    /// Module is deactivated
    pub const DEACTIVATED: u32 = 0x06;
    /// Module is disabled
    pub const DISABLED: u32 = 0x07;
    /// Generic failure
    pub const FAIL: u32 = 0x09;
    /// No room for a new space
    pub const NOSPACE: u32 = 0x11;
    /// Startup already performed by earlier firmware
    pub const INVALID_POSTINIT: u32 = 0x26;
    /// Physical presence not asserted
    pub const BAD_PRESENCE: u32 = 0x2D;
    /// Space is locked
    pub const AREA_LOCKED: u32 = 0x3C;
    /// Module requires a self-test first
    pub const NEEDS_SELFTEST: u32 = 0x801;
}

/// TPM_Startup type
pub const STARTUP_CLEAR: u16 = 0x0001;

/// GetCapability: NV index area
pub const CAP_NV_INDEX: u32 = 0x11;

/// GetCapability: flag area
pub const CAP_FLAG: u32 = 0x04;

/// GetCapability sub-capability: permanent flags
pub const CAP_FLAG_PERMANENT: u32 = 0x108;

/// Permanent flags structure tag
pub const TAG_PERMANENT_FLAGS: u16 = 0x001F;

/// Physical presence command bits
pub mod presence {
    /// Enable the physical presence command
    pub const CMD_ENABLE: u16 = 0x0020;
    /// Assert presence
    pub const PRESENT: u16 = 0x0008;
    /// Lock presence until the next startup
    pub const LOCK: u16 = 0x0004;
}

/// NV space permission bits
pub mod perm {
    /// Writes require physical presence
    pub const PPWRITE: u32 = 0x0000_0001;
    /// Zero-length write locks the space permanently
    pub const WRITEDEFINE: u32 = 0x0000_2000;
    /// Zero-length write locks the space until the next startup
    pub const WRITE_STCLEAR: u32 = 0x0000_4000;
    /// Zero-length read locks reads until the next startup
    pub const READ_STCLEAR: u32 = 0x8000_0000;
}

/// Digest size carried by extend
pub const PCR_DIGEST_SIZE: usize = 20;

/// Authorization digest carried by define-space
pub const AUTH_SIZE: usize = 20;

// ============================================================================
// Request Builder
// ============================================================================

/// Frame buffer
pub type Frame = Vec<u8, TPM_MAX_FRAME>;

/// Request frame under construction
pub struct Command {
    frame: Frame,
}

impl Command {
    /// Start a request for `ordinal`
    #[must_use]
    pub fn new(ordinal: u32) -> Self {
        let mut frame = Frame::new();
        // The header always fits an empty frame buffer.
        let _ = frame.extend_from_slice(&TAG_RQU_COMMAND.to_be_bytes());
        let _ = frame.extend_from_slice(&0u32.to_be_bytes());
        let _ = frame.extend_from_slice(&ordinal.to_be_bytes());
        Self { frame }
    }

    /// Append a big-endian u8
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` if the frame is full.
    pub fn u8(mut self, value: u8) -> TpmResult<Self> {
        self.frame.push(value).map_err(|_| TpmError::BufferTooSmall)?;
        Ok(self)
    }

    /// Append a big-endian u16
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` if the frame is full.
    pub fn u16(self, value: u16) -> TpmResult<Self> {
        self.bytes(&value.to_be_bytes())
    }

    /// Append a big-endian u32
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` if the frame is full.
    pub fn u32(self, value: u32) -> TpmResult<Self> {
        self.bytes(&value.to_be_bytes())
    }

    /// Append raw bytes
    ///
    /// # Errors
    ///
    /// Returns `BufferTooSmall` if the frame is full.
    pub fn bytes(mut self, data: &[u8]) -> TpmResult<Self> {
        self.frame
            .extend_from_slice(data)
            .map_err(|_| TpmError::BufferTooSmall)?;
        Ok(self)
    }

    /// Patch the size field and return the finished frame
    #[must_use]
    pub fn finish(mut self) -> Frame {
        let size = (self.frame.len() as u32).to_be_bytes();
        self.frame[2..6].copy_from_slice(&size);
        self.frame
    }
}

// ============================================================================
// Response Parsing
// ============================================================================

/// Validated response frame
#[derive(Debug)]
pub struct Response<'a> {
    return_code: u32,
    data: &'a [u8],
}

impl<'a> Response<'a> {
    /// Validate tag and size of a received frame
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` if the header is short, the tag is wrong,
    /// or the declared size differs from the received length.
    pub fn parse(frame: &'a [u8]) -> TpmResult<Self> {
        if frame.len() < HEADER_SIZE {
            return Err(TpmError::MalformedResponse);
        }
        let mut reader = Reader::new(frame);
        let tag = reader.u16()?;
        let size = reader.u32()? as usize;
        let return_code = reader.u32()?;
        if tag != TAG_RSP_COMMAND || size != frame.len() {
            return Err(TpmError::MalformedResponse);
        }
        Ok(Self {
            return_code,
            data: &frame[HEADER_SIZE..],
        })
    }

    /// Return code
    #[must_use]
    pub const fn return_code(&self) -> u32 {
        self.return_code
    }

    /// Payload after the header
    #[must_use]
    pub const fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Payload of a successful response
    ///
    /// # Errors
    ///
    /// Returns `ReturnCode` for any non-success code.
    pub fn into_success(self) -> TpmResult<Reader<'a>> {
        if self.return_code == rc::SUCCESS {
            Ok(Reader::new(self.data))
        } else {
            Err(TpmError::ReturnCode(self.return_code))
        }
    }
}

/// Bounds-checked big-endian reader over response data
#[derive(Debug)]
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    /// Read from the start of `data`
    #[must_use]
    pub const fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Take `len` bytes
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` past the end of the data.
    pub fn bytes(&mut self, len: usize) -> TpmResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(TpmError::MalformedResponse)?;
        let out = self
            .data
            .get(self.pos..end)
            .ok_or(TpmError::MalformedResponse)?;
        self.pos = end;
        Ok(out)
    }

    /// Read a u8
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` past the end of the data.
    pub fn u8(&mut self) -> TpmResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    /// Read a big-endian u16
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` past the end of the data.
    pub fn u16(&mut self) -> TpmResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    /// Read a big-endian u32
    ///
    /// # Errors
    ///
    /// Returns `MalformedResponse` past the end of the data.
    pub fn u32(&mut self) -> TpmResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Bytes not yet consumed
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

/// Build a response frame (used by simulated modules)
#[must_use]
pub fn build_response(return_code: u32, data: &[u8]) -> Frame {
    let mut frame = Frame::new();
    let len = (HEADER_SIZE + data.len()).min(TPM_MAX_FRAME);
    let _ = frame.extend_from_slice(&TAG_RSP_COMMAND.to_be_bytes());
    let _ = frame.extend_from_slice(&(len as u32).to_be_bytes());
    let _ = frame.extend_from_slice(&return_code.to_be_bytes());
    let _ = frame.extend_from_slice(&data[..len - HEADER_SIZE]);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_framing() {
        let frame = Command::new(ordinal::NV_READ_VALUE)
            .u32(0x1008)
            .and_then(|c| c.u32(0))
            .and_then(|c| c.u32(13))
            .unwrap()
            .finish();
        assert_eq!(frame.len(), 22);
        assert_eq!(&frame[..10], &[0x00, 0xC1, 0, 0, 0, 22, 0, 0, 0, 0xCF]);
        assert_eq!(&frame[10..14], &[0, 0, 0x10, 0x08]);
    }

    #[test]
    fn test_response_validation() {
        let frame = build_response(rc::SUCCESS, &[0, 0, 0, 1, 0xAB]);
        let resp = Response::parse(&frame).unwrap();
        let mut r = resp.into_success().unwrap();
        assert_eq!(r.u32().unwrap(), 1);
        assert_eq!(r.u8().unwrap(), 0xAB);
        assert!(r.u8().is_err());

        let mut bad_tag = frame.clone();
        bad_tag[1] = 0xC1;
        assert_eq!(Response::parse(&bad_tag).unwrap_err(), TpmError::MalformedResponse);

        assert_eq!(
            Response::parse(&frame[..frame.len() - 1]).unwrap_err(),
            TpmError::MalformedResponse
        );
    }

    #[test]
    fn test_error_return_code() {
        let frame = build_response(rc::BADINDEX, &[]);
        let resp = Response::parse(&frame).unwrap();
        assert_eq!(resp.into_success().unwrap_err(), TpmError::ReturnCode(rc::BADINDEX));
    }
}
