// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! In-memory security module
//!
//! Implements the command subset the session speaks, with NV spaces, per-boot
//! locks, physical presence and PCRs, plus fault injection for exercising the
//! failure paths of the boot core. PCR extension uses truncated SHA-256.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use sha2::{Digest, Sha256};

use crate::command::{
    build_response, ordinal, perm, presence, rc, Reader, CAP_FLAG, CAP_FLAG_PERMANENT,
    CAP_NV_INDEX, HEADER_SIZE, PCR_DIGEST_SIZE, TAG_PERMANENT_FLAGS, TAG_RQU_COMMAND,
};
use crate::session::PermanentFlags;
use vb_hal::{HalError, HalResult, TpmTransport};

/// Number of simulated PCRs
pub const PCR_COUNT: usize = 24;

/// Largest space the simulator will define
pub const MAX_SPACE_SIZE: u32 = 1024;

/// Injected failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// No response
    Timeout,
    /// Transport error
    Transport,
    /// Response frame with a bad tag
    Garbage,
    /// Well-formed response with this return code
    ReturnCode(u32),
}

#[derive(Debug, Clone, Copy)]
struct FaultRule {
    ordinal: Option<u32>,
    fault: Fault,
    one_shot: bool,
}

/// Simulated NV space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimSpace {
    /// Permission bits
    pub permissions: u32,
    /// Contents
    pub data: Vec<u8>,
    /// Write-locked
    pub write_locked: bool,
    /// Read-locked
    pub read_locked: bool,
}

/// Simulated security module
#[derive(Debug, Clone)]
pub struct SimulatedTpm {
    spaces: BTreeMap<u32, SimSpace>,
    started: bool,
    self_tested: bool,
    flags: PermanentFlags,
    pending_flags: Option<PermanentFlags>,
    presence_enabled: bool,
    presence_asserted: bool,
    presence_locked: bool,
    pcrs: [[u8; PCR_DIGEST_SIZE]; PCR_COUNT],
    faults: Vec<FaultRule>,
    log: Vec<u32>,
    nv_writes: usize,
}

impl Default for SimulatedTpm {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedTpm {
    /// Fresh module: enabled, activated, no spaces defined
    #[must_use]
    pub fn new() -> Self {
        Self {
            spaces: BTreeMap::new(),
            started: false,
            self_tested: false,
            flags: PermanentFlags {
                nv_locked: true,
                ..PermanentFlags::default()
            },
            pending_flags: None,
            presence_enabled: false,
            presence_asserted: false,
            presence_locked: false,
            pcrs: [[0u8; PCR_DIGEST_SIZE]; PCR_COUNT],
            faults: Vec::new(),
            log: Vec::new(),
            nv_writes: 0,
        }
    }

    /// Pre-define a space with contents
    #[must_use]
    pub fn with_space(mut self, index: u32, permissions: u32, data: &[u8]) -> Self {
        self.spaces.insert(
            index,
            SimSpace {
                permissions,
                data: data.to_vec(),
                write_locked: false,
                read_locked: false,
            },
        );
        self
    }

    /// Override the permanent flags
    #[must_use]
    pub fn with_flags(mut self, flags: PermanentFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Space by index
    #[must_use]
    pub fn space(&self, index: u32) -> Option<&SimSpace> {
        self.spaces.get(&index)
    }

    /// Mutable space by index, for corrupting contents in tests
    pub fn space_mut(&mut self, index: u32) -> Option<&mut SimSpace> {
        self.spaces.get_mut(&index)
    }

    /// Current permanent flags
    #[must_use]
    pub const fn flags(&self) -> PermanentFlags {
        self.flags
    }

    /// PCR value
    #[must_use]
    pub fn pcr(&self, index: usize) -> Option<[u8; PCR_DIGEST_SIZE]> {
        self.pcrs.get(index).copied()
    }

    /// Ordinals received so far
    #[must_use]
    pub fn command_log(&self) -> &[u32] {
        &self.log
    }

    /// Number of non-empty NV writes accepted
    #[must_use]
    pub const fn nv_write_count(&self) -> usize {
        self.nv_writes
    }

    /// Fail every command with `ordinal` (any command if `None`)
    pub fn fail_ordinal(&mut self, ordinal: Option<u32>, fault: Fault) {
        self.faults.push(FaultRule {
            ordinal,
            fault,
            one_shot: false,
        });
    }

    /// Fail only the next matching command
    pub fn fail_once(&mut self, ordinal: Option<u32>, fault: Fault) {
        self.faults.push(FaultRule {
            ordinal,
            fault,
            one_shot: true,
        });
    }

    /// Remove all injected faults
    pub fn clear_faults(&mut self) {
        self.faults.clear();
    }

    /// Power cycle: clears per-boot locks, presence and PCRs, applies
    /// pending flag changes
    pub fn reboot(&mut self) {
        self.started = false;
        self.self_tested = false;
        self.presence_enabled = false;
        self.presence_asserted = false;
        self.presence_locked = false;
        self.pcrs = [[0u8; PCR_DIGEST_SIZE]; PCR_COUNT];
        if let Some(flags) = self.pending_flags.take() {
            self.flags = flags;
        }
        for space in self.spaces.values_mut() {
            if space.permissions & perm::WRITEDEFINE == 0 {
                space.write_locked = false;
            }
            space.read_locked = false;
        }
    }

    fn take_fault(&mut self, op: u32) -> Option<Fault> {
        let pos = self
            .faults
            .iter()
            .position(|r| r.ordinal.map_or(true, |o| o == op))?;
        let rule = self.faults[pos];
        if rule.one_shot {
            self.faults.remove(pos);
        }
        Some(rule.fault)
    }

    fn dispatch(&mut self, op: u32, params: &mut Reader<'_>) -> (u32, Vec<u8>) {
        match self.execute(op, params) {
            Ok(data) => (rc::SUCCESS, data),
            Err(code) => (code, Vec::new()),
        }
    }

    fn execute(&mut self, op: u32, p: &mut Reader<'_>) -> Result<Vec<u8>, u32> {
        if op == ordinal::STARTUP {
            if self.started {
                return Err(rc::INVALID_POSTINIT);
            }
            p.u16().map_err(|_| rc::BAD_PARAMETER)?;
            self.started = true;
            return Ok(Vec::new());
        }
        if !self.started {
            return Err(rc::INVALID_POSTINIT);
        }

        match op {
            ordinal::SELF_TEST_FULL | ordinal::CONTINUE_SELF_TEST => {
                self.self_tested = true;
                Ok(Vec::new())
            }
            ordinal::PHYSICAL_PRESENCE => self.physical_presence(p),
            ordinal::GET_CAPABILITY => self.get_capability(p),
            ordinal::PHYSICAL_ENABLE => {
                self.need_presence()?;
                let mut flags = self.pending_flags.unwrap_or(self.flags);
                flags.disable = false;
                self.pending_flags = Some(flags);
                Ok(Vec::new())
            }
            ordinal::PHYSICAL_SET_DEACTIVATED => {
                self.need_presence()?;
                let value = p.u8().map_err(|_| rc::BAD_PARAMETER)?;
                let mut flags = self.pending_flags.unwrap_or(self.flags);
                flags.deactivated = value != 0;
                self.pending_flags = Some(flags);
                Ok(Vec::new())
            }
            ordinal::FORCE_CLEAR => {
                self.need_presence()?;
                Ok(Vec::new())
            }
            ordinal::NV_DEFINE_SPACE => {
                self.need_operational()?;
                self.define_space(p)
            }
            ordinal::NV_WRITE_VALUE => {
                self.need_operational()?;
                self.nv_write(p)
            }
            ordinal::NV_READ_VALUE => {
                self.need_operational()?;
                self.nv_read(p)
            }
            ordinal::EXTEND => {
                self.need_operational()?;
                self.extend(p)
            }
            _ => Err(rc::BAD_PARAMETER),
        }
    }

    fn need_presence(&self) -> Result<(), u32> {
        if self.presence_asserted {
            Ok(())
        } else {
            Err(rc::BAD_PRESENCE)
        }
    }

    fn need_operational(&self) -> Result<(), u32> {
        if !self.self_tested {
            Err(rc::NEEDS_SELFTEST)
        } else if self.flags.disable {
            Err(rc::DISABLED)
        } else if self.flags.deactivated {
            Err(rc::DEACTIVATED)
        } else {
            Ok(())
        }
    }

    fn physical_presence(&mut self, p: &mut Reader<'_>) -> Result<Vec<u8>, u32> {
        let bits = p.u16().map_err(|_| rc::BAD_PARAMETER)?;
        if self.presence_locked {
            return Err(rc::BAD_PARAMETER);
        }
        if bits & presence::CMD_ENABLE != 0 {
            self.presence_enabled = true;
        }
        if bits & presence::PRESENT != 0 {
            if !self.presence_enabled {
                return Err(rc::BAD_PARAMETER);
            }
            self.presence_asserted = true;
        }
        if bits & presence::LOCK != 0 {
            self.presence_asserted = false;
            self.presence_locked = true;
        }
        Ok(Vec::new())
    }

    fn get_capability(&mut self, p: &mut Reader<'_>) -> Result<Vec<u8>, u32> {
        let area = p.u32().map_err(|_| rc::BAD_PARAMETER)?;
        let _sub_size = p.u32().map_err(|_| rc::BAD_PARAMETER)?;
        let sub = p.u32().map_err(|_| rc::BAD_PARAMETER)?;
        let mut out = Vec::new();
        match (area, sub) {
            (CAP_FLAG, CAP_FLAG_PERMANENT) => {
                out.extend_from_slice(&6u32.to_be_bytes());
                out.extend_from_slice(&TAG_PERMANENT_FLAGS.to_be_bytes());
                out.push(u8::from(self.flags.disable));
                out.push(u8::from(self.flags.ownership));
                out.push(u8::from(self.flags.deactivated));
                out.push(u8::from(self.flags.nv_locked));
            }
            (CAP_NV_INDEX, index) => {
                let space = self.spaces.get(&index).ok_or(rc::BADINDEX)?;
                out.extend_from_slice(&12u32.to_be_bytes());
                out.extend_from_slice(&index.to_be_bytes());
                out.extend_from_slice(&space.permissions.to_be_bytes());
                out.extend_from_slice(&(space.data.len() as u32).to_be_bytes());
            }
            _ => return Err(rc::BAD_PARAMETER),
        }
        Ok(out)
    }

    fn define_space(&mut self, p: &mut Reader<'_>) -> Result<Vec<u8>, u32> {
        let index = p.u32().map_err(|_| rc::BAD_PARAMETER)?;
        let permissions = p.u32().map_err(|_| rc::BAD_PARAMETER)?;
        let size = p.u32().map_err(|_| rc::BAD_PARAMETER)?;
        self.need_presence()?;
        if size > MAX_SPACE_SIZE {
            return Err(rc::NOSPACE);
        }
        self.spaces.insert(
            index,
            SimSpace {
                permissions,
                data: vec![0u8; size as usize],
                write_locked: false,
                read_locked: false,
            },
        );
        Ok(Vec::new())
    }

    fn nv_write(&mut self, p: &mut Reader<'_>) -> Result<Vec<u8>, u32> {
        let index = p.u32().map_err(|_| rc::BAD_PARAMETER)?;
        let offset = p.u32().map_err(|_| rc::BAD_PARAMETER)? as usize;
        let len = p.u32().map_err(|_| rc::BAD_PARAMETER)? as usize;
        let data = p.bytes(len).map_err(|_| rc::BAD_PARAMETER)?;
        let presence = self.presence_asserted;
        let space = self.spaces.get_mut(&index).ok_or(rc::BADINDEX)?;
        if space.write_locked {
            return Err(rc::AREA_LOCKED);
        }
        if len == 0 {
            if space.permissions & (perm::WRITE_STCLEAR | perm::WRITEDEFINE) != 0 {
                space.write_locked = true;
            }
            return Ok(Vec::new());
        }
        if space.permissions & perm::PPWRITE != 0 && !presence {
            return Err(rc::BAD_PRESENCE);
        }
        let end = offset.checked_add(len).ok_or(rc::NOSPACE)?;
        if end > space.data.len() {
            return Err(rc::NOSPACE);
        }
        space.data[offset..end].copy_from_slice(data);
        self.nv_writes += 1;
        Ok(Vec::new())
    }

    fn nv_read(&mut self, p: &mut Reader<'_>) -> Result<Vec<u8>, u32> {
        let index = p.u32().map_err(|_| rc::BAD_PARAMETER)?;
        let offset = p.u32().map_err(|_| rc::BAD_PARAMETER)? as usize;
        let len = p.u32().map_err(|_| rc::BAD_PARAMETER)? as usize;
        let space = self.spaces.get_mut(&index).ok_or(rc::BADINDEX)?;
        if space.read_locked {
            return Err(rc::AREA_LOCKED);
        }
        let mut out = Vec::new();
        if len == 0 {
            if space.permissions & perm::READ_STCLEAR != 0 {
                space.read_locked = true;
            }
            out.extend_from_slice(&0u32.to_be_bytes());
            return Ok(out);
        }
        let end = offset.checked_add(len).ok_or(rc::NOSPACE)?;
        let data = space.data.get(offset..end).ok_or(rc::NOSPACE)?;
        out.extend_from_slice(&(len as u32).to_be_bytes());
        out.extend_from_slice(data);
        Ok(out)
    }

    fn extend(&mut self, p: &mut Reader<'_>) -> Result<Vec<u8>, u32> {
        let pcr = p.u32().map_err(|_| rc::BAD_PARAMETER)? as usize;
        let digest = p.bytes(PCR_DIGEST_SIZE).map_err(|_| rc::BAD_PARAMETER)?;
        let slot = self.pcrs.get_mut(pcr).ok_or(rc::BAD_PARAMETER)?;
        let mut hasher = Sha256::new();
        hasher.update(*slot);
        hasher.update(digest);
        let full = hasher.finalize();
        slot.copy_from_slice(&full[..PCR_DIGEST_SIZE]);
        Ok(slot.to_vec())
    }
}

impl TpmTransport for SimulatedTpm {
    fn transmit(&mut self, request: &[u8], response: &mut [u8], _timeout_ms: u32) -> HalResult<usize> {
        let mut header = Reader::new(request);
        let (tag, size, op) = match (header.u16(), header.u32(), header.u32()) {
            (Ok(t), Ok(s), Ok(o)) => (t, s as usize, o),
            _ => return Err(HalError::InvalidParameter),
        };
        if tag != TAG_RQU_COMMAND || size != request.len() {
            return Err(HalError::InvalidParameter);
        }
        self.log.push(op);

        let frame = match self.take_fault(op) {
            Some(Fault::Timeout) => return Err(HalError::Timeout),
            Some(Fault::Transport) => return Err(HalError::TransportError),
            Some(Fault::Garbage) => {
                let mut f = build_response(rc::SUCCESS, &[]);
                f[0] = 0xFF;
                f
            }
            Some(Fault::ReturnCode(code)) => build_response(code, &[]),
            None => {
                let mut params = Reader::new(&request[HEADER_SIZE..]);
                let (code, data) = self.dispatch(op, &mut params);
                build_response(code, &data)
            }
        };

        let out = response
            .get_mut(..frame.len())
            .ok_or(HalError::BufferTooSmall)?;
        out.copy_from_slice(&frame);
        Ok(frame.len())
    }
}
