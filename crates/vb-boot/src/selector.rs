// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Kernel Selector
//!
//! Drives the partition table reader, the verification pipeline and rollback
//! protection to pick exactly one kernel partition, or fail closed.
//!
//! ```text
//! Start -> Scanning -> Verifying(i) -> Accepted(i) -> Selected(i)
//!             ^              |
//!             |              v
//!             +------ Rejected(i, reason)
//!
//! any state -> Fatal(error)
//! ```
//!
//! Per-candidate failures (structural, cryptographic, rollback) reject the
//! candidate and move on. Infrastructure failures and running out of
//! candidates end in `Fatal`, after which the caller must enter recovery.
//!
//! A candidate's try is consumed before it is verified; its successful-boot
//! flag is set only after the body has been verified.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use vb_common::constants::BOOT_MODE_PCR;
use vb_common::{log_error, log_info, log_warn};
use vb_common::{BootConfig, BootMode, ConfirmationPolicy, Error, LogBuffer};
use vb_crypto::HashAlgorithm;
use vb_hal::{BlockDevice, HalError, NvBlobStore, TpmTransport};
use vb_tpm::command::PCR_DIGEST_SIZE;

use crate::gpt::{EntryUpdate, GptError, Guid, KernelCursor, PartitionTable, TableSource};
use crate::nvstorage::{recovery, BootResult, NvContext, NvParam};
use crate::rollback::{RollbackError, RollbackProtection, RollbackState};
use crate::vboot::{
    verify_kernel_header, BodyVerifier, KernelHeader, PublicKey, VerifyError, VersionFloor,
};

const MODULE: &str = "selector";

/// Sectors read per body chunk
const BODY_CHUNK_SECTORS: usize = 64;

// ============================================================================
// Types
// ============================================================================

/// Selector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectorState {
    /// Nothing read yet
    Start,
    /// Looking for the next candidate
    Scanning,
    /// Candidate at entry `index` is being verified
    Verifying {
        /// Entry index
        index: u32,
    },
    /// Candidate passed verification
    Accepted {
        /// Entry index
        index: u32,
    },
    /// Candidate failed verification
    Rejected {
        /// Entry index
        index: u32,
        /// Why
        reason: Error,
    },
    /// Boot decision made
    Selected {
        /// Entry index
        index: u32,
    },
    /// No kernel can be booted
    Fatal(Error),
}

/// Boot failure reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootError {
    /// No candidate passed verification
    NoValidKernel {
        /// Candidates examined
        examined: usize,
    },
    /// Rollback state, device or security module failure
    Infrastructure(Error),
}

impl BootError {
    fn from_fatal(error: Error, examined: usize) -> Self {
        match error {
            Error::NoValidKernel => Self::NoValidKernel { examined },
            other => Self::Infrastructure(other),
        }
    }

    /// Recovery reason to record for the next boot
    #[must_use]
    pub const fn recovery_reason(&self) -> u8 {
        match self {
            Self::NoValidKernel { examined: 0 } => recovery::NO_KERNEL,
            Self::NoValidKernel { .. } => recovery::INVALID_OS,
            Self::Infrastructure(
                Error::ModuleUnavailable | Error::ModuleCorrupt | Error::ModuleState,
            ) => recovery::TPM_ERROR,
            Self::Infrastructure(_) => recovery::UNSPECIFIED,
        }
    }

    /// Underlying unified error
    #[must_use]
    pub const fn error(&self) -> Error {
        match self {
            Self::NoValidKernel { .. } => Error::NoValidKernel,
            Self::Infrastructure(e) => *e,
        }
    }
}

impl fmt::Display for BootError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoValidKernel { examined } => {
                write!(f, "{} ({} candidates examined)", self.error(), examined)
            }
            Self::Infrastructure(e) => write!(f, "{e}"),
        }
    }
}

impl From<BootError> for Error {
    fn from(e: BootError) -> Self {
        e.error()
    }
}

/// Load parameters of the selected kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectedKernel {
    /// Partition number (entry index + 1)
    pub partition_number: u32,
    /// Entry index
    pub entry_index: u32,
    /// Unique partition GUID
    pub unique_guid: Guid,
    /// First sector of the partition
    pub starting_lba: u64,
    /// Partition size in sectors
    pub sector_count: u64,
    /// Body offset from the start of the partition
    pub body_offset: u64,
    /// Body size in bytes
    pub body_size: u64,
    /// Address the body is loaded to
    pub body_load_address: u64,
    /// Bootloader address inside the body
    pub bootloader_address: u64,
    /// Bootloader size
    pub bootloader_size: u64,
    /// Data key version
    pub key_version: u32,
    /// Kernel version
    pub kernel_version: u32,
    /// Stored rollback floor raised by this boot
    pub floor_raised: bool,
}

/// Everything one boot attempt works with
pub struct BootContext<'a, D, T, S>
where
    D: BlockDevice,
    T: TpmTransport,
    S: NvBlobStore,
{
    /// Boot device
    pub device: &'a mut D,
    /// Rollback protection
    pub rollback: &'a mut RollbackProtection<T>,
    /// NV record storage
    pub nv_store: &'a mut S,
    /// Key that signs kernel key blocks in normal and developer mode
    pub kernel_key: &'a PublicKey,
    /// Key that signs recovery kernel key blocks
    pub recovery_key: Option<&'a PublicKey>,
    /// Boot mode
    pub mode: BootMode,
    /// Configuration
    pub config: BootConfig,
    /// Log sink
    pub log: &'a mut LogBuffer,
}

/// Candidate verification failure
enum CandidateError {
    /// Candidate rejected, scan continues
    Rejected(VerifyError),
    /// Boot aborted
    Aborted(Error),
}

impl From<VerifyError> for CandidateError {
    fn from(e: VerifyError) -> Self {
        Self::Rejected(e)
    }
}

impl From<HalError> for CandidateError {
    fn from(e: HalError) -> Self {
        Self::Aborted(e.into())
    }
}

// ============================================================================
// Selector
// ============================================================================

/// Kernel selection state machine
pub struct KernelSelector<'a, D, T, S>
where
    D: BlockDevice,
    T: TpmTransport,
    S: NvBlobStore,
{
    ctx: BootContext<'a, D, T, S>,
    state: SelectorState,
    nv: NvContext,
    rollback_state: Option<RollbackState>,
    floor: VersionFloor,
    table: Option<PartitionTable>,
    cursor: KernelCursor,
    examined: usize,
    rejected: usize,
    was_successful: bool,
    verified: Option<KernelHeader>,
    selected: Option<SelectedKernel>,
}

impl<'a, D, T, S> KernelSelector<'a, D, T, S>
where
    D: BlockDevice,
    T: TpmTransport,
    S: NvBlobStore,
{
    /// Selector for one boot attempt
    pub fn new(ctx: BootContext<'a, D, T, S>) -> Self {
        Self {
            ctx,
            state: SelectorState::Start,
            nv: NvContext::defaults(),
            rollback_state: None,
            floor: VersionFloor::NONE,
            table: None,
            cursor: KernelCursor::new(),
            examined: 0,
            rejected: 0,
            was_successful: false,
            verified: None,
            selected: None,
        }
    }

    /// Current state
    #[must_use]
    pub const fn state(&self) -> SelectorState {
        self.state
    }

    /// Whether a terminal state was reached
    #[must_use]
    pub const fn is_finished(&self) -> bool {
        matches!(
            self.state,
            SelectorState::Selected { .. } | SelectorState::Fatal(_)
        )
    }

    /// Candidates examined so far
    #[must_use]
    pub const fn examined(&self) -> usize {
        self.examined
    }

    /// Candidates rejected so far
    #[must_use]
    pub const fn rejected(&self) -> usize {
        self.rejected
    }

    /// Partition table, once read
    #[must_use]
    pub const fn table(&self) -> Option<&PartitionTable> {
        self.table.as_ref()
    }

    /// Process one transition
    ///
    /// Returns true once a terminal state is reached.
    pub fn step(&mut self) -> bool {
        let next = match self.state {
            SelectorState::Start => self.start(),
            SelectorState::Scanning => self.scan(),
            SelectorState::Verifying { index } => self.verify(index),
            SelectorState::Rejected { .. } => SelectorState::Scanning,
            SelectorState::Accepted { index } => self.accept(index),
            SelectorState::Selected { .. } | SelectorState::Fatal(_) => return true,
        };
        if let SelectorState::Fatal(error) = next {
            self.record_failure(error);
        }
        self.state = next;
        self.is_finished()
    }

    /// Step until a terminal state and return the decision
    ///
    /// # Errors
    ///
    /// `NoValidKernel` if every candidate was rejected, `Infrastructure` if
    /// the rollback floor, the device or the security module failed.
    pub fn run(mut self) -> Result<SelectedKernel, BootError> {
        while !self.step() {}
        self.into_result()
    }

    /// Decision of a finished selector
    ///
    /// # Errors
    ///
    /// As for [`Self::run`]; `Infrastructure(InternalError)` if not finished.
    pub fn into_result(self) -> Result<SelectedKernel, BootError> {
        match self.state {
            SelectorState::Selected { .. } => self
                .selected
                .ok_or(BootError::Infrastructure(Error::InternalError)),
            SelectorState::Fatal(error) => Err(BootError::from_fatal(error, self.examined)),
            _ => Err(BootError::Infrastructure(Error::InternalError)),
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn start(&mut self) -> SelectorState {
        let mode = self.ctx.mode;
        log_info!(self.ctx.log, MODULE, "boot mode {}", mode.as_str());

        self.nv = NvContext::load(&mut *self.ctx.nv_store);
        if self.nv.was_regenerated() {
            log_warn!(self.ctx.log, MODULE, "nv record invalid, using defaults");
        }

        if mode == BootMode::Recovery && self.ctx.recovery_key.is_none() {
            log_error!(self.ctx.log, MODULE, "no recovery key");
            return SelectorState::Fatal(Error::NoValidKernel);
        }

        match self.ctx.rollback.read() {
            Ok(state) => {
                self.rollback_state = Some(state);
                self.floor = state.floor();
                log_info!(
                    self.ctx.log,
                    MODULE,
                    "rollback floor 0x{:08X}{}",
                    self.floor.combined,
                    if state.bootstrap { " (bootstrap)" } else { "" }
                );
            }
            Err(e) => {
                if let Err(error) = self.tolerate("rollback read", e.into()) {
                    return SelectorState::Fatal(error);
                }
            }
        }

        match PartitionTable::read(&mut *self.ctx.device) {
            Ok(table) => {
                if table.source() == TableSource::Backup {
                    log_warn!(self.ctx.log, MODULE, "primary partition table invalid, using backup");
                }
                for (a, b) in table.overlaps() {
                    log_warn!(self.ctx.log, MODULE, "entries {} and {} overlap", a, b);
                }
                self.table = Some(table);
                SelectorState::Scanning
            }
            Err(GptError::Io) => SelectorState::Fatal(Error::DeviceIo),
            Err(e) => {
                log_error!(self.ctx.log, MODULE, "partition table rejected: {}", e);
                SelectorState::Fatal(Error::NoValidKernel)
            }
        }
    }

    fn scan(&mut self) -> SelectorState {
        let Some(table) = self.table.as_mut() else {
            return SelectorState::Fatal(Error::InternalError);
        };
        if self.examined >= self.ctx.config.max_candidates {
            log_warn!(
                self.ctx.log,
                MODULE,
                "candidate limit {} reached",
                self.ctx.config.max_candidates
            );
            return SelectorState::Fatal(Error::NoValidKernel);
        }
        let Some(entry) = table.next_kernel_entry(&mut self.cursor) else {
            log_error!(
                self.ctx.log,
                MODULE,
                "no valid kernel among {} candidates",
                self.examined
            );
            return SelectorState::Fatal(Error::NoValidKernel);
        };

        let index = entry.index;
        let successful = entry.successful();
        log_info!(
            self.ctx.log,
            MODULE,
            "candidate partition {} priority {} tries {}{}",
            entry.partition_number(),
            entry.priority(),
            entry.tries(),
            if successful { " successful" } else { "" }
        );
        self.examined += 1;
        self.was_successful = successful;

        // A successful entry keeps its tries
        if self.ctx.mode.may_update_table() && !successful {
            if let Err(e) = table.update_kernel_entry(index, EntryUpdate::TRY) {
                return SelectorState::Fatal(e.into());
            }
        }
        SelectorState::Verifying { index }
    }

    fn verify(&mut self, index: u32) -> SelectorState {
        match self.verify_candidate(index) {
            Ok(header) => {
                log_info!(
                    self.ctx.log,
                    MODULE,
                    "partition {} verified, key version {} kernel version {}",
                    index + 1,
                    header.keyblock.data_key.key_version(),
                    header.preamble.kernel_version
                );
                self.verified = Some(header);
                SelectorState::Accepted { index }
            }
            Err(CandidateError::Rejected(e)) => {
                self.rejected += 1;
                log_warn!(
                    self.ctx.log,
                    MODULE,
                    "partition {} rejected at {}: {}",
                    index + 1,
                    e.stage(),
                    e
                );
                SelectorState::Rejected {
                    index,
                    reason: e.into(),
                }
            }
            Err(CandidateError::Aborted(error)) => SelectorState::Fatal(error),
        }
    }

    fn accept(&mut self, index: u32) -> SelectorState {
        match self.finalize(index) {
            Ok(selected) => {
                log_info!(
                    self.ctx.log,
                    MODULE,
                    "selected partition {}",
                    selected.partition_number
                );
                self.selected = Some(selected);
                SelectorState::Selected { index }
            }
            Err(error) => SelectorState::Fatal(error),
        }
    }

    // ========================================================================
    // Verification
    // ========================================================================

    fn trusted_key(&self) -> Option<&'a PublicKey> {
        match self.ctx.mode {
            BootMode::Recovery => self.ctx.recovery_key,
            BootMode::Normal | BootMode::Developer => Some(self.ctx.kernel_key),
        }
    }

    fn verify_candidate(&mut self, index: u32) -> Result<KernelHeader, CandidateError> {
        let internal = CandidateError::Aborted(Error::InternalError);
        let trusted = self.trusted_key().ok_or(CandidateError::Aborted(Error::NoValidKernel))?;
        let entry = self
            .table
            .as_ref()
            .and_then(|t| t.entry(index))
            .ok_or(internal)?;
        let start = entry.starting_lba;
        let sector = u64::from(self.ctx.device.sector_size());
        let partition_bytes = entry
            .sector_count()
            .checked_mul(sector)
            .ok_or(VerifyError::SizeMismatch)?;

        let mut header = vec![0u8; header_read_len(self.ctx.config.header_read_size, sector, partition_bytes)];
        self.ctx.device.read_sectors(start, &mut header)?;

        let kernel = verify_kernel_header(&header, trusted, self.ctx.mode, self.floor, partition_bytes)?;
        let mut body = BodyVerifier::new(kernel.data_key(), &kernel.preamble)?;
        stream_body(
            &mut *self.ctx.device,
            start,
            sector,
            &header,
            kernel.body_offset(),
            &mut body,
        )?;
        body.finish()?;
        Ok(kernel)
    }

    // ========================================================================
    // Outcome
    // ========================================================================

    fn finalize(&mut self, index: u32) -> Result<SelectedKernel, Error> {
        let kernel = self.verified.take().ok_or(Error::InternalError)?;
        let mode = self.ctx.mode;

        let entry = {
            let table = self.table.as_mut().ok_or(Error::InternalError)?;
            if mode.may_update_table() {
                table.update_kernel_entry(index, EntryUpdate::SUCCESS)?;
            }
            table.entry(index).ok_or(Error::InternalError)?.clone()
        };
        let partition_number = entry.partition_number();

        let floor_raised = self.raise_floor(partition_number, kernel.combined_version())?;

        if mode.may_update_table() {
            if let Some(table) = self.table.as_mut() {
                if table.is_dirty() {
                    table.write(&mut *self.ctx.device)?;
                }
            }
        }

        self.nv.set_boot_result(BootResult::Trying);
        self.nv.set(NvParam::KernelPartition, partition_number);
        self.nv
            .set(NvParam::RecoveryRequest, u32::from(recovery::NOT_REQUESTED));
        self.commit_nv();

        if self.ctx.config.measure_boot_mode {
            if let Err(e) = self.measure_boot_mode() {
                self.tolerate("boot mode measurement", e)?;
            }
        }
        if let Err(e) = self.ctx.rollback.lock_for_boot() {
            self.tolerate("rollback lock", e.into())?;
        }

        Ok(SelectedKernel {
            partition_number,
            entry_index: index,
            unique_guid: entry.unique_guid,
            starting_lba: entry.starting_lba,
            sector_count: entry.sector_count(),
            body_offset: kernel.body_offset(),
            body_size: kernel.preamble.body_size,
            body_load_address: kernel.preamble.body_load_address,
            bootloader_address: kernel.preamble.bootloader_address,
            bootloader_size: kernel.preamble.bootloader_size,
            key_version: kernel.keyblock.data_key.key_version(),
            kernel_version: kernel.preamble.kernel_version,
            floor_raised,
        })
    }

    /// Raise the stored floor to `combined` if the two-boot confirmation holds
    fn raise_floor(&mut self, partition_number: u32, combined: u32) -> Result<bool, Error> {
        if self.ctx.config.confirmation != ConfirmationPolicy::TwoBoot
            || self.ctx.mode != BootMode::Normal
        {
            return Ok(false);
        }
        let Some(state) = self.rollback_state else {
            return Ok(false);
        };
        let confirmed = self.was_successful
            && self.nv.boot_result() == BootResult::Success
            && self.nv.get(NvParam::KernelPartition) == partition_number;
        if !confirmed || combined <= state.stored {
            return Ok(false);
        }

        match self.ctx.rollback.write(combined) {
            Ok(()) => {
                log_info!(self.ctx.log, MODULE, "rollback floor raised to 0x{:08X}", combined);
                Ok(true)
            }
            Err(e @ (RollbackError::Violation | RollbackError::Locked)) => {
                log_warn!(self.ctx.log, MODULE, "rollback floor kept: {}", e);
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn measure_boot_mode(&mut self) -> Result<(), Error> {
        let digest = HashAlgorithm::Sha256
            .digest(&[self.ctx.mode as u8])
            .ok_or(Error::InternalError)?;
        let mut value = [0u8; PCR_DIGEST_SIZE];
        value.copy_from_slice(&digest.as_ref()[..PCR_DIGEST_SIZE]);
        self.ctx
            .rollback
            .session_mut()
            .extend(BOOT_MODE_PCR, &value)?;
        Ok(())
    }

    /// Recovery boots carry on without the security module; other modes stop
    fn tolerate(&mut self, what: &str, error: Error) -> Result<(), Error> {
        if self.ctx.mode == BootMode::Recovery {
            log_warn!(self.ctx.log, MODULE, "{} skipped in recovery: {}", what, error);
            Ok(())
        } else {
            log_error!(self.ctx.log, MODULE, "{} failed: {}", what, error);
            Err(error)
        }
    }

    fn commit_nv(&mut self) {
        if let Err(e) = self.nv.commit(&mut *self.ctx.nv_store) {
            log_warn!(self.ctx.log, MODULE, "nv record not saved: {}", e);
        }
    }

    fn record_failure(&mut self, error: Error) {
        let failure = BootError::from_fatal(error, self.examined);
        log_error!(self.ctx.log, MODULE, "boot failed: {}", failure);

        // Consumed tries persist even when nothing boots
        if self.ctx.mode.may_update_table() {
            if let Some(table) = self.table.as_mut() {
                if table.is_dirty() {
                    if let Err(e) = table.write(&mut *self.ctx.device) {
                        log_warn!(self.ctx.log, MODULE, "partition table not saved: {}", e);
                    }
                }
            }
        }

        self.nv
            .set(NvParam::RecoveryRequest, u32::from(failure.recovery_reason()));
        self.commit_nv();
    }
}

/// Bytes read up front for the key block and preamble: whole sectors, at
/// least one, never past the partition
fn header_read_len(read_size: u32, sector: u64, partition_bytes: u64) -> usize {
    let wanted = (u64::from(read_size) / sector).max(1) * sector;
    wanted.min(partition_bytes) as usize
}

/// Feed the body at `offset` into `body`, reusing the bytes already in
/// `header` and reading the rest in sector-aligned chunks
fn stream_body<D: BlockDevice>(
    device: &mut D,
    start_lba: u64,
    sector: u64,
    header: &[u8],
    offset: u64,
    body: &mut BodyVerifier<'_>,
) -> Result<(), CandidateError> {
    let end = offset
        .checked_add(body.remaining())
        .ok_or(VerifyError::SizeMismatch)?;
    let mut pos = offset;

    let buffered = header.len() as u64;
    if pos < buffered {
        let stop = end.min(buffered);
        body.update(&header[pos as usize..stop as usize]);
        pos = stop;
    }

    if pos < end {
        let mut chunk: Vec<u8> = vec![0u8; BODY_CHUNK_SECTORS * sector as usize];
        while pos < end {
            let skip = pos % sector;
            let needed = (end - pos + skip).div_ceil(sector) * sector;
            let len = needed.min(chunk.len() as u64) as usize;
            device.read_sectors(start_lba + pos / sector, &mut chunk[..len])?;
            let take = (len as u64 - skip).min(end - pos);
            body.update(&chunk[skip as usize..(skip + take) as usize]);
            pos += take;
        }
    }
    Ok(())
}

/// Select the kernel to boot
///
/// Runs [`KernelSelector`] to completion.
///
/// # Errors
///
/// See [`KernelSelector::run`]. On error the NV record carries the recovery
/// reason for the next boot.
pub fn select_and_load_kernel<D, T, S>(
    ctx: BootContext<'_, D, T, S>,
) -> Result<SelectedKernel, BootError>
where
    D: BlockDevice,
    T: TpmTransport,
    S: NvBlobStore,
{
    KernelSelector::new(ctx).run()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_read_len() {
        assert_eq!(header_read_len(64 * 1024, 512, 1 << 20), 64 * 1024);
        assert_eq!(header_read_len(100, 512, 1 << 20), 512);
        assert_eq!(header_read_len(64 * 1024, 512, 4096), 4096);
    }

    #[test]
    fn test_recovery_reasons() {
        assert_eq!(
            BootError::NoValidKernel { examined: 0 }.recovery_reason(),
            recovery::NO_KERNEL
        );
        assert_eq!(
            BootError::NoValidKernel { examined: 2 }.recovery_reason(),
            recovery::INVALID_OS
        );
        assert_eq!(
            BootError::Infrastructure(Error::ModuleUnavailable).recovery_reason(),
            recovery::TPM_ERROR
        );
        assert_eq!(
            BootError::Infrastructure(Error::DeviceIo).recovery_reason(),
            recovery::UNSPECIFIED
        );
    }

    #[test]
    fn test_fatal_mapping() {
        assert_eq!(
            BootError::from_fatal(Error::NoValidKernel, 3),
            BootError::NoValidKernel { examined: 3 }
        );
        assert_eq!(
            Error::from(BootError::Infrastructure(Error::ModuleCorrupt)),
            Error::ModuleCorrupt
        );
    }
}
