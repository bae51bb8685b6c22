// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! NV Record Codec
//!
//! A 16-byte record of boot flags and counters kept in ordinary non-volatile
//! storage. It is loaded at the start of a boot, edited in memory through
//! [`NvContext`], and written back at the end only if something changed.
//!
//! # Layout
//!
//! ```text
//! Byte  Content
//! 0     header: signature (bits 6-7 = 01), firmware reset 0x20, kernel reset 0x10
//! 1     debug reset 0x80, boot result (bits 4-5), try count (bits 0-3)
//! 2     recovery reason
//! 3     localization index
//! 4     dev flags: boot-usb 0x01, signed-only 0x02, disable-dev request 0x04
//! 5     recovery subcode
//! 6     clear-owner request 0x01, clear-owner done 0x02
//! 7     partition number of the last selected kernel (0 = none)
//! 8-10  reserved
//! 11-14 kernel field (u32 LE)
//! 15    CRC-8 over bytes 0-14
//! ```
//!
//! A record with a bad signature or CRC is never an error: it is replaced by
//! defaults with both settings-reset flags set.

use vb_common::constants::NV_RECORD_SIZE;
use vb_common::crc::crc8;
use vb_hal::{HalResult, NvBlobStore};

// ============================================================================
// Field Layout
// ============================================================================

const HEADER_OFFSET: usize = 0;
const HEADER_MASK: u8 = 0xC0;
const HEADER_SIGNATURE: u8 = 0x40;
const HEADER_FIRMWARE_RESET: u8 = 0x20;
const HEADER_KERNEL_RESET: u8 = 0x10;

const BOOT_OFFSET: usize = 1;
const BOOT_DEBUG_RESET: u8 = 0x80;
const BOOT_RESULT_MASK: u8 = 0x30;
const BOOT_RESULT_SHIFT: u8 = 4;
const BOOT_TRY_COUNT_MASK: u8 = 0x0F;

const RECOVERY_OFFSET: usize = 2;
const LOCALIZATION_OFFSET: usize = 3;

const DEV_OFFSET: usize = 4;
const DEV_BOOT_USB: u8 = 0x01;
const DEV_SIGNED_ONLY: u8 = 0x02;
const DEV_DISABLE_REQUEST: u8 = 0x04;

const RECOVERY_SUBCODE_OFFSET: usize = 5;

const TPM_OFFSET: usize = 6;
const TPM_CLEAR_OWNER_REQUEST: u8 = 0x01;
const TPM_CLEAR_OWNER_DONE: u8 = 0x02;

const KERNEL_PARTITION_OFFSET: usize = 7;
const KERNEL_FIELD_OFFSET: usize = 11;
const CRC_OFFSET: usize = 15;

/// Recovery reasons written by the boot core
pub mod recovery {
    /// No recovery requested
    pub const NOT_REQUESTED: u8 = 0x00;
    /// Security module error in the kernel selection path
    pub const TPM_ERROR: u8 = 0x54;
    /// No kernel candidate found on the boot device
    pub const NO_KERNEL: u8 = 0x5A;
    /// Candidates found, none verified
    pub const INVALID_OS: u8 = 0x5B;
    /// Unspecified failure in the kernel selection path
    pub const UNSPECIFIED: u8 = 0x7F;
}

// ============================================================================
// Parameters
// ============================================================================

/// Result of the previous boot attempt, as recorded by firmware and the OS
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum BootResult {
    /// Nothing recorded
    Unknown = 0,
    /// Firmware selected a kernel; the OS has not confirmed it yet
    Trying = 1,
    /// The OS confirmed a good boot
    Success = 2,
    /// The OS reported a failed boot
    Failure = 3,
}

impl BootResult {
    /// Decode a 2-bit field value
    #[must_use]
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            1 => Self::Trying,
            2 => Self::Success,
            3 => Self::Failure,
            _ => Self::Unknown,
        }
    }
}

/// Addressable field of the NV record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NvParam {
    /// Firmware settings were reset
    FirmwareSettingsReset,
    /// Kernel settings were reset
    KernelSettingsReset,
    /// Debug reset requested
    DebugResetMode,
    /// Boot result (see [`BootResult`])
    BootResult,
    /// Remaining tries for the current firmware
    TryCount,
    /// Recovery reason requested for the next boot
    RecoveryRequest,
    /// Localization index
    LocalizationIndex,
    /// Allow booting from USB in developer mode
    DevBootUsb,
    /// Only boot signed images in developer mode
    DevBootSignedOnly,
    /// Request to leave developer mode
    DisableDevRequest,
    /// Recovery subcode
    RecoverySubcode,
    /// Request to clear the security module owner
    ClearOwnerRequest,
    /// Owner clear completed
    ClearOwnerDone,
    /// Partition number of the last selected kernel
    KernelPartition,
    /// Field reserved for the kernel
    KernelField,
}

impl NvParam {
    /// Every parameter, in layout order
    pub const ALL: [Self; 15] = [
        Self::FirmwareSettingsReset,
        Self::KernelSettingsReset,
        Self::DebugResetMode,
        Self::BootResult,
        Self::TryCount,
        Self::RecoveryRequest,
        Self::LocalizationIndex,
        Self::DevBootUsb,
        Self::DevBootSignedOnly,
        Self::DisableDevRequest,
        Self::RecoverySubcode,
        Self::ClearOwnerRequest,
        Self::ClearOwnerDone,
        Self::KernelPartition,
        Self::KernelField,
    ];

    /// Largest storable value; larger values are clamped
    #[must_use]
    pub const fn max_value(self) -> u32 {
        match self {
            Self::FirmwareSettingsReset
            | Self::KernelSettingsReset
            | Self::DebugResetMode
            | Self::DevBootUsb
            | Self::DevBootSignedOnly
            | Self::DisableDevRequest
            | Self::ClearOwnerRequest
            | Self::ClearOwnerDone => 1,
            Self::BootResult => 3,
            Self::TryCount => 15,
            Self::RecoveryRequest
            | Self::LocalizationIndex
            | Self::RecoverySubcode
            | Self::KernelPartition => 0xFF,
            Self::KernelField => u32::MAX,
        }
    }

    /// Parameter name as printed by host tools
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::FirmwareSettingsReset => "firmware_settings_reset",
            Self::KernelSettingsReset => "kernel_settings_reset",
            Self::DebugResetMode => "debug_reset_mode",
            Self::BootResult => "boot_result",
            Self::TryCount => "try_count",
            Self::RecoveryRequest => "recovery_request",
            Self::LocalizationIndex => "localization_index",
            Self::DevBootUsb => "dev_boot_usb",
            Self::DevBootSignedOnly => "dev_boot_signed_only",
            Self::DisableDevRequest => "disable_dev_request",
            Self::RecoverySubcode => "recovery_subcode",
            Self::ClearOwnerRequest => "clear_owner_request",
            Self::ClearOwnerDone => "clear_owner_done",
            Self::KernelPartition => "kernel_partition",
            Self::KernelField => "kernel_field",
        }
    }

    const fn flag(self) -> Option<(usize, u8)> {
        match self {
            Self::FirmwareSettingsReset => Some((HEADER_OFFSET, HEADER_FIRMWARE_RESET)),
            Self::KernelSettingsReset => Some((HEADER_OFFSET, HEADER_KERNEL_RESET)),
            Self::DebugResetMode => Some((BOOT_OFFSET, BOOT_DEBUG_RESET)),
            Self::DevBootUsb => Some((DEV_OFFSET, DEV_BOOT_USB)),
            Self::DevBootSignedOnly => Some((DEV_OFFSET, DEV_SIGNED_ONLY)),
            Self::DisableDevRequest => Some((DEV_OFFSET, DEV_DISABLE_REQUEST)),
            Self::ClearOwnerRequest => Some((TPM_OFFSET, TPM_CLEAR_OWNER_REQUEST)),
            Self::ClearOwnerDone => Some((TPM_OFFSET, TPM_CLEAR_OWNER_DONE)),
            _ => None,
        }
    }

    const fn byte(self) -> Option<usize> {
        match self {
            Self::RecoveryRequest => Some(RECOVERY_OFFSET),
            Self::LocalizationIndex => Some(LOCALIZATION_OFFSET),
            Self::RecoverySubcode => Some(RECOVERY_SUBCODE_OFFSET),
            Self::KernelPartition => Some(KERNEL_PARTITION_OFFSET),
            _ => None,
        }
    }
}

// ============================================================================
// Context
// ============================================================================

/// In-memory copy of the NV record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvContext {
    raw: [u8; NV_RECORD_SIZE],
    regenerated: bool,
    changed: bool,
}

impl NvContext {
    /// Decode a stored blob
    ///
    /// A blob of the wrong length, with a bad signature or a bad CRC yields
    /// defaults and is marked for regeneration.
    #[must_use]
    pub fn setup(blob: &[u8]) -> Self {
        let valid = blob.len() == NV_RECORD_SIZE
            && blob[HEADER_OFFSET] & HEADER_MASK == HEADER_SIGNATURE
            && crc8(&blob[..CRC_OFFSET]) == blob[CRC_OFFSET];

        if !valid {
            return Self::defaults();
        }

        let mut raw = [0u8; NV_RECORD_SIZE];
        raw.copy_from_slice(blob);
        Self {
            raw,
            regenerated: false,
            changed: false,
        }
    }

    /// Fresh record with both settings-reset flags set
    #[must_use]
    pub fn defaults() -> Self {
        let mut raw = [0u8; NV_RECORD_SIZE];
        raw[HEADER_OFFSET] = HEADER_SIGNATURE | HEADER_FIRMWARE_RESET | HEADER_KERNEL_RESET;
        Self {
            raw,
            regenerated: true,
            changed: true,
        }
    }

    /// Load and decode the record from `store`
    ///
    /// A store that cannot be read is treated like a corrupt record.
    pub fn load<S: NvBlobStore>(store: &mut S) -> Self {
        let mut buffer = [0u8; NV_RECORD_SIZE];
        match store.load_blob(&mut buffer) {
            Ok(len) => Self::setup(&buffer[..len.min(NV_RECORD_SIZE)]),
            Err(_) => Self::defaults(),
        }
    }

    /// Whether the stored record was invalid and replaced by defaults
    #[must_use]
    pub const fn was_regenerated(&self) -> bool {
        self.regenerated
    }

    /// Whether the record differs from what was loaded
    #[must_use]
    pub const fn is_changed(&self) -> bool {
        self.changed
    }

    /// Read a parameter
    #[must_use]
    pub fn get(&self, param: NvParam) -> u32 {
        if let Some((offset, mask)) = param.flag() {
            return u32::from(self.raw[offset] & mask != 0);
        }
        if let Some(offset) = param.byte() {
            return u32::from(self.raw[offset]);
        }
        match param {
            NvParam::BootResult => {
                u32::from((self.raw[BOOT_OFFSET] & BOOT_RESULT_MASK) >> BOOT_RESULT_SHIFT)
            }
            NvParam::TryCount => u32::from(self.raw[BOOT_OFFSET] & BOOT_TRY_COUNT_MASK),
            NvParam::KernelField => {
                let mut bytes = [0u8; 4];
                bytes.copy_from_slice(&self.raw[KERNEL_FIELD_OFFSET..KERNEL_FIELD_OFFSET + 4]);
                u32::from_le_bytes(bytes)
            }
            _ => 0,
        }
    }

    /// Boot result field
    #[must_use]
    pub fn boot_result(&self) -> BootResult {
        BootResult::from_bits(self.get(NvParam::BootResult) as u8)
    }

    /// Write a parameter; values wider than the field are clamped
    pub fn set(&mut self, param: NvParam, value: u32) {
        let value = value.min(param.max_value());
        let before = self.raw;

        if let Some((offset, mask)) = param.flag() {
            if value == 0 {
                self.raw[offset] &= !mask;
            } else {
                self.raw[offset] |= mask;
            }
        } else if let Some(offset) = param.byte() {
            self.raw[offset] = value as u8;
        } else {
            match param {
                NvParam::BootResult => {
                    self.raw[BOOT_OFFSET] = (self.raw[BOOT_OFFSET] & !BOOT_RESULT_MASK)
                        | ((value as u8) << BOOT_RESULT_SHIFT);
                }
                NvParam::TryCount => {
                    self.raw[BOOT_OFFSET] =
                        (self.raw[BOOT_OFFSET] & !BOOT_TRY_COUNT_MASK) | value as u8;
                }
                NvParam::KernelField => {
                    self.raw[KERNEL_FIELD_OFFSET..KERNEL_FIELD_OFFSET + 4]
                        .copy_from_slice(&value.to_le_bytes());
                }
                _ => {}
            }
        }

        if self.raw != before {
            self.changed = true;
        }
    }

    /// Record the boot result
    pub fn set_boot_result(&mut self, result: BootResult) {
        self.set(NvParam::BootResult, result as u32);
    }

    /// Encoded record with a fresh CRC
    #[must_use]
    pub fn to_bytes(&self) -> [u8; NV_RECORD_SIZE] {
        let mut raw = self.raw;
        raw[CRC_OFFSET] = crc8(&raw[..CRC_OFFSET]);
        raw
    }

    /// Finish editing: the blob to store, or `None` if nothing changed
    pub fn teardown(&mut self) -> Option<[u8; NV_RECORD_SIZE]> {
        if !self.changed {
            return None;
        }
        let raw = self.to_bytes();
        self.raw = raw;
        self.changed = false;
        self.regenerated = false;
        Some(raw)
    }

    /// Tear down and store the blob if it changed
    ///
    /// Returns whether a write happened.
    ///
    /// # Errors
    ///
    /// Propagates the store's error; the record stays marked changed.
    pub fn commit<S: NvBlobStore>(&mut self, store: &mut S) -> HalResult<bool> {
        if !self.changed {
            return Ok(false);
        }
        store.store_blob(&self.to_bytes())?;
        self.teardown();
        Ok(true)
    }
}

impl Default for NvContext {
    fn default() -> Self {
        Self::defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_blob_gives_defaults() {
        let ctx = NvContext::setup(&[]);
        assert!(ctx.was_regenerated());
        assert_eq!(ctx.get(NvParam::FirmwareSettingsReset), 1);
        assert_eq!(ctx.get(NvParam::KernelSettingsReset), 1);
        assert_eq!(ctx.boot_result(), BootResult::Unknown);
    }

    #[test]
    fn test_clamping() {
        let mut ctx = NvContext::defaults();
        ctx.set(NvParam::TryCount, 100);
        assert_eq!(ctx.get(NvParam::TryCount), 15);
        ctx.set(NvParam::DevBootUsb, 7);
        assert_eq!(ctx.get(NvParam::DevBootUsb), 1);
        ctx.set(NvParam::RecoveryRequest, 0x1FF);
        assert_eq!(ctx.get(NvParam::RecoveryRequest), 0xFF);
    }

    #[test]
    fn test_neighbouring_fields_independent() {
        let mut ctx = NvContext::defaults();
        ctx.set(NvParam::TryCount, 9);
        ctx.set(NvParam::BootResult, BootResult::Failure as u32);
        ctx.set(NvParam::DebugResetMode, 1);
        assert_eq!(ctx.get(NvParam::TryCount), 9);
        assert_eq!(ctx.boot_result(), BootResult::Failure);
        ctx.set(NvParam::DebugResetMode, 0);
        assert_eq!(ctx.get(NvParam::TryCount), 9);
        assert_eq!(ctx.boot_result(), BootResult::Failure);
    }

    #[test]
    fn test_teardown_only_when_changed() {
        let blob = NvContext::defaults().to_bytes();
        let mut ctx = NvContext::setup(&blob);
        assert!(!ctx.was_regenerated());
        assert_eq!(ctx.teardown(), None);

        ctx.set(NvParam::LocalizationIndex, 0);
        assert_eq!(ctx.teardown(), None);

        ctx.set(NvParam::LocalizationIndex, 3);
        let out = ctx.teardown().unwrap();
        assert_eq!(out[LOCALIZATION_OFFSET], 3);
        assert_eq!(ctx.teardown(), None);
    }

    #[test]
    fn test_bad_signature_rejected() {
        let mut blob = NvContext::defaults().to_bytes();
        blob[HEADER_OFFSET] = 0x80 | HEADER_FIRMWARE_RESET;
        blob[CRC_OFFSET] = crc8(&blob[..CRC_OFFSET]);
        assert!(NvContext::setup(&blob).was_regenerated());
    }
}
