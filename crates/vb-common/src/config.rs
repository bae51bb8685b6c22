// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Boot configuration
//!
//! Configuration is fixed at build or provisioning time. Firmware uses
//! [`BootConfig::DEFAULT`]; host tools and tests adjust it with the `with_*`
//! builders.

use crate::constants::{
    DEFAULT_SECTOR_SIZE, DEFAULT_TPM_TIMEOUT_MS, KERNEL_NV_INDEX, SECURE_NV_INDEX,
};

/// Boot mode selected by earlier firmware for this boot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BootMode {
    /// Verified boot with rollback enforcement
    Normal = 0,
    /// Developer switch on: signatures still checked, floors not enforced
    Developer = 1,
    /// Recovery: recovery key, no table mutation, no floor updates
    Recovery = 2,
}

impl BootMode {
    /// Whether rollback floors are enforced in this mode
    #[must_use]
    pub const fn enforces_rollback(self) -> bool {
        matches!(self, Self::Normal)
    }

    /// Whether the selector may write back the partition table
    #[must_use]
    pub const fn may_update_table(self) -> bool {
        !matches!(self, Self::Recovery)
    }

    /// Mode name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Developer => "developer",
            Self::Recovery => "recovery",
        }
    }
}

/// When the stored kernel floor may be raised after a boot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationPolicy {
    /// Never raise the floor from the selector
    Disabled,
    /// Raise only after the kernel reported a prior successful boot, both in
    /// the partition table and in the NV record
    TwoBoot,
}

/// Kernel selection configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    /// Logical sector size of the boot device
    pub sector_size: u32,
    /// Maximum kernel candidates examined per boot
    pub max_candidates: usize,
    /// Bytes read from the start of a partition to cover key block and preamble
    pub header_read_size: u32,
    /// Security-module per-command timeout
    pub tpm_timeout_ms: u32,
    /// NV index of the kernel rollback space
    pub kernel_nv_index: u32,
    /// NV index of the secure rollback space
    pub secure_nv_index: u32,
    /// Floor confirmation policy
    pub confirmation: ConfirmationPolicy,
    /// Extend a boot-mode measurement after selection
    pub measure_boot_mode: bool,
}

impl BootConfig {
    /// Default boot configuration
    pub const DEFAULT: Self = Self {
        sector_size: DEFAULT_SECTOR_SIZE,
        max_candidates: 16,
        header_read_size: 64 * 1024,
        tpm_timeout_ms: DEFAULT_TPM_TIMEOUT_MS,
        kernel_nv_index: KERNEL_NV_INDEX,
        secure_nv_index: SECURE_NV_INDEX,
        confirmation: ConfirmationPolicy::TwoBoot,
        measure_boot_mode: true,
    };

    /// Override the sector size
    #[must_use]
    pub const fn with_sector_size(mut self, sector_size: u32) -> Self {
        self.sector_size = sector_size;
        self
    }

    /// Override the candidate limit
    #[must_use]
    pub const fn with_max_candidates(mut self, max: usize) -> Self {
        self.max_candidates = max;
        self
    }

    /// Override the header read size
    #[must_use]
    pub const fn with_header_read_size(mut self, size: u32) -> Self {
        self.header_read_size = size;
        self
    }

    /// Override the security-module timeout
    #[must_use]
    pub const fn with_tpm_timeout_ms(mut self, timeout_ms: u32) -> Self {
        self.tpm_timeout_ms = timeout_ms;
        self
    }

    /// Override the confirmation policy
    #[must_use]
    pub const fn with_confirmation(mut self, policy: ConfirmationPolicy) -> Self {
        self.confirmation = policy;
        self
    }

    /// Enable or disable the boot-mode measurement
    #[must_use]
    pub const fn with_measurement(mut self, enabled: bool) -> Self {
        self.measure_boot_mode = enabled;
        self
    }

    /// Basic sanity of the configured values
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.sector_size >= 512
            && self.sector_size.is_power_of_two()
            && self.max_candidates > 0
            && self.header_read_size > 0
            && self.tpm_timeout_ms > 0
            && self.kernel_nv_index != self.secure_nv_index
    }
}

impl Default for BootConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(BootConfig::DEFAULT.is_valid());
        assert!(!BootConfig::DEFAULT.with_sector_size(300).is_valid());
        assert!(!BootConfig::DEFAULT.with_max_candidates(0).is_valid());
    }

    #[test]
    fn test_mode_policy() {
        assert!(BootMode::Normal.enforces_rollback());
        assert!(!BootMode::Developer.enforces_rollback());
        assert!(!BootMode::Recovery.may_update_table());
        assert!(BootMode::Developer.may_update_table());
    }
}
