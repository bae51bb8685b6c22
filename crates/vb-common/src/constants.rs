// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Constants shared across the verified boot core
//!
//! On-disk and on-module layouts are fixed for interoperability with existing
//! disks and firmware; none of these values may change.

// =============================================================================
// Partition Table
// =============================================================================

/// Default logical sector size in bytes
pub const DEFAULT_SECTOR_SIZE: u32 = 512;

/// GPT header signature
pub const GPT_SIGNATURE: [u8; 8] = *b"EFI PART";

/// GPT header revision 1.0
pub const GPT_REVISION: u32 = 0x0001_0000;

/// GPT header size in bytes
pub const GPT_HEADER_SIZE: usize = 92;

/// GPT partition entry size in bytes
pub const GPT_ENTRY_SIZE: usize = 128;

/// Number of partition entries in a standard table
pub const GPT_ENTRY_COUNT: u32 = 128;

/// Maximum number of entries accepted from an untrusted header
pub const GPT_MAX_ENTRIES: u32 = 1024;

/// Kernel partition type GUID `FE3A2A5D-4F32-41A7-B725-ACCC3285A309`, mixed-endian
/// as stored on disk
pub const GPT_KERNEL_TYPE_GUID: [u8; 16] = [
    0x5D, 0x2A, 0x3A, 0xFE, 0x32, 0x4F, 0xA7, 0x41, 0xB7, 0x25, 0xAC, 0xCC, 0x32, 0x85, 0xA3, 0x09,
];

/// Bit offset of the 4-bit kernel priority attribute
pub const GPT_ATTR_PRIORITY_SHIFT: u32 = 48;

/// Bit offset of the 4-bit tries-remaining attribute
pub const GPT_ATTR_TRIES_SHIFT: u32 = 52;

/// Bit offset of the successful-boot attribute
pub const GPT_ATTR_SUCCESSFUL_SHIFT: u32 = 56;

/// Largest value of the priority and tries attributes
pub const GPT_ATTR_NIBBLE_MAX: u8 = 15;

// =============================================================================
// Verification Structures
// =============================================================================

/// Key block magic
pub const KEYBLOCK_MAGIC: [u8; 8] = *b"CHROMEOS";

/// Supported key block major version
pub const KEYBLOCK_VERSION_MAJOR: u32 = 2;

/// Minimum key block minor version
pub const KEYBLOCK_VERSION_MINOR: u32 = 1;

/// Key block header size in bytes
pub const KEYBLOCK_HEADER_SIZE: usize = 112;

/// Supported kernel preamble major version
pub const PREAMBLE_VERSION_MAJOR: u32 = 2;

/// Kernel preamble header size in bytes
pub const PREAMBLE_HEADER_SIZE: usize = 96;

/// Signature descriptor size in bytes
pub const SIGNATURE_DESCRIPTOR_SIZE: usize = 24;

/// Public key descriptor size in bytes
pub const PUBLIC_KEY_DESCRIPTOR_SIZE: usize = 32;

/// Fixed RSA public exponent
pub const RSA_PUBLIC_EXPONENT: u32 = 65_537;

/// Largest key or kernel version representable in a combined version
pub const MAX_COMPONENT_VERSION: u32 = 0xFFFF;

// =============================================================================
// Rollback Spaces
// =============================================================================

/// NV index of the kernel rollback space
pub const KERNEL_NV_INDEX: u32 = 0x1008;

/// NV index of the write-locked secure rollback space
pub const SECURE_NV_INDEX: u32 = 0x1009;

/// Size of a rollback space in bytes
pub const ROLLBACK_SPACE_SIZE: usize = 13;

/// Rollback space structure version
pub const ROLLBACK_SPACE_VERSION: u8 = 2;

/// Rollback space uid ("GRWL")
pub const ROLLBACK_SPACE_UID: u32 = 0x4752_574C;

// =============================================================================
// NV Record
// =============================================================================

/// Size of the NV record blob in bytes
pub const NV_RECORD_SIZE: usize = 16;

// =============================================================================
// Security Module
// =============================================================================

/// Default per-command timeout in milliseconds
pub const DEFAULT_TPM_TIMEOUT_MS: u32 = 2_000;

/// Largest command or response frame the session exchanges
pub const TPM_MAX_FRAME: usize = 256;

/// PCR receiving the boot-mode measurement
pub const BOOT_MODE_PCR: u32 = 0;
