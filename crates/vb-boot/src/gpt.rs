// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Partition Table Reader
//!
//! Parses the GUID partition table of the boot device. The table is untrusted
//! input: every header field and every entry is validated into owned
//! structures before anything else looks at it.
//!
//! # Validation
//!
//! 1. Header signature, revision, size and CRC32
//! 2. Header geometry: own/alternate LBA, entry array placement, and a usable
//!    range clear of both entry arrays
//! 3. Entry array CRC32
//! 4. Every used entry lies inside the usable range
//! 5. No kernel entry overlaps a kernel entry of different priority
//!
//! If the primary copy fails, the backup copy at the last LBA is used instead.
//! Other overlaps do not fail the table; they are reported by
//! [`PartitionTable::overlaps`].
//!
//! # Kernel Candidates
//!
//! [`PartitionTable::next_kernel_entry`] walks kernel entries by descending
//! priority, ties broken by ascending entry index. Exhausted entries (no tries
//! left, never booted successfully) are skipped. The walk is driven by a
//! [`KernelCursor`] and is restartable: a fresh cursor over an unmodified table
//! reproduces the same sequence.

use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

use heapless::String;
use vb_common::constants::{
    GPT_ATTR_NIBBLE_MAX, GPT_ATTR_PRIORITY_SHIFT, GPT_ATTR_SUCCESSFUL_SHIFT,
    GPT_ATTR_TRIES_SHIFT, GPT_ENTRY_COUNT, GPT_ENTRY_SIZE, GPT_HEADER_SIZE,
    GPT_KERNEL_TYPE_GUID, GPT_MAX_ENTRIES, GPT_REVISION, GPT_SIGNATURE,
};
use vb_common::crc::crc32;
use vb_common::Error;
use vb_hal::{BlockDevice, HalError};

/// LBA of the primary header
pub const PRIMARY_HEADER_LBA: u64 = 1;

/// Number of overlapping entry pairs remembered for diagnostics
pub const MAX_REPORTED_OVERLAPS: usize = 8;

/// Length of the UTF-16LE partition name field in bytes
pub const NAME_FIELD_SIZE: usize = 72;

// ============================================================================
// Errors
// ============================================================================

/// Partition table error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GptError {
    /// Header or entry array shorter than declared
    TooSmall,
    /// Header signature is not "EFI PART"
    BadSignature,
    /// Unsupported header revision
    BadRevision,
    /// Header size field is not 92
    BadHeaderSize,
    /// Header CRC32 mismatch
    BadHeaderCrc,
    /// Entry array CRC32 mismatch
    BadEntriesCrc,
    /// Header LBAs inconsistent with the device
    BadHeaderGeometry,
    /// Entry size or count unsupported
    BadEntryLayout,
    /// A used entry lies outside the usable range
    EntryOutOfRange,
    /// A kernel entry overlaps a kernel entry of different priority
    KernelOverlap,
    /// No entry with that index
    EntryNotFound,
    /// Entry is not a kernel partition
    NotKernel,
    /// Device read or write failed
    Io,
}

impl GptError {
    /// Get error code for logging/debugging
    #[must_use]
    pub const fn code(&self) -> u16 {
        match self {
            Self::TooSmall => 0x0111,
            Self::BadSignature => 0x0112,
            Self::BadRevision => 0x0113,
            Self::BadHeaderSize => 0x0114,
            Self::BadHeaderCrc => 0x0115,
            Self::BadEntriesCrc => 0x0116,
            Self::BadHeaderGeometry => 0x0117,
            Self::BadEntryLayout => 0x0118,
            Self::EntryOutOfRange => 0x0119,
            Self::KernelOverlap => 0x011A,
            Self::EntryNotFound => 0x011B,
            Self::NotKernel => 0x011C,
            Self::Io => 0x011D,
        }
    }

    /// Get error description
    #[must_use]
    pub const fn description(&self) -> &'static str {
        match self {
            Self::TooSmall => "table truncated",
            Self::BadSignature => "bad header signature",
            Self::BadRevision => "unsupported header revision",
            Self::BadHeaderSize => "bad header size",
            Self::BadHeaderCrc => "header checksum mismatch",
            Self::BadEntriesCrc => "entry array checksum mismatch",
            Self::BadHeaderGeometry => "header geometry invalid",
            Self::BadEntryLayout => "unsupported entry layout",
            Self::EntryOutOfRange => "entry outside usable range",
            Self::KernelOverlap => "kernel entries overlap",
            Self::EntryNotFound => "entry not found",
            Self::NotKernel => "entry is not a kernel partition",
            Self::Io => "device I/O error",
        }
    }
}

impl fmt::Display for GptError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[0x{:04X}] {}", self.code(), self.description())
    }
}

impl From<HalError> for GptError {
    fn from(_: HalError) -> Self {
        Self::Io
    }
}

impl From<GptError> for Error {
    fn from(e: GptError) -> Self {
        match e {
            GptError::TooSmall
            | GptError::BadSignature
            | GptError::BadRevision
            | GptError::BadHeaderSize
            | GptError::BadHeaderCrc
            | GptError::BadEntriesCrc => Error::BadTableChecksum,
            GptError::BadHeaderGeometry
            | GptError::BadEntryLayout
            | GptError::EntryOutOfRange
            | GptError::KernelOverlap => Error::BadTableGeometry,
            GptError::EntryNotFound | GptError::NotKernel => Error::InvalidParameter,
            GptError::Io => Error::DeviceIo,
        }
    }
}

/// Result type for partition table operations
pub type GptResult<T> = core::result::Result<T, GptError>;

// ============================================================================
// Basic Types
// ============================================================================

/// GUID in on-disk (mixed-endian) byte order
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Guid(pub [u8; 16]);

impl Guid {
    /// All-zero GUID marking an unused entry
    pub const ZERO: Self = Self([0u8; 16]);

    /// Kernel partition type
    pub const KERNEL: Self = Self(GPT_KERNEL_TYPE_GUID);

    /// Whether every byte is zero
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:08X}-{:04X}-{:04X}-{:02X}{:02X}-",
            u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            u16::from_le_bytes([b[4], b[5]]),
            u16::from_le_bytes([b[6], b[7]]),
            b[8],
            b[9]
        )?;
        for byte in &b[10..] {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Device extent the table must fit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskGeometry {
    /// Logical sector size in bytes
    pub sector_size: u32,
    /// Number of sectors
    pub total_sectors: u64,
}

impl DiskGeometry {
    /// Geometry of a block device
    pub fn of<D: BlockDevice>(device: &D) -> Self {
        Self {
            sector_size: device.sector_size(),
            total_sectors: device.sector_count(),
        }
    }

    /// LBA of the backup header
    #[must_use]
    pub const fn last_lba(&self) -> u64 {
        self.total_sectors.saturating_sub(1)
    }

    /// Sectors needed for an entry array of `count` entries
    #[must_use]
    pub fn entry_sectors(&self, count: u32) -> u64 {
        let bytes = u64::from(count) * GPT_ENTRY_SIZE as u64;
        bytes.div_ceil(u64::from(self.sector_size.max(1)))
    }
}

fn u32_at(b: &[u8], offset: usize) -> u32 {
    let mut out = [0u8; 4];
    out.copy_from_slice(&b[offset..offset + 4]);
    u32::from_le_bytes(out)
}

fn u64_at(b: &[u8], offset: usize) -> u64 {
    let mut out = [0u8; 8];
    out.copy_from_slice(&b[offset..offset + 8]);
    u64::from_le_bytes(out)
}

fn guid_at(b: &[u8], offset: usize) -> Guid {
    let mut out = [0u8; 16];
    out.copy_from_slice(&b[offset..offset + 16]);
    Guid(out)
}

// ============================================================================
// Header
// ============================================================================

/// Validated GPT header fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GptHeader {
    /// LBA of this header
    pub my_lba: u64,
    /// LBA of the other copy
    pub alternate_lba: u64,
    /// First LBA usable by partitions
    pub first_usable_lba: u64,
    /// Last LBA usable by partitions
    pub last_usable_lba: u64,
    /// Disk GUID
    pub disk_guid: Guid,
    /// LBA of this copy's entry array
    pub entries_lba: u64,
    /// Number of entries
    pub entry_count: u32,
    /// Entry size in bytes
    pub entry_size: u32,
    /// CRC32 of the entry array
    pub entries_crc32: u32,
}

impl GptHeader {
    /// Parse and checksum a header
    ///
    /// # Errors
    ///
    /// Signature, revision, size and CRC failures.
    pub fn parse(bytes: &[u8]) -> GptResult<Self> {
        let h: &[u8; GPT_HEADER_SIZE] = bytes
            .get(..GPT_HEADER_SIZE)
            .and_then(|s| s.try_into().ok())
            .ok_or(GptError::TooSmall)?;

        if h[0..8] != GPT_SIGNATURE {
            return Err(GptError::BadSignature);
        }
        if u32_at(h, 8) != GPT_REVISION {
            return Err(GptError::BadRevision);
        }
        if u32_at(h, 12) as usize != GPT_HEADER_SIZE {
            return Err(GptError::BadHeaderSize);
        }

        let stored_crc = u32_at(h, 16);
        let mut copy = *h;
        copy[16..20].fill(0);
        if crc32(&copy) != stored_crc {
            return Err(GptError::BadHeaderCrc);
        }
        if u32_at(h, 20) != 0 {
            return Err(GptError::BadHeaderSize);
        }

        Ok(Self {
            my_lba: u64_at(h, 24),
            alternate_lba: u64_at(h, 32),
            first_usable_lba: u64_at(h, 40),
            last_usable_lba: u64_at(h, 48),
            disk_guid: guid_at(h, 56),
            entries_lba: u64_at(h, 72),
            entry_count: u32_at(h, 80),
            entry_size: u32_at(h, 84),
            entries_crc32: u32_at(h, 88),
        })
    }

    /// Encode with a fresh header CRC
    #[must_use]
    pub fn encode(&self) -> [u8; GPT_HEADER_SIZE] {
        let mut h = [0u8; GPT_HEADER_SIZE];
        h[0..8].copy_from_slice(&GPT_SIGNATURE);
        h[8..12].copy_from_slice(&GPT_REVISION.to_le_bytes());
        h[12..16].copy_from_slice(&(GPT_HEADER_SIZE as u32).to_le_bytes());
        h[24..32].copy_from_slice(&self.my_lba.to_le_bytes());
        h[32..40].copy_from_slice(&self.alternate_lba.to_le_bytes());
        h[40..48].copy_from_slice(&self.first_usable_lba.to_le_bytes());
        h[48..56].copy_from_slice(&self.last_usable_lba.to_le_bytes());
        h[56..72].copy_from_slice(&self.disk_guid.0);
        h[72..80].copy_from_slice(&self.entries_lba.to_le_bytes());
        h[80..84].copy_from_slice(&self.entry_count.to_le_bytes());
        h[84..88].copy_from_slice(&self.entry_size.to_le_bytes());
        h[88..92].copy_from_slice(&self.entries_crc32.to_le_bytes());
        let crc = crc32(&h);
        h[16..20].copy_from_slice(&crc.to_le_bytes());
        h
    }

    /// Size of the entry array in bytes
    #[must_use]
    pub const fn entries_bytes(&self) -> usize {
        self.entry_count as usize * GPT_ENTRY_SIZE
    }

    fn check_layout(&self) -> GptResult<()> {
        if self.entry_size as usize != GPT_ENTRY_SIZE
            || self.entry_count == 0
            || self.entry_count > GPT_MAX_ENTRIES
        {
            return Err(GptError::BadEntryLayout);
        }
        Ok(())
    }

    fn check_geometry(&self, geometry: &DiskGeometry, source: TableSource) -> GptResult<()> {
        let last = geometry.last_lba();
        let sectors = geometry.entry_sectors(self.entry_count);
        let entries_end = self
            .entries_lba
            .checked_add(sectors)
            .ok_or(GptError::BadHeaderGeometry)?;

        // Both entry arrays sit outside the usable range, whichever copy
        // this header describes
        let usable_start = (PRIMARY_HEADER_LBA + 1)
            .checked_add(sectors)
            .ok_or(GptError::BadHeaderGeometry)?;
        let usable_end = last
            .checked_sub(sectors)
            .ok_or(GptError::BadHeaderGeometry)?;
        if self.first_usable_lba > self.last_usable_lba
            || self.first_usable_lba < usable_start
            || self.last_usable_lba >= usable_end
        {
            return Err(GptError::BadHeaderGeometry);
        }

        let placed = match source {
            TableSource::Primary => {
                self.my_lba == PRIMARY_HEADER_LBA
                    && self.alternate_lba == last
                    && self.entries_lba > PRIMARY_HEADER_LBA
                    && entries_end <= self.first_usable_lba
            }
            TableSource::Backup => {
                self.my_lba == last
                    && self.alternate_lba == PRIMARY_HEADER_LBA
                    && self.entries_lba > self.last_usable_lba
                    && entries_end <= self.my_lba
            }
        };
        if placed {
            Ok(())
        } else {
            Err(GptError::BadHeaderGeometry)
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

/// Partition entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionEntry {
    /// Index in the entry array
    pub index: u32,
    /// Partition type
    pub type_guid: Guid,
    /// Unique partition GUID
    pub unique_guid: Guid,
    /// First sector
    pub starting_lba: u64,
    /// Last sector (inclusive)
    pub ending_lba: u64,
    /// Attribute bits; kernel entries keep priority, tries and the
    /// successful-boot flag here
    pub attributes: u64,
    /// UTF-16LE name
    pub name: [u8; NAME_FIELD_SIZE],
}

impl PartitionEntry {
    /// New entry with no name and no attributes
    #[must_use]
    pub const fn new(
        index: u32,
        type_guid: Guid,
        unique_guid: Guid,
        starting_lba: u64,
        ending_lba: u64,
    ) -> Self {
        Self {
            index,
            type_guid,
            unique_guid,
            starting_lba,
            ending_lba,
            attributes: 0,
            name: [0u8; NAME_FIELD_SIZE],
        }
    }

    /// Set priority, tries and successful-boot flag
    #[must_use]
    pub fn with_kernel_attributes(mut self, priority: u8, tries: u8, successful: bool) -> Self {
        self.set_priority(priority);
        self.set_tries(tries);
        self.set_successful(successful);
        self
    }

    /// Set an ASCII name; other characters become '?'
    #[must_use]
    pub fn with_name(mut self, name: &str) -> Self {
        self.name = [0u8; NAME_FIELD_SIZE];
        for (slot, c) in self.name.chunks_exact_mut(2).zip(name.chars()) {
            let unit = if c.is_ascii() { c as u16 } else { u16::from(b'?') };
            slot.copy_from_slice(&unit.to_le_bytes());
        }
        self
    }

    fn decode(index: u32, raw: &[u8]) -> Self {
        let mut name = [0u8; NAME_FIELD_SIZE];
        name.copy_from_slice(&raw[56..56 + NAME_FIELD_SIZE]);
        Self {
            index,
            type_guid: guid_at(raw, 0),
            unique_guid: guid_at(raw, 16),
            starting_lba: u64_at(raw, 32),
            ending_lba: u64_at(raw, 40),
            attributes: u64_at(raw, 48),
            name,
        }
    }

    fn encode_into(&self, raw: &mut [u8]) {
        raw[0..16].copy_from_slice(&self.type_guid.0);
        raw[16..32].copy_from_slice(&self.unique_guid.0);
        raw[32..40].copy_from_slice(&self.starting_lba.to_le_bytes());
        raw[40..48].copy_from_slice(&self.ending_lba.to_le_bytes());
        raw[48..56].copy_from_slice(&self.attributes.to_le_bytes());
        raw[56..56 + NAME_FIELD_SIZE].copy_from_slice(&self.name);
    }

    /// Whether the slot holds a partition
    #[must_use]
    pub fn is_used(&self) -> bool {
        !self.type_guid.is_zero()
    }

    /// Whether this is a kernel partition
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.type_guid == Guid::KERNEL
    }

    /// 1-based partition number
    #[must_use]
    pub const fn partition_number(&self) -> u32 {
        self.index + 1
    }

    /// Size in sectors
    #[must_use]
    pub const fn sector_count(&self) -> u64 {
        self.ending_lba.saturating_sub(self.starting_lba).saturating_add(1)
    }

    const fn nibble(&self, shift: u32) -> u8 {
        ((self.attributes >> shift) & 0xF) as u8
    }

    fn set_nibble(&mut self, shift: u32, value: u8) {
        let value = u64::from(value.min(GPT_ATTR_NIBBLE_MAX));
        self.attributes = (self.attributes & !(0xF << shift)) | (value << shift);
    }

    /// Boot priority (0-15)
    #[must_use]
    pub const fn priority(&self) -> u8 {
        self.nibble(GPT_ATTR_PRIORITY_SHIFT)
    }

    /// Remaining boot tries (0-15)
    #[must_use]
    pub const fn tries(&self) -> u8 {
        self.nibble(GPT_ATTR_TRIES_SHIFT)
    }

    /// Whether the kernel has booted successfully
    #[must_use]
    pub const fn successful(&self) -> bool {
        (self.attributes >> GPT_ATTR_SUCCESSFUL_SHIFT) & 1 != 0
    }

    /// Set priority, clamped to 15
    pub fn set_priority(&mut self, priority: u8) {
        self.set_nibble(GPT_ATTR_PRIORITY_SHIFT, priority);
    }

    /// Set tries, clamped to 15
    pub fn set_tries(&mut self, tries: u8) {
        self.set_nibble(GPT_ATTR_TRIES_SHIFT, tries);
    }

    /// Set the successful-boot flag
    pub fn set_successful(&mut self, successful: bool) {
        let bit = 1u64 << GPT_ATTR_SUCCESSFUL_SHIFT;
        if successful {
            self.attributes |= bit;
        } else {
            self.attributes &= !bit;
        }
    }

    /// No tries left and never booted successfully
    #[must_use]
    pub const fn is_exhausted(&self) -> bool {
        self.tries() == 0 && !self.successful()
    }

    /// Whether the sector ranges of two entries intersect
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.starting_lba <= other.ending_lba && other.starting_lba <= self.ending_lba
    }

    /// Name decoded as ASCII; other code units become '?'
    #[must_use]
    pub fn name_string(&self) -> String<36> {
        let mut out = String::new();
        for unit in self.name.chunks_exact(2) {
            let unit = u16::from_le_bytes([unit[0], unit[1]]);
            if unit == 0 {
                break;
            }
            let c = u8::try_from(unit)
                .ok()
                .filter(u8::is_ascii)
                .map_or('?', char::from);
            if out.push(c).is_err() {
                break;
            }
        }
        out
    }
}

// ============================================================================
// Table
// ============================================================================

/// Header sector and entry array of one table copy, as read from disk
#[derive(Debug, Clone, Copy)]
pub struct RawTable<'a> {
    /// Header bytes (at least 92)
    pub header: &'a [u8],
    /// Entry array bytes
    pub entries: &'a [u8],
}

/// Which copy the table was loaded from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableSource {
    /// Header at LBA 1
    Primary,
    /// Header at the last LBA
    Backup,
}

/// Requested change to a kernel entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryUpdate {
    /// Added to tries, result clamped to 0..=15
    pub tries_delta: i8,
    /// New successful-boot flag, if changing
    pub successful_boot: Option<bool>,
}

impl EntryUpdate {
    /// Consume one try
    pub const TRY: Self = Self {
        tries_delta: -1,
        successful_boot: None,
    };

    /// Set the successful-boot flag
    pub const SUCCESS: Self = Self {
        tries_delta: 0,
        successful_boot: Some(true),
    };
}

/// Position in the kernel candidate sequence
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KernelCursor {
    last: Option<u64>,
}

impl KernelCursor {
    /// Cursor at the start of the sequence
    #[must_use]
    pub const fn new() -> Self {
        Self { last: None }
    }

    /// Go back to the start
    pub fn restart(&mut self) {
        self.last = None;
    }
}

/// Descending priority, then ascending index
fn order_key(entry: &PartitionEntry) -> u64 {
    (u64::from(GPT_ATTR_NIBBLE_MAX - entry.priority()) << 32) | u64::from(entry.index)
}

/// Table copy serialized for writing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedTable {
    /// Primary header sector
    pub primary_header: Vec<u8>,
    /// Primary entry array LBA
    pub primary_entries_lba: u64,
    /// Backup header sector
    pub backup_header: Vec<u8>,
    /// Backup header LBA
    pub backup_header_lba: u64,
    /// Backup entry array LBA
    pub backup_entries_lba: u64,
    /// Entry array, padded to whole sectors
    pub entries: Vec<u8>,
}

/// Validated partition table
#[derive(Debug, Clone)]
pub struct PartitionTable {
    geometry: DiskGeometry,
    header: GptHeader,
    source: TableSource,
    backup_valid: bool,
    primary_entries_lba: u64,
    backup_entries_lba: u64,
    entries: Vec<PartitionEntry>,
    overlaps: heapless::Vec<(u32, u32), MAX_REPORTED_OVERLAPS>,
    dirty: bool,
}

fn validate_copy(
    raw: RawTable<'_>,
    geometry: &DiskGeometry,
    source: TableSource,
) -> GptResult<(GptHeader, Vec<PartitionEntry>)> {
    let header = GptHeader::parse(raw.header)?;
    header.check_layout()?;
    header.check_geometry(geometry, source)?;

    let bytes = raw
        .entries
        .get(..header.entries_bytes())
        .ok_or(GptError::TooSmall)?;
    if crc32(bytes) != header.entries_crc32 {
        return Err(GptError::BadEntriesCrc);
    }

    let mut entries = Vec::with_capacity(header.entry_count as usize);
    for (index, chunk) in (0u32..).zip(bytes.chunks_exact(GPT_ENTRY_SIZE)) {
        let entry = PartitionEntry::decode(index, chunk);
        if entry.is_used()
            && (entry.starting_lba > entry.ending_lba
                || entry.starting_lba < header.first_usable_lba
                || entry.ending_lba > header.last_usable_lba)
        {
            return Err(GptError::EntryOutOfRange);
        }
        entries.push(entry);
    }
    Ok((header, entries))
}

fn find_overlaps(
    entries: &[PartitionEntry],
) -> GptResult<heapless::Vec<(u32, u32), MAX_REPORTED_OVERLAPS>> {
    let mut found = heapless::Vec::new();
    for (i, a) in entries.iter().enumerate().filter(|(_, e)| e.is_used()) {
        for b in entries[i + 1..].iter().filter(|e| e.is_used()) {
            if !a.overlaps(b) {
                continue;
            }
            if a.is_kernel() && b.is_kernel() && a.priority() != b.priority() {
                return Err(GptError::KernelOverlap);
            }
            // Reported pairs are diagnostics only; extra ones are dropped
            let _ = found.push((a.index, b.index));
        }
    }
    Ok(found)
}

impl PartitionTable {
    /// Validate a table from its raw copies
    ///
    /// Falls back to `backup` when the primary copy fails validation.
    ///
    /// # Errors
    ///
    /// The primary copy's error if neither copy validates; `KernelOverlap` if
    /// the entries conflict.
    pub fn init(
        primary: RawTable<'_>,
        backup: Option<RawTable<'_>>,
        geometry: DiskGeometry,
    ) -> GptResult<Self> {
        if geometry.sector_size == 0 || geometry.total_sectors < 3 {
            return Err(GptError::BadHeaderGeometry);
        }

        let (header, entries, source, backup_valid) =
            match validate_copy(primary, &geometry, TableSource::Primary) {
                Ok((header, entries)) => {
                    let backup_valid = backup.is_some_and(|b| {
                        validate_copy(b, &geometry, TableSource::Backup).is_ok()
                    });
                    (header, entries, TableSource::Primary, backup_valid)
                }
                Err(primary_err) => {
                    let raw = backup.ok_or(primary_err)?;
                    let (header, entries) = validate_copy(raw, &geometry, TableSource::Backup)
                        .map_err(|_| primary_err)?;
                    (header, entries, TableSource::Backup, true)
                }
            };

        let overlaps = find_overlaps(&entries)?;
        let sectors = geometry.entry_sectors(header.entry_count);
        let (primary_entries_lba, backup_entries_lba) = match source {
            TableSource::Primary => (
                header.entries_lba,
                geometry.last_lba().saturating_sub(sectors),
            ),
            TableSource::Backup => (PRIMARY_HEADER_LBA + 1, header.entries_lba),
        };

        Ok(Self {
            geometry,
            header,
            source,
            backup_valid,
            primary_entries_lba,
            backup_entries_lba,
            entries,
            overlaps,
            dirty: false,
        })
    }

    /// Read and validate the table of a block device
    ///
    /// # Errors
    ///
    /// `Io` if the device fails; validation errors as for [`Self::init`].
    pub fn read<D: BlockDevice>(device: &mut D) -> GptResult<Self> {
        fn as_raw(copy: &Option<(Vec<u8>, Vec<u8>)>) -> Option<RawTable<'_>> {
            copy.as_ref().map(|(header, entries)| RawTable {
                header: header.as_slice(),
                entries: entries.as_slice(),
            })
        }

        let geometry = DiskGeometry::of(device);
        let primary = read_copy(device, &geometry, PRIMARY_HEADER_LBA)?;
        let backup = read_copy(device, &geometry, geometry.last_lba())?;

        let empty = RawTable {
            header: &[],
            entries: &[],
        };

        Self::init(
            as_raw(&primary).unwrap_or(empty),
            as_raw(&backup),
            geometry,
        )
    }

    /// Empty table covering a whole device
    ///
    /// # Errors
    ///
    /// `BadHeaderGeometry` if the device is too small for two entry arrays.
    pub fn create(geometry: DiskGeometry, disk_guid: Guid) -> GptResult<Self> {
        if geometry.sector_size == 0 || (geometry.sector_size as usize) < GPT_HEADER_SIZE {
            return Err(GptError::BadHeaderGeometry);
        }
        let sectors = geometry.entry_sectors(GPT_ENTRY_COUNT);
        let primary_entries_lba = PRIMARY_HEADER_LBA + 1;
        let first_usable_lba = primary_entries_lba + sectors;
        let backup_entries_lba = geometry
            .last_lba()
            .checked_sub(sectors)
            .ok_or(GptError::BadHeaderGeometry)?;
        let last_usable_lba = backup_entries_lba
            .checked_sub(1)
            .ok_or(GptError::BadHeaderGeometry)?;
        if first_usable_lba > last_usable_lba {
            return Err(GptError::BadHeaderGeometry);
        }

        let header = GptHeader {
            my_lba: PRIMARY_HEADER_LBA,
            alternate_lba: geometry.last_lba(),
            first_usable_lba,
            last_usable_lba,
            disk_guid,
            entries_lba: primary_entries_lba,
            entry_count: GPT_ENTRY_COUNT,
            entry_size: GPT_ENTRY_SIZE as u32,
            entries_crc32: 0,
        };
        let entries = (0..GPT_ENTRY_COUNT)
            .map(|i| PartitionEntry::new(i, Guid::ZERO, Guid::ZERO, 0, 0))
            .collect();

        Ok(Self {
            geometry,
            header,
            source: TableSource::Primary,
            backup_valid: false,
            primary_entries_lba,
            backup_entries_lba,
            entries,
            overlaps: heapless::Vec::new(),
            dirty: true,
        })
    }

    /// Device geometry the table was validated against
    #[must_use]
    pub const fn geometry(&self) -> DiskGeometry {
        self.geometry
    }

    /// Header of the copy in use
    #[must_use]
    pub const fn header(&self) -> &GptHeader {
        &self.header
    }

    /// Copy the table was loaded from
    #[must_use]
    pub const fn source(&self) -> TableSource {
        self.source
    }

    /// Whether the backup copy validated too
    #[must_use]
    pub const fn backup_valid(&self) -> bool {
        self.backup_valid
    }

    /// All entry slots, used or not
    #[must_use]
    pub fn entries(&self) -> &[PartitionEntry] {
        &self.entries
    }

    /// Used entries
    pub fn used_entries(&self) -> impl Iterator<Item = &PartitionEntry> {
        self.entries.iter().filter(|e| e.is_used())
    }

    /// Entry by index
    #[must_use]
    pub fn entry(&self, index: u32) -> Option<&PartitionEntry> {
        self.entries.get(index as usize)
    }

    /// Overlapping entry pairs tolerated at load time
    #[must_use]
    pub fn overlaps(&self) -> &[(u32, u32)] {
        &self.overlaps
    }

    /// Whether entries changed since load or the last write
    #[must_use]
    pub const fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Next kernel candidate after `cursor`, advancing it
    pub fn next_kernel_entry(&self, cursor: &mut KernelCursor) -> Option<&PartitionEntry> {
        let next = self
            .entries
            .iter()
            .filter(|e| e.is_kernel() && !e.is_exhausted())
            .filter(|e| cursor.last.map_or(true, |last| order_key(e) > last))
            .min_by_key(|e| order_key(e))?;
        cursor.last = Some(order_key(next));
        Some(next)
    }

    /// Kernel candidates from the start of the sequence
    #[must_use]
    pub fn kernel_entries(&self) -> KernelEntries<'_> {
        KernelEntries {
            table: self,
            cursor: KernelCursor::new(),
        }
    }

    /// Apply `update` to a kernel entry and mark the table dirty if it changed
    ///
    /// # Errors
    ///
    /// `EntryNotFound` or `NotKernel`.
    pub fn update_kernel_entry(&mut self, index: u32, update: EntryUpdate) -> GptResult<()> {
        let entry = self
            .entries
            .get_mut(index as usize)
            .ok_or(GptError::EntryNotFound)?;
        if !entry.is_kernel() {
            return Err(GptError::NotKernel);
        }

        let before = entry.attributes;
        let tries = (i16::from(entry.tries()) + i16::from(update.tries_delta))
            .clamp(0, i16::from(GPT_ATTR_NIBBLE_MAX));
        entry.set_tries(tries as u8);
        if let Some(successful) = update.successful_boot {
            entry.set_successful(successful);
        }
        if entry.attributes != before {
            self.dirty = true;
        }
        Ok(())
    }

    /// Replace an entry slot
    ///
    /// # Errors
    ///
    /// `EntryNotFound` for an index past the array, `EntryOutOfRange` or
    /// `KernelOverlap` if the entry does not fit; the table is unchanged on
    /// error.
    pub fn set_entry(&mut self, entry: PartitionEntry) -> GptResult<()> {
        let slot = entry.index as usize;
        if slot >= self.entries.len() {
            return Err(GptError::EntryNotFound);
        }
        if entry.is_used()
            && (entry.starting_lba > entry.ending_lba
                || entry.starting_lba < self.header.first_usable_lba
                || entry.ending_lba > self.header.last_usable_lba)
        {
            return Err(GptError::EntryOutOfRange);
        }

        let previous = core::mem::replace(&mut self.entries[slot], entry);
        match find_overlaps(&self.entries) {
            Ok(overlaps) => {
                self.overlaps = overlaps;
                self.dirty = true;
                Ok(())
            }
            Err(e) => {
                self.entries[slot] = previous;
                Err(e)
            }
        }
    }

    /// Encode both copies with fresh checksums
    #[must_use]
    pub fn serialize(&self) -> SerializedTable {
        let sector = self.geometry.sector_size as usize;
        let sectors = self.geometry.entry_sectors(self.header.entry_count) as usize;
        let mut entries = vec![0u8; sectors * sector];
        for (entry, raw) in self
            .entries
            .iter()
            .zip(entries.chunks_exact_mut(GPT_ENTRY_SIZE))
        {
            entry.encode_into(raw);
        }
        let entries_crc32 = crc32(&entries[..self.header.entries_bytes()]);

        let last = self.geometry.last_lba();
        let primary = GptHeader {
            my_lba: PRIMARY_HEADER_LBA,
            alternate_lba: last,
            entries_lba: self.primary_entries_lba,
            entries_crc32,
            ..self.header
        };
        let backup = GptHeader {
            my_lba: last,
            alternate_lba: PRIMARY_HEADER_LBA,
            entries_lba: self.backup_entries_lba,
            entries_crc32,
            ..self.header
        };

        let mut primary_header = vec![0u8; sector];
        primary_header[..GPT_HEADER_SIZE].copy_from_slice(&primary.encode());
        let mut backup_header = vec![0u8; sector];
        backup_header[..GPT_HEADER_SIZE].copy_from_slice(&backup.encode());

        SerializedTable {
            primary_header,
            primary_entries_lba: self.primary_entries_lba,
            backup_header,
            backup_header_lba: last,
            backup_entries_lba: self.backup_entries_lba,
            entries,
        }
    }

    /// Write both copies and clear the dirty flag
    ///
    /// # Errors
    ///
    /// `Io` if any write fails; the table stays dirty.
    pub fn write<D: BlockDevice>(&mut self, device: &mut D) -> GptResult<()> {
        let out = self.serialize();
        device.write_sectors(out.primary_entries_lba, &out.entries)?;
        device.write_sectors(PRIMARY_HEADER_LBA, &out.primary_header)?;
        device.write_sectors(out.backup_entries_lba, &out.entries)?;
        device.write_sectors(out.backup_header_lba, &out.backup_header)?;
        self.dirty = false;
        self.backup_valid = true;
        Ok(())
    }
}

/// Read one copy's header sector and entry array
///
/// A header that cannot be parsed yields `None` so the other copy can be
/// tried; device errors propagate.
fn read_copy<D: BlockDevice>(
    device: &mut D,
    geometry: &DiskGeometry,
    header_lba: u64,
) -> GptResult<Option<(Vec<u8>, Vec<u8>)>> {
    let sector = geometry.sector_size as usize;
    if sector < GPT_HEADER_SIZE {
        return Err(GptError::BadHeaderGeometry);
    }
    let mut header = vec![0u8; sector];
    device.read_sectors(header_lba, &mut header)?;

    let Ok(parsed) = GptHeader::parse(&header) else {
        return Ok(None);
    };
    if parsed.check_layout().is_err() {
        return Ok(None);
    }
    let sectors = geometry.entry_sectors(parsed.entry_count);
    match parsed.entries_lba.checked_add(sectors) {
        Some(end) if end <= geometry.total_sectors => {}
        _ => return Ok(None),
    }

    let mut entries = vec![0u8; sectors as usize * sector];
    device.read_sectors(parsed.entries_lba, &mut entries)?;
    Ok(Some((header, entries)))
}

/// Iterator over kernel candidates
pub struct KernelEntries<'a> {
    table: &'a PartitionTable,
    cursor: KernelCursor,
}

impl<'a> Iterator for KernelEntries<'a> {
    type Item = &'a PartitionEntry;

    fn next(&mut self) -> Option<Self::Item> {
        self.table.next_kernel_entry(&mut self.cursor)
    }
}
