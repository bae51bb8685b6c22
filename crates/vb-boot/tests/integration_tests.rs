// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Integration tests for vb-boot

use std::sync::OnceLock;

use vb_boot::gpt::{
    DiskGeometry, EntryUpdate, GptError, GptHeader, Guid, PartitionEntry, PartitionTable,
    PRIMARY_HEADER_LBA,
};
use vb_boot::nvstorage::{recovery, BootResult, NvContext, NvParam};
use vb_boot::rollback::{encode_space, RollbackError, RollbackProtection};
use vb_boot::selector::{
    select_and_load_kernel, BootContext, BootError, KernelSelector, SelectedKernel, SelectorState,
};
use vb_boot::vboot::keyblock::{flags, verify_key_block};
use vb_boot::vboot::signing::{
    build_kernel_partition, public_key_blob, public_key_of, KeyBlockBuilder, PreambleBuilder,
};
use vb_boot::vboot::{verify_kernel_image, PublicKey, VerifyError, VerifyStage, VersionFloor};
use vb_common::constants::{
    GPT_ENTRY_COUNT, GPT_ENTRY_SIZE, GPT_HEADER_SIZE, KERNEL_NV_INDEX, SECURE_NV_INDEX,
};
use vb_common::crc::crc32;
use vb_common::{BootConfig, BootMode, Error, LogBuffer, LogLevel};
use vb_crypto::{SignatureAlgorithm, SigningKey};
use vb_hal::mem::{MemoryDisk, MemoryNvStore};
use vb_tpm::command::{ordinal, perm};
use vb_tpm::sim::{Fault, SimulatedTpm};
use vb_tpm::TpmSession;

// ============================================================================
// Fixtures
// ============================================================================

const SECTOR: u32 = 512;
const DISK_SECTORS: u64 = 4096;
const PART_SECTORS: u64 = 256;
const NORMAL_FLAGS: u64 = flags::DEVELOPER_0 | flags::DEVELOPER_1 | flags::RECOVERY_0;

struct Keys {
    root: SigningKey,
    data: SigningKey,
    recovery: SigningKey,
}

fn keys() -> &'static Keys {
    static KEYS: OnceLock<Keys> = OnceLock::new();
    KEYS.get_or_init(|| Keys {
        root: SigningKey::generate(SignatureAlgorithm::Rsa1024Sha256).unwrap(),
        data: SigningKey::generate(SignatureAlgorithm::Rsa1024Sha256).unwrap(),
        recovery: SigningKey::generate(SignatureAlgorithm::Rsa1024Sha512).unwrap(),
    })
}

fn root_key() -> PublicKey {
    public_key_of(&keys().root, 1).unwrap()
}

fn recovery_key() -> PublicKey {
    public_key_of(&keys().recovery, 1).unwrap()
}

fn body(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

struct Image {
    keyblock: Vec<u8>,
    preamble: Vec<u8>,
    body: Vec<u8>,
}

impl Image {
    fn signed_by(signer: &SigningKey, key_version: u32, kernel_version: u32, kb_flags: u64) -> Self {
        let data_key = public_key_of(&keys().data, key_version).unwrap();
        let keyblock = KeyBlockBuilder::new(data_key, kb_flags).sign(signer).unwrap();
        let body = body(20_000);
        let preamble = PreambleBuilder::new(kernel_version)
            .with_load_address(0x10_0000)
            .with_bootloader(0x10_4000, 0x800)
            .sign(&body, &keys().data)
            .unwrap();
        Self {
            keyblock,
            preamble,
            body,
        }
    }

    fn new(key_version: u32, kernel_version: u32) -> Self {
        Self::signed_by(&keys().root, key_version, kernel_version, NORMAL_FLAGS)
    }

    fn bytes(&self) -> Vec<u8> {
        build_kernel_partition(&self.keyblock, &self.preamble, &self.body)
    }
}

struct Kernel {
    priority: u8,
    tries: u8,
    successful: bool,
    image: Vec<u8>,
}

fn kernel(priority: u8, tries: u8, successful: bool, image: Vec<u8>) -> Kernel {
    Kernel {
        priority,
        tries,
        successful,
        image,
    }
}

fn disk_with(kernels: &[Kernel]) -> MemoryDisk {
    let mut disk = MemoryDisk::new(DISK_SECTORS, SECTOR);
    let mut table = PartitionTable::create(DiskGeometry::of(&disk), Guid([7; 16])).unwrap();
    let first = table.header().first_usable_lba;
    for (i, k) in kernels.iter().enumerate() {
        let start = first + i as u64 * PART_SECTORS;
        let entry = PartitionEntry::new(
            i as u32,
            Guid::KERNEL,
            Guid([i as u8 + 1; 16]),
            start,
            start + PART_SECTORS - 1,
        )
        .with_kernel_attributes(k.priority, k.tries, k.successful)
        .with_name("KERN");
        table.set_entry(entry).unwrap();
        let offset = start as usize * SECTOR as usize;
        disk.image_mut()[offset..offset + k.image.len()].copy_from_slice(&k.image);
    }
    table.write(&mut disk).unwrap();
    disk
}

fn tpm_with(stored: Option<u32>, secure: u32) -> SimulatedTpm {
    let mut tpm = SimulatedTpm::new().with_space(
        SECURE_NV_INDEX,
        perm::WRITEDEFINE | perm::PPWRITE,
        &encode_space(secure),
    );
    if let Some(v) = stored {
        tpm = tpm.with_space(KERNEL_NV_INDEX, perm::WRITE_STCLEAR, &encode_space(v));
    }
    tpm
}

fn protection(tpm: SimulatedTpm) -> RollbackProtection<SimulatedTpm> {
    RollbackProtection::new(TpmSession::new(tpm, 100), &BootConfig::DEFAULT)
}

struct Harness {
    disk: MemoryDisk,
    rollback: RollbackProtection<SimulatedTpm>,
    nv: MemoryNvStore,
    log: LogBuffer,
    root: PublicKey,
    recovery: PublicKey,
    config: BootConfig,
}

impl Harness {
    fn new(disk: MemoryDisk, tpm: SimulatedTpm) -> Self {
        Self {
            disk,
            rollback: protection(tpm),
            nv: MemoryNvStore::new(),
            log: LogBuffer::new(),
            root: root_key(),
            recovery: recovery_key(),
            config: BootConfig::DEFAULT,
        }
    }

    fn context(&mut self, mode: BootMode) -> BootContext<'_, MemoryDisk, SimulatedTpm, MemoryNvStore> {
        BootContext {
            device: &mut self.disk,
            rollback: &mut self.rollback,
            nv_store: &mut self.nv,
            kernel_key: &self.root,
            recovery_key: Some(&self.recovery),
            mode,
            config: self.config,
            log: &mut self.log,
        }
    }

    fn boot(&mut self, mode: BootMode) -> Result<SelectedKernel, BootError> {
        select_and_load_kernel(self.context(mode))
    }

    fn tpm(&mut self) -> &mut SimulatedTpm {
        self.rollback.session_mut().transport_mut()
    }

    /// Power cycle the security module and start a new rollback session
    fn reboot(&mut self) {
        let placeholder = protection(SimulatedTpm::new());
        let old = std::mem::replace(&mut self.rollback, placeholder);
        let mut tpm = old.into_session().into_transport();
        tpm.reboot();
        self.rollback = protection(tpm);
        self.log.clear();
    }

    fn nv_record(&self) -> NvContext {
        NvContext::setup(self.nv.blob())
    }

    fn table(&mut self) -> PartitionTable {
        PartitionTable::read(&mut self.disk).unwrap()
    }

    fn stored_floor(&mut self) -> Option<u32> {
        let raw = self.tpm().space(KERNEL_NV_INDEX)?.data.clone();
        let mut bytes = [0u8; 13];
        bytes.copy_from_slice(&raw);
        vb_boot::rollback::decode_space(&bytes).ok()
    }
}

// ============================================================================
// Verification Pipeline
// ============================================================================

mod verification_tests {
    use super::*;

    #[test]
    fn test_valid_image_verifies() {
        let image = Image::new(1, 3);
        let header =
            verify_kernel_image(&image.bytes(), &root_key(), BootMode::Normal, VersionFloor::NONE)
                .unwrap();
        assert_eq!(header.preamble.kernel_version, 3);
        assert_eq!(header.preamble.body_size, image.body.len() as u64);
        assert_eq!(header.preamble.body_load_address, 0x10_0000);
        assert_eq!(
            header.body_offset(),
            (image.keyblock.len() + image.preamble.len()) as u64
        );
        assert_eq!(header.combined_version(), 0x0001_0003);
    }

    #[test]
    fn test_every_keyblock_signature_bit_flip_fails() {
        let image = Image::new(1, 1);
        let sig_len = SignatureAlgorithm::Rsa1024Sha256.signature_size();
        let sig_start = image.keyblock.len() - sig_len;
        let root = root_key();

        for byte in sig_start..image.keyblock.len() {
            for bit in 0..8 {
                let mut kb = image.keyblock.clone();
                kb[byte] ^= 1 << bit;
                assert_eq!(
                    verify_key_block(&kb, &root, BootMode::Normal, 0).unwrap_err(),
                    VerifyError::BadSignature(VerifyStage::KeyBlock),
                    "byte {byte} bit {bit}"
                );
            }
        }
    }

    #[test]
    fn test_keyblock_signed_by_other_key_fails() {
        let image = Image::signed_by(&keys().recovery, 1, 1, NORMAL_FLAGS);
        assert_eq!(
            verify_key_block(&image.keyblock, &root_key(), BootMode::Normal, 0).unwrap_err(),
            VerifyError::BadSignature(VerifyStage::KeyBlock)
        );
    }

    #[test]
    fn test_keyblock_checksum_mismatch() {
        let mut kb = Image::new(1, 1).keyblock;
        let sig_len = SignatureAlgorithm::Rsa1024Sha256.signature_size();
        let checksum_byte = kb.len() - sig_len - 1;
        kb[checksum_byte] ^= 0x80;
        assert_eq!(
            verify_key_block(&kb, &root_key(), BootMode::Normal, 0).unwrap_err(),
            VerifyError::KeyBlockChecksum
        );
    }

    #[test]
    fn test_keyblock_flags_per_mode() {
        let dev_only = Image::signed_by(
            &keys().root,
            1,
            1,
            flags::DEVELOPER_1 | flags::RECOVERY_0,
        );
        let root = root_key();
        assert_eq!(
            verify_key_block(&dev_only.keyblock, &root, BootMode::Normal, 0).unwrap_err(),
            VerifyError::FlagsMismatch
        );
        assert!(verify_key_block(&dev_only.keyblock, &root, BootMode::Developer, 0).is_ok());
    }

    #[test]
    fn test_key_version_floor() {
        let kb = Image::new(2, 1).keyblock;
        let root = root_key();
        assert!(verify_key_block(&kb, &root, BootMode::Normal, 2).is_ok());
        assert_eq!(
            verify_key_block(&kb, &root, BootMode::Normal, 3).unwrap_err(),
            VerifyError::KeyVersionRollback
        );
    }

    #[test]
    fn test_kernel_version_floor_only_in_normal_mode() {
        let bytes = Image::new(1, 4).bytes();
        let floor = VersionFloor::new(VersionFloor::combine(1, 5));
        let root = root_key();
        assert_eq!(
            verify_kernel_image(&bytes, &root, BootMode::Normal, floor).unwrap_err(),
            VerifyError::KernelVersionRollback
        );
        assert!(verify_kernel_image(&bytes, &root, BootMode::Developer, floor).is_ok());

        // A newer key resets the kernel floor
        let newer_key = Image::new(2, 1).bytes();
        assert!(verify_kernel_image(&newer_key, &root, BootMode::Normal, floor).is_ok());
    }

    #[test]
    fn test_corrupted_preamble_signature() {
        let image = Image::new(1, 1);
        let mut bytes = image.bytes();
        let last = image.keyblock.len() + image.preamble.len() - 1;
        bytes[last] ^= 0x01;
        assert_eq!(
            verify_kernel_image(&bytes, &root_key(), BootMode::Normal, VersionFloor::NONE)
                .unwrap_err(),
            VerifyError::BadSignature(VerifyStage::Preamble)
        );
    }

    #[test]
    fn test_body_tamper_detected() {
        let image = Image::new(1, 1);
        let mut bytes = image.bytes();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x40;
        assert_eq!(
            verify_kernel_image(&bytes, &root_key(), BootMode::Normal, VersionFloor::NONE)
                .unwrap_err(),
            VerifyError::BodyHashMismatch
        );
    }

    #[test]
    fn test_truncated_body_is_size_mismatch() {
        let mut bytes = Image::new(1, 1).bytes();
        bytes.truncate(bytes.len() - 100);
        assert_eq!(
            verify_kernel_image(&bytes, &root_key(), BootMode::Normal, VersionFloor::NONE)
                .unwrap_err(),
            VerifyError::SizeMismatch
        );
    }

    #[test]
    fn test_public_key_blob() {
        let blob = public_key_blob(&keys().root, 3).unwrap();
        let key = PublicKey::from_blob(&blob).unwrap();
        assert_eq!(key.key_version(), 3);
        assert_eq!(key.algorithm(), SignatureAlgorithm::Rsa1024Sha256);

        assert_eq!(
            PublicKey::from_blob(&blob[..blob.len() - 1]).unwrap_err(),
            VerifyError::KeyFormat
        );
    }

    #[test]
    fn test_sha1_key_rejected() {
        let mut blob = public_key_blob(&keys().root, 1).unwrap();
        let sha1 = SignatureAlgorithm::Rsa1024Sha1.id();
        blob[16..24].copy_from_slice(&sha1.to_le_bytes());
        assert_eq!(
            PublicKey::from_blob(&blob).unwrap_err(),
            VerifyError::UnsupportedAlgorithm
        );

        blob[16..24].copy_from_slice(&99u64.to_le_bytes());
        assert_eq!(
            PublicKey::from_blob(&blob).unwrap_err(),
            VerifyError::KeyFormat
        );
    }
}

// ============================================================================
// Kernel Selector
// ============================================================================

mod selector_tests {
    use super::*;

    #[test]
    fn test_stale_high_priority_kernel_skipped() {
        let disk = disk_with(&[
            kernel(4, 3, false, Image::new(1, 3).bytes()),
            kernel(2, 3, false, Image::new(1, 6).bytes()),
        ]);
        let mut h = Harness::new(disk, tpm_with(Some(VersionFloor::combine(1, 5)), 0));

        let selected = h.boot(BootMode::Normal).unwrap();
        assert_eq!(selected.partition_number, 2);
        assert_eq!(selected.kernel_version, 6);
        assert_eq!(selected.body_load_address, 0x10_0000);
        assert!(h.log.contains(LogLevel::Warn, "partition 1 rejected at preamble"));

        let table = h.table();
        assert_eq!(table.entry(0).unwrap().tries(), 2);
        assert!(!table.entry(0).unwrap().successful());
        assert_eq!(table.entry(1).unwrap().tries(), 2);
        assert!(table.entry(1).unwrap().successful());

        let nv = h.nv_record();
        assert_eq!(nv.boot_result(), BootResult::Trying);
        assert_eq!(nv.get(NvParam::KernelPartition), 2);
    }

    #[test]
    fn test_corrupted_preamble_is_fatal() {
        let image = Image::new(1, 1);
        let mut bytes = image.bytes();
        bytes[image.keyblock.len() + image.preamble.len() - 1] ^= 0xFF;
        let disk = disk_with(&[kernel(1, 5, false, bytes)]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));

        let mut selector = KernelSelector::new(h.context(BootMode::Normal));
        let mut states = vec![selector.state()];
        while !selector.step() {
            states.push(selector.state());
        }
        states.push(selector.state());
        assert_eq!(
            states,
            vec![
                SelectorState::Start,
                SelectorState::Scanning,
                SelectorState::Verifying { index: 0 },
                SelectorState::Rejected {
                    index: 0,
                    reason: Error::BadSignature
                },
                SelectorState::Scanning,
                SelectorState::Fatal(Error::NoValidKernel),
            ]
        );
        assert_eq!(
            selector.into_result().unwrap_err(),
            BootError::NoValidKernel { examined: 1 }
        );
        assert!(h.log.contains(LogLevel::Warn, "rejected at preamble"));
        assert_eq!(
            h.nv_record().get(NvParam::RecoveryRequest),
            u32::from(recovery::INVALID_OS)
        );
        // The consumed try is persisted
        assert_eq!(h.table().entry(0).unwrap().tries(), 4);
    }

    #[test]
    fn test_module_timeout_blocks_valid_kernel() {
        let disk = disk_with(&[kernel(1, 5, false, Image::new(1, 1).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));
        h.tpm().fail_ordinal(Some(ordinal::NV_READ_VALUE), Fault::Timeout);
        let writes = h.disk.write_count();

        assert_eq!(
            h.boot(BootMode::Normal).unwrap_err(),
            BootError::Infrastructure(Error::ModuleUnavailable)
        );
        assert_eq!(h.disk.write_count(), writes);
        assert_eq!(
            h.nv_record().get(NvParam::RecoveryRequest),
            u32::from(recovery::TPM_ERROR)
        );
    }

    #[test]
    fn test_corrupt_rollback_space_is_fatal() {
        let disk = disk_with(&[kernel(1, 5, false, Image::new(1, 1).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));
        h.tpm().space_mut(KERNEL_NV_INDEX).unwrap().data[6] ^= 0x10;
        assert_eq!(
            h.boot(BootMode::Normal).unwrap_err(),
            BootError::Infrastructure(Error::ModuleCorrupt)
        );
    }

    #[test]
    fn test_recovery_boot_without_module() {
        let image = Image::signed_by(&keys().recovery, 1, 1, flags::ALL);
        let disk = disk_with(&[kernel(1, 5, false, image.bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));
        h.tpm().fail_ordinal(None, Fault::Timeout);
        let writes = h.disk.write_count();

        let selected = h.boot(BootMode::Recovery).unwrap();
        assert_eq!(selected.partition_number, 1);
        assert!(!selected.floor_raised);
        assert_eq!(h.disk.write_count(), writes);
        assert!(h.log.contains(LogLevel::Warn, "skipped in recovery"));
    }

    #[test]
    fn test_recovery_rejects_normal_kernel() {
        let disk = disk_with(&[kernel(1, 5, false, Image::new(1, 1).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));
        assert_eq!(
            h.boot(BootMode::Recovery).unwrap_err(),
            BootError::NoValidKernel { examined: 1 }
        );
    }

    #[test]
    fn test_first_boot_defines_and_locks_space() {
        let disk = disk_with(&[kernel(1, 5, false, Image::new(1, 1).bytes())]);
        let mut h = Harness::new(disk, tpm_with(None, 0));

        h.boot(BootMode::Normal).unwrap();
        let space = h.tpm().space(KERNEL_NV_INDEX).unwrap().clone();
        assert!(space.write_locked);
        assert_eq!(h.stored_floor(), Some(0));
        assert_eq!(h.rollback.write(5), Err(RollbackError::Locked));
    }

    #[test]
    fn test_boot_mode_measured() {
        let disk = disk_with(&[kernel(1, 5, false, Image::new(1, 1).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));
        h.boot(BootMode::Normal).unwrap();
        assert_ne!(h.tpm().pcr(0), Some([0u8; 20]));
    }

    #[test]
    fn test_floor_raised_after_confirmed_boot() {
        let disk = disk_with(&[kernel(1, 5, false, Image::new(1, 3).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(VersionFloor::combine(1, 1)), 0));

        let first = h.boot(BootMode::Normal).unwrap();
        assert!(!first.floor_raised);
        assert_eq!(h.stored_floor(), Some(0x0001_0001));

        // Second boot without the OS confirming: floor unchanged
        h.reboot();
        let second = h.boot(BootMode::Normal).unwrap();
        assert!(!second.floor_raised);

        // The OS reports a good boot of partition 1
        let mut nv = h.nv_record();
        nv.set_boot_result(BootResult::Success);
        nv.commit(&mut h.nv).unwrap();

        h.reboot();
        let third = h.boot(BootMode::Normal).unwrap();
        assert!(third.floor_raised);
        assert_eq!(h.stored_floor(), Some(0x0001_0003));
    }

    #[test]
    fn test_developer_mode_never_raises_floor() {
        let disk = disk_with(&[kernel(1, 5, true, Image::new(1, 3).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(VersionFloor::combine(1, 5)), 0));
        let mut nv = NvContext::defaults();
        nv.set_boot_result(BootResult::Success);
        nv.set(NvParam::KernelPartition, 1);
        nv.commit(&mut h.nv).unwrap();

        let selected = h.boot(BootMode::Developer).unwrap();
        assert!(!selected.floor_raised);
        assert_eq!(h.stored_floor(), Some(0x0001_0005));
    }

    #[test]
    fn test_secure_floor_applies() {
        let disk = disk_with(&[kernel(1, 5, false, Image::new(1, 3).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(0), VersionFloor::combine(1, 4)));
        assert_eq!(
            h.boot(BootMode::Normal).unwrap_err(),
            BootError::NoValidKernel { examined: 1 }
        );
    }

    #[test]
    fn test_exhausted_entries_are_not_candidates() {
        let disk = disk_with(&[kernel(3, 0, false, Image::new(1, 1).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));
        assert_eq!(
            h.boot(BootMode::Normal).unwrap_err(),
            BootError::NoValidKernel { examined: 0 }
        );
        assert_eq!(
            h.nv_record().get(NvParam::RecoveryRequest),
            u32::from(recovery::NO_KERNEL)
        );
    }

    #[test]
    fn test_small_header_read_streams_body() {
        let disk = disk_with(&[kernel(1, 5, false, Image::new(1, 1).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));
        h.config = BootConfig::DEFAULT.with_header_read_size(1024);
        let selected = h.boot(BootMode::Normal).unwrap();
        assert_eq!(selected.body_size, 20_000);
    }

    #[test]
    fn test_backup_table_used_when_primary_corrupt() {
        let disk = disk_with(&[kernel(1, 5, false, Image::new(1, 1).bytes())]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));
        // Corrupt the primary header's usable range
        h.disk.image_mut()[SECTOR as usize + 40] ^= 0xFF;

        let selected = h.boot(BootMode::Normal).unwrap();
        assert_eq!(selected.partition_number, 1);
        assert!(h.log.contains(LogLevel::Warn, "using backup"));
    }

    #[test]
    fn test_garbage_table_is_no_kernel() {
        let mut h = Harness::new(MemoryDisk::new(DISK_SECTORS, SECTOR), tpm_with(Some(0), 0));
        assert_eq!(
            h.boot(BootMode::Normal).unwrap_err(),
            BootError::NoValidKernel { examined: 0 }
        );
    }

    #[test]
    fn test_candidate_limit() {
        let disk = disk_with(&[
            kernel(3, 5, false, Image::new(1, 1).bytes()),
            kernel(2, 5, false, Image::new(1, 1).bytes()),
        ]);
        let mut h = Harness::new(disk, tpm_with(Some(0), 0));
        h.disk.image_mut()[(34 * SECTOR) as usize] ^= 0xFF;
        h.config = BootConfig::DEFAULT.with_max_candidates(1);
        assert_eq!(
            h.boot(BootMode::Normal).unwrap_err(),
            BootError::NoValidKernel { examined: 1 }
        );
    }
}

// ============================================================================
// Rollback Protection
// ============================================================================

mod rollback_tests {
    use super::*;

    #[test]
    fn test_write_against_secure_floor() {
        for secure in 0..8u32 {
            for new in 0..8u32 {
                let mut rollback = protection(tpm_with(None, secure));
                let result = rollback.write(new);
                if new < secure {
                    assert_eq!(result, Err(RollbackError::Violation), "new {new} secure {secure}");
                } else {
                    assert_eq!(result, Ok(()), "new {new} secure {secure}");
                    assert_eq!(rollback.read().unwrap().stored, new);
                }
            }
        }
    }

    #[test]
    fn test_stored_floor_never_decreases() {
        let mut rollback = protection(tpm_with(Some(5), 0));
        assert_eq!(rollback.write(4), Err(RollbackError::Violation));
        assert_eq!(rollback.write(5), Ok(()));
        assert_eq!(rollback.write(6), Ok(()));
        assert_eq!(rollback.read().unwrap().stored, 6);
    }

    #[test]
    fn test_bootstrap_state() {
        let mut rollback = protection(tpm_with(None, 3));
        let state = rollback.read().unwrap();
        assert!(state.bootstrap);
        assert_eq!(state.stored, 0);
        assert_eq!(state.floor().combined, 3);

        rollback.write(3).unwrap();
        assert!(!rollback.read().unwrap().bootstrap);
    }

    #[test]
    fn test_read_timeout_is_unavailable() {
        let mut tpm = tpm_with(Some(1), 0);
        tpm.fail_ordinal(Some(ordinal::NV_READ_VALUE), Fault::Timeout);
        let err = protection(tpm).read().unwrap_err();
        assert_eq!(Error::from(err), Error::ModuleUnavailable);
    }

    #[test]
    fn test_corrupt_space() {
        let mut tpm = tpm_with(Some(1), 0);
        tpm.space_mut(KERNEL_NV_INDEX).unwrap().data[12] ^= 0xFF;
        let err = protection(tpm).read().unwrap_err();
        assert_eq!(err, RollbackError::Corrupt);
        assert_eq!(Error::from(err), Error::ModuleCorrupt);
    }

    #[test]
    fn test_lock_for_boot() {
        let mut rollback = protection(tpm_with(Some(1), 0));
        rollback.lock_for_boot().unwrap();
        rollback.lock_for_boot().unwrap();
        assert!(rollback.is_locked());
        assert_eq!(rollback.write(2), Err(RollbackError::Locked));

        let mut tpm = rollback.into_session().into_transport();
        assert!(tpm.space(KERNEL_NV_INDEX).unwrap().write_locked);
        tpm.reboot();
        let mut rollback = protection(tpm);
        assert_eq!(rollback.write(2), Ok(()));
    }

    #[test]
    fn test_lock_requires_boot_lockable_space() {
        let tpm = SimulatedTpm::new().with_space(KERNEL_NV_INDEX, 0, &encode_space(1));
        assert_eq!(protection(tpm).lock_for_boot(), Err(RollbackError::Corrupt));
    }
}

// ============================================================================
// NV Record
// ============================================================================

mod nv_tests {
    use super::*;

    #[test]
    fn test_record_survives_storage() {
        let mut ctx = NvContext::defaults();
        ctx.set_boot_result(BootResult::Success);
        ctx.set(NvParam::TryCount, 6);
        ctx.set(NvParam::RecoveryRequest, u32::from(recovery::NO_KERNEL));
        ctx.set(NvParam::KernelPartition, 4);
        ctx.set(NvParam::KernelField, 0xDEAD_BEEF);
        ctx.set(NvParam::DevBootUsb, 1);

        let mut store = MemoryNvStore::new();
        assert_eq!(ctx.commit(&mut store), Ok(true));
        assert_eq!(ctx.commit(&mut store), Ok(false));
        assert_eq!(store.store_count(), 1);

        let back = NvContext::load(&mut store);
        assert!(!back.was_regenerated());
        for param in NvParam::ALL {
            assert_eq!(back.get(param), ctx.get(param), "{}", param.name());
        }
    }

    #[test]
    fn test_any_single_bit_error_gives_defaults() {
        let mut ctx = NvContext::defaults();
        ctx.set(NvParam::KernelField, 0x1234_5678);
        ctx.set(NvParam::LocalizationIndex, 9);
        let blob = ctx.to_bytes();

        for byte in 0..blob.len() {
            for bit in 0..8 {
                let mut corrupt = blob;
                corrupt[byte] ^= 1 << bit;
                let decoded = NvContext::setup(&corrupt);
                assert!(decoded.was_regenerated(), "byte {byte} bit {bit}");
                assert_eq!(decoded.get(NvParam::KernelField), 0);
                assert_eq!(decoded.get(NvParam::KernelSettingsReset), 1);
            }
        }
    }
}

// ============================================================================
// Partition Table
// ============================================================================

mod gpt_tests {
    use super::*;

    fn ordered_disk() -> MemoryDisk {
        disk_with(&[
            kernel(1, 5, false, Vec::new()),
            kernel(3, 5, false, Vec::new()),
            kernel(0, 5, true, Vec::new()),
            kernel(3, 0, false, Vec::new()),
            kernel(3, 2, true, Vec::new()),
            kernel(2, 1, false, Vec::new()),
        ])
    }

    #[test]
    fn test_candidates_ordered_and_restartable() {
        let mut disk = ordered_disk();
        let table = PartitionTable::read(&mut disk).unwrap();
        let order: Vec<u32> = table.kernel_entries().map(|e| e.index).collect();
        assert_eq!(order, vec![1, 4, 5, 0, 2]);

        let priorities: Vec<u8> = table.kernel_entries().map(|e| e.priority()).collect();
        assert!(priorities.windows(2).all(|w| w[0] >= w[1]));

        let again: Vec<u32> = table.kernel_entries().map(|e| e.index).collect();
        assert_eq!(again, order);
    }

    #[test]
    fn test_tries_update_keeps_order() {
        let mut disk = ordered_disk();
        let mut table = PartitionTable::read(&mut disk).unwrap();
        let before: Vec<u32> = table.kernel_entries().map(|e| e.index).collect();

        table.update_kernel_entry(1, EntryUpdate::TRY).unwrap();
        assert!(table.is_dirty());
        let after: Vec<u32> = table.kernel_entries().map(|e| e.index).collect();
        assert_eq!(after, before);

        // Consuming the last try exhausts the entry
        table.update_kernel_entry(5, EntryUpdate::TRY).unwrap();
        let exhausted: Vec<u32> = table.kernel_entries().map(|e| e.index).collect();
        assert_eq!(exhausted, vec![1, 4, 0, 2]);
    }

    #[test]
    fn test_written_table_reads_back() {
        let mut disk = ordered_disk();
        let mut table = PartitionTable::read(&mut disk).unwrap();
        table.update_kernel_entry(0, EntryUpdate::SUCCESS).unwrap();
        table.write(&mut disk).unwrap();
        assert!(!table.is_dirty());

        let back = PartitionTable::read(&mut disk).unwrap();
        assert!(back.entry(0).unwrap().successful());
        assert_eq!(back.entry(0).unwrap().name_string().as_str(), "KERN");
    }

    const SMALL_DISK: u64 = 2048;

    fn sector(disk: &mut MemoryDisk, lba: u64) -> &mut [u8] {
        let at = lba as usize * SECTOR as usize;
        &mut disk.image_mut()[at..at + SECTOR as usize]
    }

    fn set_range(entries: &mut [u8], index: usize, start: u64, end: u64) {
        let at = index * GPT_ENTRY_SIZE;
        entries[at + 32..at + 40].copy_from_slice(&start.to_le_bytes());
        entries[at + 40..at + 48].copy_from_slice(&end.to_le_bytes());
    }

    fn reheader(raw: &mut [u8], edit: impl FnOnce(&mut GptHeader)) {
        let mut header = GptHeader::parse(raw).unwrap();
        edit(&mut header);
        raw[..GPT_HEADER_SIZE].copy_from_slice(&header.encode());
    }

    /// Small disk holding one kernel entry, with the entry array laid out by
    /// hand and `edit` applied to the copy at `header_lba`
    fn hand_built(
        header_lba: u64,
        entries_lba: u64,
        start: u64,
        end: u64,
        edit: impl FnOnce(&mut GptHeader),
    ) -> MemoryDisk {
        let mut disk = MemoryDisk::new(SMALL_DISK, SECTOR);
        let mut table = PartitionTable::create(DiskGeometry::of(&disk), Guid([7; 16])).unwrap();
        let first = table.header().first_usable_lba;
        let entry = PartitionEntry::new(0, Guid::KERNEL, Guid([1; 16]), first, first + 63)
            .with_kernel_attributes(2, 3, false);
        table.set_entry(entry).unwrap();
        table.write(&mut disk).unwrap();

        let bytes = table.header().entries_bytes();
        let mut out = table.serialize();
        set_range(&mut out.entries, 0, start, end);
        let crc = crc32(&out.entries[..bytes]);
        let at = entries_lba as usize * SECTOR as usize;
        disk.image_mut()[at..at + out.entries.len()].copy_from_slice(&out.entries);
        reheader(sector(&mut disk, header_lba), |h| {
            h.entries_crc32 = crc;
            edit(h);
        });
        disk
    }

    #[test]
    fn test_usable_range_clear_of_backup_entries() {
        let last = SMALL_DISK - 1;
        let mut disk = hand_built(
            PRIMARY_HEADER_LBA,
            PRIMARY_HEADER_LBA + 1,
            2000,
            last - 1,
            |h| h.last_usable_lba = last - 1,
        );
        // Backup copy is gone, so only the primary is in play
        sector(&mut disk, last).fill(0);
        sector(&mut disk, 2020).fill(0xAB);
        let image = disk.image().to_vec();

        let err = PartitionTable::read(&mut disk).unwrap_err();
        assert_eq!(err, GptError::BadHeaderGeometry);
        assert_eq!(Error::from(err), Error::BadTableGeometry);
        assert_eq!(disk.image(), image.as_slice());
    }

    #[test]
    fn test_backup_usable_range_clear_of_primary_entries() {
        let last = SMALL_DISK - 1;
        let geometry = DiskGeometry {
            sector_size: SECTOR,
            total_sectors: SMALL_DISK,
        };
        let backup_entries = last - geometry.entry_sectors(GPT_ENTRY_COUNT);
        let mut disk = hand_built(last, backup_entries, PRIMARY_HEADER_LBA + 1, 60, |h| {
            h.first_usable_lba = PRIMARY_HEADER_LBA + 1;
        });
        sector(&mut disk, PRIMARY_HEADER_LBA)[16] ^= 1;
        sector(&mut disk, 10).fill(0xAB);
        let image = disk.image().to_vec();

        let err = PartitionTable::read(&mut disk).unwrap_err();
        assert_eq!(err, GptError::BadHeaderCrc);
        assert_eq!(disk.image(), image.as_slice());
    }

    #[test]
    fn test_kernel_overlap_on_disk_rejected() {
        let mut disk = disk_with(&[
            kernel(2, 3, false, Vec::new()),
            kernel(1, 3, false, Vec::new()),
        ]);
        let table = PartitionTable::read(&mut disk).unwrap();
        let first = table.header().first_usable_lba;
        let bytes = table.header().entries_bytes();
        assert!(table.overlaps().is_empty());

        let mut out = table.serialize();
        set_range(&mut out.entries, 1, first + 10, first + PART_SECTORS + 10);
        let crc = crc32(&out.entries[..bytes]);
        let at = out.primary_entries_lba as usize * SECTOR as usize;
        disk.image_mut()[at..at + out.entries.len()].copy_from_slice(&out.entries);
        reheader(sector(&mut disk, PRIMARY_HEADER_LBA), |h| h.entries_crc32 = crc);
        sector(&mut disk, out.backup_header_lba).fill(0);

        let err = PartitionTable::read(&mut disk).unwrap_err();
        assert_eq!(err, GptError::KernelOverlap);
        assert_eq!(Error::from(err), Error::BadTableGeometry);

        // Same layout at equal priority loads, with the pair reported
        let mut out = table.serialize();
        set_range(&mut out.entries, 1, first + 10, first + PART_SECTORS + 10);
        let mut entry = table.entry(1).unwrap().clone();
        entry.set_priority(2);
        let at = GPT_ENTRY_SIZE + 48;
        out.entries[at..at + 8].copy_from_slice(&entry.attributes.to_le_bytes());
        let crc = crc32(&out.entries[..bytes]);
        let at = out.primary_entries_lba as usize * SECTOR as usize;
        disk.image_mut()[at..at + out.entries.len()].copy_from_slice(&out.entries);
        reheader(sector(&mut disk, PRIMARY_HEADER_LBA), |h| h.entries_crc32 = crc);

        let back = PartitionTable::read(&mut disk).unwrap();
        assert_eq!(back.overlaps(), &[(0, 1)]);
        assert_eq!(back.kernel_entries().count(), 2);
    }

    #[test]
    fn test_entry_out_of_range_on_disk() {
        let last = SMALL_DISK - 1;
        for (start, end) in [(1, 60), (100, 90), (1990, last - 1)] {
            let mut disk =
                hand_built(PRIMARY_HEADER_LBA, PRIMARY_HEADER_LBA + 1, start, end, |_| {});
            sector(&mut disk, last).fill(0);
            let err = PartitionTable::read(&mut disk).unwrap_err();
            assert_eq!(err, GptError::EntryOutOfRange, "entry {start}..={end}");
        }
    }
}
