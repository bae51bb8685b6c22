// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Subcommand implementations

use std::fmt;
use std::path::Path;

use anyhow::Context as _;
use vb_boot::gpt::{PartitionTable, TableSource};
use vb_boot::nvstorage::{NvContext, NvParam};
use vb_boot::rollback::{encode_space, RollbackProtection};
use vb_boot::selector::{select_and_load_kernel, BootContext};
use vb_boot::vboot::keyblock::verify_key_block;
use vb_boot::vboot::signing::{
    build_kernel_partition, public_key_blob, public_key_of, KeyBlockBuilder, PreambleBuilder,
};
use vb_boot::vboot::{verify_kernel_image, PublicKey, VersionFloor};
use vb_common::constants::{KERNEL_NV_INDEX, SECURE_NV_INDEX};
use vb_common::log::LogEntry;
use vb_common::{BootConfig, LogBuffer, LogLevel};
use vb_crypto::{HashAlgorithm, SignatureAlgorithm, SigningKey};
use vb_hal::mem::{MemoryDisk, MemoryNvStore};
use vb_tpm::command::perm;
use vb_tpm::sim::SimulatedTpm;
use vb_tpm::TpmSession;

use crate::{SelectArgs, SignArgs, TrustArgs};

/// Attach a description to errors that only implement `Display`
trait Described<T> {
    fn described(self, what: impl FnOnce() -> String) -> anyhow::Result<T>;
}

impl<T, E: fmt::Display> Described<T> for Result<T, E> {
    fn described(self, what: impl FnOnce() -> String) -> anyhow::Result<T> {
        self.map_err(|e| anyhow::anyhow!("{}: {e}", what()))
    }
}

fn read(path: &Path) -> anyhow::Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("Could not read {}", path.display()))
}

fn write(path: &Path, data: &[u8]) -> anyhow::Result<()> {
    std::fs::write(path, data).with_context(|| format!("Could not write {}", path.display()))
}

fn load_pubkey(path: &Path) -> anyhow::Result<PublicKey> {
    let blob = read(path)?;
    PublicKey::from_blob(&blob).described(|| format!("Invalid public key {}", path.display()))
}

fn load_signer(path: &Path, algorithm: u64) -> anyhow::Result<SigningKey> {
    let algorithm = SignatureAlgorithm::from_id(algorithm)
        .described(|| format!("Unknown algorithm {algorithm}"))?;
    let pem = std::fs::read_to_string(path)
        .with_context(|| format!("Could not read {}", path.display()))?;
    SigningKey::from_pem(algorithm, &pem)
        .described(|| format!("Invalid private key {}", path.display()))
}

fn key_digest(key: &PublicKey) -> anyhow::Result<String> {
    let packed = key.packed().described(|| String::from("Could not pack key"))?;
    let digest = HashAlgorithm::Sha256
        .digest(&packed)
        .context("SHA-256 unavailable")?;
    Ok(hex::encode(digest.as_ref()))
}

fn describe_key(label: &str, key: &PublicKey) -> anyhow::Result<()> {
    println!("{label}:");
    println!("  algorithm:   {} ({:?})", key.algorithm().id(), key.algorithm());
    println!("  key version: {}", key.key_version());
    println!("  sha256:      {}", key_digest(key)?);
    Ok(())
}

// ============================================================================
// Inspection
// ============================================================================

pub fn show_gpt(disk: &Path, sector_size: u32) -> anyhow::Result<()> {
    let mut device = MemoryDisk::from_image(read(disk)?, sector_size);
    let table = PartitionTable::read(&mut device)
        .described(|| format!("No valid partition table in {}", disk.display()))?;

    let header = table.header();
    println!("disk guid:  {}", header.disk_guid);
    println!(
        "usable:     {}..={}",
        header.first_usable_lba, header.last_usable_lba
    );
    println!(
        "entries:    {} x {} bytes at lba {}",
        header.entry_count, header.entry_size, header.entries_lba
    );
    if table.source() == TableSource::Backup {
        println!("primary header invalid, loaded from backup");
    } else if !table.backup_valid() {
        println!("backup header invalid");
    }

    println!();
    println!("{:>4} {:>10} {:>10}  {:<8} {}", "part", "start", "size", "attrs", "name");
    for entry in table.used_entries() {
        let attrs = if entry.is_kernel() {
            format!(
                "P{} T{} S{}",
                entry.priority(),
                entry.tries(),
                u8::from(entry.successful())
            )
        } else {
            String::from("-")
        };
        println!(
            "{:>4} {:>10} {:>10}  {:<8} {}",
            entry.partition_number(),
            entry.starting_lba,
            entry.sector_count(),
            attrs,
            entry.name_string()
        );
        if !entry.is_kernel() {
            println!("{:>27}{}", "type ", entry.type_guid);
        }
    }

    let order: Vec<String> = table
        .kernel_entries()
        .map(|e| e.partition_number().to_string())
        .collect();
    println!();
    println!("kernel candidates: [{}]", order.join(", "));
    for (a, b) in table.overlaps() {
        println!("warning: entries {} and {} overlap", a + 1, b + 1);
    }
    Ok(())
}

pub fn verify_pubkey(path: &Path) -> anyhow::Result<()> {
    let key = load_pubkey(path)?;
    describe_key("public key", &key)
}

pub fn verify_keyblock(path: &Path, trust: &TrustArgs, min_key_version: u32) -> anyhow::Result<()> {
    let data = read(path)?;
    let trusted = load_pubkey(&trust.signpubkey)?;
    let verified = verify_key_block(&data, &trusted, trust.mode.into(), min_key_version)
        .described(|| format!("Key block {} rejected", path.display()))?;

    println!("key block:");
    println!("  size:        {}", verified.size);
    println!("  flags:       0x{:X}", verified.flags);
    describe_key("data key", &verified.data_key)
}

pub fn verify_kernel(path: &Path, trust: &TrustArgs, floor: u32) -> anyhow::Result<()> {
    let image = read(path)?;
    let trusted = load_pubkey(&trust.signpubkey)?;
    let header = verify_kernel_image(&image, &trusted, trust.mode.into(), VersionFloor::new(floor))
        .described(|| format!("Kernel {} rejected", path.display()))?;

    let preamble = &header.preamble;
    println!("key block:");
    println!("  size:        {}", header.keyblock.size);
    println!("  flags:       0x{:X}", header.keyblock.flags);
    describe_key("data key", &header.keyblock.data_key)?;
    println!("preamble:");
    println!("  size:        {}", preamble.size);
    println!("  version:     {}", preamble.kernel_version);
    println!("  combined:    0x{:08X}", header.combined_version());
    println!("  load:        0x{:X}", preamble.body_load_address);
    println!(
        "  bootloader:  0x{:X} (+0x{:X})",
        preamble.bootloader_address, preamble.bootloader_size
    );
    println!("body:");
    println!("  offset:      {}", header.body_offset());
    println!("  size:        {}", preamble.body_size);
    println!("  signature:   valid");
    Ok(())
}

pub fn nv_decode(path: &Path) -> anyhow::Result<()> {
    let blob = read(path)?;
    let record = NvContext::setup(&blob);
    if record.was_regenerated() {
        log::warn!("{} is not a valid record, showing defaults", path.display());
    }
    for param in NvParam::ALL {
        println!("{:<24} {}", param.name(), record.get(param));
    }
    Ok(())
}

// ============================================================================
// Signing
// ============================================================================

pub fn pack_pubkey(pem: &Path, algorithm: u64, key_version: u32, out: &Path) -> anyhow::Result<()> {
    let signer = load_signer(pem, algorithm)?;
    let blob = public_key_blob(&signer, key_version)
        .described(|| format!("Could not pack {}", pem.display()))?;
    write(out, &blob)?;
    log::info!("wrote {} ({} bytes)", out.display(), blob.len());
    Ok(())
}

pub fn generate_key(algorithm: u64, out: &Path) -> anyhow::Result<()> {
    let algorithm = SignatureAlgorithm::from_id(algorithm)
        .described(|| format!("Unknown algorithm {algorithm}"))?;
    log::info!("generating {}-bit key", algorithm.key_bits());
    let key = SigningKey::generate(algorithm).described(|| String::from("Key generation failed"))?;
    let pem = key.to_pem().described(|| String::from("PEM encoding failed"))?;
    write(out, pem.as_bytes())
}

pub fn sign_kernel(args: &SignArgs) -> anyhow::Result<()> {
    let signer = load_signer(&args.signer, args.signer_algorithm)?;
    let data_signer = load_signer(&args.data_key, args.data_algorithm)?;
    let data_key = public_key_of(&data_signer, args.key_version)
        .described(|| String::from("Invalid data key"))?;
    let body = read(&args.body)?;

    let keyblock = KeyBlockBuilder::new(data_key, args.flags)
        .sign(&signer)
        .described(|| String::from("Could not sign key block"))?;
    let preamble = PreambleBuilder::new(args.kernel_version)
        .with_load_address(args.load_address)
        .with_bootloader(args.bootloader_address, args.bootloader_size)
        .sign(&body, &data_signer)
        .described(|| String::from("Could not sign preamble"))?;

    let image = build_kernel_partition(&keyblock, &preamble, &body);
    write(&args.out, &image)?;
    log::info!(
        "wrote {}: key block {} + preamble {} + body {} bytes",
        args.out.display(),
        keyblock.len(),
        preamble.len(),
        body.len()
    );
    Ok(())
}

// ============================================================================
// Selection
// ============================================================================

fn forward(entry: &LogEntry) {
    let level = match entry.level {
        LogLevel::Error => log::Level::Error,
        LogLevel::Warn => log::Level::Warn,
        LogLevel::Info => log::Level::Info,
        LogLevel::Debug => log::Level::Debug,
    };
    log::log!(target: entry.module, level, "{}", entry.message);
}

pub fn select(args: &SelectArgs) -> anyhow::Result<()> {
    let config = BootConfig::DEFAULT.with_sector_size(args.sector_size);
    let mut disk = MemoryDisk::from_image(read(&args.disk)?, args.sector_size);
    let kernel_key = load_pubkey(&args.kernel_key)?;
    let recovery_key = args.recovery_key.as_deref().map(load_pubkey).transpose()?;

    let mut tpm = SimulatedTpm::new().with_space(
        SECURE_NV_INDEX,
        perm::WRITEDEFINE | perm::PPWRITE,
        &encode_space(args.secure_floor),
    );
    if let Some(floor) = args.floor {
        tpm = tpm.with_space(KERNEL_NV_INDEX, perm::WRITE_STCLEAR, &encode_space(floor));
    }
    let mut rollback =
        RollbackProtection::new(TpmSession::new(tpm, config.tpm_timeout_ms), &config);

    let mut nv_store = match &args.nv {
        Some(path) if path.exists() => MemoryNvStore::with_blob(&read(path)?),
        _ => MemoryNvStore::new(),
    };
    let mut log_buffer = LogBuffer::with_level(LogLevel::Debug);

    let result = select_and_load_kernel(BootContext {
        device: &mut disk,
        rollback: &mut rollback,
        nv_store: &mut nv_store,
        kernel_key: &kernel_key,
        recovery_key: recovery_key.as_ref(),
        mode: args.mode.into(),
        config,
        log: &mut log_buffer,
    });
    log_buffer.drain(forward);

    if let Some(path) = &args.nv {
        write(path, nv_store.blob())?;
    }
    if args.write {
        write(&args.disk, disk.image())?;
    }

    let selected = result.described(|| String::from("Kernel selection failed"))?;
    println!("selected partition {}", selected.partition_number);
    println!("  guid:        {}", selected.unique_guid);
    println!(
        "  sectors:     {} (+{})",
        selected.starting_lba, selected.sector_count
    );
    println!(
        "  body:        offset {} size {} load 0x{:X}",
        selected.body_offset, selected.body_size, selected.body_load_address
    );
    println!(
        "  versions:    key {} kernel {}",
        selected.key_version, selected.kernel_version
    );
    if let Some(state) = rollback.cached() {
        println!(
            "  floor:       0x{:08X}{}",
            state.stored,
            if selected.floor_raised { " (raised)" } else { "" }
        );
    }
    Ok(())
}
