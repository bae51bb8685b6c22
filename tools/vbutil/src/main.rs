// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! vbutil: inspect and sign verified boot structures on the host

mod commands;
mod usage;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use vb_boot::vboot::keyblock::flags;
use vb_common::BootMode;

use crate::usage::UsageLog;

/// Inspect and sign verified boot structures
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Append a line per invocation to this file
    #[arg(long, global = true)]
    usage_log: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Print the partition table of a disk image
    ShowGpt {
        /// Disk image
        disk: PathBuf,
        /// Logical sector size
        #[arg(long, default_value_t = 512)]
        sector_size: u32,
    },
    /// Validate a public key blob
    VerifyPubkey {
        /// Key blob
        key: PathBuf,
    },
    /// Verify a key block against a trusted public key
    VerifyKeyblock {
        /// Key block (or a kernel partition starting with one)
        keyblock: PathBuf,
        #[command(flatten)]
        trust: TrustArgs,
        /// Minimum data key version
        #[arg(long, default_value_t = 0)]
        min_key_version: u32,
    },
    /// Verify a complete kernel partition image
    VerifyKernel {
        /// Kernel partition image
        image: PathBuf,
        #[command(flatten)]
        trust: TrustArgs,
        /// Combined version floor (key version << 16 | kernel version)
        #[arg(long, default_value = "0", value_parser = parse_number::<u32>)]
        floor: u32,
    },
    /// Decode an NV record
    NvDecode {
        /// Record file (16 bytes)
        record: PathBuf,
    },
    /// Pack the public half of a PEM private key into a key blob
    PackPubkey {
        /// PKCS#8 or PKCS#1 PEM private key
        pem: PathBuf,
        /// Signature algorithm id
        #[arg(long)]
        algorithm: u64,
        /// Key version
        #[arg(long, default_value_t = 1)]
        key_version: u32,
        /// Output key blob
        #[arg(long, short)]
        out: PathBuf,
    },
    /// Generate a PEM private key
    GenerateKey {
        /// Signature algorithm id
        #[arg(long)]
        algorithm: u64,
        /// Output PEM file
        #[arg(long, short)]
        out: PathBuf,
    },
    /// Build a signed kernel partition image
    SignKernel(SignArgs),
    /// Run kernel selection against a disk image with a simulated module
    Select(SelectArgs),
}

impl Command {
    const fn name(&self) -> &'static str {
        match self {
            Self::ShowGpt { .. } => "show-gpt",
            Self::VerifyPubkey { .. } => "verify-pubkey",
            Self::VerifyKeyblock { .. } => "verify-keyblock",
            Self::VerifyKernel { .. } => "verify-kernel",
            Self::NvDecode { .. } => "nv-decode",
            Self::PackPubkey { .. } => "pack-pubkey",
            Self::GenerateKey { .. } => "generate-key",
            Self::SignKernel(_) => "sign-kernel",
            Self::Select(_) => "select",
        }
    }
}

/// Key and mode a structure is verified under
#[derive(Args)]
pub struct TrustArgs {
    /// Public key blob that signed the key block
    #[arg(long)]
    pub signpubkey: PathBuf,
    /// Boot mode the key block flags must allow
    #[arg(long, value_enum, default_value_t = Mode::Normal)]
    pub mode: Mode,
}

/// Inputs for `sign-kernel`
#[derive(Args)]
pub struct SignArgs {
    /// PEM key that signs the key block
    #[arg(long)]
    pub signer: PathBuf,
    /// Algorithm id of the key block signer
    #[arg(long)]
    pub signer_algorithm: u64,
    /// PEM data key that signs the preamble and body
    #[arg(long)]
    pub data_key: PathBuf,
    /// Algorithm id of the data key
    #[arg(long)]
    pub data_algorithm: u64,
    /// Data key version
    #[arg(long, default_value_t = 1)]
    pub key_version: u32,
    /// Kernel version
    #[arg(long, default_value_t = 1)]
    pub kernel_version: u32,
    /// Key block mode flags
    #[arg(long, value_parser = parse_number::<u64>,
          default_value_t = flags::DEVELOPER_0 | flags::DEVELOPER_1 | flags::RECOVERY_0)]
    pub flags: u64,
    /// Body load address
    #[arg(long, value_parser = parse_number::<u64>, default_value = "0x100000")]
    pub load_address: u64,
    /// Bootloader address
    #[arg(long, value_parser = parse_number::<u64>, default_value = "0")]
    pub bootloader_address: u64,
    /// Bootloader size
    #[arg(long, value_parser = parse_number::<u64>, default_value = "0")]
    pub bootloader_size: u64,
    /// Kernel body
    #[arg(long)]
    pub body: PathBuf,
    /// Output partition image
    #[arg(long, short)]
    pub out: PathBuf,
}

/// Inputs for `select`
#[derive(Args)]
pub struct SelectArgs {
    /// Disk image
    pub disk: PathBuf,
    /// Kernel subkey blob
    #[arg(long)]
    pub kernel_key: PathBuf,
    /// Recovery key blob
    #[arg(long)]
    pub recovery_key: Option<PathBuf>,
    /// Boot mode
    #[arg(long, value_enum, default_value_t = Mode::Normal)]
    pub mode: Mode,
    /// Stored floor; the kernel space starts undefined when omitted
    #[arg(long, value_parser = parse_number::<u32>)]
    pub floor: Option<u32>,
    /// Secure floor
    #[arg(long, value_parser = parse_number::<u32>, default_value = "0")]
    pub secure_floor: u32,
    /// Logical sector size
    #[arg(long, default_value_t = 512)]
    pub sector_size: u32,
    /// NV record file, read before and written after selection
    #[arg(long)]
    pub nv: Option<PathBuf>,
    /// Write the updated partition table back to the image
    #[arg(long)]
    pub write: bool,
}

/// Boot mode argument
#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    /// Verified boot with rollback enforcement
    Normal,
    /// Developer mode
    Developer,
    /// Recovery mode
    Recovery,
}

impl From<Mode> for BootMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Normal => Self::Normal,
            Mode::Developer => Self::Developer,
            Mode::Recovery => Self::Recovery,
        }
    }
}

/// Decimal or 0x-prefixed hexadecimal
fn parse_number<T>(text: &str) -> Result<T, String>
where
    T: TryFrom<u64>,
{
    let value = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => text.parse::<u64>(),
    }
    .map_err(|e| format!("{text}: {e}"))?;
    T::try_from(value).map_err(|_| format!("{text}: out of range"))
}

fn run(command: Command) -> anyhow::Result<()> {
    match command {
        Command::ShowGpt { disk, sector_size } => commands::show_gpt(&disk, sector_size),
        Command::VerifyPubkey { key } => commands::verify_pubkey(&key),
        Command::VerifyKeyblock {
            keyblock,
            trust,
            min_key_version,
        } => commands::verify_keyblock(&keyblock, &trust, min_key_version),
        Command::VerifyKernel {
            image,
            trust,
            floor,
        } => commands::verify_kernel(&image, &trust, floor),
        Command::NvDecode { record } => commands::nv_decode(&record),
        Command::PackPubkey {
            pem,
            algorithm,
            key_version,
            out,
        } => commands::pack_pubkey(&pem, algorithm, key_version, &out),
        Command::GenerateKey { algorithm, out } => commands::generate_key(algorithm, &out),
        Command::SignKernel(args) => commands::sign_kernel(&args),
        Command::Select(args) => commands::select(&args),
    }
}

fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let mut usage = UsageLog::open(cli.usage_log.as_deref(), cli.command.name())?;

    let result = run(cli.command);
    usage.set_outcome(match &result {
        Ok(()) => String::from("ok"),
        Err(e) => format!("failed: {e}"),
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number::<u32>("42"), Ok(42));
        assert_eq!(parse_number::<u32>("0x10005"), Ok(0x0001_0005));
        assert!(parse_number::<u32>("0x1_0000_0000").is_err());
        assert!(parse_number::<u8>("256").is_err());
        assert!(parse_number::<u64>("zz").is_err());
    }

    #[test]
    fn test_cli_parses() {
        use clap::CommandFactory;
        Cli::command().debug_assert();

        let cli = Cli::try_parse_from([
            "vbutil",
            "verify-kernel",
            "kernel.bin",
            "--signpubkey",
            "root.vbpubk",
            "--mode",
            "developer",
            "--floor",
            "0x10002",
        ])
        .unwrap();
        assert_eq!(cli.command.name(), "verify-kernel");
        match cli.command {
            Command::VerifyKernel { trust, floor, .. } => {
                assert!(trust.mode == Mode::Developer);
                assert_eq!(floor, 0x0001_0002);
            }
            _ => panic!("wrong command"),
        }
    }
}
