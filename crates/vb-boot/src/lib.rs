// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Verified Boot Core
//!
//! Decides which kernel partition is safe to execute:
//!
//! - **GPT**: validated, priority-ordered kernel candidates from an untrusted
//!   partition table
//! - **Vboot**: public key, key block, preamble and body verification
//! - **Rollback**: minimum kernel versions kept in security-module NV spaces
//! - **NV Storage**: the persistent boot flags record
//! - **Selector**: the state machine tying them together
//!   ([`select_and_load_kernel`])
//!
//! # Features
//!
//! - `std`: Enable standard library support
//! - `signing`: Key block and preamble builders for host tools and tests

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod gpt;
pub mod nvstorage;
pub mod rollback;
pub mod selector;
pub mod vboot;

pub use gpt::{GptError, PartitionEntry, PartitionTable};
pub use nvstorage::{BootResult, NvContext, NvParam};
pub use rollback::{RollbackError, RollbackProtection, RollbackState};
pub use selector::{
    select_and_load_kernel, BootContext, BootError, KernelSelector, SelectedKernel, SelectorState,
};
pub use vboot::{PublicKey, VerifyError, VerifyStage};
