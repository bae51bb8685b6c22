// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Hardware Abstraction Layer for the verified boot core
//!
//! The boot core talks to exactly three pieces of hardware:
//!
//! - **Boot device**: sector-addressed storage holding the partition table and
//!   kernel partitions ([`BlockDevice`])
//! - **NV record store**: ordinary non-volatile storage for the boot flags
//!   record ([`NvBlobStore`])
//! - **Security module**: a request/response transport to the TPM
//!   ([`TpmTransport`])
//!
//! The `mem` feature provides memory-backed implementations of the first two
//! for host tools and tests.

#![no_std]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[cfg(feature = "mem")]
extern crate alloc;

pub mod error;
pub mod traits;

#[cfg(feature = "mem")]
pub mod mem;

pub use error::{HalError, HalResult};
pub use traits::*;
