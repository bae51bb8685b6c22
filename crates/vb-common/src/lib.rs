// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Verified Boot Common Library
//!
//! Error taxonomy, the boot log buffer, configuration, fixed format constants
//! and checksums shared by every crate of the verified boot core.
//!
//! # Features
//!
//! - `std`: Enable standard library support (disabled by default for firmware)
//! - `defmt`: Enable defmt formatting of errors for embedded debugging

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

#[cfg(feature = "std")]
extern crate std;

pub mod config;
pub mod constants;
pub mod crc;
pub mod errors;
pub mod log;

pub use config::{BootConfig, BootMode, ConfirmationPolicy};
pub use errors::{Error, ErrorCategory, Result};
pub use log::{LogBuffer, LogLevel};
