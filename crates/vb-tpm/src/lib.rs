// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Security-Module Session
//!
//! A client for the TPM 1.2 command subset the verified boot core needs:
//! startup and self-test, NV space define/read/write/lock, capability reads,
//! PCR extend and the physical-presence administrative commands.
//!
//! The session is an explicit state machine ([`SessionState`]); commands that
//! are not valid in the current state are refused before anything is sent.
//! The physical transport is a [`vb_hal::TpmTransport`] supplied by the
//! platform.
//!
//! # Features
//!
//! - `sim`: an in-memory module ([`sim::SimulatedTpm`]) with fault injection
//!   for tests and host tools

#![no_std]
#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::cast_possible_truncation)]

#[cfg(feature = "sim")]
extern crate alloc;

pub mod command;
pub mod error;
pub mod session;

#[cfg(feature = "sim")]
pub mod sim;

pub use error::{TpmError, TpmResult};
pub use session::{PermanentFlags, SessionState, SpaceInfo, TpmSession};
