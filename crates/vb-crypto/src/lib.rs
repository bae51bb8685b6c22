// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Verified Boot Cryptography
//!
//! The primitives the verification pipeline is built on:
//!
//! - **Hashing**: SHA-256 and SHA-512 (`sha2`), typed and runtime-selected
//! - **Signatures**: RSA PKCS#1 v1.5 verification (`rsa`) over keys in the
//!   firmware's packed format, RSA-1024 through RSA-8192
//! - **Comparison**: constant-time byte comparison (`subtle`)
//!
//! The `signing` feature adds key generation and signing for host tools and
//! tests. Firmware builds never enable it.
//!
//! # Security Requirements
//!
//! - Digest and signature comparisons never exit early on mismatching bytes
//! - Key material is never logged
//! - SHA-1 algorithm ids are recognized but always rejected

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

pub mod error;
pub mod hash;
pub mod signature;
pub mod traits;

#[cfg(feature = "signing")]
pub mod signing;

pub use error::{CryptoError, CryptoResult};
pub use hash::{DigestValue, HashAlgorithm, HashContext, Sha256, Sha512};
pub use signature::{pack_public_key, SignatureAlgorithm, VerifyingKey};
pub use traits::{constant_time_eq, Hash};

#[cfg(feature = "signing")]
pub use signing::SigningKey;
