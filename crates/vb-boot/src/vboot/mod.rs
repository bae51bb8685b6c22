// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Cryptographic Verification Pipeline
//!
//! A kernel partition is laid out as
//!
//! ```text
//! [key block][preamble][body]
//! ```
//!
//! and is verified in four stages, each gating the next:
//!
//! 1. **Public key**: algorithm and packed key structure ([`public_key`])
//! 2. **Key block**: signature under the trusted key, SHA-512 checksum, mode
//!    flags, key version floor ([`keyblock`])
//! 3. **Preamble**: signature under the key block's data key, kernel version
//!    floor, body size against the partition ([`preamble`])
//! 4. **Body**: digest of the partition bytes against the preamble's body
//!    signature ([`body`])
//!
//! Cheap structural and version checks run before the body is hashed.
//! Every member of a structure is bounds-checked against its parent before it
//! is read. Signature checks go through `rsa`, which compares in constant
//! time.

pub mod body;
pub mod common;
pub mod kernel;
pub mod keyblock;
pub mod preamble;
pub mod public_key;

#[cfg(feature = "signing")]
pub mod signing;

pub use body::{verify_body, BodyVerifier};
pub use common::{SignatureDescriptor, VerifyError, VerifyResult, VerifyStage};
pub use kernel::{verify_kernel_header, verify_kernel_image, KernelHeader, VersionFloor};
pub use keyblock::{verify_key_block, KeyBlock, VerifiedKeyBlock};
pub use preamble::{verify_preamble, Preamble, VerifiedPreamble};
pub use public_key::{PublicKey, PublicKeyDescriptor};
