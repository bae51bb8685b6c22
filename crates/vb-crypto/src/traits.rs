// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Cryptographic trait definitions

use crate::hash::HashAlgorithm;

/// Hash function trait
pub trait Hash: Sized {
    /// Algorithm identifier for this hash function
    const ALGORITHM: HashAlgorithm;
    /// Output size in bytes
    const OUTPUT_SIZE: usize;

    /// Output type
    type Output: AsRef<[u8]> + Clone;

    /// Hash a message in one shot
    fn hash(message: &[u8]) -> Self::Output;

    /// Create a new incremental hasher
    fn new() -> Self;

    /// Update the hasher with data
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the hash
    fn finalize(self) -> Self::Output;

    /// Reset the hasher for reuse
    fn reset(&mut self);
}

/// Constant-time comparison of byte slices
///
/// Lengths are public; contents are compared without early exit.
#[must_use]
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    use subtle::ConstantTimeEq;
    a.ct_eq(b).into()
}
