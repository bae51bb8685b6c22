// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Kernel body verification
//!
//! The body can be fed in chunks as it is read from disk, so the whole
//! partition never has to be held in memory.

use vb_crypto::HashContext;

use super::common::{VerifyError, VerifyResult, VerifyStage};
use super::preamble::VerifiedPreamble;
use super::public_key::PublicKey;

/// Streaming body verifier
pub struct BodyVerifier<'k> {
    key: &'k PublicKey,
    signature: &'k [u8],
    ctx: HashContext,
    expected: u64,
    seen: u64,
}

impl<'k> BodyVerifier<'k> {
    /// Start verifying the body described by `preamble`
    ///
    /// # Errors
    ///
    /// `UnsupportedAlgorithm` if the data key digest cannot be computed.
    pub fn new(data_key: &'k PublicKey, preamble: &'k VerifiedPreamble) -> VerifyResult<Self> {
        let ctx = HashContext::new(data_key.algorithm().hash())
            .ok_or(VerifyError::UnsupportedAlgorithm)?;
        Ok(Self {
            key: data_key,
            signature: &preamble.body_signature,
            ctx,
            expected: preamble.body_size,
            seen: 0,
        })
    }

    /// Bytes still expected
    #[must_use]
    pub const fn remaining(&self) -> u64 {
        self.expected.saturating_sub(self.seen)
    }

    /// Absorb the next chunk of the body
    ///
    /// Bytes past the declared body size are ignored.
    pub fn update(&mut self, chunk: &[u8]) {
        let take = usize::try_from(self.remaining()).map_or(chunk.len(), |r| r.min(chunk.len()));
        self.ctx.update(&chunk[..take]);
        self.seen += take as u64;
    }

    /// Check the digest against the body signature
    ///
    /// # Errors
    ///
    /// `SizeMismatch` if fewer bytes than declared were supplied,
    /// `BodyHashMismatch` if the signature does not match.
    pub fn finish(self) -> VerifyResult<()> {
        if self.seen != self.expected {
            return Err(VerifyError::SizeMismatch);
        }
        let digest = self.ctx.finalize();
        self.key
            .verifying_key()
            .verify_digest(digest.as_ref(), self.signature)
            .map_err(|_| VerifyError::BodyHashMismatch)
    }
}

impl core::fmt::Debug for BodyVerifier<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("BodyVerifier")
            .field("stage", &VerifyStage::Body)
            .field("expected", &self.expected)
            .field("seen", &self.seen)
            .finish_non_exhaustive()
    }
}

/// Verify a whole body held in memory
///
/// # Errors
///
/// `SizeMismatch` if `body` is shorter than declared, `BodyHashMismatch` if
/// its digest does not match.
pub fn verify_body(body: &[u8], preamble: &VerifiedPreamble, data_key: &PublicKey) -> VerifyResult<()> {
    let mut verifier = BodyVerifier::new(data_key, preamble)?;
    verifier.update(body);
    verifier.finish()
}
