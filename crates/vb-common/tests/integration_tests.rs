// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Integration tests for vb-common

mod error_tests {
    use vb_common::{Error, ErrorCategory};

    #[test]
    fn test_codes_are_unique() {
        let all = [
            Error::BadTableChecksum,
            Error::BadTableGeometry,
            Error::InvalidKeyFormat,
            Error::InvalidKeyBlock,
            Error::InvalidPreamble,
            Error::SizeMismatch,
            Error::KeyBlockFlagsMismatch,
            Error::BadSignature,
            Error::HashMismatch,
            Error::UnsupportedAlgorithm,
            Error::KeyVersionRollback,
            Error::KernelVersionRollback,
            Error::RollbackViolation,
            Error::Locked,
            Error::ModuleUnavailable,
            Error::ModuleCorrupt,
            Error::ModuleState,
            Error::DeviceIo,
            Error::NvStorageFailed,
            Error::NoValidKernel,
            Error::BufferTooSmall,
            Error::InvalidParameter,
            Error::InternalError,
        ];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_ne!(a.code(), b.code(), "{a:?} vs {b:?}");
            }
        }
    }

    #[test]
    fn test_display_includes_code() {
        let s = format!("{}", Error::KernelVersionRollback);
        assert!(s.starts_with("[0x0302]"));
        assert_eq!(
            Error::ModuleUnavailable.category(),
            ErrorCategory::Infrastructure
        );
    }
}

mod crc_tests {
    use vb_common::crc::{crc32, crc8};

    #[test]
    fn test_single_bit_flip_changes_crc() {
        let data = [0x5Au8; 15];
        let base8 = crc8(&data);
        let base32 = crc32(&data);
        for byte in 0..data.len() {
            for bit in 0..8 {
                let mut d = data;
                d[byte] ^= 1 << bit;
                assert_ne!(crc8(&d), base8);
                assert_ne!(crc32(&d), base32);
            }
        }
    }
}
