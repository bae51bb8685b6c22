// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Integration tests for vb-hal
//!
//! Exercise the platform-agnostic layer: error conversion and the default
//! trait methods, using the memory-backed devices.

mod error_tests {
    use vb_common::{Error, ErrorCategory};
    use vb_hal::HalError;

    #[test]
    fn test_transport_errors_are_infrastructure() {
        let e: Error = HalError::Timeout.into();
        assert_eq!(e, Error::ModuleUnavailable);
        assert_eq!(e.category(), ErrorCategory::Infrastructure);
        let e: Error = HalError::TransportError.into();
        assert_eq!(e, Error::ModuleUnavailable);
    }

    #[test]
    fn test_block_errors_map_to_device_io() {
        for h in [HalError::ReadFailed, HalError::OutOfBounds, HalError::Misaligned] {
            assert_eq!(Error::from(h), Error::DeviceIo);
        }
    }

    #[test]
    fn test_display_format() {
        assert_eq!(format!("{}", HalError::Timeout), "[0x0830] transport timeout");
    }
}

mod mem_tests {
    use vb_hal::mem::{MemoryDisk, MemoryNvStore};
    use vb_hal::{BlockDevice, HalError, NvBlobStore};

    #[test]
    fn test_sector_round_trip() {
        let mut disk = MemoryDisk::new(8, 512);
        let data = [0xA5u8; 1024];
        disk.write_sectors(2, &data).unwrap();
        let mut back = [0u8; 1024];
        disk.read_sectors(2, &mut back).unwrap();
        assert_eq!(back, data);
        assert_eq!(disk.write_count(), 1);
    }

    #[test]
    fn test_out_of_bounds_and_misaligned() {
        let mut disk = MemoryDisk::new(4, 512);
        let mut buf = [0u8; 512];
        assert_eq!(disk.read_sectors(4, &mut buf), Err(HalError::OutOfBounds));
        let mut odd = [0u8; 100];
        assert_eq!(disk.read_sectors(0, &mut odd), Err(HalError::Misaligned));
    }

    #[test]
    fn test_read_bytes_partial_sector() {
        let mut disk = MemoryDisk::new(4, 512);
        for (i, b) in disk.image_mut().iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        let mut buf = [0u8; 700];
        disk.read_bytes(1, &mut buf).unwrap();
        assert_eq!(&buf[..], &disk.image()[512..1212]);
    }

    #[test]
    fn test_nv_store() {
        let mut store = MemoryNvStore::new();
        let mut buf = [0u8; 16];
        assert_eq!(store.load_blob(&mut buf).unwrap(), 0);
        store.store_blob(&[1, 2, 3]).unwrap();
        assert_eq!(store.load_blob(&mut buf).unwrap(), 3);
        store.fail_store(true);
        assert_eq!(store.store_blob(&[4]), Err(HalError::NvStorageError));
        assert_eq!(store.blob(), &[1, 2, 3]);
    }
}
