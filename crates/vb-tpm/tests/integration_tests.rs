// SPDX-License-Identifier: Apache-2.0
// Copyright 2024-2026 Qbitel Inc.

//! Integration tests for vb-tpm

use vb_tpm::command::{ordinal, perm, rc};
use vb_tpm::sim::{Fault, SimulatedTpm};
use vb_tpm::{PermanentFlags, SessionState, TpmError, TpmSession};

const INDEX: u32 = 0x1008;

fn ready(tpm: SimulatedTpm) -> TpmSession<SimulatedTpm> {
    let mut session = TpmSession::new(tpm, 100);
    session.init().unwrap();
    session
}

mod session_tests {
    use super::*;

    #[test]
    fn test_init_reaches_ready() {
        let session = ready(SimulatedTpm::new());
        assert_eq!(session.state(), SessionState::Ready);
        let log = session.into_transport();
        assert_eq!(
            &log.command_log()[..2],
            &[ordinal::STARTUP, ordinal::SELF_TEST_FULL]
        );
    }

    #[test]
    fn test_disabled_module_requires_reboot() {
        let tpm = SimulatedTpm::new().with_flags(PermanentFlags {
            deactivated: true,
            nv_locked: true,
            ..PermanentFlags::default()
        });
        let mut session = TpmSession::new(tpm, 100);
        assert_eq!(session.init(), Err(TpmError::RebootRequired));
        assert_eq!(session.state(), SessionState::SelfTested);

        let mut tpm = session.into_transport();
        tpm.reboot();
        assert!(!tpm.flags().deactivated);
        let session = ready(tpm);
        assert_eq!(session.state(), SessionState::Ready);
    }

    #[test]
    fn test_timeout_fault() {
        let mut tpm = SimulatedTpm::new();
        tpm.fail_ordinal(Some(ordinal::SELF_TEST_FULL), Fault::Timeout);
        let mut session = TpmSession::new(tpm, 100);
        assert_eq!(session.init(), Err(TpmError::Timeout));
        assert_eq!(session.state(), SessionState::Started);
    }

    #[test]
    fn test_garbage_is_malformed() {
        let mut tpm = SimulatedTpm::new();
        tpm.fail_once(None, Fault::Garbage);
        let mut session = TpmSession::new(tpm, 100);
        assert_eq!(session.startup(), Err(TpmError::MalformedResponse));
        // The fault was one-shot
        session.init().unwrap();
    }

    #[test]
    fn test_return_code_fault() {
        let mut tpm = SimulatedTpm::new();
        tpm.fail_ordinal(Some(ordinal::NV_READ_VALUE), Fault::ReturnCode(rc::FAIL));
        let tpm = tpm.with_space(INDEX, perm::WRITE_STCLEAR, &[0u8; 4]);
        let mut session = ready(tpm);
        let mut buf = [0u8; 4];
        let err = session.nv_read(INDEX, &mut buf).unwrap_err();
        assert_eq!(err.return_code(), Some(rc::FAIL));
    }

    #[test]
    fn test_extend_changes_pcr() {
        let mut session = ready(SimulatedTpm::new());
        let first = session.extend(0, &[1u8; 20]).unwrap();
        assert_ne!(first, [0u8; 20]);
        let second = session.extend(0, &[1u8; 20]).unwrap();
        assert_ne!(first, second);
        assert_eq!(session.into_transport().pcr(0), Some(second));
    }
}

mod nv_tests {
    use super::*;

    #[test]
    fn test_define_requires_presence() {
        let mut session = ready(SimulatedTpm::new());
        let err = session.define_space(INDEX, perm::WRITE_STCLEAR, 13).unwrap_err();
        assert_eq!(err.return_code(), Some(rc::BAD_PRESENCE));

        session.assert_physical_presence().unwrap();
        session.define_space(INDEX, perm::WRITE_STCLEAR, 13).unwrap();
        let info = session.get_permissions(INDEX).unwrap();
        assert_eq!(info.size, 13);
        assert!(TpmSession::<SimulatedTpm>::is_boot_lockable(&info));
    }

    #[test]
    fn test_write_read_roundtrip() {
        let tpm = SimulatedTpm::new().with_space(INDEX, perm::WRITE_STCLEAR, &[0u8; 8]);
        let mut session = ready(tpm);
        session.nv_write(INDEX, &[1, 2, 3, 4, 5, 6, 7, 8]).unwrap();
        let mut buf = [0u8; 8];
        session.nv_read(INDEX, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_undefined_index() {
        let mut session = ready(SimulatedTpm::new());
        let mut buf = [0u8; 4];
        let err = session.nv_read(0x2000, &mut buf).unwrap_err();
        assert_eq!(err.return_code(), Some(rc::BADINDEX));
    }

    #[test]
    fn test_write_lock_until_reboot() {
        let tpm = SimulatedTpm::new().with_space(INDEX, perm::WRITE_STCLEAR, &[0u8; 4]);
        let mut session = ready(tpm);
        session.write_lock(INDEX).unwrap();
        let err = session.nv_write(INDEX, &[9, 9, 9, 9]).unwrap_err();
        assert_eq!(err.return_code(), Some(rc::AREA_LOCKED));

        let mut tpm = session.into_transport();
        assert!(tpm.space(INDEX).unwrap().write_locked);
        tpm.reboot();
        let mut session = ready(tpm);
        session.nv_write(INDEX, &[9, 9, 9, 9]).unwrap();
    }

    #[test]
    fn test_short_space_read_is_rejected() {
        let tpm = SimulatedTpm::new().with_space(INDEX, 0, &[0u8; 4]);
        let mut session = ready(tpm);
        let mut buf = [0u8; 8];
        let err = session.nv_read(INDEX, &mut buf).unwrap_err();
        assert_eq!(err.return_code(), Some(rc::NOSPACE));
    }

    #[test]
    fn test_presence_lock_blocks_define() {
        let mut session = ready(SimulatedTpm::new());
        session.lock_physical_presence().unwrap();
        assert!(session.assert_physical_presence().is_err());
        assert!(session.define_space(INDEX, 0, 4).is_err());
    }
}
