//! Property-based tests for the beacon core
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

// ============================================================================
// Link State Machine Properties
// ============================================================================

mod link_properties {
    use super::*;
    use beacon_core::{LinkState, LinkStateMachine, TeardownReason};

    fn any_reason() -> impl Strategy<Value = TeardownReason> {
        prop_oneof![
            Just(TeardownReason::Timeout),
            Just(TeardownReason::ClosedByPeer),
            Just(TeardownReason::ClosedLocally),
            Just(TeardownReason::Unknown),
        ]
    }

    fn any_state() -> impl Strategy<Value = LinkState> {
        prop_oneof![
            Just(LinkState::Pending),
            Just(LinkState::Handshaking),
            Just(LinkState::Active),
            any_reason().prop_map(LinkState::Closed),
        ]
    }

    fn rank(state: LinkState) -> u8 {
        match state {
            LinkState::Pending => 0,
            LinkState::Handshaking => 1,
            LinkState::Active => 2,
            LinkState::Closed(_) => 3,
        }
    }

    proptest! {
        /// Once CLOSED, no request moves the machine again
        #[test]
        fn closed_is_terminal(requests in prop::collection::vec(any_state(), 0..32)) {
            let mut machine = LinkStateMachine::new();
            let mut closed_at: Option<LinkState> = None;
            for request in requests {
                let accepted = machine.transition(request).is_ok();
                if let Some(closed) = closed_at {
                    prop_assert!(!accepted);
                    prop_assert_eq!(machine.state(), closed);
                } else if machine.state().is_closed() {
                    closed_at = Some(machine.state());
                }
            }
        }

        /// State never moves backwards
        #[test]
        fn transitions_are_monotonic(requests in prop::collection::vec(any_state(), 0..32)) {
            let mut machine = LinkStateMachine::new();
            for request in requests {
                let before = machine.state();
                if machine.transition(request).is_ok() {
                    prop_assert!(rank(machine.state()) > rank(before));
                } else {
                    prop_assert_eq!(machine.state(), before);
                }
            }
        }
    }
}

// ============================================================================
// Framing Properties
// ============================================================================

mod framing_properties {
    use super::*;
    use beacon_core::framer::decode_text;
    use beacon_core::{BeaconError, Payload};
    use beacon_transport::LINK_MDU;

    proptest! {
        /// Text is accepted iff its UTF-8 encoding fits the MDU
        #[test]
        fn text_fits_iff_bytes_fit(text in "\\PC{0,300}") {
            let payload = Payload::from(text.as_str());
            let result = payload.encode(LINK_MDU);
            if text.len() <= LINK_MDU {
                prop_assert_eq!(result.unwrap(), text.as_bytes());
            } else {
                prop_assert_eq!(
                    result,
                    Err(BeaconError::PayloadTooLarge { size: text.len(), mdu: LINK_MDU })
                );
            }
        }

        /// Decoding valid UTF-8 is lossless
        #[test]
        fn valid_text_decodes_unchanged(text in "\\PC{0,200}") {
            let decoded = decode_text(text.as_bytes());
            prop_assert_eq!(decoded.as_ref(), text.as_str());
        }
    }
}

// ============================================================================
// Identity Properties
// ============================================================================

mod identity_properties {
    use super::*;
    use beacon_core::IdentityStore;
    use beacon_crypto::Fingerprint;
    use tempfile::TempDir;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        /// Persisting and reloading twice keeps the fingerprint
        #[test]
        fn identity_reload_keeps_fingerprint(_seed in any::<u8>()) {
            let dir = TempDir::new().unwrap();
            let path = dir.path().join("beacon_identity");
            let cache = dir.path().join("known_destinations");

            let created = IdentityStore::load_identity(&path).unwrap().fingerprint();
            let once = IdentityStore::load_or_create(&path, &cache).unwrap();
            let twice = IdentityStore::load_or_create(&path, &cache).unwrap();
            prop_assert_eq!(once.identity().fingerprint(), created);
            prop_assert_eq!(twice.identity().fingerprint(), created);
        }

        /// Fingerprints print and parse as hex
        #[test]
        fn fingerprint_hex_parses_back(bytes in any::<[u8; 16]>()) {
            let fingerprint = Fingerprint::from_bytes(bytes);
            let parsed: Fingerprint = fingerprint.to_string().parse().unwrap();
            prop_assert_eq!(parsed, fingerprint);
        }
    }
}

// ============================================================================
// Reporting Schedule Properties
// ============================================================================

mod schedule_properties {
    use super::*;
    use beacon_core::node::delay_until_second;
    use chrono::{DateTime, Duration as ChronoDuration, Timelike, Utc};
    use std::time::Duration;

    proptest! {
        /// The first check-in lands on the target second, within a minute
        #[test]
        fn first_report_hits_target_second(
            secs in 1_600_000_000i64..1_900_000_000,
            millis in 0u32..1000,
            target in 0u8..60,
        ) {
            let now = DateTime::<Utc>::from_timestamp(secs, millis * 1_000_000).unwrap();
            let delay = delay_until_second(now, target);
            prop_assert!(delay < Duration::from_secs(60));

            let fires = now + ChronoDuration::from_std(delay).unwrap();
            prop_assert_eq!(fires.second(), u32::from(target));
            prop_assert_eq!(fires.timestamp_subsec_millis(), 0);
        }
    }
}
