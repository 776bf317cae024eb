//! Property-based tests for PeerLink
//!
//! Uses proptest to verify invariants across large input spaces.

use proptest::prelude::*;

fn transport_type() -> impl Strategy<Value = peerlink_core::TransportType> {
    use peerlink_core::TransportType;
    prop_oneof![
        Just(TransportType::Clear),
        Just(TransportType::Tor),
        Just(TransportType::I2p),
    ]
}

// ============================================================================
// Address Properties
// ============================================================================

mod address_properties {
    use super::*;
    use peerlink_core::Address;
    use std::net::Ipv6Addr;

    proptest! {
        /// Display output parses back to the same address
        #[test]
        fn hostname_display_parses_back(
            host in "[a-z][a-z0-9]{0,12}(\\.[a-z]{2,6}){0,2}",
            port in any::<u16>(),
        ) {
            prop_assume!(host != "localhost");
            let address = Address::new(host.clone(), port).unwrap();
            let parsed: Address = address.to_string().parse().unwrap();
            prop_assert_eq!(parsed.host(), host.as_str());
            prop_assert_eq!(parsed.port(), Some(port));
            prop_assert_eq!(parsed, address);
        }

        /// IPv6 literals are bracketed so the port stays unambiguous
        #[test]
        fn ipv6_display_parses_back(segments in any::<[u16; 8]>(), port in any::<u16>()) {
            let ip = Ipv6Addr::from(segments);
            let address = Address::new(ip.to_string(), port).unwrap();
            let text = address.to_string();
            prop_assert!(text.starts_with('['));
            let parsed: Address = text.parse().unwrap();
            prop_assert_eq!(parsed.port(), Some(port));
            prop_assert_eq!(parsed, address);
        }

        /// Parsing never panics on arbitrary input
        #[test]
        fn parse_is_total(input in "\\PC{0,40}") {
            let _ = input.parse::<Address>();
        }
    }
}

// ============================================================================
// Capability Properties
// ============================================================================

mod capability_properties {
    use super::*;
    use peerlink_core::{Address, Capability};

    proptest! {
        /// Transport order and duplicates do not affect a capability
        #[test]
        fn transports_are_canonical(
            types in prop::collection::vec(transport_type(), 1..8),
            port in any::<u16>(),
        ) {
            let forward = Capability::new(Address::localhost(port), types.clone());
            let backward = Capability::new(Address::localhost(port), types.iter().rev().copied());

            prop_assert_eq!(&forward, &backward);
            let listed = forward.supported_transport_types();
            prop_assert!(listed.windows(2).all(|pair| pair[0] < pair[1]));
            for transport in &types {
                prop_assert!(forward.supports(*transport));
            }
        }
    }
}

// ============================================================================
// Load Scaling Properties
// ============================================================================

mod load_properties {
    use super::*;
    use peerlink_core::{Load, ProofOfWorkConfig, ThrottleConfig};

    proptest! {
        /// More load never lowers the required difficulty, which stays in bounds
        #[test]
        fn difficulty_is_monotonic(
            base in 0u32..16,
            extra in 0u32..16,
            a in 0u32..10_000,
            b in 0u32..10_000,
        ) {
            let config = ProofOfWorkConfig { base_difficulty: base, max_difficulty: base + extra };
            let (low, high) = (a.min(b), a.max(b));
            let low_difficulty = config.required_difficulty(Load::new(low));
            let high_difficulty = config.required_difficulty(Load::new(high));

            prop_assert!(low_difficulty <= high_difficulty);
            prop_assert!(low_difficulty >= base);
            prop_assert!(high_difficulty <= base + extra);
        }

        /// Halving a load relaxes the required difficulty by at most one bit
        #[test]
        fn halved_load_is_one_step_easier(
            base in 0u32..16,
            extra in 0u32..16,
            n in 0u32..1_000_000,
        ) {
            let config = ProofOfWorkConfig { base_difficulty: base, max_difficulty: base + extra };
            let full = config.required_difficulty(Load::new(n));
            let relaxed = config.required_difficulty(Load::new(n).halved());

            prop_assert!(relaxed <= full);
            prop_assert!(full - relaxed <= 1);
        }

        /// Throttle spacing grows with load and is capped at the base spacing
        #[test]
        fn spacing_is_monotonic(
            max_connections in 1u32..1_000,
            a in 0u32..5_000,
            b in 0u32..5_000,
        ) {
            let config = ThrottleConfig { max_connections, ..ThrottleConfig::default() };
            let (low, high) = (a.min(b), a.max(b));
            let low_spacing = config.spacing(Load::new(low));
            let high_spacing = config.spacing(Load::new(high));

            prop_assert!(low_spacing <= high_spacing);
            prop_assert!(high_spacing <= config.base_spacing);
        }
    }
}
