//! Peer capability: reachable address plus supported transports.

use peerlink_transport::{Address, TransportType};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A peer's declared reachable address and the transports it speaks.
///
/// The transport list is kept sorted and free of duplicates. Authorization
/// tokens bind to the serialized bytes of handshake messages, so two
/// capabilities built from the same set must encode identically regardless of
/// insertion order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RawCapability")]
pub struct Capability {
    address: Address,
    supported_transport_types: Vec<TransportType>,
}

#[derive(Deserialize)]
struct RawCapability {
    address: Address,
    supported_transport_types: Vec<TransportType>,
}

impl From<RawCapability> for Capability {
    fn from(raw: RawCapability) -> Self {
        Capability::new(raw.address, raw.supported_transport_types)
    }
}

impl Capability {
    /// Create a capability, canonicalising the transport list
    pub fn new(address: Address, transport_types: impl IntoIterator<Item = TransportType>) -> Self {
        let mut supported_transport_types: Vec<TransportType> =
            transport_types.into_iter().collect();
        supported_transport_types.sort();
        supported_transport_types.dedup();
        Self {
            address,
            supported_transport_types,
        }
    }

    /// Capability with a single transport
    pub fn single(address: Address, transport_type: TransportType) -> Self {
        Self::new(address, [transport_type])
    }

    /// Declared address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Supported transports in canonical order
    pub fn supported_transport_types(&self) -> &[TransportType] {
        &self.supported_transport_types
    }

    /// Returns true if the peer advertises `transport_type`
    pub fn supports(&self, transport_type: TransportType) -> bool {
        self.supported_transport_types
            .binary_search(&transport_type)
            .is_ok()
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [", self.address)?;
        for (i, t) in self.supported_transport_types.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            write!(f, "{t}")?;
        }
        write!(f, "]")
    }
}
