//! # PeerLink Transport
//!
//! Network transport layer for the PeerLink node.
//!
//! This crate provides:
//! - [`Address`] and [`TransportType`] value types shared by every layer
//! - The [`Transport`] trait: listening sockets and outbound sockets
//! - A clear-net TCP transport
//! - Tor and I2P overlay transports that dial through the daemon's SOCKS5 proxy
//! - A factory selecting the implementation from a [`TransportType`]

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod address;
pub mod clear;
pub mod factory;
pub mod overlay;
pub mod transport;

pub use address::{Address, AddressParseError, TransportType};
pub use clear::ClearNetTransport;
pub use factory::TransportFactory;
pub use overlay::{OverlayConfig, OverlayTransport};
pub use transport::{ServerSocket, Transport, TransportError, TransportResult, TransportStats};

use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Interface the clear-net listener binds to
    pub bind_host: IpAddr,
    /// Host reported as our own address (defaults to loopback when bound to any interface)
    pub public_host: Option<String>,
    /// Timeout for establishing outbound sockets
    pub connect_timeout: Duration,
    /// Listen backlog for server sockets
    pub listen_backlog: i32,
    /// Tor overlay settings
    pub tor: OverlayConfig,
    /// I2P overlay settings
    pub i2p: OverlayConfig,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            bind_host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            public_host: None,
            connect_timeout: Duration::from_secs(30),
            listen_backlog: 1024,
            tor: OverlayConfig::tor_default(),
            i2p: OverlayConfig::i2p_default(),
        }
    }
}
