//! Peer addresses and transport kinds.
//!
//! An [`Address`] is used as a map key and inside authorized payloads, so its
//! string form is canonical: `localhost` is rewritten to the loopback literal and
//! IPv6 hosts are always bracketed when a port follows.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

const LOOPBACK: &str = "127.0.0.1";

/// Transport kinds a node can speak.
///
/// The declaration order is the canonical ordering used when sorting
/// capability lists; do not reorder variants.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub enum TransportType {
    /// Plain TCP over the clear network
    #[default]
    Clear,
    /// Tor onion services
    Tor,
    /// I2P tunnels
    I2p,
}

impl TransportType {
    /// All transport types in canonical order.
    pub const ALL: [TransportType; 3] = [TransportType::Clear, TransportType::Tor, TransportType::I2p];

    /// Guess the transport an address belongs to from its host suffix.
    #[must_use]
    pub fn of(address: &Address) -> Self {
        if address.host().ends_with(".onion") {
            TransportType::Tor
        } else if address.host().ends_with(".i2p") {
            TransportType::I2p
        } else {
            TransportType::Clear
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Clear => write!(f, "clear"),
            TransportType::Tor => write!(f, "tor"),
            TransportType::I2p => write!(f, "i2p"),
        }
    }
}

impl FromStr for TransportType {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "clear" | "clearnet" | "tcp" => Ok(TransportType::Clear),
            "tor" => Ok(TransportType::Tor),
            "i2p" => Ok(TransportType::I2p),
            other => Err(AddressParseError::UnknownTransport(other.to_string())),
        }
    }
}

/// Errors produced when parsing addresses or transport names
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressParseError {
    /// Host part is empty or contains whitespace
    #[error("invalid host: {0:?}")]
    InvalidHost(String),

    /// Port is not a number in 0..=65535
    #[error("invalid port: {0:?}")]
    InvalidPort(String),

    /// Unknown transport name
    #[error("unknown transport type: {0}")]
    UnknownTransport(String),
}

/// Reachable endpoint of a peer.
///
/// `port` is `None` for host-only forms (an overlay hostname before the
/// service port is known).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address {
    host: String,
    port: Option<u16>,
}

impl Address {
    /// Create an address, normalising `localhost` to the loopback literal.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, AddressParseError> {
        Ok(Self {
            host: normalize_host(host.into())?,
            port: Some(port),
        })
    }

    /// Create a host-only address.
    pub fn host_only(host: impl Into<String>) -> Result<Self, AddressParseError> {
        Ok(Self {
            host: normalize_host(host.into())?,
            port: None,
        })
    }

    /// Loopback address with the given port.
    #[must_use]
    pub fn localhost(port: u16) -> Self {
        Self {
            host: LOOPBACK.to_string(),
            port: Some(port),
        }
    }

    /// Host part
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Returns true if the host is a loopback literal
    pub fn is_localhost(&self) -> bool {
        self.host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
    }

    /// Socket address when the host is an IP literal and a port is set
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let ip = self.host.parse::<IpAddr>().ok()?;
        Some(SocketAddr::new(ip, self.port?))
    }
}

fn normalize_host(host: String) -> Result<String, AddressParseError> {
    let trimmed = host.trim();
    if trimmed.is_empty() || trimmed.chars().any(char::is_whitespace) {
        return Err(AddressParseError::InvalidHost(host));
    }
    if trimmed.eq_ignore_ascii_case("localhost") {
        return Ok(LOOPBACK.to_string());
    }
    Ok(trimmed.to_ascii_lowercase())
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bracketed = self.host.contains(':');
        match (bracketed, self.port) {
            (true, Some(port)) => write!(f, "[{}]:{}", self.host, port),
            (true, None) => write!(f, "[{}]", self.host),
            (false, Some(port)) => write!(f, "{}:{}", self.host, port),
            (false, None) => write!(f, "{}", self.host),
        }
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| AddressParseError::InvalidHost(s.to_string()))?;
            return match tail.strip_prefix(':') {
                Some(port) => Address::new(host, parse_port(port)?),
                None if tail.is_empty() => Address::host_only(host),
                None => Err(AddressParseError::InvalidPort(tail.to_string())),
            };
        }

        match s.matches(':').count() {
            0 => Address::host_only(s),
            1 => {
                let (host, port) = s
                    .split_once(':')
                    .ok_or_else(|| AddressParseError::InvalidHost(s.to_string()))?;
                Address::new(host, parse_port(port)?)
            }
            // Bare IPv6 literal without a port
            _ => Address::host_only(s),
        }
    }
}

fn parse_port(port: &str) -> Result<u16, AddressParseError> {
    port.parse::<u16>()
        .map_err(|_| AddressParseError::InvalidPort(port.to_string()))
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        let ip = addr.ip();
        let host = if ip.is_loopback() && ip.is_ipv4() {
            LOOPBACK.to_string()
        } else {
            ip.to_string()
        };
        Self {
            host,
            port: Some(addr.port()),
        }
    }
}

impl From<Address> for String {
    fn from(address: Address) -> Self {
        address.to_string()
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}
