//! Transport trait abstraction for multiple transport backends.
//!
//! This module defines the `Transport` trait that abstracts over the clear
//! network and the anonymity overlays. A node only ever asks a transport for a
//! listening socket and for outbound sockets; it never branches on the concrete
//! implementation.

use crate::address::{Address, TransportType};
use async_trait::async_trait;
use std::io;
use tokio::net::{TcpListener, TcpStream};

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Transport used before `initialize()`
    #[error("Transport is not initialized")]
    NotInitialized,

    /// Address binding failed
    #[error("Failed to bind to address: {0}")]
    BindFailed(String),

    /// Connection failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The overlay daemon's proxy cannot be reached
    #[error("Proxy unavailable: {0}")]
    ProxyUnavailable(String),

    /// The proxy refused or garbled the request
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Address cannot be used with this transport
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Operation timed out
    #[error("Timed out: {0}")]
    Timeout(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// A bound listening socket together with the address peers should dial.
#[derive(Debug)]
pub struct ServerSocket {
    /// Listening socket
    pub listener: TcpListener,
    /// Address advertised to peers
    pub address: Address,
}

/// Async transport trait for peer connections.
///
/// # Examples
///
/// ```no_run
/// use peerlink_transport::{Address, ClearNetTransport, Transport, TransportConfig};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let transport = ClearNetTransport::new(TransportConfig::default());
/// transport.initialize().await?;
///
/// let server = transport.server_socket(0, "alice").await?;
/// println!("Listening on {}", server.address);
///
/// let _stream = transport.client_socket(&server.address).await?;
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport kind implemented by this backend.
    fn transport_type(&self) -> TransportType;

    /// Prepare the transport (reach proxies, check the environment).
    ///
    /// # Errors
    /// Returns `TransportError` if the environment cannot support this
    /// transport; callers treat this as fatal to node startup.
    async fn initialize(&self) -> TransportResult<()>;

    /// Open a listening socket for `node_id` on `port` (0 selects a free port).
    ///
    /// # Errors
    /// Returns `TransportError` if binding fails or the transport is not initialized
    async fn server_socket(&self, port: u16, node_id: &str) -> TransportResult<ServerSocket>;

    /// Open a connected socket to `address`, through a proxy if required.
    ///
    /// # Errors
    /// Returns `TransportError` if the connection cannot be established
    async fn client_socket(&self, address: &Address) -> TransportResult<TcpStream>;

    /// Release transport resources. Subsequent socket requests fail with `Closed`.
    async fn shutdown(&self) -> TransportResult<()>;

    /// Check if `initialize()` completed successfully.
    fn is_initialized(&self) -> bool;

    /// Get transport statistics.
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Listening sockets opened
    pub server_sockets: u64,
    /// Outbound sockets opened successfully
    pub client_sockets: u64,
    /// Outbound socket attempts that failed
    pub connect_failures: u64,
}

impl TransportStats {
    /// Create new empty statistics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}
