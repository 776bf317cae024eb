//! Clear-net TCP transport.

use crate::TransportConfig;
use crate::address::{Address, TransportType};
use crate::transport::{ServerSocket, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::net::{TcpListener, TcpStream};

/// Plain TCP transport.
///
/// Server sockets are created through `socket2` so address reuse can be set
/// before binding; restarting a node on the same port must not fail on
/// lingering `TIME_WAIT` sockets.
pub struct ClearNetTransport {
    config: TransportConfig,
    initialized: AtomicBool,
    closed: AtomicBool,
    server_sockets: AtomicU64,
    client_sockets: AtomicU64,
    connect_failures: AtomicU64,
}

impl ClearNetTransport {
    /// Create a new clear-net transport
    #[must_use]
    pub fn new(config: TransportConfig) -> Self {
        Self {
            config,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            server_sockets: AtomicU64::new(0),
            client_sockets: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
        }
    }

    fn ensure_usable(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if !self.initialized.load(Ordering::Acquire) {
            return Err(TransportError::NotInitialized);
        }
        Ok(())
    }

    fn bind_listener(&self, port: u16) -> TransportResult<TcpListener> {
        let addr = SocketAddr::new(self.config.bind_host, port);
        let domain = if addr.is_ipv4() {
            socket2::Domain::IPV4
        } else {
            socket2::Domain::IPV6
        };

        let socket =
            socket2::Socket::new(domain, socket2::Type::STREAM, Some(socket2::Protocol::TCP))
                .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .bind(&addr.into())
            .map_err(|e| TransportError::BindFailed(format!("{addr}: {e}")))?;
        socket
            .listen(self.config.listen_backlog)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        socket
            .set_nonblocking(true)
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;

        let std_listener: std::net::TcpListener = socket.into();
        TcpListener::from_std(std_listener).map_err(|e| TransportError::BindFailed(e.to_string()))
    }

    fn advertised_address(&self, local: SocketAddr) -> TransportResult<Address> {
        if let Some(host) = &self.config.public_host {
            return Address::new(host.as_str(), local.port())
                .map_err(|e| TransportError::InvalidConfig(e.to_string()));
        }
        if local.ip().is_unspecified() {
            return Ok(Address::localhost(local.port()));
        }
        Ok(Address::from(local))
    }
}

#[async_trait]
impl Transport for ClearNetTransport {
    fn transport_type(&self) -> TransportType {
        TransportType::Clear
    }

    async fn initialize(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.initialized.store(true, Ordering::Release);
        tracing::debug!("Clear-net transport initialized");
        Ok(())
    }

    async fn server_socket(&self, port: u16, node_id: &str) -> TransportResult<ServerSocket> {
        self.ensure_usable()?;
        let listener = self.bind_listener(port)?;
        let local = listener.local_addr()?;
        let address = self.advertised_address(local)?;
        self.server_sockets.fetch_add(1, Ordering::Relaxed);

        tracing::info!("Server socket for node {} listening on {} ({})", node_id, local, address);
        Ok(ServerSocket { listener, address })
    }

    async fn client_socket(&self, address: &Address) -> TransportResult<TcpStream> {
        self.ensure_usable()?;
        let port = address
            .port()
            .ok_or_else(|| TransportError::InvalidAddress(format!("{address} has no port")))?;

        let connect = TcpStream::connect((address.host(), port));
        let result = match tokio::time::timeout(self.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(TransportError::ConnectionFailed(format!("{address}: {e}"))),
            Err(_) => Err(TransportError::Timeout(format!("connecting to {address}"))),
        };

        match result {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                self.client_sockets.fetch_add(1, Ordering::Relaxed);
                Ok(stream)
            }
            Err(e) => {
                self.connect_failures.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    async fn shutdown(&self) -> TransportResult<()> {
        self.closed.store(true, Ordering::Release);
        self.initialized.store(false, Ordering::Release);
        Ok(())
    }

    fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    fn stats(&self) -> TransportStats {
        TransportStats {
            server_sockets: self.server_sockets.load(Ordering::Relaxed),
            client_sockets: self.client_sockets.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
        }
    }
}
