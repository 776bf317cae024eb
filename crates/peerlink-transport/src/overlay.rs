//! Tor and I2P overlay transports.
//!
//! Both overlays are reached through a SOCKS5 proxy run by the local daemon.
//! Inbound traffic arrives on a plain local listener that the daemon forwards
//! the hidden service (or I2P tunnel) to, so the node advertises the
//! configured service hostname instead of the local socket address.

use crate::address::{Address, TransportType};
use crate::transport::{ServerSocket, Transport, TransportError, TransportResult, TransportStats};
use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_socks::tcp::Socks5Stream;

/// Tor SOCKS port
pub const TOR_SOCKS_PORT: u16 = 9050;

/// I2P SOCKS port
pub const I2P_SOCKS_PORT: u16 = 4447;

/// Overlay transport configuration
#[derive(Debug, Clone)]
pub struct OverlayConfig {
    /// SOCKS5 proxy exposed by the overlay daemon
    pub socks_proxy: SocketAddr,
    /// Hidden-service / tunnel hostname advertised to peers
    pub service_host: Option<String>,
    /// Interface the local forwarding listener binds to
    pub bind_host: IpAddr,
    /// How long `initialize()` waits for the proxy to answer
    pub check_timeout: Duration,
}

impl OverlayConfig {
    /// Defaults for a local Tor daemon
    #[must_use]
    pub fn tor_default() -> Self {
        Self::local(TOR_SOCKS_PORT)
    }

    /// Defaults for a local I2P router
    #[must_use]
    pub fn i2p_default() -> Self {
        Self::local(I2P_SOCKS_PORT)
    }

    fn local(socks_port: u16) -> Self {
        Self {
            socks_proxy: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), socks_port),
            service_host: None,
            bind_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            check_timeout: Duration::from_secs(5),
        }
    }
}

/// Transport that dials through an overlay daemon's SOCKS5 proxy.
pub struct OverlayTransport {
    kind: TransportType,
    config: OverlayConfig,
    connect_timeout: Duration,
    initialized: AtomicBool,
    closed: AtomicBool,
    server_sockets: AtomicU64,
    client_sockets: AtomicU64,
    connect_failures: AtomicU64,
}

impl OverlayTransport {
    /// Tor transport
    #[must_use]
    pub fn tor(config: OverlayConfig, connect_timeout: Duration) -> Self {
        Self::with_kind(TransportType::Tor, config, connect_timeout)
    }

    /// I2P transport
    #[must_use]
    pub fn i2p(config: OverlayConfig, connect_timeout: Duration) -> Self {
        Self::with_kind(TransportType::I2p, config, connect_timeout)
    }

    fn with_kind(kind: TransportType, config: OverlayConfig, connect_timeout: Duration) -> Self {
        Self {
            kind,
            config,
            connect_timeout,
            initialized: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            server_sockets: AtomicU64::new(0),
            client_sockets: AtomicU64::new(0),
            connect_failures: AtomicU64::new(0),
        }
    }

    /// Overlay configuration
    pub fn config(&self) -> &OverlayConfig {
        &self.config
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

    /// Check that the daemon's proxy port accepts connections
    async fn check_proxy(&self) -> TransportResult<()> {
        let proxy = self.config.socks_proxy;
        match tokio::time::timeout(self.config.check_timeout, TcpStream::connect(proxy)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(TransportError::ProxyUnavailable(format!("{proxy}: {e}"))),
            Err(_) => Err(TransportError::ProxyUnavailable(format!(
                "{proxy}: no answer to proxy check"
            ))),
        }
    }

    /// Open a stream to `target` through the proxy. Overlay hostnames are
    /// sent unresolved so the daemon can route them.
    async fn dial(&self, target: &Address) -> TransportResult<TcpStream> {
        let port = target
            .port()
            .ok_or_else(|| TransportError::InvalidAddress(format!("{target} has no port")))?;
        let proxy = self.config.socks_proxy;

        let connect = Socks5Stream::connect(proxy, (target.host(), port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream.into_inner(),
            Ok(Err(e)) => return Err(socks_error(proxy, target, e)),
            Err(_) => {
                return Err(TransportError::Timeout(format!(
                    "connecting to {target} via {proxy}"
                )));
            }
        };
        stream.set_nodelay(true)?;
        Ok(stream)
    }
}

fn socks_error(proxy: SocketAddr, target: &Address, err: tokio_socks::Error) -> TransportError {
    use tokio_socks::Error as Socks;
    match &err {
        Socks::Io(e) => TransportError::ProxyUnavailable(format!("{proxy}: {e}")),
        Socks::ProxyServerUnreachable => {
            TransportError::ProxyUnavailable(format!("{proxy}: unreachable"))
        }
        Socks::GeneralSocksServerFailure
        | Socks::ConnectionNotAllowedByRuleset
        | Socks::NetworkUnreachable
        | Socks::HostUnreachable
        | Socks::ConnectionRefused
        | Socks::TtlExpired => {
            TransportError::ConnectionFailed(format!("proxy refused {target}: {err}"))
        }
        other => TransportError::Proxy(format!("{proxy}: {other}")),
    }
}

#[async_trait]
impl Transport for OverlayTransport {
    fn transport_type(&self) -> TransportType {
        self.kind
    }

    async fn initialize(&self) -> TransportResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.check_proxy().await?;
        self.initialized.store(true, Ordering::Release);
        tracing::info!(
            "{} transport initialized (proxy {})",
            self.kind,
            self.config.socks_proxy
        );
        Ok(())
    }

    async fn server_socket(&self, port: u16, node_id: &str) -> TransportResult<ServerSocket> {
        self.ensure_usable()?;
        let service_host = self.config.service_host.as_deref().ok_or_else(|| {
            TransportError::InvalidConfig(format!("{} service host is not configured", self.kind))
        })?;

        let listener = TcpListener::bind(SocketAddr::new(self.config.bind_host, port))
            .await
            .map_err(|e| TransportError::BindFailed(e.to_string()))?;
        let local = listener.local_addr()?;
        let address = Address::new(service_host, local.port())
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        self.server_sockets.fetch_add(1, Ordering::Relaxed);

        tracing::info!(
            "{} server socket for node {} forwarded from {} to {}",
            self.kind,
            node_id,
            address,
            local
        );
        Ok(ServerSocket { listener, address })
    }

    async fn client_socket(&self, address: &Address) -> TransportResult<TcpStream> {
        self.ensure_usable()?;
        match self.dial(address).await {
            Ok(stream) => {
                self.client_sockets.fetch_add(1, Ordering::Relaxed);
                Ok(stream)
            }
            Err(e) => {
                self.connect_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("{} connect to {} failed: {}", self.kind, address, e);
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

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::sync::mpsc;

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    /// SOCKS5 server answering every `CONNECT` with `reply_code`. Requested
    /// targets are reported on the returned channel; accepted streams echo.
    async fn spawn_fake_proxy(reply_code: u8) -> (SocketAddr, mpsc::UnboundedReceiver<(String, u16)>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(serve_socks(stream, reply_code, tx.clone()));
            }
        });
        (addr, rx)
    }

    async fn serve_socks(
        mut stream: TcpStream,
        reply_code: u8,
        targets: mpsc::UnboundedSender<(String, u16)>,
    ) -> Option<()> {
        let mut greeting = [0u8; 2];
        stream.read_exact(&mut greeting).await.ok()?;
        let mut methods = vec![0u8; usize::from(greeting[1])];
        stream.read_exact(&mut methods).await.ok()?;
        stream.write_all(&[0x05, 0x00]).await.ok()?;

        // VER CMD RSV ATYP=domain LEN
        let mut header = [0u8; 5];
        stream.read_exact(&mut header).await.ok()?;
        let mut host = vec![0u8; usize::from(header[4])];
        stream.read_exact(&mut host).await.ok()?;
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await.ok()?;
        targets
            .send((String::from_utf8(host).ok()?, u16::from_be_bytes(port)))
            .ok()?;

        stream
            .write_all(&[0x05, reply_code, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
            .await
            .ok()?;
        if reply_code == 0 {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.ok()?;
            stream.write_all(&buf).await.ok()?;
        }
        Some(())
    }

    #[test]
    fn test_default_proxy_ports() {
        assert_eq!(OverlayConfig::tor_default().socks_proxy.port(), 9050);
        assert_eq!(OverlayConfig::i2p_default().socks_proxy.port(), 4447);
    }

    #[tokio::test]
    async fn test_initialize_fails_without_proxy() {
        let config = OverlayConfig {
            socks_proxy: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), unused_port()),
            ..OverlayConfig::tor_default()
        };
        let transport = OverlayTransport::tor(config, Duration::from_secs(1));
        assert!(matches!(
            transport.initialize().await,
            Err(TransportError::ProxyUnavailable(_))
        ));
        assert!(!transport.is_initialized());
    }

    #[tokio::test]
    async fn test_server_socket_requires_service_host() {
        let (proxy, _targets) = spawn_fake_proxy(0).await;
        let config = OverlayConfig {
            socks_proxy: proxy,
            ..OverlayConfig::i2p_default()
        };
        let transport = OverlayTransport::i2p(config, Duration::from_secs(1));
        transport.initialize().await.unwrap();
        assert!(matches!(
            transport.server_socket(0, "n").await,
            Err(TransportError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_server_socket_advertises_service_host() {
        let (proxy, _targets) = spawn_fake_proxy(0).await;
        let config = OverlayConfig {
            socks_proxy: proxy,
            service_host: Some("exampleonionaddress.onion".to_string()),
            ..OverlayConfig::tor_default()
        };
        let transport = OverlayTransport::tor(config, Duration::from_secs(1));
        transport.initialize().await.unwrap();

        let server = transport.server_socket(0, "n").await.unwrap();
        assert_eq!(server.address.host(), "exampleonionaddress.onion");
        assert_eq!(
            server.address.port(),
            Some(server.listener.local_addr().unwrap().port())
        );
    }

    #[tokio::test]
    async fn test_client_socket_goes_through_proxy() {
        let (proxy, mut targets) = spawn_fake_proxy(0).await;
        let config = OverlayConfig {
            socks_proxy: proxy,
            ..OverlayConfig::tor_default()
        };
        let transport = OverlayTransport::tor(config, Duration::from_secs(5));
        transport.initialize().await.unwrap();

        let target: Address = "peer.onion:7000".parse().unwrap();
        let mut stream = transport.client_socket(&target).await.unwrap();
        stream.write_all(b"data").await.unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"data");

        assert_eq!(targets.recv().await, Some(("peer.onion".to_string(), 7000)));
        assert_eq!(transport.stats().client_sockets, 1);
    }

    #[tokio::test]
    async fn test_client_socket_refused_by_proxy() {
        // 0x05: connection refused
        let (proxy, _targets) = spawn_fake_proxy(0x05).await;
        let config = OverlayConfig {
            socks_proxy: proxy,
            ..OverlayConfig::i2p_default()
        };
        let transport = OverlayTransport::i2p(config, Duration::from_secs(5));
        transport.initialize().await.unwrap();

        let target: Address = "peer.i2p:1".parse().unwrap();
        assert!(matches!(
            transport.client_socket(&target).await,
            Err(TransportError::ConnectionFailed(_))
        ));
        assert_eq!(transport.stats().connect_failures, 1);
    }

    #[tokio::test]
    async fn test_client_socket_requires_port() {
        let (proxy, _targets) = spawn_fake_proxy(0).await;
        let config = OverlayConfig {
            socks_proxy: proxy,
            ..OverlayConfig::tor_default()
        };
        let transport = OverlayTransport::tor(config, Duration::from_secs(5));
        transport.initialize().await.unwrap();

        let target = Address::host_only("peer.onion").unwrap();
        assert!(matches!(
            transport.client_socket(&target).await,
            Err(TransportError::InvalidAddress(_))
        ));
    }
}
