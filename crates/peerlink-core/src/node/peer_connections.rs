//! Composition of the inbound and outbound managers behind one server socket

use crate::auth::AuthorizationService;
use crate::ban_list::BanList;
use crate::capability::Capability;
use crate::load::NetworkLoad;
use crate::node::config::NodeConfig;
use crate::node::connection::Connection;
use crate::node::error::{ConnectionError, Result};
use crate::node::handshake::HandshakeContext;
use crate::node::inbound::InboundConnectionManager;
use crate::node::node::NodeObserver;
use crate::node::outbound::OutboundConnectionManager;
use crate::node::{ConnectionContext, IncomingMessage};
use peerlink_transport::{Address, Transport};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Node-owned services the managers are wired to
#[derive(Clone)]
pub(crate) struct PeerServices {
    pub(crate) node_id: Arc<str>,
    pub(crate) auth: Arc<dyn AuthorizationService>,
    pub(crate) ban_list: BanList,
    pub(crate) load: NetworkLoad,
    pub(crate) dispatch: mpsc::Sender<IncomingMessage>,
    pub(crate) observer: Arc<NodeObserver>,
}

struct PeerConnectionsInner {
    inbound: InboundConnectionManager,
    outbound: OutboundConnectionManager,
    my_capability: Capability,
}

/// One inbound and one outbound manager sharing the node's capability
#[derive(Clone)]
pub struct PeerConnectionsManager {
    inner: Arc<PeerConnectionsInner>,
}

impl PeerConnectionsManager {
    /// Open the server socket on `port` and start both manager loops.
    ///
    /// # Errors
    /// Returns a transport error if the server socket cannot be opened.
    pub(crate) async fn start(
        transport: Arc<dyn Transport>,
        port: u16,
        config: &NodeConfig,
        services: PeerServices,
    ) -> Result<Self> {
        let server = transport.server_socket(port, &services.node_id).await?;
        let my_capability = Capability::new(server.address, config.advertised_transport_types());

        let ctx = ConnectionContext {
            node_id: services.node_id,
            handshake: HandshakeContext {
                auth: services.auth,
                ban_list: services.ban_list,
                my_capability: my_capability.clone(),
                timeout: config.connection.handshake_timeout,
            },
            load: services.load,
            config: config.connection.clone(),
            throttle: config.throttle.clone(),
            dispatch: services.dispatch,
            observer: services.observer,
        };

        let inbound = InboundConnectionManager::start(server.listener, ctx.clone());
        let outbound = OutboundConnectionManager::start(transport, ctx);
        tracing::info!("Peer connections started as {}", my_capability);

        Ok(Self {
            inner: Arc::new(PeerConnectionsInner {
                inbound,
                outbound,
                my_capability,
            }),
        })
    }

    /// Connection to `address`: an outbound one, else an inbound one whose
    /// peer declared that address, else a newly dialed one.
    ///
    /// # Errors
    /// Returns the dial or handshake fault.
    pub async fn get_connection(&self, address: &Address) -> std::result::Result<Connection, ConnectionError> {
        if let Some(connection) = self.find_connection(address) {
            return Ok(connection);
        }
        self.inner.outbound.get_connection(address).await
    }

    /// Existing live connection to `address`, outbound first
    pub fn find_connection(&self, address: &Address) -> Option<Connection> {
        self.inner
            .outbound
            .find_connection(address)
            .or_else(|| self.inner.inbound.find_by_address(address))
    }

    /// All live connections in both directions
    pub fn all_connections(&self) -> Vec<Connection> {
        let mut connections = self.inner.outbound.all();
        connections.extend(self.inner.inbound.all());
        connections
    }

    /// Number of live connections
    pub fn num_connections(&self) -> usize {
        self.all_connections().len()
    }

    /// Address peers dial to reach us
    pub fn my_address(&self) -> &Address {
        self.inner.my_capability.address()
    }

    /// Capability advertised in handshakes
    pub fn my_capability(&self) -> &Capability {
        &self.inner.my_capability
    }

    /// Inbound side
    pub fn inbound(&self) -> &InboundConnectionManager {
        &self.inner.inbound
    }

    /// Outbound side
    pub fn outbound(&self) -> &OutboundConnectionManager {
        &self.inner.outbound
    }

    /// Stop both loops and close every connection with `Shutdown`
    pub async fn shutdown(&self) {
        tokio::join!(self.inner.outbound.shutdown(), self.inner.inbound.shutdown());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::connection::Direction;
    use crate::node::connection::tests::test_auth;
    use peerlink_transport::{ClearNetTransport, TransportConfig, TransportType};
    use std::time::Duration;

    async fn started(name: &str) -> (PeerConnectionsManager, mpsc::Receiver<IncomingMessage>, NetworkLoad) {
        let transport = ClearNetTransport::new(TransportConfig::default());
        transport.initialize().await.unwrap();
        let (tx, rx) = mpsc::channel(64);
        let load = NetworkLoad::new();
        let services = PeerServices {
            node_id: Arc::from(name),
            auth: test_auth(),
            ban_list: BanList::new(),
            load: load.clone(),
            dispatch: tx,
            observer: Arc::new(NodeObserver::detached()),
        };
        let config = NodeConfig {
            supported_transport_types: vec![TransportType::Tor],
            ..NodeConfig::default()
        };
        let manager = PeerConnectionsManager::start(Arc::new(transport), 0, &config, services)
            .await
            .unwrap();
        (manager, rx, load)
    }

    #[tokio::test]
    async fn test_capability_advertises_server_address() {
        let (manager, _rx, _load) = started("alice").await;
        assert!(manager.my_address().port().unwrap_or(0) > 0);
        assert!(manager.my_capability().supports(TransportType::Clear));
        assert!(manager.my_capability().supports(TransportType::Tor));
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_inbound_connection_is_reused_for_declared_address() {
        let (alice, _alice_rx, alice_load) = started("alice").await;
        let (bob, _bob_rx, bob_load) = started("bob").await;

        let to_bob = alice.get_connection(bob.my_address()).await.unwrap();
        assert_eq!(to_bob.direction(), Direction::Outbound);

        // Bob answers over the inbound connection Alice opened
        let mut to_alice = None;
        for _ in 0..100 {
            to_alice = bob.find_connection(alice.my_address());
            if to_alice.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let to_alice = to_alice.unwrap();
        assert_eq!(to_alice.direction(), Direction::Inbound);
        let via_get = bob.get_connection(alice.my_address()).await.unwrap();
        assert_eq!(via_get.id(), to_alice.id());

        assert_eq!(alice.num_connections(), 1);
        assert_eq!(bob.num_connections(), 1);
        assert_eq!(alice_load.current().num_connections, 1);
        assert_eq!(bob_load.current().num_connections, 1);

        alice.shutdown().await;
        bob.shutdown().await;
    }
}
