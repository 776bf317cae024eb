//! Inbound connection manager
//!
//! One task owns the listening socket. It accepts sockets, drives every
//! in-flight responder handshake as a future inside the same loop, and
//! promotes sockets that pass into verified [`Connection`]s.

use crate::node::ConnectionContext;
use crate::node::close_reason::CloseReason;
use crate::node::connection::{Connection, Direction, RemoveOnClose};
use crate::node::handshake::{ConnectionHandshakeResponder, HandshakeOutcome};
use dashmap::DashMap;
use futures::stream::{FuturesUnordered, StreamExt};
use peerlink_transport::Address;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Pause after a failed `accept` so a persistent error (fd exhaustion) does
/// not spin the loop
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

struct InboundInner {
    connections: Arc<DashMap<String, Connection>>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Accepts peers on the node's server socket
#[derive(Clone)]
pub struct InboundConnectionManager {
    inner: Arc<InboundInner>,
}

impl InboundConnectionManager {
    /// Start the accept loop on `listener`
    pub(crate) fn start(listener: TcpListener, ctx: ConnectionContext) -> Self {
        let connections = Arc::new(DashMap::new());
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(accept_loop(
            listener,
            ctx,
            Arc::clone(&connections),
            shutdown_rx,
        ));
        Self {
            inner: Arc::new(InboundInner {
                connections,
                shutdown,
                task: Mutex::new(Some(task)),
            }),
        }
    }

    /// Live inbound connection whose peer declared `address`.
    ///
    /// The declared address is unverified; see
    /// [`Connection::is_peer_address_verified`].
    pub fn find_by_address(&self, address: &Address) -> Option<Connection> {
        self.inner
            .connections
            .iter()
            .find(|entry| !entry.is_stopped() && entry.peer_address() == address)
            .map(|entry| entry.value().clone())
    }

    /// All live inbound connections
    pub fn all(&self) -> Vec<Connection> {
        self.inner
            .connections
            .iter()
            .filter(|entry| !entry.is_stopped())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of tracked inbound connections
    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    /// True if no inbound connection is tracked
    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }

    /// Stop accepting, abandon in-flight handshakes and close all connections
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown.send(true);
        let task = self
            .inner
            .task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            let _ = task.await;
        }
        for connection in self.all() {
            connection.close(CloseReason::Shutdown);
        }
        tracing::debug!("Inbound connection manager stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: ConnectionContext,
    connections: Arc<DashMap<String, Connection>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut handshakes = FuturesUnordered::new();
    tracing::debug!("Node {} accepting inbound connections", ctx.node_id);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if connections.len() + handshakes.len() >= ctx.config.max_connections {
                        tracing::warn!(
                            "Refusing inbound socket from {}: {}",
                            remote,
                            CloseReason::TooManyInboundConnections
                        );
                        drop(stream);
                        continue;
                    }
                    if let Err(e) = stream.set_nodelay(true) {
                        tracing::debug!("Cannot disable Nagle for {}: {}", remote, e);
                    }
                    let responder = ConnectionHandshakeResponder::new(ctx.handshake.clone());
                    let my_load = ctx.load.current();
                    handshakes.push(async move {
                        (remote, responder.respond(stream, my_load).await)
                    });
                }
                Err(e) => {
                    tracing::warn!("Accept failed: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                }
            },
            Some((remote, result)) = handshakes.next(), if !handshakes.is_empty() => match result {
                Ok((stream, outcome)) => promote(&ctx, &connections, stream, outcome),
                Err(e) => tracing::info!("Inbound handshake from {} failed: {}", remote, e),
            },
        }
    }

    if !handshakes.is_empty() {
        tracing::debug!("Dropping {} in-flight inbound handshake(s)", handshakes.len());
    }
}

fn promote(
    ctx: &ConnectionContext,
    connections: &Arc<DashMap<String, Connection>>,
    stream: TcpStream,
    outcome: HandshakeOutcome,
) {
    let connection = Connection::new(stream, outcome, Direction::Inbound, ctx.throttle.clone());
    let id = connection.id().to_string();
    connection.add_listener(Arc::new(RemoveOnClose {
        map: Arc::clone(connections),
        key: id.clone(),
        load: ctx.load.clone(),
    }));
    connection.add_listener(ctx.observer.clone());

    ctx.load.connection_opened();
    connections.insert(id.clone(), connection.clone());
    connection.start_reading(ctx.dispatch.clone(), ctx.load.clone());

    // A close that raced the insert may have missed the map
    if connection.is_stopped() {
        if connections.remove_if(&id, |_, c| c == &connection).is_some() {
            ctx.load.connection_closed();
        }
        return;
    }
    ctx.observer.on_verified(&connection);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ban_list::BanList;
    use crate::load::Load;
    use crate::node::error::Reason;
    use crate::node::handshake::ConnectionHandshake;
    use crate::node::test_support::context;

    async fn bind() -> (TcpListener, Address) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, Address::localhost(port))
    }

    async fn wait_for(mut check: impl FnMut() -> bool) {
        for _ in 0..100 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn test_accepts_and_verifies_peer() {
        let (listener, address) = bind().await;
        let (server_ctx, _server_rx) = context(address.clone(), BanList::new());
        let load = server_ctx.load.clone();
        let manager = InboundConnectionManager::start(listener, server_ctx);

        let (client_ctx, _client_rx) = context(Address::localhost(4000), BanList::new());
        let stream = TcpStream::connect(("127.0.0.1", address.port().unwrap()))
            .await
            .unwrap();
        let (_stream, outcome) = ConnectionHandshake::new(client_ctx.handshake, address.clone())
            .start(stream, Load::new(0))
            .await
            .unwrap();
        assert_eq!(outcome.peer_capability.address(), &address);

        wait_for(|| manager.len() == 1).await;
        let connection = manager.find_by_address(&Address::localhost(4000)).unwrap();
        assert_eq!(connection.direction(), Direction::Inbound);
        assert!(!connection.is_peer_address_verified());
        assert_eq!(load.current(), Load::new(1));

        manager.shutdown().await;
        wait_for(|| manager.is_empty()).await;
        assert_eq!(load.current(), Load::new(0));
    }

    #[tokio::test]
    async fn test_banned_peer_is_never_promoted() {
        let (listener, address) = bind().await;
        let bans: BanList = [Address::localhost(4000)].into_iter().collect();
        let (server_ctx, _rx) = context(address.clone(), bans);
        let manager = InboundConnectionManager::start(listener, server_ctx);

        let (client_ctx, _client_rx) = context(Address::localhost(4000), BanList::new());
        let stream = TcpStream::connect(("127.0.0.1", address.port().unwrap()))
            .await
            .unwrap();
        let err = ConnectionHandshake::new(client_ctx.handshake, address)
            .start(stream, Load::new(0))
            .await
            .unwrap_err();
        assert_eq!(err.reason, Reason::MissingPayload);
        assert!(manager.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_refuses_beyond_max_connections() {
        let (listener, address) = bind().await;
        let (mut server_ctx, _rx) = context(address.clone(), BanList::new());
        server_ctx.config.max_connections = 0;
        let manager = InboundConnectionManager::start(listener, server_ctx);

        let (client_ctx, _client_rx) = context(Address::localhost(4000), BanList::new());
        let stream = TcpStream::connect(("127.0.0.1", address.port().unwrap()))
            .await
            .unwrap();
        let result = ConnectionHandshake::new(client_ctx.handshake, address)
            .start(stream, Load::new(0))
            .await;
        assert!(result.is_err());
        assert!(manager.is_empty());
        manager.shutdown().await;
    }
}
