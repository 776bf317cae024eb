//! Outbound connection manager
//!
//! Callers ask for a connection by address. Concurrent callers for the same
//! address share one pending entry, so at most one socket is dialed per
//! address at a time; every waiter receives the same result. Dials and
//! initiator handshakes run as futures inside a single loop task.

use crate::load::Load;
use crate::node::ConnectionContext;
use crate::node::close_reason::CloseReason;
use crate::node::connection::{Connection, Direction, RemoveOnClose};
use crate::node::error::{ConnectionError, Reason};
use crate::node::handshake::{ConnectionHandshake, HandshakeOutcome};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::stream::{FuturesUnordered, StreamExt};
use peerlink_transport::{Address, Transport};
use std::sync::{Arc, Mutex};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

type Waiter = oneshot::Sender<Result<Connection, ConnectionError>>;
type PendingMap = DashMap<Address, Vec<Waiter>>;

struct OutboundInner {
    verified: Arc<DashMap<Address, Connection>>,
    pending: Arc<PendingMap>,
    requests: mpsc::UnboundedSender<Address>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    ctx: ConnectionContext,
}

/// Dials peers and keeps one verified connection per address
#[derive(Clone)]
pub struct OutboundConnectionManager {
    inner: Arc<OutboundInner>,
}

impl OutboundConnectionManager {
    /// Start the connect loop using `transport` for sockets
    pub(crate) fn start(transport: Arc<dyn Transport>, ctx: ConnectionContext) -> Self {
        let verified = Arc::new(DashMap::new());
        let pending = Arc::new(DashMap::new());
        let (requests, requests_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(connect_loop(
            transport,
            ctx.clone(),
            Arc::clone(&verified),
            Arc::clone(&pending),
            requests_rx,
            shutdown_rx,
        ));
        Self {
            inner: Arc::new(OutboundInner {
                verified,
                pending,
                requests,
                shutdown,
                task: Mutex::new(Some(task)),
                ctx,
            }),
        }
    }

    /// Live verified connection to `address`, if any
    pub fn find_connection(&self, address: &Address) -> Option<Connection> {
        self.inner
            .verified
            .get(address)
            .filter(|c| !c.is_stopped())
            .map(|c| c.value().clone())
    }

    /// Return the verified connection to `address`, dialing one if needed.
    ///
    /// # Errors
    /// Returns the transport or handshake fault of the dial this call joined,
    /// `AddressBanned` for banned peers, or `Closed` after shutdown.
    pub async fn get_connection(&self, address: &Address) -> Result<Connection, ConnectionError> {
        if let Some(connection) = self.find_connection(address) {
            return Ok(connection);
        }
        if self.inner.ctx.handshake.ban_list.is_banned(address) {
            return Err(ConnectionError::new(
                Reason::AddressBanned,
                format!("peer {address} is banned"),
            ));
        }
        if *self.inner.shutdown.borrow() {
            return Err(ConnectionError::closed("outbound manager stopped"));
        }

        let (tx, rx) = oneshot::channel();
        let needs_dial = match self.inner.pending.entry(address.clone()) {
            Entry::Occupied(mut entry) => {
                entry.get_mut().push(tx);
                false
            }
            Entry::Vacant(entry) => {
                // The dial may have completed between the lookup and the entry lock
                if let Some(connection) = self.find_connection(address) {
                    return Ok(connection);
                }
                entry.insert(vec![tx]);
                true
            }
        };

        // Shutdown may have drained the pending map after the check above
        if *self.inner.shutdown.borrow() {
            self.inner.pending.remove(address);
            return Err(ConnectionError::closed("outbound manager stopped"));
        }

        if needs_dial {
            tracing::debug!("Requesting outbound connection to {}", address);
            if self.inner.requests.send(address.clone()).is_err() {
                self.inner.pending.remove(address);
                return Err(ConnectionError::closed("outbound manager stopped"));
            }
        }

        rx.await
            .map_err(|_| ConnectionError::closed("outbound manager stopped"))?
    }

    /// All live outbound connections
    pub fn all(&self) -> Vec<Connection> {
        self.inner
            .verified
            .iter()
            .filter(|entry| !entry.is_stopped())
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Number of tracked outbound connections
    pub fn len(&self) -> usize {
        self.inner.verified.len()
    }

    /// True if no outbound connection is tracked
    pub fn is_empty(&self) -> bool {
        self.inner.verified.is_empty()
    }

    /// Number of addresses with a dial in progress
    pub fn num_pending(&self) -> usize {
        self.inner.pending.len()
    }

    /// Stop dialing, fail waiters and close all connections
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
        self.inner.pending.clear();
        for connection in self.all() {
            connection.close(CloseReason::Shutdown);
        }
        tracing::debug!("Outbound connection manager stopped");
    }
}

async fn connect_loop(
    transport: Arc<dyn Transport>,
    ctx: ConnectionContext,
    verified: Arc<DashMap<Address, Connection>>,
    pending: Arc<PendingMap>,
    mut requests: mpsc::UnboundedReceiver<Address>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut dials = FuturesUnordered::new();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            request = requests.recv() => match request {
                Some(address) => {
                    let handshake = ConnectionHandshake::new(ctx.handshake.clone(), address.clone());
                    dials.push(dial(Arc::clone(&transport), handshake, address, ctx.load.current()));
                }
                None => break,
            },
            Some((address, result)) = dials.next(), if !dials.is_empty() => {
                let result = match result {
                    Ok((stream, outcome)) => Ok(promote(&ctx, &verified, &address, stream, outcome)),
                    Err(e) => {
                        tracing::info!("Outbound connection to {} failed: {}", address, e);
                        Err(e)
                    }
                };
                if let Some((_, waiters)) = pending.remove(&address) {
                    for waiter in waiters {
                        let _ = waiter.send(result.clone());
                    }
                }
            },
        }
    }

    // Dropping the senders fails every remaining waiter
    pending.clear();
}

async fn dial(
    transport: Arc<dyn Transport>,
    handshake: ConnectionHandshake,
    address: Address,
    my_load: Load,
) -> (Address, Result<(TcpStream, HandshakeOutcome), ConnectionError>) {
    let result = match transport.client_socket(&address).await {
        Ok(stream) => handshake.start(stream, my_load).await,
        Err(e) => Err(e.into()),
    };
    (address, result)
}

fn promote(
    ctx: &ConnectionContext,
    verified: &Arc<DashMap<Address, Connection>>,
    address: &Address,
    stream: TcpStream,
    outcome: HandshakeOutcome,
) -> Connection {
    let connection = Connection::new(stream, outcome, Direction::Outbound, ctx.throttle.clone());
    connection.add_listener(Arc::new(RemoveOnClose {
        map: Arc::clone(verified),
        key: address.clone(),
        load: ctx.load.clone(),
    }));
    connection.add_listener(ctx.observer.clone());

    let existing = match verified.entry(address.clone()) {
        Entry::Occupied(entry) if !entry.get().is_stopped() => Some(entry.get().clone()),
        Entry::Occupied(mut entry) => {
            // Replaced before its close listener ran, so release its load here
            entry.insert(connection.clone());
            ctx.load.connection_closed();
            None
        }
        Entry::Vacant(entry) => {
            entry.insert(connection.clone());
            None
        }
    };
    if let Some(existing) = existing {
        connection.close(CloseReason::DuplicateConnection);
        return existing;
    }

    ctx.load.connection_opened();
    connection.start_reading(ctx.dispatch.clone(), ctx.load.clone());
    if connection.is_stopped() {
        if verified.remove_if(address, |_, c| c == &connection).is_some() {
            ctx.load.connection_closed();
        }
        return connection;
    }
    ctx.observer.on_verified(&connection);
    connection
}
