//! Verified peer connections
//!
//! A [`Connection`] only exists after a successful handshake. Sends are
//! serialized by one writer lock that also guards the message counter, so the
//! counter order seen by the peer always matches the wire order. Inbound
//! frames are read by a per-connection task that only decodes and forwards to
//! the node dispatcher.

use crate::auth::AuthorizationService;
use crate::capability::Capability;
use crate::frame::{read_envelope, write_envelope};
use crate::load::{Load, NetworkLoad};
use crate::message::{Envelope, NetworkMessage};
use crate::node::close_reason::{CloseDetails, CloseReason};
use crate::node::error::{ConnectionError, Reason};
use crate::node::handshake::{HandshakeMetrics, HandshakeOutcome};
use crate::node::listener::{ConnectionListener, ListenerId};
use crate::node::{IncomingMessage, random_id};
use crate::throttle::{ConnectionThrottle, ThrottleConfig};
use dashmap::DashMap;
use peerlink_transport::Address;
use std::fmt;
use std::hash::Hash;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// How long a closing connection waits for an in-flight send to release the writer
const WRITER_RELEASE_TIMEOUT: Duration = Duration::from_secs(1);

/// Which side opened the socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Peer connected to our server socket
    Inbound,
    /// We dialed the peer
    Outbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Per-connection traffic counters
#[derive(Debug, Default)]
struct ConnectionMetrics {
    sent_messages: AtomicU64,
    sent_bytes: AtomicU64,
    received_messages: AtomicU64,
    received_bytes: AtomicU64,
    unauthorized_messages: AtomicU64,
}

/// Snapshot of a connection's metrics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionStats {
    /// Messages written
    pub sent_messages: u64,
    /// Bytes written, including framing
    pub sent_bytes: u64,
    /// Messages read
    pub received_messages: u64,
    /// Bytes read, including framing
    pub received_bytes: u64,
    /// Received messages dropped for failing authorization
    pub unauthorized_messages: u64,
    /// Handshake measurements
    pub handshake: HandshakeMetrics,
    /// Time since the connection was verified
    pub age: Duration,
}

struct WriterState {
    writer: Option<OwnedWriteHalf>,
    counter: u64,
}

enum ReaderState {
    Idle(OwnedReadHalf),
    Running(JoinHandle<()>),
    Done,
}

struct ConnectionInner {
    id: String,
    direction: Direction,
    peer_capability: Capability,
    peer_load: Load,
    my_load: Load,
    remote_addr: Option<SocketAddr>,
    handshake: HandshakeMetrics,
    created_at: Instant,
    writer: tokio::sync::Mutex<WriterState>,
    reader: Mutex<ReaderState>,
    throttle: ConnectionThrottle,
    metrics: ConnectionMetrics,
    stopped: AtomicBool,
    listening: AtomicBool,
    listeners: DashMap<ListenerId, Arc<dyn ConnectionListener>>,
    next_listener_id: AtomicU64,
    close_details: OnceLock<CloseDetails>,
    runtime: tokio::runtime::Handle,
}

/// An authenticated, running channel to one peer.
///
/// Cheap to clone; all clones refer to the same socket.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("direction", &self.inner.direction)
            .field("peer", &self.inner.peer_capability.address())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} connection {} to {}",
            self.inner.direction,
            &self.inner.id[..8.min(self.inner.id.len())],
            self.inner.peer_capability.address()
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Connection {
    /// Wrap a socket that completed the handshake.
    ///
    /// Must be called from within a Tokio runtime. Reading starts only after
    /// [`Connection::start_reading`] so owners can register listeners first.
    pub(crate) fn new(
        stream: TcpStream,
        outcome: HandshakeOutcome,
        direction: Direction,
        throttle: ThrottleConfig,
    ) -> Self {
        let remote_addr = stream.peer_addr().ok();
        let (read_half, write_half) = stream.into_split();
        let inner = ConnectionInner {
            id: random_id(),
            direction,
            peer_capability: outcome.peer_capability,
            peer_load: outcome.peer_load,
            my_load: outcome.my_load,
            remote_addr,
            handshake: outcome.metrics,
            created_at: Instant::now(),
            writer: tokio::sync::Mutex::new(WriterState {
                writer: Some(write_half),
                counter: 0,
            }),
            reader: Mutex::new(ReaderState::Idle(read_half)),
            throttle: ConnectionThrottle::new(throttle),
            metrics: ConnectionMetrics::default(),
            stopped: AtomicBool::new(false),
            listening: AtomicBool::new(true),
            listeners: DashMap::new(),
            next_listener_id: AtomicU64::new(0),
            close_details: OnceLock::new(),
            runtime: tokio::runtime::Handle::current(),
        };
        tracing::info!(
            "New {} connection {} with {} ({})",
            direction,
            inner.id,
            inner.peer_capability,
            inner.peer_load
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Spawn the reader task forwarding envelopes to `dispatch`
    pub(crate) fn start_reading(&self, dispatch: mpsc::Sender<IncomingMessage>, load: NetworkLoad) {
        let mut reader = lock(&self.inner.reader);
        let state = std::mem::replace(&mut *reader, ReaderState::Done);
        match state {
            ReaderState::Idle(half) if !self.is_stopped() => {
                let connection = self.clone();
                let handle = self
                    .inner
                    .runtime
                    .spawn(connection.read_loop(half, dispatch, load));
                *reader = ReaderState::Running(handle);
            }
            other => *reader = other,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl Connection {
    /// Unique connection id
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Which side opened the socket
    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    /// True only for outbound connections, where we dialed the peer's
    /// address ourselves. An inbound peer's address is self-declared.
    pub fn is_peer_address_verified(&self) -> bool {
        self.inner.direction == Direction::Outbound
    }

    /// Peer capability received during the handshake
    pub fn peer_capability(&self) -> &Capability {
        &self.inner.peer_capability
    }

    /// Peer's declared address
    pub fn peer_address(&self) -> &Address {
        self.inner.peer_capability.address()
    }

    /// Peer load received during the handshake
    pub fn peer_load(&self) -> Load {
        self.inner.peer_load
    }

    /// Load we advertised to the peer during the handshake
    pub fn my_load(&self) -> Load {
        self.inner.my_load
    }

    /// Socket address of the remote end
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.inner.remote_addr
    }

    /// True once `close` has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }

    /// False after `stop_listening`
    pub fn is_listening(&self) -> bool {
        self.inner.listening.load(Ordering::Acquire)
    }

    /// Why the connection was closed, once it has been
    pub fn close_details(&self) -> Option<&CloseDetails> {
        self.inner.close_details.get()
    }

    /// Snapshot of traffic counters
    pub fn stats(&self) -> ConnectionStats {
        let m = &self.inner.metrics;
        ConnectionStats {
            sent_messages: m.sent_messages.load(Ordering::Relaxed),
            sent_bytes: m.sent_bytes.load(Ordering::Relaxed),
            received_messages: m.received_messages.load(Ordering::Relaxed),
            received_bytes: m.received_bytes.load(Ordering::Relaxed),
            unauthorized_messages: m.unauthorized_messages.load(Ordering::Relaxed),
            handshake: self.inner.handshake,
            age: self.inner.created_at.elapsed(),
        }
    }

    pub(crate) fn record_unauthorized(&self) -> u64 {
        self.inner
            .metrics
            .unauthorized_messages
            .fetch_add(1, Ordering::Relaxed)
            + 1
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Listener Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Connection {
    /// Register a close listener
    pub fn add_listener(&self, listener: Arc<dyn ConnectionListener>) -> ListenerId {
        let id = ListenerId::next(&self.inner.next_listener_id);
        self.inner.listeners.insert(id, listener);
        id
    }

    /// Remove a close listener; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(&id).is_some()
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// I/O Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Connection {
    /// Authorize and write `message`.
    ///
    /// Fails immediately without touching the socket once the connection is
    /// stopped. A write failure closes the connection with
    /// [`CloseReason::Exception`]; callers must not retry on this instance.
    ///
    /// # Errors
    /// Returns a `Closed` fault if already stopped, otherwise the I/O or
    /// authorization fault that killed the connection.
    pub async fn send(
        &self,
        message: NetworkMessage,
        auth: &dyn AuthorizationService,
    ) -> Result<Connection, ConnectionError> {
        if self.is_stopped() {
            return Err(ConnectionError::closed("connection is closed"));
        }
        self.inner.throttle.throttle_send(self.peer_load()).await;

        let result = self.write_authorized(message, auth).await;
        match result {
            Ok(bytes) => {
                self.inner.metrics.sent_messages.fetch_add(1, Ordering::Relaxed);
                self.inner
                    .metrics
                    .sent_bytes
                    .fetch_add(bytes as u64, Ordering::Relaxed);
                Ok(self.clone())
            }
            Err(e) if e.reason == Reason::Closed => Err(e),
            Err(e) => {
                if !self.is_stopped() {
                    self.close(
                        CloseDetails::new(CloseReason::Exception)
                            .with_details("send failed")
                            .with_cause(&e),
                    );
                }
                Err(e)
            }
        }
    }

    async fn write_authorized(
        &self,
        message: NetworkMessage,
        auth: &dyn AuthorizationService,
    ) -> Result<usize, ConnectionError> {
        let mut state = self.inner.writer.lock().await;
        if self.is_stopped() {
            return Err(ConnectionError::closed("connection closed while waiting to send"));
        }
        let WriterState { writer, counter } = &mut *state;
        let writer = writer
            .as_mut()
            .ok_or_else(|| ConnectionError::closed("socket released"))?;

        *counter += 1;
        let token = auth
            .create_token(&message, self.peer_load(), self.peer_address(), *counter)
            .await
            .map_err(|e| ConnectionError::new(Reason::Io, e.to_string()))?;
        let bytes = write_envelope(writer, &Envelope::new(token, message)).await?;
        Ok(bytes)
    }

    /// Stop delivering inbound messages without closing the socket
    pub fn stop_listening(&self) {
        if self.inner.listening.swap(false, Ordering::AcqRel) {
            tracing::debug!("{} stopped listening", self);
        }
    }

    /// Close the connection. Safe to call repeatedly; only the first call
    /// has an effect.
    ///
    /// The socket is released and listeners are notified on a spawned task.
    pub fn close(&self, details: impl Into<CloseDetails>) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let details = details.into();
        let _ = self.inner.close_details.set(details.clone());
        self.inner.listening.store(false, Ordering::Release);

        if details.reason.is_graceful() {
            tracing::info!("Closing {}: {}", self, details);
        } else {
            tracing::warn!("Closing {}: {}", self, details);
        }

        match std::mem::replace(&mut *lock(&self.inner.reader), ReaderState::Done) {
            ReaderState::Running(handle) => handle.abort(),
            ReaderState::Idle(_) | ReaderState::Done => {}
        }

        let connection = self.clone();
        self.inner.runtime.spawn(async move {
            connection.release_writer().await;
            let listeners: Vec<Arc<dyn ConnectionListener>> = connection
                .inner
                .listeners
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            for listener in listeners {
                listener.on_closed(&connection, &details);
            }
        });
    }

    async fn release_writer(&self) {
        match tokio::time::timeout(WRITER_RELEASE_TIMEOUT, self.inner.writer.lock()).await {
            Ok(mut state) => {
                if let Some(mut writer) = state.writer.take() {
                    let _ = writer.shutdown().await;
                }
            }
            Err(_) => {
                tracing::debug!("{}: writer still busy, leaving release to the sender", self);
            }
        }
    }

    async fn read_loop(
        self,
        mut reader: OwnedReadHalf,
        dispatch: mpsc::Sender<IncomingMessage>,
        load: NetworkLoad,
    ) {
        loop {
            match read_envelope(&mut reader).await {
                Ok(Some((envelope, bytes))) => {
                    let m = &self.inner.metrics;
                    m.received_messages.fetch_add(1, Ordering::Relaxed);
                    m.received_bytes.fetch_add(bytes as u64, Ordering::Relaxed);

                    if !self.is_listening() {
                        tracing::trace!("{} not listening, dropping {}", self, envelope.message.name());
                        continue;
                    }
                    self.inner.throttle.throttle_receive(load.current()).await;

                    let incoming = IncomingMessage {
                        connection: self.clone(),
                        envelope,
                    };
                    if dispatch.send(incoming).await.is_err() {
                        self.close(
                            CloseDetails::new(CloseReason::Shutdown)
                                .with_details("dispatcher stopped"),
                        );
                        return;
                    }
                }
                Ok(None) => {
                    self.close(
                        CloseDetails::new(CloseReason::Exception)
                            .with_details("stream closed by peer"),
                    );
                    return;
                }
                Err(e) => {
                    self.close(
                        CloseDetails::new(CloseReason::Exception)
                            .with_details("read failed")
                            .with_cause(&e),
                    );
                    return;
                }
            }
        }
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Removes a connection from its owner's map when it closes and releases
/// its share of the node load.
pub(crate) struct RemoveOnClose<K> {
    pub(crate) map: Arc<DashMap<K, Connection>>,
    pub(crate) key: K,
    pub(crate) load: NetworkLoad,
}

impl<K> ConnectionListener for RemoveOnClose<K>
where
    K: Eq + Hash + Send + Sync + 'static,
{
    fn on_closed(&self, connection: &Connection, _details: &CloseDetails) {
        if self
            .map
            .remove_if(&self.key, |_, current| current == connection)
            .is_some()
        {
            self.load.connection_closed();
        }
    }
}
