//! Node implementation
//!
//! A [`Node`] owns one transport, one [`PeerConnectionsManager`] and the
//! dispatcher task that authorizes and delivers inbound messages.

use crate::auth::{AuthorizationService, ProofOfWorkAuthorization};
use crate::ban_list::BanList;
use crate::load::{Load, NetworkLoad};
use crate::message::{ApplicationMessage, NetworkMessage, PROTOCOL_VERSION};
use crate::node::close_reason::{CloseDetails, CloseReason};
use crate::node::config::NodeConfig;
use crate::node::connection::Connection;
use crate::node::error::{NodeError, Result};
use crate::node::listener::{ConnectionListener, ListenerId, NodeListener};
use crate::node::peer_connections::{PeerConnectionsManager, PeerServices};
use crate::node::request_response::{RequestResponseManager, RequestStats};
use crate::node::IncomingMessage;
use crate::node::state::{NodeState, StateMachine};
use dashmap::DashMap;
use peerlink_transport::{Address, Transport, TransportFactory, TransportStats, TransportType};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Inner node state (shared across clones)
struct NodeInner {
    /// Node identity used in logs and socket naming
    node_id: Arc<str>,

    /// Node configuration
    config: NodeConfig,

    /// Transport selected by `config.transport_type`
    transport: Arc<dyn Transport>,

    /// Token creation and verification
    auth: Arc<dyn AuthorizationService>,

    /// Peers refused during handshakes
    ban_list: BanList,

    /// Live connection count
    load: NetworkLoad,

    /// Lifecycle state
    state: StateMachine,

    /// Set once startup succeeds
    peers: OnceLock<PeerConnectionsManager>,

    /// Registered event listeners
    listeners: DashMap<ListenerId, Arc<dyn NodeListener>>,
    next_listener_id: AtomicU64,

    /// Outstanding application requests
    requests: RequestResponseManager,

    /// Reader tasks feed this queue; the dispatcher drains it
    dispatch_tx: mpsc::Sender<IncomingMessage>,
    dispatch_rx: Mutex<Option<mpsc::Receiver<IncomingMessage>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,

    unauthorized_messages: AtomicU64,
    dropped_messages: AtomicU64,
}

/// Snapshot of node counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStats {
    /// Lifecycle state
    pub state: NodeState,
    /// Live connections
    pub num_connections: usize,
    /// Current load
    pub load: Load,
    /// Messages dropped for failing authorization
    pub unauthorized_messages: u64,
    /// Messages dropped for version or type mismatches
    pub dropped_messages: u64,
    /// Requests awaiting a response
    pub pending_requests: usize,
    /// Request round-trip counters
    pub requests: RequestStats,
    /// Transport counters
    pub transport: TransportStats,
}

/// PeerLink node
///
/// Cheap to clone; all clones share one node.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

// ═══════════════════════════════════════════════════════════════════════════
// Constructors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Create a node using the transport named by `config.transport_type`
    /// and proof-of-work authorization.
    pub fn new(node_id: impl Into<String>, config: NodeConfig) -> Self {
        let transport = TransportFactory::create(config.transport_type, &config.transport);
        let auth: Arc<dyn AuthorizationService> =
            Arc::new(ProofOfWorkAuthorization::new(config.proof_of_work.clone()));
        Self::with_services(node_id, config, transport, auth, BanList::new())
    }

    /// Create a node from explicit collaborators
    pub fn with_services(
        node_id: impl Into<String>,
        config: NodeConfig,
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthorizationService>,
        ban_list: BanList,
    ) -> Self {
        let node_id: String = node_id.into();
        let (dispatch_tx, dispatch_rx) = mpsc::channel(config.connection.dispatch_queue_size.max(1));
        let requests = RequestResponseManager::new(config.request_max_age);

        Self {
            inner: Arc::new(NodeInner {
                node_id: Arc::from(node_id),
                config,
                transport,
                auth,
                ban_list,
                load: NetworkLoad::new(),
                state: StateMachine::new(),
                peers: OnceLock::new(),
                listeners: DashMap::new(),
                next_listener_id: AtomicU64::new(0),
                requests,
                dispatch_tx,
                dispatch_rx: Mutex::new(Some(dispatch_rx)),
                dispatcher: Mutex::new(None),
                unauthorized_messages: AtomicU64::new(0),
                dropped_messages: AtomicU64::new(0),
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Lifecycle Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Start the node: initialize the transport, open the server socket on
    /// `port` (0 picks a free one) and start both connection managers.
    ///
    /// Calling this on a running node is a no-op. Startup is retried with
    /// backoff; when retries are exhausted the node shuts down.
    ///
    /// # Errors
    /// Returns `InvalidState` while starting or after shutdown, or the
    /// startup error once retries are exhausted.
    pub async fn initialize(&self, port: u16) -> Result<()> {
        match self.state() {
            NodeState::Running => return Ok(()),
            NodeState::Starting => return Err(NodeError::invalid_state("node is already starting")),
            NodeState::Stopping | NodeState::Terminated => {
                return Err(NodeError::invalid_state("node has been shut down"));
            }
            NodeState::New => {}
        }
        if let Err(e) = self.inner.state.transition_from(NodeState::New, NodeState::Starting) {
            return match self.state() {
                NodeState::Running => Ok(()),
                _ => Err(e),
            };
        }
        self.notify_state(NodeState::Starting);
        tracing::info!(
            "Starting node {} on {} transport, port {}",
            self.inner.node_id,
            self.inner.config.transport_type,
            port
        );

        let started = self
            .inner
            .config
            .retry
            .run("node startup", |attempt| self.start_once(port, attempt))
            .await;

        let peers = match started {
            Ok(peers) => peers,
            Err(e) => {
                tracing::error!("Node {} failed to start: {}", self.inner.node_id, e);
                self.shutdown().await;
                return Err(e);
            }
        };

        if self.inner.peers.set(peers.clone()).is_err() {
            peers.shutdown().await;
            return Err(NodeError::invalid_state("node already has peer connections"));
        }
        self.spawn_dispatcher();

        if let Err(e) = self.inner.state.transition_from(NodeState::Starting, NodeState::Running) {
            // Shutdown began while the managers were starting
            peers.shutdown().await;
            self.abort_dispatcher();
            return Err(e);
        }
        self.notify_state(NodeState::Running);
        tracing::info!("Node {} running at {}", self.inner.node_id, peers.my_address());
        Ok(())
    }

    async fn start_once(&self, port: u16, attempt: u32) -> Result<PeerConnectionsManager> {
        if self.state() != NodeState::Starting {
            return Err(NodeError::invalid_state("shutdown requested during startup"));
        }
        if attempt > 0 {
            tracing::debug!("Node {} startup attempt {}", self.inner.node_id, attempt + 1);
        }

        let transport = &self.inner.transport;
        if !transport.is_initialized() {
            transport
                .initialize()
                .await
                .map_err(|e| NodeError::TransportInit(e.to_string().into()))?;
        }

        let services = PeerServices {
            node_id: Arc::clone(&self.inner.node_id),
            auth: Arc::clone(&self.inner.auth),
            ban_list: self.inner.ban_list.clone(),
            load: self.inner.load.clone(),
            dispatch: self.inner.dispatch_tx.clone(),
            observer: Arc::new(NodeObserver {
                node: Arc::downgrade(&self.inner),
            }),
        };
        PeerConnectionsManager::start(Arc::clone(transport), port, &self.inner.config, services).await
    }

    /// Shut the node down: gracefully close every connection within the
    /// shutdown timeout, stop both managers and release the transport.
    ///
    /// The node always ends `Terminated`. Returns false if graceful closes
    /// did not finish in time or a concurrent shutdown did not complete.
    pub async fn shutdown(&self) -> bool {
        match self.state() {
            NodeState::Terminated => return true,
            NodeState::Stopping => return self.wait_for_termination().await,
            _ => {}
        }
        if self.inner.state.transition(NodeState::Stopping).is_err() {
            return self.wait_for_termination().await;
        }
        self.notify_state(NodeState::Stopping);
        tracing::info!("Shutting down node {}", self.inner.node_id);

        let mut clean = true;
        if let Some(peers) = self.inner.peers.get() {
            let closes = peers
                .all_connections()
                .into_iter()
                .map(|connection| self.graceful_close(connection, CloseReason::Shutdown));
            let timeout = self.inner.config.shutdown_timeout;
            if tokio::time::timeout(timeout, futures::future::join_all(closes))
                .await
                .is_err()
            {
                tracing::warn!(
                    "Node {}: graceful close did not finish within {:?}",
                    self.inner.node_id,
                    timeout
                );
                clean = false;
            }
            peers.shutdown().await;
        }

        if let Err(e) = self.inner.transport.shutdown().await {
            tracing::warn!("Node {}: transport shutdown failed: {}", self.inner.node_id, e);
        }
        self.abort_dispatcher();

        if let Err(e) = self.inner.state.transition(NodeState::Terminated) {
            tracing::error!("Node {}: {}", self.inner.node_id, e);
            return false;
        }
        self.notify_state(NodeState::Terminated);
        tracing::info!("Node {} terminated", self.inner.node_id);
        clean
    }

    async fn wait_for_termination(&self) -> bool {
        let mut rx = self.inner.state.subscribe();
        let limit = self.inner.config.shutdown_timeout + Duration::from_secs(1);
        matches!(
            tokio::time::timeout(limit, rx.wait_for(|state| *state == NodeState::Terminated)).await,
            Ok(Ok(_))
        )
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Connection Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Send `message` to the peer at `address`, connecting if needed.
    ///
    /// # Errors
    /// Returns `InvalidState` unless running, or the connection fault.
    pub async fn send(&self, message: ApplicationMessage, address: &Address) -> Result<Connection> {
        let connection = self.get_connection(address).await?;
        self.send_to_connection(message, &connection).await
    }

    /// Send `message` on an existing connection.
    ///
    /// # Errors
    /// Returns `InvalidState` unless running, or the connection fault.
    pub async fn send_to_connection(
        &self,
        message: ApplicationMessage,
        connection: &Connection,
    ) -> Result<Connection> {
        self.ensure_running()?;
        self.inner.requests.on_sent(&message, connection.id());
        let request_id = message.request_id().map(str::to_owned);

        match connection.send(message.into(), self.inner.auth.as_ref()).await {
            Ok(connection) => Ok(connection),
            Err(e) => {
                if let Some(id) = request_id {
                    self.inner.requests.forget(&id);
                }
                Err(e.into())
            }
        }
    }

    /// Connection to `address`, reusing an existing one when possible.
    ///
    /// # Errors
    /// Returns `InvalidState` unless running, or the dial/handshake fault.
    pub async fn get_connection(&self, address: &Address) -> Result<Connection> {
        self.ensure_running()?;
        let peers = self.peers()?;
        Ok(peers.get_connection(address).await?)
    }

    /// Existing live connection to `address`
    pub fn find_connection(&self, address: &Address) -> Option<Connection> {
        self.inner.peers.get()?.find_connection(address)
    }

    /// Gracefully close `connection`: wait for responses to requests still in
    /// flight on it, stop delivering its messages, tell the peer why, wait the
    /// grace period, then close.
    ///
    /// The wait for responses is bounded by
    /// [`ConnectionConfig::request_drain_timeout`](super::ConnectionConfig);
    /// requests left unanswered are dropped when the connection closes.
    pub async fn close_connection(&self, connection: &Connection, reason: CloseReason) {
        self.graceful_close(connection.clone(), reason).await;
    }

    async fn graceful_close(&self, connection: Connection, reason: CloseReason) {
        if connection.is_stopped() {
            return;
        }
        let requests = &self.inner.requests;
        if requests.has_pending_for(&connection) {
            if reason == CloseReason::Shutdown {
                tracing::warn!(
                    "Closing {} for shutdown with {} request(s) in flight",
                    connection,
                    requests.num_pending_for(&connection)
                );
            } else {
                let limit = self.inner.config.connection.request_drain_timeout;
                tracing::info!(
                    "Deferring close of {}: {} request(s) in flight",
                    connection,
                    requests.num_pending_for(&connection)
                );
                if !requests.wait_for_responses(&connection, limit).await {
                    tracing::warn!(
                        "Closing {} with {} unanswered request(s) after {:?}",
                        connection,
                        requests.num_pending_for(&connection),
                        limit
                    );
                }
                if connection.is_stopped() {
                    return;
                }
            }
        }
        connection.stop_listening();
        let message = NetworkMessage::CloseConnection {
            reason: reason.name().to_string(),
        };
        match connection.send(message, self.inner.auth.as_ref()).await {
            Ok(_) => {
                tokio::time::sleep(self.inner.config.connection.close_grace_period).await;
                connection.close(CloseDetails::new(CloseReason::CloseMsgSent).with_details(reason.name()));
            }
            Err(e) => {
                tracing::debug!("Could not send close message on {}: {}", connection, e);
                connection.close(CloseDetails::new(reason).with_cause(&e));
            }
        }
    }

    /// All live connections
    pub fn connections(&self) -> Vec<Connection> {
        self.inner
            .peers
            .get()
            .map(PeerConnectionsManager::all_connections)
            .unwrap_or_default()
    }

    /// Number of live connections
    pub fn num_connections(&self) -> usize {
        self.inner
            .peers
            .get()
            .map_or(0, PeerConnectionsManager::num_connections)
    }

    /// Address peers dial to reach this node, once started
    pub fn find_my_address(&self) -> Option<Address> {
        self.inner.peers.get().map(|peers| peers.my_address().clone())
    }

    fn peers(&self) -> Result<&PeerConnectionsManager> {
        self.inner
            .peers
            .get()
            .ok_or(NodeError::invalid_state("node has not started"))
    }

    fn ensure_running(&self) -> Result<()> {
        let state = self.state();
        if state != NodeState::Running {
            return Err(NodeError::InvalidState(
                format!("node {} is {}", self.inner.node_id, state).into(),
            ));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Accessors
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Node identity
    pub fn node_id(&self) -> &str {
        &self.inner.node_id
    }

    /// Lifecycle state
    pub fn state(&self) -> NodeState {
        self.inner.state.get()
    }

    /// Transport kind
    pub fn transport_type(&self) -> TransportType {
        self.inner.transport.transport_type()
    }

    /// Node configuration
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Ban list consulted by handshakes
    pub fn ban_list(&self) -> &BanList {
        &self.inner.ban_list
    }

    /// Current load
    pub fn load(&self) -> Load {
        self.inner.load.current()
    }

    /// Outstanding request tracking
    pub fn requests(&self) -> &RequestResponseManager {
        &self.inner.requests
    }

    /// Peer connections, once started
    pub fn peer_connections(&self) -> Option<&PeerConnectionsManager> {
        self.inner.peers.get()
    }

    /// Snapshot of node counters
    pub fn stats(&self) -> NodeStats {
        NodeStats {
            state: self.state(),
            num_connections: self.num_connections(),
            load: self.load(),
            unauthorized_messages: self.inner.unauthorized_messages.load(Ordering::Relaxed),
            dropped_messages: self.inner.dropped_messages.load(Ordering::Relaxed),
            pending_requests: self.inner.requests.num_pending(),
            requests: self.inner.requests.stats(),
            transport: self.inner.transport.stats(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Listener Methods
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    /// Register an event listener
    pub fn add_listener(&self, listener: Arc<dyn NodeListener>) -> ListenerId {
        let id = ListenerId::next(&self.inner.next_listener_id);
        self.inner.listeners.insert(id, listener);
        id
    }

    /// Remove an event listener; returns false if it was not registered
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(&id).is_some()
    }

    fn notify_state(&self, state: NodeState) {
        for listener in self.inner.listener_snapshot() {
            listener.on_state_change(state);
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Dispatch
// ═══════════════════════════════════════════════════════════════════════════

impl Node {
    fn spawn_dispatcher(&self) {
        let Some(mut rx) = lock(&self.inner.dispatch_rx).take() else {
            return;
        };
        let node = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            // Sequential handling keeps each connection's counters in order
            while let Some(incoming) = rx.recv().await {
                let Some(inner) = node.upgrade() else {
                    break;
                };
                Node { inner }.handle_incoming(incoming).await;
            }
        });
        *lock(&self.inner.dispatcher) = Some(handle);
    }

    fn abort_dispatcher(&self) {
        if let Some(handle) = lock(&self.inner.dispatcher).take() {
            handle.abort();
        }
    }

    async fn handle_incoming(&self, incoming: IncomingMessage) {
        let IncomingMessage { connection, envelope } = incoming;

        if envelope.version != PROTOCOL_VERSION {
            self.inner.dropped_messages.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                "Dropping {} from {}: protocol version {}",
                envelope.message.name(),
                connection,
                envelope.version
            );
            return;
        }

        let Some(my_address) = self.find_my_address() else {
            return;
        };
        // Tokens mined one difficulty step below our current load still pass
        let my_load = self.inner.load.current().halved();
        let authorized = self
            .inner
            .auth
            .is_authorized(
                &envelope.message,
                &envelope.token,
                my_load,
                connection.id(),
                &my_address,
            )
            .await;
        if !authorized {
            self.inner.unauthorized_messages.fetch_add(1, Ordering::Relaxed);
            let count = connection.record_unauthorized();
            tracing::warn!(
                "Dropping unauthorized {} from {} ({} on this connection)",
                envelope.message.name(),
                connection,
                count
            );
            return;
        }

        match envelope.message {
            NetworkMessage::CloseConnection { reason } => {
                tracing::info!("{} closed by peer: {}", connection, reason);
                connection.close(CloseDetails::new(CloseReason::CloseMsgReceived).with_details(reason));
            }
            NetworkMessage::Application(message) => {
                if let Some(round_trip) = self.inner.requests.on_received(&message) {
                    tracing::debug!("Response {:?} after {:?}", message.response_id(), round_trip);
                }
                for listener in self.inner.listener_snapshot() {
                    listener.on_message(&message, &connection);
                }
            }
            other => {
                self.inner.dropped_messages.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Dropping unexpected {} from {}", other.name(), connection);
            }
        }
    }
}

impl NodeInner {
    fn listener_snapshot(&self) -> Vec<Arc<dyn NodeListener>> {
        self.listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("node_id", &self.inner.node_id)
            .field("state", &self.state())
            .field("address", &self.find_my_address())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Forwards connection events from the managers to the node's listeners.
///
/// Holds the node weakly so connections never keep a dropped node alive.
pub(crate) struct NodeObserver {
    node: Weak<NodeInner>,
}

impl NodeObserver {
    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { node: Weak::new() }
    }

    /// A connection finished its handshake and was registered
    pub(crate) fn on_verified(&self, connection: &Connection) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        let listeners = node.listener_snapshot();
        if listeners.is_empty() {
            return;
        }
        let connection = connection.clone();
        tokio::spawn(async move {
            for listener in listeners {
                listener.on_connection(&connection);
            }
        });
    }
}

impl ConnectionListener for NodeObserver {
    fn on_closed(&self, connection: &Connection, details: &CloseDetails) {
        let Some(node) = self.node.upgrade() else {
            return;
        };
        node.auth.forget(connection.id());
        node.requests.forget_connection(connection.id());
        for listener in node.listener_snapshot() {
            listener.on_disconnect(connection, details);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AuthError, AuthorizationToken, ProofOfWorkConfig};
    use crate::node::retry::RetryConfig;
    use async_trait::async_trait;
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    fn test_config() -> NodeConfig {
        NodeConfig {
            proof_of_work: ProofOfWorkConfig {
                base_difficulty: 4,
                max_difficulty: 12,
            },
            ..NodeConfig::default()
        }
    }

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<ApplicationMessage>>,
        states: Mutex<Vec<NodeState>>,
        disconnects: Mutex<Vec<CloseReason>>,
        connections: AtomicUsize,
    }

    impl NodeListener for Recorder {
        fn on_message(&self, message: &ApplicationMessage, _connection: &Connection) {
            self.messages.lock().unwrap().push(message.clone());
        }

        fn on_connection(&self, _connection: &Connection) {
            self.connections.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, _connection: &Connection, details: &CloseDetails) {
            self.disconnects.lock().unwrap().push(details.reason);
        }

        fn on_state_change(&self, state: NodeState) {
            self.states.lock().unwrap().push(state);
        }
    }

    /// Signs nothing; every token it produces fails verification
    struct NoProof;

    #[async_trait]
    impl AuthorizationService for NoProof {
        async fn create_token(
            &self,
            _message: &NetworkMessage,
            _peer_load: Load,
            _peer_address: &Address,
            counter: u64,
        ) -> std::result::Result<AuthorizationToken, AuthError> {
            Ok(AuthorizationToken {
                message_counter: counter,
                ..AuthorizationToken::empty()
            })
        }

        async fn is_authorized(
            &self,
            _message: &NetworkMessage,
            _token: &AuthorizationToken,
            _my_load: Load,
            _connection_id: &str,
            _my_address: &Address,
        ) -> bool {
            false
        }

        fn forget(&self, _connection_id: &str) {}
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..150 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached");
    }

    async fn running(id: &str) -> (Node, Arc<Recorder>) {
        running_with(id, test_config()).await
    }

    async fn running_with(id: &str, config: NodeConfig) -> (Node, Arc<Recorder>) {
        let node = Node::new(id, config);
        let recorder = Arc::new(Recorder::default());
        node.add_listener(recorder.clone());
        node.initialize(0).await.unwrap();
        (node, recorder)
    }

    #[tokio::test]
    async fn test_lifecycle_states() {
        let (node, recorder) = running("alice").await;
        assert_eq!(node.state(), NodeState::Running);
        assert!(node.find_my_address().is_some());

        // Second initialize is a no-op
        node.initialize(0).await.unwrap();

        assert!(node.shutdown().await);
        assert_eq!(node.state(), NodeState::Terminated);
        assert!(node.shutdown().await);
        assert!(matches!(
            node.initialize(0).await,
            Err(NodeError::InvalidState(_))
        ));

        assert_eq!(
            *recorder.states.lock().unwrap(),
            vec![
                NodeState::Starting,
                NodeState::Running,
                NodeState::Stopping,
                NodeState::Terminated
            ]
        );
    }

    #[tokio::test]
    async fn test_send_requires_running_node() {
        let node = Node::new("idle", test_config());
        let err = node
            .send(ApplicationMessage::new("chat", Vec::new()), &Address::localhost(1))
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_shutdown_from_new() {
        let node = Node::new("never-started", test_config());
        assert!(node.shutdown().await);
        assert_eq!(node.state(), NodeState::Terminated);
    }

    #[tokio::test]
    async fn test_startup_failure_terminates() {
        // Nothing listens on this port, so the proxy check fails
        let dead_proxy: SocketAddr = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let mut config = NodeConfig {
            retry: RetryConfig {
                max_attempts: 2,
                initial_backoff: Duration::from_millis(10),
                jitter: 0.0,
                ..RetryConfig::default()
            },
            ..NodeConfig::for_transport(TransportType::Tor)
        };
        config.transport.tor.socks_proxy = dead_proxy;
        config.transport.tor.check_timeout = Duration::from_millis(500);

        let node = Node::new("tor-node", config);
        let err = node.initialize(0).await.unwrap_err();
        assert!(matches!(err, NodeError::StartupFailed(_)));
        assert_eq!(node.state(), NodeState::Terminated);
    }

    #[tokio::test]
    async fn test_message_delivery_and_request_tracking() {
        let (alice, _) = running("alice").await;
        let (bob, bob_events) = running("bob").await;
        let bob_address = bob.find_my_address().unwrap();

        let request = ApplicationMessage::request("ping", "req-1", b"hello".to_vec());
        alice.send(request.clone(), &bob_address).await.unwrap();
        assert_eq!(alice.requests().num_pending(), 1);

        eventually(|| bob_events.messages.lock().unwrap().len() == 1).await;
        assert_eq!(bob_events.messages.lock().unwrap()[0], request);
        eventually(|| bob_events.connections.load(Ordering::SeqCst) == 1).await;

        // Bob answers over the inbound connection
        let alice_address = alice.find_my_address().unwrap();
        let response = ApplicationMessage::response("pong", "req-1", Vec::new());
        let reply = bob.send(response, &alice_address).await.unwrap();
        assert!(!reply.is_peer_address_verified());
        eventually(|| alice.requests().num_pending() == 0).await;
        assert_eq!(alice.stats().requests.answered, 1);

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_connection_notifies_peer() {
        let (alice, alice_events) = running("alice").await;
        let (bob, bob_events) = running("bob").await;
        let bob_address = bob.find_my_address().unwrap();

        let connection = alice.get_connection(&bob_address).await.unwrap();
        eventually(|| bob.num_connections() == 1).await;

        alice.close_connection(&connection, CloseReason::OrphanedConnection).await;
        assert!(connection.is_stopped());
        assert_eq!(
            connection.close_details().unwrap().reason,
            CloseReason::CloseMsgSent
        );

        eventually(|| bob.num_connections() == 0).await;
        eventually(|| !bob_events.disconnects.lock().unwrap().is_empty()).await;
        assert_eq!(
            bob_events.disconnects.lock().unwrap()[0],
            CloseReason::CloseMsgReceived
        );
        eventually(|| !alice_events.disconnects.lock().unwrap().is_empty()).await;
        assert_eq!(alice.load(), Load::new(0));

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_unauthorized_messages_are_dropped_not_fatal() {
        let (alice, _) = running("alice").await;
        let (bob, bob_events) = running("bob").await;
        let bob_address = bob.find_my_address().unwrap();

        let connection = alice.get_connection(&bob_address).await.unwrap();
        for _ in 0..3 {
            connection
                .send(ApplicationMessage::new("spam", Vec::new()).into(), &NoProof)
                .await
                .unwrap();
        }
        eventually(|| bob.stats().unauthorized_messages == 3).await;
        assert!(bob_events.messages.lock().unwrap().is_empty());
        assert!(!connection.is_stopped());

        // The connection still carries properly authorized traffic
        alice
            .send(ApplicationMessage::new("chat", b"legit".to_vec()), &bob_address)
            .await
            .unwrap();
        eventually(|| bob_events.messages.lock().unwrap().len() == 1).await;

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_connection_waits_for_in_flight_request() {
        let (alice, _) = running("alice").await;
        let (bob, bob_events) = running("bob").await;
        let bob_address = bob.find_my_address().unwrap();

        let request = ApplicationMessage::request("ping", "req-1", Vec::new());
        let connection = alice.send(request, &bob_address).await.unwrap();
        assert!(alice.requests().has_pending_for(&connection));
        eventually(|| bob_events.messages.lock().unwrap().len() == 1).await;
        eventually(|| bob.num_connections() == 1).await;

        let closer = alice.clone();
        let closing = connection.clone();
        let close = tokio::spawn(async move {
            closer.close_connection(&closing, CloseReason::OrphanedConnection).await;
        });

        // Held open while the request is unanswered
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!close.is_finished());
        assert!(!connection.is_stopped());

        let inbound = bob.connections().pop().unwrap();
        bob.send_to_connection(ApplicationMessage::response("pong", "req-1", Vec::new()), &inbound)
            .await
            .unwrap();
        close.await.unwrap();

        assert_eq!(alice.stats().requests.answered, 1);
        assert_eq!(alice.stats().requests.abandoned, 0);
        assert_eq!(
            connection.close_details().unwrap().reason,
            CloseReason::CloseMsgSent
        );

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_close_connection_abandons_unanswered_requests() {
        let mut config = test_config();
        config.connection.request_drain_timeout = Duration::from_millis(200);
        let (alice, _) = running_with("alice", config).await;
        let (bob, _) = running("bob").await;
        let bob_address = bob.find_my_address().unwrap();

        let request = ApplicationMessage::request("ping", "req-1", Vec::new());
        let connection = alice.send(request, &bob_address).await.unwrap();

        let started = tokio::time::Instant::now();
        alice.close_connection(&connection, CloseReason::OrphanedConnection).await;
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(connection.is_stopped());

        eventually(|| alice.requests().num_pending() == 0).await;
        assert!(!alice.requests().is_pending("req-1"));
        assert_eq!(alice.stats().requests.abandoned, 1);
        assert_eq!(alice.stats().requests.answered, 0);

        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_token_for_handshake_load_rejected_after_load_rises() {
        let (alice, _) = running("alice").await;
        let (bob, bob_events) = running("bob").await;
        let bob_address = bob.find_my_address().unwrap();

        let connection = alice.get_connection(&bob_address).await.unwrap();
        eventually(|| bob.num_connections() == 1).await;

        // Alice keeps mining against the load bob advertised in the handshake
        for _ in 0..30 {
            bob.inner.load.connection_opened();
        }
        alice
            .send_to_connection(ApplicationMessage::new("chat", b"stale".to_vec()), &connection)
            .await
            .unwrap();

        eventually(|| bob.stats().unauthorized_messages == 1).await;
        assert!(bob_events.messages.lock().unwrap().is_empty());
        assert!(!connection.is_stopped());

        for _ in 0..30 {
            bob.inner.load.connection_closed();
        }
        alice.shutdown().await;
        bob.shutdown().await;
    }

    #[tokio::test]
    async fn test_token_one_step_below_current_load_accepted() {
        let (alice, _) = running("alice").await;
        let (bob, bob_events) = running("bob").await;
        let bob_address = bob.find_my_address().unwrap();

        let connection = alice.get_connection(&bob_address).await.unwrap();
        eventually(|| bob.num_connections() == 1).await;

        // Doubling n + 1 raises the difficulty by exactly one bit
        let advertised = connection.peer_load().num_connections;
        let one_step_up = 2 * advertised + 1;
        let extra = one_step_up.saturating_sub(bob.load().num_connections);
        for _ in 0..extra {
            bob.inner.load.connection_opened();
        }
        let pow = &bob.inner.config.proof_of_work;
        assert_eq!(
            pow.required_difficulty(bob.load()),
            pow.required_difficulty(connection.peer_load()) + 1
        );

        alice
            .send_to_connection(ApplicationMessage::new("chat", b"fresh".to_vec()), &connection)
            .await
            .unwrap();
        eventually(|| bob_events.messages.lock().unwrap().len() == 1).await;
        assert_eq!(bob.stats().unauthorized_messages, 0);

        for _ in 0..extra {
            bob.inner.load.connection_closed();
        }
        alice.shutdown().await;
        bob.shutdown().await;
    }
}
