//! Two-node test fixture for integration testing
//!
//! Starts a pair of clear-net nodes on loopback with cheap proof-of-work and
//! records every event they emit.
//!
//! # Example
//!
//! ```no_run
//! use peerlink_integration_tests::fixtures::TwoNodeFixture;
//!
//! #[tokio::test]
//! async fn test_basic_exchange() {
//!     let fixture = TwoNodeFixture::new().await.unwrap();
//!     let _connection = fixture.connect().await.unwrap();
//!     // ... send messages ...
//!     fixture.cleanup().await;
//! }
//! ```

use peerlink_core::node::{CloseDetails, Connection, NodeError, NodeListener};
use peerlink_core::{Address, ApplicationMessage, Node, NodeConfig, NodeState, ProofOfWorkConfig};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Configuration used by fixture nodes: loopback only, low difficulty
pub fn test_config() -> NodeConfig {
    let mut config = NodeConfig::default();
    config.transport.bind_host = "127.0.0.1".parse().unwrap();
    config.proof_of_work = ProofOfWorkConfig {
        base_difficulty: 2,
        max_difficulty: 8,
    };
    config.connection.handshake_timeout = Duration::from_secs(5);
    config.connection.close_grace_period = Duration::from_millis(20);
    config.shutdown_timeout = Duration::from_secs(5);
    config
}

/// Poll `check` until it holds, panicking after five seconds
pub async fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Records node events for later assertions
#[derive(Default)]
pub struct RecordingListener {
    messages: Mutex<Vec<(ApplicationMessage, Address)>>,
    connections: Mutex<Vec<Address>>,
    disconnects: Mutex<Vec<CloseDetails>>,
    states: Mutex<Vec<NodeState>>,
}

impl RecordingListener {
    /// Messages received, with the sender's declared address
    pub fn messages(&self) -> Vec<(ApplicationMessage, Address)> {
        self.messages.lock().unwrap().clone()
    }

    /// Peer addresses of verified connections
    pub fn connections(&self) -> Vec<Address> {
        self.connections.lock().unwrap().clone()
    }

    /// Close details of every disconnect
    pub fn disconnects(&self) -> Vec<CloseDetails> {
        self.disconnects.lock().unwrap().clone()
    }

    /// Lifecycle states observed
    pub fn states(&self) -> Vec<NodeState> {
        self.states.lock().unwrap().clone()
    }
}

impl NodeListener for RecordingListener {
    fn on_message(&self, message: &ApplicationMessage, connection: &Connection) {
        self.messages
            .lock()
            .unwrap()
            .push((message.clone(), connection.peer_address().clone()));
    }

    fn on_connection(&self, connection: &Connection) {
        self.connections
            .lock()
            .unwrap()
            .push(connection.peer_address().clone());
    }

    fn on_disconnect(&self, _connection: &Connection, details: &CloseDetails) {
        self.disconnects.lock().unwrap().push(details.clone());
    }

    fn on_state_change(&self, state: NodeState) {
        self.states.lock().unwrap().push(state);
    }
}

/// Two running nodes, `alice` dialing `bob`
pub struct TwoNodeFixture {
    /// Dialing node
    pub alice: Node,
    /// Listening node
    pub bob: Node,
    /// Alice's advertised address
    pub alice_address: Address,
    /// Bob's advertised address
    pub bob_address: Address,
    /// Events seen by alice
    pub alice_events: Arc<RecordingListener>,
    /// Events seen by bob
    pub bob_events: Arc<RecordingListener>,
}

impl TwoNodeFixture {
    /// Start both nodes with [`test_config`]
    ///
    /// # Errors
    ///
    /// Returns the startup error of either node.
    pub async fn new() -> Result<Self, NodeError> {
        Self::new_with_config(test_config(), test_config()).await
    }

    /// Start both nodes with custom configurations
    ///
    /// # Errors
    ///
    /// Returns the startup error of either node.
    pub async fn new_with_config(
        alice_config: NodeConfig,
        bob_config: NodeConfig,
    ) -> Result<Self, NodeError> {
        let alice = Node::new("alice", alice_config);
        let bob = Node::new("bob", bob_config);

        let alice_events = Arc::new(RecordingListener::default());
        let bob_events = Arc::new(RecordingListener::default());
        alice.add_listener(alice_events.clone());
        bob.add_listener(bob_events.clone());

        alice.initialize(0).await?;
        bob.initialize(0).await?;

        let alice_address = alice
            .find_my_address()
            .ok_or(NodeError::invalid_state("alice has no address"))?;
        let bob_address = bob
            .find_my_address()
            .ok_or(NodeError::invalid_state("bob has no address"))?;

        Ok(Self {
            alice,
            bob,
            alice_address,
            bob_address,
            alice_events,
            bob_events,
        })
    }

    /// Alice's connection to bob
    ///
    /// # Errors
    ///
    /// Returns the dial or handshake error.
    pub async fn connect(&self) -> Result<Connection, NodeError> {
        self.alice.get_connection(&self.bob_address).await
    }

    /// Shut both nodes down; returns true if both finished cleanly
    pub async fn cleanup(&self) -> bool {
        let (alice, bob) = tokio::join!(self.alice.shutdown(), self.bob.shutdown());
        alice && bob
    }
}
