//! Registry of nodes by identity
//!
//! An application may run one node per identity. All nodes share one ban
//! list and one configuration template.

use crate::auth::ProofOfWorkAuthorization;
use crate::ban_list::BanList;
use crate::message::ApplicationMessage;
use crate::node::config::NodeConfig;
use crate::node::connection::Connection;
use crate::node::error::{NodeError, Result};
use crate::node::node::Node;
use dashmap::DashMap;
use peerlink_transport::{Address, TransportFactory};
use std::sync::Arc;

/// Nodes keyed by identity
pub struct NodesById {
    nodes: DashMap<String, Node>,
    config: NodeConfig,
    ban_list: BanList,
}

impl NodesById {
    /// Create an empty registry; new nodes use `config`
    pub fn new(config: NodeConfig) -> Self {
        Self::with_ban_list(config, BanList::new())
    }

    /// Create an empty registry whose nodes share `ban_list`
    pub fn with_ban_list(config: NodeConfig, ban_list: BanList) -> Self {
        Self {
            nodes: DashMap::new(),
            config,
            ban_list,
        }
    }

    /// Node for `node_id`, created on first use. Concurrent callers for the
    /// same id receive the same node.
    pub fn get_or_create_node(&self, node_id: &str) -> Node {
        self.nodes
            .entry(node_id.to_string())
            .or_insert_with(|| {
                tracing::debug!("Creating node {}", node_id);
                let transport =
                    TransportFactory::create(self.config.transport_type, &self.config.transport);
                let auth = Arc::new(ProofOfWorkAuthorization::new(self.config.proof_of_work.clone()));
                Node::with_services(
                    node_id,
                    self.config.clone(),
                    transport,
                    auth,
                    self.ban_list.clone(),
                )
            })
            .value()
            .clone()
    }

    /// Existing node for `node_id`
    pub fn find_node(&self, node_id: &str) -> Option<Node> {
        self.nodes.get(node_id).map(|node| node.value().clone())
    }

    /// Create if needed and start the node for `node_id` on `port`.
    ///
    /// # Errors
    /// Returns the node's startup error.
    pub async fn initialize_node(&self, node_id: &str, port: u16) -> Result<Node> {
        let node = self.get_or_create_node(node_id);
        node.initialize(port).await?;
        Ok(node)
    }

    /// Send `message` from node `node_id` to `address`.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown node, otherwise the send error.
    pub async fn send(
        &self,
        node_id: &str,
        message: ApplicationMessage,
        address: &Address,
    ) -> Result<Connection> {
        self.require(node_id)?.send(message, address).await
    }

    /// Connection from node `node_id` to `address`.
    ///
    /// # Errors
    /// Returns `NotFound` for an unknown node, otherwise the connection error.
    pub async fn get_connection(&self, node_id: &str, address: &Address) -> Result<Connection> {
        self.require(node_id)?.get_connection(address).await
    }

    /// Registered identities
    pub fn node_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Number of registered nodes
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// True if no node is registered
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ban list shared by every node
    pub fn ban_list(&self) -> &BanList {
        &self.ban_list
    }

    /// Shut every node down concurrently and clear the registry.
    ///
    /// Returns false if any node did not shut down cleanly within the
    /// shutdown timeout.
    pub async fn shutdown(&self) -> bool {
        let nodes: Vec<Node> = self.nodes.iter().map(|entry| entry.value().clone()).collect();
        // Each node bounds its own graceful phase; this bounds the fan-out
        let limit = self.config.shutdown_timeout * 2;
        let clean = match tokio::time::timeout(
            limit,
            futures::future::join_all(nodes.iter().map(Node::shutdown)),
        )
        .await
        {
            Ok(results) => results.into_iter().all(|clean| clean),
            Err(_) => {
                tracing::warn!("Node registry shutdown exceeded {:?}", limit);
                false
            }
        };
        self.nodes.clear();
        clean
    }

    fn require(&self, node_id: &str) -> Result<Node> {
        self.find_node(node_id)
            .ok_or_else(|| NodeError::NotFound(format!("node {node_id}").into()))
    }
}
