//! Node configuration

use crate::auth::ProofOfWorkConfig;
use crate::node::retry::RetryConfig;
use crate::throttle::ThrottleConfig;
use peerlink_transport::{TransportConfig, TransportType};
use std::time::Duration;

/// Node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Transport this node listens and dials on
    pub transport_type: TransportType,

    /// Transports advertised in our capability (always includes `transport_type`)
    pub supported_transport_types: Vec<TransportType>,

    /// Transport configuration
    pub transport: TransportConfig,

    /// Connection management configuration
    pub connection: ConnectionConfig,

    /// Per-connection pacing
    pub throttle: ThrottleConfig,

    /// Authorization difficulty
    pub proof_of_work: ProofOfWorkConfig,

    /// Startup retry policy
    pub retry: RetryConfig,

    /// Upper bound on graceful shutdown
    pub shutdown_timeout: Duration,

    /// Pending requests older than this are pruned
    pub request_max_age: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            transport_type: TransportType::Clear,
            supported_transport_types: vec![TransportType::Clear],
            transport: TransportConfig::default(),
            connection: ConnectionConfig::default(),
            throttle: ThrottleConfig::default(),
            proof_of_work: ProofOfWorkConfig::default(),
            retry: RetryConfig::default(),
            shutdown_timeout: Duration::from_secs(10),
            request_max_age: Duration::from_secs(5 * 60),
        }
    }
}

impl NodeConfig {
    /// Default configuration for `transport_type`
    #[must_use]
    pub fn for_transport(transport_type: TransportType) -> Self {
        Self {
            transport_type,
            supported_transport_types: vec![transport_type],
            ..Self::default()
        }
    }

    /// Advertised transports, guaranteed to contain `transport_type`
    pub fn advertised_transport_types(&self) -> Vec<TransportType> {
        let mut types = self.supported_transport_types.clone();
        if !types.contains(&self.transport_type) {
            types.push(self.transport_type);
        }
        types
    }
}

/// Connection management configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Inbound sockets beyond this many live connections are refused
    pub max_connections: usize,

    /// Bound on a complete handshake round trip
    pub handshake_timeout: Duration,

    /// Pause between sending `CloseConnection` and closing the socket
    pub close_grace_period: Duration,

    /// How long a graceful close waits for responses to requests still in
    /// flight on the connection
    pub request_drain_timeout: Duration,

    /// Capacity of the inbound message queue feeding the node dispatcher
    pub dispatch_queue_size: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_connections: 100,
            handshake_timeout: Duration::from_secs(30),
            close_grace_period: Duration::from_millis(100),
            request_drain_timeout: Duration::from_secs(5),
            dispatch_queue_size: 1024,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.transport_type, TransportType::Clear);
        assert_eq!(config.connection.max_connections, 100);
        assert_eq!(config.connection.handshake_timeout, Duration::from_secs(30));
        assert_eq!(config.connection.close_grace_period, Duration::from_millis(100));
        assert_eq!(config.connection.request_drain_timeout, Duration::from_secs(5));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.proof_of_work.base_difficulty, 8);
    }

    #[test]
    fn test_advertised_types_include_own_transport() {
        let config = NodeConfig {
            supported_transport_types: vec![TransportType::I2p],
            ..NodeConfig::for_transport(TransportType::Tor)
        };
        let types = config.advertised_transport_types();
        assert!(types.contains(&TransportType::Tor));
        assert!(types.contains(&TransportType::I2p));
    }
}
