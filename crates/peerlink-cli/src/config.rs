//! Configuration system for the PeerLink CLI.

use peerlink_core::{Address, BanList, NodeConfig as CoreNodeConfig, ProofOfWorkConfig, TransportType};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// PeerLink configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Node configuration
    #[serde(default)]
    pub node: NodeConfig,
    /// Network configuration
    #[serde(default)]
    pub network: NetworkConfig,
    /// Overlay proxy configuration
    #[serde(default)]
    pub overlay: OverlayConfig,
    /// Authorization and ban configuration
    #[serde(default)]
    pub security: SecurityConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node identity
    #[serde(default = "default_node_id")]
    pub id: String,
    /// Listen port (0 picks a free port)
    #[serde(default)]
    pub port: u16,
    /// Graceful shutdown budget in seconds
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Transport the node listens and dials on
    #[serde(default = "default_transport")]
    pub transport: String,
    /// Additional transports advertised to peers
    #[serde(default)]
    pub supported_transports: Vec<String>,
    /// Interface the clear-net listener binds to
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Host advertised to peers instead of the bound address
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_host: Option<String>,
    /// Outbound connect timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Handshake timeout in seconds
    #[serde(default = "default_handshake_timeout")]
    pub handshake_timeout_secs: u64,
    /// Inbound connection limit
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Overlay proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    /// Tor SOCKS5 proxy
    #[serde(default = "default_tor_proxy")]
    pub tor_proxy: String,
    /// Onion hostname advertised to peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tor_service_host: Option<String>,
    /// I2P SOCKS5 proxy
    #[serde(default = "default_i2p_proxy")]
    pub i2p_proxy: String,
    /// I2P hostname advertised to peers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub i2p_service_host: Option<String>,
}

/// Authorization and ban configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Proof-of-work difficulty at zero load
    #[serde(default = "default_base_difficulty")]
    pub pow_base_difficulty: u32,
    /// Proof-of-work difficulty cap
    #[serde(default = "default_max_difficulty")]
    pub pow_max_difficulty: u32,
    /// Banned peer addresses (host:port)
    #[serde(default)]
    pub banned: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_node_id() -> String {
    "peerlink".to_string()
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_transport() -> String {
    "clear".to_string()
}

fn default_bind_host() -> String {
    "0.0.0.0".to_string()
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_handshake_timeout() -> u64 {
    30
}

fn default_max_connections() -> usize {
    100
}

fn default_tor_proxy() -> String {
    "127.0.0.1:9050".to_string()
}

fn default_i2p_proxy() -> String {
    "127.0.0.1:4447".to_string()
}

fn default_base_difficulty() -> u32 {
    8
}

fn default_max_difficulty() -> u32 {
    24
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            port: 0,
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            supported_transports: Vec::new(),
            bind_host: default_bind_host(),
            public_host: None,
            connect_timeout_secs: default_connect_timeout(),
            handshake_timeout_secs: default_handshake_timeout(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            tor_proxy: default_tor_proxy(),
            tor_service_host: None,
            i2p_proxy: default_i2p_proxy(),
            i2p_service_host: None,
        }
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            pow_base_difficulty: default_base_difficulty(),
            pow_max_difficulty: default_max_difficulty(),
            banned: Vec::new(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = self.to_toml()?;

        // Create parent directory if it doesn't exist
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Render as pretty TOML
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("peerlink/config.toml")
    }

    /// Load config from `path` if it exists, otherwise use defaults
    ///
    /// # Errors
    ///
    /// Returns an error if an existing file cannot be read or parsed.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.node.id.trim().is_empty() {
            anyhow::bail!("Node id must not be empty");
        }

        self.transport_type()?;
        for name in &self.network.supported_transports {
            name.parse::<TransportType>()?;
        }

        self.network
            .bind_host
            .parse::<IpAddr>()
            .map_err(|_| anyhow::anyhow!("Invalid bind host: {}", self.network.bind_host))?;
        self.overlay
            .tor_proxy
            .parse::<SocketAddr>()
            .map_err(|_| anyhow::anyhow!("Invalid Tor proxy: {}", self.overlay.tor_proxy))?;
        self.overlay
            .i2p_proxy
            .parse::<SocketAddr>()
            .map_err(|_| anyhow::anyhow!("Invalid I2P proxy: {}", self.overlay.i2p_proxy))?;

        if self.network.max_connections == 0 {
            anyhow::bail!("Max connections must be at least 1");
        }
        if self.network.connect_timeout_secs == 0 || self.network.handshake_timeout_secs == 0 {
            anyhow::bail!("Timeouts must be at least 1 second");
        }

        let security = &self.security;
        if security.pow_base_difficulty > security.pow_max_difficulty {
            anyhow::bail!(
                "Base difficulty {} exceeds max difficulty {}",
                security.pow_base_difficulty,
                security.pow_max_difficulty
            );
        }
        if security.pow_max_difficulty > 64 {
            anyhow::bail!("Max difficulty must be at most 64 bits");
        }

        for banned in &security.banned {
            banned
                .parse::<Address>()
                .map_err(|e| anyhow::anyhow!("Banned address '{}': {}", banned, e))?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Transport named by `network.transport`
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown transport name.
    pub fn transport_type(&self) -> anyhow::Result<TransportType> {
        Ok(self.network.transport.parse()?)
    }

    /// Build the node configuration
    ///
    /// # Errors
    ///
    /// Returns an error if a field does not parse.
    pub fn to_node_config(&self) -> anyhow::Result<CoreNodeConfig> {
        let mut config = CoreNodeConfig::for_transport(self.transport_type()?);
        for name in &self.network.supported_transports {
            config.supported_transport_types.push(name.parse()?);
        }

        let transport = &mut config.transport;
        transport.bind_host = self.network.bind_host.parse()?;
        transport.public_host = self.network.public_host.clone();
        transport.connect_timeout = Duration::from_secs(self.network.connect_timeout_secs);
        transport.tor.socks_proxy = self.overlay.tor_proxy.parse()?;
        transport.tor.service_host = self.overlay.tor_service_host.clone();
        transport.i2p.socks_proxy = self.overlay.i2p_proxy.parse()?;
        transport.i2p.service_host = self.overlay.i2p_service_host.clone();

        config.connection.max_connections = self.network.max_connections;
        config.connection.handshake_timeout = Duration::from_secs(self.network.handshake_timeout_secs);
        config.throttle.max_connections = u32::try_from(self.network.max_connections).unwrap_or(u32::MAX);
        config.proof_of_work = ProofOfWorkConfig {
            base_difficulty: self.security.pow_base_difficulty,
            max_difficulty: self.security.pow_max_difficulty,
        };
        config.shutdown_timeout = Duration::from_secs(self.node.shutdown_timeout_secs);
        Ok(config)
    }

    /// Ban list seeded from `security.banned`
    ///
    /// # Errors
    ///
    /// Returns an error if an entry is not a valid address.
    pub fn ban_list(&self) -> anyhow::Result<BanList> {
        let list = BanList::new();
        for banned in &self.security.banned {
            list.ban(banned.parse()?);
        }
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.node.id, "peerlink");
        assert_eq!(config.network.transport, "clear");
        assert_eq!(config.network.max_connections, 100);
        assert_eq!(config.security.pow_base_difficulty, 8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.network.transport = "carrier-pigeon".to_string();
        assert!(config.validate().is_err());

        config.network.transport = "tor".to_string();
        config.security.pow_base_difficulty = 30;
        assert!(config.validate().is_err());

        config.security.pow_base_difficulty = 8;
        config.security.banned = vec!["not an address".to_string()];
        assert!(config.validate().is_err());

        config.security.banned = vec!["10.0.0.1:9999".to_string()];
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip_through_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");

        let mut config = Config::default();
        config.node.id = "alice".to_string();
        config.network.supported_transports = vec!["tor".to_string()];
        config.overlay.tor_service_host = Some("abcdef.onion".to_string());
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.node.id, "alice");
        assert_eq!(loaded.network.supported_transports, vec!["tor".to_string()]);
        assert_eq!(loaded.overlay.tor_service_host.as_deref(), Some("abcdef.onion"));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[node]\nid = \"bob\"\nport = 7000\n").unwrap();

        let config = Config::load_or_default(&path).unwrap();
        assert_eq!(config.node.id, "bob");
        assert_eq!(config.node.port, 7000);
        assert_eq!(config.network.transport, "clear");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.node.id, "peerlink");
    }

    #[test]
    fn test_to_node_config() {
        let mut config = Config::default();
        config.network.transport = "i2p".to_string();
        config.network.supported_transports = vec!["clear".to_string()];
        config.network.handshake_timeout_secs = 5;
        config.security.banned = vec!["10.0.0.1:9999".to_string()];

        let node_config = config.to_node_config().unwrap();
        assert_eq!(node_config.transport_type, TransportType::I2p);
        assert!(
            node_config
                .advertised_transport_types()
                .contains(&TransportType::Clear)
        );
        assert_eq!(node_config.connection.handshake_timeout, Duration::from_secs(5));
        assert_eq!(node_config.proof_of_work.base_difficulty, 8);

        let bans = config.ban_list().unwrap();
        assert!(bans.is_banned(&"10.0.0.1:9999".parse().unwrap()));
    }
}
