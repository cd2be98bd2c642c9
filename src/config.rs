use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration for a FileZap network core node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Network configuration
    pub network: NetworkConfig,
    /// Storage configuration
    pub storage: StorageConfig,
    /// Peer lifecycle configuration
    pub peers: PeerConfig,
    /// Gossip configuration
    pub gossip: GossipConfig,
    /// Quorum and reputation configuration
    pub quorum: QuorumConfig,
    /// Discovery configuration
    pub discovery: DiscoveryConfig,
    /// VPN overlay configuration
    pub vpn: VpnConfig,
    /// Operation timeouts
    pub timeouts: TimeoutConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Port for the metadata host (TCP). The transport host listens on
    /// `port + 1` for both TCP and QUIC.
    pub port: u16,
    /// Bootstrap peers dialed on both hosts at startup
    pub bootstrap_peers: Vec<BootstrapPeer>,
    /// Idle connection timeout in seconds
    pub idle_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapPeer {
    pub peer_id: String,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Chunk cache directory (one file per chunk, named by encrypted hash)
    pub chunk_dir: PathBuf,
    /// Metadata directory: node identity and registry.json
    pub metadata_dir: PathBuf,
    /// Disk quota for the chunk cache in bytes
    pub quota_bytes: u64,
    /// Target number of DHT replicas for published manifests
    pub replication_goal: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    /// Advisory cap on tracked peers
    pub max_peers: usize,
    /// Advisory cap on chunks attributed to a single peer
    pub max_chunks_per_peer: u64,
    /// Advisory cap on bytes attributed to a single peer
    pub max_chunk_bytes: u64,
    /// A peer unseen for this long is evicted by the sweeper
    pub timeout_secs: u64,
    /// Sweeper interval
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Interval between gossip publications in seconds
    pub publish_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuorumConfig {
    /// Votes older than this no longer count toward a decision
    pub vote_window_secs: u64,
    /// Reputation score at or below which this node votes to remove a peer
    pub ban_score: i64,
    /// Votes from peers first seen more recently than this are ignored.
    /// The quorum is trust-on-membership; this is the only sybil knob.
    pub min_voter_age_secs: u64,
    /// A peer unseen for longer than this takes a health penalty
    pub stale_peer_secs: u64,
    /// Uptime percentage below which a peer takes a health penalty
    pub min_uptime_pct: f64,
    /// EWMA response time above which a peer takes a health penalty
    pub max_response_time_ms: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    /// UDP port for LAN broadcast announcements
    pub lan_port: u16,
    /// Interval between LAN broadcasts in seconds
    pub lan_interval_secs: u64,
    /// Interval between pubsub announcements in seconds
    pub announce_interval_secs: u64,
    /// Announcements older than this are dropped
    pub stale_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpnConfig {
    /// Whether the virtual IPv4 overlay is started
    pub enabled: bool,
    /// CIDR whose first two octets anchor derived addresses
    pub cidr: String,
    /// Tunnel MTU
    pub mtu: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    pub bootstrap_secs: u64,
    pub request_secs: u64,
    pub stream_open_secs: u64,
    pub dht_get_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Log to file instead of stderr
    pub log_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            network: NetworkConfig {
                port: 6001,
                bootstrap_peers: vec![],
                idle_timeout_secs: 120,
            },
            storage: StorageConfig {
                chunk_dir: PathBuf::from("storage"),
                metadata_dir: PathBuf::from("metadata"),
                quota_bytes: 100 * 1024 * 1024 * 1024, // 100 GiB
                replication_goal: 3,
            },
            peers: PeerConfig {
                max_peers: 256,
                max_chunks_per_peer: 10_000,
                max_chunk_bytes: 10 * 1024 * 1024 * 1024,
                timeout_secs: 3600, // 1 hour
                sweep_interval_secs: 300,
            },
            gossip: GossipConfig {
                publish_interval_secs: 60,
            },
            quorum: QuorumConfig {
                vote_window_secs: 600,
                ban_score: -10,
                min_voter_age_secs: 0,
                stale_peer_secs: 3600,
                min_uptime_pct: 50.0,
                max_response_time_ms: 1000.0,
            },
            discovery: DiscoveryConfig {
                lan_port: 6666,
                lan_interval_secs: 10,
                announce_interval_secs: 60,
                stale_secs: 120,
            },
            vpn: VpnConfig {
                enabled: false,
                cidr: "10.42.0.0/16".to_string(),
                mtu: 1420,
            },
            timeouts: TimeoutConfig {
                bootstrap_secs: 30,
                request_secs: 30,
                stream_open_secs: 30,
                dht_get_secs: 30,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_file: None,
            },
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults
    pub fn load_or_default(config_path: Option<PathBuf>) -> crate::error::ZapResult<Self> {
        if let Some(path) = config_path {
            if path.exists() {
                let config_str = std::fs::read_to_string(&path)?;
                let config: Config = toml::from_str(&config_str).map_err(|e| {
                    crate::error::ZapError::Config(format!("Config parse error: {}", e))
                })?;
                tracing::info!("Loaded configuration from {:?}", path);
                return Ok(config);
            }
        }

        tracing::info!("Using default configuration");
        Ok(Config::default())
    }

    /// Save configuration to file
    pub fn save(&self, config_path: &PathBuf) -> crate::error::ZapResult<()> {
        let config_str = toml::to_string_pretty(self).map_err(|e| {
            crate::error::ZapError::Serialization(format!("Config serialize error: {}", e))
        })?;

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        std::fs::write(config_path, config_str)?;
        tracing::info!("Configuration saved to {:?}", config_path);
        Ok(())
    }

    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.bootstrap_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn dht_get_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.dht_get_secs)
    }

    pub fn peer_timeout(&self) -> Duration {
        Duration::from_secs(self.peers.timeout_secs)
    }

    /// Port the transport (QUIC + TCP) host listens on.
    pub fn transport_port(&self) -> u16 {
        self.network.port.wrapping_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_protocol_constants() {
        let config = Config::default();
        assert_eq!(config.network.port, 6001);
        assert_eq!(config.storage.quota_bytes, 100 * 1024 * 1024 * 1024);
        assert_eq!(config.peers.timeout_secs, 3600);
        assert_eq!(config.discovery.lan_port, 6666);
        assert_eq!(config.vpn.cidr, "10.42.0.0/16");
        assert_eq!(config.vpn.mtu, 1420);
    }

    #[test]
    fn toml_round_trip() {
        let config = Config::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: Config = toml::from_str(&text).unwrap();
        assert_eq!(parsed.network.port, config.network.port);
        assert_eq!(parsed.quorum.vote_window_secs, config.quorum.vote_window_secs);
    }
}
