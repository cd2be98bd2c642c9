/// Command Line Interface Module
///
/// Defines the command-line surface of the `networkcore` daemon using Clap.
/// The daemon joins the FileZap network, serves chunks and overlay requests,
/// and runs until SIGINT/SIGTERM.
use clap::Parser;
use libp2p::{Multiaddr, PeerId};
use std::path::PathBuf;

/// CLI for the FileZap network core daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "networkcore")]
pub struct Cli {
    /// Chunk cache directory
    #[arg(long, default_value = "storage")]
    pub storage: PathBuf,
    /// Metadata directory (node identity, registry.json)
    #[arg(long, default_value = "metadata")]
    pub metadata: PathBuf,
    /// Port for the metadata host; the transport host uses port+1
    #[arg(long, default_value_t = 6001)]
    pub port: u16,
    /// Optional TOML configuration file
    #[arg(long)]
    pub config: Option<PathBuf>,
    /// Peer IDs of bootstrap nodes (paired positionally with --bootstrap-addr)
    #[arg(long)]
    pub bootstrap_peer: Vec<PeerId>,
    /// Multiaddresses of bootstrap nodes
    #[arg(long)]
    pub bootstrap_addr: Vec<Multiaddr>,
    /// Start the virtual IPv4 overlay
    #[arg(long, default_value_t = false)]
    pub enable_vpn: bool,
}

impl Cli {
    /// Bootstrap entries as (peer, address) pairs.
    ///
    /// Flags are paired positionally; unmatched trailing entries of either
    /// flag are ignored with a warning.
    pub fn bootstrap_entries(&self) -> Vec<(PeerId, Multiaddr)> {
        if self.bootstrap_peer.len() != self.bootstrap_addr.len() {
            tracing::warn!(
                peers = self.bootstrap_peer.len(),
                addrs = self.bootstrap_addr.len(),
                "bootstrap flag counts differ; extra entries ignored"
            );
        }
        self.bootstrap_peer
            .iter()
            .cloned()
            .zip(self.bootstrap_addr.iter().cloned())
            .collect()
    }

    /// Fold CLI flags into a loaded configuration.
    pub fn apply_to(&self, config: &mut crate::config::Config) {
        config.storage.chunk_dir = self.storage.clone();
        config.storage.metadata_dir = self.metadata.clone();
        config.network.port = self.port;
        if self.enable_vpn {
            config.vpn.enabled = true;
        }
        for (peer, addr) in self.bootstrap_entries() {
            config.network.bootstrap_peers.push(crate::config::BootstrapPeer {
                peer_id: peer.to_string(),
                address: addr.to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["networkcore"]);
        assert_eq!(cli.storage, PathBuf::from("storage"));
        assert_eq!(cli.metadata, PathBuf::from("metadata"));
        assert_eq!(cli.port, 6001);
        assert!(!cli.enable_vpn);
    }

    #[test]
    fn bootstrap_pairing() {
        let peer = PeerId::random();
        let peer_arg = peer.to_string();
        let cli = Cli::parse_from([
            "networkcore",
            "--bootstrap-peer",
            peer_arg.as_str(),
            "--bootstrap-addr",
            "/ip4/10.0.0.1/tcp/6001",
        ]);
        let entries = cli.bootstrap_entries();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].0, peer);
    }
}
