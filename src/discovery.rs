/// Discovery Module
///
/// Two mechanisms feed the peer tables: pubsub announcements on the
/// `vpn-peers` topic (peer id, virtual ip, timestamp; stale messages
/// dropped) and a LAN fast path broadcasting raw peer-id bytes over UDP
/// port 6666. LAN-discovered peers are marked `is_lan` and addressed
/// directly, skipping the DHT lookup.
use chrono::{DateTime, Utc};
use libp2p::{Multiaddr, PeerId};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::config::DiscoveryConfig;
use crate::error::{ZapError, ZapResult};

/// Pubsub topic for peer/virtual-ip announcements
pub const VPN_PEERS_TOPIC: &str = "vpn-peers";
/// Pubsub topic for VPN route discovery
pub const VPN_DISCOVERY_TOPIC: &str = "filezap-vpn-discovery";

/// Announcement published on `vpn-peers`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Announcement {
    pub peer_id: String,
    pub virtual_ip: String,
    /// Unix seconds
    pub ts: i64,
}

/// A peer heard over the LAN broadcast channel
#[derive(Debug, Clone)]
pub struct LanPeer {
    pub id: PeerId,
    pub addr: SocketAddr,
    pub multiaddr: Multiaddr,
    pub is_lan: bool,
    pub last_seen: DateTime<Utc>,
}

/// Tracks LAN- and pubsub-discovered peers
pub struct DiscoveryManager {
    local_id: PeerId,
    config: DiscoveryConfig,
    /// TCP port peers are assumed to serve their metadata host on
    peer_port: u16,
    lan_peers: RwLock<HashMap<PeerId, LanPeer>>,
    announced: RwLock<HashMap<PeerId, Announcement>>,
}

impl DiscoveryManager {
    pub fn new(local_id: PeerId, config: DiscoveryConfig, peer_port: u16) -> Self {
        Self {
            local_id,
            config,
            peer_port,
            lan_peers: RwLock::new(HashMap::new()),
            announced: RwLock::new(HashMap::new()),
        }
    }

    /// Build this node's announcement for the next publish round.
    pub fn local_announcement(&self, virtual_ip: Option<Ipv4Addr>) -> Announcement {
        Announcement {
            peer_id: self.local_id.to_string(),
            virtual_ip: virtual_ip.map(|ip| ip.to_string()).unwrap_or_default(),
            ts: Utc::now().timestamp(),
        }
    }

    /// Ingest a pubsub announcement. Self-announcements and messages
    /// older than the staleness window are dropped. Returns the parsed
    /// announcement when it was accepted.
    pub async fn handle_announcement(&self, data: &[u8]) -> ZapResult<Option<Announcement>> {
        let announcement: Announcement = serde_json::from_slice(data)?;
        let id: PeerId = announcement
            .peer_id
            .parse()
            .map_err(|e| ZapError::Protocol(format!("bad peer id in announcement: {}", e)))?;
        if id == self.local_id {
            return Ok(None);
        }
        let age = Utc::now().timestamp() - announcement.ts;
        if age > self.config.stale_secs as i64 {
            debug!(peer = %id, age, "dropping stale announcement");
            return Ok(None);
        }
        self.announced.write().await.insert(id, announcement.clone());
        Ok(Some(announcement))
    }

    /// Ingest one LAN datagram (raw peer-id bytes). Self-announcements
    /// are ignored.
    pub async fn handle_lan_datagram(&self, data: &[u8], src: SocketAddr) -> Option<LanPeer> {
        let id = PeerId::from_bytes(data).ok()?;
        if id == self.local_id {
            return None;
        }
        let multiaddr: Multiaddr = match src.ip() {
            IpAddr::V4(ip) => format!("/ip4/{}/tcp/{}", ip, self.peer_port),
            IpAddr::V6(ip) => format!("/ip6/{}/tcp/{}", ip, self.peer_port),
        }
        .parse()
        .ok()?;
        let peer = LanPeer {
            id,
            addr: src,
            multiaddr,
            is_lan: true,
            last_seen: Utc::now(),
        };
        self.lan_peers.write().await.insert(id, peer.clone());
        Some(peer)
    }

    /// LAN entry for a peer, if any.
    pub async fn lan_peer(&self, id: &PeerId) -> Option<LanPeer> {
        self.lan_peers.read().await.get(id).cloned()
    }

    pub async fn is_lan(&self, id: &PeerId) -> bool {
        self.lan_peers.read().await.contains_key(id)
    }

    /// All peers seen via pubsub announcements.
    pub async fn announced_peers(&self) -> Vec<Announcement> {
        self.announced.read().await.values().cloned().collect()
    }

    /// Drop announcements past the staleness window.
    pub async fn prune(&self) {
        let cutoff = Utc::now().timestamp() - self.config.stale_secs as i64;
        self.announced.write().await.retain(|_, a| a.ts >= cutoff);
        let lan_cutoff =
            Utc::now() - chrono::Duration::seconds(self.config.stale_secs as i64);
        self.lan_peers.write().await.retain(|_, p| p.last_seen >= lan_cutoff);
    }

    /// Run the LAN broadcast channel: announce every interval, ingest
    /// every incoming datagram. Returns the discovered-peer stream.
    pub async fn spawn_lan(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
        discovered_tx: tokio::sync::mpsc::Sender<LanPeer>,
    ) -> ZapResult<tokio::task::JoinHandle<()>> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, self.config.lan_port))
            .await
            .map_err(|e| {
                ZapError::Network(format!(
                    "LAN discovery bind on port {} failed: {}",
                    self.config.lan_port, e
                ))
            })?;
        socket
            .set_broadcast(true)
            .map_err(|e| ZapError::Network(format!("broadcast flag: {}", e)))?;

        let manager = Arc::clone(self);
        let interval = Duration::from_secs(self.config.lan_interval_secs);
        let broadcast_to = SocketAddr::from((Ipv4Addr::BROADCAST, self.config.lan_port));
        info!(port = self.config.lan_port, "LAN discovery running");

        Ok(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            let mut buf = [0u8; 128];
            let announce = manager.local_id.to_bytes();
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("LAN discovery stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(&announce, broadcast_to).await {
                            debug!("LAN broadcast failed: {}", e);
                        }
                    }
                    received = socket.recv_from(&mut buf) => {
                        match received {
                            Ok((len, src)) => {
                                if let Some(peer) = manager.handle_lan_datagram(&buf[..len], src).await {
                                    debug!(peer = %peer.id, %src, "LAN peer heard");
                                    let _ = discovered_tx.send(peer).await;
                                }
                            }
                            Err(e) => {
                                warn!("LAN receive failed: {}", e);
                                tokio::time::sleep(Duration::from_millis(500)).await;
                            }
                        }
                    }
                }
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(local: PeerId) -> DiscoveryManager {
        DiscoveryManager::new(local, crate::config::Config::default().discovery, 6001)
    }

    fn announcement(id: &PeerId, ts: i64) -> Vec<u8> {
        serde_json::to_vec(&Announcement {
            peer_id: id.to_string(),
            virtual_ip: "10.42.1.2".into(),
            ts,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn fresh_announcements_recorded() {
        let local = PeerId::random();
        let discovery = manager(local);
        let other = PeerId::random();
        let accepted = discovery
            .handle_announcement(&announcement(&other, Utc::now().timestamp()))
            .await
            .unwrap();
        assert!(accepted.is_some());
        assert_eq!(discovery.announced_peers().await.len(), 1);
    }

    #[tokio::test]
    async fn stale_and_self_announcements_dropped() {
        let local = PeerId::random();
        let discovery = manager(local);

        let old = Utc::now().timestamp() - 300;
        let other = PeerId::random();
        assert!(discovery
            .handle_announcement(&announcement(&other, old))
            .await
            .unwrap()
            .is_none());

        assert!(discovery
            .handle_announcement(&announcement(&local, Utc::now().timestamp()))
            .await
            .unwrap()
            .is_none());
        assert!(discovery.announced_peers().await.is_empty());
    }

    #[tokio::test]
    async fn lan_datagrams_build_dialable_addresses() {
        let local = PeerId::random();
        let discovery = manager(local);
        let other = PeerId::random();
        let src: SocketAddr = "192.168.1.7:6666".parse().unwrap();

        let peer = discovery
            .handle_lan_datagram(&other.to_bytes(), src)
            .await
            .unwrap();
        assert!(peer.is_lan);
        assert_eq!(peer.multiaddr.to_string(), "/ip4/192.168.1.7/tcp/6001");
        assert!(discovery.is_lan(&other).await);
        assert!(discovery.lan_peer(&other).await.is_some());

        // Own broadcasts are ignored.
        assert!(discovery
            .handle_lan_datagram(&local.to_bytes(), src)
            .await
            .is_none());
        // Garbage is ignored.
        assert!(discovery.handle_lan_datagram(b"junk", src).await.is_none());
    }
}
