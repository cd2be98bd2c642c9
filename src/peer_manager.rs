/// Peer Manager Module
///
/// Tracks the lifecycle of every peer this node has observed: connection
/// state, last-seen time, per-peer chunk accounting, gossip quality stats,
/// and reputation. A background sweeper evicts peers unseen for longer
/// than the configured timeout (default 1 hour).
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use libp2p::identity::PublicKey;
use libp2p::{Multiaddr, PeerId};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

/// Connection state of a tracked peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Unknown,
    Connected,
    Disconnected,
    /// Imposed by quorum outcome; terminal until an operator reset.
    Blocked,
}

/// Everything known about one peer
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub id: PeerId,
    pub addrs: Vec<Multiaddr>,
    pub state: PeerState,
    pub last_seen: DateTime<Utc>,
    pub chunk_count: u64,
    pub total_bytes: u64,
    pub uptime_pct: f64,
    pub response_time_ms: f64,
    pub reputation_score: i64,
    pub first_seen: DateTime<Utc>,
    pub public_key: Option<PublicKey>,
}

impl PeerInfo {
    fn new(id: PeerId, addrs: Vec<Multiaddr>) -> Self {
        let now = Utc::now();
        Self {
            id,
            addrs,
            state: PeerState::Unknown,
            last_seen: now,
            chunk_count: 0,
            total_bytes: 0,
            uptime_pct: 100.0,
            response_time_ms: 0.0,
            reputation_score: 0,
            first_seen: now,
            public_key: None,
        }
    }
}

/// Advisory per-peer resource limits
#[derive(Debug, Clone)]
pub struct PeerLimits {
    pub max_peers: usize,
    pub max_chunks_per_peer: u64,
    pub max_chunk_bytes: u64,
}

impl Default for PeerLimits {
    fn default() -> Self {
        Self {
            max_peers: 256,
            max_chunks_per_peer: 10_000,
            max_chunk_bytes: 10 * 1024 * 1024 * 1024,
        }
    }
}

/// Registry of observed peers with TTL eviction
pub struct PeerManager {
    peers: RwLock<HashMap<PeerId, PeerInfo>>,
    limits: RwLock<PeerLimits>,
    timeout: Duration,
}

impl PeerManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
            limits: RwLock::new(PeerLimits::default()),
            timeout,
        }
    }

    /// Record an observation of a peer, creating it on first sight.
    /// New addresses extend the known set; `last_seen` is refreshed.
    pub async fn add_or_update(&self, id: PeerId, addrs: Vec<Multiaddr>) -> PeerInfo {
        let max_peers = self.limits.read().await.max_peers;
        let mut peers = self.peers.write().await;
        if !peers.contains_key(&id) && peers.len() >= max_peers {
            warn!(%id, max = max_peers, "peer table above advisory limit");
        }
        let entry = peers.entry(id).or_insert_with(|| PeerInfo::new(id, vec![]));
        for addr in addrs {
            if !entry.addrs.contains(&addr) {
                entry.addrs.push(addr);
            }
        }
        entry.last_seen = Utc::now();
        entry.clone()
    }

    /// Set a peer's connection state. Blocked is sticky: only `reset`
    /// leaves it. Returns false for unknown peers and refused transitions.
    pub async fn update_state(&self, id: &PeerId, state: PeerState) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(id) {
            Some(peer) => {
                if peer.state == PeerState::Blocked && state != PeerState::Blocked {
                    return false;
                }
                peer.state = state;
                if state == PeerState::Connected {
                    peer.last_seen = Utc::now();
                }
                true
            }
            None => false,
        }
    }

    /// Operator-only escape from the Blocked state.
    pub async fn reset(&self, id: &PeerId) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(id) {
            Some(peer) => {
                peer.state = PeerState::Unknown;
                peer.reputation_score = 0;
                true
            }
            None => false,
        }
    }

    pub async fn get(&self, id: &PeerId) -> Option<PeerInfo> {
        self.peers.read().await.get(id).cloned()
    }

    pub async fn list(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Peers currently connected. Blocked peers never appear here.
    pub async fn list_connected(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.state == PeerState::Connected)
            .cloned()
            .collect()
    }

    pub async fn remove(&self, id: &PeerId) -> bool {
        self.peers.write().await.remove(id).is_some()
    }

    pub async fn set_limits(&self, limits: PeerLimits) {
        *self.limits.write().await = limits;
    }

    /// Attribute one stored chunk to a peer. Limits are advisory: the
    /// counters always move, an overrun is only logged.
    pub async fn add_chunk(&self, id: &PeerId, size: u64) -> bool {
        let limits = self.limits.read().await.clone();
        let mut peers = self.peers.write().await;
        match peers.get_mut(id) {
            Some(peer) => {
                peer.chunk_count += 1;
                peer.total_bytes += size;
                if peer.chunk_count > limits.max_chunks_per_peer
                    || peer.total_bytes > limits.max_chunk_bytes
                {
                    warn!(%id, chunks = peer.chunk_count, bytes = peer.total_bytes,
                        "peer above advisory chunk limits");
                }
                true
            }
            None => false,
        }
    }

    /// Release one chunk attribution. Fails when the counter is already
    /// at zero.
    pub async fn remove_chunk(&self, id: &PeerId, size: u64) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(id) {
            Some(peer) if peer.chunk_count > 0 => {
                peer.chunk_count -= 1;
                peer.total_bytes = peer.total_bytes.saturating_sub(size);
                true
            }
            _ => false,
        }
    }

    /// Merge gossip stats into a peer record, creating it if needed.
    /// Remote `last_seen` only moves the local value forward.
    pub async fn update_gossip(
        &self,
        id: PeerId,
        last_seen: DateTime<Utc>,
        uptime_pct: f64,
        response_time_ms: f64,
    ) {
        let mut peers = self.peers.write().await;
        let entry = peers.entry(id).or_insert_with(|| PeerInfo::new(id, vec![]));
        if last_seen > entry.last_seen {
            entry.last_seen = last_seen;
        }
        entry.uptime_pct = uptime_pct;
        entry.response_time_ms = response_time_ms;
    }

    /// Apply a reputation delta; returns the new score.
    pub async fn adjust_reputation(&self, id: &PeerId, delta: i64) -> Option<i64> {
        let mut peers = self.peers.write().await;
        peers.get_mut(id).map(|peer| {
            peer.reputation_score += delta;
            peer.reputation_score
        })
    }

    /// Record the public key learned from the identify exchange.
    pub async fn set_public_key(&self, id: &PeerId, key: PublicKey) {
        let mut peers = self.peers.write().await;
        if let Some(peer) = peers.get_mut(id) {
            peer.public_key = Some(key);
        }
    }

    pub async fn public_key(&self, id: &PeerId) -> Option<PublicKey> {
        self.peers.read().await.get(id).and_then(|p| p.public_key.clone())
    }

    /// Evict peers unseen for longer than the timeout. Returns the
    /// evicted ids.
    pub async fn sweep(&self) -> Vec<PeerId> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.timeout).unwrap_or_else(|_| ChronoDuration::hours(1));
        let mut peers = self.peers.write().await;
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|p| p.last_seen < cutoff)
            .map(|p| p.id)
            .collect();
        for id in &stale {
            peers.remove(id);
            info!(%id, "evicted stale peer");
        }
        stale
    }

    /// Run the eviction sweep on an interval until shutdown.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("peer sweeper stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        let evicted = manager.sweep().await;
                        if !evicted.is_empty() {
                            debug!(count = evicted.len(), "peer sweep complete");
                        }
                    }
                }
            }
        })
    }
}
