/// Gossip Manager Module
///
/// Exchanges peer liveness and quality metrics on the `filezap-gossip`
/// pubsub topic of the metadata host. Every publish interval this node
/// broadcasts its own record; received records are merged into the local
/// view with `last_seen = max(local, remote)` and an EWMA over response
/// times.
use chrono::{DateTime, TimeZone, Utc};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{ZapError, ZapResult};
use crate::peer_manager::PeerManager;

/// Pubsub topic for peer liveness exchange
pub const GOSSIP_TOPIC: &str = "filezap-gossip";

/// Smoothing factor for the response-time EWMA
pub const RESPONSE_TIME_ALPHA: f64 = 0.2;

/// Record published on the gossip topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipRecord {
    pub id: String,
    /// Unix seconds
    pub last_seen: i64,
    pub uptime_pct: f64,
    pub response_time_ms: f64,
}

/// Local view of one gossiped peer
#[derive(Debug, Clone)]
pub struct PeerGossip {
    pub id: PeerId,
    pub last_seen: DateTime<Utc>,
    pub uptime_pct: f64,
    pub response_time_ms: f64,
}

/// Collects and merges gossip records
pub struct GossipManager {
    local_id: PeerId,
    peers: RwLock<HashMap<PeerId, PeerGossip>>,
    peer_manager: Arc<PeerManager>,
    rounds: AtomicU64,
    rounds_with_peers: AtomicU64,
}

fn ewma(previous: f64, sample: f64) -> f64 {
    RESPONSE_TIME_ALPHA * sample + (1.0 - RESPONSE_TIME_ALPHA) * previous
}

impl GossipManager {
    pub fn new(local_id: PeerId, peer_manager: Arc<PeerManager>) -> Self {
        Self {
            local_id,
            peers: RwLock::new(HashMap::new()),
            peer_manager,
            rounds: AtomicU64::new(0),
            rounds_with_peers: AtomicU64::new(0),
        }
    }

    /// Build this node's record for the next publish round. Uptime is the
    /// fraction of publish rounds during which the node had at least one
    /// connected peer.
    pub async fn local_record(&self, connected_peers: usize) -> GossipRecord {
        let rounds = self.rounds.fetch_add(1, Ordering::Relaxed) + 1;
        let with_peers = if connected_peers > 0 {
            self.rounds_with_peers.fetch_add(1, Ordering::Relaxed) + 1
        } else {
            self.rounds_with_peers.load(Ordering::Relaxed)
        };
        let response_time_ms = {
            let peers = self.peers.read().await;
            peers.get(&self.local_id).map(|p| p.response_time_ms).unwrap_or(0.0)
        };
        GossipRecord {
            id: self.local_id.to_string(),
            last_seen: Utc::now().timestamp(),
            uptime_pct: 100.0 * with_peers as f64 / rounds as f64,
            response_time_ms,
        }
    }

    /// Merge a received gossip record into the local view.
    pub async fn handle_record(&self, data: &[u8]) -> ZapResult<()> {
        let record: GossipRecord = serde_json::from_slice(data)?;
        let id = PeerId::from_str(&record.id)
            .map_err(|e| ZapError::Protocol(format!("bad peer id in gossip: {}", e)))?;
        if id == self.local_id {
            return Ok(());
        }
        let remote_seen = Utc
            .timestamp_opt(record.last_seen, 0)
            .single()
            .unwrap_or_else(Utc::now);

        let merged = {
            let mut peers = self.peers.write().await;
            let entry = peers.entry(id).or_insert_with(|| PeerGossip {
                id,
                last_seen: remote_seen,
                uptime_pct: record.uptime_pct,
                response_time_ms: record.response_time_ms,
            });
            if remote_seen > entry.last_seen {
                entry.last_seen = remote_seen;
            }
            entry.uptime_pct = record.uptime_pct;
            entry.response_time_ms = ewma(entry.response_time_ms, record.response_time_ms);
            entry.clone()
        };

        self.peer_manager
            .update_gossip(id, merged.last_seen, merged.uptime_pct, merged.response_time_ms)
            .await;
        debug!(peer = %id, rt = merged.response_time_ms, "gossip record merged");
        Ok(())
    }

    /// Fold a locally measured response time (or penalty) into a peer's
    /// EWMA. Used by the transfer layer after each request.
    pub async fn record_response_time(&self, id: PeerId, sample_ms: f64) {
        let merged = {
            let mut peers = self.peers.write().await;
            let entry = peers.entry(id).or_insert_with(|| PeerGossip {
                id,
                last_seen: Utc::now(),
                uptime_pct: 100.0,
                response_time_ms: sample_ms,
            });
            entry.response_time_ms = ewma(entry.response_time_ms, sample_ms);
            entry.clone()
        };
        self.peer_manager
            .update_gossip(id, merged.last_seen, merged.uptime_pct, merged.response_time_ms)
            .await;
    }

    /// Snapshot of all gossiped peers.
    pub async fn get_peers(&self) -> Vec<PeerGossip> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Ids only.
    pub async fn peers(&self) -> Vec<PeerId> {
        self.peers.read().await.keys().cloned().collect()
    }
}
