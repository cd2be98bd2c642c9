/// Quorum and Reputation Module
///
/// Demotes and evicts misbehaving peers and purges poisoned files. Each
/// peer carries a signed integer reputation starting at zero; the
/// once-a-minute health check applies penalties for staleness, low
/// uptime, and slow responses. A score at or below the ban threshold
/// makes this node cast a `RemovePeer` vote on the `filezap-votes`
/// topic. A target accumulates votes from distinct voters inside a
/// sliding window; at two thirds of the currently connected peers the
/// outcome fires on the ban or file-removal channel.
///
/// The quorum is trust-on-membership: one vote per distinct peer id,
/// optionally gated by `min_voter_age_secs`. There is no proof-of-work
/// or stake behind a vote.
use libp2p::identity::{Keypair, PublicKey};
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::QuorumConfig;
use crate::error::{ZapError, ZapResult};
use crate::peer_manager::{PeerManager, PeerState};

/// Pubsub topic for quorum votes
pub const VOTE_TOPIC: &str = "filezap-votes";

/// Capacity of the ban and file-removal event channels
pub const EVENT_CHANNEL_CAPACITY: usize = 16;

/// Reputation penalty for a failed validation
pub const VALIDATION_PENALTY: i64 = -3;
/// Reputation penalty for a protocol violation
pub const PROTOCOL_PENALTY: i64 = -5;

/// What a vote asks to remove
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VoteType {
    RemovePeer,
    RemoveFile,
}

/// A broadcast vote
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vote {
    pub vote_type: VoteType,
    pub target_id: String,
    pub voter_id: String,
    pub signature: Vec<u8>,
}

fn signing_bytes(vote_type: VoteType, target: &str, voter: &str) -> Vec<u8> {
    let tag = match vote_type {
        VoteType::RemovePeer => "remove-peer",
        VoteType::RemoveFile => "remove-file",
    };
    format!("{}:{}:{}", tag, target, voter).into_bytes()
}

impl Vote {
    /// Verify the vote signature against a voter's public key.
    pub fn verify(&self, key: &PublicKey) -> bool {
        key.verify(
            &signing_bytes(self.vote_type, &self.target_id, &self.voter_id),
            &self.signature,
        )
    }
}

/// Outcome receivers consumed by the engine's monitor loop
pub struct QuorumEvents {
    pub peer_banned: mpsc::Receiver<PeerId>,
    pub file_removed: mpsc::Receiver<String>,
}

/// Vote collection and reputation bookkeeping
pub struct QuorumManager {
    config: QuorumConfig,
    local_id: PeerId,
    keypair: Keypair,
    peer_manager: Arc<PeerManager>,
    /// target -> voter -> time of vote
    tallies: Mutex<HashMap<(VoteType, String), HashMap<String, Instant>>>,
    /// targets this node has already voted on
    cast: Mutex<HashSet<(VoteType, String)>>,
    banned_tx: mpsc::Sender<PeerId>,
    removed_tx: mpsc::Sender<String>,
}

/// Votes needed for a decision: `ceil(2/3 * connected)`, zero when no
/// peer is connected (no decisions in an empty room).
pub fn vote_threshold(connected: usize) -> usize {
    if connected == 0 {
        return 0;
    }
    (2 * connected + 2) / 3
}

impl QuorumManager {
    pub fn new(
        config: QuorumConfig,
        local_id: PeerId,
        keypair: Keypair,
        peer_manager: Arc<PeerManager>,
    ) -> (Arc<Self>, QuorumEvents) {
        let (banned_tx, peer_banned) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (removed_tx, file_removed) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Arc::new(Self {
                config,
                local_id,
                keypair,
                peer_manager,
                tallies: Mutex::new(HashMap::new()),
                cast: Mutex::new(HashSet::new()),
                banned_tx,
                removed_tx,
            }),
            QuorumEvents {
                peer_banned,
                file_removed,
            },
        )
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.vote_window_secs)
    }

    /// Build a vote signed with this node's host key.
    pub fn make_vote(&self, vote_type: VoteType, target: &str) -> ZapResult<Vote> {
        let voter = self.local_id.to_string();
        let signature = self
            .keypair
            .sign(&signing_bytes(vote_type, target, &voter))
            .map_err(|e| ZapError::Network(format!("vote signing failed: {}", e)))?;
        Ok(Vote {
            vote_type,
            target_id: target.to_string(),
            voter_id: voter,
            signature,
        })
    }

    /// Apply the periodic reputation deltas and return the votes this
    /// node casts as a result. The caller broadcasts them and feeds them
    /// back through `handle_vote` so the local tally counts them too.
    pub async fn health_check(&self) -> Vec<Vote> {
        let now = chrono::Utc::now();
        let stale_cutoff = chrono::Duration::seconds(self.config.stale_peer_secs as i64);
        let mut votes = Vec::new();

        for peer in self.peer_manager.list().await {
            if peer.id == self.local_id || peer.state == PeerState::Blocked {
                continue;
            }
            let mut delta = 0i64;
            if now - peer.last_seen > stale_cutoff {
                delta -= 1;
            }
            if peer.uptime_pct < self.config.min_uptime_pct {
                delta -= 1;
            }
            if peer.response_time_ms > self.config.max_response_time_ms {
                delta -= 1;
            }
            if delta == 0 {
                continue;
            }
            let score = match self.peer_manager.adjust_reputation(&peer.id, delta).await {
                Some(score) => score,
                None => continue,
            };
            debug!(peer = %peer.id, delta, score, "health check applied");
            if score <= self.config.ban_score {
                let key = (VoteType::RemovePeer, peer.id.to_string());
                let mut cast = self.cast.lock().await;
                if cast.insert(key) {
                    match self.make_vote(VoteType::RemovePeer, &peer.id.to_string()) {
                        Ok(vote) => {
                            info!(peer = %peer.id, score, "reputation below ban threshold, voting to remove");
                            votes.push(vote);
                        }
                        Err(e) => warn!("could not sign removal vote: {}", e),
                    }
                }
            }
        }
        votes
    }

    /// Penalize a peer for a failed validation (-3).
    pub async fn penalize_validation(&self, id: &PeerId) -> Option<i64> {
        self.peer_manager.adjust_reputation(id, VALIDATION_PENALTY).await
    }

    /// Penalize a peer for a protocol violation (-5).
    pub async fn penalize_protocol(&self, id: &PeerId) -> Option<i64> {
        self.peer_manager.adjust_reputation(id, PROTOCOL_PENALTY).await
    }

    /// Tally a vote against the current connected-peer count, firing the
    /// outcome channel when the threshold is met inside the window.
    /// Returns true when a decision fired.
    pub async fn handle_vote(&self, vote: Vote, connected: usize) -> ZapResult<bool> {
        let voter = PeerId::from_str(&vote.voter_id)
            .map_err(|e| ZapError::Protocol(format!("bad voter id: {}", e)))?;

        // Signature is checked when the voter's key is known; unknown
        // voters are admitted (trust-on-membership).
        if let Some(key) = self.peer_manager.public_key(&voter).await {
            if !vote.verify(&key) {
                self.penalize_protocol(&voter).await;
                return Err(ZapError::Protocol(format!(
                    "invalid vote signature from {}",
                    voter
                )));
            }
        }

        if self.config.min_voter_age_secs > 0 && voter != self.local_id {
            match self.peer_manager.get(&voter).await {
                Some(info) => {
                    let age = chrono::Utc::now() - info.first_seen;
                    if age < chrono::Duration::seconds(self.config.min_voter_age_secs as i64) {
                        debug!(%voter, "vote ignored: voter younger than min_voter_age");
                        return Ok(false);
                    }
                }
                None => {
                    debug!(%voter, "vote ignored: unknown voter with min_voter_age set");
                    return Ok(false);
                }
            }
        }

        let threshold = vote_threshold(connected);
        if threshold == 0 {
            return Ok(false);
        }

        let key = (vote.vote_type, vote.target_id.clone());
        let window = self.window();
        let count = {
            let mut tallies = self.tallies.lock().await;
            let tally = tallies.entry(key.clone()).or_default();
            tally.retain(|_, cast_at| cast_at.elapsed() < window);
            tally.insert(vote.voter_id.clone(), Instant::now());
            tally.len()
        };

        debug!(target = %vote.target_id, count, threshold, "vote tallied");
        if count < threshold {
            return Ok(false);
        }

        self.tallies.lock().await.remove(&key);
        match vote.vote_type {
            VoteType::RemovePeer => {
                let target = PeerId::from_str(&vote.target_id)
                    .map_err(|e| ZapError::Protocol(format!("bad ban target: {}", e)))?;
                info!(peer = %target, "quorum reached: peer banned");
                if let Err(e) = self.banned_tx.try_send(target) {
                    warn!("ban event channel full, dropping: {}", e);
                }
            }
            VoteType::RemoveFile => {
                info!(file = %vote.target_id, "quorum reached: file removed");
                if let Err(e) = self.removed_tx.try_send(vote.target_id.clone()) {
                    warn!("file-removal event channel full, dropping: {}", e);
                }
            }
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn quorum_config() -> QuorumConfig {
        crate::config::Config::default().quorum
    }

    fn setup(config: QuorumConfig) -> (Arc<QuorumManager>, QuorumEvents, Arc<PeerManager>) {
        let keypair = Keypair::generate_ed25519();
        let local_id = keypair.public().to_peer_id();
        let pm = Arc::new(PeerManager::new(Duration::from_secs(3600)));
        let (manager, events) = QuorumManager::new(config, local_id, keypair, Arc::clone(&pm));
        (manager, events, pm)
    }

    fn foreign_vote(vote_type: VoteType, target: &str) -> Vote {
        let keypair = Keypair::generate_ed25519();
        let voter = keypair.public().to_peer_id().to_string();
        let signature = keypair
            .sign(&signing_bytes(vote_type, target, &voter))
            .unwrap();
        Vote {
            vote_type,
            target_id: target.to_string(),
            voter_id: voter,
            signature,
        }
    }

    #[test]
    fn threshold_is_two_thirds_rounded_up() {
        assert_eq!(vote_threshold(0), 0);
        assert_eq!(vote_threshold(1), 1);
        assert_eq!(vote_threshold(2), 2);
        assert_eq!(vote_threshold(3), 2);
        assert_eq!(vote_threshold(4), 3);
        assert_eq!(vote_threshold(6), 4);
        assert_eq!(vote_threshold(9), 6);
    }

    #[test]
    fn vote_signature_round_trip() {
        let keypair = Keypair::generate_ed25519();
        let local_id = keypair.public().to_peer_id();
        let pm = Arc::new(PeerManager::new(Duration::from_secs(3600)));
        let (manager, _events) = QuorumManager::new(quorum_config(), local_id, keypair.clone(), pm);
        let vote = manager.make_vote(VoteType::RemoveFile, "bad.zap").unwrap();
        assert!(vote.verify(&keypair.public()));

        let mut forged = vote.clone();
        forged.target_id = "other.zap".into();
        assert!(!forged.verify(&keypair.public()));
    }

    #[tokio::test]
    async fn distinct_voters_reach_threshold() {
        let (manager, mut events, _pm) = setup(quorum_config());
        let target = PeerId::random().to_string();
        // 3 connected peers: threshold 2.
        let fired = manager
            .handle_vote(foreign_vote(VoteType::RemovePeer, &target), 3)
            .await
            .unwrap();
        assert!(!fired);
        let fired = manager
            .handle_vote(foreign_vote(VoteType::RemovePeer, &target), 3)
            .await
            .unwrap();
        assert!(fired);
        let banned = events.peer_banned.try_recv().unwrap();
        assert_eq!(banned.to_string(), target);
    }

    #[tokio::test]
    async fn duplicate_voter_counts_once() {
        let (manager, mut events, _pm) = setup(quorum_config());
        let target = PeerId::random().to_string();
        let vote = foreign_vote(VoteType::RemovePeer, &target);
        assert!(!manager.handle_vote(vote.clone(), 3).await.unwrap());
        assert!(!manager.handle_vote(vote, 3).await.unwrap());
        assert!(events.peer_banned.try_recv().is_err());
    }

    #[tokio::test]
    async fn zero_window_expires_votes() {
        let mut config = quorum_config();
        config.vote_window_secs = 0;
        let (manager, mut events, _pm) = setup(config);
        let target = PeerId::random().to_string();
        for _ in 0..4 {
            manager
                .handle_vote(foreign_vote(VoteType::RemovePeer, &target), 3)
                .await
                .unwrap();
        }
        assert!(events.peer_banned.try_recv().is_err());
    }

    #[tokio::test]
    async fn file_removal_fires_on_channel() {
        let (manager, mut events, _pm) = setup(quorum_config());
        let fired = manager
            .handle_vote(foreign_vote(VoteType::RemoveFile, "poisoned.zap"), 1)
            .await
            .unwrap();
        assert!(fired);
        assert_eq!(events.file_removed.try_recv().unwrap(), "poisoned.zap");
    }

    #[tokio::test]
    async fn health_check_votes_at_ban_score() {
        let (manager, _events, pm) = setup(quorum_config());
        let bad = PeerId::random();
        pm.add_or_update(bad, vec![]).await;
        // Stale, low uptime, slow: -3 per check.
        pm.update_gossip(bad, Utc::now() - chrono::Duration::hours(2), 10.0, 5000.0)
            .await;

        let mut votes = Vec::new();
        for _ in 0..4 {
            votes.extend(manager.health_check().await);
        }
        assert_eq!(votes.len(), 1);
        assert_eq!(votes[0].target_id, bad.to_string());
        assert_eq!(votes[0].vote_type, VoteType::RemovePeer);
        assert!(pm.get(&bad).await.unwrap().reputation_score <= -10);

        // A later check does not vote again.
        assert!(manager.health_check().await.is_empty());
    }

    #[tokio::test]
    async fn min_voter_age_filters_unknown_voters() {
        let mut config = quorum_config();
        config.min_voter_age_secs = 3600;
        let (manager, mut events, _pm) = setup(config);
        let target = PeerId::random().to_string();
        let fired = manager
            .handle_vote(foreign_vote(VoteType::RemovePeer, &target), 1)
            .await
            .unwrap();
        assert!(!fired);
        assert!(events.peer_banned.try_recv().is_err());
    }
}
