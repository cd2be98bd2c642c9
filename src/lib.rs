// ===================================================================================================
// FileZap Network Core
// ===================================================================================================
//
// Peer-to-peer storage of large files as encrypted, content-addressed
// chunks, distributed across untrusted nodes and reassembled on demand.
// This crate is the network core: the dual-overlay peer network, the
// manifest DHT, chunk storage and transfer, gossip/reputation/quorum,
// the overlay request/response layer, and the optional virtual IPv4
// network.
//
// Two libp2p hosts share one node identity:
// - the transport host (QUIC + TCP) carries chunk bytes and tunneled
//   packets;
// - the metadata host (TCP only) carries the Kademlia DHT, gossipsub,
//   and overlay messaging.
//
// Both swarms live behind actor tasks; everything else communicates
// through clone-able handles and typed channels under one cancellable
// shutdown signal.
// ===================================================================================================

// ===== STORAGE AND CODEC =====
pub mod chunk_store;      // Content-addressed blob store with quota enforcement
pub mod chunk_validator;  // Size/hash/signature admission checks
pub mod file_registry;    // filename -> FileInfo and chunk -> peers indices
pub mod manifest;         // ManifestInfo and DHT publication
pub mod zap;              // Split/encrypt/manifest/reassemble codec

// ===== NETWORK =====
pub mod chunk_protocol;   // /filezap/chunk/1 wire codec
pub mod discovery;        // Pubsub announcements and LAN UDP broadcast
pub mod engine;           // Composition root, bootstrap, monitor loop
pub mod gossip;           // Peer liveness exchange on filezap-gossip
pub mod metadata_actor;   // Actor around the metadata swarm
pub mod network;          // Swarm construction for both hosts
pub mod overlay;          // /filezap/1.0.0 messaging and routing
pub mod peer_manager;     // Peer lifecycle and TTL eviction
pub mod quorum;           // Reputation, votes, ban/file-removal outcomes
pub mod transport_actor;  // Actor around the transport swarm
pub mod validator_service; // Validator-server role over the overlay router
pub mod vpn;              // Optional virtual IPv4 overlay

// ===== SYSTEM =====
pub mod cli;              // networkcore daemon flags
pub mod config;           // TOML configuration tree
pub mod error;            // ZapError and result alias
pub mod logging;          // tracing setup
pub mod resilience;       // Retry with exponential backoff
pub mod wire;             // Length-prefixed framing helpers

pub use chunk_store::ChunkStore;
pub use config::Config;
pub use engine::NetworkEngine;
pub use error::{RejectReason, ZapError, ZapResult};
pub use file_registry::{FileInfo, FileRegistry, PeerChunkInfo};
pub use manifest::{ManifestInfo, ManifestManager};
pub use peer_manager::{PeerManager, PeerState};
pub use quorum::{QuorumManager, Vote, VoteType};
