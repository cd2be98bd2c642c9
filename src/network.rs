/// Network Module
///
/// Builds the two libp2p hosts of the dual-overlay design. Both share
/// one keypair (one peer id network-wide) but run independent connection
/// pools:
/// - the **transport host** speaks QUIC and TCP and carries chunk bytes
///   (`/filezap/chunk/1`) and tunneled packets (`/vpn/1.0.0`);
/// - the **metadata host** is TCP-only and carries the Kademlia DHT,
///   gossipsub, and overlay messaging (`/filezap/1.0.0`).
use libp2p::kad::store::MemoryStore;
use libp2p::{
    gossipsub, identify, identity, kad, noise, ping, request_response,
    swarm::NetworkBehaviour,
    tcp, yamux, PeerId, StreamProtocol, Swarm, SwarmBuilder,
};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::chunk_protocol::{ChunkCodec, ChunkRequest, ChunkResponse, CHUNK_PROTOCOL};
use crate::config::Config;
use crate::discovery::{VPN_DISCOVERY_TOPIC, VPN_PEERS_TOPIC};
use crate::error::{ZapError, ZapResult};
use crate::gossip::GOSSIP_TOPIC;
use crate::overlay::{OverlayCodec, OverlayMessage, OVERLAY_PROTOCOL};
use crate::quorum::VOTE_TOPIC;
use crate::vpn::{VpnAck, VpnCodec, VpnPacket, VPN_PROTOCOL};

const IDENTITY_FILE: &str = "identity.key";

/// Load the node keypair from the metadata directory, generating and
/// persisting a fresh ed25519 key on first start. Both hosts derive
/// their peer id from this one key.
pub fn load_or_create_identity(metadata_dir: &Path) -> ZapResult<identity::Keypair> {
    let path = metadata_dir.join(IDENTITY_FILE);
    if path.exists() {
        let bytes = fs::read(&path)?;
        return identity::Keypair::from_protobuf_encoding(&bytes)
            .map_err(|e| ZapError::Config(format!("corrupt identity file {:?}: {}", path, e)));
    }
    fs::create_dir_all(metadata_dir)?;
    let keypair = identity::Keypair::generate_ed25519();
    let bytes = keypair
        .to_protobuf_encoding()
        .map_err(|e| ZapError::Config(format!("identity encoding failed: {}", e)))?;
    fs::write(&path, bytes)?;
    tracing::info!(peer_id = %keypair.public().to_peer_id(), "generated node identity");
    Ok(keypair)
}

// ===== TRANSPORT HOST =====

/// Behaviours of the QUIC-capable transport host
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "TransportBehaviourEvent")]
pub struct TransportBehaviour {
    pub chunk: request_response::Behaviour<ChunkCodec>,
    pub vpn: request_response::Behaviour<VpnCodec>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

#[derive(Debug)]
pub enum TransportBehaviourEvent {
    Chunk(request_response::Event<ChunkRequest, ChunkResponse>),
    Vpn(request_response::Event<VpnPacket, VpnAck>),
    Identify(identify::Event),
    Ping(ping::Event),
}

impl From<request_response::Event<ChunkRequest, ChunkResponse>> for TransportBehaviourEvent {
    fn from(event: request_response::Event<ChunkRequest, ChunkResponse>) -> Self {
        TransportBehaviourEvent::Chunk(event)
    }
}

impl From<request_response::Event<VpnPacket, VpnAck>> for TransportBehaviourEvent {
    fn from(event: request_response::Event<VpnPacket, VpnAck>) -> Self {
        TransportBehaviourEvent::Vpn(event)
    }
}

impl From<identify::Event> for TransportBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        TransportBehaviourEvent::Identify(event)
    }
}

impl From<ping::Event> for TransportBehaviourEvent {
    fn from(event: ping::Event) -> Self {
        TransportBehaviourEvent::Ping(event)
    }
}

/// Build the transport swarm and start listening on TCP and QUIC.
pub fn build_transport_swarm(
    keypair: &identity::Keypair,
    config: &Config,
) -> ZapResult<Swarm<TransportBehaviour>> {
    let request_timeout = config.request_timeout();
    let idle = Duration::from_secs(config.network.idle_timeout_secs);

    let mut swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| ZapError::Network(format!("transport host TCP setup failed: {}", e)))?
        .with_quic()
        .with_behaviour(|key| {
            let rr_config =
                request_response::Config::default().with_request_timeout(request_timeout);
            let chunk = request_response::Behaviour::with_codec(
                ChunkCodec,
                std::iter::once((
                    StreamProtocol::new(CHUNK_PROTOCOL),
                    request_response::ProtocolSupport::Full,
                )),
                rr_config.clone(),
            );
            let vpn = request_response::Behaviour::with_codec(
                VpnCodec,
                std::iter::once((
                    StreamProtocol::new(VPN_PROTOCOL),
                    request_response::ProtocolSupport::Full,
                )),
                rr_config,
            );
            let identify = identify::Behaviour::new(identify::Config::new(
                OVERLAY_PROTOCOL.to_string(),
                key.public(),
            ));
            TransportBehaviour {
                chunk,
                vpn,
                identify,
                ping: ping::Behaviour::default(),
            }
        })
        .map_err(|e| ZapError::Network(format!("transport behaviour setup failed: {}", e)))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle))
        .build();

    let port = config.transport_port();
    for addr in [
        format!("/ip4/0.0.0.0/tcp/{}", port),
        format!("/ip4/0.0.0.0/udp/{}/quic-v1", port),
    ] {
        let parsed = addr
            .parse()
            .map_err(|e| ZapError::Config(format!("bad listen address {}: {}", addr, e)))?;
        swarm
            .listen_on(parsed)
            .map_err(|e| ZapError::Network(format!("transport listen on {} failed: {}", addr, e)))?;
    }
    Ok(swarm)
}

// ===== METADATA HOST =====

/// Behaviours of the TCP-only metadata host
#[derive(NetworkBehaviour)]
#[behaviour(to_swarm = "MetadataBehaviourEvent")]
pub struct MetadataBehaviour {
    pub kad: kad::Behaviour<MemoryStore>,
    pub gossipsub: gossipsub::Behaviour,
    pub overlay: request_response::Behaviour<OverlayCodec>,
    pub identify: identify::Behaviour,
    pub ping: ping::Behaviour,
}

#[derive(Debug)]
pub enum MetadataBehaviourEvent {
    Kad(kad::Event),
    Gossipsub(gossipsub::Event),
    Overlay(request_response::Event<OverlayMessage, OverlayMessage>),
    Identify(identify::Event),
    Ping(ping::Event),
}

impl From<kad::Event> for MetadataBehaviourEvent {
    fn from(event: kad::Event) -> Self {
        MetadataBehaviourEvent::Kad(event)
    }
}

impl From<gossipsub::Event> for MetadataBehaviourEvent {
    fn from(event: gossipsub::Event) -> Self {
        MetadataBehaviourEvent::Gossipsub(event)
    }
}

impl From<request_response::Event<OverlayMessage, OverlayMessage>> for MetadataBehaviourEvent {
    fn from(event: request_response::Event<OverlayMessage, OverlayMessage>) -> Self {
        MetadataBehaviourEvent::Overlay(event)
    }
}

impl From<identify::Event> for MetadataBehaviourEvent {
    fn from(event: identify::Event) -> Self {
        MetadataBehaviourEvent::Identify(event)
    }
}

impl From<ping::Event> for MetadataBehaviourEvent {
    fn from(event: ping::Event) -> Self {
        MetadataBehaviourEvent::Ping(event)
    }
}

/// Build the metadata swarm, subscribe the pubsub topics, and start
/// listening on TCP.
pub fn build_metadata_swarm(
    keypair: &identity::Keypair,
    config: &Config,
) -> ZapResult<Swarm<MetadataBehaviour>> {
    let request_timeout = config.request_timeout();
    let idle = Duration::from_secs(config.network.idle_timeout_secs);

    let mut swarm = SwarmBuilder::with_existing_identity(keypair.clone())
        .with_tokio()
        .with_tcp(
            tcp::Config::default().nodelay(true),
            noise::Config::new,
            yamux::Config::default,
        )
        .map_err(|e| ZapError::Network(format!("metadata host TCP setup failed: {}", e)))?
        .with_behaviour(|key| {
            let peer_id = key.public().to_peer_id();
            let mut kad = kad::Behaviour::new(peer_id, MemoryStore::new(peer_id));
            kad.set_mode(Some(kad::Mode::Server));

            let gossipsub_config = gossipsub::ConfigBuilder::default()
                .heartbeat_interval(Duration::from_secs(1))
                .validation_mode(gossipsub::ValidationMode::Strict)
                .build()
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            let gossipsub = gossipsub::Behaviour::new(
                gossipsub::MessageAuthenticity::Signed(key.clone()),
                gossipsub_config,
            )?;

            let overlay = request_response::Behaviour::with_codec(
                OverlayCodec,
                std::iter::once((
                    StreamProtocol::new(OVERLAY_PROTOCOL),
                    request_response::ProtocolSupport::Full,
                )),
                request_response::Config::default().with_request_timeout(request_timeout),
            );
            let identify = identify::Behaviour::new(identify::Config::new(
                OVERLAY_PROTOCOL.to_string(),
                key.public(),
            ));
            Ok(MetadataBehaviour {
                kad,
                gossipsub,
                overlay,
                identify,
                ping: ping::Behaviour::default(),
            })
        })
        .map_err(|e| ZapError::Network(format!("metadata behaviour setup failed: {}", e)))?
        .with_swarm_config(|c| c.with_idle_connection_timeout(idle))
        .build();

    for topic in [GOSSIP_TOPIC, VOTE_TOPIC, VPN_PEERS_TOPIC, VPN_DISCOVERY_TOPIC] {
        swarm
            .behaviour_mut()
            .gossipsub
            .subscribe(&gossipsub::IdentTopic::new(topic))
            .map_err(|e| ZapError::Network(format!("subscribe {} failed: {:?}", topic, e)))?;
    }

    let addr = format!("/ip4/0.0.0.0/tcp/{}", config.network.port);
    let parsed = addr
        .parse()
        .map_err(|e| ZapError::Config(format!("bad listen address {}: {}", addr, e)))?;
    swarm
        .listen_on(parsed)
        .map_err(|e| ZapError::Network(format!("metadata listen on {} failed: {}", addr, e)))?;
    Ok(swarm)
}

/// Shared peer id of both hosts.
pub fn peer_id_of(keypair: &identity::Keypair) -> PeerId {
    keypair.public().to_peer_id()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn identity_persists_across_restarts() {
        let dir = TempDir::new().unwrap();
        let first = load_or_create_identity(dir.path()).unwrap();
        let second = load_or_create_identity(dir.path()).unwrap();
        assert_eq!(peer_id_of(&first), peer_id_of(&second));
    }

    #[test]
    fn corrupt_identity_is_a_config_error() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(IDENTITY_FILE), b"garbage").unwrap();
        assert!(matches!(
            load_or_create_identity(dir.path()),
            Err(ZapError::Config(_))
        ));
    }
}
