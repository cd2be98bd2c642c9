/// Transport Actor Module
///
/// Isolates the transport swarm (QUIC + TCP) in a dedicated task. The
/// libp2p `Swarm` is not shareable across threads, so every operation
/// goes through a message channel and answers on a oneshot, and the
/// clone-able `TransportHandle` is the only thing the rest of the system
/// sees. Inbound chunk requests are served straight from the local chunk
/// store inside the loop; inbound VPN packets are forwarded as events.
use libp2p::identity::PublicKey;
use libp2p::request_response::{
    Event as RequestResponseEvent, Message as RequestResponseMessage, OutboundRequestId,
};
use libp2p::swarm::SwarmEvent;
use libp2p::{Multiaddr, PeerId, Swarm};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::chunk_protocol::{ChunkRequest, ChunkResponse};
use crate::chunk_store::{sha256_hex, ChunkStore};
use crate::error::{ZapError, ZapResult};
use crate::network::{TransportBehaviour, TransportBehaviourEvent};
use crate::vpn::{VpnAck, VpnPacket};

/// Commands accepted by the transport actor
#[derive(Debug)]
pub enum TransportCommand {
    /// Fetch a chunk from a peer over `/filezap/chunk/1`
    Download {
        peer: PeerId,
        hash: String,
        response_tx: oneshot::Sender<ZapResult<Vec<u8>>>,
    },
    /// Fire-and-forget delivery of a tunneled packet
    SendPacket { peer: PeerId, packet: Vec<u8> },
    Dial {
        addr: Multiaddr,
        response_tx: oneshot::Sender<ZapResult<()>>,
    },
    AddAddress { peer: PeerId, addr: Multiaddr },
    ConnectedPeers {
        response_tx: oneshot::Sender<Vec<PeerId>>,
    },
    Disconnect {
        peer: PeerId,
        response_tx: oneshot::Sender<bool>,
    },
    Shutdown,
}

/// Events surfaced to the engine
#[derive(Debug)]
pub enum TransportEvent {
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    /// A `/vpn/1.0.0` packet arrived from a peer
    InboundPacket { peer: PeerId, data: Vec<u8> },
    /// identify exchange completed; carries the peer's advertised key
    PeerIdentified {
        peer: PeerId,
        public_key: PublicKey,
    },
}

/// Clone-able handle to the transport actor
#[derive(Clone)]
pub struct TransportHandle {
    tx: mpsc::UnboundedSender<TransportCommand>,
    local_peer_id: PeerId,
}

impl TransportHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn send(&self, command: TransportCommand) -> ZapResult<()> {
        self.tx
            .send(command)
            .map_err(|_| ZapError::Network("transport actor unavailable".to_string()))
    }

    /// Download a chunk from a peer and verify it against its address.
    pub async fn download(&self, peer: PeerId, hash: String) -> ZapResult<Vec<u8>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(TransportCommand::Download {
            peer,
            hash,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("transport operation cancelled".to_string()))?
    }

    pub fn send_packet(&self, peer: PeerId, packet: Vec<u8>) -> ZapResult<()> {
        self.send(TransportCommand::SendPacket { peer, packet })
    }

    pub async fn dial(&self, addr: Multiaddr) -> ZapResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(TransportCommand::Dial { addr, response_tx })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("transport operation cancelled".to_string()))?
    }

    pub fn add_address(&self, peer: PeerId, addr: Multiaddr) -> ZapResult<()> {
        self.send(TransportCommand::AddAddress { peer, addr })
    }

    pub async fn connected_peers(&self) -> ZapResult<Vec<PeerId>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(TransportCommand::ConnectedPeers { response_tx })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("transport operation cancelled".to_string()))
    }

    pub async fn disconnect(&self, peer: PeerId) -> ZapResult<bool> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(TransportCommand::Disconnect { peer, response_tx })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("transport operation cancelled".to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(TransportCommand::Shutdown);
    }
}

struct TransportActor {
    swarm: Swarm<TransportBehaviour>,
    rx: mpsc::UnboundedReceiver<TransportCommand>,
    events_tx: mpsc::Sender<TransportEvent>,
    chunk_store: Arc<ChunkStore>,
    pending_downloads: HashMap<OutboundRequestId, (String, oneshot::Sender<ZapResult<Vec<u8>>>)>,
}

/// Start the transport actor. Returns the handle, the event stream, and
/// the actor task.
pub fn spawn(
    swarm: Swarm<TransportBehaviour>,
    chunk_store: Arc<ChunkStore>,
) -> (
    TransportHandle,
    mpsc::Receiver<TransportEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(256);
    let local_peer_id = *swarm.local_peer_id();
    let actor = TransportActor {
        swarm,
        rx,
        events_tx,
        chunk_store,
        pending_downloads: HashMap::new(),
    };
    let join = tokio::spawn(actor.run());
    (
        TransportHandle { tx, local_peer_id },
        events_rx,
        join,
    )
}

impl TransportActor {
    async fn run(mut self) {
        info!(peer_id = %self.swarm.local_peer_id(), "transport host running");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(TransportCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event).await;
                }
            }
        }
        // Fail whatever is still in flight so callers unblock.
        for (_, (_, tx)) in self.pending_downloads.drain() {
            let _ = tx.send(Err(ZapError::RequestFailed("transport host shut down".into())));
        }
        info!("transport host stopped");
    }

    fn handle_command(&mut self, command: TransportCommand) {
        match command {
            TransportCommand::Download {
                peer,
                hash,
                response_tx,
            } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .chunk
                    .send_request(&peer, ChunkRequest { hash: hash.clone() });
                self.pending_downloads.insert(id, (hash, response_tx));
            }
            TransportCommand::SendPacket { peer, packet } => {
                self.swarm
                    .behaviour_mut()
                    .vpn
                    .send_request(&peer, VpnPacket { data: packet });
            }
            TransportCommand::Dial { addr, response_tx } => {
                let result = self
                    .swarm
                    .dial(addr.clone())
                    .map_err(|e| ZapError::Network(format!("dial {} failed: {}", addr, e)));
                let _ = response_tx.send(result);
            }
            TransportCommand::AddAddress { peer, addr } => {
                self.swarm.add_peer_address(peer, addr);
            }
            TransportCommand::ConnectedPeers { response_tx } => {
                let peers = self.swarm.connected_peers().cloned().collect();
                let _ = response_tx.send(peers);
            }
            TransportCommand::Disconnect { peer, response_tx } => {
                let disconnected = self.swarm.disconnect_peer_id(peer).is_ok();
                let _ = response_tx.send(disconnected);
            }
            TransportCommand::Shutdown => unreachable!("handled in run"),
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<TransportBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "transport host listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                let _ = self.events_tx.send(TransportEvent::PeerConnected(peer_id)).await;
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    let _ = self
                        .events_tx
                        .send(TransportEvent::PeerDisconnected(peer_id))
                        .await;
                }
            }
            SwarmEvent::Behaviour(TransportBehaviourEvent::Chunk(event)) => {
                self.handle_chunk_event(event);
            }
            SwarmEvent::Behaviour(TransportBehaviourEvent::Vpn(event)) => {
                self.handle_vpn_event(event).await;
            }
            SwarmEvent::Behaviour(TransportBehaviourEvent::Identify(
                libp2p::identify::Event::Received { peer_id, info, .. },
            )) => {
                let _ = self
                    .events_tx
                    .send(TransportEvent::PeerIdentified {
                        peer: peer_id,
                        public_key: info.public_key,
                    })
                    .await;
            }
            _ => {}
        }
    }

    fn handle_chunk_event(&mut self, event: RequestResponseEvent<ChunkRequest, ChunkResponse>) {
        match event {
            RequestResponseEvent::Message { peer, message, .. } => match message {
                RequestResponseMessage::Request {
                    request, channel, ..
                } => {
                    let response = match self.chunk_store.get(&request.hash) {
                        Ok(data) => {
                            debug!(%peer, hash = %request.hash, bytes = data.len(), "serving chunk");
                            ChunkResponse { data }
                        }
                        Err(_) => ChunkResponse::not_found(),
                    };
                    if self
                        .swarm
                        .behaviour_mut()
                        .chunk
                        .send_response(channel, response)
                        .is_err()
                    {
                        debug!(%peer, "chunk response stream already closed");
                    }
                }
                RequestResponseMessage::Response {
                    request_id,
                    response,
                } => {
                    if let Some((hash, tx)) = self.pending_downloads.remove(&request_id) {
                        let _ = tx.send(Self::check_download(&hash, response, &peer));
                    }
                }
            },
            RequestResponseEvent::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                if let Some((hash, tx)) = self.pending_downloads.remove(&request_id) {
                    let _ = tx.send(Err(ZapError::RequestFailed(format!(
                        "chunk {} from {}: {}",
                        hash, peer, error
                    ))));
                }
            }
            RequestResponseEvent::InboundFailure { peer, error, .. } => {
                debug!(%peer, %error, "inbound chunk stream failed");
            }
            RequestResponseEvent::ResponseSent { .. } => {}
        }
    }

    /// Verify a downloaded chunk before handing it to the caller. A
    /// payload that does not hash to the requested address is discarded,
    /// never cached.
    fn check_download(hash: &str, response: ChunkResponse, peer: &PeerId) -> ZapResult<Vec<u8>> {
        if response.is_not_found() {
            return Err(ZapError::NotFound(format!("chunk {} on peer {}", hash, peer)));
        }
        if sha256_hex(&response.data) != hash {
            warn!(%peer, hash, "downloaded chunk failed hash verification");
            return Err(ZapError::HashMismatch(format!(
                "peer {} served tampered bytes for chunk {}",
                peer, hash
            )));
        }
        Ok(response.data)
    }

    async fn handle_vpn_event(&mut self, event: RequestResponseEvent<VpnPacket, VpnAck>) {
        match event {
            RequestResponseEvent::Message { peer, message, .. } => match message {
                RequestResponseMessage::Request {
                    request, channel, ..
                } => {
                    let _ = self
                        .events_tx
                        .send(TransportEvent::InboundPacket {
                            peer,
                            data: request.data,
                        })
                        .await;
                    let _ = self
                        .swarm
                        .behaviour_mut()
                        .vpn
                        .send_response(channel, VpnAck);
                }
                RequestResponseMessage::Response { .. } => {}
            },
            RequestResponseEvent::OutboundFailure { peer, error, .. } => {
                debug!(%peer, %error, "vpn packet delivery failed");
            }
            _ => {}
        }
    }
}
