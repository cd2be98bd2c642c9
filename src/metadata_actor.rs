/// Metadata Actor Module
///
/// Isolates the metadata swarm (TCP-only: Kademlia DHT, gossipsub,
/// overlay messaging) in a dedicated task behind a clone-able handle.
/// DHT queries are correlated by query id, overlay requests by
/// request id, and inbound overlay requests are parked as numbered
/// response channels until the role service answers them.
use async_trait::async_trait;
use futures::StreamExt;
use libp2p::identity::PublicKey;
use libp2p::kad::{
    self, GetRecordOk, QueryId, QueryResult, Quorum, Record, RecordKey,
};
use libp2p::request_response::{
    Event as RequestResponseEvent, Message as RequestResponseMessage, OutboundRequestId,
    ResponseChannel,
};
use libp2p::swarm::SwarmEvent;
use libp2p::{gossipsub, Multiaddr, PeerId, Swarm};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::{ZapError, ZapResult};
use crate::manifest::DhtStore;
use crate::network::{MetadataBehaviour, MetadataBehaviourEvent};
use crate::overlay::OverlayMessage;

/// Commands accepted by the metadata actor
#[derive(Debug)]
pub enum MetadataCommand {
    PutRecord {
        key: Vec<u8>,
        value: Vec<u8>,
        response_tx: oneshot::Sender<ZapResult<()>>,
    },
    GetRecord {
        key: Vec<u8>,
        response_tx: oneshot::Sender<ZapResult<Option<Vec<u8>>>>,
    },
    RemoveRecord { key: Vec<u8> },
    Bootstrap {
        response_tx: oneshot::Sender<ZapResult<()>>,
    },
    Publish {
        topic: String,
        data: Vec<u8>,
        response_tx: oneshot::Sender<ZapResult<()>>,
    },
    Request {
        peer: PeerId,
        message: OverlayMessage,
        response_tx: oneshot::Sender<ZapResult<OverlayMessage>>,
    },
    Respond {
        channel_id: u64,
        message: OverlayMessage,
    },
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
pub enum MetadataEvent {
    /// A pubsub message arrived on a subscribed topic
    GossipMessage {
        topic: String,
        source: PeerId,
        data: Vec<u8>,
    },
    /// An overlay request awaits an answer via `respond(channel_id, ..)`
    OverlayRequest {
        peer: PeerId,
        message: OverlayMessage,
        channel_id: u64,
    },
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
    PeerIdentified {
        peer: PeerId,
        public_key: PublicKey,
    },
}

/// Clone-able handle to the metadata actor
#[derive(Clone)]
pub struct MetadataHandle {
    tx: mpsc::UnboundedSender<MetadataCommand>,
    local_peer_id: PeerId,
    dht_get_timeout: Duration,
}

impl MetadataHandle {
    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    fn send(&self, command: MetadataCommand) -> ZapResult<()> {
        self.tx
            .send(command)
            .map_err(|_| ZapError::Network("metadata actor unavailable".to_string()))
    }

    pub async fn put_record(&self, key: Vec<u8>, value: Vec<u8>) -> ZapResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(MetadataCommand::PutRecord {
            key,
            value,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("metadata operation cancelled".to_string()))?
    }

    /// DHT lookup bounded by the configured get timeout.
    pub async fn get_record(&self, key: Vec<u8>) -> ZapResult<Option<Vec<u8>>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(MetadataCommand::GetRecord { key, response_tx })?;
        match tokio::time::timeout(self.dht_get_timeout, response_rx).await {
            Ok(result) => {
                result.map_err(|_| ZapError::Network("metadata operation cancelled".to_string()))?
            }
            Err(_) => Err(ZapError::Network("DHT get timed out".to_string())),
        }
    }

    pub fn remove_record(&self, key: Vec<u8>) -> ZapResult<()> {
        self.send(MetadataCommand::RemoveRecord { key })
    }

    pub async fn bootstrap(&self) -> ZapResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(MetadataCommand::Bootstrap { response_tx })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("metadata operation cancelled".to_string()))?
    }

    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> ZapResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(MetadataCommand::Publish {
            topic: topic.to_string(),
            data,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("metadata operation cancelled".to_string()))?
    }

    /// Send an overlay request and wait for the paired response.
    pub async fn request(&self, peer: PeerId, message: OverlayMessage) -> ZapResult<OverlayMessage> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(MetadataCommand::Request {
            peer,
            message,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|_| ZapError::RequestFailed("overlay request cancelled".to_string()))?
    }

    /// Answer a parked inbound overlay request.
    pub fn respond(&self, channel_id: u64, message: OverlayMessage) -> ZapResult<()> {
        self.send(MetadataCommand::Respond {
            channel_id,
            message,
        })
    }

    pub async fn dial(&self, addr: Multiaddr) -> ZapResult<()> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(MetadataCommand::Dial { addr, response_tx })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("metadata operation cancelled".to_string()))?
    }

    pub fn add_address(&self, peer: PeerId, addr: Multiaddr) -> ZapResult<()> {
        self.send(MetadataCommand::AddAddress { peer, addr })
    }

    pub async fn connected_peers(&self) -> ZapResult<Vec<PeerId>> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(MetadataCommand::ConnectedPeers { response_tx })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("metadata operation cancelled".to_string()))
    }

    pub async fn disconnect(&self, peer: PeerId) -> ZapResult<bool> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(MetadataCommand::Disconnect { peer, response_tx })?;
        response_rx
            .await
            .map_err(|_| ZapError::Network("metadata operation cancelled".to_string()))
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(MetadataCommand::Shutdown);
    }
}

/// The manifest manager publishes through the metadata host's DHT.
#[async_trait]
impl DhtStore for MetadataHandle {
    async fn put(&self, key: Vec<u8>, value: Vec<u8>, _replicas: u32) -> ZapResult<()> {
        // Kademlia replicates toward the K closest peers on its own; the
        // put succeeds as soon as one replica acknowledges.
        self.put_record(key, value).await
    }

    async fn get(&self, key: Vec<u8>) -> ZapResult<Option<Vec<u8>>> {
        self.get_record(key).await
    }

    async fn remove(&self, key: Vec<u8>) -> ZapResult<()> {
        self.remove_record(key)
    }
}

struct MetadataActor {
    swarm: Swarm<MetadataBehaviour>,
    rx: mpsc::UnboundedReceiver<MetadataCommand>,
    events_tx: mpsc::Sender<MetadataEvent>,
    pending_puts: HashMap<QueryId, oneshot::Sender<ZapResult<()>>>,
    pending_gets: HashMap<QueryId, oneshot::Sender<ZapResult<Option<Vec<u8>>>>>,
    pending_requests: HashMap<OutboundRequestId, oneshot::Sender<ZapResult<OverlayMessage>>>,
    response_channels: HashMap<u64, ResponseChannel<OverlayMessage>>,
    next_channel_id: u64,
}

/// Start the metadata actor. Returns the handle, the event stream, and
/// the actor task.
pub fn spawn(
    swarm: Swarm<MetadataBehaviour>,
    dht_get_timeout: Duration,
) -> (
    MetadataHandle,
    mpsc::Receiver<MetadataEvent>,
    tokio::task::JoinHandle<()>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let (events_tx, events_rx) = mpsc::channel(256);
    let local_peer_id = *swarm.local_peer_id();
    let actor = MetadataActor {
        swarm,
        rx,
        events_tx,
        pending_puts: HashMap::new(),
        pending_gets: HashMap::new(),
        pending_requests: HashMap::new(),
        response_channels: HashMap::new(),
        next_channel_id: 0,
    };
    let join = tokio::spawn(actor.run());
    (
        MetadataHandle {
            tx,
            local_peer_id,
            dht_get_timeout,
        },
        events_rx,
        join,
    )
}

impl MetadataActor {
    async fn run(mut self) {
        info!(peer_id = %self.swarm.local_peer_id(), "metadata host running");
        loop {
            tokio::select! {
                command = self.rx.recv() => {
                    match command {
                        Some(MetadataCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }
                event = self.swarm.select_next_some() => {
                    self.handle_swarm_event(event).await;
                }
            }
        }
        for (_, tx) in self.pending_puts.drain() {
            let _ = tx.send(Err(ZapError::Network("metadata host shut down".into())));
        }
        for (_, tx) in self.pending_gets.drain() {
            let _ = tx.send(Err(ZapError::Network("metadata host shut down".into())));
        }
        for (_, tx) in self.pending_requests.drain() {
            let _ = tx.send(Err(ZapError::RequestFailed("metadata host shut down".into())));
        }
        info!("metadata host stopped");
    }

    fn handle_command(&mut self, command: MetadataCommand) {
        match command {
            MetadataCommand::PutRecord {
                key,
                value,
                response_tx,
            } => {
                let record = Record {
                    key: RecordKey::new(&key),
                    value,
                    publisher: None,
                    expires: None,
                };
                match self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .put_record(record, Quorum::One)
                {
                    Ok(id) => {
                        self.pending_puts.insert(id, response_tx);
                    }
                    Err(e) => {
                        let _ = response_tx.send(Err(e.into()));
                    }
                }
            }
            MetadataCommand::GetRecord { key, response_tx } => {
                let id = self.swarm.behaviour_mut().kad.get_record(RecordKey::new(&key));
                self.pending_gets.insert(id, response_tx);
            }
            MetadataCommand::RemoveRecord { key } => {
                self.swarm
                    .behaviour_mut()
                    .kad
                    .remove_record(&RecordKey::new(&key));
            }
            MetadataCommand::Bootstrap { response_tx } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .kad
                    .bootstrap()
                    .map(|_| ())
                    .map_err(|e| ZapError::BootstrapFailed(format!("DHT bootstrap: {}", e)));
                let _ = response_tx.send(result);
            }
            MetadataCommand::Publish {
                topic,
                data,
                response_tx,
            } => {
                let result = self
                    .swarm
                    .behaviour_mut()
                    .gossipsub
                    .publish(gossipsub::IdentTopic::new(topic), data)
                    .map(|_| ())
                    .map_err(|e| ZapError::Network(format!("publish failed: {}", e)));
                let _ = response_tx.send(result);
            }
            MetadataCommand::Request {
                peer,
                message,
                response_tx,
            } => {
                let id = self
                    .swarm
                    .behaviour_mut()
                    .overlay
                    .send_request(&peer, message);
                self.pending_requests.insert(id, response_tx);
            }
            MetadataCommand::Respond {
                channel_id,
                message,
            } => match self.response_channels.remove(&channel_id) {
                Some(channel) => {
                    if self
                        .swarm
                        .behaviour_mut()
                        .overlay
                        .send_response(channel, message)
                        .is_err()
                    {
                        debug!(channel_id, "overlay response stream already closed");
                    }
                }
                None => warn!(channel_id, "no response channel for overlay reply"),
            },
            MetadataCommand::Dial { addr, response_tx } => {
                let result = self
                    .swarm
                    .dial(addr.clone())
                    .map_err(|e| ZapError::Network(format!("dial {} failed: {}", addr, e)));
                let _ = response_tx.send(result);
            }
            MetadataCommand::AddAddress { peer, addr } => {
                self.swarm.behaviour_mut().kad.add_address(&peer, addr.clone());
                self.swarm.add_peer_address(peer, addr);
            }
            MetadataCommand::ConnectedPeers { response_tx } => {
                let peers = self.swarm.connected_peers().cloned().collect();
                let _ = response_tx.send(peers);
            }
            MetadataCommand::Disconnect { peer, response_tx } => {
                let disconnected = self.swarm.disconnect_peer_id(peer).is_ok();
                let _ = response_tx.send(disconnected);
            }
            MetadataCommand::Shutdown => unreachable!("handled in run"),
        }
    }

    async fn handle_swarm_event(&mut self, event: SwarmEvent<MetadataBehaviourEvent>) {
        match event {
            SwarmEvent::NewListenAddr { address, .. } => {
                info!(%address, "metadata host listening");
            }
            SwarmEvent::ConnectionEstablished { peer_id, .. } => {
                let _ = self.events_tx.send(MetadataEvent::PeerConnected(peer_id)).await;
            }
            SwarmEvent::ConnectionClosed {
                peer_id,
                num_established,
                ..
            } => {
                if num_established == 0 {
                    let _ = self
                        .events_tx
                        .send(MetadataEvent::PeerDisconnected(peer_id))
                        .await;
                }
            }
            SwarmEvent::Behaviour(MetadataBehaviourEvent::Kad(event)) => {
                self.handle_kad_event(event);
            }
            SwarmEvent::Behaviour(MetadataBehaviourEvent::Gossipsub(
                gossipsub::Event::Message {
                    propagation_source,
                    message,
                    ..
                },
            )) => {
                let _ = self
                    .events_tx
                    .send(MetadataEvent::GossipMessage {
                        topic: message.topic.into_string(),
                        source: message.source.unwrap_or(propagation_source),
                        data: message.data,
                    })
                    .await;
            }
            SwarmEvent::Behaviour(MetadataBehaviourEvent::Overlay(event)) => {
                self.handle_overlay_event(event).await;
            }
            SwarmEvent::Behaviour(MetadataBehaviourEvent::Identify(
                libp2p::identify::Event::Received { peer_id, info, .. },
            )) => {
                // Feed identify addresses into the routing table so the
                // DHT can resolve this peer later.
                for addr in info.listen_addrs.iter().cloned() {
                    self.swarm.behaviour_mut().kad.add_address(&peer_id, addr);
                }
                let _ = self
                    .events_tx
                    .send(MetadataEvent::PeerIdentified {
                        peer: peer_id,
                        public_key: info.public_key,
                    })
                    .await;
            }
            _ => {}
        }
    }

    fn handle_kad_event(&mut self, event: kad::Event) {
        if let kad::Event::OutboundQueryProgressed { id, result, .. } = event {
            match result {
                QueryResult::GetRecord(Ok(GetRecordOk::FoundRecord(peer_record))) => {
                    if let Some(tx) = self.pending_gets.remove(&id) {
                        let _ = tx.send(Ok(Some(peer_record.record.value)));
                    }
                    if let Some(mut query) = self.swarm.behaviour_mut().kad.query_mut(&id) {
                        query.finish();
                    }
                }
                QueryResult::GetRecord(Ok(GetRecordOk::FinishedWithNoAdditionalRecord {
                    ..
                })) => {
                    if let Some(tx) = self.pending_gets.remove(&id) {
                        let _ = tx.send(Ok(None));
                    }
                }
                QueryResult::GetRecord(Err(e)) => {
                    if let Some(tx) = self.pending_gets.remove(&id) {
                        let _ = tx.send(Ok(None));
                        debug!("DHT get finished without record: {:?}", e);
                    }
                }
                QueryResult::PutRecord(Ok(_)) => {
                    if let Some(tx) = self.pending_puts.remove(&id) {
                        let _ = tx.send(Ok(()));
                    }
                }
                QueryResult::PutRecord(Err(e)) => {
                    if let Some(tx) = self.pending_puts.remove(&id) {
                        let _ = tx.send(Err(ZapError::Network(format!(
                            "DHT put failed: {:?}",
                            e
                        ))));
                    }
                }
                QueryResult::Bootstrap(result) => {
                    debug!("DHT bootstrap progressed: {:?}", result);
                }
                _ => {}
            }
        }
    }

    async fn handle_overlay_event(
        &mut self,
        event: RequestResponseEvent<OverlayMessage, OverlayMessage>,
    ) {
        match event {
            RequestResponseEvent::Message { peer, message, .. } => match message {
                RequestResponseMessage::Request {
                    request, channel, ..
                } => {
                    let channel_id = self.next_channel_id;
                    self.next_channel_id += 1;
                    self.response_channels.insert(channel_id, channel);
                    let _ = self
                        .events_tx
                        .send(MetadataEvent::OverlayRequest {
                            peer,
                            message: request,
                            channel_id,
                        })
                        .await;
                }
                RequestResponseMessage::Response {
                    request_id,
                    response,
                } => {
                    if let Some(tx) = self.pending_requests.remove(&request_id) {
                        let _ = tx.send(Ok(response));
                    }
                }
            },
            RequestResponseEvent::OutboundFailure {
                peer,
                request_id,
                error,
                ..
            } => {
                if let Some(tx) = self.pending_requests.remove(&request_id) {
                    let _ = tx.send(Err(ZapError::RequestFailed(format!(
                        "overlay request to {}: {}",
                        peer, error
                    ))));
                }
            }
            RequestResponseEvent::InboundFailure { peer, error, .. } => {
                debug!(%peer, %error, "inbound overlay stream failed");
            }
            RequestResponseEvent::ResponseSent { .. } => {}
        }
    }
}
