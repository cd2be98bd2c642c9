/// Network Engine Module
///
/// Composition root of the network core. Builds the two hosts from one
/// keypair, wires the component graph (chunk store, registry, peers,
/// gossip, quorum, discovery, manifests, validator service, optional
/// VPN), runs the bootstrap sequence, and owns the single monitor loop
/// that consumes quorum outcomes and drives cleanup.
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::chunk_store::ChunkStore;
use crate::config::Config;
use crate::discovery::{DiscoveryManager, VPN_DISCOVERY_TOPIC, VPN_PEERS_TOPIC};
use crate::error::{ZapError, ZapResult};
use crate::file_registry::FileRegistry;
use crate::gossip::{GossipManager, GOSSIP_TOPIC};
use crate::manifest::{ManifestInfo, ManifestManager};
use crate::metadata_actor::{self, MetadataEvent, MetadataHandle};
use crate::network;
use crate::overlay::{OverlayMessage, ServiceRequest, ServiceResponse};
use crate::peer_manager::{PeerManager, PeerState};
use crate::quorum::{QuorumEvents, QuorumManager, Vote, VOTE_TOPIC};
use crate::resilience::{retry_async, RetryConfig};
use crate::transport_actor::{self, TransportEvent, TransportHandle};
use crate::validator_service::ValidatorService;
use crate::vpn::{TunDevice, VpnManager};

/// The assembled network core node
pub struct NetworkEngine {
    config: Config,
    local_peer_id: PeerId,
    chunk_store: Arc<ChunkStore>,
    registry: Arc<FileRegistry>,
    peers: Arc<PeerManager>,
    gossip: Arc<GossipManager>,
    quorum: Arc<QuorumManager>,
    discovery: Arc<DiscoveryManager>,
    manifests: Arc<ManifestManager>,
    transport: TransportHandle,
    metadata: MetadataHandle,
    vpn: Option<Arc<VpnManager>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NetworkEngine {
    /// Construct both hosts and start every background loop. `tun` must
    /// be provided when the VPN overlay is enabled in the configuration.
    pub async fn new(config: Config, tun: Option<Arc<dyn TunDevice>>) -> ZapResult<Arc<Self>> {
        std::fs::create_dir_all(&config.storage.metadata_dir)?;
        let keypair = network::load_or_create_identity(&config.storage.metadata_dir)?;
        let local_peer_id = network::peer_id_of(&keypair);
        info!(%local_peer_id, "starting network core");

        let chunk_store = Arc::new(ChunkStore::open(
            &config.storage.chunk_dir,
            config.storage.quota_bytes,
        )?);
        let registry = Arc::new(FileRegistry::with_persistence(
            config.storage.metadata_dir.join("registry.json"),
        ));
        let peers = Arc::new(PeerManager::new(config.peer_timeout()));
        let gossip = Arc::new(GossipManager::new(local_peer_id, Arc::clone(&peers)));
        let (quorum, quorum_events) = QuorumManager::new(
            config.quorum.clone(),
            local_peer_id,
            keypair.clone(),
            Arc::clone(&peers),
        );
        let discovery = Arc::new(DiscoveryManager::new(
            local_peer_id,
            config.discovery.clone(),
            config.network.port,
        ));

        let transport_swarm = network::build_transport_swarm(&keypair, &config)?;
        let (transport, transport_events, transport_task) =
            transport_actor::spawn(transport_swarm, Arc::clone(&chunk_store));

        let metadata_swarm = network::build_metadata_swarm(&keypair, &config)?;
        let (metadata, metadata_events, metadata_task) =
            metadata_actor::spawn(metadata_swarm, config.dht_get_timeout());

        let manifests = Arc::new(ManifestManager::new(Arc::new(metadata.clone())));
        let validator = Arc::new(ValidatorService::new(
            local_peer_id,
            Arc::clone(&chunk_store),
            Arc::clone(&registry),
            Arc::clone(&peers),
            Arc::clone(&quorum),
        ));

        let (shutdown_tx, _) = watch::channel(false);
        let mut tasks = vec![transport_task, metadata_task];

        // ===== OPTIONAL VPN OVERLAY =====
        let vpn = if config.vpn.enabled {
            let tun = tun.ok_or_else(|| {
                ZapError::Config("VPN enabled but no TUN handle supplied".to_string())
            })?;
            let (outbound_tx, mut outbound_rx) = mpsc::channel::<(PeerId, Vec<u8>)>(256);
            let (vpn_events_tx, mut vpn_events_rx) = mpsc::channel(16);
            let manager = Arc::new(VpnManager::new(
                local_peer_id,
                &config.vpn.cidr,
                config.vpn.mtu,
                tun,
                outbound_tx,
                vpn_events_tx,
            )?);
            tasks.push(manager.spawn_reader());

            let transport_for_vpn = transport.clone();
            tasks.push(tokio::spawn(async move {
                while let Some((peer, packet)) = outbound_rx.recv().await {
                    if let Err(e) = transport_for_vpn.send_packet(peer, packet) {
                        debug!("vpn packet drop: {}", e);
                        return;
                    }
                }
            }));
            tasks.push(tokio::spawn(async move {
                while let Some(event) = vpn_events_rx.recv().await {
                    warn!(?event, "vpn overlay event");
                }
            }));
            Some(manager)
        } else {
            None
        };

        // ===== EVENT PUMPS =====
        tasks.push(Self::spawn_metadata_pump(
            metadata_events,
            Arc::clone(&gossip),
            Arc::clone(&quorum),
            Arc::clone(&discovery),
            Arc::clone(&peers),
            Arc::clone(&registry),
            Arc::clone(&validator),
            metadata.clone(),
            vpn.clone(),
        ));
        tasks.push(Self::spawn_transport_pump(
            transport_events,
            Arc::clone(&peers),
            Arc::clone(&registry),
            vpn.clone(),
        ));

        // ===== PERIODIC LOOPS =====
        tasks.push(peers.spawn_sweeper(
            Duration::from_secs(config.peers.sweep_interval_secs),
            shutdown_tx.subscribe(),
        ));
        tasks.push(Self::spawn_gossip_publisher(
            Duration::from_secs(config.gossip.publish_interval_secs),
            Arc::clone(&gossip),
            Arc::clone(&peers),
            metadata.clone(),
            shutdown_tx.subscribe(),
        ));
        tasks.push(Self::spawn_announcer(
            Duration::from_secs(config.discovery.announce_interval_secs),
            Arc::clone(&discovery),
            metadata.clone(),
            vpn.clone(),
            shutdown_tx.subscribe(),
        ));

        // LAN discovery is best-effort: a busy port 6666 (another local
        // node) must not keep the daemon from starting.
        let (lan_tx, mut lan_rx) = mpsc::channel(64);
        match discovery.spawn_lan(shutdown_tx.subscribe(), lan_tx).await {
            Ok(task) => {
                tasks.push(task);
                let peers_for_lan = Arc::clone(&peers);
                let metadata_for_lan = metadata.clone();
                tasks.push(tokio::spawn(async move {
                    while let Some(lan_peer) = lan_rx.recv().await {
                        peers_for_lan
                            .add_or_update(lan_peer.id, vec![lan_peer.multiaddr.clone()])
                            .await;
                        let _ = metadata_for_lan.add_address(lan_peer.id, lan_peer.multiaddr);
                    }
                }));
            }
            Err(e) => warn!("LAN discovery disabled: {}", e),
        }

        let engine = Arc::new(Self {
            config,
            local_peer_id,
            chunk_store,
            registry,
            peers,
            gossip,
            quorum,
            discovery,
            manifests,
            transport,
            metadata,
            vpn,
            shutdown_tx,
            tasks: Mutex::new(tasks),
        });

        let monitor = Self::spawn_monitor(Arc::clone(&engine), quorum_events);
        engine.tasks.lock().await.push(monitor);
        Ok(engine)
    }

    // ===== ACCESSORS =====

    pub fn local_peer_id(&self) -> PeerId {
        self.local_peer_id
    }

    pub fn chunk_store(&self) -> &Arc<ChunkStore> {
        &self.chunk_store
    }

    pub fn registry(&self) -> &Arc<FileRegistry> {
        &self.registry
    }

    pub fn peers(&self) -> &Arc<PeerManager> {
        &self.peers
    }

    pub fn gossip(&self) -> &Arc<GossipManager> {
        &self.gossip
    }

    pub fn manifests(&self) -> &Arc<ManifestManager> {
        &self.manifests
    }

    pub fn discovery(&self) -> &Arc<DiscoveryManager> {
        &self.discovery
    }

    pub fn metadata_handle(&self) -> &MetadataHandle {
        &self.metadata
    }

    pub fn transport_handle(&self) -> &TransportHandle {
        &self.transport
    }

    // ===== BOOTSTRAP =====

    /// Dial every configured bootstrap peer on both hosts sequentially,
    /// then run the DHT bootstrap and wait (polling every 100 ms) until
    /// at least one peer is connected. Partial dial failures are
    /// aggregated but non-fatal as long as one peer is reached.
    pub async fn bootstrap(&self) -> ZapResult<()> {
        let entries: Vec<(PeerId, Multiaddr)> = self
            .config
            .network
            .bootstrap_peers
            .iter()
            .filter_map(|p| {
                match (PeerId::from_str(&p.peer_id), Multiaddr::from_str(&p.address)) {
                    (Ok(id), Ok(addr)) => Some((id, addr)),
                    _ => {
                        warn!(peer = %p.peer_id, addr = %p.address, "unparseable bootstrap entry");
                        None
                    }
                }
            })
            .collect();

        if entries.is_empty() {
            info!("no bootstrap peers configured, starting as first node");
            return Ok(());
        }

        let mut failures = Vec::new();
        for (peer, addr) in &entries {
            self.peers.add_or_update(*peer, vec![addr.clone()]).await;
            let _ = self.metadata.add_address(*peer, addr.clone());
            if let Err(e) = self.metadata.dial(addr.clone()).await {
                failures.push(format!("metadata {}: {}", peer, e));
            }
            let transport_addr = bump_tcp_port(addr);
            let _ = self.transport.add_address(*peer, transport_addr.clone());
            if let Err(e) = self.transport.dial(transport_addr).await {
                failures.push(format!("transport {}: {}", peer, e));
            }
        }

        if let Err(e) = self.metadata.bootstrap().await {
            debug!("DHT bootstrap deferred: {}", e);
        }

        let deadline = tokio::time::Instant::now() + self.config.bootstrap_timeout();
        loop {
            let connected = self.metadata.connected_peers().await?;
            if !connected.is_empty() {
                if !failures.is_empty() {
                    warn!("bootstrap partially failed: {}", failures.join("; "));
                }
                info!(peers = connected.len(), "bootstrap complete");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ZapError::BootstrapFailed(format!(
                    "no bootstrap peer reachable: {}",
                    failures.join("; ")
                )));
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
    }

    // ===== CLIENT OPERATIONS =====

    /// HTTP-like request to a peer's overlay service. LAN-known peers are
    /// addressed directly over their discovered address; everyone else is
    /// resolved through the DHT routing table. Transient failures retry
    /// with backoff; every attempt feeds the response-time EWMA.
    pub async fn send_request(
        &self,
        peer: PeerId,
        method: &str,
        path: &str,
        body: Vec<u8>,
    ) -> ZapResult<ServiceResponse> {
        let lan = self.discovery.lan_peer(&peer).await;
        if let Some(entry) = &lan {
            let _ = self.metadata.add_address(peer, entry.multiaddr.clone());
        }
        let mut message = OverlayMessage::request(
            &self.local_peer_id.to_string(),
            &peer.to_string(),
            &ServiceRequest {
                method: method.to_string(),
                path: path.to_string(),
                body,
            },
        )?;
        message.is_lan = lan.is_some();

        let timeout = self.config.request_timeout();
        let metadata = self.metadata.clone();
        let response = retry_async(
            || {
                let message = message.clone();
                let metadata = metadata.clone();
                async move {
                    let started = std::time::Instant::now();
                    let result = tokio::time::timeout(timeout, metadata.request(peer, message))
                        .await
                        .map_err(|_| ZapError::RequestFailed("request timed out".to_string()))?;
                    result.map(|response| (response, started.elapsed()))
                }
            },
            RetryConfig::default(),
            "overlay request",
        )
        .await;

        match response {
            Ok((envelope, elapsed)) => {
                self.gossip
                    .record_response_time(peer, elapsed.as_millis() as f64)
                    .await;
                envelope.service_response()
            }
            Err(e) => {
                // Failed requests count as a response-time penalty.
                self.gossip
                    .record_response_time(peer, timeout.as_millis() as f64)
                    .await;
                Err(e)
            }
        }
    }

    /// Download a chunk from a peer with verification. Tampered payloads
    /// are never cached and cost the peer reputation.
    pub async fn download_chunk(&self, peer: PeerId, hash: &str) -> ZapResult<Vec<u8>> {
        let transport = self.transport.clone();
        let hash_owned = hash.to_string();
        let started = std::time::Instant::now();
        let result = retry_async(
            || transport.download(peer, hash_owned.clone()),
            RetryConfig::default(),
            "chunk download",
        )
        .await;

        match &result {
            Ok(_) => {
                self.gossip
                    .record_response_time(peer, started.elapsed().as_millis() as f64)
                    .await;
            }
            Err(ZapError::HashMismatch(_)) => {
                self.quorum.penalize_validation(&peer).await;
            }
            Err(_) => {
                self.gossip
                    .record_response_time(
                        peer,
                        self.config.request_timeout().as_millis() as f64,
                    )
                    .await;
            }
        }
        result
    }

    /// Publish a manifest to the DHT.
    pub async fn publish_manifest(&self, manifest: &ManifestInfo) -> ZapResult<ManifestInfo> {
        self.manifests.add_manifest(manifest).await
    }

    /// Fetch a manifest, falling back to peers that gossiped the file
    /// when the DHT lookup comes back empty.
    pub async fn fetch_manifest(&self, name: &str) -> ZapResult<ManifestInfo> {
        match self.manifests.get_manifest(name).await {
            Ok(manifest) => Ok(manifest),
            Err(ZapError::ManifestUnknown(_)) => {
                for holder in self.registry.get_file(name).await.map(|f| f.peers).unwrap_or_default()
                {
                    if let Ok(peer) = PeerId::from_str(&holder.peer_id) {
                        let response = self
                            .send_request(peer, "GET", &format!("/files/{}", name), Vec::new())
                            .await;
                        if let Ok(rsp) = response {
                            if rsp.status_code == 200 {
                                if let Ok(manifest) =
                                    serde_json::from_slice::<ManifestInfo>(&rsp.body)
                                {
                                    return Ok(manifest);
                                }
                            }
                        }
                    }
                }
                Err(ZapError::ManifestUnknown(name.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    // ===== MONITOR LOOP =====

    fn spawn_monitor(engine: Arc<Self>, mut events: QuorumEvents) -> JoinHandle<()> {
        let mut shutdown = engine.shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => {
                        debug!("monitor loop stopping");
                        return;
                    }
                    _ = ticker.tick() => {
                        engine.health_check().await;
                    }
                    Some(peer) = events.peer_banned.recv() => {
                        engine.handle_ban(peer).await;
                    }
                    Some(name) = events.file_removed.recv() => {
                        engine.handle_file_removed(&name).await;
                    }
                }
            }
        })
    }

    /// Periodic health pass: apply reputation deltas and broadcast any
    /// removal votes this node casts as a result.
    async fn health_check(&self) {
        let votes = self.quorum.health_check().await;
        if votes.is_empty() {
            return;
        }
        let connected = self.peers.list_connected().await.len();
        for vote in votes {
            match serde_json::to_vec(&vote) {
                Ok(bytes) => {
                    if let Err(e) = self.metadata.publish(VOTE_TOPIC, bytes).await {
                        debug!("vote broadcast failed: {}", e);
                    }
                }
                Err(e) => warn!("vote encoding failed: {}", e),
            }
            // Count our own vote locally too.
            if let Err(e) = self.quorum.handle_vote(vote, connected).await {
                warn!("local vote tally failed: {}", e);
            }
        }
    }

    /// Quorum decided to ban a peer: close it on both hosts, drop its
    /// records, and evict chunks for which it was the only advertised
    /// source.
    async fn handle_ban(&self, peer: PeerId) {
        info!(%peer, "enforcing ban");
        self.peers.update_state(&peer, PeerState::Blocked).await;
        let _ = self.metadata.disconnect(peer).await;
        let _ = self.transport.disconnect(peer).await;

        let orphaned = self.registry.chunks_sole_source(&peer.to_string()).await;
        for hash in &orphaned {
            match self.chunk_store.delete(hash) {
                Ok(()) => debug!(%peer, hash = %hash, "dropped chunk orphaned by ban"),
                Err(ZapError::NotFound(_)) => {}
                Err(e) => warn!("chunk cleanup failed: {}", e),
            }
        }
        self.registry.remove_peer(&peer.to_string()).await;
        self.peers.remove(&peer).await;
        if let Some(vpn) = &self.vpn {
            vpn.remove_peer(&peer).await;
        }
    }

    /// Quorum decided to purge a file: delete its chunks locally, then
    /// remove the manifest and the registry entry.
    async fn handle_file_removed(&self, name: &str) {
        info!(file = %name, "enforcing file removal");
        match self.manifests.get_manifest(name).await {
            Ok(manifest) => {
                for hash in &manifest.chunk_hashes {
                    match self.chunk_store.delete(hash) {
                        Ok(()) | Err(ZapError::NotFound(_)) => {}
                        Err(e) => warn!("chunk delete failed during purge: {}", e),
                    }
                }
            }
            Err(e) => debug!("manifest unavailable during purge: {}", e),
        }
        if let Err(e) = self.manifests.remove(name).await {
            debug!("manifest removal best-effort failed: {}", e);
        }
        if let Err(e) = self.registry.unregister_file(name).await {
            warn!("registry cleanup failed: {}", e);
        }
    }

    // ===== EVENT PUMPS =====

    #[allow(clippy::too_many_arguments)]
    fn spawn_metadata_pump(
        mut events: mpsc::Receiver<MetadataEvent>,
        gossip: Arc<GossipManager>,
        quorum: Arc<QuorumManager>,
        discovery: Arc<DiscoveryManager>,
        peers: Arc<PeerManager>,
        registry: Arc<FileRegistry>,
        validator: Arc<ValidatorService>,
        metadata: MetadataHandle,
        vpn: Option<Arc<VpnManager>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    MetadataEvent::GossipMessage { topic, source, data } => match topic.as_str() {
                        GOSSIP_TOPIC => {
                            if let Err(e) = gossip.handle_record(&data).await {
                                debug!(%source, "bad gossip record: {}", e);
                                quorum.penalize_protocol(&source).await;
                            }
                        }
                        VOTE_TOPIC => match serde_json::from_slice::<Vote>(&data) {
                            Ok(vote) => {
                                let connected = peers.list_connected().await.len();
                                if let Err(e) = quorum.handle_vote(vote, connected).await {
                                    debug!(%source, "vote rejected: {}", e);
                                }
                            }
                            Err(e) => {
                                debug!(%source, "bad vote payload: {}", e);
                                quorum.penalize_protocol(&source).await;
                            }
                        },
                        VPN_PEERS_TOPIC | VPN_DISCOVERY_TOPIC => {
                            match discovery.handle_announcement(&data).await {
                                Ok(Some(announcement)) => {
                                    if let Ok(id) = PeerId::from_str(&announcement.peer_id) {
                                        peers.add_or_update(id, vec![]).await;
                                        if let Some(vpn) = &vpn {
                                            vpn.add_peer(id).await;
                                        }
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => debug!(%source, "bad announcement: {}", e),
                            }
                        }
                        other => debug!(topic = %other, "message on unhandled topic"),
                    },
                    MetadataEvent::OverlayRequest {
                        peer,
                        message,
                        channel_id,
                    } => {
                        let response = validator.handle(peer, message).await;
                        if let Err(e) = metadata.respond(channel_id, response) {
                            debug!("overlay response failed: {}", e);
                        }
                    }
                    MetadataEvent::PeerConnected(peer) => {
                        peers.add_or_update(peer, vec![]).await;
                        peers.update_state(&peer, PeerState::Connected).await;
                        registry.update_peer_availability(&peer.to_string(), true).await;
                    }
                    MetadataEvent::PeerDisconnected(peer) => {
                        peers.update_state(&peer, PeerState::Disconnected).await;
                        registry.update_peer_availability(&peer.to_string(), false).await;
                    }
                    MetadataEvent::PeerIdentified { peer, public_key } => {
                        peers.set_public_key(&peer, public_key).await;
                    }
                }
            }
        })
    }

    fn spawn_transport_pump(
        mut events: mpsc::Receiver<TransportEvent>,
        peers: Arc<PeerManager>,
        registry: Arc<FileRegistry>,
        vpn: Option<Arc<VpnManager>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match event {
                    TransportEvent::PeerConnected(peer) => {
                        peers.add_or_update(peer, vec![]).await;
                        peers.update_state(&peer, PeerState::Connected).await;
                        if let Some(vpn) = &vpn {
                            vpn.add_peer(peer).await;
                        }
                    }
                    TransportEvent::PeerDisconnected(peer) => {
                        peers.update_state(&peer, PeerState::Disconnected).await;
                        registry.update_peer_availability(&peer.to_string(), false).await;
                    }
                    TransportEvent::InboundPacket { peer, data } => {
                        if let Some(vpn) = &vpn {
                            if let Err(e) = vpn.handle_inbound(&data).await {
                                debug!(%peer, "inbound packet drop: {}", e);
                            }
                        }
                    }
                    TransportEvent::PeerIdentified { peer, public_key } => {
                        peers.set_public_key(&peer, public_key).await;
                    }
                }
            }
        })
    }

    fn spawn_gossip_publisher(
        interval: Duration,
        gossip: Arc<GossipManager>,
        peers: Arc<PeerManager>,
        metadata: MetadataHandle,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        let connected = peers.list_connected().await.len();
                        let record = gossip.local_record(connected).await;
                        match serde_json::to_vec(&record) {
                            Ok(bytes) => {
                                if let Err(e) = metadata.publish(GOSSIP_TOPIC, bytes).await {
                                    debug!("gossip publish skipped: {}", e);
                                }
                            }
                            Err(e) => warn!("gossip encoding failed: {}", e),
                        }
                    }
                }
            }
        })
    }

    fn spawn_announcer(
        interval: Duration,
        discovery: Arc<DiscoveryManager>,
        metadata: MetadataHandle,
        vpn: Option<Arc<VpnManager>>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.changed() => return,
                    _ = ticker.tick() => {
                        let announcement =
                            discovery.local_announcement(vpn.as_ref().map(|v| v.local_ip()));
                        match serde_json::to_vec(&announcement) {
                            Ok(bytes) => {
                                if let Err(e) = metadata.publish(VPN_PEERS_TOPIC, bytes).await {
                                    debug!("announcement publish skipped: {}", e);
                                }
                            }
                            Err(e) => warn!("announcement encoding failed: {}", e),
                        }
                        discovery.prune().await;
                    }
                }
            }
        })
    }

    // ===== SHUTDOWN =====

    /// Tear the node down: cancel every loop, close the VPN overlay,
    /// then the metadata host, then the transport host. Idempotent;
    /// errors are aggregated rather than short-circuiting.
    pub async fn close(&self) -> ZapResult<()> {
        if self.shutdown_tx.send_replace(true) {
            return Ok(());
        }
        info!("shutting down network core");

        let mut failures = Vec::new();
        if let Some(vpn) = &self.vpn {
            if let Err(e) = vpn.close().await {
                failures.push(format!("vpn: {}", e));
            }
        }
        self.metadata.shutdown();
        self.transport.shutdown();

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for mut task in tasks {
            // Loops witness cancellation within a second; anything
            // slower is force-aborted.
            if tokio::time::timeout(Duration::from_secs(1), &mut task).await.is_err() {
                task.abort();
                failures.push("task did not stop within 1s".to_string());
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(ZapError::Network(format!(
                "shutdown incomplete: {}",
                failures.join("; ")
            )))
        }
    }
}

/// The transport host of a peer listens one port above its metadata
/// host; derive its dial address from the advertised one.
fn bump_tcp_port(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .map(|protocol| match protocol {
            Protocol::Tcp(port) => Protocol::Tcp(port.wrapping_add(1)),
            other => other,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_addresses_are_one_port_up() {
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/6001".parse().unwrap();
        assert_eq!(bump_tcp_port(&addr).to_string(), "/ip4/10.0.0.1/tcp/6002");
    }
}
