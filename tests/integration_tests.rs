//! Cross-module flows exercised through the public library API: chunk
//! admission through the validator service, quota pressure, peer expiry,
//! the quorum ban pipeline, and registry persistence across restarts.

use filezap::chunk_store::{sha256_hex, ChunkStore, DEFAULT_QUOTA_BYTES};
use filezap::chunk_validator::StorageRequest;
use filezap::config::Config;
use filezap::error::ZapError;
use filezap::file_registry::{FileInfo, FileRegistry, PeerChunkInfo};
use filezap::overlay::{OverlayMessage, ServiceRequest};
use filezap::peer_manager::{PeerManager, PeerState};
use filezap::quorum::{QuorumManager, VoteType};
use filezap::validator_service::ValidatorService;
use libp2p::identity::Keypair;
use libp2p::PeerId;
use std::sync::Arc;
use std::time::Duration;

struct Node {
    service: ValidatorService,
    chunk_store: Arc<ChunkStore>,
    registry: Arc<FileRegistry>,
    peers: Arc<PeerManager>,
    quorum: Arc<QuorumManager>,
    events: filezap::quorum::QuorumEvents,
    local_id: PeerId,
    _dir: tempfile::TempDir,
}

fn node() -> Node {
    let dir = tempfile::TempDir::new().unwrap();
    let chunk_store = Arc::new(ChunkStore::open(dir.path().join("chunks"), DEFAULT_QUOTA_BYTES).unwrap());
    let registry = Arc::new(FileRegistry::with_persistence(dir.path().join("registry.json")));
    let peers = Arc::new(PeerManager::new(Duration::from_secs(3600)));
    let keypair = Keypair::generate_ed25519();
    let local_id = keypair.public().to_peer_id();
    let (quorum, events) = QuorumManager::new(
        Config::default().quorum,
        local_id,
        keypair,
        Arc::clone(&peers),
    );
    let service = ValidatorService::new(
        local_id,
        Arc::clone(&chunk_store),
        Arc::clone(&registry),
        Arc::clone(&peers),
        Arc::clone(&quorum),
    );
    Node {
        service,
        chunk_store,
        registry,
        peers,
        quorum,
        events,
        local_id,
        _dir: dir,
    }
}

async fn call(
    node: &Node,
    sender: &PeerId,
    method: &str,
    path: &str,
    body: Vec<u8>,
) -> filezap::overlay::ServiceResponse {
    let request = ServiceRequest {
        method: method.into(),
        path: path.into(),
        body,
    };
    let message =
        OverlayMessage::request(&sender.to_string(), &node.local_id.to_string(), &request).unwrap();
    node.service
        .handle(*sender, message)
        .await
        .service_response()
        .unwrap()
}

#[tokio::test]
async fn chunk_upload_retrieval_and_deletion_through_the_service() {
    let node = node();
    let sender = PeerId::random();
    let data = vec![0x5A; 4096];
    let request = StorageRequest {
        chunk_hash: sha256_hex(&data),
        size: data.len() as i64,
        data: data.clone(),
        owner_peer_id: sender.to_string(),
        signature: None,
    };

    let rsp = call(
        &node,
        &sender,
        "POST",
        &format!("/chunks/{}", request.chunk_hash),
        serde_json::to_vec(&request).unwrap(),
    )
    .await;
    assert_eq!(rsp.status_code, 200);

    let rsp = call(&node, &sender, "GET", &format!("/chunks/{}", request.chunk_hash), vec![]).await;
    assert_eq!(rsp.status_code, 200);
    assert_eq!(rsp.body, data);

    let rsp = call(&node, &sender, "DELETE", &format!("/chunks/{}", request.chunk_hash), vec![]).await;
    assert_eq!(rsp.status_code, 200);
    assert_eq!(node.chunk_store.usage(), 0);

    let rsp = call(&node, &sender, "GET", &format!("/chunks/{}", request.chunk_hash), vec![]).await;
    assert_eq!(rsp.status_code, 404);
}

#[tokio::test]
async fn quota_pressure_surfaces_as_unavailable() {
    let node = node();
    node.chunk_store.set_quota(5 * 1024 * 1024);
    let sender = PeerId::random();

    let mut statuses = Vec::new();
    for fill in [1u8, 2, 3] {
        let data = vec![fill; 2 * 1024 * 1024];
        let request = StorageRequest {
            chunk_hash: sha256_hex(&data),
            size: data.len() as i64,
            data,
            owner_peer_id: sender.to_string(),
            signature: None,
        };
        let rsp = call(
            &node,
            &sender,
            "POST",
            &format!("/chunks/{}", request.chunk_hash),
            serde_json::to_vec(&request).unwrap(),
        )
        .await;
        statuses.push(rsp.status_code);
    }
    assert_eq!(statuses, vec![200, 200, 503]);
    assert_eq!(node.chunk_store.usage(), 4 * 1024 * 1024);
}

#[tokio::test]
async fn stale_peer_evicted_by_running_sweeper() {
    let peers = Arc::new(PeerManager::new(Duration::from_millis(100)));
    let stale = PeerId::random();
    peers.add_or_update(stale, vec![]).await;

    let (shutdown_tx, _) = tokio::sync::watch::channel(false);
    let task = peers.spawn_sweeper(Duration::from_millis(50), shutdown_tx.subscribe());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(peers.get(&stale).await.is_none());

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
}

#[tokio::test]
async fn repeated_health_checks_drive_a_peer_to_ban() {
    let mut node = node();
    let bad = PeerId::random();
    node.peers.add_or_update(bad, vec![]).await;
    node.peers.update_state(&bad, PeerState::Connected).await;
    // Stale, low uptime, slow: three penalties per check.
    node.peers
        .update_gossip(bad, chrono::Utc::now() - chrono::Duration::hours(2), 5.0, 4000.0)
        .await;

    let mut cast = Vec::new();
    for _ in 0..4 {
        cast.extend(node.quorum.health_check().await);
    }
    assert_eq!(cast.len(), 1);
    assert_eq!(cast[0].vote_type, VoteType::RemovePeer);

    // One connected peer -> threshold 1: our own vote decides.
    let connected = node.peers.list_connected().await.len();
    assert!(node.quorum.handle_vote(cast.remove(0), connected).await.unwrap());
    let banned = node.events.peer_banned.recv().await.unwrap();
    assert_eq!(banned, bad);

    // The engine's ban path marks the peer Blocked; Blocked peers are
    // invisible to list_connected and stay that way.
    node.peers.update_state(&banned, PeerState::Blocked).await;
    assert!(!node.peers.update_state(&banned, PeerState::Connected).await);
    assert!(node.peers.list_connected().await.is_empty());
}

#[tokio::test]
async fn registry_survives_restart_and_feeds_chunk_lookup() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("registry.json");
    let holder = PeerChunkInfo {
        peer_id: PeerId::random().to_string(),
        chunk_ids: vec!["a".repeat(64)],
        address: "/ip4/10.1.1.1/tcp/6001".into(),
        available: true,
    };
    {
        let registry = FileRegistry::with_persistence(path.clone());
        registry
            .register_file(FileInfo {
                name: "report.zap".into(),
                chunk_ids: vec!["a".repeat(64)],
                available: true,
                peers: vec![holder.clone()],
            })
            .await
            .unwrap();
    }

    let registry = FileRegistry::with_persistence(path);
    let file = registry.get_file("report.zap").await.unwrap();
    assert_eq!(file.chunk_ids, vec!["a".repeat(64)]);
    let sources = registry.get_peers_for_chunk(&"a".repeat(64)).await;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].peer_id, holder.peer_id);
}

#[tokio::test]
async fn file_registration_round_trip_through_the_service() {
    let node = node();
    let sender = PeerId::random();
    let info = FileInfo {
        name: "notes.zap".into(),
        chunk_ids: vec!["b".repeat(64)],
        available: true,
        peers: vec![],
    };

    let rsp = call(&node, &sender, "POST", "/files", serde_json::to_vec(&info).unwrap()).await;
    assert_eq!(rsp.status_code, 200);

    let rsp = call(&node, &sender, "GET", "/files/notes.zap", vec![]).await;
    assert_eq!(rsp.status_code, 200);
    let fetched: FileInfo = serde_json::from_slice(&rsp.body).unwrap();
    assert_eq!(fetched, info);

    // Advertise a holder, then confirm the chunk index serves it.
    let advert = serde_json::json!({
        "address": "/ip4/10.2.2.2/tcp/6001",
        "chunks": ["b".repeat(64)],
    });
    let peer = PeerId::random();
    let rsp = call(
        &node,
        &sender,
        "POST",
        &format!("/peers/{}/chunks", peer),
        serde_json::to_vec(&advert).unwrap(),
    )
    .await;
    assert_eq!(rsp.status_code, 200);
    let sources = node.registry.get_peers_for_chunk(&"b".repeat(64)).await;
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].peer_id, peer.to_string());

    let rsp = call(&node, &sender, "DELETE", "/files/notes.zap", vec![]).await;
    assert_eq!(rsp.status_code, 200);
    let rsp = call(&node, &sender, "GET", "/files/notes.zap", vec![]).await;
    assert_eq!(rsp.status_code, 404);
}

#[tokio::test]
async fn invalid_access_and_not_found_error_mapping() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = ChunkStore::open(dir.path(), DEFAULT_QUOTA_BYTES).unwrap();
    assert!(matches!(store.get(""), Err(ZapError::InvalidAccess(_))));
    assert!(matches!(store.get(&"c".repeat(64)), Err(ZapError::NotFound(_))));
    assert!(matches!(
        store.get("../../../etc/passwd"),
        Err(ZapError::InvalidAccess(_))
    ));
}
