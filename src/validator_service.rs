/// Validator Service Module
///
/// The validator-server role, built on the overlay router: chunk
/// admission (validate, then store at-most-once), chunk retrieval, file
/// registration, and a status endpoint. This is the service reached by
/// `validator_request` messages; it never opens a TCP port of its own.
use libp2p::PeerId;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::chunk_store::ChunkStore;
use crate::chunk_validator::{ChunkValidator, RejectMessage, StorageRequest};
use crate::error::ZapError;
use crate::file_registry::{FileInfo, FileRegistry};
use crate::overlay::{OverlayMessage, Router, ServiceResponse};
use crate::peer_manager::PeerManager;
use crate::quorum::QuorumManager;

/// Body of `POST /peers/{id}/chunks`
#[derive(Debug, Serialize, Deserialize)]
pub struct ChunkAdvertisement {
    pub address: String,
    pub chunks: Vec<String>,
}

/// Status payload served on `GET /status`
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusInfo {
    pub peer_id: String,
    pub usage_bytes: u64,
    pub quota_bytes: u64,
    pub chunk_count: usize,
    pub file_count: usize,
}

/// Answers overlay requests for the validator-server role
pub struct ValidatorService {
    router: Router,
    local_id: String,
    quorum: Arc<QuorumManager>,
}

impl ValidatorService {
    pub fn new(
        local_id: PeerId,
        chunk_store: Arc<ChunkStore>,
        registry: Arc<FileRegistry>,
        peers: Arc<PeerManager>,
        quorum: Arc<QuorumManager>,
    ) -> Self {
        let router = build_router(
            local_id,
            chunk_store,
            registry,
            peers,
            Arc::clone(&quorum),
        );
        Self {
            router,
            local_id: local_id.to_string(),
            quorum,
        }
    }

    /// Handle one inbound overlay message and produce the response
    /// envelope. Unknown message types are a protocol violation: the
    /// sender is penalized and told 400.
    pub async fn handle(&self, peer: PeerId, message: OverlayMessage) -> OverlayMessage {
        let response = match message.service_request() {
            Ok(request) => {
                debug!(%peer, method = %request.method, path = %request.path, "overlay request");
                self.router
                    .dispatch(&peer.to_string(), &request.method, &request.path, request.body)
                    .await
            }
            Err(e) => {
                warn!(%peer, "malformed overlay request: {}", e);
                self.quorum.penalize_protocol(&peer).await;
                ServiceResponse::error(400, "malformed request")
            }
        };
        OverlayMessage::response(&self.local_id, &message.from_id, &response).unwrap_or_else(|e| {
            warn!("response encoding failed: {}", e);
            OverlayMessage {
                from_id: self.local_id.clone(),
                to_id: message.from_id.clone(),
                msg_type: crate::overlay::MSG_VALIDATOR_RESPONSE.to_string(),
                payload: Vec::new(),
                is_lan: false,
            }
        })
    }
}

/// Wire up the validator routes.
pub fn build_router(
    local_id: PeerId,
    chunk_store: Arc<ChunkStore>,
    registry: Arc<FileRegistry>,
    peers: Arc<PeerManager>,
    quorum: Arc<QuorumManager>,
) -> Router {
    let mut router = Router::new();

    // Chunk admission: validate, then store. Validation failures carry
    // the reject reason back and cost the sender reputation.
    {
        let chunk_store = Arc::clone(&chunk_store);
        let peers = Arc::clone(&peers);
        let quorum = Arc::clone(&quorum);
        router.register("POST", "/chunks/{hash}", move |ctx| {
            let chunk_store = Arc::clone(&chunk_store);
            let peers = Arc::clone(&peers);
            let quorum = Arc::clone(&quorum);
            async move {
                let request: StorageRequest = match serde_json::from_slice(&ctx.body) {
                    Ok(request) => request,
                    Err(e) => return ServiceResponse::error(400, &format!("bad storage request: {}", e)),
                };
                if request.chunk_hash != ctx.params["hash"] {
                    return ServiceResponse::error(400, "path and body hash disagree");
                }

                let owner_key = match PeerId::from_str(&request.owner_peer_id) {
                    Ok(owner) => peers.public_key(&owner).await,
                    Err(_) => None,
                };
                let validator = ChunkValidator::default();
                if let Err(reject) = validator.validate(&request, owner_key.as_ref()) {
                    if let Ok(sender) = PeerId::from_str(&ctx.peer) {
                        quorum.penalize_validation(&sender).await;
                    }
                    return reject_response(&reject);
                }

                match chunk_store.store(&request.chunk_hash, &request.data) {
                    Ok(()) => ServiceResponse::ok(Vec::new()),
                    Err(ZapError::QuotaExceeded(e)) => ServiceResponse::error(503, &e),
                    Err(e) => ServiceResponse::error(500, &e.to_string()),
                }
            }
        });
    }

    {
        let chunk_store = Arc::clone(&chunk_store);
        router.register("GET", "/chunks/{hash}", move |ctx| {
            let chunk_store = Arc::clone(&chunk_store);
            async move {
                match chunk_store.get(&ctx.params["hash"]) {
                    Ok(data) => ServiceResponse::ok(data),
                    Err(ZapError::NotFound(_)) => ServiceResponse::not_found(),
                    Err(e) => ServiceResponse::error(500, &e.to_string()),
                }
            }
        });
    }

    {
        let chunk_store = Arc::clone(&chunk_store);
        router.register("DELETE", "/chunks/{hash}", move |ctx| {
            let chunk_store = Arc::clone(&chunk_store);
            async move {
                match chunk_store.delete(&ctx.params["hash"]) {
                    Ok(()) => ServiceResponse::ok(Vec::new()),
                    Err(ZapError::NotFound(_)) => ServiceResponse::not_found(),
                    Err(e) => ServiceResponse::error(500, &e.to_string()),
                }
            }
        });
    }

    {
        let registry = Arc::clone(&registry);
        router.register("POST", "/files", move |ctx| {
            let registry = Arc::clone(&registry);
            async move {
                let info: FileInfo = match serde_json::from_slice(&ctx.body) {
                    Ok(info) => info,
                    Err(e) => return ServiceResponse::error(400, &format!("bad file info: {}", e)),
                };
                match registry.register_file(info).await {
                    Ok(()) => ServiceResponse::ok(Vec::new()),
                    Err(e) => ServiceResponse::error(500, &e.to_string()),
                }
            }
        });
    }

    {
        let registry = Arc::clone(&registry);
        router.register("GET", "/files/{name}", move |ctx| {
            let registry = Arc::clone(&registry);
            async move {
                match registry.get_file(&ctx.params["name"]).await {
                    Some(info) => ServiceResponse::json(&info),
                    None => ServiceResponse::not_found(),
                }
            }
        });
    }

    {
        let registry = Arc::clone(&registry);
        router.register("DELETE", "/files/{name}", move |ctx| {
            let registry = Arc::clone(&registry);
            async move {
                match registry.unregister_file(&ctx.params["name"]).await {
                    Ok(()) => ServiceResponse::ok(Vec::new()),
                    Err(e) => ServiceResponse::error(500, &e.to_string()),
                }
            }
        });
    }

    // Chunk advertisements: a peer declares what it holds so the
    // chunk -> peer index can serve download sources.
    {
        let registry = Arc::clone(&registry);
        router.register("POST", "/peers/{id}/chunks", move |ctx| {
            let registry = Arc::clone(&registry);
            async move {
                let advert: ChunkAdvertisement = match serde_json::from_slice(&ctx.body) {
                    Ok(advert) => advert,
                    Err(e) => {
                        return ServiceResponse::error(400, &format!("bad advertisement: {}", e))
                    }
                };
                match registry
                    .register_peer_chunks(&ctx.params["id"], &advert.address, &advert.chunks)
                    .await
                {
                    Ok(()) => ServiceResponse::ok(Vec::new()),
                    Err(e) => ServiceResponse::error(500, &e.to_string()),
                }
            }
        });
    }

    {
        let chunk_store = Arc::clone(&chunk_store);
        let registry = Arc::clone(&registry);
        router.register("GET", "/status", move |_ctx| {
            let chunk_store = Arc::clone(&chunk_store);
            let registry = Arc::clone(&registry);
            let peer_id = local_id.to_string();
            async move {
                ServiceResponse::json(&StatusInfo {
                    peer_id,
                    usage_bytes: chunk_store.usage(),
                    quota_bytes: chunk_store.quota(),
                    chunk_count: chunk_store.list().len(),
                    file_count: registry.list_files().await.len(),
                })
            }
        });
    }

    router
}

fn reject_response(reject: &RejectMessage) -> ServiceResponse {
    match serde_json::to_vec(reject) {
        Ok(body) => ServiceResponse {
            status_code: 400,
            body,
        },
        Err(_) => ServiceResponse::error(400, "rejected"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::{sha256_hex, DEFAULT_QUOTA_BYTES};
    use crate::error::RejectReason;
    use crate::overlay::ServiceRequest;
    use libp2p::identity::Keypair;
    use std::time::Duration;

    struct Fixture {
        service: ValidatorService,
        chunk_store: Arc<ChunkStore>,
        peers: Arc<PeerManager>,
        _dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let chunk_store = Arc::new(ChunkStore::open(dir.path(), DEFAULT_QUOTA_BYTES).unwrap());
        let registry = Arc::new(FileRegistry::new());
        let peers = Arc::new(PeerManager::new(Duration::from_secs(3600)));
        let keypair = Keypair::generate_ed25519();
        let local_id = keypair.public().to_peer_id();
        let (quorum, _events) = QuorumManager::new(
            crate::config::Config::default().quorum,
            local_id,
            keypair,
            Arc::clone(&peers),
        );
        let service = ValidatorService::new(
            local_id,
            Arc::clone(&chunk_store),
            registry,
            Arc::clone(&peers),
            quorum,
        );
        Fixture {
            service,
            chunk_store,
            peers,
            _dir: dir,
        }
    }

    fn storage_request(data: Vec<u8>) -> StorageRequest {
        StorageRequest {
            chunk_hash: sha256_hex(&data),
            size: data.len() as i64,
            data,
            owner_peer_id: PeerId::random().to_string(),
            signature: None,
        }
    }

    async fn post_chunk(fixture: &Fixture, sender: &PeerId, request: &StorageRequest) -> OverlayMessage {
        let service_request = ServiceRequest {
            method: "POST".into(),
            path: format!("/chunks/{}", request.chunk_hash),
            body: serde_json::to_vec(request).unwrap(),
        };
        let message =
            OverlayMessage::request(&sender.to_string(), &fixture.service.local_id, &service_request)
                .unwrap();
        fixture.service.handle(*sender, message).await
    }

    #[tokio::test]
    async fn admission_stores_valid_chunk() {
        let fixture = fixture();
        let request = storage_request(vec![7u8; 2048]);
        let response = post_chunk(&fixture, &PeerId::random(), &request).await;
        assert_eq!(response.service_response().unwrap().status_code, 200);
        assert!(fixture.chunk_store.contains(&request.chunk_hash));

        // At-most-once: a replay is accepted without growing usage.
        let usage = fixture.chunk_store.usage();
        let response = post_chunk(&fixture, &PeerId::random(), &request).await;
        assert_eq!(response.service_response().unwrap().status_code, 200);
        assert_eq!(fixture.chunk_store.usage(), usage);
    }

    #[tokio::test]
    async fn rejection_carries_reason_and_penalizes_sender() {
        let fixture = fixture();
        let sender = PeerId::random();
        fixture.peers.add_or_update(sender, vec![]).await;

        let mut request = storage_request(vec![7u8; 2048]);
        request.data[0] ^= 0xFF; // tamper
        let response = post_chunk(&fixture, &sender, &request).await;
        let service_response = response.service_response().unwrap();
        assert_eq!(service_response.status_code, 400);
        let reject: RejectMessage = serde_json::from_slice(&service_response.body).unwrap();
        assert_eq!(reject.reason, RejectReason::InvalidHash);
        assert!(!fixture.chunk_store.contains(&request.chunk_hash));
        assert_eq!(
            fixture.peers.get(&sender).await.unwrap().reputation_score,
            crate::quorum::VALIDATION_PENALTY
        );
    }

    #[tokio::test]
    async fn quota_exhaustion_is_503() {
        let fixture = fixture();
        fixture.chunk_store.set_quota(1024);
        let request = storage_request(vec![7u8; 2048]);
        let response = post_chunk(&fixture, &PeerId::random(), &request).await;
        assert_eq!(response.service_response().unwrap().status_code, 503);
    }

    #[tokio::test]
    async fn status_reports_usage() {
        let fixture = fixture();
        let data = vec![1u8; 4096];
        fixture.chunk_store.store(&sha256_hex(&data), &data).unwrap();

        let request = ServiceRequest {
            method: "GET".into(),
            path: "/status".into(),
            body: vec![],
        };
        let sender = PeerId::random();
        let message =
            OverlayMessage::request(&sender.to_string(), &fixture.service.local_id, &request).unwrap();
        let response = fixture.service.handle(sender, message).await;
        let status: StatusInfo =
            serde_json::from_slice(&response.service_response().unwrap().body).unwrap();
        assert_eq!(status.usage_bytes, 4096);
        assert_eq!(status.chunk_count, 1);
    }

    #[tokio::test]
    async fn unknown_message_type_penalized() {
        let fixture = fixture();
        let sender = PeerId::random();
        fixture.peers.add_or_update(sender, vec![]).await;
        let message = OverlayMessage {
            from_id: sender.to_string(),
            to_id: fixture.service.local_id.clone(),
            msg_type: "bogus".into(),
            payload: vec![],
            is_lan: false,
        };
        let response = fixture.service.handle(sender, message).await;
        assert_eq!(response.service_response().unwrap().status_code, 400);
        assert_eq!(
            fixture.peers.get(&sender).await.unwrap().reputation_score,
            crate::quorum::PROTOCOL_PENALTY
        );
    }
}
