/// Manifest Manager Module
///
/// Publishes and locates `ManifestInfo` records on the metadata host's
/// DHT under `manifest/<name>`. Publishing an existing name overwrites
/// the record and bumps `updated_at`; removal is a best-effort DHT
/// delete driven by quorum file-removal outcomes.
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::chunk_store::is_chunk_hash;
use crate::error::{ZapError, ZapResult};

/// DHT key prefix for manifests
pub const MANIFEST_KEY_PREFIX: &str = "manifest/";

/// Network-wide description of a stored file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ManifestInfo {
    pub name: String,
    pub owner_peer_id: String,
    /// Encrypted hashes in chunk order
    pub chunk_hashes: Vec<String>,
    pub size: i64,
    pub created: DateTime<Utc>,
    pub modified: DateTime<Utc>,
    pub replication_goal: u32,
    pub updated_at: DateTime<Utc>,
}

impl ManifestInfo {
    pub fn new(name: &str, owner_peer_id: &str, chunk_hashes: Vec<String>, size: i64) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            owner_peer_id: owner_peer_id.to_string(),
            chunk_hashes,
            size,
            created: now,
            modified: now,
            replication_goal: 3,
            updated_at: now,
        }
    }

    /// Enforce the manifest invariants: at least one chunk, every hash
    /// 64 lowercase hex characters.
    pub fn validate(&self) -> ZapResult<()> {
        if self.chunk_hashes.is_empty() {
            return Err(ZapError::Serialization(format!(
                "manifest {:?} has no chunks",
                self.name
            )));
        }
        for hash in &self.chunk_hashes {
            if !is_chunk_hash(hash) {
                return Err(ZapError::Serialization(format!(
                    "manifest {:?} carries malformed chunk hash {:?}",
                    self.name, hash
                )));
            }
        }
        Ok(())
    }
}

/// DHT key for a manifest name.
pub fn manifest_key(name: &str) -> Vec<u8> {
    format!("{}{}", MANIFEST_KEY_PREFIX, name).into_bytes()
}

/// Seam to the metadata host's DHT. Implemented by the metadata actor
/// handle; tests use an in-memory store.
#[async_trait]
pub trait DhtStore: Send + Sync {
    /// Publish a record, replicating toward `replicas` peers best-effort.
    async fn put(&self, key: Vec<u8>, value: Vec<u8>, replicas: u32) -> ZapResult<()>;
    async fn get(&self, key: Vec<u8>) -> ZapResult<Option<Vec<u8>>>;
    /// Best-effort removal of a record this node published.
    async fn remove(&self, key: Vec<u8>) -> ZapResult<()>;
}

/// Manifest publication and lookup over a `DhtStore`
pub struct ManifestManager {
    dht: Arc<dyn DhtStore>,
}

impl ManifestManager {
    pub fn new(dht: Arc<dyn DhtStore>) -> Self {
        Self { dht }
    }

    /// Publish a manifest, overwriting any record under the same name.
    /// Returns the manifest as published (with `updated_at` bumped).
    pub async fn add_manifest(&self, manifest: &ManifestInfo) -> ZapResult<ManifestInfo> {
        manifest.validate()?;
        let mut published = manifest.clone();
        published.updated_at = Utc::now();
        let value = serde_json::to_vec(&published)?;
        self.dht
            .put(manifest_key(&published.name), value, published.replication_goal)
            .await?;
        debug!(name = %published.name, chunks = published.chunk_hashes.len(), "manifest published");
        Ok(published)
    }

    /// Fetch a manifest by name.
    pub async fn get_manifest(&self, name: &str) -> ZapResult<ManifestInfo> {
        match self.dht.get(manifest_key(name)).await {
            Ok(Some(bytes)) => Ok(serde_json::from_slice(&bytes)?),
            Ok(None) => Err(ZapError::ManifestUnknown(name.to_string())),
            Err(ZapError::NotFound(_)) => Err(ZapError::ManifestUnknown(name.to_string())),
            Err(e) => Err(e),
        }
    }

    /// Best-effort cluster removal of a manifest record.
    pub async fn remove(&self, name: &str) -> ZapResult<()> {
        self.dht.remove(manifest_key(name)).await
    }
}
