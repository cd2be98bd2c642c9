/// File Registry Module
///
/// Inverted indices over the file catalog: `filename -> FileInfo` and
/// `chunk_id -> peers holding it`. The file map is the durable half; on
/// validator-server nodes it is serialized to `registry.json` after every
/// mutation. The chunk->peer map is volatile and rebuilt from gossiped
/// peer advertisements.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ZapError, ZapResult};

/// A peer's advertised chunk holdings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PeerChunkInfo {
    pub peer_id: String,
    pub chunk_ids: Vec<String>,
    pub address: String,
    pub available: bool,
}

/// Registry view of one file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub chunk_ids: Vec<String>,
    pub available: bool,
    pub peers: Vec<PeerChunkInfo>,
}

#[derive(Default)]
struct RegistryState {
    files: HashMap<String, FileInfo>,
    chunk_peers: HashMap<String, Vec<PeerChunkInfo>>,
}

/// File and chunk location registry
pub struct FileRegistry {
    state: RwLock<RegistryState>,
    /// `registry.json` path; `None` for non-server roles
    persist_path: Option<PathBuf>,
}

impl FileRegistry {
    /// In-memory registry (client role).
    pub fn new() -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            persist_path: None,
        }
    }

    /// Persistent registry (validator-server role). A missing or partial
    /// `registry.json` is tolerated; whatever parses is loaded.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut state = RegistryState::default();
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<HashMap<String, FileInfo>>(&text) {
                Ok(files) => {
                    debug!(files = files.len(), "registry loaded from {:?}", path);
                    state.files = files;
                }
                Err(e) => warn!("registry.json unreadable, starting empty: {}", e),
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("registry.json unreadable, starting empty: {}", e),
        }
        // Rebuild chunk mappings from the declared peers of loaded files.
        let files: Vec<FileInfo> = state.files.values().cloned().collect();
        for info in files {
            Self::index_file_peers(&mut state, &info);
        }
        Self {
            state: RwLock::new(state),
            persist_path: Some(path),
        }
    }

    fn index_file_peers(state: &mut RegistryState, info: &FileInfo) {
        for peer in &info.peers {
            for chunk in &peer.chunk_ids {
                let list = state.chunk_peers.entry(chunk.clone()).or_default();
                match list.iter_mut().find(|p| p.peer_id == peer.peer_id) {
                    Some(existing) => *existing = peer.clone(),
                    None => list.push(peer.clone()),
                }
            }
        }
    }

    /// Serialize the files map while holding the lock, write after
    /// releasing it. A failed write propagates but the in-memory change
    /// is kept.
    fn snapshot_for_persist(&self, state: &RegistryState) -> Option<(PathBuf, String)> {
        let path = self.persist_path.clone()?;
        match serde_json::to_string_pretty(&state.files) {
            Ok(json) => Some((path, json)),
            Err(e) => {
                warn!("registry serialization failed: {}", e);
                None
            }
        }
    }

    fn write_snapshot(snapshot: Option<(PathBuf, String)>) -> ZapResult<()> {
        if let Some((path, json)) = snapshot {
            std::fs::write(&path, json)
                .map_err(|e| ZapError::Io(format!("registry persist failed: {}", e)))?;
        }
        Ok(())
    }

    /// Upsert a file entry, replacing any prior entry with the same name,
    /// and rebuild the chunk mappings for its declared peers. Empty names
    /// and empty chunk lists are accepted; names are identifiers, not
    /// validated here.
    pub async fn register_file(&self, info: FileInfo) -> ZapResult<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            Self::index_file_peers(&mut state, &info);
            state.files.insert(info.name.clone(), info);
            self.snapshot_for_persist(&state)
        };
        Self::write_snapshot(snapshot)
    }

    /// Remove a file entry and any chunk mappings referenced only by it.
    pub async fn unregister_file(&self, name: &str) -> ZapResult<()> {
        let snapshot = {
            let mut state = self.state.write().await;
            let removed = match state.files.remove(name) {
                Some(info) => info,
                None => return Ok(()),
            };
            for chunk in &removed.chunk_ids {
                let referenced_elsewhere = state
                    .files
                    .values()
                    .any(|f| f.chunk_ids.iter().any(|c| c == chunk));
                if !referenced_elsewhere {
                    state.chunk_peers.remove(chunk);
                }
            }
            self.snapshot_for_persist(&state)
        };
        Self::write_snapshot(snapshot)
    }

    /// Record a peer's chunk advertisement, marking it available and
    /// extending the per-chunk peer lists (de-duplicated by peer id).
    pub async fn register_peer_chunks(
        &self,
        peer_id: &str,
        address: &str,
        chunks: &[String],
    ) -> ZapResult<()> {
        let entry = PeerChunkInfo {
            peer_id: peer_id.to_string(),
            chunk_ids: chunks.to_vec(),
            address: address.to_string(),
            available: true,
        };
        let mut state = self.state.write().await;
        for chunk in chunks {
            let list = state.chunk_peers.entry(chunk.clone()).or_default();
            match list.iter_mut().find(|p| p.peer_id == peer_id) {
                Some(existing) => *existing = entry.clone(),
                None => list.push(entry.clone()),
            }
        }
        Ok(())
    }

    /// Flip a peer's availability bit across every chunk mapping and file
    /// entry in one pass.
    pub async fn update_peer_availability(&self, peer_id: &str, available: bool) {
        let mut state = self.state.write().await;
        for list in state.chunk_peers.values_mut() {
            for peer in list.iter_mut().filter(|p| p.peer_id == peer_id) {
                peer.available = available;
            }
        }
        for file in state.files.values_mut() {
            for peer in file.peers.iter_mut().filter(|p| p.peer_id == peer_id) {
                peer.available = available;
            }
        }
    }

    /// Peers currently advertising a chunk, available ones only.
    pub async fn get_peers_for_chunk(&self, hash: &str) -> Vec<PeerChunkInfo> {
        let state = self.state.read().await;
        state
            .chunk_peers
            .get(hash)
            .map(|list| list.iter().filter(|p| p.available).cloned().collect())
            .unwrap_or_default()
    }

    pub async fn get_file(&self, name: &str) -> Option<FileInfo> {
        self.state.read().await.files.get(name).cloned()
    }

    pub async fn list_files(&self) -> Vec<FileInfo> {
        self.state.read().await.files.values().cloned().collect()
    }

    /// Chunks whose only advertised source is the given peer. Used to
    /// decide what to evict locally when that peer is banned.
    pub async fn chunks_sole_source(&self, peer_id: &str) -> Vec<String> {
        let state = self.state.read().await;
        state
            .chunk_peers
            .iter()
            .filter(|(_, peers)| !peers.is_empty() && peers.iter().all(|p| p.peer_id == peer_id))
            .map(|(chunk, _)| chunk.clone())
            .collect()
    }

    /// Drop a peer from every chunk mapping and file entry.
    pub async fn remove_peer(&self, peer_id: &str) {
        let mut state = self.state.write().await;
        state.chunk_peers.retain(|_, list| {
            list.retain(|p| p.peer_id != peer_id);
            !list.is_empty()
        });
        for file in state.files.values_mut() {
            file.peers.retain(|p| p.peer_id != peer_id);
        }
    }
}

impl Default for FileRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, chunks: &[&str], peers: Vec<PeerChunkInfo>) -> FileInfo {
        FileInfo {
            name: name.to_string(),
            chunk_ids: chunks.iter().map(|c| c.to_string()).collect(),
            available: true,
            peers,
        }
    }

    fn holding(peer: &str, chunks: &[&str]) -> PeerChunkInfo {
        PeerChunkInfo {
            peer_id: peer.to_string(),
            chunk_ids: chunks.iter().map(|c| c.to_string()).collect(),
            address: format!("/ip4/10.0.0.1/tcp/6001/p2p/{}", peer),
            available: true,
        }
    }

    #[tokio::test]
    async fn register_overwrites_same_name() {
        let registry = FileRegistry::new();
        registry
            .register_file(file("a.zap", &["c1"], vec![holding("p1", &["c1"])]))
            .await
            .unwrap();
        registry
            .register_file(file("a.zap", &["c2"], vec![]))
            .await
            .unwrap();
        let info = registry.get_file("a.zap").await.unwrap();
        assert_eq!(info.chunk_ids, vec!["c2"]);
        assert_eq!(registry.list_files().await.len(), 1);
    }

    #[tokio::test]
    async fn unregister_drops_sole_referent_chunks() {
        let registry = FileRegistry::new();
        registry
            .register_file(file("a.zap", &["c1", "shared"], vec![holding("p1", &["c1", "shared"])]))
            .await
            .unwrap();
        registry
            .register_file(file("b.zap", &["shared"], vec![holding("p2", &["shared"])]))
            .await
            .unwrap();
        registry.unregister_file("a.zap").await.unwrap();
        assert!(registry.get_peers_for_chunk("c1").await.is_empty());
        assert!(!registry.get_peers_for_chunk("shared").await.is_empty());
    }

    #[tokio::test]
    async fn peer_chunks_idempotent_and_deduplicated() {
        let registry = FileRegistry::new();
        let chunks = vec!["c1".to_string(), "c2".to_string()];
        registry
            .register_peer_chunks("p1", "/ip4/10.0.0.2/tcp/6001", &chunks)
            .await
            .unwrap();
        registry
            .register_peer_chunks("p1", "/ip4/10.0.0.2/tcp/6001", &chunks)
            .await
            .unwrap();
        assert_eq!(registry.get_peers_for_chunk("c1").await.len(), 1);
        assert_eq!(registry.get_peers_for_chunk("c2").await.len(), 1);
    }

    #[tokio::test]
    async fn availability_filter_and_flip() {
        let registry = FileRegistry::new();
        registry
            .register_peer_chunks("p1", "addr1", &["c1".to_string()])
            .await
            .unwrap();
        registry
            .register_peer_chunks("p2", "addr2", &["c1".to_string()])
            .await
            .unwrap();
        registry.update_peer_availability("p1", false).await;
        let peers = registry.get_peers_for_chunk("c1").await;
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].peer_id, "p2");
        registry.update_peer_availability("p1", true).await;
        assert_eq!(registry.get_peers_for_chunk("c1").await.len(), 2);
    }

    #[tokio::test]
    async fn sole_source_detection() {
        let registry = FileRegistry::new();
        registry
            .register_peer_chunks("p1", "addr1", &["only".to_string(), "both".to_string()])
            .await
            .unwrap();
        registry
            .register_peer_chunks("p2", "addr2", &["both".to_string()])
            .await
            .unwrap();
        let sole = registry.chunks_sole_source("p1").await;
        assert_eq!(sole, vec!["only".to_string()]);
    }

    #[tokio::test]
    async fn persistence_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        {
            let registry = FileRegistry::with_persistence(path.clone());
            registry
                .register_file(file("a.zap", &["c1"], vec![holding("p1", &["c1"])]))
                .await
                .unwrap();
        }
        let text = std::fs::read_to_string(&path).unwrap();
        // Pretty JSON, two-space indent.
        assert!(text.contains("\n  \""));

        let reloaded = FileRegistry::with_persistence(path);
        assert!(reloaded.get_file("a.zap").await.is_some());
        assert_eq!(reloaded.get_peers_for_chunk("c1").await.len(), 1);
    }

    #[tokio::test]
    async fn failed_persist_keeps_in_memory_change() {
        let registry =
            FileRegistry::with_persistence(PathBuf::from("/nonexistent-dir/registry.json"));
        let result = registry.register_file(file("a.zap", &["c1"], vec![])).await;
        assert!(result.is_err());
        assert!(registry.get_file("a.zap").await.is_some());
    }

    #[tokio::test]
    async fn empty_name_and_chunkless_files_accepted() {
        let registry = FileRegistry::new();
        registry.register_file(file("", &[], vec![])).await.unwrap();
        registry.register_file(file("x", &[], vec![])).await.unwrap();
        assert!(registry.get_file("").await.is_some());
    }
}
