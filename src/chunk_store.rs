/// Chunk Store Module
///
/// Content-addressed blob store for encrypted chunks. Each chunk lives as
/// one file named by its encrypted hash (hex SHA-256 of the ciphertext)
/// directly under the cache directory, no header, raw bytes.
///
/// Metadata (usage accounting and in-flight reservations) sits behind one
/// RW lock; disk I/O happens outside it so concurrent stores of different
/// hashes proceed in parallel. Writes are atomic: temp file, then rename.
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{ZapError, ZapResult};

/// Smallest admissible chunk (1 KiB)
pub const MIN_CHUNK_SIZE: usize = 1024;
/// Largest admissible chunk (100 MiB)
pub const MAX_CHUNK_SIZE: usize = 100 * 1024 * 1024;

/// Default disk quota for the chunk cache (100 GiB)
pub const DEFAULT_QUOTA_BYTES: u64 = 100 * 1024 * 1024 * 1024;

const TMP_PREFIX: &str = ".tmp-";

/// Hex-encoded SHA-256 of a byte slice, lowercase.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Whether `hash` is a well-formed chunk address (64 lowercase hex chars).
pub fn is_chunk_hash(hash: &str) -> bool {
    hash.len() == 64
        && hash
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

struct StoreState {
    quota: u64,
    usage: u64,
    reserved: u64,
    entries: HashMap<String, u64>,
    in_flight: HashSet<String>,
}

/// On-disk content-addressed chunk store with quota enforcement
pub struct ChunkStore {
    root: PathBuf,
    state: RwLock<StoreState>,
}

impl ChunkStore {
    /// Open (or create) a chunk cache directory and rebuild usage
    /// accounting from the files already present. Stale temp files from an
    /// interrupted write are removed.
    pub fn open(root: impl AsRef<Path>, quota: u64) -> ZapResult<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;

        let mut entries = HashMap::new();
        let mut usage = 0u64;
        for entry in fs::read_dir(&root)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with(TMP_PREFIX) {
                let _ = fs::remove_file(entry.path());
                continue;
            }
            if !is_chunk_hash(&name) {
                warn!(file = %name, "ignoring foreign file in chunk cache");
                continue;
            }
            let size = entry.metadata()?.len();
            usage += size;
            entries.insert(name, size);
        }

        debug!(chunks = entries.len(), usage, "chunk cache opened");
        Ok(Self {
            root,
            state: RwLock::new(StoreState {
                quota,
                usage,
                reserved: 0,
                entries,
                in_flight: HashSet::new(),
            }),
        })
    }

    fn chunk_path(&self, hash: &str) -> PathBuf {
        self.root.join(hash)
    }

    /// Persist a chunk under its encrypted hash.
    ///
    /// Re-storing an existing hash is a no-op; bytes that do not produce
    /// the claimed hash are rejected before touching the quota. The quota
    /// check reserves space up front so parallel stores cannot oversubscribe
    /// the cache.
    pub fn store(&self, hash: &str, data: &[u8]) -> ZapResult<()> {
        if hash.is_empty() {
            return Err(ZapError::InvalidAccess("empty chunk hash".into()));
        }
        let computed = sha256_hex(data);
        if computed != hash {
            return Err(ZapError::HashMismatch(format!(
                "chunk {} does not match its content hash {}",
                hash, computed
            )));
        }

        let len = data.len() as u64;
        {
            let mut state = self.state.write().expect("chunk store lock poisoned");
            if state.entries.contains_key(hash) || state.in_flight.contains(hash) {
                // Identical bytes are guaranteed by the hash check above.
                return Ok(());
            }
            if state.usage + state.reserved + len > state.quota {
                return Err(ZapError::QuotaExceeded(format!(
                    "storing {} bytes would exceed quota of {}",
                    len, state.quota
                )));
            }
            state.reserved += len;
            state.in_flight.insert(hash.to_string());
        }

        let result = self.write_atomic(hash, data);

        let mut state = self.state.write().expect("chunk store lock poisoned");
        state.reserved -= len;
        state.in_flight.remove(hash);
        match result {
            Ok(()) => {
                state.usage += len;
                state.entries.insert(hash.to_string(), len);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn write_atomic(&self, hash: &str, data: &[u8]) -> ZapResult<()> {
        let tmp = self.root.join(format!("{}{}", TMP_PREFIX, hash));
        fs::write(&tmp, data)?;
        if let Err(e) = fs::rename(&tmp, self.chunk_path(hash)) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Read a chunk back by its hash.
    pub fn get(&self, hash: &str) -> ZapResult<Vec<u8>> {
        if hash.is_empty() || !is_chunk_hash(hash) {
            return Err(ZapError::InvalidAccess(format!(
                "malformed chunk hash: {:?}",
                hash
            )));
        }
        {
            let state = self.state.read().expect("chunk store lock poisoned");
            if !state.entries.contains_key(hash) {
                return Err(ZapError::NotFound(format!("chunk {}", hash)));
            }
        }
        fs::read(self.chunk_path(hash)).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ZapError::NotFound(format!("chunk {}", hash)),
            _ => e.into(),
        })
    }

    /// Remove a chunk and its usage accounting.
    pub fn delete(&self, hash: &str) -> ZapResult<()> {
        if hash.is_empty() || !is_chunk_hash(hash) {
            return Err(ZapError::InvalidAccess(format!(
                "malformed chunk hash: {:?}",
                hash
            )));
        }
        let size = {
            let mut state = self.state.write().expect("chunk store lock poisoned");
            match state.entries.remove(hash) {
                Some(size) => {
                    state.usage -= size;
                    size
                }
                None => return Err(ZapError::NotFound(format!("chunk {}", hash))),
            }
        };
        match fs::remove_file(self.chunk_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(hash, size, "chunk file removal failed: {}", e);
                Err(e.into())
            }
        }
    }

    /// Hashes currently stored.
    pub fn list(&self) -> Vec<String> {
        let state = self.state.read().expect("chunk store lock poisoned");
        state.entries.keys().cloned().collect()
    }

    /// Whether a chunk is present locally.
    pub fn contains(&self, hash: &str) -> bool {
        let state = self.state.read().expect("chunk store lock poisoned");
        state.entries.contains_key(hash)
    }

    /// Bytes currently consumed by stored chunks.
    pub fn usage(&self) -> u64 {
        self.state.read().expect("chunk store lock poisoned").usage
    }

    /// Current quota in bytes.
    pub fn quota(&self) -> u64 {
        self.state.read().expect("chunk store lock poisoned").quota
    }

    /// Update the quota. Existing data is never reclaimed; a cap below the
    /// current usage only blocks further stores.
    pub fn set_quota(&self, bytes: u64) {
        self.state.write().expect("chunk store lock poisoned").quota = bytes;
    }
}
