/// Zap Codec Module
///
/// Pure codec between a plaintext file and its `{manifest, chunks}`
/// form. A file is cut into fixed-size chunks, each chunk encrypted with
/// AES-256-GCM (random 12-byte nonce prepended to the ciphertext), and
/// described by a `.zap` manifest: plain hash, size, and encrypted hash
/// per chunk. The encrypted hash is the chunk's network address.
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::chunk_store::{is_chunk_hash, sha256_hex};
use crate::error::{ZapError, ZapResult};

/// AES-GCM nonce length prepended to each ciphertext
pub const NONCE_LEN: usize = 12;

/// Per-chunk entry of a `.zap` manifest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChunkMetadata {
    pub index: u32,
    /// SHA-256 of the plaintext chunk
    pub hash: String,
    /// Plaintext size in bytes
    pub size: i64,
    /// SHA-256 of the ciphertext; the chunk's network address
    pub encrypted_hash: String,
}

/// On-disk `.zap` manifest (JSON, UTF-8)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ZapManifest {
    pub id: String,
    pub original_name: String,
    pub chunk_count: u32,
    pub total_size: i64,
    /// Hex key; omitted for publicly readable files
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
    pub chunks: Vec<ChunkMetadata>,
}

impl ZapManifest {
    /// Enforce the manifest invariants: `chunk_count == chunks.len()`,
    /// indices form `0..N-1` exactly once, hashes lowercase hex.
    pub fn validate(&self) -> ZapResult<()> {
        if self.chunk_count as usize != self.chunks.len() {
            return Err(ZapError::Serialization(format!(
                "manifest {:?}: chunk_count {} but {} chunks listed",
                self.original_name,
                self.chunk_count,
                self.chunks.len()
            )));
        }
        let mut seen = vec![false; self.chunks.len()];
        for chunk in &self.chunks {
            let idx = chunk.index as usize;
            if idx >= seen.len() || seen[idx] {
                return Err(ZapError::Serialization(format!(
                    "manifest {:?}: chunk index {} missing or duplicated",
                    self.original_name, chunk.index
                )));
            }
            seen[idx] = true;
            if !is_chunk_hash(&chunk.hash) || !is_chunk_hash(&chunk.encrypted_hash) {
                return Err(ZapError::Serialization(format!(
                    "manifest {:?}: malformed hash at index {}",
                    self.original_name, chunk.index
                )));
            }
        }
        Ok(())
    }
}

fn cipher_for(key: &[u8; 32]) -> ZapResult<Aes256Gcm> {
    Aes256Gcm::new_from_slice(key)
        .map_err(|e| ZapError::Serialization(format!("bad encryption key: {}", e)))
}

/// Encrypt one chunk: random nonce, prepended to the ciphertext.
pub fn encrypt_chunk(plaintext: &[u8], key: &[u8; 32]) -> ZapResult<Vec<u8>> {
    let cipher = cipher_for(key)?;
    let nonce_bytes: [u8; NONCE_LEN] = rand::random();
    let nonce = Nonce::from_slice(&nonce_bytes);
    let ciphertext = cipher
        .encrypt(nonce, plaintext)
        .map_err(|e| ZapError::Serialization(format!("encryption failed: {}", e)))?;
    let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Invert `encrypt_chunk`.
pub fn decrypt_chunk(data: &[u8], key: &[u8; 32]) -> ZapResult<Vec<u8>> {
    if data.len() < NONCE_LEN {
        return Err(ZapError::HashMismatch("ciphertext shorter than nonce".into()));
    }
    let cipher = cipher_for(key)?;
    let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
        .map_err(|_| ZapError::HashMismatch("chunk failed authenticated decryption".into()))
}

/// Split a file into encrypted chunks and the manifest describing them.
pub fn split(
    data: &[u8],
    original_name: &str,
    chunk_size: usize,
    key: &[u8; 32],
) -> ZapResult<(ZapManifest, Vec<Vec<u8>>)> {
    if chunk_size == 0 {
        return Err(ZapError::InvalidAccess("chunk size must be positive".into()));
    }
    if data.is_empty() {
        return Err(ZapError::InvalidAccess("cannot split an empty file".into()));
    }

    let mut chunks = Vec::new();
    let mut encrypted = Vec::new();
    for (index, plain) in data.chunks(chunk_size).enumerate() {
        let ciphertext = encrypt_chunk(plain, key)?;
        chunks.push(ChunkMetadata {
            index: index as u32,
            hash: sha256_hex(plain),
            size: plain.len() as i64,
            encrypted_hash: sha256_hex(&ciphertext),
        });
        encrypted.push(ciphertext);
    }

    let manifest = ZapManifest {
        id: hex::encode(&Sha256::digest(data)[..16]),
        original_name: original_name.to_string(),
        chunk_count: chunks.len() as u32,
        total_size: data.len() as i64,
        encryption_key: Some(hex::encode(key)),
        chunks,
    };
    Ok((manifest, encrypted))
}

/// Rebuild the original file from its encrypted chunks.
///
/// `encrypted` is ordered as `manifest.chunks`; every chunk is checked
/// against both its encrypted and plaintext hashes before the pieces are
/// joined in index order.
pub fn reassemble(
    manifest: &ZapManifest,
    encrypted: &[Vec<u8>],
    key: &[u8; 32],
) -> ZapResult<Vec<u8>> {
    manifest.validate()?;
    if encrypted.len() != manifest.chunks.len() {
        return Err(ZapError::NotFound(format!(
            "expected {} chunks, got {}",
            manifest.chunks.len(),
            encrypted.len()
        )));
    }

    let mut pieces: Vec<Option<Vec<u8>>> = vec![None; manifest.chunks.len()];
    for (meta, ciphertext) in manifest.chunks.iter().zip(encrypted) {
        if sha256_hex(ciphertext) != meta.encrypted_hash {
            return Err(ZapError::HashMismatch(format!(
                "chunk {} ciphertext does not match its encrypted hash",
                meta.index
            )));
        }
        let plain = decrypt_chunk(ciphertext, key)?;
        if plain.len() as i64 != meta.size || sha256_hex(&plain) != meta.hash {
            return Err(ZapError::HashMismatch(format!(
                "chunk {} plaintext does not match the manifest",
                meta.index
            )));
        }
        pieces[meta.index as usize] = Some(plain);
    }

    let mut out = Vec::with_capacity(manifest.total_size as usize);
    for piece in pieces {
        // validate() guarantees every index is filled exactly once.
        out.extend_from_slice(&piece.unwrap_or_default());
    }
    if out.len() as i64 != manifest.total_size {
        return Err(ZapError::HashMismatch(format!(
            "reassembled {} bytes, manifest declares {}",
            out.len(),
            manifest.total_size
        )));
    }
    Ok(out)
}

/// Write a manifest as pretty JSON.
pub fn write_manifest(manifest: &ZapManifest, path: impl AsRef<Path>) -> ZapResult<()> {
    manifest.validate()?;
    let json = serde_json::to_string_pretty(manifest)?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Read and validate a manifest file.
pub fn read_manifest(path: impl AsRef<Path>) -> ZapResult<ZapManifest> {
    let text = std::fs::read_to_string(path)?;
    let manifest: ZapManifest = serde_json::from_str(&text)?;
    manifest.validate()?;
    Ok(manifest)
}
