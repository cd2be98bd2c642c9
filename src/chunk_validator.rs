/// Chunk Validator Module
///
/// Admission control for inbound storage requests. Checks run in order:
/// size bounds, content hash, then the optional owner signature over the
/// chunk hash. The first failure wins and is reported back to the
/// requester as a `Reject` with the reason.
use libp2p::identity::PublicKey;
use serde::{Deserialize, Serialize};

use crate::chunk_store::{sha256_hex, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use crate::error::RejectReason;

/// A request to store one chunk locally
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageRequest {
    pub chunk_hash: String,
    pub data: Vec<u8>,
    pub size: i64,
    pub owner_peer_id: String,
    /// Owner's signature over the hex chunk hash bytes
    #[serde(default)]
    pub signature: Option<Vec<u8>>,
}

/// Rejection sent back to the requester
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RejectMessage {
    pub chunk_hash: String,
    pub reason: RejectReason,
}

/// Size- and integrity-checks a `StorageRequest` before it reaches the store
#[derive(Debug, Clone)]
pub struct ChunkValidator {
    min_size: usize,
    max_size: usize,
}

impl Default for ChunkValidator {
    fn default() -> Self {
        Self {
            min_size: MIN_CHUNK_SIZE,
            max_size: MAX_CHUNK_SIZE,
        }
    }
}

impl ChunkValidator {
    pub fn new(min_size: usize, max_size: usize) -> Self {
        Self { min_size, max_size }
    }

    /// Run the admission checks. `owner_key` is the advertised public key
    /// of `owner_peer_id`, if this node has learned it; a signature
    /// without a verifiable key is refused.
    pub fn validate(
        &self,
        request: &StorageRequest,
        owner_key: Option<&PublicKey>,
    ) -> Result<(), RejectMessage> {
        let reject = |reason| RejectMessage {
            chunk_hash: request.chunk_hash.clone(),
            reason,
        };

        if request.data.len() < self.min_size
            || request.data.len() > self.max_size
            || request.size != request.data.len() as i64
        {
            return Err(reject(RejectReason::InvalidSize));
        }

        if sha256_hex(&request.data) != request.chunk_hash {
            return Err(reject(RejectReason::InvalidHash));
        }

        if let Some(signature) = &request.signature {
            match owner_key {
                Some(key) if key.verify(request.chunk_hash.as_bytes(), signature) => {}
                _ => return Err(reject(RejectReason::InvalidSignature)),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use libp2p::identity::Keypair;

    fn request_for(data: Vec<u8>) -> StorageRequest {
        StorageRequest {
            chunk_hash: sha256_hex(&data),
            size: data.len() as i64,
            data,
            owner_peer_id: "owner".into(),
            signature: None,
        }
    }

    #[test]
    fn boundary_sizes() {
        let validator = ChunkValidator::default();
        assert!(validator.validate(&request_for(vec![0u8; MIN_CHUNK_SIZE]), None).is_ok());
        let under = validator
            .validate(&request_for(vec![0u8; MIN_CHUNK_SIZE - 1]), None)
            .unwrap_err();
        assert_eq!(under.reason, RejectReason::InvalidSize);

        // Exercise the upper boundary with a small validator so the test
        // does not allocate 100 MiB.
        let validator = ChunkValidator::new(MIN_CHUNK_SIZE, 4096);
        assert!(validator.validate(&request_for(vec![0u8; 4096]), None).is_ok());
        let over = validator
            .validate(&request_for(vec![0u8; 4097]), None)
            .unwrap_err();
        assert_eq!(over.reason, RejectReason::InvalidSize);
    }

    #[test]
    fn declared_size_must_match_payload() {
        let validator = ChunkValidator::default();
        let mut request = request_for(vec![1u8; 2048]);
        request.size = 2047;
        assert_eq!(
            validator.validate(&request, None).unwrap_err().reason,
            RejectReason::InvalidSize
        );
    }

    #[test]
    fn tampered_payload_fails_hash_check() {
        let validator = ChunkValidator::default();
        let mut request = request_for(vec![1u8; 2048]);
        request.data[0] ^= 0xFF;
        assert_eq!(
            validator.validate(&request, None).unwrap_err().reason,
            RejectReason::InvalidHash
        );
    }

    #[test]
    fn signature_verified_against_owner_key() {
        let validator = ChunkValidator::default();
        let owner = Keypair::generate_ed25519();
        let mut request = request_for(vec![5u8; 2048]);
        request.signature = Some(owner.sign(request.chunk_hash.as_bytes()).unwrap());

        assert!(validator.validate(&request, Some(&owner.public())).is_ok());

        let stranger = Keypair::generate_ed25519();
        assert_eq!(
            validator
                .validate(&request, Some(&stranger.public()))
                .unwrap_err()
                .reason,
            RejectReason::InvalidSignature
        );
        // A signature with no advertised key cannot be verified.
        assert_eq!(
            validator.validate(&request, None).unwrap_err().reason,
            RejectReason::InvalidSignature
        );
    }

    #[test]
    fn unsigned_request_skips_signature_check() {
        let validator = ChunkValidator::default();
        assert!(validator.validate(&request_for(vec![9u8; 2048]), None).is_ok());
    }
}
