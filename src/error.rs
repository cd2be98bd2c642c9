use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;

/// Reason a storage request was refused by the chunk validator.
///
/// The reason travels back to the requester inside a `Reject` message,
/// so it is serializable and stable on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// Chunk size outside `[MIN_CHUNK, MAX_CHUNK]`.
    InvalidSize,
    /// SHA-256 of the payload does not match the declared chunk hash.
    InvalidHash,
    /// Owner signature over the chunk hash failed verification.
    InvalidSignature,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectReason::InvalidSize => write!(f, "invalid chunk size"),
            RejectReason::InvalidHash => write!(f, "chunk hash mismatch"),
            RejectReason::InvalidSignature => write!(f, "invalid owner signature"),
        }
    }
}

/// Error types for the FileZap network core.
///
/// Each variant maps to one category of the failure taxonomy: transient
/// peer errors surface as `Network` or `RequestFailed`, admission failures
/// as `Validation`, resource exhaustion as `QuotaExceeded`, malformed
/// traffic as `FrameTooLarge`/`Protocol`, and construction failures as
/// `Config`/`Io`.
#[derive(Debug)]
pub enum ZapError {
    /// File system operation failures (chunk cache, registry, identity).
    Io(String),
    /// libp2p, DHT, or pubsub failures.
    Network(String),
    /// JSON/TOML encode or decode failures.
    Serialization(String),
    /// Invalid or missing configuration.
    Config(String),
    /// Storing would exceed the configured disk quota.
    QuotaExceeded(String),
    /// Empty or malformed chunk address.
    InvalidAccess(String),
    /// Bytes stored or received under a hash do not produce that hash.
    HashMismatch(String),
    /// Chunk, manifest, file, or peer lookup failure.
    NotFound(String),
    /// Manifest name has no DHT record.
    ManifestUnknown(String),
    /// Overlay frame exceeds the 16 MiB cap.
    FrameTooLarge(usize),
    /// Overlay request failed: stream error, timeout, or cancellation.
    RequestFailed(String),
    /// No bootstrap peer could be reached.
    BootstrapFailed(String),
    /// Chunk admission refused by the validator.
    Validation(RejectReason),
    /// Malformed frame or unknown message type on a peer stream.
    Protocol(String),
}

impl fmt::Display for ZapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZapError::Io(e) => write!(f, "IO error: {}", e),
            ZapError::Network(e) => write!(f, "Network error: {}", e),
            ZapError::Serialization(e) => write!(f, "Serialization error: {}", e),
            ZapError::Config(e) => write!(f, "Configuration error: {}", e),
            ZapError::QuotaExceeded(e) => write!(f, "Quota exceeded: {}", e),
            ZapError::InvalidAccess(e) => write!(f, "Invalid access: {}", e),
            ZapError::HashMismatch(e) => write!(f, "Hash mismatch: {}", e),
            ZapError::NotFound(e) => write!(f, "Not found: {}", e),
            ZapError::ManifestUnknown(e) => write!(f, "Unknown manifest: {}", e),
            ZapError::FrameTooLarge(n) => write!(f, "Frame too large: {} bytes", n),
            ZapError::RequestFailed(e) => write!(f, "Request failed: {}", e),
            ZapError::BootstrapFailed(e) => write!(f, "Bootstrap failed: {}", e),
            ZapError::Validation(r) => write!(f, "Validation failed: {}", r),
            ZapError::Protocol(e) => write!(f, "Protocol error: {}", e),
        }
    }
}

impl StdError for ZapError {}

impl From<std::io::Error> for ZapError {
    fn from(error: std::io::Error) -> Self {
        ZapError::Io(error.to_string())
    }
}

impl From<serde_json::Error> for ZapError {
    fn from(error: serde_json::Error) -> Self {
        ZapError::Serialization(error.to_string())
    }
}

impl From<hex::FromHexError> for ZapError {
    fn from(error: hex::FromHexError) -> Self {
        ZapError::Serialization(format!("Hex decode error: {}", error))
    }
}

impl From<libp2p::kad::store::Error> for ZapError {
    fn from(error: libp2p::kad::store::Error) -> Self {
        ZapError::Network(format!("Kademlia store error: {:?}", error))
    }
}

impl ZapError {
    /// Whether the caller may retry the failed operation.
    ///
    /// Only transient peer errors are retryable; validation, quota, and
    /// protocol failures are final.
    pub fn is_transient(&self) -> bool {
        matches!(self, ZapError::Network(_) | ZapError::RequestFailed(_))
    }
}

/// Result type alias for network core operations
pub type ZapResult<T> = Result<T, ZapError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ZapError::Network("reset".into()).is_transient());
        assert!(ZapError::RequestFailed("timeout".into()).is_transient());
        assert!(!ZapError::Validation(RejectReason::InvalidHash).is_transient());
        assert!(!ZapError::QuotaExceeded("full".into()).is_transient());
    }

    #[test]
    fn reject_reason_round_trip() {
        let encoded = serde_json::to_string(&RejectReason::InvalidSignature).unwrap();
        let decoded: RejectReason = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, RejectReason::InvalidSignature);
    }
}
