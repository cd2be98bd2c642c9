/// Chunk Transfer Protocol
///
/// Wire codec for `/filezap/chunk/1` on the transport overlay. A request
/// is an 8-byte big-endian length prefix (always 64) followed by the hex
/// encrypted hash in ASCII; the response is an 8-byte big-endian payload
/// length followed by the raw chunk bytes. A zero-length payload means the
/// peer does not hold the chunk.
use async_trait::async_trait;
use futures::{AsyncRead, AsyncWrite};
use libp2p::{request_response, StreamProtocol};
use std::io;

use crate::chunk_store::{is_chunk_hash, MAX_CHUNK_SIZE};
use crate::wire;

/// Protocol id for chunk transfer on the transport host
pub const CHUNK_PROTOCOL: &str = "/filezap/chunk/1";

const HASH_WIRE_LEN: u64 = 64;

/// Request for one chunk by its encrypted hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRequest {
    pub hash: String,
}

/// Chunk payload; empty when the serving peer does not hold the chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkResponse {
    pub data: Vec<u8>,
}

impl ChunkResponse {
    pub fn not_found() -> Self {
        Self { data: Vec::new() }
    }

    pub fn is_not_found(&self) -> bool {
        self.data.is_empty()
    }
}

/// request-response codec producing the exact chunk wire format
#[derive(Debug, Clone, Default)]
pub struct ChunkCodec;

#[async_trait]
impl request_response::Codec for ChunkCodec {
    type Protocol = StreamProtocol;
    type Request = ChunkRequest;
    type Response = ChunkResponse;

    async fn read_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        let payload = wire::read_frame(io, HASH_WIRE_LEN).await?;
        if payload.len() as u64 != HASH_WIRE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("chunk request of {} bytes, expected 64", payload.len()),
            ));
        }
        let hash = String::from_utf8(payload)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "hash is not UTF-8"))?;
        if !is_chunk_hash(&hash) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "hash is not lowercase hex",
            ));
        }
        Ok(ChunkRequest { hash })
    }

    async fn read_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
    ) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        let data = wire::read_frame(io, MAX_CHUNK_SIZE as u64).await?;
        Ok(ChunkResponse { data })
    }

    async fn write_request<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        req: Self::Request,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        wire::write_frame(io, req.hash.as_bytes()).await
    }

    async fn write_response<T>(
        &mut self,
        _: &StreamProtocol,
        io: &mut T,
        rsp: Self::Response,
    ) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        wire::write_frame(io, &rsp.data).await
    }
}
