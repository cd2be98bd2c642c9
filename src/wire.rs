/// Length-prefixed framing shared by the peer stream protocols.
///
/// Every frame is an 8-byte big-endian length followed by exactly that many
/// payload bytes. The caller supplies the per-protocol cap; a frame whose
/// declared length exceeds it is refused before any payload is read.
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use std::io;

/// Read one 8-byte big-endian length prefix.
pub async fn read_len<T>(io: &mut T) -> io::Result<u64>
where
    T: AsyncRead + Unpin + Send,
{
    let mut prefix = [0u8; 8];
    io.read_exact(&mut prefix).await?;
    Ok(u64::from_be_bytes(prefix))
}

/// Read a complete frame, enforcing `max_len` against the declared length.
pub async fn read_frame<T>(io: &mut T, max_len: u64) -> io::Result<Vec<u8>>
where
    T: AsyncRead + Unpin + Send,
{
    let len = read_len(io).await?;
    if len > max_len {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds cap of {}", len, max_len),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    io.read_exact(&mut payload).await?;
    Ok(payload)
}

/// Write one frame: 8-byte big-endian length, then the payload.
pub async fn write_frame<T>(io: &mut T, payload: &[u8]) -> io::Result<()>
where
    T: AsyncWrite + Unpin + Send,
{
    io.write_all(&(payload.len() as u64).to_be_bytes()).await?;
    io.write_all(payload).await?;
    Ok(())
}
