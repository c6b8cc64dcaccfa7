//! Length-prefixed framing over byte pipes.
//!
//! Frame = `u32` big-endian payload length, then the payload. Used in both
//! directions of every worker pipe pair. A clean EOF at a frame boundary is
//! a normal end-of-stream; EOF inside a frame is an error.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame payload. Anything larger is treated as a
/// protocol violation rather than an allocation request.
pub const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// Write one frame and flush it.
pub async fn write_frame<W>(sink: &mut W, payload: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.len() as u64 > MAX_FRAME_LEN as u64 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit {}", payload.len(), MAX_FRAME_LEN),
        ));
    }

    sink.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    sink.write_all(payload).await?;
    sink.flush().await
}

/// Read one frame. Returns `Ok(None)` on end-of-stream.
pub async fn read_frame<R>(source: &mut R) -> io::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match source.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds limit {}", len, MAX_FRAME_LEN),
        ));
    }

    let mut payload = vec![0u8; len as usize];
    source.read_exact(&mut payload).await?;
    Ok(Some(payload))
}
