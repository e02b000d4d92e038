//! Length-prefixed JSON framing.
//!
//! Every record on the wire is a little-endian `u32` payload length
//! followed by exactly that many bytes of UTF-8 JSON. The codec moves
//! whole frames; it never looks at the JSON inside them.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

/// Upper bound on a single frame payload. Anything larger is treated as
/// a corrupt stream rather than an allocation request.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("peer closed the connection")]
    PeerClosed,
    #[error("operation canceled")]
    Canceled,
    #[error("frame length {0} exceeds maximum {MAX_FRAME_LEN}")]
    TooLarge(usize),
    #[error("frame payload is not valid UTF-8")]
    Utf8,
    #[error("stream error: {0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::UnexpectedEof {
            FrameError::PeerClosed
        } else {
            FrameError::Io(err)
        }
    }
}

/// Read one frame. Reads exactly 4 header bytes, then exactly `len`
/// payload bytes; partial reads loop until satisfied. A clean EOF at a
/// frame boundary and a zero-byte read mid-frame both surface as
/// [`FrameError::PeerClosed`].
pub async fn read_frame<S>(
    stream: &mut S,
    cancel: &CancellationToken,
) -> Result<String, FrameError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    read_exact(stream, &mut header, cancel).await?;
    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(len));
    }
    let mut payload = vec![0u8; len];
    read_exact(stream, &mut payload, cancel).await?;
    String::from_utf8(payload).map_err(|_| FrameError::Utf8)
}

/// Write one frame: header then payload. Callers serialize writers on a
/// stream (the engine holds a per-connection write lock), so a frame is
/// never interleaved with another.
pub async fn write_frame<S>(
    stream: &mut S,
    payload: &[u8],
    cancel: &CancellationToken,
) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge(payload.len()));
    }
    let header = (payload.len() as u32).to_le_bytes();
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FrameError::Canceled),
        result = async {
            stream.write_all(&header).await?;
            stream.write_all(payload).await?;
            stream.flush().await?;
            Ok(())
        } => result,
    }
}

async fn read_exact<S>(
    stream: &mut S,
    buf: &mut [u8],
    cancel: &CancellationToken,
) -> Result<(), FrameError>
where
    S: AsyncRead + Unpin,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(FrameError::Canceled),
        result = stream.read_exact(buf) => {
            result?;
            Ok(())
        }
    }
}
