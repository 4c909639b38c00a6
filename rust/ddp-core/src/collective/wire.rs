//! Frames exchanged between ranks.
//!
//! On a socket each frame is `u32 BE length | bincode(Frame)`. The in-process
//! transport moves `Frame` values directly.

use std::io;

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use super::CollectiveKind;

/// Upper bound on a single encoded frame.
pub(crate) const MAX_FRAME_LEN: usize = 512 * 1024 * 1024; // 512 MB

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) enum Frame {
    Hello {
        rank: usize,
        world_size: usize,
        host_id: String,
    },
    Welcome {
        world_size: usize,
    },
    Reject {
        reason: String,
    },
    Gather {
        seq: u64,
        kind: CollectiveKind,
        payload: Vec<u8>,
    },
    Gathered {
        seq: u64,
        kind: CollectiveKind,
        payloads: Vec<Vec<u8>>,
    },
    Broadcast {
        seq: u64,
        src: usize,
        payload: Vec<u8>,
    },
    Abort {
        reason: String,
    },
    Leave {
        rank: usize,
    },
}

impl Frame {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Frame::Hello { .. } => "hello",
            Frame::Welcome { .. } => "welcome",
            Frame::Reject { .. } => "reject",
            Frame::Gather { .. } => "gather",
            Frame::Gathered { .. } => "gathered",
            Frame::Broadcast { .. } => "broadcast",
            Frame::Abort { .. } => "abort",
            Frame::Leave { .. } => "leave",
        }
    }
}

/// Encodes a frame with its length prefix.
pub(crate) fn encode(frame: &Frame) -> io::Result<Vec<u8>> {
    let body = bincode::serialize(frame)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    if body.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("frame of {} bytes exceeds limit of {MAX_FRAME_LEN}", body.len()),
        ));
    }

    let mut buf = Vec::with_capacity(4 + body.len());
    buf.extend_from_slice(&(body.len() as u32).to_be_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Writes pre-encoded frame bytes.
pub(crate) async fn write_encoded<W>(writer: &mut W, bytes: &[u8]) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    writer.write_all(bytes).await?;
    writer.flush().await
}

pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame) -> io::Result<()>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let bytes = encode(frame)?;
    write_encoded(writer, &bytes).await
}

/// Reads one frame. Returns `None` on a clean end of stream.
pub(crate) async fn read_frame<R>(reader: &mut R) -> io::Result<Option<Frame>>
where
    R: tokio::io::AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame length {len} exceeds limit of {MAX_FRAME_LEN}"),
        ));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    bincode::deserialize(&body)
        .map(Some)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}
