//! Framing: length-prefix (4 bytes LE) + bincode envelope.

use crate::message::Envelope;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const LEN_SIZE: usize = 4;

/// Largest accepted frame body
pub const MAX_FRAME_LEN: u32 = 10 * 1024 * 1024; // 10 MiB

/// Framing errors
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Body could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),

    /// Length prefix exceeds `MAX_FRAME_LEN`
    #[error("frame too large: {0} bytes")]
    TooLarge(usize),

    /// Socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Encode an envelope into a single frame
pub fn encode_frame(envelope: &Envelope) -> Result<Vec<u8>, FrameError> {
    let body = bincode::serialize(envelope)?;
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge(body.len()));
    }
    let mut out = Vec::with_capacity(LEN_SIZE + body.len());
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Write one framed envelope and flush
pub async fn write_envelope<W>(writer: &mut W, envelope: &Envelope) -> Result<usize, FrameError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(envelope)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(frame.len())
}

/// Read one framed envelope.
///
/// Returns `Ok(None)` on a clean end of stream before a new frame starts.
pub async fn read_envelope<R>(reader: &mut R) -> Result<Option<(Envelope, usize)>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; LEN_SIZE];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameError::TooLarge(len));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let envelope = bincode::deserialize(&body)?;
    Ok(Some((envelope, LEN_SIZE + len)))
}
