//! Length-prefixed framing for stream transports, which have no message
//! boundaries of their own. Payloads are opaque here; the encoding decides
//! what they contain.

use crate::FrameError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

/// Maximum frame size (10MB for safety)
pub const MAX_FRAME_SIZE: u32 = 10 * 1024 * 1024;

/// Default maximum frame size for most deployments (1MB)
pub const DEFAULT_MAX_FRAME_SIZE: u32 = 1024 * 1024;

const LENGTH_PREFIX: usize = 4;

/// Reads one length-prefixed payload from an async reader
pub async fn read_frame<R>(reader: &mut R, max_frame_size: u32) -> Result<Vec<u8>, FrameError>
where
    R: AsyncRead + Unpin,
{
    let length = reader.read_u32().await?;

    if length > max_frame_size {
        warn!("Received oversized frame: {} bytes (max: {})", length, max_frame_size);
        return Err(FrameError::FrameTooLarge(length, max_frame_size));
    }

    let mut payload = vec![0u8; length as usize];
    reader.read_exact(&mut payload).await?;
    debug!("Read frame of {} bytes", length);

    Ok(payload)
}

/// Writes one length-prefixed payload to an async writer and flushes it
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let length = frame_length(payload)?;
    debug!("Writing frame of {} bytes", length);

    writer.write_u32(length).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;

    Ok(())
}

fn frame_length(payload: &[u8]) -> Result<u32, FrameError> {
    match u32::try_from(payload.len()) {
        Ok(length) if length <= MAX_FRAME_SIZE => Ok(length),
        _ => Err(FrameError::FrameTooLarge(
            u32::try_from(payload.len()).unwrap_or(u32::MAX),
            MAX_FRAME_SIZE,
        )),
    }
}

/// Codec for use with tokio_util::codec::Framed
pub struct FrameCodec {
    max_frame_size: u32,
}

impl FrameCodec {
    pub fn new(max_frame_size: u32) -> Self {
        Self { max_frame_size }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl tokio_util::codec::Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, FrameError> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }

        // Peek at length without consuming
        let mut length_bytes = [0u8; LENGTH_PREFIX];
        length_bytes.copy_from_slice(&src[..LENGTH_PREFIX]);
        let length = u32::from_be_bytes(length_bytes);

        if length > self.max_frame_size {
            warn!("Received oversized frame: {} bytes (max: {})", length, self.max_frame_size);
            return Err(FrameError::FrameTooLarge(length, self.max_frame_size));
        }

        let frame_size = LENGTH_PREFIX + length as usize;
        if src.len() < frame_size {
            src.reserve(frame_size - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let payload = src.split_to(length as usize).freeze();
        debug!("Decoded frame of {} bytes", length);

        Ok(Some(payload))
    }
}

impl tokio_util::codec::Encoder<Vec<u8>> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), FrameError> {
        let length = frame_length(&item)?;

        dst.reserve(LENGTH_PREFIX + item.len());
        dst.put_u32(length);
        dst.put_slice(&item);

        Ok(())
    }
}
