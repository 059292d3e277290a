//! Length-prefixed framing for stream sockets
//!
//! Format: `[u32 little-endian length][payload]`, payload capped at
//! `MAX_MESSAGE_SIZE`.

use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::game::constants::net::MAX_MESSAGE_SIZE;

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn map_eof(e: io::Error) -> FramingError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FramingError::ConnectionClosed
    } else {
        FramingError::Io(e)
    }
}

/// Read one frame. A clean or mid-frame EOF is `ConnectionClosed`.
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await.map_err(map_eof)?;

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await.map_err(map_eof)?;
    Ok(buf)
}

/// Write one frame and flush
pub async fn write_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), FramingError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    stream.write_all(&(data.len() as u32).to_le_bytes()).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}
