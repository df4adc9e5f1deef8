//! Length-prefixed frames over a byte stream
//!
//! Format: `[4 bytes little-endian length][JSON payload]`.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted payload. Start-of-game frames carry the terrain and stay
/// well under this.
pub const MAX_FRAME_SIZE: usize = 256 * 1024;

const HEADER_LEN: usize = 4;

/// Read exactly `buf.len()` bytes; EOF anywhere means the peer went away
async fn fill<R: AsyncRead + Unpin>(stream: &mut R, buf: &mut [u8]) -> Result<(), FramingError> {
    match stream.read_exact(buf).await {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FramingError::ConnectionClosed),
        Err(e) => Err(FramingError::Io(e)),
    }
}

/// Read one frame's payload
pub async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut header = [0u8; HEADER_LEN];
    fill(stream, &mut header).await?;

    let len = u32::from_le_bytes(header) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(FramingError::TooLarge(len));
    }

    let mut payload = vec![0u8; len];
    fill(stream, &mut payload).await?;
    Ok(payload)
}

/// Write one frame as a single buffer, then flush
pub async fn write_frame<W: AsyncWrite + Unpin>(
    stream: &mut W,
    payload: &[u8],
) -> Result<(), FramingError> {
    if payload.len() > MAX_FRAME_SIZE {
        return Err(FramingError::TooLarge(payload.len()));
    }

    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(payload);

    stream.write_all(&frame).await?;
    stream.flush().await?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Frame of {0} bytes exceeds the {max} byte limit", max = MAX_FRAME_SIZE)]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[tokio::test]
    async fn test_frame_layout() {
        let payload = br#"{"event":"leave"}"#;
        let mut wire = Vec::new();
        write_frame(&mut wire, payload).await.unwrap();

        assert_eq!(wire.len(), HEADER_LEN + payload.len());
        assert_eq!(&wire[..HEADER_LEN], &(payload.len() as u32).to_le_bytes());
        assert_eq!(read_frame(&mut Cursor::new(wire)).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_back_to_back_frames() {
        let mut wire = Vec::new();
        write_frame(&mut wire, b"join").await.unwrap();
        write_frame(&mut wire, b"").await.unwrap();
        write_frame(&mut wire, b"leave").await.unwrap();

        let mut cursor = Cursor::new(wire);
        assert_eq!(read_frame(&mut cursor).await.unwrap(), b"join");
        assert!(read_frame(&mut cursor).await.unwrap().is_empty());
        assert_eq!(read_frame(&mut cursor).await.unwrap(), b"leave");
        assert!(matches!(
            read_frame(&mut cursor).await,
            Err(FramingError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_oversized_frames_rejected() {
        let payload = vec![b'x'; MAX_FRAME_SIZE + 1];
        let mut wire = Vec::new();
        assert!(matches!(
            write_frame(&mut wire, &payload).await,
            Err(FramingError::TooLarge(n)) if n == MAX_FRAME_SIZE + 1
        ));
        assert!(wire.is_empty());

        let header = ((MAX_FRAME_SIZE + 1) as u32).to_le_bytes().to_vec();
        assert!(matches!(
            read_frame(&mut Cursor::new(header)).await,
            Err(FramingError::TooLarge(_))
        ));
    }

    #[tokio::test]
    async fn test_truncation_is_a_close() {
        // Header cut short
        let result = read_frame(&mut Cursor::new(vec![5u8, 0])).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));

        // Payload cut short
        let mut wire = 10u32.to_le_bytes().to_vec();
        wire.extend_from_slice(b"abc");
        let result = read_frame(&mut Cursor::new(wire)).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }
}
