//! Length-prefixed frame encoding/decoding
//!
//! Wire format: [4-byte big-endian length][JSON payload]
//! Maximum frame size: 1MB (sanity limit)

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};

/// Maximum allowed frame size (1MB)
pub const MAX_FRAME_SIZE: u32 = 1024 * 1024;

fn closed_or_io(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}

/// Read one frame's raw payload
///
/// Callers that want to answer malformed JSON without dropping the
/// connection decode the payload themselves.
pub async fn read_payload<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await.map_err(closed_or_io)?;

    let len = u32::from_be_bytes(len_buf);
    if len == 0 {
        return Err(Error::Protocol("Empty frame".into()));
    }
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "Frame too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).await.map_err(closed_or_io)?;
    Ok(payload)
}

/// Read a length-prefixed frame and decode it
pub async fn read_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let payload = read_payload(reader).await?;
    serde_json::from_slice(&payload).map_err(|e| Error::Protocol(format!("Invalid JSON: {}", e)))
}

/// Write a length-prefixed frame to a stream
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let payload = serde_json::to_vec(msg)
        .map_err(|e| Error::Protocol(format!("Serialization failed: {}", e)))?;

    let len = payload.len() as u32;
    if payload.len() > MAX_FRAME_SIZE as usize {
        return Err(Error::Protocol(format!(
            "Message too large: {} bytes (max {})",
            len, MAX_FRAME_SIZE
        )));
    }

    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientEvent, ServerEvent};
    use std::io::Cursor;

    #[tokio::test]
    async fn test_frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &ServerEvent::Pong {}).await.unwrap();
        assert_eq!(&buf[..4], &(buf.len() as u32 - 4).to_be_bytes());

        let mut cursor = Cursor::new(buf);
        let decoded: ServerEvent = read_frame(&mut cursor).await.unwrap();
        assert!(matches!(decoded, ServerEvent::Pong {}));
    }

    #[tokio::test]
    async fn test_empty_frame_rejected() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 0]);
        let result = read_payload(&mut cursor).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let len = (MAX_FRAME_SIZE + 1).to_be_bytes();
        let mut cursor = Cursor::new(len.to_vec());
        let result = read_payload(&mut cursor).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }

    #[tokio::test]
    async fn test_truncated_frame_is_closed() {
        let mut cursor = Cursor::new(vec![0, 0, 0, 10, b'{']);
        let result = read_payload(&mut cursor).await;
        assert!(matches!(result, Err(Error::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_bad_json_is_protocol_error() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&3u32.to_be_bytes());
        buf.extend_from_slice(b"{x}");
        let result: Result<ClientEvent> = read_frame(&mut Cursor::new(buf)).await;
        assert!(matches!(result, Err(Error::Protocol(_))));
    }
}
