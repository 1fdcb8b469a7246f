//! Message framing for length-prefixed protocol
//!
//! Format: [4 bytes little-endian length][payload]

use std::io;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::game::constants::net::MAX_MESSAGE_SIZE;
use crate::net::protocol::{decode, encode, DecodeError, EncodeError};

/// Errors that can occur during message framing
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Message too large: {0} bytes (max {1})")]
    MessageTooLarge(usize, usize),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
}

/// Read one length-prefixed payload
pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Result<Vec<u8>, FramingError> {
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(FramingError::ConnectionClosed);
        }
        Err(e) => return Err(FramingError::Io(e)),
    }

    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(len, MAX_MESSAGE_SIZE));
    }
    if len == 0 {
        return Ok(Vec::new());
    }

    let mut buf = vec![0u8; len];
    match stream.read_exact(&mut buf).await {
        Ok(_) => Ok(buf),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(FramingError::ConnectionClosed),
        Err(e) => Err(FramingError::Io(e)),
    }
}

/// Write one length-prefixed payload and flush
pub async fn write_message<W: AsyncWrite + Unpin>(
    stream: &mut W,
    data: &[u8],
) -> Result<(), FramingError> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(FramingError::MessageTooLarge(data.len(), MAX_MESSAGE_SIZE));
    }

    let len_bytes = (data.len() as u32).to_le_bytes();
    stream.write_all(&len_bytes).await?;
    stream.write_all(data).await?;
    stream.flush().await?;
    Ok(())
}

/// Read and decode one typed message. Also returns the payload size.
pub async fn read_typed<T, R>(stream: &mut R) -> Result<(T, usize), FramingError>
where
    T: for<'de> serde::Deserialize<'de>,
    R: AsyncRead + Unpin,
{
    let bytes = read_message(stream).await?;
    let message = decode(&bytes)?;
    Ok((message, bytes.len()))
}

/// Encode and write one typed message
pub async fn write_typed<T, W>(stream: &mut W, message: &T) -> Result<usize, FramingError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let bytes = encode(message)?;
    write_message(stream, &bytes).await?;
    Ok(bytes.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::protocol::ClientMessage;
    use std::io::Cursor;
    use tokio_test::io::Builder;

    #[tokio::test]
    async fn test_read_from_mock_stream() {
        let mut stream = Builder::new()
            .read(&5u32.to_le_bytes())
            .read(b"hello")
            .build();

        let result = read_message(&mut stream).await.unwrap();
        assert_eq!(result, b"hello");
    }

    #[tokio::test]
    async fn test_read_split_payload() {
        // Payload arrives in two TCP segments
        let mut stream = Builder::new()
            .read(&6u32.to_le_bytes())
            .read(b"tile")
            .read(b"!!")
            .build();

        let result = read_message(&mut stream).await.unwrap();
        assert_eq!(result, b"tile!!");
    }

    #[tokio::test]
    async fn test_write_to_mock_stream() {
        let mut stream = Builder::new()
            .write(&3u32.to_le_bytes())
            .write(b"abc")
            .build();

        write_message(&mut stream, b"abc").await.unwrap();
    }

    #[tokio::test]
    async fn test_empty_message() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, b"").await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let result = read_message(&mut cursor).await.unwrap();
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let large_data = vec![0u8; MAX_MESSAGE_SIZE + 1];
        let mut buffer = Vec::new();

        let result = write_message(&mut buffer, &large_data).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(_, _))));
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_rejected() {
        let prefix = ((MAX_MESSAGE_SIZE + 1) as u32).to_le_bytes();
        let mut stream = Builder::new().read(&prefix).build();

        let result = read_message(&mut stream).await;
        assert!(matches!(result, Err(FramingError::MessageTooLarge(_, _))));
    }

    #[tokio::test]
    async fn test_read_truncated_length() {
        let mut cursor = Cursor::new(vec![0u8; 2]);
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_truncated_payload() {
        let mut buffer = Vec::new();
        buffer.extend_from_slice(&10u32.to_le_bytes());
        buffer.extend_from_slice(&[1, 2, 3]);

        let mut cursor = Cursor::new(buffer);
        let result = read_message(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_typed_messages_in_sequence() {
        let messages = vec![
            ClientMessage::Heartbeat { tick: 1 },
            ClientMessage::Heartbeat { tick: 2 },
            ClientMessage::Disconnect,
        ];

        let mut buffer = Vec::new();
        for msg in &messages {
            write_typed(&mut buffer, msg).await.unwrap();
        }

        let mut cursor = Cursor::new(buffer);
        for expected in &messages {
            let (result, _) = read_typed::<ClientMessage, _>(&mut cursor).await.unwrap();
            assert_eq!(&result, expected);
        }
        assert!(matches!(
            read_typed::<ClientMessage, _>(&mut cursor).await,
            Err(FramingError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_typed_decode_failure() {
        let mut buffer = Vec::new();
        write_message(&mut buffer, &[0xEE; 3]).await.unwrap();

        let mut cursor = Cursor::new(buffer);
        let result = read_typed::<ClientMessage, _>(&mut cursor).await;
        assert!(matches!(result, Err(FramingError::Decode(_))));
    }
}
