//! Wire messages of the command dispatcher.

use crate::error::{NetworkError, Result};
use crate::expiration::SchedulerCommand;
use crate::types::NodeId;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Network message wrapper for all communication.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Command for a service on the receiving node.
    Command(CommandRequest),

    /// Response to a command.
    Response(CommandResponse),
}

/// Command addressed to a service on a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandRequest {
    /// Unique request ID for correlation.
    pub request_id: u64,

    /// Service the command is for, the bean name.
    pub service: String,

    /// Node expected to handle the command.
    pub target: NodeId,

    pub command: SchedulerCommand,
}

/// Response to a command request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// The request ID this is responding to.
    pub request_id: u64,

    /// Whether the handler succeeded.
    pub success: bool,

    /// Error message if failed.
    pub error: Option<String>,
}

impl CommandResponse {
    pub fn success(request_id: u64) -> Self {
        Self {
            request_id,
            success: true,
            error: None,
        }
    }

    pub fn error(request_id: u64, error: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            error: Some(error.into()),
        }
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    bincode::serialize(msg)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> std::result::Result<Message, bincode::Error> {
    bincode::deserialize(data)
}

/// Frame a message with length prefix for TCP transmission.
pub fn frame_message(msg: &Message) -> std::result::Result<Vec<u8>, bincode::Error> {
    let data = encode_message(msg)?;
    let len = data.len() as u32;

    let mut framed = Vec::with_capacity(4 + data.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(&data);

    Ok(framed)
}

/// Read one framed message. Returns `None` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(NetworkError::ReceiveFailed(format!("frame of {len} bytes too large")).into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    let msg = decode_message(&data).map_err(|e| NetworkError::Serialization(e.to_string()))?;
    Ok(Some(msg))
}

/// Write one framed message.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let framed = frame_message(msg).map_err(|e| NetworkError::Serialization(e.to_string()))?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bean::ExpirationMetaData;
    use crate::types::BeanId;
    use std::time::Duration;

    fn request() -> CommandRequest {
        CommandRequest {
            request_id: 42,
            service: "Cart".to_string(),
            target: 2,
            command: SchedulerCommand::Schedule {
                id: BeanId::new(),
                expiration: ExpirationMetaData::new(Duration::from_secs(30), 1_000),
            },
        }
    }

    #[test]
    fn test_frame_message() {
        let msg = Message::Command(request());
        let framed = frame_message(&msg).unwrap();

        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - 4);
        assert_eq!(decode_message(&framed[4..]).unwrap(), msg);
    }

    #[test]
    fn test_command_response() {
        let resp = CommandResponse::success(42);
        assert!(resp.success);
        assert!(resp.error.is_none());

        let resp = CommandResponse::error(42, "no handler");
        assert!(!resp.success);
        assert_eq!(resp.error.as_deref(), Some("no handler"));
    }

    #[tokio::test]
    async fn test_frames_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        let msg = Message::Command(request());

        write_frame(&mut client, &msg).await.unwrap();
        drop(client);

        assert_eq!(read_frame(&mut server).await.unwrap(), Some(msg));
        assert_eq!(read_frame(&mut server).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_oversized_frame() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_all(&u32::MAX.to_be_bytes()).await.unwrap();

        let err = read_frame(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("too large"));
    }
}
