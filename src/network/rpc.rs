//! Wire messages for the participant protocol.
//!
//! Each frame is a 4-byte big-endian length followed by a bincode-encoded
//! [`Message`]. One connection carries request/reply pairs in order.

use crate::error::{NetworkError, Result};
use crate::resharding::{ParticipantReply, ParticipantRequest};
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Length prefix size in bytes.
pub const FRAME_HEADER_LEN: usize = 4;

/// Network message wrapper for all participant traffic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Message {
    /// Coordinator to participant.
    Command {
        request_id: u64,
        request: ParticipantRequest,
    },

    /// Participant to coordinator.
    Reply {
        request_id: u64,
        reply: ParticipantReply,
    },
}

impl Message {
    pub fn request_id(&self) -> u64 {
        match self {
            Self::Command { request_id, .. } | Self::Reply { request_id, .. } => *request_id,
        }
    }
}

/// Encode a message to bytes.
pub fn encode_message(msg: &Message) -> Result<Vec<u8>> {
    Ok(bincode::serialize(msg)?)
}

/// Decode a message from bytes.
pub fn decode_message(data: &[u8]) -> Result<Message> {
    Ok(bincode::deserialize(data)?)
}

/// Frame a message with its length prefix.
pub fn frame_message(msg: &Message) -> Result<Bytes> {
    let data = encode_message(msg)?;
    let len = u32::try_from(data.len())
        .map_err(|_| NetworkError::Serialization("message too large to frame".to_string()))?;

    let mut framed = BytesMut::with_capacity(FRAME_HEADER_LEN + data.len());
    framed.put_u32(len);
    framed.put_slice(&data);
    Ok(framed.freeze())
}

/// Write one framed message.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let framed = frame_message(msg)?;
    writer.write_all(&framed).await.map_err(NetworkError::Io)?;
    writer.flush().await.map_err(NetworkError::Io)?;
    Ok(())
}

/// Read one framed message. Returns `None` on a clean end of stream.
pub async fn read_frame<R>(reader: &mut R, max_frame_size: usize) -> Result<Option<Message>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(NetworkError::Io(e).into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_frame_size {
        return Err(NetworkError::ReceiveFailed(format!(
            "frame of {} bytes exceeds limit of {}",
            len, max_frame_size
        ))
        .into());
    }

    let mut data = vec![0u8; len];
    reader.read_exact(&mut data).await.map_err(NetworkError::Io)?;
    decode_message(&data).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::resharding::{ParticipantCommand, ParticipantRole};
    use crate::types::{ShardId, Timestamp};
    use uuid::Uuid;

    fn command() -> Message {
        Message::Command {
            request_id: 42,
            request: ParticipantRequest {
                operation_id: Uuid::new_v4(),
                shard_id: ShardId::from("shardA"),
                role: ParticipantRole::Donor,
                command: ParticipantCommand::BlockWrites {
                    block_timestamp: Some(Timestamp(9)),
                },
            },
        }
    }

    #[test]
    fn test_frame_message() {
        let msg = command();
        let framed = frame_message(&msg).unwrap();

        let len = u32::from_be_bytes([framed[0], framed[1], framed[2], framed[3]]) as usize;
        assert_eq!(len, framed.len() - FRAME_HEADER_LEN);
        assert_eq!(decode_message(&framed[FRAME_HEADER_LEN..]).unwrap(), msg);
    }

    #[tokio::test]
    async fn test_stream_framing() {
        let reply = Message::Reply {
            request_id: 42,
            reply: ParticipantReply::ApplyStatus { lag_ms: 3 },
        };
        let (mut client, mut server) = tokio::io::duplex(1024);

        write_frame(&mut client, &command()).await.unwrap();
        write_frame(&mut client, &reply).await.unwrap();
        drop(client);

        let first = read_frame(&mut server, 1024).await.unwrap().unwrap();
        assert_eq!(first.request_id(), 42);
        assert!(matches!(first, Message::Command { .. }));
        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), Some(reply));
        assert_eq!(read_frame(&mut server, 1024).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        write_frame(&mut client, &command()).await.unwrap();

        let result = read_frame(&mut server, 8).await;
        assert!(matches!(
            result,
            Err(Error::Network(NetworkError::ReceiveFailed(_)))
        ));
    }
}
