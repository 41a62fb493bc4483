//! TCP transport from the coordinator to participant shards.

use crate::config::NetworkConfig;
use crate::error::{Error, NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Message};
use crate::resharding::{ParticipantReply, ParticipantRequest, ParticipantTransport};
use crate::types::ShardId;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;

/// Sends each participant request over a fresh TCP connection.
#[derive(Debug)]
pub struct TcpParticipantTransport {
    config: NetworkConfig,

    /// Participant addresses by shard.
    addresses: RwLock<HashMap<ShardId, SocketAddr>>,

    /// Counter for request ids.
    next_request_id: AtomicU64,
}

impl TcpParticipantTransport {
    pub fn new(config: NetworkConfig) -> Self {
        Self {
            config,
            addresses: RwLock::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
        }
    }

    /// Register or replace a shard's address.
    pub fn register_shard(&self, shard_id: ShardId, addr: SocketAddr) {
        self.addresses.write().insert(shard_id, addr);
    }

    pub fn unregister_shard(&self, shard_id: &ShardId) {
        self.addresses.write().remove(shard_id);
    }

    pub fn shard_address(&self, shard_id: &ShardId) -> Option<SocketAddr> {
        self.addresses.read().get(shard_id).copied()
    }

    async fn exchange(&self, addr: SocketAddr, request_id: u64, msg: &Message) -> Result<ParticipantReply> {
        let mut stream = tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: "connect timed out".to_string(),
            })?
            .map_err(|e| NetworkError::ConnectionFailed {
                addr: addr.to_string(),
                reason: e.to_string(),
            })?;

        write_frame(&mut stream, msg).await?;

        match read_frame(&mut stream, self.config.max_frame_size).await? {
            Some(Message::Reply {
                request_id: id,
                reply,
            }) if id == request_id => Ok(reply),
            Some(other) => Err(NetworkError::ReceiveFailed(format!(
                "unexpected frame for request {}: {:?}",
                request_id, other
            ))
            .into()),
            None => Err(NetworkError::ConnectionClosed.into()),
        }
    }
}

#[async_trait]
impl ParticipantTransport for TcpParticipantTransport {
    async fn send(&self, shard_id: &ShardId, request: ParticipantRequest) -> Result<ParticipantReply> {
        let addr = self
            .shard_address(shard_id)
            .ok_or_else(|| NetworkError::UnknownShard(shard_id.clone()))?;
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);

        tracing::trace!(
            %shard_id,
            %addr,
            request_id,
            command = request.command.name(),
            "Sending participant command"
        );

        let msg = Message::Command {
            request_id,
            request,
        };
        tokio::time::timeout(self.config.request_timeout, self.exchange(addr, request_id, &msg))
            .await
            .map_err(|_| Error::Timeout)?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::server::{ParticipantHandler, ParticipantServer};
    use crate::resharding::{ParticipantCommand, ParticipantRole};
    use crate::types::Timestamp;
    use async_trait::async_trait;
    use std::sync::Arc;
    use uuid::Uuid;

    struct ReadyHandler;

    #[async_trait]
    impl ParticipantHandler for ReadyHandler {
        async fn handle(&self, _request: ParticipantRequest) -> ParticipantReply {
            ParticipantReply::DonorReady {
                min_fetch_timestamp: Timestamp(11),
            }
        }
    }

    fn request() -> ParticipantRequest {
        ParticipantRequest {
            operation_id: Uuid::new_v4(),
            shard_id: ShardId::from("shardA"),
            role: ParticipantRole::Donor,
            command: ParticipantCommand::CommitCleanup,
        }
    }

    #[tokio::test]
    async fn test_round_trip_over_tcp() {
        let (server, shutdown_tx) = ParticipantServer::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(ReadyHandler),
            1 << 20,
        )
        .await
        .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());

        let transport = TcpParticipantTransport::new(NetworkConfig::default());
        transport.register_shard(ShardId::from("shardA"), addr);

        let reply = transport.send(&ShardId::from("shardA"), request()).await.unwrap();
        assert_eq!(
            reply,
            ParticipantReply::DonorReady {
                min_fetch_timestamp: Timestamp(11)
            }
        );
        shutdown_tx.send(()).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_and_unreachable_shards_are_transient() {
        let transport = TcpParticipantTransport::new(NetworkConfig::default());
        let err = transport
            .send(&ShardId::from("shardZ"), request())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Network(NetworkError::UnknownShard(_))));
        assert!(err.is_transient());

        // Bind then drop to get a port with no listener.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        transport.register_shard(ShardId::from("shardA"), addr);
        let err = transport
            .send(&ShardId::from("shardA"), request())
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }
}
