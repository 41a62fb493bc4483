//! TCP server exposing a participant shard.

use crate::error::{NetworkError, Result};
use crate::network::rpc::{read_frame, write_frame, Message};
use crate::resharding::{ParticipantReply, ParticipantRequest};
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Participant-side handler for coordinator commands.
#[async_trait]
pub trait ParticipantHandler: Send + Sync + 'static {
    /// Apply a command and return the participant's reply.
    async fn handle(&self, request: ParticipantRequest) -> ParticipantReply;
}

/// TCP server dispatching participant commands to a handler.
pub struct ParticipantServer {
    listener: TcpListener,
    handler: Arc<dyn ParticipantHandler>,
    max_frame_size: usize,
    shutdown_rx: mpsc::Receiver<()>,
}

impl ParticipantServer {
    /// Bind the server. Use port 0 to let the OS pick one.
    pub async fn bind(
        bind_addr: SocketAddr,
        handler: Arc<dyn ParticipantHandler>,
        max_frame_size: usize,
    ) -> Result<(Self, mpsc::Sender<()>)> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .map_err(NetworkError::Io)?;
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let server = Self {
            listener,
            handler,
            max_frame_size,
            shutdown_rx,
        };
        Ok((server, shutdown_tx))
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr().map_err(NetworkError::Io)?)
    }

    /// Accept connections until shutdown is signalled.
    pub async fn run(mut self) -> Result<()> {
        info!(addr = %self.local_addr()?, "Participant server listening");

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            debug!(peer = %peer_addr, "Accepted connection");
                            let handler = self.handler.clone();
                            let max_frame_size = self.max_frame_size;
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, handler, max_frame_size).await {
                                    debug!(peer = %peer_addr, error = %e, "Connection handler error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Participant server shutting down");
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        handler: Arc<dyn ParticipantHandler>,
        max_frame_size: usize,
    ) -> Result<()> {
        while let Some(msg) = read_frame(&mut stream, max_frame_size).await? {
            match msg {
                Message::Command {
                    request_id,
                    request,
                } => {
                    debug!(
                        request_id,
                        operation_id = %request.operation_id,
                        command = request.command.name(),
                        "Handling participant command"
                    );
                    let reply = handler.handle(request).await;
                    write_frame(&mut stream, &Message::Reply { request_id, reply }).await?;
                }
                Message::Reply { request_id, .. } => {
                    warn!(request_id, "Ignoring unexpected reply frame");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::rpc::{read_frame, write_frame};
    use crate::resharding::{ParticipantCommand, ParticipantRole};
    use crate::types::ShardId;
    use uuid::Uuid;

    struct EchoHandler;

    #[async_trait]
    impl ParticipantHandler for EchoHandler {
        async fn handle(&self, request: ParticipantRequest) -> ParticipantReply {
            ParticipantReply::Error {
                code: request.command.name().to_string(),
                message: request.shard_id.to_string(),
                retryable: false,
            }
        }
    }

    #[tokio::test]
    async fn test_server_replies_in_order() {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (server, shutdown_tx) = ParticipantServer::bind(addr, Arc::new(EchoHandler), 1 << 20)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let server_handle = tokio::spawn(server.run());

        let mut stream = TcpStream::connect(addr).await.unwrap();
        for (request_id, command) in [
            (1, ParticipantCommand::StartApply),
            (2, ParticipantCommand::CommitCleanup),
        ] {
            let msg = Message::Command {
                request_id,
                request: ParticipantRequest {
                    operation_id: Uuid::new_v4(),
                    shard_id: ShardId::from("shardB"),
                    role: ParticipantRole::Recipient,
                    command,
                },
            };
            write_frame(&mut stream, &msg).await.unwrap();
        }

        let first = read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
        let second = read_frame(&mut stream, 1 << 20).await.unwrap().unwrap();
        assert_eq!(first.request_id(), 1);
        assert_eq!(second.request_id(), 2);
        match second {
            Message::Reply {
                reply: ParticipantReply::Error { code, message, .. },
                ..
            } => {
                assert_eq!(code, "commit-cleanup");
                assert_eq!(message, "shardB");
            }
            other => panic!("unexpected frame {:?}", other),
        }

        shutdown_tx.send(()).await.unwrap();
        server_handle.await.unwrap().unwrap();
    }
}
