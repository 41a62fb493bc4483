//! Participant proxy.
//!
//! Sends idempotent phase-transition commands to donor and recipient shards
//! and classifies each call as acknowledged, explicitly rejected, or timed
//! out. Transport failures, per-attempt timeouts and errors the participant
//! marks retryable are retried with bounded exponential backoff plus jitter
//! until the caller's deadline.

use crate::config::ReshardingConfig;
use crate::error::Result;
use crate::metrics::ReshardingMetrics;
use crate::types::{ChunkRange, Namespace, ShardId, ShardKeyPattern, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use uuid::Uuid;

/// Role a shard plays in an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ParticipantRole {
    Donor,
    Recipient,
}

impl fmt::Display for ParticipantRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Donor => write!(f, "donor"),
            Self::Recipient => write!(f, "recipient"),
        }
    }
}

/// Commands the coordinator sends to participants.
///
/// Every command is idempotent. Re-sending `StartClone`, `StartApply` or a
/// recipient `BlockWrites` returns the participant's current status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantCommand {
    /// Donor: start capturing writes and report the minimum fetch timestamp.
    PrepareDonor {
        source_namespace: Namespace,
        new_shard_key: ShardKeyPattern,
        recipients: Vec<ShardId>,
    },
    /// Recipient: clone a snapshot of the donors at `fetch_timestamp`.
    StartClone {
        fetch_timestamp: Timestamp,
        donors: Vec<ShardId>,
        temporary_namespace: Namespace,
        new_shard_key: ShardKeyPattern,
        chunks: Vec<ChunkRange>,
    },
    /// Recipient: apply buffered donor changes.
    StartApply,
    /// Donor: enter the critical section. Recipient: converge to strict
    /// consistency with writes blocked at `block_timestamp`.
    BlockWrites { block_timestamp: Option<Timestamp> },
    /// Finalize after commit.
    CommitCleanup,
    /// Abandon the operation and discard partial state.
    Abort { reason: String },
}

impl ParticipantCommand {
    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PrepareDonor { .. } => "prepare-donor",
            Self::StartClone { .. } => "start-clone",
            Self::StartApply => "start-apply",
            Self::BlockWrites { .. } => "block-writes",
            Self::CommitCleanup => "commit-cleanup",
            Self::Abort { .. } => "abort",
        }
    }
}

/// A command addressed to one shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantRequest {
    pub operation_id: Uuid,
    pub shard_id: ShardId,
    pub role: ParticipantRole,
    pub command: ParticipantCommand,
}

/// A participant's answer to a command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParticipantReply {
    /// Command accepted with nothing further to report.
    Ack,
    /// Donor prepared; changes after this timestamp are captured.
    DonorReady { min_fetch_timestamp: Timestamp },
    /// Recipient clone progress.
    CloneStatus {
        documents_copied: u64,
        documents_total: u64,
        done: bool,
    },
    /// Recipient apply progress.
    ApplyStatus { lag_ms: u64 },
    /// Donor has blocked writes as of this timestamp.
    CriticalSection { block_timestamp: Timestamp },
    /// Recipient convergence during the critical section.
    ConsistencyStatus { strictly_consistent: bool },
    /// The participant refused or failed the command.
    Error {
        code: String,
        message: String,
        retryable: bool,
    },
}

/// How a participant call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParticipantOutcome {
    Ack(ParticipantReply),
    Rejected { code: String, message: String },
    TimedOut,
}

impl ParticipantOutcome {
    pub fn is_ack(&self) -> bool {
        matches!(self, Self::Ack(_))
    }
}

/// One result of a fan-out round.
#[derive(Debug, Clone)]
pub struct FanOutResult {
    pub shard_id: ShardId,
    pub role: ParticipantRole,
    pub outcome: ParticipantOutcome,
}

/// Delivers requests to participant shards.
#[async_trait]
pub trait ParticipantTransport: Send + Sync + std::fmt::Debug {
    /// Send a request and wait for the reply.
    async fn send(&self, shard_id: &ShardId, request: ParticipantRequest)
        -> Result<ParticipantReply>;
}

/// Retrying client for participant commands.
#[derive(Debug, Clone)]
pub struct ParticipantProxy {
    transport: Arc<dyn ParticipantTransport>,
    config: ReshardingConfig,
    metrics: Arc<ReshardingMetrics>,
}

impl ParticipantProxy {
    pub fn new(
        transport: Arc<dyn ParticipantTransport>,
        config: ReshardingConfig,
        metrics: Arc<ReshardingMetrics>,
    ) -> Self {
        Self {
            transport,
            config,
            metrics,
        }
    }

    /// Send `command` to `shard_id`, retrying until `deadline`.
    pub async fn invoke(
        &self,
        shard_id: &ShardId,
        role: ParticipantRole,
        command: ParticipantCommand,
        operation_id: Uuid,
        deadline: Instant,
    ) -> ParticipantOutcome {
        let mut attempt: u32 = 0;

        loop {
            let now = Instant::now();
            if now >= deadline {
                tracing::debug!(
                    %operation_id,
                    %shard_id,
                    command = command.name(),
                    attempts = attempt,
                    "Participant command timed out"
                );
                return ParticipantOutcome::TimedOut;
            }

            let request = ParticipantRequest {
                operation_id,
                shard_id: shard_id.clone(),
                role,
                command: command.clone(),
            };
            let budget = self.config.attempt_timeout.min(deadline - now);

            match tokio::time::timeout(budget, self.transport.send(shard_id, request)).await {
                Ok(Ok(ParticipantReply::Error {
                    code,
                    message,
                    retryable: false,
                })) => {
                    tracing::warn!(
                        %operation_id,
                        %shard_id,
                        %role,
                        command = command.name(),
                        code = %code,
                        message = %message,
                        "Participant rejected command"
                    );
                    return ParticipantOutcome::Rejected { code, message };
                }
                Ok(Ok(ParticipantReply::Error { code, message, .. })) => {
                    tracing::debug!(
                        %operation_id,
                        %shard_id,
                        code = %code,
                        message = %message,
                        "Participant returned retryable error"
                    );
                }
                Ok(Ok(reply)) => return ParticipantOutcome::Ack(reply),
                Ok(Err(e)) if !e.is_transient() => {
                    tracing::warn!(
                        %operation_id,
                        %shard_id,
                        command = command.name(),
                        error = %e,
                        "Participant call failed permanently"
                    );
                    return ParticipantOutcome::Rejected {
                        code: "transport".to_string(),
                        message: e.to_string(),
                    };
                }
                Ok(Err(e)) => {
                    tracing::debug!(%operation_id, %shard_id, error = %e, "Participant call failed, retrying");
                }
                Err(_) => {
                    tracing::debug!(%operation_id, %shard_id, "Participant attempt timed out, retrying");
                }
            }

            self.metrics.participant_retries.inc();
            let delay = self
                .config
                .retry
                .backoff_with_jitter(attempt)
                .min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(delay).await;
            attempt = attempt.saturating_add(1);
        }
    }

    /// Invoke every target in parallel and return all outcomes in target order.
    pub async fn fan_out(
        &self,
        targets: Vec<(ShardId, ParticipantRole, ParticipantCommand)>,
        operation_id: Uuid,
        deadline: Instant,
    ) -> Vec<FanOutResult> {
        let mut slots: Vec<Option<ParticipantOutcome>> = vec![None; targets.len()];
        let mut join_set = JoinSet::new();

        for (idx, (shard_id, role, command)) in targets.iter().cloned().enumerate() {
            let proxy = self.clone();
            join_set.spawn(async move {
                let outcome = proxy
                    .invoke(&shard_id, role, command, operation_id, deadline)
                    .await;
                (idx, outcome)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => {
                    tracing::error!(%operation_id, error = %e, "Participant call task failed");
                }
            }
        }

        targets
            .into_iter()
            .zip(slots)
            .map(|((shard_id, role, _), outcome)| FanOutResult {
                shard_id,
                role,
                outcome: outcome.unwrap_or(ParticipantOutcome::TimedOut),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, NetworkError};
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::time::Duration;

    /// Replies from a script, then `Ack` forever.
    #[derive(Debug, Default)]
    struct ScriptedTransport {
        script: Mutex<VecDeque<Result<ParticipantReply>>>,
        calls: Mutex<u32>,
        hang: bool,
    }

    impl ScriptedTransport {
        fn new(script: Vec<Result<ParticipantReply>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                ..Default::default()
            }
        }
    }

    #[async_trait]
    impl ParticipantTransport for ScriptedTransport {
        async fn send(
            &self,
            _shard_id: &ShardId,
            _request: ParticipantRequest,
        ) -> Result<ParticipantReply> {
            *self.calls.lock() += 1;
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or(Ok(ParticipantReply::Ack))
        }
    }

    fn proxy(transport: Arc<ScriptedTransport>) -> ParticipantProxy {
        ParticipantProxy::new(
            transport,
            ReshardingConfig::fast(),
            Arc::new(ReshardingMetrics::new()),
        )
    }

    fn deadline() -> Instant {
        Instant::now() + Duration::from_millis(500)
    }

    #[tokio::test]
    async fn test_malformed_reply_is_rejected_without_retry() {
        let transport = Arc::new(ScriptedTransport::new(vec![Err(Error::Network(
            NetworkError::Serialization("invalid enum tag".into()),
        ))]));
        let outcome = proxy(transport.clone())
            .invoke(
                &ShardId::from("shardA"),
                ParticipantRole::Donor,
                ParticipantCommand::CommitCleanup,
                Uuid::new_v4(),
                deadline(),
            )
            .await;

        match outcome {
            ParticipantOutcome::Rejected { code, message } => {
                assert_eq!(code, "transport");
                assert!(message.contains("invalid enum tag"));
            }
            other => panic!("expected rejection, got {:?}", other),
        }
        assert_eq!(*transport.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let transport = Arc::new(ScriptedTransport::new(vec![
            Err(Error::Network(NetworkError::ConnectionClosed)),
            Ok(ParticipantReply::Error {
                code: "busy".into(),
                message: "try later".into(),
                retryable: true,
            }),
            Ok(ParticipantReply::DonorReady {
                min_fetch_timestamp: Timestamp(7),
            }),
        ]));
        let proxy = proxy(transport.clone());

        let outcome = proxy
            .invoke(
                &ShardId::from("shardA"),
                ParticipantRole::Donor,
                ParticipantCommand::StartApply,
                Uuid::new_v4(),
                deadline(),
            )
            .await;
        assert_eq!(
            outcome,
            ParticipantOutcome::Ack(ParticipantReply::DonorReady {
                min_fetch_timestamp: Timestamp(7)
            })
        );
        assert_eq!(*transport.calls.lock(), 3);
        assert_eq!(proxy.metrics.participant_retries.get(), 2);
    }

    #[tokio::test]
    async fn test_fatal_error_returns_immediately() {
        let transport = Arc::new(ScriptedTransport::new(vec![Ok(ParticipantReply::Error {
            code: "disk".into(),
            message: "disk full".into(),
            retryable: false,
        })]));
        let proxy = proxy(transport.clone());

        let outcome = proxy
            .invoke(
                &ShardId::from("shardB"),
                ParticipantRole::Recipient,
                ParticipantCommand::StartApply,
                Uuid::new_v4(),
                deadline(),
            )
            .await;
        assert!(matches!(outcome, ParticipantOutcome::Rejected { ref message, .. } if message == "disk full"));
        assert_eq!(*transport.calls.lock(), 1);
    }

    #[tokio::test]
    async fn test_unresponsive_participant_times_out() {
        let transport = Arc::new(ScriptedTransport {
            hang: true,
            ..Default::default()
        });
        let proxy = proxy(transport.clone());

        let start = Instant::now();
        let outcome = proxy
            .invoke(
                &ShardId::from("shardA"),
                ParticipantRole::Donor,
                ParticipantCommand::CommitCleanup,
                Uuid::new_v4(),
                Instant::now() + Duration::from_millis(300),
            )
            .await;
        assert_eq!(outcome, ParticipantOutcome::TimedOut);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(*transport.calls.lock() >= 2);
    }

    #[tokio::test]
    async fn test_fan_out_preserves_target_order() {
        let transport = Arc::new(ScriptedTransport::default());
        let proxy = proxy(transport);

        let targets = vec![
            (ShardId::from("shardB"), ParticipantRole::Recipient, ParticipantCommand::StartApply),
            (ShardId::from("shardA"), ParticipantRole::Donor, ParticipantCommand::CommitCleanup),
        ];
        let results = proxy.fan_out(targets, Uuid::new_v4(), deadline()).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].shard_id, ShardId::from("shardB"));
        assert_eq!(results[0].role, ParticipantRole::Recipient);
        assert_eq!(results[1].shard_id, ShardId::from("shardA"));
        assert!(results.iter().all(|r| r.outcome.is_ack()));
    }
}
