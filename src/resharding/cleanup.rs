//! Background cleanup of participants that missed a terminal command.
//!
//! When an instance commits or aborts, every participant must eventually
//! receive `CommitCleanup` or `Abort`. Participants that do not ack within
//! the phase's round are handed here; the manager keeps retrying them in the
//! background so the coordinator can reach its terminal phase without
//! waiting on unreachable shards.

use super::participant::{
    ParticipantCommand, ParticipantOutcome, ParticipantProxy, ParticipantRole,
};
use crate::config::ReshardingConfig;
use crate::metrics::ReshardingMetrics;
use crate::types::ShardId;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// A participant still owed a terminal command.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CleanupTarget {
    pub shard_id: ShardId,
    pub role: ParticipantRole,
}

/// Result of a cleanup pass.
#[derive(Debug, Default)]
pub struct CleanupResult {
    pub cleaned: Vec<CleanupTarget>,
    pub failed: Vec<(CleanupTarget, String)>,
}

impl CleanupResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn cleaned_count(&self) -> usize {
        self.cleaned.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn record_success(&mut self, target: CleanupTarget) {
        self.cleaned.push(target);
    }

    pub fn record_failure(&mut self, target: CleanupTarget, error: impl Into<String>) {
        self.failed.push((target, error.into()));
    }
}

type PendingKey = (Uuid, ShardId, ParticipantRole);

/// Retries terminal participant commands until they are acknowledged.
#[derive(Debug)]
pub struct CleanupManager {
    proxy: ParticipantProxy,
    config: ReshardingConfig,
    metrics: Arc<ReshardingMetrics>,
    pending: Mutex<HashSet<PendingKey>>,
    cancellation: CancellationToken,
}

impl CleanupManager {
    pub fn new(
        proxy: ParticipantProxy,
        config: ReshardingConfig,
        metrics: Arc<ReshardingMetrics>,
    ) -> Self {
        Self {
            proxy,
            config,
            metrics,
            pending: Mutex::new(HashSet::new()),
            cancellation: CancellationToken::new(),
        }
    }

    /// Retry `command` against each target in the background.
    ///
    /// Targets already being retried for this operation are skipped.
    pub fn schedule_cleanup(
        self: &Arc<Self>,
        operation_id: Uuid,
        command: ParticipantCommand,
        targets: Vec<CleanupTarget>,
    ) {
        for target in targets {
            let key = (operation_id, target.shard_id.clone(), target.role);
            if !self.pending.lock().insert(key.clone()) {
                tracing::debug!(
                    %operation_id,
                    shard_id = %target.shard_id,
                    "Cleanup already scheduled, skipping"
                );
                continue;
            }

            let manager = Arc::clone(self);
            let command = command.clone();
            tokio::spawn(async move {
                tracing::info!(
                    %operation_id,
                    shard_id = %target.shard_id,
                    role = %target.role,
                    command = command.name(),
                    "Starting background participant cleanup"
                );

                let result = manager.retry_target(operation_id, &command, target).await;
                manager.pending.lock().remove(&key);

                if result.is_success() {
                    tracing::info!(%operation_id, "Participant cleanup completed");
                } else {
                    for (target, error) in &result.failed {
                        tracing::warn!(
                            %operation_id,
                            shard_id = %target.shard_id,
                            role = %target.role,
                            error = %error,
                            "Participant cleanup gave up"
                        );
                    }
                }
            });
        }
    }

    async fn retry_target(
        &self,
        operation_id: Uuid,
        command: &ParticipantCommand,
        target: CleanupTarget,
    ) -> CleanupResult {
        let mut result = CleanupResult::new();

        for attempt in 1..=self.config.cleanup_max_attempts {
            self.metrics.cleanup_retries.inc();
            let deadline = Instant::now() + self.config.participant_deadline;
            let outcome = self
                .proxy
                .invoke(&target.shard_id, target.role, command.clone(), operation_id, deadline)
                .await;

            match outcome {
                ParticipantOutcome::Ack(_) => {
                    result.record_success(target);
                    return result;
                }
                ParticipantOutcome::Rejected { code, message } => {
                    result.record_failure(target, format!("{}: {}", code, message));
                    return result;
                }
                ParticipantOutcome::TimedOut => {
                    tracing::debug!(
                        %operation_id,
                        shard_id = %target.shard_id,
                        attempt,
                        "Cleanup attempt timed out"
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.cleanup_retry_interval) => {}
                _ = self.cancellation.cancelled() => {
                    result.record_failure(target, "cleanup manager shut down");
                    return result;
                }
            }
        }

        result.record_failure(target, "participant unreachable");
        result
    }

    pub fn is_cleanup_pending(&self, operation_id: Uuid) -> bool {
        self.pending.lock().iter().any(|(id, _, _)| *id == operation_id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Stop all background retries.
    pub fn shutdown(&self) {
        self.cancellation.cancel();
    }
}
