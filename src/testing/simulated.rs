//! In-process participant shards.
//!
//! `SimulatedShard` plays both participant roles with the idempotent command
//! semantics real shards provide, and `SimulatedCluster` routes coordinator
//! requests to them. Faults are injected per shard and per command.

use crate::error::{Error, NetworkError, Result};
use crate::network::ParticipantHandler;
use crate::resharding::{
    DonorPhase, ParticipantCommand, ParticipantReply, ParticipantRequest, ParticipantRole,
    ParticipantTransport, RecipientPhase,
};
use crate::types::{ShardId, Timestamp};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Shape of the simulated workload.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// `StartClone` calls before a recipient reports the clone done.
    pub clone_rounds: u32,

    /// Documents each recipient reports copying.
    pub documents_per_shard: u64,

    /// `StartApply` calls before a recipient reports zero lag.
    pub apply_rounds: u32,

    /// Lag reported while still applying.
    pub initial_lag_ms: u64,

    /// Recipient `BlockWrites` calls before it reports strict consistency.
    pub consistency_rounds: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            clone_rounds: 2,
            documents_per_shard: 1_000,
            apply_rounds: 2,
            initial_lag_ms: 500,
            consistency_rounds: 1,
        }
    }
}

impl SimulationConfig {
    pub fn with_clone_rounds(mut self, rounds: u32) -> Self {
        self.clone_rounds = rounds.max(1);
        self
    }

    pub fn with_apply_rounds(mut self, rounds: u32) -> Self {
        self.apply_rounds = rounds.max(1);
        self
    }

    pub fn with_consistency_rounds(mut self, rounds: u32) -> Self {
        self.consistency_rounds = rounds.max(1);
        self
    }
}

/// Failure injected into one shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShardFault {
    /// Reject `command` with a non-retryable error.
    Fatal {
        command: &'static str,
        message: String,
    },
    /// Fail the next `times` calls of `command` with a retryable error.
    Transient { command: &'static str, times: u32 },
    /// Never answer `command`.
    Hang { command: &'static str },
}

impl ShardFault {
    fn command(&self) -> &'static str {
        match self {
            Self::Fatal { command, .. } | Self::Transient { command, .. } | Self::Hang { command } => {
                command
            }
        }
    }
}

#[derive(Debug, Clone)]
enum ParticipantState {
    Donor {
        phase: DonorPhase,
        min_fetch_timestamp: Option<Timestamp>,
        block_timestamp: Option<Timestamp>,
    },
    Recipient {
        phase: RecipientPhase,
        clone_polls: u32,
        apply_polls: u32,
        consistency_polls: u32,
    },
}

impl ParticipantState {
    fn new(role: ParticipantRole) -> Self {
        match role {
            ParticipantRole::Donor => Self::Donor {
                phase: DonorPhase::Unused,
                min_fetch_timestamp: None,
                block_timestamp: None,
            },
            ParticipantRole::Recipient => Self::Recipient {
                phase: RecipientPhase::Unused,
                clone_polls: 0,
                apply_polls: 0,
                consistency_polls: 0,
            },
        }
    }

    fn is_aborted(&self) -> bool {
        matches!(
            self,
            Self::Donor {
                phase: DonorPhase::Aborted,
                ..
            } | Self::Recipient {
                phase: RecipientPhase::Aborted,
                ..
            }
        )
    }
}

/// A command as received by a shard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedCommand {
    pub operation_id: Uuid,
    pub role: ParticipantRole,
    pub command: &'static str,
}

/// One in-process participant shard.
#[derive(Debug)]
pub struct SimulatedShard {
    shard_id: ShardId,
    config: SimulationConfig,
    clock: AtomicU64,
    operations: DashMap<(Uuid, ParticipantRole), ParticipantState>,
    faults: Mutex<Vec<ShardFault>>,
    received: Mutex<Vec<ReceivedCommand>>,
    crashed: AtomicBool,
}

impl SimulatedShard {
    pub fn new(shard_id: ShardId, config: SimulationConfig, clock_base: u64) -> Self {
        Self {
            shard_id,
            config,
            clock: AtomicU64::new(clock_base),
            operations: DashMap::new(),
            faults: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            crashed: AtomicBool::new(false),
        }
    }

    pub fn shard_id(&self) -> &ShardId {
        &self.shard_id
    }

    pub fn inject_fault(&self, fault: ShardFault) {
        self.faults.lock().push(fault);
    }

    pub fn clear_faults(&self) {
        self.faults.lock().clear();
    }

    /// Make the shard refuse connections.
    pub fn crash(&self) {
        self.crashed.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.crashed.store(false, Ordering::SeqCst);
    }

    pub fn is_crashed(&self) -> bool {
        self.crashed.load(Ordering::SeqCst)
    }

    pub fn donor_phase(&self, operation_id: Uuid) -> Option<DonorPhase> {
        match self.operations.get(&(operation_id, ParticipantRole::Donor))?.value() {
            ParticipantState::Donor { phase, .. } => Some(*phase),
            ParticipantState::Recipient { .. } => None,
        }
    }

    pub fn recipient_phase(&self, operation_id: Uuid) -> Option<RecipientPhase> {
        match self.operations.get(&(operation_id, ParticipantRole::Recipient))?.value() {
            ParticipantState::Recipient { phase, .. } => Some(*phase),
            ParticipantState::Donor { .. } => None,
        }
    }

    /// How many times `command` reached this shard for `operation_id`.
    pub fn command_count(&self, operation_id: Uuid, command: &str) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|c| c.operation_id == operation_id && c.command == command)
            .count()
    }

    pub fn received(&self) -> Vec<ReceivedCommand> {
        self.received.lock().clone()
    }

    fn tick(&self) -> Timestamp {
        Timestamp(self.clock.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Consume a matching fault, if any, and turn it into a reply.
    /// `Hang` yields `Some(None)`.
    fn take_fault(&self, command: &'static str) -> Option<Option<ParticipantReply>> {
        let mut faults = self.faults.lock();
        let idx = faults.iter().position(|f| f.command() == command)?;
        let reply = match &mut faults[idx] {
            ShardFault::Fatal { message, .. } => Some(ParticipantReply::Error {
                code: "fatal".to_string(),
                message: message.clone(),
                retryable: false,
            }),
            ShardFault::Transient { times, .. } => {
                *times = times.saturating_sub(1);
                Some(ParticipantReply::Error {
                    code: "busy".to_string(),
                    message: format!("{} temporarily unavailable", command),
                    retryable: true,
                })
            }
            ShardFault::Hang { .. } => None,
        };
        if matches!(faults[idx], ShardFault::Transient { times: 0, .. }) {
            faults.remove(idx);
        }
        Some(reply)
    }

    fn apply(&self, request: &ParticipantRequest) -> ParticipantReply {
        let mut state = self
            .operations
            .entry((request.operation_id, request.role))
            .or_insert_with(|| ParticipantState::new(request.role));

        let aborting = matches!(request.command, ParticipantCommand::Abort { .. });
        if state.is_aborted() && !aborting {
            return ParticipantReply::Error {
                code: "operation-aborted".to_string(),
                message: format!("operation {} was aborted", request.operation_id),
                retryable: false,
            };
        }

        match (state.value_mut(), &request.command) {
            (
                ParticipantState::Donor {
                    phase,
                    min_fetch_timestamp,
                    ..
                },
                ParticipantCommand::PrepareDonor { .. },
            ) => {
                let ts = *min_fetch_timestamp.get_or_insert_with(|| self.tick());
                if *phase < DonorPhase::Ready {
                    *phase = DonorPhase::Ready;
                }
                ParticipantReply::DonorReady {
                    min_fetch_timestamp: ts,
                }
            }
            (
                ParticipantState::Donor {
                    phase,
                    block_timestamp,
                    ..
                },
                ParticipantCommand::BlockWrites { .. },
            ) => {
                let ts = *block_timestamp.get_or_insert_with(|| self.tick());
                *phase = DonorPhase::BlockingWrites;
                ParticipantReply::CriticalSection {
                    block_timestamp: ts,
                }
            }
            (
                ParticipantState::Recipient {
                    phase, clone_polls, ..
                },
                ParticipantCommand::StartClone { .. },
            ) => {
                let total = self.config.documents_per_shard;
                if *phase <= RecipientPhase::Cloned {
                    *clone_polls += 1;
                }
                let done = *clone_polls >= self.config.clone_rounds || *phase > RecipientPhase::Cloned;
                if *phase <= RecipientPhase::Cloned {
                    *phase = if done {
                        RecipientPhase::Cloned
                    } else {
                        RecipientPhase::Cloning
                    };
                }
                let copied = if done {
                    total
                } else {
                    total * u64::from(*clone_polls) / u64::from(self.config.clone_rounds)
                };
                ParticipantReply::CloneStatus {
                    documents_copied: copied,
                    documents_total: total,
                    done,
                }
            }
            (
                ParticipantState::Recipient {
                    phase, apply_polls, ..
                },
                ParticipantCommand::StartApply,
            ) => {
                *apply_polls += 1;
                let lag_ms = if *apply_polls >= self.config.apply_rounds {
                    0
                } else {
                    self.config.initial_lag_ms
                };
                if *phase < RecipientPhase::StrictlyConsistent {
                    *phase = if lag_ms == 0 {
                        RecipientPhase::Consistent
                    } else {
                        RecipientPhase::Applying
                    };
                }
                ParticipantReply::ApplyStatus { lag_ms }
            }
            (
                ParticipantState::Recipient {
                    phase,
                    consistency_polls,
                    ..
                },
                ParticipantCommand::BlockWrites {
                    block_timestamp: Some(_),
                },
            ) => {
                *consistency_polls += 1;
                let strict = *consistency_polls >= self.config.consistency_rounds
                    || *phase == RecipientPhase::StrictlyConsistent;
                if strict {
                    *phase = RecipientPhase::StrictlyConsistent;
                }
                ParticipantReply::ConsistencyStatus {
                    strictly_consistent: strict,
                }
            }
            (ParticipantState::Donor { phase, .. }, ParticipantCommand::CommitCleanup) => {
                *phase = DonorPhase::Done;
                ParticipantReply::Ack
            }
            (ParticipantState::Recipient { phase, .. }, ParticipantCommand::CommitCleanup) => {
                *phase = RecipientPhase::Done;
                ParticipantReply::Ack
            }
            (ParticipantState::Donor { phase, .. }, ParticipantCommand::Abort { .. }) => {
                *phase = DonorPhase::Aborted;
                ParticipantReply::Ack
            }
            (ParticipantState::Recipient { phase, .. }, ParticipantCommand::Abort { .. }) => {
                *phase = RecipientPhase::Aborted;
                ParticipantReply::Ack
            }
            (_, command) => ParticipantReply::Error {
                code: "bad-command".to_string(),
                message: format!("{} not valid for {}", command.name(), request.role),
                retryable: false,
            },
        }
    }
}

#[async_trait]
impl ParticipantHandler for SimulatedShard {
    async fn handle(&self, request: ParticipantRequest) -> ParticipantReply {
        let command = request.command.name();
        self.received.lock().push(ReceivedCommand {
            operation_id: request.operation_id,
            role: request.role,
            command,
        });

        match self.take_fault(command) {
            Some(Some(reply)) => return reply,
            Some(None) => std::future::pending::<()>().await,
            None => {}
        }

        let reply = self.apply(&request);
        tracing::trace!(
            shard_id = %self.shard_id,
            operation_id = %request.operation_id,
            command,
            reply = ?reply,
            "Simulated shard handled command"
        );
        reply
    }
}

/// A set of simulated shards reachable through [`ParticipantTransport`].
#[derive(Debug, Default)]
pub struct SimulatedCluster {
    shards: DashMap<ShardId, Arc<SimulatedShard>>,
}

impl SimulatedCluster {
    pub fn new(shard_ids: &[&str]) -> Self {
        Self::with_config(shard_ids, SimulationConfig::default())
    }

    pub fn with_config(shard_ids: &[&str], config: SimulationConfig) -> Self {
        let cluster = Self::default();
        for (i, id) in shard_ids.iter().enumerate() {
            let shard_id = ShardId::from(*id);
            let clock_base = 100 * (i as u64 + 1);
            cluster.shards.insert(
                shard_id.clone(),
                Arc::new(SimulatedShard::new(shard_id, config.clone(), clock_base)),
            );
        }
        cluster
    }

    /// Look up a shard. Panics on an unknown id; this is test scaffolding.
    pub fn shard(&self, shard_id: &str) -> Arc<SimulatedShard> {
        self.shards
            .get(&ShardId::from(shard_id))
            .map(|s| s.value().clone())
            .unwrap_or_else(|| panic!("unknown simulated shard {}", shard_id))
    }

    pub fn shards(&self) -> Vec<Arc<SimulatedShard>> {
        let mut shards: Vec<_> = self.shards.iter().map(|s| s.value().clone()).collect();
        shards.sort_by(|a, b| a.shard_id().cmp(b.shard_id()));
        shards
    }
}

#[async_trait]
impl ParticipantTransport for SimulatedCluster {
    async fn send(&self, shard_id: &ShardId, request: ParticipantRequest) -> Result<ParticipantReply> {
        let shard = self
            .shards
            .get(shard_id)
            .map(|s| s.value().clone())
            .ok_or_else(|| NetworkError::UnknownShard(shard_id.clone()))?;

        if shard.is_crashed() {
            return Err(Error::Network(NetworkError::ConnectionFailed {
                addr: shard_id.to_string(),
                reason: "shard is down".to_string(),
            }));
        }
        Ok(shard.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Namespace, ShardKeyPattern};

    fn request(op: Uuid, role: ParticipantRole, command: ParticipantCommand) -> ParticipantRequest {
        ParticipantRequest {
            operation_id: op,
            shard_id: ShardId::from("shardA"),
            role,
            command,
        }
    }

    fn prepare() -> ParticipantCommand {
        ParticipantCommand::PrepareDonor {
            source_namespace: Namespace::new("db", "coll"),
            new_shard_key: ShardKeyPattern::ascending(&["region"]),
            recipients: vec![ShardId::from("shardB")],
        }
    }

    #[tokio::test]
    async fn test_commands_are_idempotent() {
        let cluster = SimulatedCluster::new(&["shardA"]);
        let shard = cluster.shard("shardA");
        let op = Uuid::new_v4();

        let first = shard.handle(request(op, ParticipantRole::Donor, prepare())).await;
        let second = shard.handle(request(op, ParticipantRole::Donor, prepare())).await;
        assert_eq!(first, second);
        assert_eq!(shard.donor_phase(op), Some(DonorPhase::Ready));
        assert_eq!(shard.command_count(op, "prepare-donor"), 2);
    }

    #[tokio::test]
    async fn test_clone_progress() {
        let cluster =
            SimulatedCluster::with_config(&["shardB"], SimulationConfig::default().with_clone_rounds(2));
        let shard = cluster.shard("shardB");
        let op = Uuid::new_v4();
        let clone = || ParticipantCommand::StartClone {
            fetch_timestamp: Timestamp(1),
            donors: vec![ShardId::from("shardA")],
            temporary_namespace: Namespace::new("db", "system.resharding.x"),
            new_shard_key: ShardKeyPattern::ascending(&["region"]),
            chunks: vec![],
        };

        let reply = shard.handle(request(op, ParticipantRole::Recipient, clone())).await;
        assert!(matches!(reply, ParticipantReply::CloneStatus { done: false, documents_copied: 500, .. }));
        assert_eq!(shard.recipient_phase(op), Some(RecipientPhase::Cloning));

        let reply = shard.handle(request(op, ParticipantRole::Recipient, clone())).await;
        assert!(matches!(reply, ParticipantReply::CloneStatus { done: true, .. }));
        assert_eq!(shard.recipient_phase(op), Some(RecipientPhase::Cloned));
    }

    #[tokio::test]
    async fn test_faults_and_crash() {
        let cluster = SimulatedCluster::new(&["shardA"]);
        let shard = cluster.shard("shardA");
        let op = Uuid::new_v4();

        shard.inject_fault(ShardFault::Transient {
            command: "prepare-donor",
            times: 1,
        });
        let reply = cluster
            .send(&ShardId::from("shardA"), request(op, ParticipantRole::Donor, prepare()))
            .await
            .unwrap();
        assert!(matches!(reply, ParticipantReply::Error { retryable: true, .. }));
        let reply = cluster
            .send(&ShardId::from("shardA"), request(op, ParticipantRole::Donor, prepare()))
            .await
            .unwrap();
        assert!(matches!(reply, ParticipantReply::DonorReady { .. }));

        shard.crash();
        let err = cluster
            .send(&ShardId::from("shardA"), request(op, ParticipantRole::Donor, prepare()))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        shard.recover();

        let abort = ParticipantCommand::Abort {
            reason: "test".to_string(),
        };
        shard.handle(request(op, ParticipantRole::Donor, abort)).await;
        let reply = shard.handle(request(op, ParticipantRole::Donor, prepare())).await;
        assert!(matches!(reply, ParticipantReply::Error { retryable: false, .. }));
    }
}
