//! The persisted coordination record.

use super::phase::{participant_phase_allowed, CoordinatorPhase, DonorPhase, RecipientPhase};
use crate::error::{Error, Result};
use crate::types::{now_ms, ChunkRange, Namespace, ShardId, ShardKeyPattern, Timestamp, Zone};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Why an operation was abandoned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AbortKind {
    /// A participant returned a non-retryable error.
    ParticipantError,
    /// An administrator requested the abort.
    UserAbort,
    /// Participants stayed unreachable for too many rounds.
    Unreachable,
    /// Recipients did not converge before the critical section timed out.
    CriticalSectionTimeout,
    /// The source routing changed under a different collection identity.
    RoutingConflict,
    /// The persisted record was unusable on resume.
    InvalidState,
}

impl fmt::Display for AbortKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ParticipantError => write!(f, "participant-error"),
            Self::UserAbort => write!(f, "user-abort"),
            Self::Unreachable => write!(f, "unreachable"),
            Self::CriticalSectionTimeout => write!(f, "critical-section-timeout"),
            Self::RoutingConflict => write!(f, "routing-conflict"),
            Self::InvalidState => write!(f, "invalid-state"),
        }
    }
}

/// Cause of an abort, recorded once and reported to waiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AbortReason {
    /// The shard that caused the abort, if any.
    pub shard_id: Option<ShardId>,
    /// Coordinator phase at the time of the abort.
    pub phase: CoordinatorPhase,
    pub kind: AbortKind,
    pub message: String,
}

impl AbortReason {
    /// Abort caused by a participant's explicit error.
    pub fn participant(
        shard_id: ShardId,
        phase: CoordinatorPhase,
        message: impl Into<String>,
    ) -> Self {
        Self {
            shard_id: Some(shard_id),
            phase,
            kind: AbortKind::ParticipantError,
            message: message.into(),
        }
    }

    /// Abort not attributable to a single shard.
    pub fn new(kind: AbortKind, phase: CoordinatorPhase, message: impl Into<String>) -> Self {
        Self {
            shard_id: None,
            phase,
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.shard_id {
            Some(shard) => write!(
                f,
                "{} on shard {} during {}: {}",
                self.kind, shard, self.phase, self.message
            ),
            None => write!(f, "{} during {}: {}", self.kind, self.phase, self.message),
        }
    }
}

/// Clone/apply progress last reported by a recipient.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloneProgress {
    pub documents_copied: u64,
    pub documents_total: u64,
    /// Replication lag reported during apply, in milliseconds.
    pub lag_ms: Option<u64>,
}

/// A donor shard and its last known sub-phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonorShardEntry {
    pub shard_id: ShardId,
    pub phase: DonorPhase,
    pub min_fetch_timestamp: Option<Timestamp>,
}

impl DonorShardEntry {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            phase: DonorPhase::Unused,
            min_fetch_timestamp: None,
        }
    }
}

/// A recipient shard and its last known sub-phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientShardEntry {
    pub shard_id: ShardId,
    pub phase: RecipientPhase,
    pub clone_progress: CloneProgress,
}

impl RecipientShardEntry {
    pub fn new(shard_id: ShardId) -> Self {
        Self {
            shard_id,
            phase: RecipientPhase::Unused,
            clone_progress: CloneProgress::default(),
        }
    }
}

/// Durable state of one resharding operation.
///
/// Only the owning coordinator instance mutates a record, and only through
/// compare-and-swap persists. Once the phase is terminal the record is frozen.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinationRecord {
    /// Unique id; also the collection id after commit.
    pub operation_id: Uuid,
    pub source_namespace: Namespace,
    pub source_collection_id: Uuid,
    pub temporary_namespace: Namespace,
    pub new_shard_key: ShardKeyPattern,
    pub phase: CoordinatorPhase,
    pub donor_shards: Vec<DonorShardEntry>,
    pub recipient_shards: Vec<RecipientShardEntry>,
    pub zones: Option<Vec<Zone>>,
    pub preset_chunks: Option<Vec<ChunkRange>>,
    /// Chunk layout under the new key; installed as routing at commit.
    pub initial_chunks: Vec<ChunkRange>,
    pub fetch_timestamp: Option<Timestamp>,
    pub block_timestamp: Option<Timestamp>,
    pub abort_reason: Option<AbortReason>,
    pub started_at_ms: u64,
    pub last_updated_at_ms: u64,
    /// Store-assigned write counter.
    pub revision: u64,
}

impl CoordinationRecord {
    /// Build the initial record for a planned operation.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        operation_id: Uuid,
        source_namespace: Namespace,
        source_collection_id: Uuid,
        new_shard_key: ShardKeyPattern,
        donors: Vec<ShardId>,
        recipients: Vec<ShardId>,
        initial_chunks: Vec<ChunkRange>,
        zones: Option<Vec<Zone>>,
        preset_chunks: Option<Vec<ChunkRange>>,
    ) -> Self {
        let now = now_ms();
        Self {
            operation_id,
            temporary_namespace: source_namespace.temporary_resharding(source_collection_id),
            source_namespace,
            source_collection_id,
            new_shard_key,
            phase: CoordinatorPhase::Unused,
            donor_shards: donors.into_iter().map(DonorShardEntry::new).collect(),
            recipient_shards: recipients.into_iter().map(RecipientShardEntry::new).collect(),
            zones,
            preset_chunks,
            initial_chunks,
            fetch_timestamp: None,
            block_timestamp: None,
            abort_reason: None,
            started_at_ms: now,
            last_updated_at_ms: now,
            revision: 0,
        }
    }

    /// Donor shard ids in record order.
    pub fn donor_ids(&self) -> Vec<ShardId> {
        self.donor_shards.iter().map(|d| d.shard_id.clone()).collect()
    }

    /// Recipient shard ids in record order.
    pub fn recipient_ids(&self) -> Vec<ShardId> {
        self.recipient_shards.iter().map(|r| r.shard_id.clone()).collect()
    }

    pub fn donor_mut(&mut self, shard_id: &ShardId) -> Option<&mut DonorShardEntry> {
        self.donor_shards.iter_mut().find(|d| &d.shard_id == shard_id)
    }

    pub fn recipient_mut(&mut self, shard_id: &ShardId) -> Option<&mut RecipientShardEntry> {
        self.recipient_shards.iter_mut().find(|r| &r.shard_id == shard_id)
    }

    /// Record the abort cause. The first reason wins.
    pub fn set_abort_reason(&mut self, reason: AbortReason) {
        if self.abort_reason.is_none() {
            self.abort_reason = Some(reason);
        }
    }

    /// Move to `to`, validating the transition.
    pub fn transition_to(&mut self, to: CoordinatorPhase) -> Result<()> {
        if !self.phase.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.last_updated_at_ms = now_ms();
        Ok(())
    }

    /// Whether the record is frozen.
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Validate the record's structural invariants.
    pub fn check_invariants(&self) -> Result<()> {
        let violation = |msg: String| Err(Error::InvariantViolation(msg));

        if self.temporary_namespace != self.source_namespace.temporary_resharding(self.source_collection_id) {
            return violation(format!(
                "temporary namespace {} does not derive from {}",
                self.temporary_namespace, self.source_namespace
            ));
        }

        if self.new_shard_key.is_empty() {
            return violation("new shard key is empty".to_string());
        }

        let active = !self.phase.is_terminal() && self.phase != CoordinatorPhase::Unused;
        if active && (self.donor_shards.is_empty() || self.recipient_shards.is_empty()) {
            return violation(format!(
                "{} donors and {} recipients in phase {}",
                self.donor_shards.len(),
                self.recipient_shards.len(),
                self.phase
            ));
        }

        for donor in &self.donor_shards {
            if !participant_phase_allowed(self.phase, donor.phase.required_coordinator_phase()) {
                return violation(format!(
                    "donor {} in {} ahead of coordinator {}",
                    donor.shard_id, donor.phase, self.phase
                ));
            }
        }
        for recipient in &self.recipient_shards {
            if !participant_phase_allowed(self.phase, recipient.phase.required_coordinator_phase())
            {
                return violation(format!(
                    "recipient {} in {} ahead of coordinator {}",
                    recipient.shard_id, recipient.phase, self.phase
                ));
            }
        }

        let needs_fetch_ts = !self.phase.is_aborting()
            && self.phase.rank() >= CoordinatorPhase::Cloning.rank();
        if needs_fetch_ts && self.fetch_timestamp.is_none() {
            return violation(format!("no fetch timestamp in phase {}", self.phase));
        }

        if self.phase.is_aborting() && self.abort_reason.is_none() {
            return violation(format!("no abort reason in phase {}", self.phase));
        }
        if !self.phase.is_aborting() && self.abort_reason.is_some() {
            return violation(format!("abort reason set in phase {}", self.phase));
        }

        Ok(())
    }
}
