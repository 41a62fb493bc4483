//! Error types for the resharding coordinator.

use crate::resharding::phase::CoordinatorPhase;
use crate::types::{Namespace, ShardId};
use std::io;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for resharding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the resharding coordinator.
#[derive(Error, Debug)]
pub enum Error {
    /// The request failed validation before any state was created.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Donor/recipient placement could not be computed.
    #[error("placement error: {0}")]
    Placement(#[from] PlacementError),

    /// Network communication errors.
    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    /// Coordinator document store errors.
    #[error("storage error: {0}")]
    Storage(String),

    /// Compare-and-swap persist failed: another writer advanced the record.
    #[error(
        "persist conflict for operation {operation_id}: expected phase {expected} at revision {expected_revision}, found {found} at revision {found_revision}"
    )]
    PersistConflict {
        operation_id: Uuid,
        expected: CoordinatorPhase,
        expected_revision: u64,
        found: CoordinatorPhase,
        found_revision: u64,
    },

    /// A record with this operation id already exists.
    #[error("duplicate resharding operation: {0}")]
    DuplicateOperation(Uuid),

    /// Another resharding operation is already active for the namespace.
    #[error("conflicting resharding operation in progress for {namespace}: {operation_id}")]
    ConflictingOperationInProgress {
        namespace: Namespace,
        operation_id: Uuid,
    },

    /// No record or instance exists for this operation.
    #[error("resharding operation not found: {0}")]
    OperationNotFound(Uuid),

    /// No active resharding operation for the namespace.
    #[error("no active resharding operation for {0}")]
    NamespaceNotResharding(Namespace),

    /// The collection has no routing entry.
    #[error("namespace not sharded: {0}")]
    NamespaceNotSharded(Namespace),

    /// Illegal phase transition attempted.
    #[error("invalid phase transition: {from} -> {to}")]
    InvalidTransition {
        from: CoordinatorPhase,
        to: CoordinatorPhase,
    },

    /// A persisted record violates a structural invariant.
    #[error("record invariant violated: {0}")]
    InvariantViolation(String),

    /// This process does not currently hold coordinator authority.
    #[error("not the coordinator leader")]
    NotLeader,

    /// The instance stopped without reaching a terminal phase (step-down,
    /// shutdown, or deferred to a newer authority).
    #[error("resharding instance interrupted")]
    Interrupted,

    /// Configuration errors.
    #[error("config error: {0}")]
    Config(String),

    /// The operation timed out.
    #[error("operation timed out")]
    Timeout,

    /// Generic internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same call might succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Network(e) => e.is_transient(),
            Error::Timeout => true,
            _ => false,
        }
    }
}

/// Placement errors raised by the shard-set planner.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlacementError {
    /// Zones were declared but the directory assigns no shard to one of them.
    #[error("zone '{0}' has no shard assignment")]
    UnassignedZone(String),

    /// Preset chunk ranges and a chunk-count hint are mutually exclusive.
    #[error("preset chunk ranges and numInitialChunks are mutually exclusive")]
    ConflictingChunkHints,

    /// Preset chunks name a shard that does not exist.
    #[error("unknown shard in placement: {0}")]
    UnknownShard(ShardId),

    /// The cluster has no shards to place data on.
    #[error("no shards available for placement")]
    NoShardsAvailable,
}

/// Network communication errors.
#[derive(Error, Debug)]
pub enum NetworkError {
    /// Connection failed.
    #[error("connection failed to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Connection was closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// No address is known for the shard.
    #[error("no address for shard {0}")]
    UnknownShard(ShardId),

    /// Failed to receive message.
    #[error("receive failed: {0}")]
    ReceiveFailed(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl NetworkError {
    /// Connection-level failures may clear up; a malformed or oversized
    /// reply will come back the same way.
    pub fn is_transient(&self) -> bool {
        !matches!(
            self,
            NetworkError::Serialization(_) | NetworkError::ReceiveFailed(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Network(NetworkError::Serialization(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::Network(NetworkError::ConnectionClosed).is_transient());
        assert!(Error::Network(NetworkError::UnknownShard(ShardId::from("shardA"))).is_transient());

        assert!(!Error::Network(NetworkError::Serialization("bad tag".into())).is_transient());
        assert!(!Error::Network(NetworkError::ReceiveFailed("frame too large".into())).is_transient());
        assert!(!Error::NotLeader.is_transient());
    }
}
