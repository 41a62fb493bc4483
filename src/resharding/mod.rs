//! Resharding coordination.
//!
//! This module rewrites the shard key of a collection by coordinating donor
//! and recipient shards through a persisted, resumable state machine.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      InstanceRegistry                        │
//! │   validate ─▶ plan ─▶ insert record ─▶ spawn instance        │
//! └──────────────────────────────────────────────────────────────┘
//!                 │                              │
//!                 ▼                              ▼
//! ┌──────────────────────────┐    ┌──────────────────────────────┐
//! │   CoordinatorInstance    │───▶│      ParticipantProxy        │
//! │  phase loop, CAS persist │    │  retry, deadline, fan-out    │
//! └──────────────────────────┘    └──────────────────────────────┘
//!        │            │                          │
//!        ▼            ▼                          ▼
//! ┌────────────┐ ┌──────────────────┐  ┌────────────────────────┐
//! │ Coordinator│ │ RoutingDirectory │  │  donor / recipient     │
//! │   Store    │ │  atomic swap     │  │  shards                │
//! └────────────┘ └──────────────────┘  └────────────────────────┘
//! ```
//!
//! # Phases
//!
//! | Phase | Work |
//! |-------|------|
//! | `Initializing` | register temporary routing |
//! | `PreparingToDonate` | donors report minimum fetch timestamps |
//! | `Cloning` | recipients copy a snapshot at the fetch timestamp |
//! | `Applying` | recipients catch up on buffered changes |
//! | `BlockingWrites` | donors block writes; recipients become strictly consistent |
//! | `Committing` | routing swap, participant cleanup |
//! | `Aborting` | participants discard partial state |

pub mod cleanup;
pub mod coordinator;
pub mod participant;
pub mod phase;
pub mod planner;
pub mod record;
pub mod registry;
pub mod request;
pub mod routing;
pub mod store;

pub use cleanup::{CleanupManager, CleanupResult, CleanupTarget};
pub use coordinator::{Completion, CoordinatorServices, ReshardingHandle};
pub use participant::{
    FanOutResult, ParticipantCommand, ParticipantOutcome, ParticipantProxy, ParticipantReply,
    ParticipantRequest, ParticipantRole, ParticipantTransport,
};
pub use phase::{CoordinatorPhase, DonorPhase, RecipientPhase};
pub use planner::{split_even, PlacementPlan, ShardSetPlanner};
pub use record::{
    AbortKind, AbortReason, CloneProgress, CoordinationRecord, DonorShardEntry,
    RecipientShardEntry,
};
pub use registry::InstanceRegistry;
pub use request::{Collation, ReshardRequest, ValidatedRequest};
pub use routing::{InMemoryRoutingDirectory, RoutingDirectory, RoutingTable, SwapOutcome};
pub use store::{CoordinatorStore, FileCoordinatorStore, InMemoryCoordinatorStore};
