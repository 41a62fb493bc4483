//! Coordinator and participant phases.
//!
//! The coordinator moves strictly forward through the commit branch:
//!
//! ```text
//! Unused -> Initializing -> PreparingToDonate -> Cloning -> Applying
//!        -> BlockingWrites -> Committing -> Done
//! ```
//!
//! Any non-terminal phase may instead move to `Aborting`, which always ends in
//! `DoneAborted`. Participants have their own sub-phases; each one is only
//! legal once the coordinator has reached the phase that issues it.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a resharding coordination instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CoordinatorPhase {
    /// Freshly constructed, never persisted.
    Unused,

    /// Record persisted; temporary routing being registered.
    Initializing,

    /// Donors are preparing and reporting their minimum fetch timestamps.
    PreparingToDonate,

    /// Recipients are copying a snapshot at the fetch timestamp.
    Cloning,

    /// Recipients are applying buffered changes.
    Applying,

    /// Donors block writes; recipients converge to strict consistency.
    BlockingWrites,

    /// Routing is being swapped and participants cleaned up.
    Committing,

    /// Terminal: the collection is served under the new key.
    Done,

    /// Participants are being told to abandon the operation.
    Aborting,

    /// Terminal: the operation was abandoned; the source is unchanged.
    DoneAborted,
}

impl CoordinatorPhase {
    /// Position in the commit branch. Abort-branch phases rank after it.
    pub fn rank(&self) -> u8 {
        match self {
            Self::Unused => 0,
            Self::Initializing => 1,
            Self::PreparingToDonate => 2,
            Self::Cloning => 3,
            Self::Applying => 4,
            Self::BlockingWrites => 5,
            Self::Committing => 6,
            Self::Done => 7,
            Self::Aborting => 8,
            Self::DoneAborted => 9,
        }
    }

    /// Whether no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::DoneAborted)
    }

    /// Whether this phase belongs to the abort branch.
    pub fn is_aborting(&self) -> bool {
        matches!(self, Self::Aborting | Self::DoneAborted)
    }

    /// Whether the routing swap may already have happened.
    ///
    /// Once here, user aborts are ignored. Only a routing conflict, which
    /// proves the swap did not happen, can still abort.
    pub fn is_past_commit_point(&self) -> bool {
        matches!(self, Self::Committing | Self::Done)
    }

    /// The next phase on the commit branch, if any.
    pub fn next_forward(&self) -> Option<Self> {
        match self {
            Self::Unused => Some(Self::Initializing),
            Self::Initializing => Some(Self::PreparingToDonate),
            Self::PreparingToDonate => Some(Self::Cloning),
            Self::Cloning => Some(Self::Applying),
            Self::Applying => Some(Self::BlockingWrites),
            Self::BlockingWrites => Some(Self::Committing),
            Self::Committing => Some(Self::Done),
            Self::Aborting => Some(Self::DoneAborted),
            Self::Done | Self::DoneAborted => None,
        }
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition_to(&self, to: CoordinatorPhase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if to == Self::Aborting {
            return *self != Self::Aborting;
        }
        self.next_forward() == Some(to)
    }
}

impl fmt::Display for CoordinatorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unused => write!(f, "unused"),
            Self::Initializing => write!(f, "initializing"),
            Self::PreparingToDonate => write!(f, "preparing-to-donate"),
            Self::Cloning => write!(f, "cloning"),
            Self::Applying => write!(f, "applying"),
            Self::BlockingWrites => write!(f, "blocking-writes"),
            Self::Committing => write!(f, "committing"),
            Self::Done => write!(f, "done"),
            Self::Aborting => write!(f, "aborting"),
            Self::DoneAborted => write!(f, "done-aborted"),
        }
    }
}

/// Sub-phase of a donor shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DonorPhase {
    Unused,
    Preparing,
    Ready,
    Donating,
    BlockingWrites,
    Done,
    Aborted,
}

impl DonorPhase {
    /// The coordinator phase that issues the command producing this sub-phase.
    pub fn required_coordinator_phase(&self) -> CoordinatorPhase {
        match self {
            Self::Unused => CoordinatorPhase::Unused,
            Self::Preparing | Self::Ready => CoordinatorPhase::PreparingToDonate,
            Self::Donating => CoordinatorPhase::Cloning,
            Self::BlockingWrites => CoordinatorPhase::BlockingWrites,
            Self::Done => CoordinatorPhase::Committing,
            Self::Aborted => CoordinatorPhase::Aborting,
        }
    }
}

impl fmt::Display for DonorPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unused => write!(f, "unused"),
            Self::Preparing => write!(f, "preparing"),
            Self::Ready => write!(f, "ready"),
            Self::Donating => write!(f, "donating"),
            Self::BlockingWrites => write!(f, "blocking-writes"),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Sub-phase of a recipient shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RecipientPhase {
    Unused,
    Cloning,
    Cloned,
    Applying,
    Consistent,
    StrictlyConsistent,
    Done,
    Aborted,
}

impl RecipientPhase {
    /// The coordinator phase that issues the command producing this sub-phase.
    pub fn required_coordinator_phase(&self) -> CoordinatorPhase {
        match self {
            Self::Unused => CoordinatorPhase::Unused,
            Self::Cloning | Self::Cloned => CoordinatorPhase::Cloning,
            Self::Applying | Self::Consistent => CoordinatorPhase::Applying,
            Self::StrictlyConsistent => CoordinatorPhase::BlockingWrites,
            Self::Done => CoordinatorPhase::Committing,
            Self::Aborted => CoordinatorPhase::Aborting,
        }
    }
}

impl fmt::Display for RecipientPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unused => write!(f, "unused"),
            Self::Cloning => write!(f, "cloning"),
            Self::Cloned => write!(f, "cloned"),
            Self::Applying => write!(f, "applying"),
            Self::Consistent => write!(f, "consistent"),
            Self::StrictlyConsistent => write!(f, "strictly-consistent"),
            Self::Done => write!(f, "done"),
            Self::Aborted => write!(f, "aborted"),
        }
    }
}

/// Whether a participant sub-phase is legal under the given coordinator phase.
///
/// In the abort branch every sub-phase is legal, since participants may have
/// advanced arbitrarily far before the abort.
pub fn participant_phase_allowed(
    coordinator: CoordinatorPhase,
    required: CoordinatorPhase,
) -> bool {
    if coordinator.is_aborting() {
        return true;
    }
    if required == CoordinatorPhase::Aborting {
        return false;
    }
    required.rank() <= coordinator.rank()
}
