//! Failover-resilient resharding coordinator for a sharded document database.
//!
//! Resharding changes the shard key of a live collection. This crate provides
//! the config-server side of that protocol:
//! - **Coordinator state machine** driving donors and recipients through
//!   prepare, clone, apply, critical section and commit
//! - **Durable coordination records** persisted with compare-and-swap, so a
//!   new leader resumes exactly where the old one stopped
//! - **Participant proxy** with idempotent commands, retries and deadlines
//! - **Atomic routing swap** that is safe to repeat when its outcome is unknown
//!
//! # Example
//!
//! ```rust,no_run
//! use reshard::{InstanceRegistry, ReshardRequest, ReshardingConfig};
//! use reshard::resharding::{InMemoryCoordinatorStore, InMemoryRoutingDirectory};
//! use reshard::network::TcpParticipantTransport;
//! use reshard::{Namespace, ShardKeyPattern};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryCoordinatorStore::new());
//!     let directory = Arc::new(InMemoryRoutingDirectory::with_shards(&["shardA", "shardB"]));
//!     let transport = Arc::new(TcpParticipantTransport::new(Default::default()));
//!
//!     let registry = InstanceRegistry::new(store, directory, transport, ReshardingConfig::default())?;
//!     registry.step_up().await?;
//!
//!     let request = ReshardRequest::new(
//!         Namespace::new("db", "coll"),
//!         ShardKeyPattern::ascending(&["region"]),
//!     );
//!     let handle = registry.get_or_create(request).await?;
//!     let outcome = handle.await_completion(Duration::from_secs(600)).await?;
//!     println!("resharding {}", outcome);
//!
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │              Admin command layer             │
//! └─────────────────────────────────────────────┘
//!                     │
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │             InstanceRegistry                │
//! │  • get_or_create(request) -> handle         │
//! │  • abort(namespace)                         │
//! │  • step_up() / step_down()                  │
//! └─────────────────────────────────────────────┘
//!                     │
//!     ┌───────────────┼───────────────┐
//!     ▼               ▼               ▼
//! ┌─────────┐   ┌──────────┐   ┌─────────────┐
//! │  Store  │   │ Routing  │   │ Participant │
//! │  (CAS)  │   │Directory │   │   Proxy     │
//! └─────────┘   └──────────┘   └─────────────┘
//! ```
//!
//! # Consistency Model
//!
//! - **Record writes**: compare-and-swap on phase and revision; a stale
//!   coordinator loses its first write and stops
//! - **Participant commands**: idempotent, safe to resend after failover
//! - **Commit point**: the routing swap; once `Committing` is persisted the
//!   operation only finishes by committing, unless the swap proves impossible

pub mod config;
pub mod error;
pub mod metrics;
pub mod network;
pub mod resharding;
pub mod testing;
pub mod types;

// Re-export main types for convenience
pub use config::{NetworkConfig, ReshardingConfig, RetryPolicy};
pub use error::{Error, NetworkError, PlacementError, Result};
pub use types::{
    ChunkRange, KeyBound, KeyOrder, KeyValue, Namespace, ShardId, ShardKeyField,
    ShardKeyPattern, Timestamp, Zone,
};

// Re-export coordinator types
pub use resharding::{
    AbortKind, AbortReason, Completion, CoordinationRecord, CoordinatorPhase, InstanceRegistry,
    ReshardRequest, ReshardingHandle,
};

// Re-export metrics types
pub use metrics::{
    Counter, Gauge, Histogram, HistogramSnapshot, LabeledCounter, MetricsSnapshot,
    ReshardingMetrics, DURATION_BUCKETS,
};
