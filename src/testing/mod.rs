//! Testing utilities for resharding.
//!
//! This module provides tools for exercising the coordinator end to end:
//! - Simulated participant shards with fault injection
//! - A cluster fixture wiring store, directory and shards together
//! - Polling helpers
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    ReshardingTestCluster                        │
//! │                                                                 │
//! │  ┌──────────────────┐  ┌──────────────────┐  ┌───────────────┐  │
//! │  │ CoordinatorStore │  │ RoutingDirectory │  │SimulatedCluster│ │
//! │  │ (memory or file) │  │   (in memory)    │  │ - faults      │  │
//! │  └──────────────────┘  └──────────────────┘  │ - crashes     │  │
//! │            ▲                    ▲            └───────────────┘  │
//! │            └──────── InstanceRegistry ───────────────┘          │
//! │                   (one per simulated leader)                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use reshard::testing::ReshardingTestCluster;
//! use std::time::Duration;
//!
//! let cluster = ReshardingTestCluster::new(&["shardA", "shardB"]);
//! let registry = cluster.leader().await;
//! let handle = registry.get_or_create(cluster.request(&["region"])).await?;
//! handle.await_completion(Duration::from_secs(10)).await?;
//! ```

mod simulated;
mod utils;

mod resharding_e2e_tests;

pub use simulated::{
    ReceivedCommand, ShardFault, SimulatedCluster, SimulatedShard, SimulationConfig,
};
pub use utils::wait_for;

use crate::config::ReshardingConfig;
use crate::resharding::{
    split_even, CoordinatorStore, InMemoryCoordinatorStore, InMemoryRoutingDirectory,
    InstanceRegistry, ReshardRequest,
};
use crate::types::{ChunkRange, Namespace, ShardId, ShardKeyPattern};
use std::sync::Arc;
use std::time::Instant;
use uuid::Uuid;

/// A sharded collection plus everything a coordinator needs around it.
#[derive(Debug)]
pub struct ReshardingTestCluster {
    /// Durable coordinator records, shared by every simulated leader.
    pub store: Arc<dyn CoordinatorStore>,

    pub directory: Arc<InMemoryRoutingDirectory>,

    pub shards: Arc<SimulatedCluster>,

    pub config: ReshardingConfig,

    /// `db.coll`, sharded on `{id: 1}`; one chunk on the first shard unless
    /// built with explicit owners.
    pub namespace: Namespace,

    pub source_collection_id: Uuid,

    /// When the test started.
    pub started_at: Instant,
}

impl ReshardingTestCluster {
    /// Create a cluster with an in-memory store and default simulation.
    pub fn new(shard_ids: &[&str]) -> Self {
        Self::with_parts(
            shard_ids,
            SimulationConfig::default(),
            Arc::new(InMemoryCoordinatorStore::new()),
        )
    }

    /// Create a cluster with a custom simulation.
    pub fn with_simulation(shard_ids: &[&str], simulation: SimulationConfig) -> Self {
        Self::with_parts(
            shard_ids,
            simulation,
            Arc::new(InMemoryCoordinatorStore::new()),
        )
    }

    /// Create a cluster around an existing store.
    pub fn with_parts(
        shard_ids: &[&str],
        simulation: SimulationConfig,
        store: Arc<dyn CoordinatorStore>,
    ) -> Self {
        let first = shard_ids.first().copied().unwrap_or("shardA");
        Self::build(shard_ids, &[first], simulation, store)
    }

    /// Create a cluster whose `db.coll` is split evenly across `owners`,
    /// one chunk each, so every owner is a donor.
    pub fn with_source_owners(shard_ids: &[&str], owners: &[&str]) -> Self {
        Self::build(
            shard_ids,
            owners,
            SimulationConfig::default(),
            Arc::new(InMemoryCoordinatorStore::new()),
        )
    }

    fn build(
        shard_ids: &[&str],
        owners: &[&str],
        simulation: SimulationConfig,
        store: Arc<dyn CoordinatorStore>,
    ) -> Self {
        let directory = Arc::new(InMemoryRoutingDirectory::with_shards(shard_ids));
        let namespace = Namespace::new("db", "coll");
        let key = ShardKeyPattern::ascending(&["id"]);
        let chunks = split_even(&key, owners.len())
            .into_iter()
            .zip(owners)
            .map(|((min, max), owner)| ChunkRange::new(min, max, ShardId::from(*owner)))
            .collect();
        let source_collection_id = directory.create_collection(namespace.clone(), key, chunks);

        Self {
            store,
            directory,
            shards: Arc::new(SimulatedCluster::with_config(shard_ids, simulation)),
            config: ReshardingConfig::fast(),
            namespace,
            source_collection_id,
            started_at: Instant::now(),
        }
    }

    pub fn with_config(mut self, config: ReshardingConfig) -> Self {
        self.config = config;
        self
    }

    /// A fresh registry over the shared store, directory and shards.
    pub fn registry(&self) -> InstanceRegistry {
        InstanceRegistry::new(
            self.store.clone(),
            self.directory.clone(),
            self.shards.clone(),
            self.config.clone(),
        )
        .unwrap_or_else(|e| panic!("invalid test config: {}", e))
    }

    /// A registry that has already stepped up.
    pub async fn leader(&self) -> InstanceRegistry {
        let registry = self.registry();
        registry
            .step_up()
            .await
            .unwrap_or_else(|e| panic!("step up failed: {}", e));
        registry
    }

    /// Request resharding `db.coll` onto an ascending key of `fields`.
    pub fn request(&self, fields: &[&str]) -> ReshardRequest {
        ReshardRequest::new(self.namespace.clone(), ShardKeyPattern::ascending(fields))
    }

    /// Collection id currently routing `db.coll`.
    pub fn routed_collection_id(&self) -> Option<Uuid> {
        self.directory
            .table(&self.namespace)
            .map(|t| t.collection_id)
    }
}
