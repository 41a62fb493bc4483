//! Routing directory interface.
//!
//! The routing directory is the authoritative catalog mapping each collection
//! to its shard key and chunk layout. The coordinator only reads it, registers
//! and drops the temporary namespace, and performs the single atomic swap at
//! commit.

use crate::error::{Error, Result};
use crate::types::{ChunkRange, Namespace, ShardId, ShardKeyPattern, Zone};
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU32, Ordering};
use uuid::Uuid;

/// Routing entry for one collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    pub namespace: Namespace,
    /// Identity of the collection incarnation this table routes.
    pub collection_id: Uuid,
    pub shard_key: ShardKeyPattern,
    pub chunks: Vec<ChunkRange>,
    pub version: u64,
}

impl RoutingTable {
    pub fn new(
        namespace: Namespace,
        collection_id: Uuid,
        shard_key: ShardKeyPattern,
        chunks: Vec<ChunkRange>,
    ) -> Self {
        Self {
            namespace,
            collection_id,
            shard_key,
            chunks,
            version: 1,
        }
    }

    /// Distinct shards owning at least one chunk, sorted.
    pub fn owners(&self) -> Vec<ShardId> {
        self.chunks
            .iter()
            .map(|c| c.shard.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// Result of an atomic routing swap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// The new table is installed (now or by an earlier attempt).
    Swapped,
    /// The namespace is routed under an unexpected collection identity.
    Conflict { found: Option<Uuid> },
}

/// The external catalog/routing service.
#[async_trait]
pub trait RoutingDirectory: Send + Sync + std::fmt::Debug {
    /// Shards currently owning chunks of the namespace.
    async fn get_current_owners(&self, namespace: &Namespace) -> Result<Vec<ShardId>>;

    /// Zone name to the shards tagged with it.
    async fn get_zone_assignments(&self) -> Result<HashMap<String, Vec<ShardId>>>;

    /// Zone ranges currently declared on the collection.
    async fn get_collection_zones(&self, namespace: &Namespace) -> Result<Vec<Zone>>;

    /// Current routing table of the namespace, if it is sharded.
    async fn get_routing_table(&self, namespace: &Namespace) -> Result<Option<RoutingTable>>;

    /// All shards in the cluster, sorted.
    async fn list_shards(&self) -> Result<Vec<ShardId>>;

    /// Number of chunks each shard owns across all collections.
    async fn chunk_counts(&self) -> Result<HashMap<ShardId, usize>>;

    /// Register the routing entry of a temporary namespace. Idempotent.
    async fn register_temporary(&self, table: RoutingTable) -> Result<()>;

    /// Remove a namespace's routing entry. Idempotent.
    async fn drop_routing(&self, namespace: &Namespace) -> Result<()>;

    /// Replace the namespace's table if it is still routed under
    /// `expected_collection_id`. Re-applying the same swap reports `Swapped`.
    async fn atomically_swap_routing(
        &self,
        namespace: &Namespace,
        expected_collection_id: Uuid,
        new_table: RoutingTable,
    ) -> Result<SwapOutcome>;
}

#[derive(Debug, Default)]
struct DirectoryState {
    tables: HashMap<Namespace, RoutingTable>,
    shards: BTreeSet<ShardId>,
    zones: HashMap<String, BTreeSet<ShardId>>,
    collection_zones: HashMap<Namespace, Vec<Zone>>,
}

/// In-memory routing directory.
#[derive(Debug, Default)]
pub struct InMemoryRoutingDirectory {
    state: RwLock<DirectoryState>,
    /// Swaps that apply and then report a transient error.
    ambiguous_swaps: AtomicU32,
    /// Swaps that fail without applying.
    failed_swaps: AtomicU32,
}

impl InMemoryRoutingDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Directory with the given shards and no collections.
    pub fn with_shards(shards: &[&str]) -> Self {
        let directory = Self::new();
        for shard in shards {
            directory.add_shard(ShardId::from(*shard));
        }
        directory
    }

    pub fn add_shard(&self, shard: ShardId) {
        self.state.write().shards.insert(shard);
    }

    /// Tag a shard with a zone.
    pub fn assign_zone(&self, zone: impl Into<String>, shard: ShardId) {
        self.state
            .write()
            .zones
            .entry(zone.into())
            .or_default()
            .insert(shard);
    }

    /// Declare zone ranges on a collection.
    pub fn set_collection_zones(&self, namespace: Namespace, zones: Vec<Zone>) {
        self.state.write().collection_zones.insert(namespace, zones);
    }

    /// Shard a collection with the given chunks. Returns its collection id.
    pub fn create_collection(
        &self,
        namespace: Namespace,
        shard_key: ShardKeyPattern,
        chunks: Vec<ChunkRange>,
    ) -> Uuid {
        let collection_id = Uuid::new_v4();
        let mut state = self.state.write();
        for chunk in &chunks {
            state.shards.insert(chunk.shard.clone());
        }
        state.tables.insert(
            namespace.clone(),
            RoutingTable::new(namespace, collection_id, shard_key, chunks),
        );
        collection_id
    }

    /// Make the next `n` swaps apply, then return a transient error.
    pub fn fail_next_swaps_after_apply(&self, n: u32) {
        self.ambiguous_swaps.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` swaps fail without applying.
    pub fn fail_next_swaps(&self, n: u32) {
        self.failed_swaps.store(n, Ordering::SeqCst);
    }

    /// Synchronous snapshot of a table, for tests and demos.
    pub fn table(&self, namespace: &Namespace) -> Option<RoutingTable> {
        self.state.read().tables.get(namespace).cloned()
    }

    fn take_fault(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl RoutingDirectory for InMemoryRoutingDirectory {
    async fn get_current_owners(&self, namespace: &Namespace) -> Result<Vec<ShardId>> {
        self.state
            .read()
            .tables
            .get(namespace)
            .map(RoutingTable::owners)
            .ok_or_else(|| Error::NamespaceNotSharded(namespace.clone()))
    }

    async fn get_zone_assignments(&self) -> Result<HashMap<String, Vec<ShardId>>> {
        Ok(self
            .state
            .read()
            .zones
            .iter()
            .map(|(zone, shards)| (zone.clone(), shards.iter().cloned().collect()))
            .collect())
    }

    async fn get_collection_zones(&self, namespace: &Namespace) -> Result<Vec<Zone>> {
        Ok(self
            .state
            .read()
            .collection_zones
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn get_routing_table(&self, namespace: &Namespace) -> Result<Option<RoutingTable>> {
        Ok(self.table(namespace))
    }

    async fn list_shards(&self) -> Result<Vec<ShardId>> {
        Ok(self.state.read().shards.iter().cloned().collect())
    }

    async fn chunk_counts(&self) -> Result<HashMap<ShardId, usize>> {
        let state = self.state.read();
        let mut counts: HashMap<ShardId, usize> =
            state.shards.iter().map(|s| (s.clone(), 0)).collect();
        for table in state.tables.values() {
            for chunk in &table.chunks {
                *counts.entry(chunk.shard.clone()).or_default() += 1;
            }
        }
        Ok(counts)
    }

    async fn register_temporary(&self, table: RoutingTable) -> Result<()> {
        let mut state = self.state.write();
        match state.tables.get(&table.namespace) {
            Some(existing) if existing.collection_id == table.collection_id => Ok(()),
            Some(existing) => Err(Error::Internal(format!(
                "temporary namespace {} already registered for collection {}",
                existing.namespace, existing.collection_id
            ))),
            None => {
                state.tables.insert(table.namespace.clone(), table);
                Ok(())
            }
        }
    }

    async fn drop_routing(&self, namespace: &Namespace) -> Result<()> {
        self.state.write().tables.remove(namespace);
        Ok(())
    }

    async fn atomically_swap_routing(
        &self,
        namespace: &Namespace,
        expected_collection_id: Uuid,
        mut new_table: RoutingTable,
    ) -> Result<SwapOutcome> {
        if Self::take_fault(&self.failed_swaps) {
            return Err(Error::Timeout);
        }

        let outcome = {
            let mut state = self.state.write();
            let current = state.tables.get(namespace).cloned();
            match current {
                Some(table) if table.collection_id == new_table.collection_id => {
                    SwapOutcome::Swapped
                }
                Some(table) if table.collection_id == expected_collection_id => {
                    new_table.namespace = namespace.clone();
                    new_table.version = table.version + 1;
                    state.tables.insert(namespace.clone(), new_table);
                    SwapOutcome::Swapped
                }
                other => SwapOutcome::Conflict {
                    found: other.map(|t| t.collection_id),
                },
            }
        };

        if outcome == SwapOutcome::Swapped && Self::take_fault(&self.ambiguous_swaps) {
            return Err(Error::Timeout);
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::KeyBound;

    fn setup() -> (InMemoryRoutingDirectory, Namespace, Uuid) {
        let directory = InMemoryRoutingDirectory::with_shards(&["shardA", "shardB", "shardC"]);
        let ns = Namespace::new("db", "coll");
        let key = ShardKeyPattern::ascending(&["id"]);
        let id = directory.create_collection(
            ns.clone(),
            key.clone(),
            vec![
                ChunkRange::new(key.global_min(), KeyBound::int_prefix(0, 1), ShardId::from("shardA")),
                ChunkRange::new(KeyBound::int_prefix(0, 1), key.global_max(), ShardId::from("shardA")),
            ],
        );
        (directory, ns, id)
    }

    fn new_table(ns: &Namespace, id: Uuid) -> RoutingTable {
        let key = ShardKeyPattern::ascending(&["region"]);
        RoutingTable::new(
            ns.clone(),
            id,
            key.clone(),
            vec![ChunkRange::new(key.global_min(), key.global_max(), ShardId::from("shardB"))],
        )
    }

    #[tokio::test]
    async fn test_owners_and_counts() {
        let (directory, ns, _) = setup();
        assert_eq!(
            directory.get_current_owners(&ns).await.unwrap(),
            vec![ShardId::from("shardA")]
        );
        let counts = directory.chunk_counts().await.unwrap();
        assert_eq!(counts[&ShardId::from("shardA")], 2);
        assert_eq!(counts[&ShardId::from("shardC")], 0);

        let missing = Namespace::new("db", "missing");
        assert!(matches!(
            directory.get_current_owners(&missing).await,
            Err(Error::NamespaceNotSharded(_))
        ));
    }

    #[tokio::test]
    async fn test_swap_is_idempotent() {
        let (directory, ns, old_id) = setup();
        let new_id = Uuid::new_v4();

        let outcome = directory
            .atomically_swap_routing(&ns, old_id, new_table(&ns, new_id))
            .await
            .unwrap();
        assert_eq!(outcome, SwapOutcome::Swapped);

        let table = directory.table(&ns).unwrap();
        assert_eq!(table.collection_id, new_id);
        assert_eq!(table.version, 2);
        assert_eq!(table.owners(), vec![ShardId::from("shardB")]);

        // Retrying the same swap is harmless.
        let outcome = directory
            .atomically_swap_routing(&ns, old_id, new_table(&ns, new_id))
            .await
            .unwrap();
        assert_eq!(outcome, SwapOutcome::Swapped);
        assert_eq!(directory.table(&ns).unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_swap_conflict() {
        let (directory, ns, _) = setup();
        let outcome = directory
            .atomically_swap_routing(&ns, Uuid::new_v4(), new_table(&ns, Uuid::new_v4()))
            .await
            .unwrap();
        assert!(matches!(outcome, SwapOutcome::Conflict { found: Some(_) }));
    }

    #[tokio::test]
    async fn test_ambiguous_swap_applies() {
        let (directory, ns, old_id) = setup();
        let new_id = Uuid::new_v4();
        directory.fail_next_swaps_after_apply(1);

        assert!(directory
            .atomically_swap_routing(&ns, old_id, new_table(&ns, new_id))
            .await
            .is_err());
        assert_eq!(directory.table(&ns).unwrap().collection_id, new_id);
    }

    #[tokio::test]
    async fn test_temporary_registration() {
        let (directory, ns, old_id) = setup();
        let temp_ns = ns.temporary_resharding(old_id);
        let op_id = Uuid::new_v4();

        directory.register_temporary(new_table(&temp_ns, op_id)).await.unwrap();
        directory.register_temporary(new_table(&temp_ns, op_id)).await.unwrap();
        assert!(directory
            .register_temporary(new_table(&temp_ns, Uuid::new_v4()))
            .await
            .is_err());

        directory.drop_routing(&temp_ns).await.unwrap();
        directory.drop_routing(&temp_ns).await.unwrap();
        assert!(directory.table(&temp_ns).is_none());
    }
}
