//! Instance registry.
//!
//! Keeps at most one live coordinator instance per namespace on the current
//! leader. New requests either join the running instance (same shard key) or
//! are refused; stepping up re-hydrates every non-terminal record from the
//! store, and stepping down stops every instance without touching its record.

use super::cleanup::CleanupManager;
use super::coordinator::{spawn_instance, CoordinatorServices, ReshardingHandle};
use super::participant::{ParticipantProxy, ParticipantTransport};
use super::phase::CoordinatorPhase;
use super::planner::ShardSetPlanner;
use super::record::CoordinationRecord;
use super::request::ReshardRequest;
use super::routing::RoutingDirectory;
use super::store::CoordinatorStore;
use crate::config::ReshardingConfig;
use crate::error::{Error, Result};
use crate::metrics::ReshardingMetrics;
use crate::types::Namespace;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// Owns the coordinator instances of this node.
#[derive(Debug)]
pub struct InstanceRegistry {
    services: CoordinatorServices,
    planner: ShardSetPlanner,
    is_leader: AtomicBool,
    /// Serializes creation and re-hydration.
    creation_lock: tokio::sync::Mutex<()>,
    instances: RwLock<HashMap<Namespace, Arc<ReshardingHandle>>>,
}

impl InstanceRegistry {
    /// Create a registry. It starts as a follower; call [`step_up`](Self::step_up).
    pub fn new(
        store: Arc<dyn CoordinatorStore>,
        directory: Arc<dyn RoutingDirectory>,
        transport: Arc<dyn ParticipantTransport>,
        config: ReshardingConfig,
    ) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(ReshardingMetrics::new());
        let proxy = ParticipantProxy::new(transport, config.clone(), metrics.clone());
        let cleanup = Arc::new(CleanupManager::new(
            proxy.clone(),
            config.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            planner: ShardSetPlanner::new(directory.clone()),
            services: CoordinatorServices {
                store,
                directory,
                proxy,
                cleanup,
                config,
                metrics,
            },
            is_leader: AtomicBool::new(false),
            creation_lock: tokio::sync::Mutex::new(()),
            instances: RwLock::new(HashMap::new()),
        })
    }

    pub fn metrics(&self) -> &Arc<ReshardingMetrics> {
        &self.services.metrics
    }

    pub fn cleanup(&self) -> &Arc<CleanupManager> {
        &self.services.cleanup
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Start or join a resharding operation for the request's namespace.
    ///
    /// A request for a namespace that is already resharding to the same key
    /// returns the existing handle; a different key is refused with
    /// `ConflictingOperationInProgress`.
    #[tracing::instrument(skip(self, request), fields(namespace = %request.namespace))]
    pub async fn get_or_create(&self, request: ReshardRequest) -> Result<Arc<ReshardingHandle>> {
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }

        let directory = &self.services.directory;
        let authoritative_zones = directory.get_collection_zones(&request.namespace).await?;
        let request = request.validate(&authoritative_zones)?;
        let namespace = request.namespace.clone();

        let _guard = self.creation_lock.lock().await;
        if !self.is_leader() {
            return Err(Error::NotLeader);
        }

        if let Some(handle) = self.live_instance(&namespace) {
            if handle.new_shard_key() == &request.new_shard_key {
                tracing::debug!(operation_id = %handle.operation_id(), "Joining running operation");
                return Ok(handle);
            }
            return Err(Error::ConflictingOperationInProgress {
                namespace,
                operation_id: handle.operation_id(),
            });
        }

        if let Some(record) = self.services.store.find_active(&namespace).await? {
            if record.new_shard_key != request.new_shard_key {
                return Err(Error::ConflictingOperationInProgress {
                    namespace,
                    operation_id: record.operation_id,
                });
            }
            tracing::info!(
                operation_id = %record.operation_id,
                phase = %record.phase,
                "Found persisted operation without an instance, resuming"
            );
            self.services.metrics.operations_resumed.inc();
            return Ok(self.spawn(record));
        }

        let source = directory
            .get_routing_table(&namespace)
            .await?
            .ok_or_else(|| Error::NamespaceNotSharded(namespace.clone()))?;
        let plan = self.planner.plan(&request).await?;

        let mut record = CoordinationRecord::new(
            Uuid::new_v4(),
            namespace,
            source.collection_id,
            request.new_shard_key,
            plan.donors,
            plan.recipients,
            plan.chunks,
            request.zones,
            request.preset_chunks,
        );
        record.transition_to(CoordinatorPhase::Initializing)?;
        record.revision = self.services.store.insert(&record).await?;
        self.services.metrics.operations_started.inc();

        tracing::info!(
            operation_id = %record.operation_id,
            donors = record.donor_shards.len(),
            recipients = record.recipient_shards.len(),
            chunks = record.initial_chunks.len(),
            "Created resharding operation"
        );
        Ok(self.spawn(record))
    }

    /// Become leader and resume every non-terminal operation in the store.
    ///
    /// Returns the number of instances started.
    pub async fn step_up(&self) -> Result<usize> {
        let _guard = self.creation_lock.lock().await;
        self.is_leader.store(true, Ordering::SeqCst);

        let records = self.services.store.load_all_active().await?;
        let mut resumed = 0;
        for record in records {
            if let Some(handle) = self.live_instance(&record.source_namespace) {
                if handle.operation_id() == record.operation_id {
                    continue;
                }
            }
            tracing::info!(
                operation_id = %record.operation_id,
                namespace = %record.source_namespace,
                phase = %record.phase,
                "Resuming resharding operation"
            );
            self.services.metrics.operations_resumed.inc();
            self.spawn(record);
            resumed += 1;
        }

        tracing::info!(resumed, "Stepped up as resharding coordinator");
        Ok(resumed)
    }

    /// Lose leadership: stop every instance and wait for them to exit.
    ///
    /// Records are left as persisted so the next leader can resume them.
    pub async fn step_down(&self) {
        self.is_leader.store(false, Ordering::SeqCst);
        // A creation already past its leader check registers before the drain.
        let _guard = self.creation_lock.lock().await;
        let handles: Vec<_> = self.instances.write().drain().map(|(_, h)| h).collect();

        for handle in &handles {
            handle.stop();
        }
        for handle in &handles {
            handle.wait_exited().await;
        }
        tracing::info!(stopped = handles.len(), "Stepped down as resharding coordinator");
    }

    /// Request a user abort of the operation running on `namespace`.
    pub fn abort(&self, namespace: &Namespace) -> Result<()> {
        let handle = self
            .live_instance(namespace)
            .ok_or_else(|| Error::NamespaceNotResharding(namespace.clone()))?;
        tracing::info!(operation_id = %handle.operation_id(), %namespace, "Abort requested");
        handle.abort();
        Ok(())
    }

    /// Handle of the most recent instance for `namespace`, finished or not.
    pub fn get(&self, namespace: &Namespace) -> Option<Arc<ReshardingHandle>> {
        self.instances.read().get(namespace).cloned()
    }

    /// Number of instances still running.
    pub fn active_count(&self) -> usize {
        self.instances
            .read()
            .values()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Step down and stop background cleanup.
    pub async fn shutdown(&self) {
        self.step_down().await;
        self.services.cleanup.shutdown();
    }

    fn live_instance(&self, namespace: &Namespace) -> Option<Arc<ReshardingHandle>> {
        self.instances
            .read()
            .get(namespace)
            .filter(|h| !h.is_finished())
            .cloned()
    }

    fn spawn(&self, record: CoordinationRecord) -> Arc<ReshardingHandle> {
        let namespace = record.source_namespace.clone();
        let handle = spawn_instance(record, self.services.clone());
        self.instances.write().insert(namespace, handle.clone());
        handle
    }
}
