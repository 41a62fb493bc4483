//! Resharding E2E Test Suite
//!
//! End-to-end runs of the coordinator against simulated shards, verifying:
//! - Commit and abort outcomes and their effect on routing
//! - Resumption after leadership changes at every phase
//! - Fencing of stale coordinator instances
//! - Idempotent handling of ambiguous routing swaps
//!
//! # Test Cases
//!
//! | Scenario                          | Verification                              |
//! |-----------------------------------|-------------------------------------------|
//! | Happy path                        | Done, routing on new key, temp dropped    |
//! | Recipient fails while cloning     | DoneAborted, reason names shard and phase |
//! | Concurrent identical requests     | One record, one instance                  |
//! | Step down / step up at each phase | Resumed instance commits                  |
//! | Swap applied but reported failed  | Commits without a second swap             |
//! | Two instances on one record       | Exactly one survives                      |
//! | User abort                        | Honoured before commit, ignored after     |
//! | Unreachable donor                 | Aborts, background cleanup catches up     |
//! | One of two donors refuses         | Donor that prepared receives abort        |
//! | Zoned request                     | Zone ranges land on zone shards           |
//! | Store fails after user abort      | Retries once per poll interval            |
//! | Step down while creating          | No instance left running on the follower  |
//! | Two outages in critical section   | Not counted as consecutive, commits       |

#[cfg(test)]
mod tests {
    use crate::config::{NetworkConfig, ReshardingConfig};
    use crate::error::{Error, Result};
    use crate::network::{ParticipantServer, TcpParticipantTransport};
    use crate::resharding::{
        AbortKind, Completion, CoordinationRecord, CoordinatorPhase, CoordinatorStore,
        DonorPhase, FileCoordinatorStore, InMemoryCoordinatorStore, InMemoryRoutingDirectory,
        InstanceRegistry, RecipientPhase, ReshardRequest, RoutingDirectory, RoutingTable,
        SwapOutcome,
    };
    use crate::testing::{wait_for, ReshardingTestCluster, ShardFault, SimulationConfig};
    use crate::types::{KeyBound, Namespace, ShardId, ShardKeyPattern, Zone};
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    const COMPLETION_TIMEOUT: Duration = Duration::from_secs(20);

    fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    }

    fn two_shards() -> ReshardingTestCluster {
        init_tracing();
        ReshardingTestCluster::new(&["shardA", "shardB"])
    }

    fn slow_shards(clone_rounds: u32) -> ReshardingTestCluster {
        init_tracing();
        ReshardingTestCluster::with_simulation(
            &["shardA", "shardB"],
            SimulationConfig::default()
                .with_clone_rounds(clone_rounds)
                .with_apply_rounds(3),
        )
    }

    async fn wait_for_phase(
        registry: &InstanceRegistry,
        namespace: &Namespace,
        target: CoordinatorPhase,
    ) {
        let handle = registry.get(namespace).expect("no instance for namespace");
        let mut rx = handle.subscribe_phase();
        tokio::time::timeout(COMPLETION_TIMEOUT, rx.wait_for(|p| p.rank() >= target.rank()))
            .await
            .expect("timed out waiting for phase")
            .expect("instance dropped its phase channel");
    }

    /// In-memory store whose persists can be switched to fail.
    #[derive(Debug)]
    struct FlakyStore {
        inner: InMemoryCoordinatorStore,
        failing: AtomicBool,
        persist_attempts: AtomicU32,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: InMemoryCoordinatorStore::new(),
                failing: AtomicBool::new(false),
                persist_attempts: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl CoordinatorStore for FlakyStore {
        async fn insert(&self, record: &CoordinationRecord) -> Result<u64> {
            self.inner.insert(record).await
        }

        async fn load(&self, operation_id: Uuid) -> Result<Option<CoordinationRecord>> {
            self.inner.load(operation_id).await
        }

        async fn load_all_active(&self) -> Result<Vec<CoordinationRecord>> {
            self.inner.load_all_active().await
        }

        async fn find_active(&self, namespace: &Namespace) -> Result<Option<CoordinationRecord>> {
            self.inner.find_active(namespace).await
        }

        async fn persist(
            &self,
            record: &CoordinationRecord,
            expected_prior_phase: CoordinatorPhase,
        ) -> Result<u64> {
            self.persist_attempts.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                return Err(Error::Storage("store unavailable".to_string()));
            }
            self.inner.persist(record, expected_prior_phase).await
        }
    }

    /// Directory whose shard listing is slow, so planning takes a while.
    #[derive(Debug)]
    struct SlowPlanningDirectory {
        inner: Arc<InMemoryRoutingDirectory>,
        delay: Duration,
    }

    #[async_trait]
    impl RoutingDirectory for SlowPlanningDirectory {
        async fn get_current_owners(&self, namespace: &Namespace) -> Result<Vec<ShardId>> {
            self.inner.get_current_owners(namespace).await
        }

        async fn get_zone_assignments(&self) -> Result<HashMap<String, Vec<ShardId>>> {
            self.inner.get_zone_assignments().await
        }

        async fn get_collection_zones(&self, namespace: &Namespace) -> Result<Vec<Zone>> {
            self.inner.get_collection_zones(namespace).await
        }

        async fn get_routing_table(&self, namespace: &Namespace) -> Result<Option<RoutingTable>> {
            self.inner.get_routing_table(namespace).await
        }

        async fn list_shards(&self) -> Result<Vec<ShardId>> {
            tokio::time::sleep(self.delay).await;
            self.inner.list_shards().await
        }

        async fn chunk_counts(&self) -> Result<HashMap<ShardId, usize>> {
            self.inner.chunk_counts().await
        }

        async fn register_temporary(&self, table: RoutingTable) -> Result<()> {
            self.inner.register_temporary(table).await
        }

        async fn drop_routing(&self, namespace: &Namespace) -> Result<()> {
            self.inner.drop_routing(namespace).await
        }

        async fn atomically_swap_routing(
            &self,
            namespace: &Namespace,
            expected_collection_id: Uuid,
            new_table: RoutingTable,
        ) -> Result<SwapOutcome> {
            self.inner
                .atomically_swap_routing(namespace, expected_collection_id, new_table)
                .await
        }
    }

    // =========================================================================
    // Commit and abort
    // =========================================================================

    #[tokio::test]
    async fn test_happy_path_commits() {
        let cluster = two_shards();
        let registry = cluster.leader().await;

        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        let op = handle.operation_id();
        assert_eq!(
            handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );

        let table = cluster.directory.table(&cluster.namespace).unwrap();
        assert_eq!(table.collection_id, op);
        assert_eq!(table.shard_key, ShardKeyPattern::ascending(&["region"]));
        assert_eq!(table.owners(), vec![ShardId::from("shardB")]);

        let record = cluster.store.load(op).await.unwrap().unwrap();
        assert_eq!(record.phase, CoordinatorPhase::Done);
        assert!(record.fetch_timestamp.is_some());
        assert!(record.block_timestamp.is_some());
        assert!(record.abort_reason.is_none());
        assert!(record
            .donor_shards
            .iter()
            .all(|d| d.phase == DonorPhase::Done));
        assert!(record
            .recipient_shards
            .iter()
            .all(|r| r.phase == RecipientPhase::Done));
        assert!(cluster.directory.table(&record.temporary_namespace).is_none());

        assert_eq!(cluster.shards.shard("shardA").donor_phase(op), Some(DonorPhase::Done));
        assert_eq!(
            cluster.shards.shard("shardB").recipient_phase(op),
            Some(RecipientPhase::Done)
        );

        let metrics = registry.metrics().snapshot();
        assert_eq!(metrics.operations_started, 1);
        assert_eq!(metrics.operations_committed, 1);
        assert_eq!(metrics.active_operations, 0);
        assert_eq!(metrics.critical_section.count, 1);
    }

    #[tokio::test]
    async fn test_recipient_failure_during_cloning_aborts() {
        let cluster = two_shards();
        cluster.shards.shard("shardB").inject_fault(ShardFault::Fatal {
            command: "start-clone",
            message: "disk full".to_string(),
        });
        let registry = cluster.leader().await;

        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        let op = handle.operation_id();

        let reason = match handle.await_completion(COMPLETION_TIMEOUT).await.unwrap() {
            Completion::Aborted(reason) => reason,
            other => panic!("expected abort, got {}", other),
        };
        assert_eq!(reason.kind, AbortKind::ParticipantError);
        assert_eq!(reason.shard_id, Some(ShardId::from("shardB")));
        assert_eq!(reason.phase, CoordinatorPhase::Cloning);
        assert!(reason.message.contains("disk full"));

        assert_eq!(cluster.routed_collection_id(), Some(cluster.source_collection_id));
        let record = cluster.store.load(op).await.unwrap().unwrap();
        assert_eq!(record.phase, CoordinatorPhase::DoneAborted);
        assert_eq!(record.abort_reason, Some(reason));
        assert!(cluster.directory.table(&record.temporary_namespace).is_none());

        assert_eq!(
            cluster.shards.shard("shardA").donor_phase(op),
            Some(DonorPhase::Aborted)
        );
        assert_eq!(
            cluster.shards.shard("shardB").recipient_phase(op),
            Some(RecipientPhase::Aborted)
        );
        assert_eq!(
            registry.metrics().snapshot().aborts_by_kind,
            vec![("participant-error".to_string(), 1)]
        );
    }

    #[tokio::test]
    async fn test_transient_participant_errors_are_retried() {
        let cluster = two_shards();
        cluster.shards.shard("shardB").inject_fault(ShardFault::Transient {
            command: "start-apply",
            times: 3,
        });
        let registry = cluster.leader().await;

        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        assert_eq!(
            handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );
        assert!(registry.metrics().snapshot().participant_retries >= 3);
    }

    #[tokio::test]
    async fn test_donor_rejection_aborts_donors_that_prepared() {
        init_tracing();
        let cluster = ReshardingTestCluster::with_source_owners(
            &["shardA", "shardB", "shardC"],
            &["shardA", "shardC"],
        );
        cluster.shards.shard("shardC").inject_fault(ShardFault::Fatal {
            command: "prepare-donor",
            message: "change stream unavailable".to_string(),
        });
        let registry = cluster.leader().await;

        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        let op = handle.operation_id();

        let reason = match handle.await_completion(COMPLETION_TIMEOUT).await.unwrap() {
            Completion::Aborted(reason) => reason,
            other => panic!("expected abort, got {}", other),
        };
        assert_eq!(reason.kind, AbortKind::ParticipantError);
        assert_eq!(reason.shard_id, Some(ShardId::from("shardC")));
        assert_eq!(reason.phase, CoordinatorPhase::PreparingToDonate);
        assert!(reason.message.contains("change stream unavailable"));

        let record = cluster.store.load(op).await.unwrap().unwrap();
        assert_eq!(
            record.donor_ids(),
            vec![ShardId::from("shardA"), ShardId::from("shardC")]
        );
        assert_eq!(record.phase, CoordinatorPhase::DoneAborted);

        // shardA acked the prepare before shardC refused; it must be told to abort.
        let prepared = cluster.shards.shard("shardA");
        assert!(prepared.command_count(op, "prepare-donor") >= 1);
        assert!(prepared.command_count(op, "abort") >= 1);
        assert_eq!(prepared.donor_phase(op), Some(DonorPhase::Aborted));
        assert_eq!(cluster.routed_collection_id(), Some(cluster.source_collection_id));
    }

    #[tokio::test]
    async fn test_zoned_request_places_zone_ranges() {
        init_tracing();
        let cluster = ReshardingTestCluster::new(&["shardA", "shardB", "shardC"]);
        let zones = vec![
            Zone::new("east", KeyBound::int_prefix(0, 1), KeyBound::int_prefix(100, 1)),
            Zone::new("west", KeyBound::int_prefix(100, 1), KeyBound::int_prefix(200, 1)),
        ];
        cluster.directory.assign_zone("east", ShardId::from("shardB"));
        cluster.directory.assign_zone("west", ShardId::from("shardC"));
        cluster
            .directory
            .set_collection_zones(cluster.namespace.clone(), zones.clone());
        let registry = cluster.leader().await;

        // The collection declares zones, so the request has to carry them.
        assert!(matches!(
            registry.get_or_create(cluster.request(&["region"])).await,
            Err(Error::InvalidRequest(_))
        ));

        let handle = registry
            .get_or_create(cluster.request(&["region"]).with_zones(zones))
            .await
            .unwrap();
        let op = handle.operation_id();
        assert_eq!(
            handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );

        let record = cluster.store.load(op).await.unwrap().unwrap();
        assert_eq!(
            record.recipient_ids(),
            vec![ShardId::from("shardB"), ShardId::from("shardC")]
        );

        let table = cluster.directory.table(&cluster.namespace).unwrap();
        assert_eq!(table.collection_id, op);
        assert_eq!(table.chunks.len(), 4);
        let owner_of = |min: KeyBound| {
            table
                .chunks
                .iter()
                .find(|c| c.min == min)
                .map(|c| c.shard.clone())
        };
        assert_eq!(owner_of(KeyBound::int_prefix(0, 1)), Some(ShardId::from("shardB")));
        assert_eq!(owner_of(KeyBound::int_prefix(100, 1)), Some(ShardId::from("shardC")));
        assert_eq!(
            cluster.shards.shard("shardC").recipient_phase(op),
            Some(RecipientPhase::Done)
        );
    }

    // =========================================================================
    // Request handling
    // =========================================================================

    #[tokio::test]
    async fn test_concurrent_requests_share_one_instance() {
        let cluster = slow_shards(20);
        let registry = cluster.leader().await;

        let (a, b) = tokio::join!(
            registry.get_or_create(cluster.request(&["region"])),
            registry.get_or_create(cluster.request(&["region"])),
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.operation_id(), b.operation_id());
        assert_eq!(cluster.store.load_all_active().await.unwrap().len(), 1);

        let err = registry
            .get_or_create(cluster.request(&["zip"]))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::ConflictingOperationInProgress { operation_id, .. } if operation_id == a.operation_id()
        ));

        a.await_completion(COMPLETION_TIMEOUT).await.unwrap();
        assert_eq!(registry.metrics().snapshot().operations_started, 1);
    }

    #[tokio::test]
    async fn test_invalid_requests_persist_nothing() {
        let cluster = two_shards();
        let registry = cluster.leader().await;

        let mut unique = cluster.request(&["region"]);
        unique.unique = true;
        assert!(matches!(
            registry.get_or_create(unique).await,
            Err(Error::InvalidRequest(_))
        ));

        let unsharded = ReshardRequest::new(
            Namespace::new("db", "other"),
            ShardKeyPattern::ascending(&["region"]),
        );
        assert!(matches!(
            registry.get_or_create(unsharded).await,
            Err(Error::NamespaceNotSharded(_))
        ));

        assert!(cluster.store.load_all_active().await.unwrap().is_empty());
        assert_eq!(registry.active_count(), 0);
    }

    #[tokio::test]
    async fn test_followers_refuse_requests() {
        let cluster = two_shards();
        let registry = cluster.registry();
        assert!(matches!(
            registry.get_or_create(cluster.request(&["region"])).await,
            Err(Error::NotLeader)
        ));

        registry.step_up().await.unwrap();
        registry.step_down().await;
        assert!(matches!(
            registry.get_or_create(cluster.request(&["region"])).await,
            Err(Error::NotLeader)
        ));
    }

    // =========================================================================
    // Failover
    // =========================================================================

    #[tokio::test]
    async fn test_resume_after_step_down_at_each_phase() {
        for target in [
            CoordinatorPhase::Initializing,
            CoordinatorPhase::PreparingToDonate,
            CoordinatorPhase::Cloning,
            CoordinatorPhase::Applying,
            CoordinatorPhase::BlockingWrites,
            CoordinatorPhase::Committing,
        ] {
            let cluster = slow_shards(4);
            let first = cluster.leader().await;
            let op = first
                .get_or_create(cluster.request(&["region"]))
                .await
                .unwrap()
                .operation_id();

            wait_for_phase(&first, &cluster.namespace, target).await;
            first.step_down().await;
            let persisted = cluster.store.load(op).await.unwrap().unwrap();
            assert!(persisted.phase.rank() >= target.rank(), "{}", target);

            let second = cluster.leader().await;
            let outcome = match second.get(&cluster.namespace) {
                Some(handle) => handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
                None => {
                    // The first leader finished before it observed the stop.
                    assert_eq!(persisted.phase, CoordinatorPhase::Done, "{}", target);
                    Completion::Committed
                }
            };
            assert_eq!(outcome, Completion::Committed, "resumed from {}", target);
            assert_eq!(cluster.routed_collection_id(), Some(op), "{}", target);

            let record = cluster.store.load(op).await.unwrap().unwrap();
            assert_eq!(record.phase, CoordinatorPhase::Done);
        }
    }

    #[tokio::test]
    async fn test_phases_are_observed_in_order() {
        let cluster = slow_shards(3);
        let registry = cluster.leader().await;
        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();

        let mut rx = handle.subscribe_phase();
        let mut seen = vec![*rx.borrow_and_update()];
        while !seen.last().map(|p| p.is_terminal()).unwrap_or(false) {
            if rx.changed().await.is_err() {
                break;
            }
            seen.push(*rx.borrow_and_update());
        }

        assert!(seen.windows(2).all(|w| w[0].rank() < w[1].rank()), "{:?}", seen);
        assert_eq!(seen.last(), Some(&CoordinatorPhase::Done));

        let record = cluster.store.load(handle.operation_id()).await.unwrap().unwrap();
        // Seven phase transitions at least, plus progress writes.
        assert!(record.revision >= 7);
    }

    #[tokio::test]
    async fn test_ambiguous_swap_commits_once() {
        let cluster = two_shards();
        cluster.directory.fail_next_swaps_after_apply(1);
        let registry = cluster.leader().await;

        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        assert_eq!(
            handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );

        let table = cluster.directory.table(&cluster.namespace).unwrap();
        assert_eq!(table.collection_id, handle.operation_id());
        assert_eq!(table.version, 2);
    }

    #[tokio::test]
    async fn test_failed_swap_is_retried() {
        let cluster = two_shards();
        cluster.directory.fail_next_swaps(3);
        let registry = cluster.leader().await;

        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        assert_eq!(
            handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );
        assert_eq!(cluster.routed_collection_id(), Some(handle.operation_id()));
    }

    #[tokio::test]
    async fn test_stale_instance_is_fenced() {
        let cluster = slow_shards(20);
        let old_leader = cluster.leader().await;
        let old = old_leader
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        wait_for_phase(&old_leader, &cluster.namespace, CoordinatorPhase::Cloning).await;

        // A second leader without the first one stepping down.
        let new_leader = cluster.leader().await;
        let new = new_leader.get(&cluster.namespace).expect("record not resumed");
        assert_eq!(new.operation_id(), old.operation_id());

        let (a, b) = tokio::join!(
            old.await_completion(COMPLETION_TIMEOUT),
            new.await_completion(COMPLETION_TIMEOUT),
        );
        let outcomes = [a, b];
        let committed = outcomes
            .iter()
            .filter(|o| matches!(o, Ok(Completion::Committed)))
            .count();
        let fenced = outcomes
            .iter()
            .filter(|o| matches!(o, Err(Error::Interrupted)))
            .count();
        assert_eq!((committed, fenced), (1, 1), "{:?}", outcomes);

        let conflicts = old_leader.metrics().snapshot().persist_conflicts
            + new_leader.metrics().snapshot().persist_conflicts;
        assert!(conflicts >= 1);
        assert_eq!(cluster.routed_collection_id(), Some(old.operation_id()));
    }

    // =========================================================================
    // Aborts
    // =========================================================================

    #[tokio::test]
    async fn test_user_abort_before_commit() {
        let cluster = slow_shards(50);
        let registry = cluster.leader().await;
        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        wait_for_phase(&registry, &cluster.namespace, CoordinatorPhase::Cloning).await;

        registry.abort(&cluster.namespace).unwrap();
        match handle.await_completion(COMPLETION_TIMEOUT).await.unwrap() {
            Completion::Aborted(reason) => {
                assert_eq!(reason.kind, AbortKind::UserAbort);
                assert_eq!(reason.shard_id, None);
            }
            other => panic!("expected abort, got {}", other),
        }
        assert_eq!(cluster.routed_collection_id(), Some(cluster.source_collection_id));

        assert!(matches!(
            registry.abort(&cluster.namespace),
            Err(Error::NamespaceNotResharding(_))
        ));
    }

    #[tokio::test]
    async fn test_user_abort_ignored_while_committing() {
        let cluster = two_shards();
        cluster.directory.fail_next_swaps(30);
        let registry = cluster.leader().await;
        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        wait_for_phase(&registry, &cluster.namespace, CoordinatorPhase::Committing).await;

        handle.abort();
        assert_eq!(
            handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );
        assert_eq!(cluster.routed_collection_id(), Some(handle.operation_id()));
    }

    #[tokio::test]
    async fn test_unreachable_donor_aborts_and_cleanup_catches_up() {
        let cluster = two_shards();
        let donor = cluster.shards.shard("shardA");
        donor.crash();
        let registry = cluster.leader().await;

        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        let op = handle.operation_id();
        match handle.await_completion(COMPLETION_TIMEOUT).await.unwrap() {
            Completion::Aborted(reason) => {
                assert_eq!(reason.kind, AbortKind::Unreachable);
                assert_eq!(reason.phase, CoordinatorPhase::PreparingToDonate);
                assert!(reason.message.contains("shardA"));
            }
            other => panic!("expected abort, got {}", other),
        }
        assert!(registry.cleanup().is_cleanup_pending(op));

        donor.recover();
        let cleaned = wait_for(
            || donor.donor_phase(op) == Some(DonorPhase::Aborted),
            Duration::from_secs(10),
            Duration::from_millis(20),
        )
        .await;
        assert!(cleaned, "donor never received abort");
        assert!(registry.metrics().snapshot().cleanup_retries >= 1);
    }

    #[tokio::test]
    async fn test_abort_waits_out_store_failures() {
        init_tracing();
        let store = Arc::new(FlakyStore::new());
        let cluster = ReshardingTestCluster::with_parts(
            &["shardA", "shardB"],
            SimulationConfig::default().with_clone_rounds(50),
            store.clone(),
        );
        let registry = cluster.leader().await;
        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        wait_for_phase(&registry, &cluster.namespace, CoordinatorPhase::Cloning).await;

        store.failing.store(true, Ordering::SeqCst);
        handle.abort();
        store.persist_attempts.store(0, Ordering::SeqCst);

        // Runs on the single-threaded test runtime: a coordinator that retried
        // without sleeping would never let this timer fire.
        tokio::time::sleep(Duration::from_millis(300)).await;
        let attempts = store.persist_attempts.load(Ordering::SeqCst);
        assert!((1..=100).contains(&attempts), "{} persist attempts", attempts);
        assert!(!handle.is_finished());

        store.failing.store(false, Ordering::SeqCst);
        match handle.await_completion(COMPLETION_TIMEOUT).await.unwrap() {
            Completion::Aborted(reason) => assert_eq!(reason.kind, AbortKind::UserAbort),
            other => panic!("expected abort, got {}", other),
        }
        assert_eq!(cluster.routed_collection_id(), Some(cluster.source_collection_id));
    }

    #[tokio::test]
    async fn test_step_down_during_creation_leaves_nothing_running() {
        let cluster = two_shards();
        let registry = InstanceRegistry::new(
            cluster.store.clone(),
            Arc::new(SlowPlanningDirectory {
                inner: cluster.directory.clone(),
                delay: Duration::from_millis(300),
            }),
            cluster.shards.clone(),
            cluster.config.clone(),
        )
        .unwrap();
        registry.step_up().await.unwrap();

        let (created, ()) = tokio::join!(
            registry.get_or_create(cluster.request(&["region"])),
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                registry.step_down().await;
            }
        );
        assert!(!registry.is_leader());
        assert_eq!(registry.active_count(), 0);

        // The creation won the race for the lock, so its record is durable and
        // the next leader picks it up.
        let handle = created.unwrap();
        assert!(handle.is_finished());
        let persisted = cluster.store.load(handle.operation_id()).await.unwrap().unwrap();
        assert!(!persisted.is_terminal());

        let next = cluster.leader().await;
        let resumed = next.get(&cluster.namespace).expect("record not resumed");
        assert_eq!(resumed.operation_id(), handle.operation_id());
        assert_eq!(
            resumed.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );
    }

    #[tokio::test]
    async fn test_separate_outages_in_critical_section_do_not_abort() {
        init_tracing();
        let cluster = ReshardingTestCluster::with_simulation(
            &["shardA", "shardB"],
            SimulationConfig::default().with_consistency_rounds(30),
        )
        .with_config(
            ReshardingConfig::fast()
                .with_participant_deadline(Duration::from_millis(300))
                .with_attempt_timeout(Duration::from_millis(50))
                .with_max_unreachable_rounds(2)
                .with_critical_section_timeout(Duration::from_secs(10)),
        );
        let registry = cluster.leader().await;
        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        let op = handle.operation_id();
        let recipient = cluster.shards.shard("shardB");
        let polls = || recipient.command_count(op, "block-writes");

        assert!(wait_for(|| polls() >= 1, COMPLETION_TIMEOUT, Duration::from_millis(1)).await);

        // Each outage outlasts one round deadline but not two; clean rounds
        // run in between.
        for _ in 0..2 {
            recipient.crash();
            tokio::time::sleep(Duration::from_millis(400)).await;
            recipient.recover();
            let before = polls();
            assert!(
                wait_for(|| polls() >= before + 2, COMPLETION_TIMEOUT, Duration::from_millis(1))
                    .await
            );
        }

        assert_eq!(
            handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );
    }

    // =========================================================================
    // Durable store and network
    // =========================================================================

    #[tokio::test]
    async fn test_file_store_end_to_end() {
        init_tracing();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(FileCoordinatorStore::new(dir.path()).await.unwrap());
        let cluster = ReshardingTestCluster::with_parts(
            &["shardA", "shardB"],
            SimulationConfig::default(),
            store,
        );
        let registry = cluster.leader().await;

        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        assert_eq!(
            handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );

        let reopened = FileCoordinatorStore::new(dir.path()).await.unwrap();
        let record = reopened.load(handle.operation_id()).await.unwrap().unwrap();
        assert_eq!(record.phase, CoordinatorPhase::Done);
        assert!(reopened.load_all_active().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_over_tcp() {
        let cluster = two_shards();
        let transport = Arc::new(TcpParticipantTransport::new(NetworkConfig::default()));
        let mut shutdowns = Vec::new();

        for shard in cluster.shards.shards() {
            let (server, shutdown_tx) = ParticipantServer::bind(
                "127.0.0.1:0".parse().unwrap(),
                shard.clone(),
                NetworkConfig::default().max_frame_size,
            )
            .await
            .unwrap();
            transport.register_shard(shard.shard_id().clone(), server.local_addr().unwrap());
            tokio::spawn(server.run());
            shutdowns.push(shutdown_tx);
        }

        let registry = InstanceRegistry::new(
            cluster.store.clone(),
            cluster.directory.clone(),
            transport,
            ReshardingConfig::fast().with_participant_deadline(Duration::from_secs(2)),
        )
        .unwrap();
        registry.step_up().await.unwrap();

        let handle = registry
            .get_or_create(cluster.request(&["region"]))
            .await
            .unwrap();
        assert_eq!(
            handle.await_completion(COMPLETION_TIMEOUT).await.unwrap(),
            Completion::Committed
        );

        for tx in shutdowns {
            let _ = tx.send(()).await;
        }
    }
}
