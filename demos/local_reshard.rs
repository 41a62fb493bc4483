//! Reshard a collection across three local participant shards.
//!
//! Each shard is an in-process simulated participant served over TCP. The
//! coordinator persists its record to a temporary directory, loses
//! leadership halfway through cloning, and a second coordinator resumes
//! the operation from disk.
//!
//! Run with:
//!   RUST_LOG=info cargo run --example local_reshard

use reshard::network::{ParticipantServer, TcpParticipantTransport};
use reshard::resharding::{FileCoordinatorStore, InMemoryRoutingDirectory};
use reshard::testing::{SimulatedCluster, SimulationConfig};
use reshard::{
    ChunkRange, CoordinatorPhase, InstanceRegistry, KeyBound, Namespace, NetworkConfig,
    ReshardRequest, ReshardingConfig, ShardId, ShardKeyPattern,
};
use std::env;
use std::sync::Arc;
use std::time::Duration;

const SHARDS: [&str; 3] = ["shardA", "shardB", "shardC"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let data_dir = tempfile::tempdir()?;
    let network = NetworkConfig::default();

    // Participant shards behind TCP servers
    let shards = SimulatedCluster::with_config(
        &SHARDS,
        SimulationConfig::default().with_clone_rounds(10),
    );
    let transport = Arc::new(TcpParticipantTransport::new(network.clone()));
    let mut shutdowns = Vec::new();
    for shard in shards.shards() {
        let (server, shutdown_tx) =
            ParticipantServer::bind("127.0.0.1:0".parse()?, shard.clone(), network.max_frame_size)
                .await?;
        let addr = server.local_addr()?;
        println!("{} listening on {}", shard.shard_id(), addr);
        transport.register_shard(shard.shard_id().clone(), addr);
        tokio::spawn(server.run());
        shutdowns.push(shutdown_tx);
    }

    // db.users sharded on {id: 1} across two shards
    let namespace = Namespace::new("db", "users");
    let old_key = ShardKeyPattern::ascending(&["id"]);
    let directory = Arc::new(InMemoryRoutingDirectory::with_shards(&SHARDS));
    let split = KeyBound::int_prefix(1_000, 1);
    directory.create_collection(
        namespace.clone(),
        old_key.clone(),
        vec![
            ChunkRange::new(old_key.global_min(), split.clone(), ShardId::from("shardA")),
            ChunkRange::new(split, old_key.global_max(), ShardId::from("shardB")),
        ],
    );

    let config = ReshardingConfig::default()
        .with_poll_interval(Duration::from_millis(100))
        .with_participant_deadline(Duration::from_secs(5));

    let first_leader = InstanceRegistry::new(
        Arc::new(FileCoordinatorStore::new(data_dir.path()).await?),
        directory.clone(),
        transport.clone(),
        config.clone(),
    )?;
    first_leader.step_up().await?;

    let request = ReshardRequest::new(namespace.clone(), ShardKeyPattern::ascending(&["region"]))
        .with_num_initial_chunks(3);
    let handle = first_leader.get_or_create(request).await?;
    println!("started operation {}", handle.operation_id());

    let mut phases = handle.subscribe_phase();
    phases
        .wait_for(|phase| phase.rank() >= CoordinatorPhase::Cloning.rank())
        .await?;
    println!("first leader stepping down in phase {}", handle.phase());
    first_leader.step_down().await;

    // A new leader with its own view of the same store directory
    let second_leader = InstanceRegistry::new(
        Arc::new(FileCoordinatorStore::new(data_dir.path()).await?),
        directory.clone(),
        transport,
        config,
    )?;
    let resumed = second_leader.step_up().await?;
    println!("second leader resumed {} operation(s)", resumed);

    if let Some(handle) = second_leader.get(&namespace) {
        let outcome = handle.await_completion(Duration::from_secs(60)).await?;
        println!("operation {} finished: {}", handle.operation_id(), outcome);
    }

    if let Some(table) = directory.table(&namespace) {
        println!("routing key: {}", table.shard_key);
        for chunk in &table.chunks {
            println!("  {:?} .. {:?} -> {}", chunk.min, chunk.max, chunk.shard);
        }
    }

    let metrics = second_leader.metrics().snapshot();
    println!(
        "resumed={} committed={} aborted={} retries={}",
        metrics.operations_resumed,
        metrics.operations_committed,
        metrics.operations_aborted,
        metrics.participant_retries
    );

    second_leader.shutdown().await;
    for tx in shutdowns {
        let _ = tx.send(()).await;
    }
    Ok(())
}
