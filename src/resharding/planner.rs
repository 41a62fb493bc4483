//! Shard-set planner.
//!
//! Decides which shards donate (the current chunk owners) and which receive
//! (derived from preset chunks, zones, or balanced placement), together with
//! the initial chunk layout under the new shard key.

use super::request::ValidatedRequest;
use super::routing::RoutingDirectory;
use crate::error::{PlacementError, Result};
use crate::types::{ChunkRange, KeyBound, Namespace, ShardId, ShardKeyPattern, Zone};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Donors, recipients and the chunk layout for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacementPlan {
    pub donors: Vec<ShardId>,
    pub recipients: Vec<ShardId>,
    pub chunks: Vec<ChunkRange>,
}

/// Computes placement from routing directory state.
#[derive(Debug, Clone)]
pub struct ShardSetPlanner {
    directory: Arc<dyn RoutingDirectory>,
}

impl ShardSetPlanner {
    pub fn new(directory: Arc<dyn RoutingDirectory>) -> Self {
        Self { directory }
    }

    /// Current owners of the namespace's chunks.
    pub async fn plan_donors(&self, namespace: &Namespace) -> Result<Vec<ShardId>> {
        self.directory.get_current_owners(namespace).await
    }

    /// Recipients and chunk layout under the new key.
    pub async fn plan_recipients(
        &self,
        new_key: &ShardKeyPattern,
        zones: Option<&[Zone]>,
        preset_chunks: Option<&[ChunkRange]>,
        num_initial_chunks: Option<u32>,
        donor_count: usize,
    ) -> Result<(Vec<ShardId>, Vec<ChunkRange>)> {
        let shards = self.directory.list_shards().await?;
        if shards.is_empty() {
            return Err(PlacementError::NoShardsAvailable.into());
        }

        if let Some(preset) = preset_chunks {
            if num_initial_chunks.is_some() {
                return Err(PlacementError::ConflictingChunkHints.into());
            }
            return Self::place_preset(&shards, preset);
        }

        if let Some(zones) = zones.filter(|z| !z.is_empty()) {
            let assignments = self.directory.get_zone_assignments().await?;
            return Self::place_zones(new_key, zones, &assignments);
        }

        let counts = self.directory.chunk_counts().await?;
        let wanted = num_initial_chunks
            .map(|n| n as usize)
            .unwrap_or(donor_count)
            .clamp(1, shards.len());
        Ok(Self::place_balanced(new_key, &shards, &counts, wanted))
    }

    /// Full plan for a validated request.
    pub async fn plan(&self, request: &ValidatedRequest) -> Result<PlacementPlan> {
        let donors = self.plan_donors(&request.namespace).await?;
        let (recipients, chunks) = self
            .plan_recipients(
                &request.new_shard_key,
                request.zones.as_deref(),
                request.preset_chunks.as_deref(),
                request.num_initial_chunks,
                donors.len(),
            )
            .await?;

        tracing::debug!(
            namespace = %request.namespace,
            donors = ?donors,
            recipients = ?recipients,
            chunk_count = chunks.len(),
            "Planned resharding placement"
        );

        Ok(PlacementPlan {
            donors,
            recipients,
            chunks,
        })
    }

    fn place_preset(
        shards: &[ShardId],
        preset: &[ChunkRange],
    ) -> Result<(Vec<ShardId>, Vec<ChunkRange>)> {
        let known: BTreeSet<&ShardId> = shards.iter().collect();
        let mut recipients = BTreeSet::new();
        for chunk in preset {
            if !known.contains(&chunk.shard) {
                return Err(PlacementError::UnknownShard(chunk.shard.clone()).into());
            }
            recipients.insert(chunk.shard.clone());
        }
        Ok((recipients.into_iter().collect(), preset.to_vec()))
    }

    fn place_zones(
        new_key: &ShardKeyPattern,
        zones: &[Zone],
        assignments: &HashMap<String, Vec<ShardId>>,
    ) -> Result<(Vec<ShardId>, Vec<ChunkRange>)> {
        let mut sorted: Vec<&Zone> = zones.iter().collect();
        sorted.sort_by(|a, b| a.min.cmp(&b.min));

        let mut zone_owner = Vec::with_capacity(sorted.len());
        let mut recipients = BTreeSet::new();
        for zone in &sorted {
            let shards = assignments
                .get(&zone.name)
                .filter(|s| !s.is_empty())
                .ok_or_else(|| PlacementError::UnassignedZone(zone.name.clone()))?;
            let mut shards = shards.clone();
            shards.sort();
            recipients.extend(shards.iter().cloned());
            zone_owner.push(shards[0].clone());
        }
        let recipients: Vec<ShardId> = recipients.into_iter().collect();

        // Zone ranges plus the gaps around them; gaps are spread round-robin.
        let mut chunks = Vec::new();
        let mut cursor = new_key.global_min();
        let mut gap = 0usize;
        for (zone, owner) in sorted.iter().zip(zone_owner) {
            if cursor < zone.min {
                chunks.push(ChunkRange::new(
                    cursor.clone(),
                    zone.min.clone(),
                    recipients[gap % recipients.len()].clone(),
                ));
                gap += 1;
            }
            chunks.push(ChunkRange::new(zone.min.clone(), zone.max.clone(), owner));
            cursor = zone.max.clone();
        }
        let global_max = new_key.global_max();
        if cursor < global_max {
            chunks.push(ChunkRange::new(
                cursor,
                global_max,
                recipients[gap % recipients.len()].clone(),
            ));
        }

        Ok((recipients, chunks))
    }

    fn place_balanced(
        new_key: &ShardKeyPattern,
        shards: &[ShardId],
        counts: &HashMap<ShardId, usize>,
        wanted: usize,
    ) -> (Vec<ShardId>, Vec<ChunkRange>) {
        let mut by_load: Vec<&ShardId> = shards.iter().collect();
        by_load.sort_by_key(|s| (counts.get(*s).copied().unwrap_or(0), (*s).clone()));
        let mut recipients: Vec<ShardId> = by_load.into_iter().take(wanted).cloned().collect();
        recipients.sort();

        let chunks = split_even(new_key, recipients.len())
            .into_iter()
            .zip(recipients.iter())
            .map(|((min, max), shard)| ChunkRange::new(min, max, shard.clone()))
            .collect();
        (recipients, chunks)
    }
}

/// Split the first key field's integer space into `n` contiguous ranges
/// covering `[global_min, global_max)`.
pub fn split_even(key: &ShardKeyPattern, n: usize) -> Vec<(KeyBound, KeyBound)> {
    let n = n.max(1);
    let arity = key.len();
    let step = (u64::MAX as i128 + 1) / n as i128;

    let boundary = |k: usize| KeyBound::int_prefix((i64::MIN as i128 + step * k as i128) as i64, arity);

    (0..n)
        .map(|k| {
            let min = if k == 0 { key.global_min() } else { boundary(k) };
            let max = if k + 1 == n { key.global_max() } else { boundary(k + 1) };
            (min, max)
        })
        .collect()
}
