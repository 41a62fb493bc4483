//! Admin request normalization.
//!
//! A `ReshardRequest` is checked once, before any durable state exists. Every
//! failure here is an `InvalidRequest` or `Placement` error and leaves nothing
//! behind.

use crate::error::{Error, PlacementError, Result};
use crate::types::{ChunkRange, KeyBound, KeyOrder, Namespace, ShardKeyPattern, Zone};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Collation requested for the resharded collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collation {
    pub locale: String,
}

impl Collation {
    pub fn simple() -> Self {
        Self {
            locale: "simple".to_string(),
        }
    }

    pub fn is_simple(&self) -> bool {
        self.locale == "simple"
    }
}

/// A request to reshard a collection, as received from the admin layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReshardRequest {
    pub namespace: Namespace,
    pub new_shard_key: ShardKeyPattern,
    pub unique: bool,
    pub collation: Option<Collation>,
    pub zones: Option<Vec<Zone>>,
    pub preset_chunks: Option<Vec<ChunkRange>>,
    pub num_initial_chunks: Option<u32>,
}

impl ReshardRequest {
    /// Request with only the namespace and new key set.
    pub fn new(namespace: Namespace, new_shard_key: ShardKeyPattern) -> Self {
        Self {
            namespace,
            new_shard_key,
            unique: false,
            collation: None,
            zones: None,
            preset_chunks: None,
            num_initial_chunks: None,
        }
    }

    pub fn with_zones(mut self, zones: Vec<Zone>) -> Self {
        self.zones = Some(zones);
        self
    }

    pub fn with_preset_chunks(mut self, chunks: Vec<ChunkRange>) -> Self {
        self.preset_chunks = Some(chunks);
        self
    }

    pub fn with_num_initial_chunks(mut self, n: u32) -> Self {
        self.num_initial_chunks = Some(n);
        self
    }

    /// Validate against the zones currently declared on the collection.
    pub fn validate(self, authoritative_zones: &[Zone]) -> Result<ValidatedRequest> {
        let invalid = |msg: String| Err(Error::InvalidRequest(msg));

        if self.namespace.is_temporary_resharding() {
            return invalid(format!("cannot reshard temporary namespace {}", self.namespace));
        }
        if self.unique {
            return invalid("the unique field must be false".to_string());
        }
        if let Some(collation) = &self.collation {
            if !collation.is_simple() {
                return invalid(format!(
                    "collation must be {{locale: 'simple'}}, found locale '{}'",
                    collation.locale
                ));
            }
        }

        validate_shard_key(&self.new_shard_key)?;

        if !authoritative_zones.is_empty() {
            let zones = match &self.zones {
                Some(zones) => zones,
                None => return invalid("must specify value for zones field".to_string()),
            };
            let known: HashSet<&str> = authoritative_zones.iter().map(|z| z.name.as_str()).collect();
            for zone in zones {
                if !known.contains(zone.name.as_str()) {
                    return invalid(format!("zone '{}' does not exist on the collection", zone.name));
                }
            }
        }
        if let Some(zones) = &self.zones {
            validate_zones(&self.new_shard_key, zones)?;
        }

        if let Some(chunks) = &self.preset_chunks {
            if self.num_initial_chunks.is_some() {
                return Err(PlacementError::ConflictingChunkHints.into());
            }
            validate_preset_chunks(&self.new_shard_key, chunks)?;
        }

        if self.num_initial_chunks == Some(0) {
            return invalid("numInitialChunks must be positive".to_string());
        }

        Ok(ValidatedRequest {
            namespace: self.namespace,
            new_shard_key: self.new_shard_key,
            zones: self.zones,
            preset_chunks: self.preset_chunks,
            num_initial_chunks: self.num_initial_chunks,
        })
    }
}

/// A request that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedRequest {
    pub namespace: Namespace,
    pub new_shard_key: ShardKeyPattern,
    pub zones: Option<Vec<Zone>>,
    pub preset_chunks: Option<Vec<ChunkRange>>,
    pub num_initial_chunks: Option<u32>,
}

fn validate_shard_key(key: &ShardKeyPattern) -> Result<()> {
    if key.is_empty() {
        return Err(Error::InvalidRequest("shard key must have at least one field".to_string()));
    }
    let mut seen = HashSet::new();
    let mut hashed = 0;
    for field in key.fields() {
        if field.name.is_empty() || field.name.starts_with('$') {
            return Err(Error::InvalidRequest(format!("invalid shard key field '{}'", field.name)));
        }
        if !seen.insert(field.name.as_str()) {
            return Err(Error::InvalidRequest(format!("duplicate shard key field '{}'", field.name)));
        }
        if field.order == KeyOrder::Hashed {
            hashed += 1;
        }
    }
    if hashed > 1 {
        return Err(Error::InvalidRequest("at most one hashed shard key field".to_string()));
    }
    Ok(())
}

fn check_bounds(key: &ShardKeyPattern, min: &KeyBound, max: &KeyBound, what: &str) -> Result<()> {
    if min.arity() != key.len() || max.arity() != key.len() {
        return Err(Error::InvalidRequest(format!(
            "{} bounds must have {} fields",
            what,
            key.len()
        )));
    }
    if min >= max {
        return Err(Error::InvalidRequest(format!("{} has an empty range", what)));
    }
    Ok(())
}

fn validate_zones(key: &ShardKeyPattern, zones: &[Zone]) -> Result<()> {
    let mut sorted: Vec<&Zone> = zones.iter().collect();
    sorted.sort_by(|a, b| a.min.cmp(&b.min));
    for zone in &sorted {
        check_bounds(key, &zone.min, &zone.max, &format!("zone '{}'", zone.name))?;
    }
    for pair in sorted.windows(2) {
        if pair[0].max > pair[1].min {
            return Err(Error::InvalidRequest(format!(
                "zones '{}' and '{}' overlap",
                pair[0].name, pair[1].name
            )));
        }
    }
    Ok(())
}

fn validate_preset_chunks(key: &ShardKeyPattern, chunks: &[ChunkRange]) -> Result<()> {
    if chunks.is_empty() {
        return Err(Error::InvalidRequest("preset chunks must not be empty".to_string()));
    }
    let mut sorted: Vec<&ChunkRange> = chunks.iter().collect();
    sorted.sort_by(|a, b| a.min.cmp(&b.min));
    for chunk in &sorted {
        check_bounds(key, &chunk.min, &chunk.max, "preset chunk")?;
    }
    if sorted[0].min != key.global_min() || sorted[sorted.len() - 1].max != key.global_max() {
        return Err(Error::InvalidRequest(
            "preset chunks must cover the whole key space".to_string(),
        ));
    }
    for pair in sorted.windows(2) {
        if pair[0].max != pair[1].min {
            return Err(Error::InvalidRequest(
                "preset chunks must be contiguous".to_string(),
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ShardId, ShardKeyField};

    fn request() -> ReshardRequest {
        ReshardRequest::new(Namespace::new("db", "coll"), ShardKeyPattern::ascending(&["region"]))
    }

    fn zone(name: &str, lo: i64, hi: i64) -> Zone {
        Zone::new(name, KeyBound::int_prefix(lo, 1), KeyBound::int_prefix(hi, 1))
    }

    #[test]
    fn test_valid_request() {
        let validated = request().validate(&[]).unwrap();
        assert_eq!(validated.namespace, Namespace::new("db", "coll"));
        assert!(validated.zones.is_none());
    }

    #[test]
    fn test_unique_rejected() {
        let mut req = request();
        req.unique = true;
        assert!(matches!(req.validate(&[]), Err(Error::InvalidRequest(_))));
    }

    #[test]
    fn test_collation_must_be_simple() {
        let mut req = request();
        req.collation = Some(Collation {
            locale: "fr".to_string(),
        });
        assert!(req.validate(&[]).is_err());

        let mut req = request();
        req.collation = Some(Collation::simple());
        assert!(req.validate(&[]).is_ok());
    }

    #[test]
    fn test_bad_shard_keys() {
        let empty = ReshardRequest::new(Namespace::new("db", "c"), ShardKeyPattern::new(vec![]));
        assert!(empty.validate(&[]).is_err());

        let dup = ReshardRequest::new(Namespace::new("db", "c"), ShardKeyPattern::ascending(&["a", "a"]));
        assert!(dup.validate(&[]).is_err());

        let two_hashed = ReshardRequest::new(
            Namespace::new("db", "c"),
            ShardKeyPattern::new(vec![
                ShardKeyField { name: "a".into(), order: KeyOrder::Hashed },
                ShardKeyField { name: "b".into(), order: KeyOrder::Hashed },
            ]),
        );
        assert!(two_hashed.validate(&[]).is_err());
    }

    #[test]
    fn test_zones_required_when_collection_has_zones() {
        let existing = vec![zone("eu", 0, 10)];
        assert!(request().validate(&existing).is_err());
        assert!(request()
            .with_zones(vec![zone("eu", 0, 10)])
            .validate(&existing)
            .is_ok());
        assert!(request()
            .with_zones(vec![zone("us", 0, 10)])
            .validate(&existing)
            .is_err());
    }

    #[test]
    fn test_overlapping_zones() {
        let req = request().with_zones(vec![zone("a", 0, 10), zone("b", 5, 20)]);
        assert!(req.validate(&[]).is_err());
        let req = request().with_zones(vec![zone("a", 10, 10)]);
        assert!(req.validate(&[]).is_err());
    }

    #[test]
    fn test_preset_chunks() {
        let key = ShardKeyPattern::ascending(&["region"]);
        let chunks = vec![
            ChunkRange::new(key.global_min(), KeyBound::int_prefix(0, 1), ShardId::from("a")),
            ChunkRange::new(KeyBound::int_prefix(0, 1), key.global_max(), ShardId::from("b")),
        ];
        assert!(request().with_preset_chunks(chunks.clone()).validate(&[]).is_ok());

        let err = request()
            .with_preset_chunks(chunks.clone())
            .with_num_initial_chunks(2)
            .validate(&[])
            .unwrap_err();
        assert!(matches!(err, Error::Placement(PlacementError::ConflictingChunkHints)));

        let gap = vec![chunks[0].clone()];
        assert!(request().with_preset_chunks(gap).validate(&[]).is_err());
    }

    #[test]
    fn test_temporary_namespace_rejected() {
        let ns = Namespace::new("db", "coll").temporary_resharding(uuid::Uuid::new_v4());
        let req = ReshardRequest::new(ns, ShardKeyPattern::ascending(&["a"]));
        assert!(req.validate(&[]).is_err());
    }
}
