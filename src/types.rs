//! Core types used throughout the resharding coordinator.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a storage shard (a replica set owning chunks).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShardId(String);

impl ShardId {
    /// Create a shard id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ShardId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A `database.collection` namespace.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Namespace {
    db: String,
    coll: String,
}

impl Namespace {
    /// Create a namespace from its parts.
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Parse `db.coll`. The collection part may itself contain dots.
    pub fn parse(ns: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::InvalidRequest(format!("invalid namespace: '{}'", ns))),
        }
    }

    /// Database name.
    pub fn db(&self) -> &str {
        &self.db
    }

    /// Collection name.
    pub fn coll(&self) -> &str {
        &self.coll
    }

    /// The scratch namespace used to build the re-keyed collection.
    ///
    /// Derived only from the source identity, so every leader computes the
    /// same name for the same operation.
    pub fn temporary_resharding(&self, source_collection_id: Uuid) -> Self {
        Self::new(
            self.db.clone(),
            format!("system.resharding.{}", source_collection_id),
        )
    }

    /// Whether this is a temporary resharding namespace.
    pub fn is_temporary_resharding(&self) -> bool {
        self.coll.starts_with("system.resharding.")
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// Logical cluster time, used for fetch and critical-section timestamps.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp(pub u64);

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ts({})", self.0)
    }
}

/// How a shard key field is indexed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KeyOrder {
    /// Ranged, ascending (`{field: 1}`).
    Ascending,
    /// Hashed (`{field: "hashed"}`).
    Hashed,
}

/// A single field of a shard key pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKeyField {
    pub name: String,
    pub order: KeyOrder,
}

/// An ordered shard key pattern such as `{region: 1, id: 1}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardKeyPattern {
    fields: Vec<ShardKeyField>,
}

impl ShardKeyPattern {
    /// Build a pattern from explicit fields.
    pub fn new(fields: Vec<ShardKeyField>) -> Self {
        Self { fields }
    }

    /// Ranged pattern over the given field names.
    pub fn ascending(names: &[&str]) -> Self {
        Self::new(
            names
                .iter()
                .map(|name| ShardKeyField {
                    name: name.to_string(),
                    order: KeyOrder::Ascending,
                })
                .collect(),
        )
    }

    /// Single-field hashed pattern.
    pub fn hashed(name: &str) -> Self {
        Self::new(vec![ShardKeyField {
            name: name.to_string(),
            order: KeyOrder::Hashed,
        }])
    }

    /// Key fields in order.
    pub fn fields(&self) -> &[ShardKeyField] {
        &self.fields
    }

    /// Number of key fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the pattern has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// The all-MinKey bound for this pattern.
    pub fn global_min(&self) -> KeyBound {
        KeyBound(vec![KeyValue::MinKey; self.fields.len()])
    }

    /// The all-MaxKey bound for this pattern.
    pub fn global_max(&self) -> KeyBound {
        KeyBound(vec![KeyValue::MaxKey; self.fields.len()])
    }
}

impl fmt::Display for ShardKeyPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        for (i, field) in self.fields.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            match field.order {
                KeyOrder::Ascending => write!(f, "{}: 1", field.name)?,
                KeyOrder::Hashed => write!(f, "{}: \"hashed\"", field.name)?,
            }
        }
        write!(f, "}}")
    }
}

/// A shard key value. Variant order defines the comparison order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum KeyValue {
    MinKey,
    Int(i64),
    Str(String),
    MaxKey,
}

/// A compound key bound, one value per shard key field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct KeyBound(pub Vec<KeyValue>);

impl KeyBound {
    /// Bound whose first field is an integer and remaining fields are MinKey.
    pub fn int_prefix(value: i64, arity: usize) -> Self {
        let mut values = vec![KeyValue::MinKey; arity.max(1)];
        values[0] = KeyValue::Int(value);
        Self(values)
    }

    /// Number of values in the bound.
    pub fn arity(&self) -> usize {
        self.0.len()
    }
}

/// A half-open `[min, max)` key range owned by a shard.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkRange {
    pub min: KeyBound,
    pub max: KeyBound,
    pub shard: ShardId,
}

impl ChunkRange {
    /// Create a chunk.
    pub fn new(min: KeyBound, max: KeyBound, shard: ShardId) -> Self {
        Self { min, max, shard }
    }
}

/// A named key range that must live on shards tagged with the zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Zone {
    pub name: String,
    pub min: KeyBound,
    pub max: KeyBound,
}

impl Zone {
    /// Create a zone range.
    pub fn new(name: impl Into<String>, min: KeyBound, max: KeyBound) -> Self {
        Self {
            name: name.into(),
            min,
            max,
        }
    }
}

/// Current wall-clock time in unix milliseconds.
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_parse() {
        let ns = Namespace::parse("db.coll.sub").unwrap();
        assert_eq!(ns.db(), "db");
        assert_eq!(ns.coll(), "coll.sub");
        assert_eq!(ns.to_string(), "db.coll.sub");

        assert!(Namespace::parse("nodot").is_err());
        assert!(Namespace::parse(".coll").is_err());
        assert!(Namespace::parse("db.").is_err());
    }

    #[test]
    fn test_temporary_namespace_is_deterministic() {
        let ns = Namespace::new("db", "coll");
        let uuid = Uuid::new_v4();
        let a = ns.temporary_resharding(uuid);
        let b = ns.temporary_resharding(uuid);
        assert_eq!(a, b);
        assert_eq!(a.db(), "db");
        assert!(a.is_temporary_resharding());
        assert_eq!(a.coll(), format!("system.resharding.{}", uuid));
    }

    #[test]
    fn test_key_value_ordering() {
        assert!(KeyValue::MinKey < KeyValue::Int(i64::MIN));
        assert!(KeyValue::Int(5) < KeyValue::Str("a".into()));
        assert!(KeyValue::Str("zzz".into()) < KeyValue::MaxKey);

        let pattern = ShardKeyPattern::ascending(&["region", "id"]);
        assert!(pattern.global_min() < KeyBound::int_prefix(0, 2));
        assert!(KeyBound::int_prefix(0, 2) < pattern.global_max());
    }

    #[test]
    fn test_shard_key_display() {
        assert_eq!(ShardKeyPattern::ascending(&["region"]).to_string(), "{region: 1}");
        assert_eq!(ShardKeyPattern::hashed("id").to_string(), "{id: \"hashed\"}");
    }
}
