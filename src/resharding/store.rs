//! Coordinator Document Store.
//!
//! Durable storage for coordination records. Every write after creation goes
//! through a compare-and-swap on `(phase, revision)`, which is what fences a
//! stale coordinator instance after failover.
//!
//! # Storage Format
//!
//! ```text
//! records/
//!   ├── 0b7c...e1.bin     # bincode(CoordinationRecord) ++ crc32 (4 bytes, BE)
//!   └── 5f20...9a.bin
//! ```

use super::phase::CoordinatorPhase;
use super::record::CoordinationRecord;
use crate::error::{Error, Result};
use crate::types::Namespace;
use async_trait::async_trait;
use crc::{Crc, CRC_32_ISCSI};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

// ============================================================================
// Coordinator Store Trait
// ============================================================================

/// Durable record store with compare-and-swap persistence.
#[async_trait]
pub trait CoordinatorStore: Send + Sync + std::fmt::Debug {
    /// Create a record. Returns the stored revision.
    ///
    /// Fails with `DuplicateOperation` if the id exists, or
    /// `ConflictingOperationInProgress` if a non-terminal record for the same
    /// namespace exists.
    async fn insert(&self, record: &CoordinationRecord) -> Result<u64>;

    /// Load a record by operation id.
    async fn load(&self, operation_id: Uuid) -> Result<Option<CoordinationRecord>>;

    /// Load every non-terminal record.
    async fn load_all_active(&self) -> Result<Vec<CoordinationRecord>>;

    /// The non-terminal record for a namespace, if any.
    async fn find_active(&self, namespace: &Namespace) -> Result<Option<CoordinationRecord>>;

    /// Overwrite a record if the stored copy is still at `expected_prior_phase`
    /// and `record.revision`. Returns the new revision.
    async fn persist(
        &self,
        record: &CoordinationRecord,
        expected_prior_phase: CoordinatorPhase,
    ) -> Result<u64>;
}

/// The compare-and-swap rule shared by every store implementation.
fn check_cas(
    stored: &CoordinationRecord,
    record: &CoordinationRecord,
    expected_prior_phase: CoordinatorPhase,
) -> Result<()> {
    if stored.is_terminal()
        || stored.phase != expected_prior_phase
        || stored.revision != record.revision
    {
        return Err(Error::PersistConflict {
            operation_id: record.operation_id,
            expected: expected_prior_phase,
            expected_revision: record.revision,
            found: stored.phase,
            found_revision: stored.revision,
        });
    }
    Ok(())
}

fn check_insert<'a>(
    existing: impl Iterator<Item = &'a CoordinationRecord>,
    record: &CoordinationRecord,
) -> Result<()> {
    for other in existing {
        if other.operation_id == record.operation_id {
            return Err(Error::DuplicateOperation(record.operation_id));
        }
        if other.source_namespace == record.source_namespace && !other.is_terminal() {
            return Err(Error::ConflictingOperationInProgress {
                namespace: record.source_namespace.clone(),
                operation_id: other.operation_id,
            });
        }
    }
    Ok(())
}

// ============================================================================
// In-Memory Implementation
// ============================================================================

/// In-memory store, used by tests and single-process demos.
#[derive(Debug, Default)]
pub struct InMemoryCoordinatorStore {
    records: RwLock<HashMap<Uuid, CoordinationRecord>>,
}

impl InMemoryCoordinatorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records, terminal ones included.
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}

#[async_trait]
impl CoordinatorStore for InMemoryCoordinatorStore {
    async fn insert(&self, record: &CoordinationRecord) -> Result<u64> {
        let mut records = self.records.write();
        check_insert(records.values(), record)?;

        let mut stored = record.clone();
        stored.revision = 1;
        records.insert(stored.operation_id, stored);
        Ok(1)
    }

    async fn load(&self, operation_id: Uuid) -> Result<Option<CoordinationRecord>> {
        Ok(self.records.read().get(&operation_id).cloned())
    }

    async fn load_all_active(&self) -> Result<Vec<CoordinationRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .filter(|r| !r.is_terminal())
            .cloned()
            .collect())
    }

    async fn find_active(&self, namespace: &Namespace) -> Result<Option<CoordinationRecord>> {
        Ok(self
            .records
            .read()
            .values()
            .find(|r| &r.source_namespace == namespace && !r.is_terminal())
            .cloned())
    }

    async fn persist(
        &self,
        record: &CoordinationRecord,
        expected_prior_phase: CoordinatorPhase,
    ) -> Result<u64> {
        let mut records = self.records.write();
        let stored = records
            .get_mut(&record.operation_id)
            .ok_or(Error::OperationNotFound(record.operation_id))?;
        check_cas(stored, record, expected_prior_phase)?;

        let revision = stored.revision + 1;
        *stored = record.clone();
        stored.revision = revision;
        Ok(revision)
    }
}

// ============================================================================
// File-Based Implementation (using async tokio::fs)
// ============================================================================

/// File-backed store: one checksummed bincode file per operation.
///
/// Writes go to a temp file that is fsync'd and renamed into place. Inserts
/// and persists are serialized by an async mutex so the compare-and-swap is
/// atomic with respect to other writers in this process.
#[derive(Debug)]
pub struct FileCoordinatorStore {
    base_dir: PathBuf,
    write_lock: tokio::sync::Mutex<()>,
}

impl FileCoordinatorStore {
    /// Open (or create) a store rooted at `base_dir`.
    pub async fn new(base_dir: impl AsRef<Path>) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();

        fs::create_dir_all(base_dir.join("records"))
            .await
            .map_err(|e| Error::Storage(format!("Failed to create records dir: {}", e)))?;

        Ok(Self {
            base_dir,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    fn record_path(&self, operation_id: Uuid) -> PathBuf {
        self.base_dir
            .join("records")
            .join(format!("{}.bin", operation_id))
    }

    fn encode(record: &CoordinationRecord) -> Result<Vec<u8>> {
        let mut content = bincode::serialize(record)
            .map_err(|e| Error::Storage(format!("Failed to serialize record: {}", e)))?;
        let checksum = CRC32.checksum(&content);
        content.extend_from_slice(&checksum.to_be_bytes());
        Ok(content)
    }

    fn decode(content: &[u8]) -> Result<CoordinationRecord> {
        if content.len() < 4 {
            return Err(Error::Storage("Record file truncated".to_string()));
        }
        let (payload, trailer) = content.split_at(content.len() - 4);
        let expected = u32::from_be_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
        let actual = CRC32.checksum(payload);
        if expected != actual {
            return Err(Error::Storage(format!(
                "Record checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            )));
        }
        bincode::deserialize(payload)
            .map_err(|e| Error::Storage(format!("Failed to deserialize record: {}", e)))
    }

    /// Atomically write a file (write to temp, fsync, then rename).
    async fn atomic_write(&self, path: &Path, content: &[u8]) -> Result<()> {
        let temp_path = path.with_extension("tmp");

        let mut file = fs::File::create(&temp_path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create temp file: {}", e)))?;
        file.write_all(content)
            .await
            .map_err(|e| Error::Storage(format!("Failed to write temp file: {}", e)))?;
        file.sync_all()
            .await
            .map_err(|e| Error::Storage(format!("Failed to sync temp file: {}", e)))?;

        fs::rename(&temp_path, path)
            .await
            .map_err(|e| Error::Storage(format!("Failed to rename file: {}", e)))?;

        Ok(())
    }

    async fn read_file(&self, path: &Path) -> std::io::Result<Vec<u8>> {
        let mut file = fs::File::open(path).await?;
        let mut content = Vec::new();
        file.read_to_end(&mut content).await?;
        Ok(content)
    }

    async fn read_record(&self, operation_id: Uuid) -> Result<Option<CoordinationRecord>> {
        match self.read_file(&self.record_path(operation_id)).await {
            Ok(content) => Ok(Some(Self::decode(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Storage(format!("Failed to read record: {}", e))),
        }
    }

    /// Every record in the store. Any unreadable file fails the whole scan:
    /// a skipped record could hide an active operation.
    async fn read_all(&self) -> Result<Vec<CoordinationRecord>> {
        let dir = self.base_dir.join("records");
        let mut records = Vec::new();

        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| Error::Storage(format!("Failed to read records dir: {}", e)))?;

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Storage(format!("Failed to read dir entry: {}", e)))?
        {
            let path = entry.path();
            if path.extension().map(|e| e != "bin").unwrap_or(true) {
                continue;
            }
            let decoded = match self.read_file(&path).await {
                Ok(content) => Self::decode(&content),
                Err(e) => Err(Error::Storage(e.to_string())),
            };
            match decoded {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::error!(path = ?path, error = %e, "Unreadable record file");
                    return Err(Error::Storage(format!(
                        "unreadable record file {}: {}",
                        path.display(),
                        e
                    )));
                }
            }
        }

        Ok(records)
    }
}

#[async_trait]
impl CoordinatorStore for FileCoordinatorStore {
    async fn insert(&self, record: &CoordinationRecord) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let existing = self.read_all().await?;
        check_insert(existing.iter(), record)?;

        let mut stored = record.clone();
        stored.revision = 1;
        self.atomic_write(&self.record_path(stored.operation_id), &Self::encode(&stored)?)
            .await?;

        tracing::debug!(
            operation_id = %stored.operation_id,
            namespace = %stored.source_namespace,
            phase = %stored.phase,
            "Inserted coordination record"
        );
        Ok(1)
    }

    async fn load(&self, operation_id: Uuid) -> Result<Option<CoordinationRecord>> {
        self.read_record(operation_id).await
    }

    async fn load_all_active(&self) -> Result<Vec<CoordinationRecord>> {
        let records: Vec<_> = self
            .read_all()
            .await?
            .into_iter()
            .filter(|r| !r.is_terminal())
            .collect();

        tracing::info!(count = records.len(), "Loaded active coordination records");
        Ok(records)
    }

    async fn find_active(&self, namespace: &Namespace) -> Result<Option<CoordinationRecord>> {
        Ok(self
            .read_all()
            .await?
            .into_iter()
            .find(|r| &r.source_namespace == namespace && !r.is_terminal()))
    }

    async fn persist(
        &self,
        record: &CoordinationRecord,
        expected_prior_phase: CoordinatorPhase,
    ) -> Result<u64> {
        let _guard = self.write_lock.lock().await;

        let stored = self
            .read_record(record.operation_id)
            .await?
            .ok_or(Error::OperationNotFound(record.operation_id))?;
        check_cas(&stored, record, expected_prior_phase)?;

        let mut next = record.clone();
        next.revision = stored.revision + 1;
        self.atomic_write(&self.record_path(next.operation_id), &Self::encode(&next)?)
            .await?;

        tracing::debug!(
            operation_id = %next.operation_id,
            phase = %next.phase,
            revision = next.revision,
            "Persisted coordination record"
        );
        Ok(next.revision)
    }
}

// ============================================================================
// Tests
// ============================================================================
