//! Storage collaborator.
//!
//! The engine talks to persistence only through [`SyncStorage`]. A `put`
//! writes payload, vector and applied-operation markers as one unit, so a
//! reader never observes a payload without its vector or the reverse.

use crate::journal::{JournalBackend, LogEntry, MemoryJournal};
use crate::queue::SyncQueueItem;
use async_trait::async_trait;
use causeway_sync_protocol::{
    EntityKey, EntityType, EntityId, OpId, Operation, OperationKind, Payload, ReplicaId,
    VersionVector,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors reported by the storage collaborator.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Storage is unreachable; the pipeline must pause.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Storage refused one record; other entities are unaffected.
    #[error("storage rejected {key}: {reason}")]
    Rejected {
        /// Entity key.
        key: String,
        /// Reason given.
        reason: String,
    },

    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Persisted data is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A persisted record could not be decoded.
    #[error("codec error: {0}")]
    Codec(String),

    /// One record could not be encoded; nothing was written.
    #[error("encode error: {0}")]
    Encode(String),

    /// One record exceeds the journal record limit; nothing was written.
    #[error("record of {size} bytes exceeds the {limit} byte limit")]
    Oversized {
        /// Encoded size.
        size: usize,
        /// Largest accepted size.
        limit: usize,
    },
}

impl StorageError {
    /// Creates a per-record rejection.
    pub fn rejected(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Rejected {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error is confined to the record being written.
    pub fn is_per_record(&self) -> bool {
        matches!(
            self,
            StorageError::Rejected { .. } | StorageError::Encode(_) | StorageError::Oversized { .. }
        )
    }

    /// Returns true if the record itself could not be serialized.
    pub fn is_serialization(&self) -> bool {
        matches!(self, StorageError::Encode(_) | StorageError::Oversized { .. })
    }

    /// Returns true unless the error is confined to a single record.
    pub fn is_fatal(&self) -> bool {
        !self.is_per_record()
    }
}

/// Authoritative state of one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Current payload; `None` once deleted.
    pub payload: Option<Payload>,
    /// Authoritative vector.
    #[serde(with = "causeway_sync_protocol::version_vector::compact")]
    pub vector: VersionVector,
    /// Logical time of the last write.
    pub logical_time: u64,
    /// Replica of the last write.
    pub origin: ReplicaId,
    /// Operation that produced this state.
    pub last_op: OpId,
}

impl EntityRecord {
    /// Builds the record an operation produces, under `vector`.
    pub fn from_operation(op: &Operation, vector: VersionVector) -> Self {
        Self {
            entity_type: op.entity_type.clone(),
            entity_id: op.entity_id.clone(),
            payload: (!op.is_delete()).then(|| op.payload.clone()),
            vector,
            logical_time: op.logical_time,
            origin: op.origin.clone(),
            last_op: op.op_id,
        }
    }

    /// Returns the entity key.
    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
        }
    }

    /// Returns true if the entity is deleted.
    pub fn is_deleted(&self) -> bool {
        self.payload.is_none()
    }

    /// Reconstructs the operation describing the current state.
    pub fn as_operation(&self) -> Operation {
        let (kind, payload) = match &self.payload {
            Some(payload) => (OperationKind::Update, payload.clone()),
            None => (OperationKind::Delete, Payload::default()),
        };
        Operation {
            op_id: self.last_op,
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
            kind,
            payload,
            vector: self.vector.clone(),
            origin: self.origin.clone(),
            logical_time: self.logical_time,
        }
    }
}

/// Persistence used by the sync engine.
#[async_trait]
pub trait SyncStorage: Send + Sync {
    /// Returns the current record for an entity.
    async fn get(&self, key: &EntityKey) -> StorageResult<Option<EntityRecord>>;

    /// Atomically writes a record and marks `applied` operations as applied.
    async fn put(&self, record: EntityRecord, applied: &[OpId]) -> StorageResult<()> {
        self.put_queued(record, applied, Vec::new()).await
    }

    /// Like [`SyncStorage::put`], and journals `enqueued` in the same write.
    async fn put_queued(
        &self,
        record: EntityRecord,
        applied: &[OpId],
        enqueued: Vec<SyncQueueItem>,
    ) -> StorageResult<()>;

    /// Durably appends a journal entry.
    async fn append(&self, entry: &LogEntry) -> StorageResult<()>;

    /// Returns every journal entry in append order.
    async fn replay(&self) -> StorageResult<Vec<LogEntry>>;

    /// Returns true if the operation was applied by an earlier `put`.
    async fn is_applied(&self, op_id: &OpId) -> StorageResult<bool>;
}

#[derive(Default)]
struct Tables {
    records: HashMap<EntityKey, EntityRecord>,
    applied: HashSet<OpId>,
}

#[derive(Default)]
struct Faults {
    unavailable: Option<String>,
    rejected: HashMap<EntityKey, String>,
}

/// In-memory entity tables over a durable [`JournalBackend`].
///
/// Committed records are journaled, so reopening over the same journal
/// restores both entity state and the queue. Faults can be injected for
/// testing pause and per-item failure handling.
pub struct MemoryStorage {
    journal: Arc<dyn JournalBackend>,
    tables: RwLock<Tables>,
    // Serializes journal appends with table updates.
    write_lock: Mutex<()>,
    faults: RwLock<Faults>,
}

impl MemoryStorage {
    /// Creates storage over a fresh in-memory journal.
    pub fn new() -> Self {
        Self {
            journal: Arc::new(MemoryJournal::new()),
            tables: RwLock::new(Tables::default()),
            write_lock: Mutex::new(()),
            faults: RwLock::new(Faults::default()),
        }
    }

    /// Opens storage over an existing journal, rebuilding entity tables.
    pub fn open(journal: Arc<dyn JournalBackend>) -> StorageResult<Self> {
        let mut tables = Tables::default();
        for raw in journal.records()? {
            if let LogEntry::Committed {
                record, applied, ..
            } = LogEntry::decode(&raw)?
            {
                tables.applied.extend(applied);
                tables.records.insert(record.key(), record);
            }
        }

        tracing::debug!(
            entities = tables.records.len(),
            applied = tables.applied.len(),
            "storage tables rebuilt from journal"
        );

        Ok(Self {
            journal,
            tables: RwLock::new(tables),
            write_lock: Mutex::new(()),
            faults: RwLock::new(Faults::default()),
        })
    }

    /// Makes every call fail with [`StorageError::Unavailable`] until cleared.
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.faults.write().unavailable = reason.map(str::to_owned);
    }

    /// Makes `put` for `key` fail with [`StorageError::Rejected`].
    pub fn reject_puts_for(&self, key: EntityKey, reason: impl Into<String>) {
        self.faults.write().rejected.insert(key, reason.into());
    }

    /// Clears a rejection set by [`MemoryStorage::reject_puts_for`].
    pub fn clear_rejection(&self, key: &EntityKey) {
        self.faults.write().rejected.remove(key);
    }

    /// Returns all records, sorted by key.
    pub fn records(&self) -> Vec<EntityRecord> {
        let mut records: Vec<_> = self.tables.read().records.values().cloned().collect();
        records.sort_by(|a, b| a.key().cmp(&b.key()));
        records
    }

    fn check_available(&self) -> StorageResult<()> {
        match &self.faults.read().unavailable {
            Some(reason) => Err(StorageError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SyncStorage for MemoryStorage {
    async fn get(&self, key: &EntityKey) -> StorageResult<Option<EntityRecord>> {
        self.check_available()?;
        Ok(self.tables.read().records.get(key).cloned())
    }

    async fn put_queued(
        &self,
        record: EntityRecord,
        applied: &[OpId],
        enqueued: Vec<SyncQueueItem>,
    ) -> StorageResult<()> {
        self.check_available()?;
        let key = record.key();
        if let Some(reason) = self.faults.read().rejected.get(&key) {
            return Err(StorageError::rejected(key.to_string(), reason.clone()));
        }

        let entry = LogEntry::Committed {
            record,
            applied: applied.to_vec(),
            enqueued,
        };
        let bytes = entry.encode()?;

        let _write = self.write_lock.lock();
        self.journal.append(&bytes)?;
        if let LogEntry::Committed {
            record, applied, ..
        } = entry
        {
            let mut tables = self.tables.write();
            tables.applied.extend(applied);
            tables.records.insert(key, record);
        }
        Ok(())
    }

    async fn append(&self, entry: &LogEntry) -> StorageResult<()> {
        self.check_available()?;
        let bytes = entry.encode()?;
        let _write = self.write_lock.lock();
        self.journal.append(&bytes)
    }

    async fn replay(&self) -> StorageResult<Vec<LogEntry>> {
        self.check_available()?;
        self.journal
            .records()?
            .iter()
            .map(|raw| LogEntry::decode(raw))
            .collect()
    }

    async fn is_applied(&self, op_id: &OpId) -> StorageResult<bool> {
        self.check_available()?;
        Ok(self.tables.read().applied.contains(op_id))
    }
}
