//! # Causeway Sync Engine
//!
//! Offline-first synchronization between a replica and a central authority.
//!
//! This crate provides:
//! - A durable, prioritized, idempotent sync queue over an append-only journal
//! - Pluggable conflict strategies (last-write-wins, field merge,
//!   versioned append, manual) behind an explicit registry
//! - The sync coordinator state machine
//!   (idle → pulling → detecting → resolving → applying → pushing)
//! - Storage, transport and notification collaborators with in-process
//!   implementations
//!
//! ## Architecture
//!
//! The coordinator runs a **pull-then-push** cycle:
//! 1. Pull remote operations and queue them durably
//! 2. Classify each against the entity's version vector; apply, discard
//!    or resolve
//! 3. Push queued local operations
//!
//! ## Key Invariants
//!
//! - An operation is applied at most once per replica
//! - Every queue change is journaled before it is acknowledged
//! - Payload and vector of an entity are committed together
//! - The pull cursor only advances after pulled operations are durable

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod clock;
mod config;
mod coordinator;
mod error;
pub mod journal;
mod locks;
mod notify;
pub mod queue;
pub mod resolver;
mod storage;
mod transport;

pub use clock::{HybridClock, ManualClock, SystemClock, TimeSource};
pub use config::{RetryConfig, SyncConfig, DEFAULT_MAX_OPERATION_SIZE};
pub use coordinator::{
    CoordinatorBuilder, CycleReport, ManualChoice, SyncCoordinator, SyncState, SyncStats,
};
pub use error::{ErrorKind, SyncError, SyncResult};
pub use journal::{FileJournal, JournalBackend, LogEntry, MemoryJournal};
pub use locks::EntityLocks;
pub use notify::{BroadcastNotifier, MemoryNotifier, NoopNotifier, Notifier, SyncEvent};
pub use queue::{
    Direction, EnqueueOutcome, ParkedConflict, Priority, QueueCounts, QueueSnapshot, QueueStatus,
    SyncQueue, SyncQueueItem,
};
pub use resolver::{
    ConflictStrategy, FieldMerge, LastWriteWins, ManualIntervention, MergeBasis, MergedOperation,
    NeedsManualResolution, OverlapPolicy, Resolver, StrategyRegistry, VersionedAppend,
};
pub use storage::{EntityRecord, MemoryStorage, StorageError, StorageResult, SyncStorage};
pub use transport::{LoopbackServer, LoopbackTransport, SyncTransport};
