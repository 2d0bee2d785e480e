//! Durable sync queue.
//!
//! Every enqueue and status change is appended to the storage journal
//! before the in-memory view changes and before the call returns. The
//! in-memory view is a pure fold over the journal ([`QueueSnapshot`]), so
//! reopening replays to the same state.
//!
//! # Invariants
//!
//! - `seq` is strictly increasing and never reused
//! - An `op_id` is queued at most once
//! - Status only moves forward, except `Failed -> Pending` on operator
//!   retry and `InProgress -> Pending` on requeue or crash recovery
//! - Items are served by priority (`Critical` first), then by `seq`

use crate::clock::TimeSource;
use crate::config::RetryConfig;
use crate::error::{SyncError, SyncResult};
use crate::journal::LogEntry;
use crate::storage::{EntityRecord, SyncStorage};
use causeway_sync_protocol::{ConflictId, ConflictRecord, EntityKey, OpId, Operation, Payload};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Queue priority. Higher priorities are served first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// Background metadata.
    Low,
    /// Default.
    Normal,
    /// Ahead of normal traffic.
    High,
    /// Always first.
    Critical,
}

/// Which way an item travels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Local operation waiting to be pushed.
    Outbound,
    /// Pulled operation waiting to be applied.
    Inbound,
}

/// Lifecycle status of a queue item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueStatus {
    /// Waiting to be picked.
    Pending,
    /// Picked by the current cycle.
    InProgress,
    /// Done.
    Completed,
    /// Retries exhausted or quarantined; needs an operator.
    Failed,
    /// Conflict waiting for an operator decision.
    Parked,
}

impl QueueStatus {
    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(self, next: QueueStatus) -> bool {
        use QueueStatus::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Failed)
                | (InProgress, Pending)
                | (InProgress, Parked)
                | (Failed, Pending)
                | (Parked, Completed)
        )
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            QueueStatus::Pending => "pending",
            QueueStatus::InProgress => "in_progress",
            QueueStatus::Completed => "completed",
            QueueStatus::Failed => "failed",
            QueueStatus::Parked => "parked",
        }
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One queued operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// Persisted, monotonically increasing key.
    pub seq: u64,
    /// The operation.
    pub operation: Operation,
    /// Direction.
    pub direction: Direction,
    /// Priority.
    pub priority: Priority,
    /// Status.
    pub status: QueueStatus,
    /// Failed attempts so far.
    pub retry_count: u32,
    /// Most recent failure.
    pub last_error: Option<String>,
    /// Enqueue time (ms).
    pub enqueued_at: u64,
    /// Last status change (ms).
    pub updated_at: u64,
    /// Not served before this time (ms).
    pub not_before: u64,
    /// The payload was too large or unencodable and was not kept.
    #[serde(default)]
    pub payload_dropped: bool,
}

impl SyncQueueItem {
    /// Returns the entity key of the operation.
    pub fn key(&self) -> EntityKey {
        self.operation.key()
    }
}

/// Result of [`SyncQueue::enqueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Newly queued under this seq.
    Added(u64),
    /// The op id is already queued under this seq.
    Duplicate(u64),
    /// Inbound operation already applied to storage.
    AlreadyApplied,
}

/// Item counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    /// Pending items.
    pub pending: usize,
    /// In-progress items.
    pub in_progress: usize,
    /// Completed items not yet pruned.
    pub completed: usize,
    /// Failed items.
    pub failed: usize,
    /// Parked items.
    pub parked: usize,
}

impl QueueCounts {
    /// Total items.
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.completed + self.failed + self.parked
    }
}

/// A conflict waiting for an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParkedConflict {
    /// Queue item holding the remote operation.
    pub seq: u64,
    /// The conflict.
    pub record: ConflictRecord,
}

/// Queue state rebuilt from journal entries.
#[derive(Debug, Clone, Default)]
pub struct QueueSnapshot {
    items: BTreeMap<u64, SyncQueueItem>,
    by_op: HashMap<OpId, u64>,
    parked: BTreeMap<ConflictId, ParkedConflict>,
    next_seq: u64,
    cursor: u64,
}

impl QueueSnapshot {
    /// Folds journal entries into a snapshot.
    pub fn replay<'a>(entries: impl IntoIterator<Item = &'a LogEntry>) -> Self {
        let mut snapshot = Self::default();
        for entry in entries {
            snapshot.apply(entry);
        }
        snapshot
    }

    fn apply(&mut self, entry: &LogEntry) {
        match entry {
            LogEntry::Enqueued(item) => self.insert(item),
            LogEntry::Transition {
                seq,
                status,
                retry_count,
                last_error,
                not_before,
                at,
            } => {
                if let Some(item) = self.items.get_mut(seq) {
                    item.status = *status;
                    item.retry_count = *retry_count;
                    item.last_error = last_error.clone();
                    item.not_before = *not_before;
                    item.updated_at = *at;
                }
            }
            LogEntry::Pruned { seqs } => {
                for seq in seqs {
                    if let Some(item) = self.items.remove(seq) {
                        self.by_op.remove(&item.operation.op_id);
                    }
                }
            }
            LogEntry::Cursor(cursor) => self.cursor = *cursor,
            LogEntry::Parked { seq, record } => {
                self.parked.insert(
                    record.conflict_id,
                    ParkedConflict {
                        seq: *seq,
                        record: record.clone(),
                    },
                );
            }
            LogEntry::Unparked { conflict_id } => {
                self.parked.remove(conflict_id);
            }
            LogEntry::Committed { enqueued, .. } => {
                for item in enqueued {
                    self.insert(item);
                }
            }
        }
    }

    fn insert(&mut self, item: &SyncQueueItem) {
        self.next_seq = self.next_seq.max(item.seq + 1);
        self.by_op.insert(item.operation.op_id, item.seq);
        self.items.insert(item.seq, item.clone());
    }

    /// Items in seq order.
    pub fn items(&self) -> impl Iterator<Item = &SyncQueueItem> {
        self.items.values()
    }

    /// Returns an item.
    pub fn get(&self, seq: u64) -> Option<&SyncQueueItem> {
        self.items.get(&seq)
    }

    /// Returns the seq holding an operation.
    pub fn seq_of(&self, op_id: &OpId) -> Option<u64> {
        self.by_op.get(op_id).copied()
    }

    /// Counts items by status.
    pub fn counts(&self) -> QueueCounts {
        let mut counts = QueueCounts::default();
        for item in self.items.values() {
            match item.status {
                QueueStatus::Pending => counts.pending += 1,
                QueueStatus::InProgress => counts.in_progress += 1,
                QueueStatus::Completed => counts.completed += 1,
                QueueStatus::Failed => counts.failed += 1,
                QueueStatus::Parked => counts.parked += 1,
            }
        }
        counts
    }

    /// Persisted pull cursor.
    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    /// Parked conflicts in id order.
    pub fn parked(&self) -> impl Iterator<Item = &ParkedConflict> {
        self.parked.values()
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if there are no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Durable, prioritized, idempotent queue of sync work.
pub struct SyncQueue<S: SyncStorage> {
    storage: Arc<S>,
    time: Arc<dyn TimeSource>,
    retry: RetryConfig,
    retention: Duration,
    state: Mutex<QueueSnapshot>,
}

impl<S: SyncStorage> SyncQueue<S> {
    /// Replays the journal and recovers interrupted work.
    pub async fn open(
        storage: Arc<S>,
        time: Arc<dyn TimeSource>,
        retry: RetryConfig,
        retention: Duration,
    ) -> SyncResult<Self> {
        let entries = storage.replay().await?;
        let snapshot = QueueSnapshot::replay(&entries);
        debug!(
            entries = entries.len(),
            items = snapshot.len(),
            cursor = snapshot.cursor(),
            "queue replayed"
        );

        let queue = Self {
            storage,
            time,
            retry,
            retention,
            state: Mutex::new(snapshot),
        };
        queue.recover().await?;
        Ok(queue)
    }

    /// Resets `InProgress` items to `Pending` and drops parked records
    /// whose item is no longer parked.
    ///
    /// Returns the number of items reset.
    pub async fn recover(&self) -> SyncResult<usize> {
        let (interrupted, orphaned) = {
            let state = self.state.lock();
            let interrupted: Vec<u64> = state
                .items
                .values()
                .filter(|i| i.status == QueueStatus::InProgress)
                .map(|i| i.seq)
                .collect();
            let orphaned: Vec<ConflictId> = state
                .parked
                .iter()
                .filter(|(_, p)| {
                    state
                        .items
                        .get(&p.seq)
                        .map_or(true, |i| i.status != QueueStatus::Parked)
                })
                .map(|(id, _)| *id)
                .collect();
            (interrupted, orphaned)
        };

        for seq in &interrupted {
            self.transition(*seq, QueueStatus::Pending, |_| {}).await?;
        }
        for conflict_id in orphaned {
            self.commit(LogEntry::Unparked { conflict_id }).await?;
        }

        if !interrupted.is_empty() {
            info!(count = interrupted.len(), "requeued interrupted queue items");
        }
        Ok(interrupted.len())
    }

    /// Durably queues an operation.
    ///
    /// Inbound operations already applied to storage are skipped, as are
    /// op ids already queued.
    pub async fn enqueue(
        &self,
        operation: Operation,
        direction: Direction,
        priority: Priority,
    ) -> SyncResult<EnqueueOutcome> {
        let op_id = operation.op_id;
        if direction == Direction::Inbound && self.storage.is_applied(&op_id).await? {
            return Ok(EnqueueOutcome::AlreadyApplied);
        }

        let seq = match self.reserve(op_id) {
            Ok(seq) => seq,
            Err(seq) => return Ok(EnqueueOutcome::Duplicate(seq)),
        };
        let entry = LogEntry::Enqueued(self.pending_item(seq, operation, direction, priority));

        if let Err(e) = self.storage.append(&entry).await {
            self.release(&op_id);
            return Err(e.into());
        }
        self.state.lock().apply(&entry);
        debug!(seq, %op_id, ?direction, ?priority, "enqueued");
        Ok(EnqueueOutcome::Added(seq))
    }

    /// Commits `record` through storage and queues `operation` for push in
    /// the same journal write.
    ///
    /// Either both become durable or neither does.
    pub async fn commit_outbound(
        &self,
        record: EntityRecord,
        applied: &[OpId],
        operation: Operation,
        priority: Priority,
    ) -> SyncResult<EnqueueOutcome> {
        let op_id = operation.op_id;
        let seq = match self.reserve(op_id) {
            Ok(seq) => seq,
            Err(seq) => {
                self.storage.put(record, applied).await?;
                return Ok(EnqueueOutcome::Duplicate(seq));
            }
        };
        let item = self.pending_item(seq, operation, Direction::Outbound, priority);

        if let Err(e) = self
            .storage
            .put_queued(record, applied, vec![item.clone()])
            .await
        {
            self.release(&op_id);
            return Err(e.into());
        }
        self.state.lock().apply(&LogEntry::Enqueued(item));
        debug!(seq, %op_id, ?priority, "committed and enqueued");
        Ok(EnqueueOutcome::Added(seq))
    }

    /// Records an operation that cannot be queued whole as `Failed`.
    ///
    /// The item keeps the operation's identity and vector but not its
    /// payload, so the op id stays deduplicated and cannot be retried.
    pub async fn enqueue_quarantined(
        &self,
        mut operation: Operation,
        direction: Direction,
        priority: Priority,
        error: &str,
    ) -> SyncResult<EnqueueOutcome> {
        let op_id = operation.op_id;
        let seq = match self.reserve(op_id) {
            Ok(seq) => seq,
            Err(seq) => return Ok(EnqueueOutcome::Duplicate(seq)),
        };
        operation.payload = Payload::new(operation.payload.schema_version);
        let mut item = self.pending_item(seq, operation, direction, priority);
        item.status = QueueStatus::Failed;
        item.last_error = Some(error.to_owned());
        item.payload_dropped = true;
        let entry = LogEntry::Enqueued(item);

        if let Err(e) = self.storage.append(&entry).await {
            self.release(&op_id);
            return Err(e.into());
        }
        self.state.lock().apply(&entry);
        warn!(seq, %op_id, error, "operation quarantined without payload");
        Ok(EnqueueOutcome::Added(seq))
    }

    // Reserves a seq for `op_id` while its append is in flight, or returns
    // the seq already holding it.
    fn reserve(&self, op_id: OpId) -> Result<u64, u64> {
        let mut state = self.state.lock();
        if let Some(seq) = state.seq_of(&op_id) {
            return Err(seq);
        }
        let seq = state.next_seq;
        state.next_seq += 1;
        state.by_op.insert(op_id, seq);
        Ok(seq)
    }

    fn release(&self, op_id: &OpId) {
        self.state.lock().by_op.remove(op_id);
    }

    fn pending_item(
        &self,
        seq: u64,
        operation: Operation,
        direction: Direction,
        priority: Priority,
    ) -> SyncQueueItem {
        let now = self.time.now_millis();
        SyncQueueItem {
            seq,
            operation,
            direction,
            priority,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            enqueued_at: now,
            updated_at: now,
            not_before: 0,
            payload_dropped: false,
        }
    }

    /// Claims up to `limit` ready `Pending` items, marking them `InProgress`.
    ///
    /// With `one_per_entity`, only the oldest ready item of each entity is
    /// claimed.
    pub async fn next_batch(
        &self,
        direction: Direction,
        limit: usize,
        one_per_entity: bool,
    ) -> SyncResult<Vec<SyncQueueItem>> {
        let now = self.time.now_millis();
        let selected: Vec<u64> = {
            let state = self.state.lock();
            let mut ready: Vec<&SyncQueueItem> = state
                .items
                .values()
                .filter(|i| {
                    i.direction == direction
                        && i.status == QueueStatus::Pending
                        && i.not_before <= now
                })
                .collect();
            ready.sort_by(|a, b| b.priority.cmp(&a.priority).then(a.seq.cmp(&b.seq)));

            let mut seen = HashSet::new();
            ready
                .into_iter()
                .filter(|i| !one_per_entity || seen.insert(i.key()))
                .take(limit)
                .map(|i| i.seq)
                .collect()
        };

        let mut batch = Vec::with_capacity(selected.len());
        for seq in selected {
            batch.push(self.transition(seq, QueueStatus::InProgress, |_| {}).await?);
        }
        Ok(batch)
    }

    /// Marks an item `Completed`.
    pub async fn mark_completed(&self, seq: u64) -> SyncResult<()> {
        self.transition(seq, QueueStatus::Completed, |_| {}).await?;
        Ok(())
    }

    /// Records a failed attempt.
    ///
    /// The item returns to `Pending` behind an exponential backoff, or
    /// becomes `Failed` once `max_retries` attempts have failed.
    pub async fn record_failure(&self, seq: u64, error: &str) -> SyncResult<QueueStatus> {
        let retry_count = self
            .get(seq)
            .ok_or(SyncError::QueueItemNotFound(seq))?
            .retry_count
            .saturating_add(1);

        let status = if retry_count >= self.retry.max_retries {
            QueueStatus::Failed
        } else {
            QueueStatus::Pending
        };
        let not_before = self.time.now_millis().saturating_add(
            self.retry.delay_for_attempt(retry_count).as_millis() as u64,
        );

        self.transition(seq, status, |item| {
            item.retry_count = retry_count;
            item.last_error = Some(error.to_owned());
            item.not_before = not_before;
        })
        .await?;

        if status == QueueStatus::Failed {
            warn!(seq, retry_count, error, "queue item failed after retries");
        }
        Ok(status)
    }

    /// Marks an item `Failed` immediately, without retry.
    pub async fn quarantine(&self, seq: u64, error: &str) -> SyncResult<()> {
        self.transition(seq, QueueStatus::Failed, |item| {
            item.last_error = Some(error.to_owned());
        })
        .await?;
        warn!(seq, error, "queue item quarantined");
        Ok(())
    }

    /// Returns a claimed item to `Pending` without counting a retry.
    pub async fn defer(&self, seq: u64) -> SyncResult<()> {
        self.transition(seq, QueueStatus::Pending, |_| {}).await?;
        Ok(())
    }

    /// Operator retry: `Failed -> Pending` with the retry count reset.
    ///
    /// Items quarantined without their payload cannot be retried.
    pub async fn retry_failed(&self, seq: u64) -> SyncResult<()> {
        if self.get(seq).is_some_and(|item| item.payload_dropped) {
            return Err(SyncError::PayloadDropped(seq));
        }
        self.transition(seq, QueueStatus::Pending, |item| {
            item.retry_count = 0;
            item.not_before = 0;
        })
        .await?;
        info!(seq, "failed item requeued by operator");
        Ok(())
    }

    /// Retries every failed item. Returns how many were requeued.
    pub async fn retry_all_failed(&self) -> SyncResult<usize> {
        let failed: Vec<u64> = self
            .failed_items()
            .iter()
            .filter(|i| !i.payload_dropped)
            .map(|i| i.seq)
            .collect();
        for seq in &failed {
            self.retry_failed(*seq).await?;
        }
        Ok(failed.len())
    }

    /// Parks a claimed item on `record`.
    pub async fn park(&self, seq: u64, record: ConflictRecord) -> SyncResult<()> {
        let conflict_id = record.conflict_id;
        self.commit(LogEntry::Parked { seq, record }).await?;
        self.transition(seq, QueueStatus::Parked, |_| {}).await?;
        info!(seq, %conflict_id, "conflict parked");
        Ok(())
    }

    /// Closes a parked conflict, completing its item.
    pub async fn unpark(&self, conflict_id: ConflictId) -> SyncResult<ParkedConflict> {
        let parked = self
            .parked_conflict(conflict_id)
            .ok_or(SyncError::ParkedConflictNotFound(conflict_id))?;

        if self.get(parked.seq).map(|i| i.status) == Some(QueueStatus::Parked) {
            self.transition(parked.seq, QueueStatus::Completed, |_| {})
                .await?;
        }
        self.commit(LogEntry::Unparked { conflict_id }).await?;
        Ok(parked)
    }

    /// Drops `Completed` items older than the retention window.
    pub async fn prune_completed(&self) -> SyncResult<usize> {
        let now = self.time.now_millis();
        let retention = self.retention.as_millis() as u64;
        let seqs: Vec<u64> = {
            let state = self.state.lock();
            state
                .items
                .values()
                .filter(|i| {
                    i.status == QueueStatus::Completed
                        && now.saturating_sub(i.updated_at) >= retention
                })
                .map(|i| i.seq)
                .collect()
        };

        if seqs.is_empty() {
            return Ok(0);
        }
        let count = seqs.len();
        self.commit(LogEntry::Pruned { seqs }).await?;
        debug!(count, "pruned completed queue items");
        Ok(count)
    }

    /// Durably advances the pull cursor.
    pub async fn set_cursor(&self, cursor: u64) -> SyncResult<()> {
        if self.cursor() == cursor {
            return Ok(());
        }
        self.commit(LogEntry::Cursor(cursor)).await
    }

    /// Persisted pull cursor.
    pub fn cursor(&self) -> u64 {
        self.state.lock().cursor
    }

    /// Returns a copy of an item.
    pub fn get(&self, seq: u64) -> Option<SyncQueueItem> {
        self.state.lock().items.get(&seq).cloned()
    }

    /// Returns the seq holding an operation.
    pub fn seq_of(&self, op_id: &OpId) -> Option<u64> {
        self.state.lock().seq_of(op_id)
    }

    /// Counts items by status.
    pub fn counts(&self) -> QueueCounts {
        self.state.lock().counts()
    }

    /// Items that need an operator.
    pub fn failed_items(&self) -> Vec<SyncQueueItem> {
        self.state
            .lock()
            .items
            .values()
            .filter(|i| i.status == QueueStatus::Failed)
            .cloned()
            .collect()
    }

    /// Pending or in-progress items for one entity, in seq order.
    pub fn pending_for(&self, key: &EntityKey) -> Vec<SyncQueueItem> {
        self.state
            .lock()
            .items
            .values()
            .filter(|i| {
                matches!(i.status, QueueStatus::Pending | QueueStatus::InProgress)
                    && i.key() == *key
            })
            .cloned()
            .collect()
    }

    /// All parked conflicts.
    pub fn parked(&self) -> Vec<ParkedConflict> {
        self.state.lock().parked().cloned().collect()
    }

    /// One parked conflict.
    pub fn parked_conflict(&self, conflict_id: ConflictId) -> Option<ParkedConflict> {
        self.state.lock().parked.get(&conflict_id).cloned()
    }

    /// Returns a copy of the whole queue state.
    pub fn snapshot(&self) -> QueueSnapshot {
        self.state.lock().clone()
    }

    async fn transition<F>(&self, seq: u64, status: QueueStatus, update: F) -> SyncResult<SyncQueueItem>
    where
        F: FnOnce(&mut SyncQueueItem),
    {
        let now = self.time.now_millis();
        let next = {
            let state = self.state.lock();
            let item = state
                .items
                .get(&seq)
                .ok_or(SyncError::QueueItemNotFound(seq))?;
            if !item.status.can_transition_to(status) {
                return Err(SyncError::InvalidStateTransition {
                    from: item.status.to_string(),
                    to: status.to_string(),
                });
            }
            let mut next = item.clone();
            next.status = status;
            next.updated_at = now;
            update(&mut next);
            next
        };

        self.commit(LogEntry::Transition {
            seq,
            status,
            retry_count: next.retry_count,
            last_error: next.last_error.clone(),
            not_before: next.not_before,
            at: now,
        })
        .await?;
        Ok(next)
    }

    async fn commit(&self, entry: LogEntry) -> SyncResult<()> {
        self.storage.append(&entry).await?;
        self.state.lock().apply(&entry);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::storage::MemoryStorage;
    use causeway_sync_protocol::{OperationKind, Payload, ReplicaId, VersionVector};

    fn op(entity: &str) -> Operation {
        Operation::new(
            EntityKey::new("note", entity),
            OperationKind::Update,
            Payload::new(1).with_field("title", entity),
            VersionVector::new(),
            ReplicaId::new("A"),
            1,
        )
    }

    async fn queue_with(
        storage: Arc<MemoryStorage>,
        clock: Arc<ManualClock>,
        retry: RetryConfig,
    ) -> SyncQueue<MemoryStorage> {
        SyncQueue::open(storage, clock, retry, Duration::from_secs(60))
            .await
            .unwrap()
    }

    async fn queue() -> (SyncQueue<MemoryStorage>, Arc<MemoryStorage>, Arc<ManualClock>) {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let queue = queue_with(storage.clone(), clock.clone(), RetryConfig::immediate(3)).await;
        (queue, storage, clock)
    }

    #[test]
    fn status_transitions() {
        use QueueStatus::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Pending));
        assert!(Failed.can_transition_to(Pending));
        assert!(Parked.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Parked.can_transition_to(Pending));
    }

    #[tokio::test]
    async fn enqueue_is_idempotent_by_op_id() {
        let (queue, _, _) = queue().await;
        let op = op("n1");

        let first = queue
            .enqueue(op.clone(), Direction::Outbound, Priority::Normal)
            .await
            .unwrap();
        let second = queue
            .enqueue(op, Direction::Outbound, Priority::Normal)
            .await
            .unwrap();

        assert_eq!(first, EnqueueOutcome::Added(0));
        assert_eq!(second, EnqueueOutcome::Duplicate(0));
        assert_eq!(queue.counts().pending, 1);
    }

    #[tokio::test]
    async fn applied_inbound_is_skipped() {
        let (queue, storage, _) = queue().await;
        let op = op("n1");
        storage
            .put(
                crate::storage::EntityRecord::from_operation(&op, op.vector.clone()),
                &[op.op_id],
            )
            .await
            .unwrap();

        let outcome = queue
            .enqueue(op, Direction::Inbound, Priority::Normal)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::AlreadyApplied);
        assert!(queue.snapshot().is_empty());
    }

    #[tokio::test]
    async fn batch_orders_by_priority_then_seq() {
        let (queue, _, _) = queue().await;
        queue
            .enqueue(op("low"), Direction::Outbound, Priority::Low)
            .await
            .unwrap();
        queue
            .enqueue(op("normal-1"), Direction::Outbound, Priority::Normal)
            .await
            .unwrap();
        queue
            .enqueue(op("critical"), Direction::Outbound, Priority::Critical)
            .await
            .unwrap();
        queue
            .enqueue(op("normal-2"), Direction::Outbound, Priority::Normal)
            .await
            .unwrap();

        let batch = queue
            .next_batch(Direction::Outbound, 3, false)
            .await
            .unwrap();
        let ids: Vec<_> = batch
            .iter()
            .map(|i| i.operation.entity_id.as_str().to_owned())
            .collect();
        assert_eq!(ids, vec!["critical", "normal-1", "normal-2"]);
        assert!(batch.iter().all(|i| i.status == QueueStatus::InProgress));
        assert_eq!(queue.counts().pending, 1);
    }

    #[tokio::test]
    async fn one_per_entity_takes_oldest() {
        let (queue, _, _) = queue().await;
        let first = op("n1");
        let second = op("n1");
        queue
            .enqueue(first.clone(), Direction::Inbound, Priority::Normal)
            .await
            .unwrap();
        queue
            .enqueue(second, Direction::Inbound, Priority::Normal)
            .await
            .unwrap();
        queue
            .enqueue(op("n2"), Direction::Inbound, Priority::Normal)
            .await
            .unwrap();

        let batch = queue.next_batch(Direction::Inbound, 10, true).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].operation.op_id, first.op_id);
        assert_eq!(queue.pending_for(&first.key()).len(), 2);
    }

    #[tokio::test]
    async fn directions_are_separate() {
        let (queue, _, _) = queue().await;
        queue
            .enqueue(op("out"), Direction::Outbound, Priority::Normal)
            .await
            .unwrap();
        let batch = queue.next_batch(Direction::Inbound, 10, true).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn failures_back_off_then_fail() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let retry = RetryConfig::new(2)
            .with_initial_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_secs(1))
            .with_jitter(false);
        let queue = queue_with(storage, clock.clone(), retry).await;

        queue
            .enqueue(op("n1"), Direction::Outbound, Priority::Normal)
            .await
            .unwrap();
        let seq = queue.next_batch(Direction::Outbound, 1, false).await.unwrap()[0].seq;

        let status = queue.record_failure(seq, "connection reset").await.unwrap();
        assert_eq!(status, QueueStatus::Pending);
        let item = queue.get(seq).unwrap();
        assert_eq!(item.retry_count, 1);
        assert_eq!(item.not_before, 1_100);

        // Still backing off.
        assert!(queue
            .next_batch(Direction::Outbound, 1, false)
            .await
            .unwrap()
            .is_empty());

        clock.advance(100);
        let batch = queue.next_batch(Direction::Outbound, 1, false).await.unwrap();
        assert_eq!(batch.len(), 1);

        let status = queue.record_failure(seq, "connection reset").await.unwrap();
        assert_eq!(status, QueueStatus::Failed);
        assert_eq!(queue.failed_items().len(), 1);
        assert_eq!(
            queue.get(seq).unwrap().last_error.as_deref(),
            Some("connection reset")
        );
    }

    #[tokio::test]
    async fn operator_retry_resets_count() {
        let (queue, _, _) = queue().await;
        queue
            .enqueue(op("n1"), Direction::Outbound, Priority::Normal)
            .await
            .unwrap();
        let seq = queue.next_batch(Direction::Outbound, 1, false).await.unwrap()[0].seq;
        queue.quarantine(seq, "bad payload").await.unwrap();
        assert_eq!(queue.counts().failed, 1);

        assert_eq!(queue.retry_all_failed().await.unwrap(), 1);
        let item = queue.get(seq).unwrap();
        assert_eq!(item.status, QueueStatus::Pending);
        assert_eq!(item.retry_count, 0);
    }

    #[tokio::test]
    async fn invalid_transition_is_rejected() {
        let (queue, _, _) = queue().await;
        queue
            .enqueue(op("n1"), Direction::Outbound, Priority::Normal)
            .await
            .unwrap();
        assert!(matches!(
            queue.mark_completed(0).await,
            Err(SyncError::InvalidStateTransition { .. })
        ));
        assert!(matches!(
            queue.mark_completed(99).await,
            Err(SyncError::QueueItemNotFound(99))
        ));
    }

    #[tokio::test]
    async fn reopen_recovers_in_progress_and_cursor() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000));
        {
            let queue =
                queue_with(storage.clone(), clock.clone(), RetryConfig::immediate(3)).await;
            queue
                .enqueue(op("n1"), Direction::Outbound, Priority::High)
                .await
                .unwrap();
            queue
                .enqueue(op("n2"), Direction::Outbound, Priority::Normal)
                .await
                .unwrap();
            queue.next_batch(Direction::Outbound, 1, false).await.unwrap();
            queue.set_cursor(17).await.unwrap();
        }

        let queue = queue_with(storage, clock, RetryConfig::immediate(3)).await;
        let counts = queue.counts();
        assert_eq!(counts.pending, 2);
        assert_eq!(counts.in_progress, 0);
        assert_eq!(queue.cursor(), 17);

        // New items continue the sequence.
        let outcome = queue
            .enqueue(op("n3"), Direction::Outbound, Priority::Normal)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Added(2));
    }

    #[tokio::test]
    async fn failed_append_leaves_no_trace() {
        let (queue, storage, _) = queue().await;
        let op = op("n1");
        storage.set_unavailable(Some("gone"));
        assert!(queue
            .enqueue(op.clone(), Direction::Outbound, Priority::Normal)
            .await
            .is_err());
        storage.set_unavailable(None);

        assert!(queue.seq_of(&op.op_id).is_none());
        let outcome = queue
            .enqueue(op, Direction::Outbound, Priority::Normal)
            .await
            .unwrap();
        assert!(matches!(outcome, EnqueueOutcome::Added(_)));
    }

    #[tokio::test]
    async fn commit_outbound_journals_record_and_item_together() {
        let storage = Arc::new(MemoryStorage::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let local = op("n1");
        {
            let queue =
                queue_with(storage.clone(), clock.clone(), RetryConfig::immediate(3)).await;
            let record = EntityRecord::from_operation(&local, local.vector.clone());
            let outcome = queue
                .commit_outbound(record, &[local.op_id], local.clone(), Priority::High)
                .await
                .unwrap();
            assert_eq!(outcome, EnqueueOutcome::Added(0));
        }

        let entries = storage.replay().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].label(), "committed");

        let queue = queue_with(storage.clone(), clock, RetryConfig::immediate(3)).await;
        assert_eq!(queue.seq_of(&local.op_id), Some(0));
        assert_eq!(queue.get(0).unwrap().priority, Priority::High);
        assert!(storage.get(&local.key()).await.unwrap().is_some());
        assert!(storage.is_applied(&local.op_id).await.unwrap());
    }

    #[tokio::test]
    async fn refused_commit_queues_nothing() {
        let (queue, storage, _) = queue().await;
        let local = op("n1");
        storage.reject_puts_for(local.key(), "constraint violated");

        let record = EntityRecord::from_operation(&local, local.vector.clone());
        assert!(queue
            .commit_outbound(record, &[local.op_id], local.clone(), Priority::Normal)
            .await
            .is_err());
        assert!(queue.seq_of(&local.op_id).is_none());
        assert!(storage.replay().await.unwrap().is_empty());

        storage.clear_rejection(&local.key());
        let record = EntityRecord::from_operation(&local, local.vector.clone());
        let outcome = queue
            .commit_outbound(record, &[local.op_id], local, Priority::Normal)
            .await
            .unwrap();
        assert_eq!(outcome, EnqueueOutcome::Added(1));
    }

    #[tokio::test]
    async fn quarantined_item_drops_payload_and_stays_failed() {
        let (queue, _, _) = queue().await;
        let remote = op("n1");

        let outcome = queue
            .enqueue_quarantined(
                remote.clone(),
                Direction::Inbound,
                Priority::Normal,
                "too large",
            )
            .await
            .unwrap();
        let EnqueueOutcome::Added(seq) = outcome else {
            panic!("expected a new item, got {outcome:?}");
        };

        let item = queue.get(seq).unwrap();
        assert_eq!(item.status, QueueStatus::Failed);
        assert!(item.payload_dropped);
        assert!(item.operation.payload.fields.is_empty());
        assert_eq!(item.operation.op_id, remote.op_id);
        assert_eq!(item.last_error.as_deref(), Some("too large"));

        // The op id stays taken, and the item cannot be served again.
        assert_eq!(
            queue
                .enqueue(remote, Direction::Inbound, Priority::Normal)
                .await
                .unwrap(),
            EnqueueOutcome::Duplicate(seq)
        );
        assert!(matches!(
            queue.retry_failed(seq).await,
            Err(SyncError::PayloadDropped(s)) if s == seq
        ));
        assert_eq!(queue.retry_all_failed().await.unwrap(), 0);
        assert!(queue
            .next_batch(Direction::Inbound, 10, false)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn park_and_unpark() {
        let (queue, _, _) = queue().await;
        let remote = op("n1");
        let local = op("n1");
        queue
            .enqueue(remote.clone(), Direction::Inbound, Priority::Normal)
            .await
            .unwrap();
        let seq = queue.next_batch(Direction::Inbound, 1, true).await.unwrap()[0].seq;

        let record = ConflictRecord::new(local, remote, 5);
        let id = record.conflict_id;
        queue.park(seq, record).await.unwrap();
        assert_eq!(queue.counts().parked, 1);
        assert_eq!(queue.parked().len(), 1);

        let parked = queue.unpark(id).await.unwrap();
        assert_eq!(parked.seq, seq);
        assert_eq!(queue.get(seq).unwrap().status, QueueStatus::Completed);
        assert!(queue.parked().is_empty());
        assert!(matches!(
            queue.unpark(id).await,
            Err(SyncError::ParkedConflictNotFound(_))
        ));
    }

    #[tokio::test]
    async fn prune_respects_retention() {
        let (queue, _, clock) = queue().await;
        queue
            .enqueue(op("n1"), Direction::Outbound, Priority::Normal)
            .await
            .unwrap();
        let seq = queue.next_batch(Direction::Outbound, 1, false).await.unwrap()[0].seq;
        queue.mark_completed(seq).await.unwrap();

        assert_eq!(queue.prune_completed().await.unwrap(), 0);
        clock.advance(60_000);
        assert_eq!(queue.prune_completed().await.unwrap(), 1);
        assert!(queue.get(seq).is_none());
    }
}
