//! Sync coordinator.
//!
//! One cycle runs `Pulling -> Detecting -> Resolving -> Applying -> Pushing`
//! and returns to `Idle`:
//!
//! 1. Pull pages from the authority and durably queue them as inbound items
//!    before advancing the persisted cursor.
//! 2. In rounds, claim the oldest inbound item of each entity, classify it
//!    against local state, resolve conflicts and commit the results with
//!    bounded parallelism across entities.
//! 3. Push outbound items with at most `max_in_flight` round trips at once.
//!
//! An operation too large or malformed to journal or send is quarantined
//! as a `Failed` item and the rest of its batch continues.
//!
//! A transport failure moves the coordinator to `Offline`; local writes
//! keep queueing. A fatal storage failure moves it to `Paused` until
//! [`SyncCoordinator::resume`]. Cancellation is observed between batches.

use crate::clock::{HybridClock, SystemClock, TimeSource};
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::locks::EntityLocks;
use crate::notify::{NoopNotifier, Notifier, SyncEvent};
use crate::queue::{
    Direction, EnqueueOutcome, ParkedConflict, QueueCounts, QueueStatus, SyncQueue, SyncQueueItem,
};
use crate::resolver::{MergeBasis, MergedOperation, Resolver};
use crate::storage::{EntityRecord, SyncStorage};
use crate::transport::SyncTransport;
use causeway_sync_protocol::{
    AckStatus, ConflictDetector, ConflictId, ConflictOutcome, ConflictRecord, Detection,
    EntityKey, OpId, Operation, OperationKind, Payload, ProtocolError, PullRequest, PushRequest,
    PushResponse, VersionVector,
};
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex as AsyncMutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Coordinator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    /// Waiting for the next cycle.
    Idle,
    /// Fetching remote operations.
    Pulling,
    /// Classifying inbound operations.
    Detecting,
    /// Running conflict strategies.
    Resolving,
    /// Committing inbound results.
    Applying,
    /// Sending local operations.
    Pushing,
    /// The authority is unreachable.
    Offline,
    /// Stopped on a fatal storage error.
    Paused,
    /// Shut down.
    Stopped,
}

impl SyncState {
    /// Returns true if moving to `next` is allowed.
    pub fn can_transition_to(self, next: SyncState) -> bool {
        use SyncState::*;
        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) | (_, Paused) => true,
            (Paused, Idle) => true,
            (Paused, _) => false,
            (Idle | Offline, Pulling) => true,
            (Pulling, Detecting | Pushing) => true,
            (Detecting, Resolving | Applying | Pushing) => true,
            (Resolving, Applying) => true,
            (Applying, Detecting | Pushing) => true,
            (Pulling | Detecting | Resolving | Applying | Pushing, Idle | Offline) => true,
            _ => false,
        }
    }

    /// Returns true while a cycle is running.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SyncState::Pulling
                | SyncState::Detecting
                | SyncState::Resolving
                | SyncState::Applying
                | SyncState::Pushing
        )
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            SyncState::Idle => "idle",
            SyncState::Pulling => "pulling",
            SyncState::Detecting => "detecting",
            SyncState::Resolving => "resolving",
            SyncState::Applying => "applying",
            SyncState::Pushing => "pushing",
            SyncState::Offline => "offline",
            SyncState::Paused => "paused",
            SyncState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operator decision for a parked conflict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ManualChoice {
    /// Keep the current local state.
    KeepLocal,
    /// Take the remote operation.
    AcceptRemote,
    /// Write a new payload.
    Replace(Payload),
}

/// Cumulative counters.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that reached `Idle`.
    pub cycles_completed: u64,
    /// Operations newly queued by pulls.
    pub operations_pulled: u64,
    /// Operations acknowledged by the authority.
    pub operations_pushed: u64,
    /// Inbound operations committed.
    pub operations_applied: u64,
    /// Inbound operations already covered locally.
    pub stale_discarded: u64,
    /// Concurrent pairs seen.
    pub conflicts_detected: u64,
    /// Conflicts settled by a strategy.
    pub conflicts_auto_resolved: u64,
    /// Conflicts left for an operator.
    pub conflicts_parked: u64,
    /// Items marked `Failed`.
    pub items_failed: u64,
    /// Failed attempts that will be retried.
    pub retries: u64,
    /// End of the last completed cycle (ms).
    pub last_sync_at: Option<u64>,
    /// Error that ended the last cycle, if any.
    pub last_error: Option<String>,
}

/// What one cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Operations newly queued by pulls.
    pub pulled: usize,
    /// Inbound operations committed.
    pub applied: usize,
    /// Inbound operations already covered locally.
    pub stale: usize,
    /// Pulled or claimed operations that were already applied.
    pub skipped_duplicates: usize,
    /// Concurrent pairs seen.
    pub conflicts: usize,
    /// Conflicts settled by a strategy.
    pub resolved: Vec<ConflictRecord>,
    /// Conflicts left for an operator.
    pub parked: Vec<ConflictId>,
    /// Items returned to the queue because the entity changed under them.
    pub deferred: usize,
    /// Operations acknowledged by the authority.
    pub pushed: usize,
    /// Operations refused by the authority.
    pub push_rejected: usize,
    /// Items marked `Failed`.
    pub failed: usize,
    /// Completed items pruned.
    pub pruned: usize,
    /// Wall time.
    pub duration: Duration,
}

/// Builds a [`SyncCoordinator`].
pub struct CoordinatorBuilder<T, S> {
    config: SyncConfig,
    transport: Arc<T>,
    storage: Arc<S>,
    resolver: Resolver,
    notifier: Arc<dyn Notifier>,
    time: Arc<dyn TimeSource>,
}

impl<T: SyncTransport, S: SyncStorage> CoordinatorBuilder<T, S> {
    /// Starts a builder with last-write-wins resolution, no notifications
    /// and the system clock.
    pub fn new(config: SyncConfig, transport: Arc<T>, storage: Arc<S>) -> Self {
        Self {
            config,
            transport,
            storage,
            resolver: Resolver::default(),
            notifier: Arc::new(NoopNotifier),
            time: Arc::new(SystemClock),
        }
    }

    /// Sets the conflict resolver.
    pub fn with_resolver(mut self, resolver: Resolver) -> Self {
        self.resolver = resolver;
        self
    }

    /// Sets the notifier.
    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Sets the wall clock.
    pub fn with_time_source(mut self, time: Arc<dyn TimeSource>) -> Self {
        self.time = time;
        self
    }

    /// Replays the queue and returns an idle coordinator.
    pub async fn open(self) -> SyncResult<SyncCoordinator<T, S>> {
        let queue = SyncQueue::open(
            self.storage.clone(),
            self.time.clone(),
            self.config.retry.clone(),
            self.config.completed_retention,
        )
        .await?;

        let counts = queue.counts();
        info!(
            replica = %self.config.replica_id,
            pending = counts.pending,
            failed = counts.failed,
            parked = counts.parked,
            cursor = queue.cursor(),
            "sync coordinator opened"
        );

        Ok(SyncCoordinator {
            clock: HybridClock::new(self.time.clone()),
            config: self.config,
            transport: self.transport,
            storage: self.storage,
            queue,
            resolver: self.resolver,
            detector: ConflictDetector::new(),
            notifier: self.notifier,
            time: self.time,
            locks: EntityLocks::new(),
            state: RwLock::new(SyncState::Idle),
            stats: RwLock::new(SyncStats::default()),
            paused_reason: RwLock::new(None),
            cancel: CancellationToken::new(),
            wake: Notify::new(),
            cycle_lock: AsyncMutex::new(()),
        })
    }
}

struct Conflicted {
    item: SyncQueueItem,
    observed: Option<VersionVector>,
    record: ConflictRecord,
}

enum Plan {
    Apply {
        operation: Operation,
        merged_vector: VersionVector,
    },
    Merge {
        record: ConflictRecord,
        merged: MergedOperation,
    },
}

struct Planned {
    item: SyncQueueItem,
    // Entity vector at detection; `None` if the entity did not exist.
    observed: Option<VersionVector>,
    plan: Plan,
}

struct Resolution {
    record: ConflictRecord,
    strategy: &'static str,
    basis: MergeBasis,
}

enum Applied {
    Committed(Option<Resolution>),
    Deferred,
}

/// Drives synchronization between local storage and the authority.
pub struct SyncCoordinator<T: SyncTransport, S: SyncStorage> {
    config: SyncConfig,
    transport: Arc<T>,
    storage: Arc<S>,
    queue: SyncQueue<S>,
    resolver: Resolver,
    detector: ConflictDetector,
    notifier: Arc<dyn Notifier>,
    time: Arc<dyn TimeSource>,
    clock: HybridClock<dyn TimeSource>,
    locks: EntityLocks,
    state: RwLock<SyncState>,
    stats: RwLock<SyncStats>,
    paused_reason: RwLock<Option<String>>,
    cancel: CancellationToken,
    wake: Notify,
    cycle_lock: AsyncMutex<()>,
}

impl<T: SyncTransport, S: SyncStorage> SyncCoordinator<T, S> {
    /// Starts a [`CoordinatorBuilder`].
    pub fn builder(config: SyncConfig, transport: Arc<T>, storage: Arc<S>) -> CoordinatorBuilder<T, S> {
        CoordinatorBuilder::new(config, transport, storage)
    }

    /// Current state.
    pub fn state(&self) -> SyncState {
        *self.state.read()
    }

    /// Cumulative counters.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    /// Configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Storage collaborator.
    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// The durable queue.
    pub fn queue(&self) -> &SyncQueue<S> {
        &self.queue
    }

    /// Queue item counts by status.
    pub fn queue_counts(&self) -> QueueCounts {
        self.queue.counts()
    }

    /// Items that need an operator.
    pub fn failed_items(&self) -> Vec<SyncQueueItem> {
        self.queue.failed_items()
    }

    /// Conflicts waiting for [`SyncCoordinator::resolve_parked`].
    pub fn parked_conflicts(&self) -> Vec<ParkedConflict> {
        self.queue.parked()
    }

    /// Token cancelled by [`SyncCoordinator::shutdown`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Records a local mutation and queues it for push.
    ///
    /// The entity's vector gains one tick in this replica's slot. Payload,
    /// vector and the outbound queue item are committed in one write.
    /// Operations larger than `max_operation_size` are refused.
    pub async fn record_local(
        &self,
        key: EntityKey,
        kind: OperationKind,
        payload: Payload,
    ) -> SyncResult<Operation> {
        self.ensure_runnable()?;

        let operation = {
            let _guard = self.locks.lock(&key).await;
            let current = self.storage_call(&key, None, self.storage.get(&key)).await?;
            let vector = current
                .map(|record| record.vector)
                .unwrap_or_default()
                .incremented(&self.config.replica_id);
            let operation = Operation::new(
                key.clone(),
                kind,
                payload,
                vector,
                self.config.replica_id.clone(),
                self.clock.tick(),
            );
            self.check_size(&operation)?;
            let record = EntityRecord::from_operation(&operation, operation.vector.clone());
            self.storage_call(
                &key,
                Some(operation.op_id),
                self.commit_outbound(record, &[operation.op_id], operation.clone()),
            )
            .await?;
            operation
        };

        debug!(entity = %key, op_id = %operation.op_id, kind = %operation.kind, "local write recorded");
        self.wake.notify_one();
        Ok(operation)
    }

    /// Runs one full cycle.
    ///
    /// Cycles never overlap. Fails with [`SyncError::Paused`] while paused
    /// and [`SyncError::Cancelled`] after shutdown.
    pub async fn run_cycle(&self) -> SyncResult<CycleReport> {
        let _cycle = self.cycle_lock.lock().await;
        self.ensure_runnable()?;

        let started = Instant::now();
        let mut report = CycleReport::default();
        let outcome = self.cycle(&mut report).await;
        report.duration = started.elapsed();
        self.accumulate(&report);

        match outcome {
            Ok(()) => {
                self.transition(SyncState::Idle)?;
                {
                    let mut stats = self.stats.write();
                    stats.cycles_completed += 1;
                    stats.last_sync_at = Some(self.time.now_millis());
                    stats.last_error = None;
                }
                info!(
                    pulled = report.pulled,
                    applied = report.applied,
                    conflicts = report.conflicts,
                    pushed = report.pushed,
                    failed = report.failed,
                    elapsed_ms = report.duration.as_millis() as u64,
                    "sync cycle completed"
                );
                self.notifier.emit(SyncEvent::CycleCompleted(report.clone()));
                Ok(report)
            }
            Err(error) => Err(self.abort_cycle(error)),
        }
    }

    /// Runs cycles until [`SyncCoordinator::shutdown`].
    ///
    /// Cycles start every `sync_interval`, immediately after a local write,
    /// or every `offline_probe_interval` while offline.
    pub async fn run(&self) {
        info!(replica = %self.config.replica_id, "sync loop started");
        let mut delay = Duration::ZERO;
        loop {
            let offline = self.state() == SyncState::Offline;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
                _ = self.wake.notified(), if !offline => {}
            }

            delay = match self.run_cycle().await {
                Ok(_) => self.config.sync_interval,
                Err(SyncError::Cancelled) => break,
                Err(error) if error.is_transport() => self.config.offline_probe_interval,
                Err(error) => {
                    debug!(%error, "sync cycle ended early");
                    self.config.sync_interval
                }
            };
        }

        let _cycle = self.cycle_lock.lock().await;
        self.settle(SyncState::Stopped);
        info!("sync loop stopped");
    }

    /// Cancels at the next batch boundary and waits for the running cycle.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let _cycle = self.cycle_lock.lock().await;
        self.settle(SyncState::Stopped);
    }

    /// Leaves `Paused` once storage is reachable again.
    ///
    /// Items interrupted by the failure are requeued.
    pub async fn resume(&self) -> SyncResult<()> {
        let _cycle = self.cycle_lock.lock().await;
        let state = self.state();
        if state != SyncState::Paused {
            return Err(SyncError::InvalidStateTransition {
                from: state.to_string(),
                to: SyncState::Idle.to_string(),
            });
        }

        let requeued = self.queue.recover().await?;
        *self.paused_reason.write() = None;
        self.transition(SyncState::Idle)?;
        info!(requeued, "sync resumed");
        self.wake.notify_one();
        Ok(())
    }

    /// Operator retry of one failed item.
    pub async fn retry_failed(&self, seq: u64) -> SyncResult<()> {
        self.queue.retry_failed(seq).await?;
        self.wake.notify_one();
        Ok(())
    }

    /// Operator retry of every failed item.
    pub async fn retry_all_failed(&self) -> SyncResult<usize> {
        let count = self.queue.retry_all_failed().await?;
        if count > 0 {
            self.wake.notify_one();
        }
        Ok(count)
    }

    /// Commits an operator decision for a parked conflict.
    ///
    /// The decision becomes a new operation that dominates both sides, is
    /// applied locally and queued for push.
    pub async fn resolve_parked(
        &self,
        conflict_id: ConflictId,
        choice: ManualChoice,
    ) -> SyncResult<Operation> {
        self.ensure_runnable()?;
        let parked = self
            .queue
            .parked_conflict(conflict_id)
            .ok_or(SyncError::ParkedConflictNotFound(conflict_id))?;
        let record = parked.record;
        let key = record.key();
        let remote = &record.remote_op;

        let basis = match choice {
            ManualChoice::KeepLocal => MergeBasis::TookLocal,
            ManualChoice::AcceptRemote => MergeBasis::TookRemote,
            ManualChoice::Replace(_) => MergeBasis::Combined,
        };

        let operation = {
            let _guard = self.locks.lock(&key).await;
            let current = self.storage_call(&key, None, self.storage.get(&key)).await?;
            let vector = current
                .as_ref()
                .map(|r| r.vector.clone())
                .unwrap_or_default()
                .merge(&remote.vector)
                .incremented(&self.config.replica_id);

            let (kind, payload) = match choice {
                ManualChoice::KeepLocal => {
                    let local = current
                        .as_ref()
                        .map(EntityRecord::as_operation)
                        .unwrap_or_else(|| record.local_op.clone());
                    (local.kind, local.payload)
                }
                ManualChoice::AcceptRemote => (remote.kind, remote.payload.clone()),
                ManualChoice::Replace(payload) => (OperationKind::Update, payload),
            };

            let operation = Operation::new(
                key.clone(),
                kind,
                payload,
                vector,
                self.config.replica_id.clone(),
                self.clock.tick(),
            );
            let committed = EntityRecord::from_operation(&operation, operation.vector.clone());
            self.storage_call(
                &key,
                Some(operation.op_id),
                self.commit_outbound(
                    committed,
                    &[operation.op_id, remote.op_id],
                    operation.clone(),
                ),
            )
            .await?;
            operation
        };

        self.queue.unpark(conflict_id).await?;
        info!(entity = %key, %conflict_id, %basis, "parked conflict resolved by operator");
        self.notifier.emit(SyncEvent::ConflictResolved {
            key,
            strategy: "operator",
            basis,
        });
        self.wake.notify_one();
        Ok(operation)
    }

    async fn cycle(&self, report: &mut CycleReport) -> SyncResult<()> {
        self.transition(SyncState::Pulling)?;
        self.pull(report).await?;
        self.apply_inbound(report).await?;
        self.transition(SyncState::Pushing)?;
        self.push(report).await?;

        report.pruned = self.queue.prune_completed().await?;
        self.locks.prune_idle();
        Ok(())
    }

    async fn pull(&self, report: &mut CycleReport) -> SyncResult<()> {
        let mut cursor = self.queue.cursor();
        loop {
            self.check_cancelled()?;
            let request = PullRequest {
                replica: self.config.replica_id.clone(),
                cursor,
                limit: u32::try_from(self.config.batch_size).unwrap_or(u32::MAX),
            };
            let page = self.round_trip(self.transport.pull(request)).await?;
            debug!(
                cursor,
                received = page.operations.len(),
                next_cursor = page.next_cursor,
                has_more = page.has_more,
                "pulled page"
            );

            for operation in page.operations {
                self.clock.observe(operation.logical_time);
                self.admit_inbound(operation, report).await?;
            }

            // Every pulled operation is durable before the cursor moves.
            self.queue.set_cursor(page.next_cursor).await?;
            let advanced = page.next_cursor != cursor;
            cursor = page.next_cursor;
            if !page.has_more {
                return Ok(());
            }
            if !advanced {
                warn!(cursor, "authority reported more data without advancing the cursor");
                return Ok(());
            }
        }
    }

    // Queues one pulled operation. One that cannot be journaled whole is
    // recorded as a failed item without its payload so the cursor can move.
    async fn admit_inbound(&self, operation: Operation, report: &mut CycleReport) -> SyncResult<()> {
        let priority = self.config.priority_for(&operation.entity_type);
        let admitted = match self.check_size(&operation) {
            Ok(()) => {
                self.queue
                    .enqueue(operation.clone(), Direction::Inbound, priority)
                    .await
            }
            Err(error) => Err(error),
        };

        match admitted {
            Ok(EnqueueOutcome::Added(_)) => report.pulled += 1,
            Ok(EnqueueOutcome::Duplicate(_) | EnqueueOutcome::AlreadyApplied) => {
                report.skipped_duplicates += 1
            }
            Err(error) if error.kind() == ErrorKind::Serialization => {
                let message = error.to_string();
                let key = operation.key();
                let op_id = operation.op_id;
                warn!(entity = %key, %op_id, %error, "inbound operation quarantined");
                let outcome = self
                    .queue
                    .enqueue_quarantined(operation, Direction::Inbound, priority, &message)
                    .await?;
                if let EnqueueOutcome::Added(seq) = outcome {
                    report.failed += 1;
                    self.stats.write().items_failed += 1;
                    self.notifier.emit(SyncEvent::ItemFailed {
                        seq,
                        key,
                        op_id,
                        kind: ErrorKind::Serialization,
                        message,
                    });
                } else {
                    report.skipped_duplicates += 1;
                }
            }
            Err(error) => return Err(error),
        }
        Ok(())
    }

    async fn apply_inbound(&self, report: &mut CycleReport) -> SyncResult<()> {
        loop {
            self.check_cancelled()?;
            let batch = self
                .queue
                .next_batch(Direction::Inbound, self.config.batch_size, true)
                .await?;
            if batch.is_empty() {
                return Ok(());
            }

            self.transition(SyncState::Detecting)?;
            let (mut planned, conflicts) = self.detect(batch, report).await?;

            if !conflicts.is_empty() {
                self.transition(SyncState::Resolving)?;
                planned.extend(self.resolve(conflicts, report).await?);
            }

            self.transition(SyncState::Applying)?;
            self.apply(planned, report).await?;
        }
    }

    async fn detect(
        &self,
        batch: Vec<SyncQueueItem>,
        report: &mut CycleReport,
    ) -> SyncResult<(Vec<Planned>, Vec<Conflicted>)> {
        let now = self.time.now_millis();
        let mut planned = Vec::with_capacity(batch.len());
        let mut conflicts = Vec::new();

        for item in batch {
            let key = item.key();
            let op_id = item.operation.op_id;

            let (applied, current) = match self.observe(&key, &op_id).await {
                Ok(observed) => observed,
                Err(error) => {
                    self.fail_item(&item, error, report).await?;
                    continue;
                }
            };

            if applied {
                self.queue.mark_completed(item.seq).await?;
                report.skipped_duplicates += 1;
                continue;
            }

            let detection = match &current {
                Some(record) => self.detector.detect(
                    item.operation.clone(),
                    &record.vector,
                    || record.as_operation(),
                    now,
                ),
                // First sight of the entity.
                None => Detection::Apply {
                    operation: item.operation.clone(),
                    merged_vector: item.operation.vector.clone(),
                },
            };
            let observed = current.map(|record| record.vector);

            match detection {
                Detection::Apply {
                    operation,
                    merged_vector,
                } => planned.push(Planned {
                    item,
                    observed,
                    plan: Plan::Apply {
                        operation,
                        merged_vector,
                    },
                }),
                Detection::Stale => {
                    debug!(entity = %key, %op_id, "stale operation discarded");
                    self.queue.mark_completed(item.seq).await?;
                    report.stale += 1;
                }
                Detection::Conflict(record) => {
                    info!(
                        entity = %key,
                        conflict_id = %record.conflict_id,
                        local = %record.local_op.vector,
                        remote = %record.remote_op.vector,
                        "concurrent operations detected"
                    );
                    report.conflicts += 1;
                    conflicts.push(Conflicted {
                        item,
                        observed,
                        record,
                    });
                }
            }
        }

        Ok((planned, conflicts))
    }

    async fn observe(
        &self,
        key: &EntityKey,
        op_id: &OpId,
    ) -> SyncResult<(bool, Option<EntityRecord>)> {
        if self.storage.is_applied(op_id).await? {
            return Ok((true, None));
        }
        Ok((false, self.storage.get(key).await?))
    }

    async fn resolve(
        &self,
        conflicts: Vec<Conflicted>,
        report: &mut CycleReport,
    ) -> SyncResult<Vec<Planned>> {
        let mut planned = Vec::with_capacity(conflicts.len());
        for Conflicted {
            item,
            observed,
            record,
        } in conflicts
        {
            match self.resolver.resolve(&record) {
                Ok(merged) => planned.push(Planned {
                    item,
                    observed,
                    plan: Plan::Merge { record, merged },
                }),
                Err(manual) => {
                    let record = record.with_outcome(ConflictOutcome::Parked);
                    let conflict_id = record.conflict_id;
                    let key = record.key();
                    let local_op = record.local_op.op_id;
                    let remote_op = record.remote_op.op_id;

                    if let Err(error) = self.queue.park(item.seq, record).await {
                        self.fail_item(&item, error, report).await?;
                        continue;
                    }
                    warn!(entity = %key, %conflict_id, reason = %manual, "conflict parked");
                    report.parked.push(conflict_id);
                    self.notifier.emit(SyncEvent::ConflictParked {
                        conflict_id,
                        key,
                        local_op,
                        remote_op,
                    });
                }
            }
        }
        Ok(planned)
    }

    async fn apply(&self, planned: Vec<Planned>, report: &mut CycleReport) -> SyncResult<()> {
        let outcomes: Vec<(SyncQueueItem, SyncResult<Applied>)> = stream::iter(planned)
            .map(|Planned { item, observed, plan }| async move {
                let outcome = self.commit(&item, observed, plan).await;
                (item, outcome)
            })
            .buffer_unordered(self.config.apply_parallelism)
            .collect()
            .await;

        for (item, outcome) in outcomes {
            match outcome {
                Ok(Applied::Committed(resolution)) => {
                    self.queue.mark_completed(item.seq).await?;
                    report.applied += 1;
                    if let Some(Resolution {
                        record,
                        strategy,
                        basis,
                    }) = resolution
                    {
                        self.notifier.emit(SyncEvent::ConflictResolved {
                            key: record.key(),
                            strategy,
                            basis,
                        });
                        report.resolved.push(record);
                    }
                }
                Ok(Applied::Deferred) => {
                    self.queue.defer(item.seq).await?;
                    report.deferred += 1;
                }
                Err(error) => self.fail_item(&item, error, report).await?,
            }
        }
        Ok(())
    }

    async fn commit(
        &self,
        item: &SyncQueueItem,
        observed: Option<VersionVector>,
        plan: Plan,
    ) -> SyncResult<Applied> {
        let key = item.key();
        let _guard = self.locks.lock(&key).await;

        let current = self.storage.get(&key).await?;
        if current.as_ref().map(|r| &r.vector) != observed.as_ref() {
            debug!(entity = %key, op_id = %item.operation.op_id, "entity changed since detection");
            return Ok(Applied::Deferred);
        }

        match plan {
            Plan::Apply {
                operation,
                merged_vector,
            } => {
                let record = EntityRecord::from_operation(&operation, merged_vector);
                self.storage.put(record, &[operation.op_id]).await?;
                debug!(entity = %key, op_id = %operation.op_id, "remote operation applied");
                Ok(Applied::Committed(None))
            }
            Plan::Merge { record, merged } => {
                let local_vector = observed.unwrap_or_default();
                let resolution = self.commit_merge(&local_vector, record, merged).await?;
                Ok(Applied::Committed(Some(resolution)))
            }
        }
    }

    async fn commit_merge(
        &self,
        local_vector: &VersionVector,
        record: ConflictRecord,
        merged: MergedOperation,
    ) -> SyncResult<Resolution> {
        let remote_op = record.remote_op.op_id;
        let merged_vector = local_vector.merge(&record.remote_op.vector);
        let MergedOperation {
            operation,
            siblings,
            basis,
            strategy,
        } = merged;

        let result = if basis == MergeBasis::Combined {
            // New history: it must dominate both inputs on other replicas.
            let mut operation = operation;
            operation.vector = merged_vector.incremented(&self.config.replica_id);
            operation.origin = self.config.replica_id.clone();
            operation.logical_time = self.clock.tick();
            let committed = EntityRecord::from_operation(&operation, operation.vector.clone());
            self.commit_outbound(committed, &[remote_op, operation.op_id], operation.clone())
                .await?;
            operation
        } else {
            // Every replica reaches the same pick; nothing to push.
            let committed = EntityRecord::from_operation(&operation, merged_vector);
            self.storage.put(committed, &[remote_op]).await?;
            operation
        };

        for sibling in siblings {
            self.commit_sibling(sibling).await?;
        }

        Ok(Resolution {
            record: record.with_outcome(ConflictOutcome::AutoResolved(result.payload)),
            strategy,
            basis,
        })
    }

    async fn commit_sibling(&self, mut sibling: Operation) -> SyncResult<()> {
        let key = sibling.key();
        let _guard = self.locks.lock(&key).await;
        // The same preserved version may already have arrived from another replica.
        if self.storage.is_applied(&sibling.op_id).await? {
            return Ok(());
        }

        let base = self
            .storage
            .get(&key)
            .await?
            .map(|record| record.vector)
            .unwrap_or_default();
        sibling.vector = base.incremented(&self.config.replica_id);

        let committed = EntityRecord::from_operation(&sibling, sibling.vector.clone());
        let op_id = sibling.op_id;
        self.commit_outbound(committed, &[op_id], sibling).await?;
        debug!(entity = %key, %op_id, "preserved conflicting version");
        Ok(())
    }

    async fn push(&self, report: &mut CycleReport) -> SyncResult<()> {
        let limit = self
            .config
            .batch_size
            .saturating_mul(self.config.max_in_flight);
        let replica = &self.config.replica_id;
        // Items retried within this cycle wait for the next one.
        let mut attempted = HashSet::new();

        loop {
            self.check_cancelled()?;
            let claimed = self
                .queue
                .next_batch(Direction::Outbound, limit, false)
                .await?;
            if claimed.is_empty() {
                return Ok(());
            }
            let mut batch = Vec::with_capacity(claimed.len());
            let mut repeated = 0;
            for item in claimed {
                if !attempted.insert(item.seq) {
                    self.queue.defer(item.seq).await?;
                    repeated += 1;
                    continue;
                }
                match self.check_size(&item.operation) {
                    Ok(()) => batch.push(item),
                    Err(error) => {
                        warn!(
                            seq = item.seq,
                            op_id = %item.operation.op_id,
                            %error,
                            "outbound operation quarantined"
                        );
                        self.quarantine(&item, error.kind(), error.to_string(), report)
                            .await?;
                    }
                }
            }
            if batch.is_empty() {
                // Only oversized items were claimed; claim again.
                if repeated == 0 {
                    continue;
                }
                return Ok(());
            }

            let chunks: Vec<Vec<SyncQueueItem>> = batch
                .chunks(self.config.batch_size)
                .map(<[SyncQueueItem]>::to_vec)
                .collect();
            let results: Vec<(Vec<SyncQueueItem>, SyncResult<PushResponse>)> = stream::iter(chunks)
                .map(|chunk| async move {
                    let operations = chunk.iter().map(|item| item.operation.clone()).collect();
                    let request = PushRequest::new(replica.clone(), operations);
                    let result = self.round_trip(self.transport.push(request)).await;
                    (chunk, result)
                })
                .buffer_unordered(self.config.push_window())
                .collect()
                .await;

            let mut failure = None;
            for (chunk, result) in results {
                match result {
                    Ok(response) => self.settle_acks(chunk, response, report).await?,
                    Err(error) => {
                        warn!(items = chunk.len(), %error, "push round trip failed");
                        let message = error.to_string();
                        for item in &chunk {
                            self.retry_later(item, error.kind(), &message, report)
                                .await?;
                        }
                        failure.get_or_insert(error);
                    }
                }
            }
            if let Some(error) = failure {
                return Err(error);
            }
        }
    }

    async fn settle_acks(
        &self,
        chunk: Vec<SyncQueueItem>,
        response: PushResponse,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let mut acks: HashMap<OpId, AckStatus> = response
            .acks
            .into_iter()
            .map(|ack| (ack.op_id, ack.status))
            .collect();

        for item in chunk {
            match acks.remove(&item.operation.op_id) {
                Some(status) if status.is_success() => {
                    self.queue.mark_completed(item.seq).await?;
                    report.pushed += 1;
                }
                Some(AckStatus::Rejected {
                    reason,
                    retryable: true,
                }) => {
                    report.push_rejected += 1;
                    self.retry_later(&item, ErrorKind::Refused, &reason, report)
                        .await?;
                }
                Some(AckStatus::Rejected {
                    reason,
                    retryable: false,
                }) => {
                    report.push_rejected += 1;
                    self.quarantine(&item, ErrorKind::Refused, reason, report)
                        .await?;
                }
                _ => {
                    self.retry_later(
                        &item,
                        ErrorKind::Network,
                        "authority sent no acknowledgement",
                        report,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }

    async fn retry_later(
        &self,
        item: &SyncQueueItem,
        kind: ErrorKind,
        message: &str,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        let status = self.queue.record_failure(item.seq, message).await?;
        if status != QueueStatus::Failed {
            self.stats.write().retries += 1;
            return Ok(());
        }

        report.failed += 1;
        self.stats.write().items_failed += 1;
        self.notifier.emit(SyncEvent::ItemFailed {
            seq: item.seq,
            key: item.key(),
            op_id: item.operation.op_id,
            kind,
            message: message.to_owned(),
        });
        Ok(())
    }

    async fn fail_item(
        &self,
        item: &SyncQueueItem,
        error: SyncError,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        if error.is_fatal() {
            return Err(self.pause(Some(item.key()), Some(item.operation.op_id), error));
        }
        self.quarantine(item, error.kind(), error.to_string(), report)
            .await
    }

    async fn quarantine(
        &self,
        item: &SyncQueueItem,
        kind: ErrorKind,
        message: String,
        report: &mut CycleReport,
    ) -> SyncResult<()> {
        self.queue.quarantine(item.seq, &message).await?;
        report.failed += 1;
        self.stats.write().items_failed += 1;
        self.notifier.emit(SyncEvent::ItemFailed {
            seq: item.seq,
            key: item.key(),
            op_id: item.operation.op_id,
            kind,
            message,
        });
        Ok(())
    }

    // Commits a local record and queues its operation for push in one write.
    async fn commit_outbound(
        &self,
        record: EntityRecord,
        applied: &[OpId],
        operation: Operation,
    ) -> SyncResult<()> {
        let priority = self.config.priority_for(&operation.entity_type);
        self.queue
            .commit_outbound(record, applied, operation, priority)
            .await?;
        Ok(())
    }

    fn check_size(&self, operation: &Operation) -> SyncResult<()> {
        let size = operation.encode()?.len();
        let limit = self.config.max_operation_size;
        if size > limit {
            return Err(SyncError::Serialization(ProtocolError::serialization(
                format!("operation of {size} bytes exceeds the {limit} byte limit"),
            )));
        }
        Ok(())
    }

    async fn storage_call<R, E, F>(
        &self,
        key: &EntityKey,
        op_id: Option<OpId>,
        call: F,
    ) -> SyncResult<R>
    where
        E: Into<SyncError>,
        F: Future<Output = Result<R, E>>,
    {
        match call.await.map_err(Into::into) {
            Ok(value) => Ok(value),
            Err(e) if e.is_fatal() => Err(self.pause(Some(key.clone()), op_id, e)),
            Err(e) => Err(e),
        }
    }

    async fn round_trip<R, F>(&self, call: F) -> SyncResult<R>
    where
        F: Future<Output = SyncResult<R>>,
    {
        tokio::time::timeout(self.config.round_trip_timeout, call)
            .await
            .map_err(|_| SyncError::Timeout)?
    }

    fn ensure_runnable(&self) -> SyncResult<()> {
        self.check_cancelled()?;
        match self.state() {
            SyncState::Paused => Err(SyncError::Paused(
                self.paused_reason.read().clone().unwrap_or_default(),
            )),
            SyncState::Stopped => Err(SyncError::Cancelled),
            _ => Ok(()),
        }
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }
        Ok(())
    }

    fn accumulate(&self, report: &CycleReport) {
        let mut stats = self.stats.write();
        stats.operations_pulled += report.pulled as u64;
        stats.operations_pushed += report.pushed as u64;
        stats.operations_applied += report.applied as u64;
        stats.stale_discarded += report.stale as u64;
        stats.conflicts_detected += report.conflicts as u64;
        stats.conflicts_auto_resolved += report.resolved.len() as u64;
        stats.conflicts_parked += report.parked.len() as u64;
    }

    fn abort_cycle(&self, error: SyncError) -> SyncError {
        self.stats.write().last_error = Some(error.to_string());
        if self.state() == SyncState::Paused {
            return error;
        }
        if error.is_fatal() {
            return self.pause(None, None, error);
        }

        let next = match &error {
            SyncError::Cancelled => SyncState::Stopped,
            e if e.is_transport() => {
                warn!(%error, "authority unreachable; offline");
                SyncState::Offline
            }
            _ => {
                error!(%error, "sync cycle failed");
                SyncState::Idle
            }
        };
        self.settle(next);
        error
    }

    fn pause(&self, key: Option<EntityKey>, op_id: Option<OpId>, error: SyncError) -> SyncError {
        if self.state() == SyncState::Paused {
            return error;
        }

        let message = error.to_string();
        error!(entity = ?key, op_id = ?op_id, error = %message, "storage failure; sync paused");
        *self.paused_reason.write() = Some(message.clone());
        self.settle(SyncState::Paused);
        self.notifier.emit(SyncEvent::Paused {
            key,
            op_id,
            kind: error.kind(),
            message,
        });
        error
    }

    fn transition(&self, next: SyncState) -> SyncResult<()> {
        let from = {
            let mut state = self.state.write();
            let from = *state;
            if from == next {
                return Ok(());
            }
            if !from.can_transition_to(next) {
                return Err(SyncError::InvalidStateTransition {
                    from: from.to_string(),
                    to: next.to_string(),
                });
            }
            *state = next;
            from
        };

        debug!(%from, to = %next, "sync state changed");
        self.notifier.emit(SyncEvent::StateChanged { from, to: next });
        Ok(())
    }

    fn settle(&self, next: SyncState) {
        if let Err(error) = self.transition(next) {
            warn!(%error, "state change refused");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetryConfig;
    use crate::notify::MemoryNotifier;
    use crate::storage::MemoryStorage;
    use crate::transport::{LoopbackServer, LoopbackTransport};

    type Coordinator = SyncCoordinator<LoopbackTransport, MemoryStorage>;

    async fn coordinator(
        replica: &str,
        server: &LoopbackServer,
    ) -> (Coordinator, Arc<MemoryNotifier>) {
        let notifier = Arc::new(MemoryNotifier::new());
        let coordinator = SyncCoordinator::builder(
            SyncConfig::new(replica).with_retry(RetryConfig::immediate(3)),
            Arc::new(LoopbackTransport::new(server.clone())),
            Arc::new(MemoryStorage::new()),
        )
        .with_notifier(notifier.clone())
        .with_time_source(Arc::new(ManualClock::new(1_000)))
        .open()
        .await
        .unwrap();
        (coordinator, notifier)
    }

    #[test]
    fn state_transitions() {
        use SyncState::*;
        assert!(Idle.can_transition_to(Pulling));
        assert!(Offline.can_transition_to(Pulling));
        assert!(Pulling.can_transition_to(Pushing));
        assert!(Applying.can_transition_to(Detecting));
        assert!(Pushing.can_transition_to(Offline));
        assert!(Applying.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Idle));
        assert!(!Paused.can_transition_to(Pulling));
        assert!(!Idle.can_transition_to(Applying));
        assert!(!Stopped.can_transition_to(Idle));
        assert!(Pushing.is_active());
        assert!(!Offline.is_active());
    }

    #[tokio::test]
    async fn local_write_is_pushed() {
        let server = LoopbackServer::new();
        let (a, notifier) = coordinator("A", &server).await;

        let op = a
            .record_local(
                EntityKey::new("note", "n1"),
                OperationKind::Create,
                Payload::new(1).with_field("title", "draft"),
            )
            .await
            .unwrap();
        assert_eq!(op.vector.get(&"A".into()), 1);
        assert_eq!(a.queue_counts().pending, 1);

        let report = a.run_cycle().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(server.count_of(&op.op_id), 1);
        assert_eq!(a.state(), SyncState::Idle);
        assert_eq!(a.stats().cycles_completed, 1);

        let states: Vec<_> = notifier
            .events()
            .into_iter()
            .filter_map(|e| match e {
                SyncEvent::StateChanged { to, .. } => Some(to),
                _ => None,
            })
            .collect();
        assert_eq!(
            states,
            vec![SyncState::Pulling, SyncState::Pushing, SyncState::Idle]
        );
    }

    #[tokio::test]
    async fn successive_writes_advance_own_slot() {
        let server = LoopbackServer::new();
        let (a, _) = coordinator("A", &server).await;
        let key = EntityKey::new("note", "n1");
        for title in ["one", "two", "three"] {
            a.record_local(
                key.clone(),
                OperationKind::Update,
                Payload::new(1).with_field("title", title),
            )
            .await
            .unwrap();
        }
        let record = a.storage().get(&key).await.unwrap().unwrap();
        assert_eq!(record.vector.get(&"A".into()), 3);
        assert!(record.logical_time >= 1_002);
    }

    #[tokio::test]
    async fn unreachable_authority_goes_offline() {
        let transport = Arc::new(LoopbackTransport::new(LoopbackServer::new()));
        transport.set_unreachable(true);
        let a = SyncCoordinator::builder(
            SyncConfig::new("A"),
            transport.clone(),
            Arc::new(MemoryStorage::new()),
        )
        .open()
        .await
        .unwrap();

        let err = a.run_cycle().await.unwrap_err();
        assert!(err.is_transport());
        assert_eq!(a.state(), SyncState::Offline);
        assert!(a.stats().last_error.is_some());

        // Local writes keep queueing while offline.
        a.record_local(EntityKey::new("note", "n1"), OperationKind::Create, Payload::new(1))
            .await
            .unwrap();
        assert_eq!(a.queue_counts().pending, 1);

        transport.set_unreachable(false);
        let report = a.run_cycle().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(a.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn shutdown_stops() {
        let server = LoopbackServer::new();
        let (a, _) = coordinator("A", &server).await;
        a.shutdown().await;
        assert_eq!(a.state(), SyncState::Stopped);
        assert!(matches!(a.run_cycle().await, Err(SyncError::Cancelled)));
        assert!(matches!(
            a.record_local(EntityKey::new("note", "n1"), OperationKind::Create, Payload::new(1))
                .await,
            Err(SyncError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn resume_requires_paused() {
        let server = LoopbackServer::new();
        let (a, _) = coordinator("A", &server).await;
        assert!(matches!(
            a.resume().await,
            Err(SyncError::InvalidStateTransition { .. })
        ));
    }
}
