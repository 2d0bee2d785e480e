//! Fire-and-forget notifications for operators and the UI.

use crate::coordinator::{CycleReport, SyncState};
use crate::error::ErrorKind;
use crate::resolver::MergeBasis;
use causeway_sync_protocol::{ConflictId, EntityKey, OpId};
use parking_lot::Mutex;
use tokio::sync::broadcast;

/// Something an operator or UI may want to know about.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// The coordinator changed state.
    StateChanged {
        /// Previous state.
        from: SyncState,
        /// New state.
        to: SyncState,
    },
    /// A conflict needs an operator.
    ConflictParked {
        /// Conflict id, for [`resolve_parked`](crate::SyncCoordinator::resolve_parked).
        conflict_id: ConflictId,
        /// Entity.
        key: EntityKey,
        /// Local side.
        local_op: OpId,
        /// Remote side.
        remote_op: OpId,
    },
    /// A conflict was resolved, automatically or by an operator.
    ConflictResolved {
        /// Entity.
        key: EntityKey,
        /// Strategy name, or `"operator"`.
        strategy: &'static str,
        /// Relation of the result to its inputs.
        basis: MergeBasis,
    },
    /// A queue item was marked `Failed`.
    ItemFailed {
        /// Queue item.
        seq: u64,
        /// Entity.
        key: EntityKey,
        /// Operation.
        op_id: OpId,
        /// Error class.
        kind: ErrorKind,
        /// Error text.
        message: String,
    },
    /// The pipeline paused on a fatal storage error.
    Paused {
        /// Entity being processed, if any.
        key: Option<EntityKey>,
        /// Operation being processed, if any.
        op_id: Option<OpId>,
        /// Error class.
        kind: ErrorKind,
        /// Error text.
        message: String,
    },
    /// A cycle finished.
    CycleCompleted(CycleReport),
}

/// Receives [`SyncEvent`]s. Must not block.
pub trait Notifier: Send + Sync {
    /// Emits an event.
    fn emit(&self, event: SyncEvent);
}

/// Discards events.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn emit(&self, _event: SyncEvent) {}
}

/// Fans events out over a tokio broadcast channel.
///
/// Slow subscribers lose the oldest events.
#[derive(Debug, Clone)]
pub struct BroadcastNotifier {
    sender: broadcast::Sender<SyncEvent>,
}

impl BroadcastNotifier {
    /// Creates a notifier buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Subscribes to future events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastNotifier {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Notifier for BroadcastNotifier {
    fn emit(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}

/// Records events in memory.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    events: Mutex<Vec<SyncEvent>>,
}

impl MemoryNotifier {
    /// Creates an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy of every event so far.
    pub fn events(&self) -> Vec<SyncEvent> {
        self.events.lock().clone()
    }

    /// Drops recorded events.
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl Notifier for MemoryNotifier {
    fn emit(&self, event: SyncEvent) {
        self.events.lock().push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_change() -> SyncEvent {
        SyncEvent::StateChanged {
            from: SyncState::Idle,
            to: SyncState::Pulling,
        }
    }

    #[test]
    fn memory_notifier_records() {
        let notifier = MemoryNotifier::new();
        notifier.emit(state_change());
        notifier.emit(state_change());
        assert_eq!(notifier.events().len(), 2);
        notifier.clear();
        assert!(notifier.events().is_empty());
    }

    #[tokio::test]
    async fn broadcast_reaches_subscribers() {
        let notifier = BroadcastNotifier::new(8);
        let mut rx = notifier.subscribe();
        notifier.emit(state_change());
        match rx.recv().await.unwrap() {
            SyncEvent::StateChanged { to, .. } => assert_eq!(to, SyncState::Pulling),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn broadcast_without_subscribers_is_silent() {
        BroadcastNotifier::default().emit(state_change());
        NoopNotifier.emit(state_change());
    }
}
