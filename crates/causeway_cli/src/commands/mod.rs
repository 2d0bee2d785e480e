//! CLI command implementations.

pub mod decode_vector;
pub mod dump_queue;
pub mod inspect;

use causeway_sync_engine::journal::read_journal_file;
use causeway_sync_engine::QueueSnapshot;
use std::path::Path;

/// Rebuilds the queue from a journal file without modifying it.
pub(crate) fn load_snapshot(path: &Path) -> Result<QueueSnapshot, Box<dyn std::error::Error>> {
    if !path.exists() {
        return Err(format!("No journal found at {:?}", path).into());
    }
    let entries = read_journal_file(path)?;
    tracing::debug!(entries = entries.len(), "journal replayed");
    Ok(QueueSnapshot::replay(&entries))
}

#[cfg(test)]
pub(crate) mod tests {
    use causeway_sync_engine::journal::{FileJournal, JournalBackend, LogEntry};
    use causeway_sync_engine::{Direction, Priority, QueueStatus, SyncQueueItem};
    use causeway_sync_protocol::{
        EntityKey, Operation, OperationKind, Payload, ReplicaId, VersionVector,
    };
    use std::path::Path;

    fn item(seq: u64, direction: Direction) -> SyncQueueItem {
        let replica = ReplicaId::new("A");
        let mut vector = VersionVector::new();
        vector.increment(&replica);
        let operation = Operation::new(
            EntityKey::new("note", format!("n{seq}")),
            OperationKind::Update,
            Payload::new(1).with_field("title", "hello"),
            vector,
            replica,
            1_000 + seq,
        );
        SyncQueueItem {
            seq,
            operation,
            direction,
            priority: Priority::Normal,
            status: QueueStatus::Pending,
            retry_count: 0,
            last_error: None,
            enqueued_at: 1_000,
            updated_at: 1_000,
            not_before: 0,
            payload_dropped: false,
        }
    }

    /// Three items: seq 0 and 2 pending, seq 1 failed. Cursor at 42.
    pub(crate) fn write_sample_journal(path: &Path) {
        let journal = FileJournal::open(path).unwrap();
        let entries = [
            LogEntry::Enqueued(item(0, Direction::Outbound)),
            LogEntry::Enqueued(item(1, Direction::Outbound)),
            LogEntry::Enqueued(item(2, Direction::Inbound)),
            LogEntry::Transition {
                seq: 1,
                status: QueueStatus::Failed,
                retry_count: 1,
                last_error: Some("refused".into()),
                not_before: 0,
                at: 2_000,
            },
            LogEntry::Cursor(42),
        ];
        for entry in &entries {
            journal.append(&entry.encode().unwrap()).unwrap();
        }
    }
}
