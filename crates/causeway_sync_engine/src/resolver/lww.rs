//! Last-write-wins.

use super::{wins_last_write, ConflictStrategy, MergeBasis, MergedOperation, NeedsManualResolution};
use causeway_sync_protocol::Operation;

/// Keeps the operation with the greater logical time.
///
/// Equal times are broken by the lexically greater origin replica id, so
/// every replica picks the same winner.
#[derive(Debug, Clone, Copy, Default)]
pub struct LastWriteWins;

impl ConflictStrategy for LastWriteWins {
    fn name(&self) -> &'static str {
        "last-write-wins"
    }

    fn resolve(
        &self,
        local: &Operation,
        remote: &Operation,
    ) -> Result<MergedOperation, NeedsManualResolution> {
        let basis = if wins_last_write(remote, local) {
            MergeBasis::TookRemote
        } else {
            MergeBasis::TookLocal
        };
        Ok(MergedOperation::pick(local, remote, basis, self.name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_sync_protocol::{EntityKey, OperationKind, Payload, ReplicaId, VersionVector};

    fn op(origin: &str, time: u64) -> Operation {
        Operation::new(
            EntityKey::new("session", "s1"),
            OperationKind::Update,
            Payload::new(1).with_field("by", origin),
            VersionVector::new(),
            ReplicaId::new(origin),
            time,
        )
    }

    #[test]
    fn later_remote_wins() {
        let local = op("A", 100);
        let remote = op("B", 150);
        let merged = LastWriteWins.resolve(&local, &remote).unwrap();
        assert_eq!(merged.basis, MergeBasis::TookRemote);
        assert_eq!(merged.operation, remote);
        assert!(merged.siblings.is_empty());
    }

    #[test]
    fn later_local_wins() {
        let local = op("A", 200);
        let remote = op("B", 150);
        let merged = LastWriteWins.resolve(&local, &remote).unwrap();
        assert_eq!(merged.basis, MergeBasis::TookLocal);
        assert_eq!(merged.operation, local);
    }

    #[test]
    fn tie_goes_to_greater_replica_on_both_sides() {
        let a = op("A", 100);
        let b = op("B", 100);

        // Seen from A: remote B wins. Seen from B: local B wins.
        let on_a = LastWriteWins.resolve(&a, &b).unwrap();
        let on_b = LastWriteWins.resolve(&b, &a).unwrap();
        assert_eq!(on_a.operation, b);
        assert_eq!(on_b.operation, b);
    }
}
