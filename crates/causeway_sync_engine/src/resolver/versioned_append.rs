//! Versioned append for log-like entities.

use super::{wins_last_write, ConflictStrategy, MergeBasis, MergedOperation, NeedsManualResolution};
use causeway_sync_protocol::{EntityId, OpId, Operation, OperationKind, VersionVector};

/// Keeps both conflicting versions as separate entities.
///
/// Each side is preserved under the synthetic id
/// `"{entity_id}@{origin}:{logical_time}"`; the original entity converges
/// to the last-write-wins winner. Preserved copies carry an empty vector
/// and are stamped by the coordinator when committed.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionedAppend;

impl VersionedAppend {
    /// Synthetic id under which `op` is preserved.
    pub fn preserved_id(op: &Operation) -> EntityId {
        EntityId::new(format!(
            "{}@{}:{}",
            op.entity_id, op.origin, op.logical_time
        ))
    }

    fn preserve(op: &Operation) -> Operation {
        Operation {
            // Derived from the source alone so every replica preserving
            // the same version produces the same operation.
            op_id: OpId::derive(&[op.op_id], "versioned-append"),
            entity_type: op.entity_type.clone(),
            entity_id: Self::preserved_id(op),
            kind: OperationKind::Create,
            payload: op.payload.clone(),
            vector: VersionVector::new(),
            origin: op.origin.clone(),
            logical_time: op.logical_time,
        }
    }
}

impl ConflictStrategy for VersionedAppend {
    fn name(&self) -> &'static str {
        "versioned-append"
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

        let mut siblings: Vec<Operation> = [local, remote]
            .into_iter()
            .filter(|op| !op.is_delete())
            .map(Self::preserve)
            .collect();
        siblings.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

        let mut merged = MergedOperation::pick(local, remote, basis, self.name());
        merged.siblings = siblings;
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_sync_protocol::{EntityKey, Payload, ReplicaId};

    fn op(origin: &str, kind: OperationKind, time: u64) -> Operation {
        Operation::new(
            EntityKey::new("log", "l1"),
            kind,
            Payload::new(1).with_field("line", origin),
            VersionVector::new(),
            ReplicaId::new(origin),
            time,
        )
    }

    #[test]
    fn keeps_both_versions() {
        let local = op("A", OperationKind::Update, 10);
        let remote = op("B", OperationKind::Update, 20);

        let merged = VersionedAppend.resolve(&local, &remote).unwrap();
        assert_eq!(merged.basis, MergeBasis::TookRemote);
        assert_eq!(merged.operation, remote);

        let ids: Vec<_> = merged
            .siblings
            .iter()
            .map(|s| s.entity_id.as_str().to_owned())
            .collect();
        assert_eq!(ids, vec!["l1@A:10", "l1@B:20"]);
        assert!(merged
            .siblings
            .iter()
            .all(|s| s.kind == OperationKind::Create));
        assert_eq!(merged.siblings[0].payload, local.payload);
    }

    #[test]
    fn both_replicas_preserve_identically() {
        let a = op("A", OperationKind::Update, 10);
        let b = op("B", OperationKind::Update, 20);

        let on_a = VersionedAppend.resolve(&a, &b).unwrap();
        let on_b = VersionedAppend.resolve(&b, &a).unwrap();
        assert_eq!(on_a.siblings, on_b.siblings);
        assert_eq!(on_a.operation, on_b.operation);
    }

    #[test]
    fn deletes_are_not_preserved() {
        let local = op("A", OperationKind::Delete, 10);
        let remote = op("B", OperationKind::Update, 5);
        let merged = VersionedAppend.resolve(&local, &remote).unwrap();
        assert_eq!(merged.siblings.len(), 1);
        assert_eq!(merged.siblings[0].entity_id.as_str(), "l1@B:5");
        assert_eq!(merged.basis, MergeBasis::TookLocal);
    }
}
