//! Field-level merge.

use super::{wins_last_write, ConflictStrategy, MergeBasis, MergedOperation, NeedsManualResolution};
use causeway_sync_protocol::{OpId, Operation, OperationKind, Payload};

/// Which side wins a field changed by both operations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverlapPolicy {
    /// The incoming operation's value wins.
    #[default]
    RemoteWins,
    /// The local value wins.
    LocalWins,
    /// The value from the later write wins (same order as last-write-wins).
    LatestWrite,
}

/// Merges two payloads field by field.
///
/// Fields present on only one side are kept. A delete racing an update
/// keeps the update.
#[derive(Debug, Clone, Copy, Default)]
pub struct FieldMerge {
    overlap: OverlapPolicy,
}

impl FieldMerge {
    /// Creates a field merge with the given overlap policy.
    pub fn new(overlap: OverlapPolicy) -> Self {
        Self { overlap }
    }

    /// Returns the overlap policy.
    pub fn overlap(&self) -> OverlapPolicy {
        self.overlap
    }

    fn remote_takes_overlap(&self, local: &Operation, remote: &Operation) -> bool {
        match self.overlap {
            OverlapPolicy::RemoteWins => true,
            OverlapPolicy::LocalWins => false,
            OverlapPolicy::LatestWrite => wins_last_write(remote, local),
        }
    }
}

impl ConflictStrategy for FieldMerge {
    fn name(&self) -> &'static str {
        "field-merge"
    }

    fn resolve(
        &self,
        local: &Operation,
        remote: &Operation,
    ) -> Result<MergedOperation, NeedsManualResolution> {
        match (local.is_delete(), remote.is_delete()) {
            (true, _) => {
                return Ok(MergedOperation::pick(
                    local,
                    remote,
                    MergeBasis::TookRemote,
                    self.name(),
                ))
            }
            (false, true) => {
                return Ok(MergedOperation::pick(
                    local,
                    remote,
                    MergeBasis::TookLocal,
                    self.name(),
                ))
            }
            (false, false) => {}
        }

        let (base, top) = if self.remote_takes_overlap(local, remote) {
            (local, remote)
        } else {
            (remote, local)
        };
        let mut fields = base.payload.fields.clone();
        fields.extend(
            top.payload
                .fields
                .iter()
                .map(|(name, value)| (name.clone(), value.clone())),
        );
        let payload = Payload {
            schema_version: local.payload.schema_version.max(remote.payload.schema_version),
            fields,
        };

        if payload == remote.payload {
            return Ok(MergedOperation::pick(
                local,
                remote,
                MergeBasis::TookRemote,
                self.name(),
            ));
        }
        if payload == local.payload {
            return Ok(MergedOperation::pick(
                local,
                remote,
                MergeBasis::TookLocal,
                self.name(),
            ));
        }

        let operation = Operation {
            op_id: OpId::derive(&[local.op_id, remote.op_id], self.name()),
            entity_type: remote.entity_type.clone(),
            entity_id: remote.entity_id.clone(),
            kind: OperationKind::Update,
            payload,
            vector: local.vector.merge(&remote.vector),
            origin: local.origin.clone(),
            logical_time: local.logical_time.max(remote.logical_time),
        };
        Ok(MergedOperation {
            operation,
            siblings: Vec::new(),
            basis: MergeBasis::Combined,
            strategy: self.name(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_sync_protocol::{EntityKey, FieldValue, ReplicaId, VersionVector};

    fn op(origin: &str, kind: OperationKind, payload: Payload, time: u64) -> Operation {
        let vector: VersionVector = [(origin, 1u64)].into_iter().collect();
        Operation::new(
            EntityKey::new("note", "n1"),
            kind,
            payload,
            vector,
            ReplicaId::new(origin),
            time,
        )
    }

    fn text(v: &str) -> FieldValue {
        FieldValue::Text(v.into())
    }

    #[test]
    fn disjoint_fields_are_unioned_remote_wins_overlap() {
        let local = op(
            "A",
            OperationKind::Update,
            Payload::new(1).with_field("title", "A").with_field("body", "x"),
            10,
        );
        let remote = op(
            "B",
            OperationKind::Update,
            Payload::new(1).with_field("title", "B").with_field("note", "y"),
            5,
        );

        let merged = FieldMerge::default().resolve(&local, &remote).unwrap();
        assert_eq!(merged.basis, MergeBasis::Combined);
        let fields = &merged.operation.payload.fields;
        assert_eq!(fields.len(), 3);
        assert_eq!(fields["title"], text("B"));
        assert_eq!(fields["body"], text("x"));
        assert_eq!(fields["note"], text("y"));
        assert_eq!(
            merged.operation.vector,
            [("A", 1u64), ("B", 1)].into_iter().collect::<VersionVector>()
        );
        assert_eq!(
            merged.operation.op_id,
            OpId::derive(&[local.op_id, remote.op_id], "field-merge")
        );
    }

    #[test]
    fn local_wins_policy() {
        let local = op(
            "A",
            OperationKind::Update,
            Payload::new(1).with_field("title", "A"),
            1,
        );
        let remote = op(
            "B",
            OperationKind::Update,
            Payload::new(1).with_field("title", "B").with_field("note", "y"),
            2,
        );
        let merged = FieldMerge::new(OverlapPolicy::LocalWins)
            .resolve(&local, &remote)
            .unwrap();
        assert_eq!(merged.basis, MergeBasis::Combined);
        assert_eq!(merged.operation.payload.fields["title"], text("A"));
        assert_eq!(merged.operation.payload.fields["note"], text("y"));
    }

    #[test]
    fn latest_write_policy_is_symmetric() {
        let a = op(
            "A",
            OperationKind::Update,
            Payload::new(1).with_field("title", "A").with_field("body", "x"),
            10,
        );
        let b = op(
            "B",
            OperationKind::Update,
            Payload::new(1).with_field("title", "B").with_field("note", "y"),
            20,
        );
        let strategy = FieldMerge::new(OverlapPolicy::LatestWrite);
        let on_a = strategy.resolve(&a, &b).unwrap();
        let on_b = strategy.resolve(&b, &a).unwrap();
        assert_eq!(on_a.operation.payload, on_b.operation.payload);
        assert_eq!(on_a.operation.payload.fields["title"], text("B"));
    }

    #[test]
    fn superset_remote_is_a_pick() {
        let local = op(
            "A",
            OperationKind::Update,
            Payload::new(1).with_field("title", "A"),
            1,
        );
        let remote = op(
            "B",
            OperationKind::Update,
            Payload::new(1).with_field("title", "B").with_field("body", "z"),
            2,
        );
        let merged = FieldMerge::default().resolve(&local, &remote).unwrap();
        assert_eq!(merged.basis, MergeBasis::TookRemote);
        assert_eq!(merged.operation, remote);
    }

    #[test]
    fn delete_loses_to_update() {
        let update = op(
            "A",
            OperationKind::Update,
            Payload::new(1).with_field("title", "kept"),
            1,
        );
        let delete = op("B", OperationKind::Delete, Payload::new(1), 99);

        let merged = FieldMerge::default().resolve(&update, &delete).unwrap();
        assert_eq!(merged.basis, MergeBasis::TookLocal);
        assert_eq!(merged.operation, update);

        let merged = FieldMerge::default().resolve(&delete, &update).unwrap();
        assert_eq!(merged.basis, MergeBasis::TookRemote);
        assert_eq!(merged.operation, update);
    }
}
