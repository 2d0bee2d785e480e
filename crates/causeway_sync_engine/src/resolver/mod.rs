//! Conflict resolution.
//!
//! A [`StrategyRegistry`] maps entity types to [`ConflictStrategy`]
//! implementations and is handed to the [`Resolver`] explicitly. Every
//! strategy is deterministic: the same `(local, remote)` pair always yields
//! the same [`MergedOperation`], including derived operation ids.

mod field_merge;
mod lww;
mod manual;
mod versioned_append;

pub use field_merge::{FieldMerge, OverlapPolicy};
pub use lww::LastWriteWins;
pub use manual::ManualIntervention;
pub use versioned_append::VersionedAppend;

use causeway_sync_protocol::{ConflictRecord, EntityType, Operation};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// How a merged operation relates to its inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MergeBasis {
    /// The local state wins unchanged.
    TookLocal,
    /// The remote operation wins unchanged.
    TookRemote,
    /// A new payload combining both sides.
    Combined,
}

impl fmt::Display for MergeBasis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MergeBasis::TookLocal => "took-local",
            MergeBasis::TookRemote => "took-remote",
            MergeBasis::Combined => "combined",
        };
        f.write_str(name)
    }
}

/// Outcome of an automatic resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedOperation {
    /// Resulting state of the conflicted entity.
    ///
    /// For picks this is the chosen input as-is. For combined results it is
    /// a new operation whose id is derived from both inputs, stamped with
    /// the merged vector.
    pub operation: Operation,
    /// Extra operations on other entities, such as preserved versions.
    pub siblings: Vec<Operation>,
    /// Relation to the inputs.
    pub basis: MergeBasis,
    /// Name of the strategy that produced it.
    pub strategy: &'static str,
}

impl MergedOperation {
    /// Picks one side unchanged.
    pub fn pick(
        local: &Operation,
        remote: &Operation,
        basis: MergeBasis,
        strategy: &'static str,
    ) -> Self {
        let operation = match basis {
            MergeBasis::TookLocal => local.clone(),
            _ => remote.clone(),
        };
        Self {
            operation,
            siblings: Vec::new(),
            basis,
            strategy,
        }
    }
}

/// The strategy refuses to resolve automatically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("manual resolution required ({strategy}): {reason}")]
pub struct NeedsManualResolution {
    /// Strategy that refused.
    pub strategy: &'static str,
    /// Why.
    pub reason: String,
}

/// A merge policy for one entity type.
pub trait ConflictStrategy: Send + Sync {
    /// Stable strategy name for logs and events.
    fn name(&self) -> &'static str;

    /// Resolves a pair of concurrent operations on the same entity.
    ///
    /// `local` describes the current local state, `remote` the incoming
    /// operation. Must be deterministic.
    fn resolve(
        &self,
        local: &Operation,
        remote: &Operation,
    ) -> Result<MergedOperation, NeedsManualResolution>;
}

/// Per-entity-type strategies with a default.
#[derive(Clone)]
pub struct StrategyRegistry {
    strategies: HashMap<EntityType, Arc<dyn ConflictStrategy>>,
    default: Arc<dyn ConflictStrategy>,
}

impl StrategyRegistry {
    /// Creates a registry that falls back to `default`.
    pub fn new(default: impl ConflictStrategy + 'static) -> Self {
        Self {
            strategies: HashMap::new(),
            default: Arc::new(default),
        }
    }

    /// Registers a strategy for an entity type (builder style).
    pub fn with_strategy(
        mut self,
        entity_type: impl Into<EntityType>,
        strategy: impl ConflictStrategy + 'static,
    ) -> Self {
        self.register(entity_type, strategy);
        self
    }

    /// Registers a strategy for an entity type, replacing any previous one.
    pub fn register(
        &mut self,
        entity_type: impl Into<EntityType>,
        strategy: impl ConflictStrategy + 'static,
    ) {
        self.strategies
            .insert(entity_type.into(), Arc::new(strategy));
    }

    /// Returns the strategy for an entity type.
    pub fn strategy_for(&self, entity_type: &EntityType) -> &dyn ConflictStrategy {
        self.strategies
            .get(entity_type)
            .unwrap_or(&self.default)
            .as_ref()
    }
}

impl Default for StrategyRegistry {
    fn default() -> Self {
        Self::new(LastWriteWins)
    }
}

impl fmt::Debug for StrategyRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types: Vec<_> = self
            .strategies
            .iter()
            .map(|(t, s)| (t.as_str(), s.name()))
            .collect();
        types.sort();
        f.debug_struct("StrategyRegistry")
            .field("strategies", &types)
            .field("default", &self.default.name())
            .finish()
    }
}

/// Routes conflicts to the registered strategy.
#[derive(Debug, Clone, Default)]
pub struct Resolver {
    registry: StrategyRegistry,
}

impl Resolver {
    /// Creates a resolver over `registry`.
    pub fn new(registry: StrategyRegistry) -> Self {
        Self { registry }
    }

    /// Returns the registry.
    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Resolves a detected conflict.
    pub fn resolve(
        &self,
        record: &ConflictRecord,
    ) -> Result<MergedOperation, NeedsManualResolution> {
        self.resolve_ops(&record.local_op, &record.remote_op)
    }

    /// Resolves a pair of operations on the same entity.
    pub fn resolve_ops(
        &self,
        local: &Operation,
        remote: &Operation,
    ) -> Result<MergedOperation, NeedsManualResolution> {
        let strategy = self.registry.strategy_for(&remote.entity_type);
        let merged = strategy.resolve(local, remote);
        match &merged {
            Ok(m) => tracing::debug!(
                entity = %remote.key(),
                strategy = strategy.name(),
                basis = %m.basis,
                "conflict resolved"
            ),
            Err(e) => tracing::debug!(entity = %remote.key(), reason = %e, "conflict needs an operator"),
        }
        merged
    }
}

/// True if `a` wins a last-writer comparison against `b`.
///
/// Greater logical time wins; ties go to the lexically greater origin.
pub(crate) fn wins_last_write(a: &Operation, b: &Operation) -> bool {
    a.write_order() > b.write_order()
}

#[cfg(test)]
mod tests {
    use super::*;
    use causeway_sync_protocol::{
        ConflictDetector, Detection, EntityKey, OperationKind, Payload, ReplicaId, VersionVector,
    };

    fn op(origin: &str, entity_type: &str, vector: VersionVector, time: u64) -> Operation {
        Operation::new(
            EntityKey::new(entity_type, "e1"),
            OperationKind::Update,
            Payload::new(1).with_field("by", origin),
            vector,
            ReplicaId::new(origin),
            time,
        )
    }

    fn vv(entries: &[(&str, u64)]) -> VersionVector {
        entries.iter().map(|(r, c)| (*r, *c)).collect()
    }

    #[test]
    fn registry_routes_by_entity_type() {
        let registry = StrategyRegistry::default()
            .with_strategy("grade", ManualIntervention)
            .with_strategy("note", FieldMerge::default());

        assert_eq!(
            registry.strategy_for(&EntityType::new("grade")).name(),
            "manual"
        );
        assert_eq!(
            registry.strategy_for(&EntityType::new("note")).name(),
            "field-merge"
        );
        assert_eq!(
            registry.strategy_for(&EntityType::new("other")).name(),
            "last-write-wins"
        );
    }

    #[test]
    fn detected_conflict_resolves_to_later_remote() {
        // {A:2, B:0} vs {A:0, B:1}, local t=100, remote t=150.
        let local = op("A", "session", vv(&[("A", 2)]), 100);
        let remote = op("B", "session", vv(&[("B", 1)]), 150);

        let detection =
            ConflictDetector::new().detect(remote.clone(), &local.vector, || local.clone(), 0);
        let Detection::Conflict(record) = detection else {
            panic!("expected conflict");
        };

        let merged = Resolver::default().resolve(&record).unwrap();
        assert_eq!(merged.basis, MergeBasis::TookRemote);
        assert_eq!(merged.operation, remote);
    }

    #[test]
    fn manual_type_is_not_auto_resolved() {
        let resolver =
            Resolver::new(StrategyRegistry::default().with_strategy("grade", ManualIntervention));
        let local = op("A", "grade", vv(&[("A", 1)]), 1);
        let remote = op("B", "grade", vv(&[("B", 1)]), 2);
        let err = resolver.resolve_ops(&local, &remote).unwrap_err();
        assert_eq!(err.strategy, "manual");
    }

    #[test]
    fn resolution_is_repeatable() {
        let resolver = Resolver::new(
            StrategyRegistry::default()
                .with_strategy("note", FieldMerge::default())
                .with_strategy("log", VersionedAppend),
        );
        for entity_type in ["note", "log", "session"] {
            let local = op("A", entity_type, vv(&[("A", 3)]), 10);
            let remote = op("B", entity_type, vv(&[("B", 2)]), 10);
            let first = resolver.resolve_ops(&local, &remote);
            for _ in 0..5 {
                assert_eq!(resolver.resolve_ops(&local, &remote), first);
            }
        }
    }

    #[test]
    fn registry_debug_lists_names() {
        let registry = StrategyRegistry::default().with_strategy("log", VersionedAppend);
        let debug = format!("{registry:?}");
        assert!(debug.contains("versioned-append"));
        assert!(debug.contains("last-write-wins"));
    }

    proptest::proptest! {
        #[test]
        fn last_write_wins_converges_from_either_side(
            time_a in 0u64..50,
            time_b in 0u64..50,
            origin_a in "[a-d]",
            origin_b in "[a-d]",
        ) {
            // Replica ids are unique.
            proptest::prop_assume!(origin_a != origin_b);
            let a = op(&origin_a, "session", vv(&[(origin_a.as_str(), 1)]), time_a);
            let b = op(&origin_b, "session", vv(&[(origin_b.as_str(), 2)]), time_b);
            let resolver = Resolver::default();

            let on_a = resolver.resolve_ops(&a, &b).unwrap();
            let on_b = resolver.resolve_ops(&b, &a).unwrap();
            proptest::prop_assert_eq!(on_a.operation, on_b.operation);
        }

        #[test]
        fn latest_write_field_merge_converges(
            time_a in 0u64..50,
            time_b in 0u64..50,
            title_a in "[a-z]{1,4}",
            title_b in "[a-z]{1,4}",
        ) {
            let merge = FieldMerge::new(OverlapPolicy::LatestWrite);
            let mut a = op("A", "note", vv(&[("A", 1)]), time_a);
            a.payload.set("title", title_a);
            a.payload.set("body", "from a");
            let mut b = op("B", "note", vv(&[("B", 1)]), time_b);
            b.payload.set("title", title_b);

            let on_a = merge.resolve(&a, &b).unwrap();
            let on_b = merge.resolve(&b, &a).unwrap();
            proptest::prop_assert_eq!(on_a.operation.payload, on_b.operation.payload);
        }
    }
}
