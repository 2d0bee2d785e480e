//! Conflict detection and conflict records.

use crate::operation::{EntityId, EntityKey, EntityType, OpId, Operation, Payload};
use crate::version_vector::{CausalOrder, VersionVector};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Identifier of a conflict record.
///
/// Derived from the two operations involved, so re-detecting the same
/// conflict yields the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConflictId(Uuid);

impl ConflictId {
    /// Derives the id for a local/remote operation pair.
    pub fn for_pair(local: OpId, remote: OpId) -> Self {
        Self(*OpId::derive(&[local, remote], "conflict").as_uuid())
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for ConflictId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for ConflictId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// How a conflict ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictOutcome {
    /// A strategy produced this payload.
    AutoResolved(Payload),
    /// Waiting for an operator decision.
    Parked,
}

/// A detected concurrent modification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRecord {
    /// Conflict id.
    pub conflict_id: ConflictId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Local snapshot at detection time.
    pub local_op: Operation,
    /// Incoming remote operation.
    pub remote_op: Operation,
    /// Detection time in milliseconds since the epoch.
    pub detected_at: u64,
    /// Resolution outcome, once known.
    pub outcome: Option<ConflictOutcome>,
}

impl ConflictRecord {
    /// Creates an unresolved record.
    pub fn new(local_op: Operation, remote_op: Operation, detected_at: u64) -> Self {
        Self {
            conflict_id: ConflictId::for_pair(local_op.op_id, remote_op.op_id),
            entity_type: remote_op.entity_type.clone(),
            entity_id: remote_op.entity_id.clone(),
            local_op,
            remote_op,
            detected_at,
            outcome: None,
        }
    }

    /// Returns the entity key.
    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
        }
    }

    /// Returns true if the conflict is waiting on an operator.
    pub fn is_parked(&self) -> bool {
        matches!(self.outcome, Some(ConflictOutcome::Parked))
    }

    /// Sets the outcome (builder style).
    pub fn with_outcome(mut self, outcome: ConflictOutcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

/// Result of classifying an incoming operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Detection {
    /// The remote operation causally follows local state.
    Apply {
        /// The remote operation.
        operation: Operation,
        /// Local and remote vectors merged.
        merged_vector: VersionVector,
    },
    /// Local state already includes the remote operation.
    Stale,
    /// Neither side dominates.
    Conflict(ConflictRecord),
}

/// Classifies incoming operations against local state. Pure.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConflictDetector;

impl ConflictDetector {
    /// Creates a detector.
    pub fn new() -> Self {
        Self
    }

    /// Classifies `remote` against the locally authoritative vector.
    ///
    /// `local_snapshot` is only called for conflicts.
    pub fn detect<F>(
        &self,
        remote: Operation,
        local_vector: &VersionVector,
        local_snapshot: F,
        detected_at: u64,
    ) -> Detection
    where
        F: FnOnce() -> Operation,
    {
        match local_vector.compare(&remote.vector) {
            CausalOrder::Before | CausalOrder::Equal => {
                let merged_vector = local_vector.merge(&remote.vector);
                Detection::Apply {
                    operation: remote,
                    merged_vector,
                }
            }
            CausalOrder::After => Detection::Stale,
            CausalOrder::Concurrent => {
                Detection::Conflict(ConflictRecord::new(local_snapshot(), remote, detected_at))
            }
        }
    }
}
