//! Replicated operations and their typed payloads.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use crate::version_vector::{ReplicaId, VersionVector};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Namespace for operation ids derived from other operation ids.
const DERIVED_OP_NAMESPACE: Uuid = Uuid::from_u128(0x6361_7573_6577_6179_8d3c_52a1_0f7e_b419);

/// Globally unique operation identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpId(Uuid);

impl OpId {
    /// Generates a fresh random id.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Deterministically derives an id from source ids and a tag.
    ///
    /// Order matters: `derive(&[a, b], t) != derive(&[b, a], t)`.
    pub fn derive(sources: &[OpId], tag: &str) -> Self {
        let mut name = Vec::with_capacity(16 * sources.len() + tag.len());
        for source in sources {
            name.extend_from_slice(source.0.as_bytes());
        }
        name.extend_from_slice(tag.as_bytes());
        Self(Uuid::new_v5(&DERIVED_OP_NAMESPACE, &name))
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Entity type name (`"note"`, `"session"`, ...).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityType(String);

impl EntityType {
    /// Creates an entity type.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the type name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identifier of an entity within its type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    /// Creates an entity id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the id.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Fully qualified entity address.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
}

impl EntityKey {
    /// Creates a key.
    pub fn new(entity_type: impl Into<EntityType>, entity_id: impl Into<EntityId>) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
        }
    }
}

impl From<String> for EntityType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.entity_type, self.entity_id)
    }
}

/// Kind of mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationKind {
    /// Entity created.
    Create,
    /// Entity updated.
    Update,
    /// Entity deleted.
    Delete,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// A single field value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldValue {
    /// Absent value.
    Null,
    /// Boolean.
    Bool(bool),
    /// Signed integer.
    Integer(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
    /// Ordered list.
    List(Vec<FieldValue>),
    /// Nested map.
    Map(BTreeMap<String, FieldValue>),
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_owned())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Integer(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// Typed entity record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Payload {
    /// Schema version of the entity type.
    pub schema_version: u16,
    /// Field values by name.
    pub fields: BTreeMap<String, FieldValue>,
}

impl Payload {
    /// Creates an empty payload for `schema_version`.
    pub fn new(schema_version: u16) -> Self {
        Self {
            schema_version,
            fields: BTreeMap::new(),
        }
    }

    /// Adds a field (builder style).
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<FieldValue>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Sets a field.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(name.into(), value.into());
    }

    /// Returns a field value.
    pub fn get(&self, name: &str) -> Option<&FieldValue> {
        self.fields.get(name)
    }

    /// Returns true if no fields are set.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

/// An immutable replicated mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id used for idempotent application.
    pub op_id: OpId,
    /// Entity type.
    pub entity_type: EntityType,
    /// Entity id.
    pub entity_id: EntityId,
    /// Mutation kind.
    pub kind: OperationKind,
    /// Payload; empty for deletes.
    pub payload: Payload,
    /// Vector stamped at creation.
    #[serde(with = "crate::version_vector::compact")]
    pub vector: VersionVector,
    /// Replica that produced the operation.
    pub origin: ReplicaId,
    /// Hybrid logical timestamp in milliseconds.
    pub logical_time: u64,
}

impl Operation {
    /// Creates an operation with a fresh id.
    ///
    /// Delete operations always carry an empty payload.
    pub fn new(
        key: EntityKey,
        kind: OperationKind,
        payload: Payload,
        vector: VersionVector,
        origin: ReplicaId,
        logical_time: u64,
    ) -> Self {
        let payload = match kind {
            OperationKind::Delete => Payload::new(payload.schema_version),
            _ => payload,
        };
        Self {
            op_id: OpId::generate(),
            entity_type: key.entity_type,
            entity_id: key.entity_id,
            kind,
            payload,
            vector,
            origin,
            logical_time,
        }
    }

    /// Returns the entity key.
    pub fn key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type.clone(),
            entity_id: self.entity_id.clone(),
        }
    }

    /// Returns true for deletes.
    pub fn is_delete(&self) -> bool {
        self.kind == OperationKind::Delete
    }

    /// Last-writer ordering: logical time, then origin replica id.
    pub fn write_order(&self) -> (u64, &ReplicaId) {
        (self.logical_time, &self.origin)
    }

    /// Encodes the operation to CBOR.
    pub fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes an operation from CBOR.
    pub fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Operation {
        let vector: VersionVector = [("A", 2u64), ("B", 1)].into_iter().collect();
        Operation::new(
            EntityKey::new("note", "n1"),
            OperationKind::Update,
            Payload::new(1)
                .with_field("title", "hello")
                .with_field("pinned", true)
                .with_field("rank", 3i64),
            vector,
            ReplicaId::new("A"),
            1_700_000_000_000,
        )
    }

    #[test]
    fn encode_decode() {
        let op = sample();
        let bytes = op.encode().unwrap();
        assert_eq!(Operation::decode(&bytes).unwrap(), op);
    }

    #[test]
    fn decode_rejects_truncated() {
        let bytes = sample().encode().unwrap();
        assert!(Operation::decode(&bytes[..bytes.len() / 2]).is_err());
    }

    #[test]
    fn delete_drops_payload_fields() {
        let op = Operation::new(
            EntityKey::new("note", "n1"),
            OperationKind::Delete,
            Payload::new(2).with_field("title", "gone"),
            VersionVector::new(),
            ReplicaId::new("A"),
            1,
        );
        assert!(op.payload.is_empty());
        assert_eq!(op.payload.schema_version, 2);
        assert!(op.is_delete());
    }

    #[test]
    fn derived_ids_are_stable_ordered_and_tagged() {
        let a = OpId::generate();
        let b = OpId::generate();
        assert_eq!(OpId::derive(&[a, b], "merge"), OpId::derive(&[a, b], "merge"));
        assert_ne!(OpId::derive(&[a, b], "merge"), OpId::derive(&[b, a], "merge"));
        assert_ne!(OpId::derive(&[a, b], "merge"), OpId::derive(&[a, b], "append"));
        assert_ne!(OpId::derive(&[a], "append"), a);
    }

    #[test]
    fn key_display() {
        assert_eq!(EntityKey::new("note", "n1").to_string(), "note/n1");
    }

    #[test]
    fn write_order_breaks_ties_by_origin() {
        let mut a = sample();
        let mut b = sample();
        a.origin = ReplicaId::new("A");
        b.origin = ReplicaId::new("B");
        assert!(b.write_order() > a.write_order());
        a.logical_time += 1;
        assert!(a.write_order() > b.write_order());
    }
}
