//! Version vectors (per-entity causal clocks).
//!
//! A [`VersionVector`] maps each [`ReplicaId`] to a monotonically
//! non-decreasing counter. Vectors form a join-semilattice under
//! [`VersionVector::merge`], and [`VersionVector::compare`] classifies two
//! vectors as equal, ordered, or concurrent.
//!
//! # Invariants
//!
//! - A replica only ever increments its own slot
//! - Merging takes the elementwise maximum
//! - Counters never decrease
//! - A missing slot means `0`; zero-valued slots are never stored

use crate::error::{ProtocolError, ProtocolResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Leading byte of the compact encoding.
pub const COMPACT_FORMAT_V1: u8 = 0xC1;

/// Longest LEB128 encoding of a `u128`.
const MAX_VARINT_LEN: usize = 19;

/// Identifier of an independent replica of the dataset.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Creates a replica identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ReplicaId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Causal relationship between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CausalOrder {
    /// All counters match.
    Equal,
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    /// Neither dominates: a true conflict.
    Concurrent,
}

impl CausalOrder {
    /// Returns the relation seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            CausalOrder::Before => CausalOrder::After,
            CausalOrder::After => CausalOrder::Before,
            other => other,
        }
    }

    /// Returns true for [`CausalOrder::Concurrent`].
    pub fn is_concurrent(self) -> bool {
        matches!(self, CausalOrder::Concurrent)
    }
}

/// A per-entity causal clock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "BTreeMap<ReplicaId, u64>", into = "BTreeMap<ReplicaId, u64>")]
pub struct VersionVector {
    counters: BTreeMap<ReplicaId, u64>,
}

impl VersionVector {
    /// Creates an empty vector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the counter for `replica` (0 when absent).
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.counters.get(replica).copied().unwrap_or(0)
    }

    /// Number of stored (non-zero) slots.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Returns true if no replica has a non-zero counter.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Iterates over `(replica, counter)` pairs in replica order.
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.counters.iter().map(|(r, c)| (r, *c))
    }

    /// Sum of all counters. Strictly increases along any causal chain.
    pub fn total(&self) -> u128 {
        self.counters.values().map(|c| u128::from(*c)).sum()
    }

    /// Increments the slot owned by `replica` and returns the new value.
    ///
    /// Callers must only pass their own replica id.
    pub fn increment(&mut self, replica: &ReplicaId) -> u64 {
        let slot = self.counters.entry(replica.clone()).or_insert(0);
        *slot = slot.saturating_add(1);
        *slot
    }

    /// Returns a copy of `self` with `replica`'s slot incremented.
    pub fn incremented(&self, replica: &ReplicaId) -> Self {
        let mut next = self.clone();
        next.increment(replica);
        next
    }

    /// Returns the elementwise maximum of `self` and `other`.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        merged.merge_from(other);
        merged
    }

    /// Merges `other` into `self` in place.
    pub fn merge_from(&mut self, other: &Self) {
        for (replica, &theirs) in &other.counters {
            let slot = self.counters.entry(replica.clone()).or_insert(0);
            if theirs > *slot {
                *slot = theirs;
            }
        }
    }

    /// Classifies the causal relation of `self` to `other`.
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let mut behind = false;
        let mut ahead = false;

        for (replica, &mine) in &self.counters {
            let theirs = other.get(replica);
            if mine < theirs {
                behind = true;
            } else if mine > theirs {
                ahead = true;
            }
            if behind && ahead {
                return CausalOrder::Concurrent;
            }
        }

        if other
            .counters
            .keys()
            .any(|replica| !self.counters.contains_key(replica))
        {
            behind = true;
        }

        match (behind, ahead) {
            (false, false) => CausalOrder::Equal,
            (true, false) => CausalOrder::Before,
            (false, true) => CausalOrder::After,
            (true, true) => CausalOrder::Concurrent,
        }
    }

    /// Returns true if `self` is equal to or after `other`.
    pub fn dominates(&self, other: &Self) -> bool {
        matches!(
            self.compare(other),
            CausalOrder::Equal | CausalOrder::After
        )
    }

    /// Returns true if neither vector dominates the other.
    pub fn is_concurrent_with(&self, other: &Self) -> bool {
        self.compare(other).is_concurrent()
    }

    /// Removes entries whose counter is below `min_value`.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&mut self, min_value: u64) -> usize {
        let before = self.counters.len();
        self.counters.retain(|_, counter| *counter >= min_value);
        before - self.counters.len()
    }

    /// Returns the entries where `self` is ahead of `older`.
    pub fn delta_since(&self, older: &Self) -> Self {
        let counters = self
            .counters
            .iter()
            .filter(|(replica, &counter)| counter > older.get(replica))
            .map(|(replica, &counter)| (replica.clone(), counter))
            .collect();
        Self { counters }
    }

    /// Folds a delta produced by [`VersionVector::delta_since`] into `self`.
    pub fn apply_delta(&mut self, delta: &Self) {
        self.merge_from(delta);
    }

    /// Encodes `self` compactly against the empty baseline.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.to_bytes_against(&VersionVector::new())
    }

    /// Encodes only the slots that differ from `baseline`.
    ///
    /// Layout: `0xC1`, varint entry count, then per entry a varint id
    /// length, the UTF-8 id and a zigzag varint counter delta. Entries are
    /// in ascending replica order.
    pub fn to_bytes_against(&self, baseline: &Self) -> Vec<u8> {
        let mut changed: BTreeMap<&ReplicaId, i128> = BTreeMap::new();
        for (replica, &counter) in &self.counters {
            let delta = i128::from(counter) - i128::from(baseline.get(replica));
            if delta != 0 {
                changed.insert(replica, delta);
            }
        }
        for (replica, &base) in &baseline.counters {
            if !self.counters.contains_key(replica) {
                changed.insert(replica, -i128::from(base));
            }
        }

        let mut out = Vec::with_capacity(2 + changed.len() * 8);
        out.push(COMPACT_FORMAT_V1);
        write_varint(&mut out, changed.len() as u128);
        for (replica, delta) in changed {
            let id = replica.as_str().as_bytes();
            write_varint(&mut out, id.len() as u128);
            out.extend_from_slice(id);
            write_varint(&mut out, zigzag(delta));
        }
        out
    }

    /// Decodes bytes produced by [`VersionVector::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> ProtocolResult<Self> {
        Self::from_bytes_against(bytes, &VersionVector::new())
    }

    /// Decodes bytes produced by [`VersionVector::to_bytes_against`] with the
    /// same `baseline`.
    pub fn from_bytes_against(bytes: &[u8], baseline: &Self) -> ProtocolResult<Self> {
        let mut reader = Reader::new(bytes);

        let format = reader.byte()?;
        if format != COMPACT_FORMAT_V1 {
            return Err(ProtocolError::deserialization(format!(
                "unknown vector format 0x{format:02x}"
            )));
        }

        let count = reader.length()?;
        let mut result = baseline.clone();
        let mut previous: Option<String> = None;

        for _ in 0..count {
            let id_len = reader.length()?;
            let id = std::str::from_utf8(reader.take(id_len)?)
                .map_err(|_| ProtocolError::deserialization("replica id is not UTF-8"))?
                .to_owned();

            if previous.as_deref().is_some_and(|p| p >= id.as_str()) {
                return Err(ProtocolError::deserialization(
                    "replica ids out of order or duplicated",
                ));
            }

            let delta = unzigzag(reader.varint()?);
            let replica = ReplicaId::new(id.clone());
            let value = i128::from(baseline.get(&replica)) + delta;
            let value = u64::try_from(value).map_err(|_| {
                ProtocolError::deserialization(format!("counter for {replica} out of range"))
            })?;

            if value == 0 {
                result.counters.remove(&replica);
            } else {
                result.counters.insert(replica, value);
            }
            previous = Some(id);
        }

        if !reader.is_empty() {
            return Err(ProtocolError::deserialization("trailing bytes after vector"));
        }

        Ok(result)
    }
}

impl From<BTreeMap<ReplicaId, u64>> for VersionVector {
    fn from(mut counters: BTreeMap<ReplicaId, u64>) -> Self {
        counters.retain(|_, c| *c > 0);
        Self { counters }
    }
}

impl From<VersionVector> for BTreeMap<ReplicaId, u64> {
    fn from(vector: VersionVector) -> Self {
        vector.counters
    }
}

impl<R: Into<ReplicaId>> FromIterator<(R, u64)> for VersionVector {
    fn from_iter<I: IntoIterator<Item = (R, u64)>>(iter: I) -> Self {
        let counters: BTreeMap<ReplicaId, u64> =
            iter.into_iter().map(|(r, c)| (r.into(), c)).collect();
        counters.into()
    }
}

impl fmt::Display for VersionVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (replica, counter)) in self.counters.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{replica}:{counter}")?;
        }
        f.write_str("}")
    }
}

/// Serde adapter storing a vector as its compact byte form.
///
/// Use with `#[serde(with = "causeway_sync_protocol::version_vector::compact")]`.
pub mod compact {
    use super::VersionVector;
    use serde::de::{self, SeqAccess, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    /// Serializes the vector as a byte string.
    pub fn serialize<S: Serializer>(vector: &VersionVector, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&vector.to_bytes())
    }

    /// Deserializes a vector from a byte string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<VersionVector, D::Error> {
        deserializer.deserialize_bytes(CompactVisitor)
    }

    struct CompactVisitor;

    impl<'de> Visitor<'de> for CompactVisitor {
        type Value = VersionVector;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("compact version vector bytes")
        }

        fn visit_bytes<E: de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
            VersionVector::from_bytes(v).map_err(E::custom)
        }

        fn visit_byte_buf<E: de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
            self.visit_bytes(&v)
        }

        fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
            let mut bytes = Vec::new();
            while let Some(b) = seq.next_element::<u8>()? {
                bytes.push(b);
            }
            self.visit_bytes(&bytes)
        }
    }
}

fn zigzag(value: i128) -> u128 {
    ((value << 1) ^ (value >> 127)) as u128
}

fn unzigzag(value: u128) -> i128 {
    ((value >> 1) as i128) ^ -((value & 1) as i128)
}

fn write_varint(out: &mut Vec<u8>, mut value: u128) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn byte(&mut self) -> ProtocolResult<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| ProtocolError::deserialization("unexpected end of vector bytes"))?;
        self.pos += 1;
        Ok(b)
    }

    fn take(&mut self, len: usize) -> ProtocolResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(ProtocolError::deserialization("unexpected end of vector bytes"));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn varint(&mut self) -> ProtocolResult<u128> {
        let mut value: u128 = 0;
        for i in 0..MAX_VARINT_LEN {
            let byte = self.byte()?;
            value |= u128::from(byte & 0x7f) << (7 * i);
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(ProtocolError::deserialization("varint too long"))
    }

    /// A varint used as a count or length; bounded by the remaining input.
    fn length(&mut self) -> ProtocolResult<usize> {
        let value = self.varint()?;
        usize::try_from(value)
            .ok()
            .filter(|len| *len <= self.remaining())
            .ok_or_else(|| ProtocolError::deserialization("length exceeds input"))
    }
}
