//! # Causeway Sync Protocol
//!
//! Causal metadata, operations and wire messages for Causeway.
//!
//! This crate provides:
//! - `VersionVector` per-entity causal clocks with a compact byte form
//! - `Operation` replication records with typed payloads
//! - `ConflictDetector` and `ConflictRecord`
//! - Push/pull protocol messages
//! - CBOR encoding/decoding
//!
//! This is a pure protocol crate with no I/O operations.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod codec;
pub mod conflict;
pub mod error;
pub mod messages;
pub mod operation;
pub mod version_vector;

pub use conflict::{ConflictDetector, ConflictId, ConflictOutcome, ConflictRecord, Detection};
pub use error::{ProtocolError, ProtocolResult};
pub use messages::{
    AckStatus, PullRequest, PullResponse, PushAck, PushRequest, PushResponse, WireMessage,
};
pub use operation::{
    EntityId, EntityKey, EntityType, FieldValue, OpId, Operation, OperationKind, Payload,
};
pub use version_vector::{CausalOrder, ReplicaId, VersionVector};
