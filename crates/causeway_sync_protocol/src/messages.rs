//! Push and pull messages exchanged with the authority.

use crate::codec::{from_cbor, to_cbor};
use crate::error::ProtocolResult;
use crate::operation::{OpId, Operation};
use crate::version_vector::ReplicaId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// CBOR encoding shared by every message.
pub trait WireMessage: Serialize + DeserializeOwned {
    /// Encodes the message.
    fn encode(&self) -> ProtocolResult<Vec<u8>> {
        to_cbor(self)
    }

    /// Decodes the message.
    fn decode(bytes: &[u8]) -> ProtocolResult<Self> {
        from_cbor(bytes)
    }
}

/// Batch of local operations sent to the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    /// Sending replica.
    pub replica: ReplicaId,
    /// Operations in queue order.
    pub operations: Vec<Operation>,
}

impl PushRequest {
    /// Creates a push request.
    pub fn new(replica: ReplicaId, operations: Vec<Operation>) -> Self {
        Self {
            replica,
            operations,
        }
    }
}

/// Per-operation acknowledgment status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    /// Stored by the authority.
    Accepted,
    /// Already stored earlier; treated as success.
    Duplicate,
    /// Refused by the authority.
    Rejected {
        /// Reason given by the authority.
        reason: String,
        /// Whether retrying may succeed.
        retryable: bool,
    },
}

impl AckStatus {
    /// Returns true for `Accepted` and `Duplicate`.
    pub fn is_success(&self) -> bool {
        matches!(self, AckStatus::Accepted | AckStatus::Duplicate)
    }
}

/// Acknowledgment for one pushed operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushAck {
    /// Operation acknowledged.
    pub op_id: OpId,
    /// Outcome.
    pub status: AckStatus,
}

impl PushAck {
    /// Acknowledges acceptance.
    pub fn accepted(op_id: OpId) -> Self {
        Self {
            op_id,
            status: AckStatus::Accepted,
        }
    }
}

/// Authority response to a push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushResponse {
    /// One ack per pushed operation. Missing acks count as unacknowledged.
    pub acks: Vec<PushAck>,
}

/// Request for operations after `cursor`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Requesting replica; its own operations are filtered out.
    pub replica: ReplicaId,
    /// Exclusive lower bound.
    pub cursor: u64,
    /// Maximum number of operations to return.
    pub limit: u32,
}

/// Operations pulled from the authority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Operations in authority order.
    pub operations: Vec<Operation>,
    /// Cursor to send on the next pull.
    pub next_cursor: u64,
    /// More operations are available.
    pub has_more: bool,
}

impl PullResponse {
    /// An empty page that leaves the cursor where it was.
    pub fn empty(cursor: u64) -> Self {
        Self {
            operations: Vec::new(),
            next_cursor: cursor,
            has_more: false,
        }
    }
}

impl WireMessage for PushRequest {}
impl WireMessage for PushResponse {}
impl WireMessage for PullRequest {}
impl WireMessage for PullResponse {}
