//! Error types for the sync engine.

use crate::storage::StorageError;
use causeway_sync_protocol::{ConflictId, ProtocolError};
use thiserror::Error;

/// Result type for sync operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors that can occur during sync operations.
///
/// Conflicts needing an operator are not errors; they park queue items.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network or transport error.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the operation can be retried.
        retryable: bool,
    },

    /// The authority could not be reached.
    #[error("authority unreachable: {0}")]
    Unreachable(String),

    /// A round trip exceeded its timeout.
    #[error("round trip timed out")]
    Timeout,

    /// A single operation could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] ProtocolError),

    /// Storage collaborator error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Sync was cancelled.
    #[error("sync cancelled")]
    Cancelled,

    /// The pipeline is paused after a fatal storage error.
    #[error("sync paused: {0}")]
    Paused(String),

    /// Invalid state transition.
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidStateTransition {
        /// Current state.
        from: String,
        /// Attempted target state.
        to: String,
    },

    /// Queue item does not exist.
    #[error("queue item {0} not found")]
    QueueItemNotFound(u64),

    /// Parked conflict does not exist.
    #[error("parked conflict {0} not found")]
    ParkedConflictNotFound(ConflictId),

    /// Queue item was quarantined without its payload and cannot be retried.
    #[error("queue item {0} holds no payload")]
    PayloadDropped(u64),
}

/// Coarse error classification used in notifications and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Transient network failure.
    Network,
    /// Encoding failure confined to one item.
    Serialization,
    /// Storage rejected a single item.
    StorageRejected,
    /// Storage failure that stops the pipeline.
    StorageFatal,
    /// The authority refused an operation.
    Refused,
    /// Cancellation or pause.
    Interrupted,
    /// Caller error.
    Usage,
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if this error can be retried.
    pub fn is_retryable(&self) -> bool {
        match self {
            SyncError::Transport { retryable, .. } => *retryable,
            SyncError::Unreachable(_) | SyncError::Timeout => true,
            _ => false,
        }
    }

    /// Returns true for transport-level failures, which put the
    /// coordinator offline.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SyncError::Transport { .. } | SyncError::Unreachable(_) | SyncError::Timeout
        )
    }

    /// Returns true if the error must stop the pipeline.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::Storage(e) if e.is_fatal())
    }

    /// Classifies the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SyncError::Transport { .. } | SyncError::Unreachable(_) | SyncError::Timeout => {
                ErrorKind::Network
            }
            SyncError::Serialization(_) => ErrorKind::Serialization,
            SyncError::Storage(e) if e.is_serialization() => ErrorKind::Serialization,
            SyncError::Storage(e) if e.is_fatal() => ErrorKind::StorageFatal,
            SyncError::Storage(_) => ErrorKind::StorageRejected,
            SyncError::Cancelled | SyncError::Paused(_) => ErrorKind::Interrupted,
            SyncError::InvalidStateTransition { .. }
            | SyncError::QueueItemNotFound(_)
            | SyncError::ParkedConflictNotFound(_)
            | SyncError::PayloadDropped(_) => ErrorKind::Usage,
        }
    }
}
