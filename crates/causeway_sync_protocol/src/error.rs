//! Error types for the protocol crate.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding or decoding protocol data.
///
/// Version vector arithmetic, comparison and conflict detection never fail;
/// only byte-level decoding of untrusted input can.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Malformed bytes were handed to a decoder.
    #[error("deserialization failed: {message}")]
    Deserialization {
        /// Description of the decoding error.
        message: String,
    },

    /// A value could not be encoded.
    #[error("serialization failed: {message}")]
    Serialization {
        /// Description of the encoding error.
        message: String,
    },
}

impl ProtocolError {
    /// Creates a deserialization error.
    pub fn deserialization(message: impl Into<String>) -> Self {
        Self::Deserialization {
            message: message.into(),
        }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }
}
