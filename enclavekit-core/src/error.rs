//! Error types for the enclave client.
//!
//! Most internal failures are absorbed into state transitions and surfaced
//! only through accessors (`is_registered`, `is_ready`) staying false; these
//! error types appear at the provider boundaries and in the few operations
//! with a caller-visible `Result`.

use thiserror::Error;

/// Errors produced at the enclave client's provider boundaries.
#[derive(Debug, Error)]
pub enum EnclaveError {
    /// An I/O operation failed.
    #[error("I/O error during {context}: {source}")]
    Io {
        /// Context describing the operation.
        context: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Serializing the local state failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Parsing persisted or wire data failed.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// The OS encryption capability failed to seal or open a blob.
    #[error("state cipher error: {0}")]
    Cipher(String),

    /// A key-material provider failed.
    #[error("keystore error: {0}")]
    Keystore(String),

    /// Fetching an access token for the enclave service failed.
    #[error("access token error: {0}")]
    Token(String),

    /// The transactional exchange with the enclave failed.
    #[error("enclave transport error: {0}")]
    Transport(String),

    /// An enclave response did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A local-state invariant was violated.
    #[error("state invariant violated: {0}")]
    InvariantViolation(&'static str),

    /// The operation requires a state the manager is not in.
    #[error("operation not possible in the current state: {0}")]
    NotReady(&'static str),
}

impl EnclaveError {
    /// Creates an I/O error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Result type alias for enclave client operations.
pub type EnclaveResult<T> = Result<T, EnclaveError>;
