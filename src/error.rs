//! Error types surfaced by the public API.
//!
//! `connection/rdma.rs` wraps every verbs failure in a `std::io::Error` with
//! `ErrorKind::Other` and a `format!`-ed message. That collapses every
//! failure mode into one kind, which is fine for a PoC but not for a library
//! callers need to branch on. This module keeps the habit of carrying the
//! underlying error's `Display` text along, but gives each failure mode its
//! own matchable variant.

use thiserror::Error;

/// Error kinds surfaced to callers.
#[derive(Debug, Error)]
pub enum KiroError {
    #[error("address resolution failed: {0}")]
    AddressResolution(String),

    #[error("endpoint creation failed: {0}")]
    EndpointCreation(String),

    #[error("handshake failed: {0}")]
    HandshakeFailed(String),

    #[error("out of memory: {0}")]
    OutOfMemory(String),

    #[error("memory registration failed: {0}")]
    RegistrationFailed(String),

    #[error("rdma transfer failed: {0}")]
    TransferFailed(String),

    #[error("server unresponsive (RETRY_EXC_ERR)")]
    ServerUnresponsive,

    #[error("remote access revoked (REM_ACCESS_ERR)")]
    AccessRevoked,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation timed out")]
    Timeout,

    #[error("connection is not in a state that supports this operation: {0}")]
    InvalidState(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("verbs error: {0}")]
    Verbs(String),
}

pub type Result<T> = std::result::Result<T, KiroError>;

/// Maps an RDMA work-completion status to the error it represents for a
/// synchronous RDMA READ/WRITE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    Success,
    RetryExceeded,
    RemoteAccessError,
    Other,
}

impl CompletionStatus {
    pub fn into_result(self) -> Result<()> {
        match self {
            CompletionStatus::Success => Ok(()),
            CompletionStatus::RetryExceeded => Err(KiroError::ServerUnresponsive),
            CompletionStatus::RemoteAccessError => Err(KiroError::AccessRevoked),
            CompletionStatus::Other => {
                Err(KiroError::TransferFailed("non-retry completion status".into()))
            }
        }
    }
}
