//! Error types for the raw datapath.

use thiserror::Error;

/// Errors surfaced by datapath operations.
///
/// Malformed frames never show up here: parse failures are counted and the
/// frame is dropped (see [`crate::frame::ParseError`]).
#[derive(Debug, Error)]
pub enum DatapathError {
    /// Another socket already owns the address/port combination
    #[error("Address already in use: {0}")]
    AddressInUse(std::net::SocketAddr),

    /// Caller supplied an unusable argument
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Configuration failed validation
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No interface, queue or socket matched the request
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The datapath or resolver is shutting down
    #[error("Shutting down")]
    ShuttingDown,

    /// Headers could not be written for a route
    #[error("Framing failed: {0}")]
    Framing(#[from] crate::frame::WriteError),

    /// The kernel-bypass backend failed
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// I/O error (auxiliary OS sockets, thread spawning)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors reported by a [`crate::backend::RawBackend`].
#[derive(Debug, Error)]
pub enum BackendError {
    /// Descriptor ring operation failed
    #[error("Ring operation failed on queue {queue}: {reason}")]
    RingError {
        /// Queue the ring belongs to
        queue: u32,
        /// Human readable reason
        reason: String,
    },

    /// Binding a queue to the NIC failed
    #[error("Failed to bind queue {queue}: {reason}")]
    BindFailed {
        /// Queue being bound
        queue: u32,
        /// Human readable reason
        reason: String,
    },

    /// The backend does not implement the requested feature
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// Unknown queue id
    #[error("Unknown queue {0}")]
    UnknownQueue(u32),

    /// I/O error from the underlying transport
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for datapath operations.
pub type Result<T> = std::result::Result<T, DatapathError>;
