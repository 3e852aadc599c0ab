//! Error types for the synchronization subsystem

use thiserror::Error;

/// Main error type for synchronization operations
#[derive(Error, Debug)]
pub enum SyncError {
    /// No free port was found in the configured range
    #[error("No free port in range {start}-{end}")]
    PortRangeExhausted { start: u16, end: u16 },

    /// Peer was not found in the registry
    #[error("Peer not found: {0}")]
    PeerNotFound(u16),

    /// A frame exceeded the maximum allowed size
    #[error("Frame of {got} bytes exceeds limit of {limit} bytes")]
    FrameTooLarge { got: usize, limit: usize },

    /// A frame payload could not be decoded
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Handshake with a peer failed
    #[error("Handshake error: {0}")]
    Handshake(String),

    /// The worker thread or its channels are gone
    #[error("Sync worker unavailable: {0}")]
    WorkerGone(String),

    /// General I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias using SyncError
pub type SyncResult<T> = Result<T, SyncError>;
