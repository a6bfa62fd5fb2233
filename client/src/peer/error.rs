use crate::storage::StorageError;
use thiserror::Error;

/// Errors that end (or count against) a peer session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0} timed out")]
    Timeout(&'static str),

    #[error("invalid handshake")]
    InvalidHandshake,

    #[error("info hash mismatch")]
    InfoHashMismatch,

    #[error("frame of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u32, max: u32 },

    #[error("malformed message id {id}: {reason}")]
    Malformed { id: u8, reason: &'static str },

    #[error("peer exceeded {0} protocol violations")]
    TooManyViolations(u32),

    #[error("no block received within the read timeout")]
    Stalled,

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),
}

impl SessionError {
    /// Errors that must stop the whole download, not just this session.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Storage(_))
    }

    /// A single bad message that leaves the stream in sync.
    pub fn is_violation(&self) -> bool {
        matches!(self, SessionError::Malformed { .. })
    }
}
