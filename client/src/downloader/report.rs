use crate::storage::StorageError;
use shoal_core::MetainfoError;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Failures that end the whole download.
#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("no peer unchoked us during the connection phase ({peers})")]
    NoConnectivity { peers: PeerCounts },

    #[error("every peer session closed with {verified}/{total} pieces verified ({peers})")]
    PeersExhausted {
        verified: usize,
        total: usize,
        peers: PeerCounts,
    },

    #[error("storage failure: {0}")]
    Storage(#[from] StorageError),

    #[error("invalid torrent: {0}")]
    Invalid(#[from] MetainfoError),
}

impl DownloadError {
    /// True when the run ended before a single verified piece existed.
    pub fn nothing_written(&self) -> bool {
        match self {
            DownloadError::NoConnectivity { .. } | DownloadError::Invalid(_) => true,
            DownloadError::PeersExhausted { verified, .. } => *verified == 0,
            DownloadError::Storage(_) => false,
        }
    }
}

/// How far the candidate peers got.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PeerCounts {
    pub attempted: usize,
    /// Sessions that completed the handshake.
    pub connected: usize,
    pub unchoked: usize,
}

impl fmt::Display for PeerCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} attempted, {} connected, {} unchoked",
            self.attempted, self.connected, self.unchoked
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadStatus {
    Completed,
    /// Stopped by the caller before every piece was verified.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DownloadReport {
    pub status: DownloadStatus,
    pub verified_pieces: usize,
    pub total_pieces: usize,
    /// Block payload received from peers during this run.
    pub downloaded_bytes: u64,
    pub peers: PeerCounts,
    pub elapsed: Duration,
}

impl DownloadReport {
    /// Average download rate in bytes per second.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }
        self.downloaded_bytes as f64 / secs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errors_mention_peer_counts() {
        let peers = PeerCounts {
            attempted: 12,
            connected: 3,
            unchoked: 0,
        };
        let err = DownloadError::NoConnectivity { peers };
        assert_eq!(
            err.to_string(),
            "no peer unchoked us during the connection phase \
             (12 attempted, 3 connected, 0 unchoked)"
        );
        assert!(err.nothing_written());

        let err = DownloadError::PeersExhausted {
            verified: 2,
            total: 5,
            peers,
        };
        assert!(err.to_string().ends_with("(12 attempted, 3 connected, 0 unchoked)"));
        assert!(!err.nothing_written());
    }
}
