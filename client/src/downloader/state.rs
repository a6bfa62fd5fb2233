use crate::config::DownloadConfig;
use crate::ledger::PieceLedger;
use crate::storage::{Storage, StorageWriter};
use shoal_core::Torrent;
use std::sync::Arc;

/// Everything a download shares across its peer sessions.
///
/// Sessions only ever see the ledger (and, through it, the writer). The rest
/// is read by the coordinator.
pub struct Downloader {
    /// The validated torrent metadata.
    pub torrent: Arc<Torrent>,
    /// The peer id this client announces and handshakes with.
    pub peer_id: [u8; 20],
    /// The download directory.
    pub storage: Storage,
    /// The pre-sized destination files.
    pub writer: Arc<StorageWriter>,
    /// Piece state and verification.
    pub ledger: Arc<PieceLedger>,
    pub config: DownloadConfig,
}

impl Downloader {
    pub fn total_length(&self) -> u64 {
        self.torrent.total_length()
    }

    /// Bytes still missing, as reported to trackers.
    pub fn left(&self) -> u64 {
        let progress = self.ledger.progress();
        progress.total_bytes - progress.verified_bytes
    }
}
