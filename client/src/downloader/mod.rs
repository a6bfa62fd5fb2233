//! Download coordination: setup, resume, and the session supervisor.

mod init;
mod manager;
mod report;
mod state;

pub use init::generate_peer_id;
pub use report::{DownloadError, DownloadReport, DownloadStatus, PeerCounts};
pub use state::Downloader;

use crate::config::DownloadConfig;
use shoal_core::Torrent;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use tokio::sync::watch;

impl Downloader {
    pub async fn new(
        torrent_path: impl AsRef<Path>,
        output_path: Option<PathBuf>,
        config: DownloadConfig,
    ) -> Result<Self, DownloadError> {
        let torrent = shoal_core::parse_torrent(torrent_path)?;
        init::from_torrent(torrent, output_path, config).await
    }

    pub async fn from_torrent(
        torrent: Torrent,
        output_path: Option<PathBuf>,
        config: DownloadConfig,
    ) -> Result<Self, DownloadError> {
        init::from_torrent(torrent, output_path, config).await
    }

    pub async fn check_existing_data(&self) -> Result<usize, DownloadError> {
        init::check_existing_data(self).await
    }

    /// Downloads from `peers` until done, out of peers, or cancelled.
    pub async fn run(
        &self,
        peers: Vec<SocketAddr>,
        cancel: watch::Receiver<bool>,
    ) -> Result<DownloadReport, DownloadError> {
        manager::run(self, peers, cancel).await
    }
}
