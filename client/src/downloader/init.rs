use super::report::DownloadError;
use super::state::Downloader;
use crate::config::DownloadConfig;
use crate::ledger::PieceLedger;
use crate::storage::{Storage, StorageWriter};
use rand::Rng;
use shoal_core::Torrent;
use std::path::PathBuf;
use std::sync::Arc;

const PEER_ID_PREFIX: &[u8; 8] = b"-SH0001-";

/// A random peer id in the Azureus style, `-SH0001-` followed by 12 random bytes.
pub fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    rand::rng().fill(&mut id[8..]);
    id[..8].copy_from_slice(PEER_ID_PREFIX);
    id
}

/// Initializes a `Downloader` from a parsed `Torrent`.
///
/// This function:
/// 1. Validates the torrent's piece geometry and file paths.
/// 2. Resolves (and creates) the download directory.
/// 3. Opens or creates every destination file and sizes it.
/// 4. Builds a ledger with every piece `Missing`.
///
/// Existing file content is left in place; see [`check_existing_data`].
pub async fn from_torrent(
    torrent: Torrent,
    output_path: Option<PathBuf>,
    config: DownloadConfig,
) -> Result<Downloader, DownloadError> {
    torrent.validate()?;

    let storage = Storage::new(output_path).await?;
    tracing::info!(
        dir = %storage.download_dir.display(),
        info_hash = %hex::encode(torrent.info_hash),
        pieces = torrent.piece_count(),
        length = torrent.total_length(),
        "preparing download"
    );

    let writer = Arc::new(StorageWriter::initialize(&storage, &torrent.files()).await?);
    let ledger = match PieceLedger::new(
        &torrent,
        writer.clone(),
        config.block_size,
        config.pipeline_depth,
    ) {
        Ok(ledger) => ledger,
        Err(e) => {
            let _ = writer.close().await;
            return Err(e.into());
        }
    };

    Ok(Downloader {
        torrent: Arc::new(torrent),
        peer_id: generate_peer_id(),
        storage,
        writer,
        ledger: Arc::new(ledger),
        config,
    })
}

/// Re-verifies whatever is already on disk and returns the number of pieces found.
pub async fn check_existing_data(downloader: &Downloader) -> Result<usize, DownloadError> {
    tracing::info!("checking existing data");
    let found = downloader.ledger.recheck().await?;
    let progress = downloader.ledger.progress();
    tracing::info!(
        found,
        total = progress.total_pieces,
        "resuming with {:.1}% verified",
        progress.percent()
    );
    Ok(found)
}
