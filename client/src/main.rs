use anyhow::{Context, Result, bail};
use clap::Parser;
use shoal::cli::Args;
use shoal::logging::init_tracing;
use shoal::{DownloadConfig, DownloadError, DownloadReport, DownloadStatus, Downloader};
use std::net::{SocketAddr, SocketAddrV4};
use std::process::ExitCode;
use std::time::Duration;
use tokio::sync::watch;
use tracker::{AnnounceEvent, AnnounceRequest, tracker_for};

const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    if let Err(e) = init_tracing(args.log_level) {
        eprintln!("failed to initialize logging: {e}");
    }

    match run(args).await {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            match e.downcast_ref::<DownloadError>() {
                Some(DownloadError::PeersExhausted {
                    verified,
                    total,
                    peers,
                }) if *verified > 0 => {
                    eprintln!(
                        "Partially completed, no remaining peers: \
                         {verified}/{total} pieces verified."
                    );
                    eprintln!("Peers: {peers}");
                }
                Some(err) if err.nothing_written() => {
                    eprintln!("Failed before any data was written: {err}");
                }
                _ => eprintln!("Download failed: {e:#}"),
            }
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<DownloadReport> {
    let mut config = DownloadConfig::from_env();
    if let Some(max) = args.max_peers {
        config.max_peers = max.max(1);
    }
    if args.no_recheck {
        config.recheck = false;
    }

    let downloader = Downloader::new(&args.torrent, args.output.clone(), config)
        .await
        .with_context(|| format!("failed to prepare {}", args.torrent.display()))?;
    println!("Download directory: {}", downloader.storage.download_dir.display());

    let result = download(&args, &downloader).await;
    if result.is_err() {
        // The coordinator closes storage itself; this covers failures before it ran.
        if let Err(e) = downloader.writer.close().await {
            tracing::warn!(error = %e, "failed to close storage");
        }
    }
    result
}

async fn download(args: &Args, downloader: &Downloader) -> Result<DownloadReport> {
    if downloader.config.recheck {
        downloader.check_existing_data().await?;
    }

    let candidates = if !args.peers.is_empty() {
        args.peers.clone()
    } else if downloader.ledger.is_complete() {
        Vec::new()
    } else {
        discover_peers(downloader).await?
    };
    let prioritizer = args.prefer.prioritizer();
    let peers: Vec<SocketAddr> = prioritizer
        .prioritize(&candidates, candidates.len())
        .into_iter()
        .map(SocketAddr::V4)
        .collect();
    tracing::info!(peers = peers.len(), "candidate peers ready");

    let (cancel_tx, cancel_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            let _ = cancel_tx.send(true);
        }
    });

    Ok(downloader.run(peers, cancel_rx).await?)
}

/// Announces to every tracker in the torrent and merges their peer lists.
async fn discover_peers(downloader: &Downloader) -> Result<Vec<SocketAddrV4>> {
    let torrent = &downloader.torrent;
    let mut urls = vec![torrent.announce.clone()];
    for tier in torrent.announce_list.iter().flatten() {
        for url in tier {
            if !urls.contains(url) {
                urls.push(url.clone());
            }
        }
    }

    let request = AnnounceRequest {
        info_hash: torrent.info_hash,
        peer_id: downloader.peer_id,
        port: downloader.config.listen_port,
        uploaded: 0,
        downloaded: 0,
        left: downloader.left(),
        compact: true,
        event: Some(AnnounceEvent::Started),
    };

    let mut peers = Vec::new();
    for url in urls {
        let request = request.clone();
        let announced = tokio::task::spawn_blocking({
            let url = url.clone();
            move || tracker_for(&url, TRACKER_TIMEOUT)?.announce(&request)
        })
        .await?;

        match announced {
            Ok(response) => {
                tracing::info!(
                    %url,
                    peers = response.peers.len(),
                    seeders = ?response.complete,
                    "tracker responded"
                );
                peers.extend(response.peers);
            }
            Err(e) => tracing::warn!(%url, error = %e, "announce failed"),
        }
    }

    if peers.is_empty() {
        bail!("no tracker returned any peers");
    }
    Ok(peers)
}

fn print_report(report: &DownloadReport) {
    let outcome = match report.status {
        DownloadStatus::Completed => "Completed",
        DownloadStatus::Cancelled => "Cancelled",
    };
    println!(
        "{outcome}: {}/{} pieces verified, {} bytes in {:.1}s ({:.1} KiB/s)",
        report.verified_pieces,
        report.total_pieces,
        report.downloaded_bytes,
        report.elapsed.as_secs_f64(),
        report.throughput() / 1024.0
    );
    println!(
        "Peers: {} attempted, {} connected ({:.1}%), {} unchoked",
        report.peers.attempted,
        report.peers.connected,
        percent(report.peers.connected, report.peers.attempted),
        report.peers.unchoked
    );
}

fn percent(part: usize, whole: usize) -> f64 {
    if whole == 0 {
        return 0.0;
    }
    part as f64 * 100.0 / whole as f64
}
