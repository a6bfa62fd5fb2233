//! The download coordinator: spawns one task per candidate, watches the
//! ledger, and decides when (and how) the download ends.

use super::report::{DownloadError, DownloadReport, DownloadStatus, PeerCounts};
use super::state::Downloader;
use crate::ledger::{PieceLedger, SessionId};
use crate::storage::StorageError;
use crate::peer::{
    Handshake, PeerSession, SessionConfig, SessionEnd, SessionError, SessionEvent, SessionStats,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinSet;
use tracing::Instrument;

/// How the coordinator loop stopped; turned into a result once the peer
/// counts are final.
enum Ending {
    Finished(DownloadStatus),
    NoConnectivity,
    PeersExhausted,
    Storage(StorageError),
}

/// What one session task hands back when it finishes.
struct SessionReport {
    addr: SocketAddr,
    stats: SessionStats,
    result: Result<SessionEnd, SessionError>,
}

struct SessionTask {
    id: SessionId,
    addr: SocketAddr,
    handshake: Handshake,
    ledger: Arc<PieceLedger>,
    config: SessionConfig,
    events: mpsc::UnboundedSender<SessionEvent>,
    shutdown: watch::Receiver<bool>,
    slots: Arc<Semaphore>,
}

impl SessionTask {
    async fn run(mut self) -> SessionReport {
        let idle = |addr| SessionReport {
            addr,
            stats: SessionStats::default(),
            result: Ok(SessionEnd::Shutdown),
        };

        let Ok(_permit) = self.slots.clone().acquire_owned().await else {
            return idle(self.addr);
        };
        if *self.shutdown.borrow() {
            return idle(self.addr);
        }

        let piece_count = self.ledger.piece_count();
        let mut session =
            match PeerSession::connect(self.id, self.addr, piece_count, self.config).await {
                Ok(session) => session,
                Err(e) => {
                    return SessionReport {
                        addr: self.addr,
                        stats: SessionStats::default(),
                        result: Err(e),
                    };
                }
            };
        tracing::debug!("connected");

        let result = session
            .run(&self.handshake, &self.ledger, &self.events, &mut self.shutdown)
            .await;
        SessionReport {
            addr: self.addr,
            stats: session.stats(),
            result,
        }
    }
}

/// Runs the download against `peers` until it completes, fails, or `cancel`
/// flips to `true`.
///
/// The storage writer is closed before this returns, whatever the outcome.
pub async fn run(
    downloader: &Downloader,
    peers: Vec<SocketAddr>,
    cancel: watch::Receiver<bool>,
) -> Result<DownloadReport, DownloadError> {
    let started = Instant::now();
    let result = coordinate(downloader, peers, cancel, started).await;
    let closed = downloader.writer.close().await;

    match (result, closed) {
        (Ok(report), Ok(())) => Ok(report),
        (Ok(_), Err(e)) => Err(e.into()),
        (Err(e), closed) => {
            if let Err(close_err) = closed {
                tracing::warn!(error = %close_err, "failed to close storage");
            }
            Err(e)
        }
    }
}

async fn coordinate(
    downloader: &Downloader,
    peers: Vec<SocketAddr>,
    mut cancel: watch::Receiver<bool>,
    started: Instant,
) -> Result<DownloadReport, DownloadError> {
    let ledger = &downloader.ledger;
    let config = &downloader.config;
    let mut counts = PeerCounts {
        attempted: peers.len(),
        ..PeerCounts::default()
    };

    let report = |status, downloaded_bytes, peers| {
        let progress = ledger.progress();
        DownloadReport {
            status,
            verified_pieces: progress.verified_pieces,
            total_pieces: progress.total_pieces,
            downloaded_bytes,
            peers,
            elapsed: started.elapsed(),
        }
    };

    if ledger.is_complete() {
        tracing::info!("all pieces already verified");
        return Ok(report(DownloadStatus::Completed, 0, counts));
    }
    if peers.is_empty() {
        return Err(DownloadError::NoConnectivity { peers: counts });
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let slots = Arc::new(Semaphore::new(config.max_peers.max(1)));
    let handshake = Handshake::new(downloader.torrent.info_hash, downloader.peer_id);

    let mut sessions = JoinSet::new();
    for (n, addr) in peers.into_iter().enumerate() {
        let task = SessionTask {
            id: SessionId(n as u64),
            addr,
            handshake: handshake.clone(),
            ledger: ledger.clone(),
            config: config.session_config(),
            events: events_tx.clone(),
            shutdown: shutdown_rx.clone(),
            slots: slots.clone(),
        };
        sessions.spawn(task.run().instrument(tracing::info_span!("peer", %addr)));
    }
    drop(events_tx);
    tracing::info!(
        candidates = counts.attempted,
        max_peers = config.max_peers,
        "sessions started"
    );

    let mut ticker = tokio::time::interval(config.poll_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let connection_phase = tokio::time::sleep(config.connection_phase_timeout);
    tokio::pin!(connection_phase);

    let mut unchoked = false;
    let mut cancel_open = true;
    let mut downloaded_bytes = 0u64;
    let mut last_verified = ledger.progress().verified_pieces;

    let ending = loop {
        tokio::select! {
            _ = ticker.tick() => {
                if ledger.is_complete() {
                    break Ending::Finished(DownloadStatus::Completed);
                }
                let progress = ledger.progress();
                if progress.verified_pieces != last_verified {
                    last_verified = progress.verified_pieces;
                    tracing::info!(
                        verified = progress.verified_pieces,
                        total = progress.total_pieces,
                        "progress {:.1}%",
                        progress.percent()
                    );
                }
            }
            Some(event) = events_rx.recv() => {
                if let SessionEvent::Unchoked(addr) = event {
                    if !unchoked {
                        tracing::info!(%addr, "first peer unchoked us");
                    }
                    unchoked = true;
                }
                count_event(&mut counts, event);
            }
            _ = &mut connection_phase, if !unchoked => {
                break Ending::NoConnectivity;
            }
            changed = cancel.changed(), if cancel_open => {
                if changed.is_err() {
                    cancel_open = false;
                } else if *cancel.borrow() {
                    tracing::info!("download cancelled");
                    break Ending::Finished(DownloadStatus::Cancelled);
                }
            }
            joined = sessions.join_next() => match joined {
                Some(Ok(done)) => {
                    downloaded_bytes += done.stats.bytes_received;
                    unchoked |= done.stats.reached_unchoked;
                    match done.result {
                        Err(SessionError::Storage(e)) => break Ending::Storage(e),
                        result => log_session_end(&done.addr, &done.stats, &result),
                    }
                    if ledger.is_complete() {
                        break Ending::Finished(DownloadStatus::Completed);
                    }
                }
                Some(Err(e)) => tracing::warn!(error = %e, "session task failed"),
                None => {
                    if ledger.is_complete() {
                        break Ending::Finished(DownloadStatus::Completed);
                    }
                    if !unchoked {
                        break Ending::NoConnectivity;
                    }
                    break Ending::PeersExhausted;
                }
            },
        }
    };

    let _ = shutdown_tx.send(true);
    downloaded_bytes += drain_sessions(&mut sessions, config.shutdown_grace).await;

    // Every session has finished or been aborted, so no more events arrive.
    while let Ok(event) = events_rx.try_recv() {
        count_event(&mut counts, event);
    }
    tracing::info!(
        attempted = counts.attempted,
        connected = counts.connected,
        unchoked = counts.unchoked,
        "peer connectivity"
    );

    match ending {
        Ending::Finished(status) => Ok(report(status, downloaded_bytes, counts)),
        Ending::NoConnectivity => Err(DownloadError::NoConnectivity { peers: counts }),
        Ending::PeersExhausted => {
            let progress = ledger.progress();
            Err(DownloadError::PeersExhausted {
                verified: progress.verified_pieces,
                total: progress.total_pieces,
                peers: counts,
            })
        }
        Ending::Storage(e) => Err(DownloadError::Storage(e)),
    }
}

fn count_event(counts: &mut PeerCounts, event: SessionEvent) {
    match event {
        SessionEvent::Connected(_) => counts.connected += 1,
        SessionEvent::Unchoked(_) => counts.unchoked += 1,
    }
}

/// Waits up to `grace` for sessions to notice the shutdown signal, then
/// aborts the rest. Returns the bytes the finished sessions received.
async fn drain_sessions(
    sessions: &mut JoinSet<SessionReport>,
    grace: std::time::Duration,
) -> u64 {
    let mut bytes = 0;
    let deadline = tokio::time::sleep(grace);
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            joined = sessions.join_next() => match joined {
                Some(Ok(done)) => {
                    bytes += done.stats.bytes_received;
                    log_session_end(&done.addr, &done.stats, &done.result);
                }
                Some(Err(e)) => tracing::debug!(error = %e, "session task ended abnormally"),
                None => break,
            },
            _ = &mut deadline => {
                tracing::debug!(remaining = sessions.len(), "aborting sessions after grace period");
                sessions.shutdown().await;
                break;
            }
        }
    }
    bytes
}

fn log_session_end(
    addr: &SocketAddr,
    stats: &SessionStats,
    result: &Result<SessionEnd, SessionError>,
) {
    match result {
        Ok(end) => tracing::debug!(%addr, ?end, pieces = stats.pieces_verified, "session closed"),
        Err(e) if stats.reached_unchoked => {
            tracing::warn!(%addr, error = %e, pieces = stats.pieces_verified, "session lost")
        }
        Err(e) => tracing::debug!(%addr, error = %e, "session failed"),
    }
}
