//! One peer connection and its wire-protocol state machine.
//!
//! `Connecting -> Handshaking -> {Choked <-> Unchoked} -> Closed`. A session
//! only reports blocks to the ledger and asks it for work; it never touches
//! piece state directly. Closing is terminal: the transport is shut down and
//! the session's reservations are handed back to the ledger.

use super::SessionError;
use super::handshake::{self, Handshake};
use super::message::{Message, read_message, write_message};
use crate::bitfield::Bitfield;
use crate::ledger::{Block, LedgerError, PieceLedger, PieceOutcome, SessionId};
use std::fmt;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Handshaking,
    Choked,
    Unchoked,
    Closed,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Longest silence tolerated from the peer, and the longest wait for
    /// any outstanding block. An unchoked session whose only wanted pieces
    /// are reserved elsewhere sends a keep-alive instead of giving up.
    pub read_timeout: Duration,
    pub max_violations: u32,
    pub max_frame_len: u32,
}

/// Notifications a session sends to its coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// The handshake succeeded.
    Connected(SocketAddr),
    /// The peer unchoked this session for the first time.
    Unchoked(SocketAddr),
}

/// Why a session ended without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    DownloadComplete,
    Shutdown,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    pub blocks_received: u64,
    pub bytes_received: u64,
    pub pieces_verified: u64,
    pub pieces_corrupt: u64,
    pub violations: u32,
    pub handshaken: bool,
    pub reached_unchoked: bool,
}

pub struct PeerSession<S> {
    id: SessionId,
    addr: SocketAddr,
    stream: S,
    state: SessionState,
    config: SessionConfig,
    bitfield: Bitfield,
    inflight: Vec<Block>,
    last_block_at: Instant,
    remote_peer_id: Option<[u8; 20]>,
    stats: SessionStats,
}

impl PeerSession<TcpStream> {
    /// Opens the transport; the session starts out `Handshaking`.
    pub async fn connect(
        id: SessionId,
        addr: SocketAddr,
        piece_count: usize,
        config: SessionConfig,
    ) -> Result<Self, SessionError> {
        tracing::trace!(state = ?SessionState::Connecting, "opening connection");
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| SessionError::Timeout("connect"))??;
        stream.set_nodelay(true)?;
        Ok(Self::new(id, addr, stream, piece_count, config))
    }
}

impl<S> PeerSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wraps an established transport.
    pub fn new(
        id: SessionId,
        addr: SocketAddr,
        stream: S,
        piece_count: usize,
        config: SessionConfig,
    ) -> Self {
        Self {
            id,
            addr,
            stream,
            state: SessionState::Handshaking,
            config,
            bitfield: Bitfield::new(piece_count),
            inflight: Vec::new(),
            last_block_at: Instant::now(),
            remote_peer_id: None,
            stats: SessionStats::default(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn bitfield(&self) -> &Bitfield {
        &self.bitfield
    }

    pub fn inflight(&self) -> &[Block] {
        &self.inflight
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn remote_peer_id(&self) -> Option<[u8; 20]> {
        self.remote_peer_id
    }

    fn transition(&mut self, next: SessionState) {
        tracing::trace!(from = ?self.state, to = ?next, "session state");
        self.state = next;
    }

    /// Exchanges handshakes and declares interest, ending up `Choked`.
    pub async fn handshake(&mut self, ours: &Handshake) -> Result<(), SessionError> {
        if self.state != SessionState::Handshaking {
            return Err(SessionError::InvalidHandshake);
        }
        let theirs = tokio::time::timeout(
            self.config.handshake_timeout,
            handshake::exchange(&mut self.stream, ours),
        )
        .await
        .map_err(|_| SessionError::Timeout("handshake"))??;
        self.remote_peer_id = Some(theirs.peer_id);
        self.stats.handshaken = true;

        write_message(&mut self.stream, &Message::Interested).await?;
        self.transition(SessionState::Choked);
        Ok(())
    }

    /// Runs the session to completion: handshake, then the request loop.
    ///
    /// Whatever the outcome, the session is `Closed` on return and the ledger
    /// no longer holds reservations for it.
    pub async fn run(
        &mut self,
        ours: &Handshake,
        ledger: &PieceLedger,
        events: &mpsc::UnboundedSender<SessionEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, SessionError> {
        let result = match self.handshake(ours).await {
            Ok(()) => {
                let _ = events.send(SessionEvent::Connected(self.addr));
                self.message_loop(ledger, events, shutdown).await
            }
            Err(e) => Err(e),
        };
        self.close(ledger).await;
        result
    }

    async fn message_loop(
        &mut self,
        ledger: &PieceLedger,
        events: &mpsc::UnboundedSender<SessionEvent>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd, SessionError> {
        loop {
            if *shutdown.borrow() {
                return Ok(SessionEnd::Shutdown);
            }
            if ledger.is_complete() {
                return Ok(SessionEnd::DownloadComplete);
            }
            // Created before asking for work so a release racing with the
            // request below still wakes us.
            let released = ledger.work_released();
            tokio::pin!(released);

            if self.state == SessionState::Unchoked {
                self.fill_pipeline(ledger).await?;
            }

            // Unchoked with nothing free: either the peer has nothing we need,
            // or its pieces are reserved by other sessions for now.
            let idle = self.state == SessionState::Unchoked && self.inflight.is_empty();
            let waiting_on_others = idle && ledger.has_work_for(&self.bitfield).await;

            let wait = if self.inflight.is_empty() {
                self.config.read_timeout
            } else {
                self.config
                    .read_timeout
                    .saturating_sub(self.last_block_at.elapsed())
            };
            if wait.is_zero() {
                return Err(SessionError::Stalled);
            }

            let read = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(SessionEnd::Shutdown);
                    }
                    continue;
                }
                _ = &mut released, if idle => continue,
                read = tokio::time::timeout(
                    wait,
                    read_message(&mut self.stream, self.config.max_frame_len),
                ) => read,
            };

            match read {
                Err(_) if !self.inflight.is_empty() => return Err(SessionError::Stalled),
                Err(_) if waiting_on_others => {
                    write_message(&mut self.stream, &Message::KeepAlive).await?;
                }
                Err(_) => return Err(SessionError::Timeout("read")),
                Ok(Err(e)) if e.is_violation() => self.record_violation(&e)?,
                Ok(Err(e)) => return Err(e),
                Ok(Ok(msg)) => self.handle_message(msg, ledger, events).await?,
            }
        }
    }

    /// Issues requests until the pipeline is full or the ledger has nothing
    /// this peer can serve.
    async fn fill_pipeline(&mut self, ledger: &PieceLedger) -> Result<(), SessionError> {
        while let Some(block) = ledger
            .next_request(self.id, &self.bitfield, self.inflight.len())
            .await
        {
            if self.inflight.is_empty() {
                self.last_block_at = Instant::now();
            }
            self.inflight.push(block);
            write_message(
                &mut self.stream,
                &Message::Request {
                    index: block.piece,
                    begin: block.offset,
                    length: block.length,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: Message,
        ledger: &PieceLedger,
        events: &mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<(), SessionError> {
        match msg {
            Message::KeepAlive => {}
            Message::Choke => {
                if self.state == SessionState::Unchoked {
                    self.transition(SessionState::Choked);
                    // Outstanding requests are abandoned; blocks that still
                    // arrive are recorded all the same.
                    self.inflight.clear();
                    ledger.release(self.id).await;
                }
            }
            Message::Unchoke => {
                if self.state == SessionState::Choked {
                    self.transition(SessionState::Unchoked);
                    if !self.stats.reached_unchoked {
                        self.stats.reached_unchoked = true;
                        let _ = events.send(SessionEvent::Unchoked(self.addr));
                    }
                }
            }
            Message::Have(index) => self.bitfield.set(index as usize),
            Message::Bitfield(bits) => {
                let advertised = Bitfield::from_bytes(&bits, self.bitfield.piece_count());
                self.bitfield.union_with(&advertised);
                tracing::trace!(pieces = self.bitfield.count(), "peer bitfield");
            }
            Message::Piece {
                index,
                begin,
                block,
            } => self.on_piece(index, begin, &block, ledger).await?,
            Message::Interested
            | Message::NotInterested
            | Message::Request { .. }
            | Message::Cancel { .. } => {
                tracing::trace!(?msg, "ignoring upload-side message");
            }
            Message::Unknown { id } => tracing::trace!(id, "ignoring unknown message"),
        }
        Ok(())
    }

    async fn on_piece(
        &mut self,
        index: u32,
        begin: u32,
        data: &[u8],
        ledger: &PieceLedger,
    ) -> Result<(), SessionError> {
        if let Some(pos) = self.inflight.iter().position(|b| {
            b.piece == index && b.offset == begin && b.length as usize == data.len()
        }) {
            self.inflight.swap_remove(pos);
            self.last_block_at = Instant::now();
        }

        match ledger.on_block_received(index, begin, data).await {
            Ok(outcome) => {
                self.stats.blocks_received += 1;
                self.stats.bytes_received += data.len() as u64;
                match outcome {
                    PieceOutcome::Accepted => {}
                    PieceOutcome::PieceVerified => self.stats.pieces_verified += 1,
                    PieceOutcome::PieceCorrupt => self.stats.pieces_corrupt += 1,
                }
                Ok(())
            }
            Err(LedgerError::Storage(e)) => Err(SessionError::Storage(e)),
            Err(e) => self.record_violation(&e),
        }
    }

    fn record_violation(&mut self, what: &dyn fmt::Display) -> Result<(), SessionError> {
        self.stats.violations += 1;
        tracing::debug!(violations = self.stats.violations, "protocol violation: {what}");
        if self.stats.violations >= self.config.max_violations {
            return Err(SessionError::TooManyViolations(self.stats.violations));
        }
        Ok(())
    }

    async fn close(&mut self, ledger: &PieceLedger) {
        if self.state == SessionState::Closed {
            return;
        }
        self.transition(SessionState::Closed);
        self.inflight.clear();
        ledger.release(self.id).await;
        let _ = self.stream.shutdown().await;
    }
}
