//! The piece ledger: the single source of truth for what has been downloaded.
//!
//! Every piece lives in its own slot behind its own lock. Reporting a block
//! takes that lock for the whole read-coverage / write / verify sequence, so
//! concurrent reports for the same piece are serialized while different
//! pieces proceed independently.

mod coverage;

pub use coverage::Coverage;

use crate::bitfield::Bitfield;
use crate::storage::{StorageError, StorageWriter};
use sha1::{Digest, Sha1};
use shoal_core::{MetainfoError, Torrent};
use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use thiserror::Error;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify};

/// Identifies the session that reserved a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    Missing,
    InProgress,
    Verified,
}

/// A block request: `length` bytes at `offset` within piece `piece`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Block {
    pub piece: u32,
    pub offset: u32,
    pub length: u32,
}

impl Block {
    pub fn range(&self) -> Range<u32> {
        self.offset..self.offset + self.length
    }
}

/// What happened to a piece after a block was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceOutcome {
    /// The block was recorded (or was a duplicate); the piece is not done yet.
    Accepted,
    /// The piece is now fully covered and its digest matched.
    PieceVerified,
    /// The piece was fully covered but its digest did not match. It has been
    /// reset to `Missing` and will be requested again.
    PieceCorrupt,
}

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("piece index {index} out of range ({count} pieces)")]
    UnknownPiece { index: u32, count: usize },

    #[error("offset {offset} outside piece {index} of length {piece_len}")]
    OffsetOutOfRange {
        index: u32,
        offset: u32,
        piece_len: u32,
    },

    #[error("block of {len} bytes at offset {offset} overruns piece {index} of length {piece_len}")]
    BlockOverrun {
        index: u32,
        offset: u32,
        len: usize,
        piece_len: u32,
    },

    #[error("empty block for piece {index} at offset {offset}")]
    EmptyBlock { index: u32, offset: u32 },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl LedgerError {
    /// Storage failures are fatal; everything else is a rejected block.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LedgerError::Storage(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LedgerProgress {
    pub verified_pieces: usize,
    pub total_pieces: usize,
    pub verified_bytes: u64,
    pub total_bytes: u64,
}

impl LedgerProgress {
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        self.verified_bytes as f64 * 100.0 / self.total_bytes as f64
    }
}

#[derive(Debug)]
struct Reservation {
    range: Range<u32>,
    session: SessionId,
}

#[derive(Debug)]
struct PieceSlot {
    hash: [u8; 20],
    length: u32,
    state: PieceState,
    coverage: Coverage,
    reservations: Vec<Reservation>,
}

impl PieceSlot {
    /// First range that is neither received nor reserved by any session.
    fn first_free(&self) -> Option<Range<u32>> {
        let mut busy = self.coverage.clone();
        for r in &self.reservations {
            busy.insert(r.range.clone());
        }
        busy.first_gap(self.length)
    }

    fn settle_idle_state(&mut self) {
        if self.state == PieceState::InProgress
            && self.coverage.is_empty()
            && self.reservations.is_empty()
        {
            self.state = PieceState::Missing;
        }
    }

    fn reset(&mut self) {
        self.coverage.clear();
        self.reservations.clear();
        self.state = PieceState::Missing;
    }
}

pub struct PieceLedger {
    pieces: Vec<Mutex<PieceSlot>>,
    piece_length: u64,
    total_length: u64,
    block_size: u32,
    pipeline_depth: usize,
    storage: Arc<StorageWriter>,
    verified_pieces: AtomicUsize,
    verified_bytes: AtomicU64,
    /// Fired whenever reserved or received ranges go back to the pool.
    work_released: Notify,
}

impl PieceLedger {
    /// Builds a ledger with every piece `Missing`.
    ///
    /// # Arguments
    ///
    /// * `torrent` - A validated descriptor.
    /// * `storage` - The writer the ledger persists blocks through.
    /// * `block_size` - Upper bound on a single request.
    /// * `pipeline_depth` - Maximum outstanding requests per session.
    pub fn new(
        torrent: &Torrent,
        storage: Arc<StorageWriter>,
        block_size: u32,
        pipeline_depth: usize,
    ) -> Result<Self, MetainfoError> {
        torrent.validate()?;
        if u32::try_from(torrent.piece_length).is_err() {
            return Err(MetainfoError::Field("piece length"));
        }
        if storage.total_length() != torrent.total_length() {
            return Err(MetainfoError::Field("length"));
        }

        let pieces = torrent
            .pieces
            .iter()
            .enumerate()
            .map(|(i, hash)| {
                Mutex::new(PieceSlot {
                    hash: *hash,
                    length: torrent.piece_size(i) as u32,
                    state: PieceState::Missing,
                    coverage: Coverage::new(),
                    reservations: Vec::new(),
                })
            })
            .collect();

        Ok(Self {
            pieces,
            piece_length: torrent.piece_length,
            total_length: torrent.total_length(),
            block_size: block_size.max(1),
            pipeline_depth,
            storage,
            verified_pieces: AtomicUsize::new(0),
            verified_bytes: AtomicU64::new(0),
            work_released: Notify::new(),
        })
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    pub fn storage(&self) -> &Arc<StorageWriter> {
        &self.storage
    }

    fn piece_start(&self, index: usize) -> u64 {
        index as u64 * self.piece_length
    }

    /// Picks the next block `session` should request, and reserves it.
    ///
    /// Pieces are scanned in ascending order. Verified pieces and pieces the
    /// peer does not advertise are skipped; within the first eligible piece the
    /// first range that is neither received nor reserved is returned, clipped
    /// to the block size. Returns `None` once the session already has
    /// `pipeline_depth` requests outstanding.
    pub async fn next_request(
        &self,
        session: SessionId,
        peer_bitfield: &Bitfield,
        peer_inflight: usize,
    ) -> Option<Block> {
        if peer_inflight >= self.pipeline_depth {
            return None;
        }

        for (index, slot) in self.pieces.iter().enumerate() {
            if !peer_bitfield.has(index) {
                continue;
            }
            let mut slot = slot.lock().await;
            if slot.state == PieceState::Verified {
                continue;
            }
            let Some(free) = slot.first_free() else {
                continue;
            };

            let end = free.end.min(free.start.saturating_add(self.block_size));
            let block = Block {
                piece: index as u32,
                offset: free.start,
                length: end - free.start,
            };
            slot.reservations.push(Reservation {
                range: block.range(),
                session,
            });
            slot.state = PieceState::InProgress;
            return Some(block);
        }
        None
    }

    /// Records a received block, persists it, and verifies the piece once it
    /// is fully covered.
    ///
    /// Duplicate ranges and blocks for already verified pieces are accepted
    /// without touching the disk. Malformed blocks are rejected with a
    /// validation error and leave the ledger unchanged.
    pub async fn on_block_received(
        &self,
        piece_index: u32,
        offset: u32,
        data: &[u8],
    ) -> Result<PieceOutcome, LedgerError> {
        let index = piece_index as usize;
        let slot = self.pieces.get(index).ok_or(LedgerError::UnknownPiece {
            index: piece_index,
            count: self.pieces.len(),
        })?;
        let mut guard = slot.lock().await;
        let slot = &mut *guard;

        if offset >= slot.length {
            return Err(LedgerError::OffsetOutOfRange {
                index: piece_index,
                offset,
                piece_len: slot.length,
            });
        }
        if data.is_empty() {
            return Err(LedgerError::EmptyBlock {
                index: piece_index,
                offset,
            });
        }
        if data.len() > (slot.length - offset) as usize {
            return Err(LedgerError::BlockOverrun {
                index: piece_index,
                offset,
                len: data.len(),
                piece_len: slot.length,
            });
        }

        if slot.state == PieceState::Verified {
            return Ok(PieceOutcome::Accepted);
        }

        let range = offset..offset + data.len() as u32;
        if !slot.coverage.contains(&range) {
            self.storage
                .write(self.piece_start(index) + offset as u64, data)
                .await?;
            slot.coverage.insert(range);
            slot.state = PieceState::InProgress;
        }
        let coverage = &slot.coverage;
        slot.reservations.retain(|r| !coverage.contains(&r.range));

        if !slot.coverage.is_complete(slot.length) {
            return Ok(PieceOutcome::Accepted);
        }

        let stored = self
            .storage
            .read(self.piece_start(index), slot.length as usize)
            .await?;
        if Sha1::digest(&stored)[..] == slot.hash[..] {
            slot.state = PieceState::Verified;
            slot.reservations.clear();
            self.verified_pieces.fetch_add(1, Ordering::AcqRel);
            self.verified_bytes
                .fetch_add(slot.length as u64, Ordering::AcqRel);
            tracing::debug!(piece = piece_index, "piece verified");
            Ok(PieceOutcome::PieceVerified)
        } else {
            slot.reset();
            self.work_released.notify_waiters();
            tracing::warn!(piece = piece_index, "piece failed hash check, re-queued");
            Ok(PieceOutcome::PieceCorrupt)
        }
    }

    /// Drops every reservation held by `session`.
    pub async fn release(&self, session: SessionId) {
        let mut released = false;
        for slot in &self.pieces {
            let mut slot = slot.lock().await;
            if slot.reservations.iter().any(|r| r.session == session) {
                slot.reservations.retain(|r| r.session != session);
                slot.settle_idle_state();
                released = true;
            }
        }
        if released {
            self.work_released.notify_waiters();
        }
    }

    /// Resolves the next time ranges are handed back by [`release`] or by a
    /// corrupt piece being reset.
    ///
    /// Releases that happen after this is called and before it is first
    /// polled are not missed.
    ///
    /// [`release`]: PieceLedger::release
    pub fn work_released(&self) -> Notified<'_> {
        self.work_released.notified()
    }

    /// True if `peer_bitfield` holds any piece that is not yet verified,
    /// whether or not its ranges are currently free.
    pub async fn has_work_for(&self, peer_bitfield: &Bitfield) -> bool {
        for (index, slot) in self.pieces.iter().enumerate() {
            if peer_bitfield.has(index) && slot.lock().await.state != PieceState::Verified {
                return true;
            }
        }
        false
    }

    /// Re-verifies bytes already on disk, marking matching pieces `Verified`.
    ///
    /// Returns how many pieces were newly verified.
    pub async fn recheck(&self) -> Result<usize, StorageError> {
        let mut found = 0;
        for (index, slot) in self.pieces.iter().enumerate() {
            let mut slot = slot.lock().await;
            if slot.state == PieceState::Verified {
                continue;
            }
            let stored = self
                .storage
                .read(self.piece_start(index), slot.length as usize)
                .await?;
            if Sha1::digest(&stored)[..] == slot.hash[..] {
                let length = slot.length;
                slot.coverage.clear();
                slot.coverage.insert(0..length);
                slot.reservations.clear();
                slot.state = PieceState::Verified;
                self.verified_pieces.fetch_add(1, Ordering::AcqRel);
                self.verified_bytes
                    .fetch_add(length as u64, Ordering::AcqRel);
                found += 1;
            }
        }
        Ok(found)
    }

    pub async fn piece_state(&self, index: usize) -> Option<PieceState> {
        Some(self.pieces.get(index)?.lock().await.state)
    }

    /// Bytes of piece `index` received so far (verified pieces count in full).
    pub async fn piece_coverage(&self, index: usize) -> Option<Coverage> {
        Some(self.pieces.get(index)?.lock().await.coverage.clone())
    }

    /// Our own availability, for advertising to peers.
    pub async fn verified_bitfield(&self) -> Bitfield {
        let mut bf = Bitfield::new(self.pieces.len());
        for (index, slot) in self.pieces.iter().enumerate() {
            if slot.lock().await.state == PieceState::Verified {
                bf.set(index);
            }
        }
        bf
    }

    /// True iff every piece is `Verified`.
    pub fn is_complete(&self) -> bool {
        self.verified_pieces.load(Ordering::Acquire) == self.pieces.len()
    }

    pub fn progress(&self) -> LedgerProgress {
        LedgerProgress {
            verified_pieces: self.verified_pieces.load(Ordering::Acquire),
            total_pieces: self.pieces.len(),
            verified_bytes: self.verified_bytes.load(Ordering::Acquire),
            total_bytes: self.total_length,
        }
    }
}
