//! Fixtures shared by unit tests: in-memory torrents, ledgers over temp
//! directories, and a scripted seeder speaking the wire protocol.

use crate::bitfield::Bitfield;
use crate::ledger::PieceLedger;
use crate::peer::handshake::HANDSHAKE_LEN;
use crate::peer::message::{read_message, write_message};
use crate::peer::{Handshake, Message, SessionConfig};
use crate::storage::{Storage, StorageWriter};
use bytes::Bytes;
use sha1::{Digest, Sha1};
use shoal_core::Torrent;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const INFO_HASH: [u8; 20] = [0x5A; 20];
pub const SEEDER_ID: [u8; 20] = *b"-SEED01-000000000000";
pub const CLIENT_ID: [u8; 20] = *b"-SH0001-test00000000";

/// Deterministic, non-repeating test content.
pub fn content(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i * 31 % 251) as u8).collect()
}

pub fn torrent_for(content: &[u8], piece_length: u64) -> Torrent {
    Torrent {
        announce: "http://tracker.invalid/announce".to_string(),
        announce_list: None,
        info_hash: INFO_HASH,
        piece_length,
        pieces: content
            .chunks(piece_length as usize)
            .map(|chunk| Sha1::digest(chunk).into())
            .collect(),
        name: "payload.bin".to_string(),
        length: Some(content.len() as u64),
        files: None,
    }
}

pub struct LedgerFixture {
    pub _dir: TempDir,
    pub torrent: Torrent,
    pub ledger: Arc<PieceLedger>,
}

pub async fn ledger_for(
    content: &[u8],
    piece_length: u64,
    block_size: u32,
    pipeline_depth: usize,
) -> LedgerFixture {
    let dir = tempfile::tempdir().unwrap();
    let torrent = torrent_for(content, piece_length);
    let storage = Storage::new(Some(dir.path().to_path_buf())).await.unwrap();
    let writer = StorageWriter::initialize(&storage, &torrent.files())
        .await
        .unwrap();
    let ledger = PieceLedger::new(&torrent, Arc::new(writer), block_size, pipeline_depth).unwrap();
    LedgerFixture {
        _dir: dir,
        torrent,
        ledger: Arc::new(ledger),
    }
}

pub fn session_config() -> SessionConfig {
    SessionConfig {
        connect_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        read_timeout: Duration::from_secs(5),
        max_violations: 3,
        max_frame_len: 1 << 17,
    }
}

pub fn client_handshake() -> Handshake {
    Handshake::new(INFO_HASH, CLIENT_ID)
}

/// Reads the client's handshake and answers with `info_hash`.
pub async fn accept_handshake<S>(stream: &mut S, info_hash: [u8; 20]) -> Handshake
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut buf).await.unwrap();
    let theirs = Handshake::parse(&buf).unwrap();
    stream
        .write_all(&Handshake::new(info_hash, SEEDER_ID).to_bytes())
        .await
        .unwrap();
    theirs
}

/// Serves `content` to one client until it hangs up.
pub async fn seed<S>(mut stream: S, content: Arc<Vec<u8>>, piece_length: u64)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    accept_handshake(&mut stream, INFO_HASH).await;
    let pieces = content.len().div_ceil(piece_length as usize);
    let bitfield = Bitfield::full(pieces);
    write_message(
        &mut stream,
        &Message::Bitfield(Bytes::copy_from_slice(bitfield.as_bytes())),
    )
    .await
    .unwrap();
    write_message(&mut stream, &Message::Unchoke).await.unwrap();

    while let Ok(msg) = read_message(&mut stream, 1 << 17).await {
        if let Message::Request {
            index,
            begin,
            length,
        } = msg
        {
            let start = index as usize * piece_length as usize + begin as usize;
            let block = Bytes::copy_from_slice(&content[start..start + length as usize]);
            let reply = Message::Piece {
                index,
                begin,
                block,
            };
            if write_message(&mut stream, &reply).await.is_err() {
                break;
            }
        }
    }
}
