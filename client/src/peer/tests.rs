use super::message::{read_message, write_message};
use super::*;
use crate::bitfield::Bitfield;
use crate::ledger::SessionId;
use crate::test_support::*;
use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

const MAX_FRAME: u32 = 1 << 17;

fn addr() -> SocketAddr {
    "127.0.0.1:6881".parse().unwrap()
}

fn session_over(
    stream: DuplexStream,
    pieces: usize,
    config: SessionConfig,
) -> PeerSession<DuplexStream> {
    PeerSession::new(SessionId(1), addr(), stream, pieces, config)
}

/// Seeder side up to the point where requests may start flowing.
async fn greet_and_unchoke(stream: &mut DuplexStream, pieces: usize) {
    accept_handshake(stream, INFO_HASH).await;
    assert_eq!(
        read_message(stream, MAX_FRAME).await.unwrap(),
        Message::Interested
    );
    let bitfield = Bitfield::full(pieces);
    write_message(
        stream,
        &Message::Bitfield(Bytes::copy_from_slice(bitfield.as_bytes())),
    )
    .await
    .unwrap();
    write_message(stream, &Message::Unchoke).await.unwrap();
}

async fn read_request(stream: &mut DuplexStream) -> (u32, u32, u32) {
    match read_message(stream, MAX_FRAME).await.unwrap() {
        Message::Request {
            index,
            begin,
            length,
        } => (index, begin, length),
        other => panic!("expected a request, got {other:?}"),
    }
}

#[tokio::test]
async fn test_downloads_everything_from_seeder() {
    let data = content(40_000);
    let fx = ledger_for(&data, 16384, 4096, 5).await;
    let (ours, theirs) = tokio::io::duplex(1 << 16);
    let seeder = tokio::spawn(seed(theirs, Arc::new(data.clone()), 16384));

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, fx.ledger.piece_count(), session_config());

    let end = session
        .run(&client_handshake(), &fx.ledger, &events_tx, &mut shutdown)
        .await
        .unwrap();

    assert_eq!(end, SessionEnd::DownloadComplete);
    assert_eq!(session.state(), SessionState::Closed);
    assert_eq!(session.remote_peer_id(), Some(SEEDER_ID));
    assert_eq!(session.stats().pieces_verified, 3);
    assert_eq!(session.stats().bytes_received, 40_000);
    assert_eq!(events_rx.try_recv().unwrap(), SessionEvent::Connected(addr()));
    assert_eq!(events_rx.try_recv().unwrap(), SessionEvent::Unchoked(addr()));
    assert!(session.stats().handshaken);
    assert!(fx.ledger.is_complete());
    assert_eq!(fx.ledger.storage().read(0, 40_000).await.unwrap(), data);

    drop(session);
    seeder.await.unwrap();
}

#[tokio::test]
async fn test_mismatched_info_hash_closes_without_interest() {
    let fx = ledger_for(&content(1000), 1000, 1000, 5).await;
    let (ours, mut theirs) = tokio::io::duplex(4096);
    let peer = tokio::spawn(async move {
        accept_handshake(&mut theirs, [0xEE; 20]).await;
        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let (events_tx, mut events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, 1, session_config());

    let err = session
        .run(&client_handshake(), &fx.ledger, &events_tx, &mut shutdown)
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::InfoHashMismatch));
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.stats().handshaken);
    assert!(!session.stats().reached_unchoked);
    assert!(events_rx.try_recv().is_err());

    drop(session);
    assert!(peer.await.unwrap().is_empty());
}

#[tokio::test]
async fn test_choke_stops_new_requests_but_late_block_counts() {
    let data = content(40_000);
    let fx = ledger_for(&data, 16384, 4096, 3).await;
    let (ours, mut theirs) = tokio::io::duplex(1 << 16);
    let served = data.clone();
    let peer = tokio::spawn(async move {
        greet_and_unchoke(&mut theirs, 3).await;
        let mut requested = Vec::new();
        for _ in 0..3 {
            requested.push(read_request(&mut theirs).await);
        }
        write_message(&mut theirs, &Message::Choke).await.unwrap();

        let (index, begin, length) = requested[0];
        let start = index as usize * 16384 + begin as usize;
        let block = Bytes::copy_from_slice(&served[start..start + length as usize]);
        write_message(
            &mut theirs,
            &Message::Piece {
                index,
                begin,
                block,
            },
        )
        .await
        .unwrap();

        // An oversized frame ends the session.
        theirs.write_all(&u32::MAX.to_be_bytes()).await.unwrap();
        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).await.unwrap();
        (requested, rest)
    });

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, 3, session_config());

    let err = session
        .run(&client_handshake(), &fx.ledger, &events_tx, &mut shutdown)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::FrameTooLarge { .. }));
    assert_eq!(session.stats().blocks_received, 1);
    drop(session);

    let (requested, rest) = peer.await.unwrap();
    assert_eq!(requested, vec![(0, 0, 4096), (0, 4096, 4096), (0, 8192, 4096)]);
    assert!(rest.is_empty(), "no requests may follow a choke");
    assert_eq!(fx.ledger.piece_coverage(0).await.unwrap().covered(), 4096);

    // The abandoned requests went back to the pool.
    let next = fx
        .ledger
        .next_request(SessionId(2), &Bitfield::full(3), 0)
        .await
        .unwrap();
    assert_eq!((next.piece, next.offset), (0, 4096));
}

#[tokio::test]
async fn test_short_piece_payload_is_tolerated() {
    let data = content(4096);
    let fx = ledger_for(&data, 4096, 4096, 1).await;
    let (ours, mut theirs) = tokio::io::duplex(1 << 16);
    let served = data.clone();
    let peer = tokio::spawn(async move {
        greet_and_unchoke(&mut theirs, 1).await;
        let (index, begin, length) = read_request(&mut theirs).await;

        // Declares a piece but carries only the index.
        theirs.write_all(&[0, 0, 0, 5, 7, 0, 0, 0, 0]).await.unwrap();
        write_message(
            &mut theirs,
            &Message::Piece {
                index,
                begin,
                block: Bytes::copy_from_slice(&served[..length as usize]),
            },
        )
        .await
        .unwrap();
        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).await.unwrap();
    });

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, 1, session_config());

    let end = session
        .run(&client_handshake(), &fx.ledger, &events_tx, &mut shutdown)
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::DownloadComplete);
    assert_eq!(session.stats().violations, 1);
    assert_eq!(session.stats().pieces_verified, 1);

    drop(session);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_repeated_invalid_blocks_close_the_session() {
    let fx = ledger_for(&content(4096), 4096, 4096, 1).await;
    let (ours, mut theirs) = tokio::io::duplex(1 << 16);
    let peer = tokio::spawn(async move {
        greet_and_unchoke(&mut theirs, 1).await;
        for _ in 0..3 {
            let bogus = Message::Piece {
                index: 99,
                begin: 0,
                block: Bytes::from_static(b"junk"),
            };
            write_message(&mut theirs, &bogus).await.unwrap();
        }
        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).await.unwrap();
    });

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, 1, session_config());

    let err = session
        .run(&client_handshake(), &fx.ledger, &events_tx, &mut shutdown)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::TooManyViolations(3)));
    assert_eq!(session.stats().blocks_received, 0);
    assert_eq!(
        fx.ledger.piece_state(0).await,
        Some(crate::ledger::PieceState::Missing)
    );

    drop(session);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_shutdown_signal_closes_idle_session() {
    let fx = ledger_for(&content(1000), 1000, 1000, 5).await;
    let (ours, mut theirs) = tokio::io::duplex(4096);
    let peer = tokio::spawn(async move {
        accept_handshake(&mut theirs, INFO_HASH).await;
        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).await.unwrap();
    });

    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, 1, session_config());

    let handshake = client_handshake();
    let (end, _) = tokio::join!(
        session.run(&handshake, &fx.ledger, &events_tx, &mut shutdown),
        async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            shutdown_tx.send(true).unwrap();
        }
    );
    assert_eq!(end.unwrap(), SessionEnd::Shutdown);
    assert_eq!(session.state(), SessionState::Closed);

    drop(session);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_unanswered_requests_stall() {
    let fx = ledger_for(&content(4096), 4096, 1024, 2).await;
    let (ours, mut theirs) = tokio::io::duplex(1 << 16);
    let peer = tokio::spawn(async move {
        greet_and_unchoke(&mut theirs, 1).await;
        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).await.unwrap();
    });

    let config = SessionConfig {
        read_timeout: Duration::from_millis(200),
        ..session_config()
    };
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, 1, config);

    let err = session
        .run(&client_handshake(), &fx.ledger, &events_tx, &mut shutdown)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Stalled));
    assert!(session.inflight().is_empty());

    drop(session);
    peer.await.unwrap();
    assert_eq!(
        fx.ledger.piece_state(0).await,
        Some(crate::ledger::PieceState::Missing)
    );
}

#[tokio::test]
async fn test_released_reservation_is_picked_up_by_idle_session() {
    let data = content(1000);
    let fx = ledger_for(&data, 1000, 1000, 5).await;
    let other = SessionId(99);
    assert!(
        fx.ledger
            .next_request(other, &Bitfield::full(1), 0)
            .await
            .is_some()
    );

    let (ours, theirs) = tokio::io::duplex(1 << 16);
    let seeder = tokio::spawn(seed(theirs, Arc::new(data.clone()), 1000));
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, 1, session_config());

    let handshake = client_handshake();
    let (end, _) = tokio::join!(
        session.run(&handshake, &fx.ledger, &events_tx, &mut shutdown),
        async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            fx.ledger.release(other).await;
        }
    );
    assert_eq!(end.unwrap(), SessionEnd::DownloadComplete);
    assert_eq!(session.stats().pieces_verified, 1);
    assert!(fx.ledger.is_complete());

    drop(session);
    seeder.await.unwrap();
}

#[tokio::test]
async fn test_idle_unchoked_session_keeps_the_connection_alive() {
    let data = content(1000);
    let fx = ledger_for(&data, 1000, 1000, 5).await;
    let other = SessionId(99);
    assert!(
        fx.ledger
            .next_request(other, &Bitfield::full(1), 0)
            .await
            .is_some()
    );

    let (ours, mut theirs) = tokio::io::duplex(1 << 16);
    let ledger = fx.ledger.clone();
    let served = data.clone();
    let peer = tokio::spawn(async move {
        greet_and_unchoke(&mut theirs, 1).await;
        // Several read timeouts pass in silence; the session only pings.
        for _ in 0..3 {
            assert_eq!(
                read_message(&mut theirs, MAX_FRAME).await.unwrap(),
                Message::KeepAlive
            );
        }
        ledger.release(other).await;

        let (index, begin, length) = read_request(&mut theirs).await;
        assert_eq!((index, begin, length), (0, 0, 1000));
        write_message(
            &mut theirs,
            &Message::Piece {
                index,
                begin,
                block: Bytes::copy_from_slice(&served),
            },
        )
        .await
        .unwrap();
        theirs
    });

    let config = SessionConfig {
        read_timeout: Duration::from_millis(50),
        ..session_config()
    };
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, 1, config);

    let end = session
        .run(&client_handshake(), &fx.ledger, &events_tx, &mut shutdown)
        .await
        .unwrap();
    assert_eq!(end, SessionEnd::DownloadComplete);
    assert!(fx.ledger.is_complete());

    drop(session);
    peer.await.unwrap();
}

#[tokio::test]
async fn test_silent_peer_without_needed_pieces_times_out() {
    let data = content(1000);
    let fx = ledger_for(&data, 1000, 1000, 5).await;
    let (ours, mut theirs) = tokio::io::duplex(1 << 16);
    let peer = tokio::spawn(async move {
        accept_handshake(&mut theirs, INFO_HASH).await;
        assert_eq!(
            read_message(&mut theirs, MAX_FRAME).await.unwrap(),
            Message::Interested
        );
        // Unchokes but advertises nothing.
        write_message(&mut theirs, &Message::Unchoke).await.unwrap();
        let mut rest = Vec::new();
        theirs.read_to_end(&mut rest).await.unwrap();
        rest
    });

    let config = SessionConfig {
        read_timeout: Duration::from_millis(100),
        ..session_config()
    };
    let (events_tx, _events_rx) = mpsc::unbounded_channel();
    let (_shutdown_tx, mut shutdown) = watch::channel(false);
    let mut session = session_over(ours, 1, config);

    let err = session
        .run(&client_handshake(), &fx.ledger, &events_tx, &mut shutdown)
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout("read")));
    assert!(session.stats().reached_unchoked);

    drop(session);
    assert!(peer.await.unwrap().is_empty());
}
