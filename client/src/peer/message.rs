//! Length-prefixed wire messages.
//!
//! Every message after the handshake is a 4-byte big-endian length followed
//! by that many bytes: a 1-byte id and an id-specific payload. A zero length
//! is a keep-alive.

use super::SessionError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const CHOKE: u8 = 0;
pub const UNCHOKE: u8 = 1;
pub const INTERESTED: u8 = 2;
pub const NOT_INTERESTED: u8 = 3;
pub const HAVE: u8 = 4;
pub const BITFIELD: u8 = 5;
pub const REQUEST: u8 = 6;
pub const PIECE: u8 = 7;
pub const CANCEL: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(u32),
    Bitfield(Bytes),
    Request {
        index: u32,
        begin: u32,
        length: u32,
    },
    Piece {
        index: u32,
        begin: u32,
        block: Bytes,
    },
    Cancel {
        index: u32,
        begin: u32,
        length: u32,
    },
    /// An id this client does not understand; its payload was skipped.
    Unknown { id: u8 },
}

impl Message {
    pub fn id(&self) -> Option<u8> {
        match self {
            Message::KeepAlive => None,
            Message::Choke => Some(CHOKE),
            Message::Unchoke => Some(UNCHOKE),
            Message::Interested => Some(INTERESTED),
            Message::NotInterested => Some(NOT_INTERESTED),
            Message::Have(_) => Some(HAVE),
            Message::Bitfield(_) => Some(BITFIELD),
            Message::Request { .. } => Some(REQUEST),
            Message::Piece { .. } => Some(PIECE),
            Message::Cancel { .. } => Some(CANCEL),
            Message::Unknown { id } => Some(*id),
        }
    }

    /// Appends the framed message to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let payload_len = match self {
            Message::KeepAlive => {
                buf.put_u32(0);
                return;
            }
            Message::Have(_) => 4,
            Message::Bitfield(bits) => bits.len(),
            Message::Request { .. } | Message::Cancel { .. } => 12,
            Message::Piece { block, .. } => 8 + block.len(),
            _ => 0,
        };
        buf.reserve(5 + payload_len);
        buf.put_u32(1 + payload_len as u32);
        if let Some(id) = self.id() {
            buf.put_u8(id);
        }

        match self {
            Message::Have(index) => buf.put_u32(*index),
            Message::Bitfield(bits) => buf.put_slice(bits),
            Message::Request {
                index,
                begin,
                length,
            }
            | Message::Cancel {
                index,
                begin,
                length,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_u32(*length);
            }
            Message::Piece {
                index,
                begin,
                block,
            } => {
                buf.put_u32(*index);
                buf.put_u32(*begin);
                buf.put_slice(block);
            }
            _ => {}
        }
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Decodes the body of a frame whose id byte has already been split off.
    ///
    /// A payload with the wrong size for its id is reported as
    /// [`SessionError::Malformed`]; the frame has been fully consumed by then,
    /// so the stream is still usable.
    pub fn decode(id: u8, mut payload: Bytes) -> Result<Message, SessionError> {
        let expect_len = |want: usize, reason| {
            if payload.len() == want {
                Ok(())
            } else {
                Err(SessionError::Malformed { id, reason })
            }
        };

        let msg = match id {
            CHOKE => {
                expect_len(0, "choke carries no payload")?;
                Message::Choke
            }
            UNCHOKE => {
                expect_len(0, "unchoke carries no payload")?;
                Message::Unchoke
            }
            INTERESTED => {
                expect_len(0, "interested carries no payload")?;
                Message::Interested
            }
            NOT_INTERESTED => {
                expect_len(0, "not-interested carries no payload")?;
                Message::NotInterested
            }
            HAVE => {
                expect_len(4, "have must be 4 bytes")?;
                Message::Have(payload.get_u32())
            }
            BITFIELD => Message::Bitfield(payload),
            REQUEST | CANCEL => {
                expect_len(12, "request/cancel must be 12 bytes")?;
                let (index, begin, length) =
                    (payload.get_u32(), payload.get_u32(), payload.get_u32());
                if id == REQUEST {
                    Message::Request {
                        index,
                        begin,
                        length,
                    }
                } else {
                    Message::Cancel {
                        index,
                        begin,
                        length,
                    }
                }
            }
            PIECE => {
                if payload.len() < 8 {
                    return Err(SessionError::Malformed {
                        id,
                        reason: "piece shorter than its header",
                    });
                }
                let index = payload.get_u32();
                let begin = payload.get_u32();
                Message::Piece {
                    index,
                    begin,
                    block: payload,
                }
            }
            other => Message::Unknown { id: other },
        };
        Ok(msg)
    }
}

/// Reads one framed message.
///
/// Frames longer than `max_frame_len` are refused before any payload is
/// buffered.
pub async fn read_message<R>(reader: &mut R, max_frame_len: u32) -> Result<Message, SessionError>
where
    R: AsyncRead + Unpin,
{
    let len = reader.read_u32().await?;
    if len == 0 {
        return Ok(Message::KeepAlive);
    }
    if len > max_frame_len {
        return Err(SessionError::FrameTooLarge {
            len,
            max: max_frame_len,
        });
    }

    let mut frame = BytesMut::zeroed(len as usize);
    reader.read_exact(&mut frame).await?;
    let mut frame = frame.freeze();
    let id = frame.get_u8();
    Message::decode(id, frame)
}

pub async fn write_message<W>(writer: &mut W, msg: &Message) -> Result<(), SessionError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&msg.to_bytes()).await?;
    writer.flush().await?;
    Ok(())
}
