use super::SessionError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
pub const HANDSHAKE_LEN: usize = 68;

/// The fixed 68-byte greeting both sides send first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn to_bytes(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];
        buf[0] = PROTOCOL.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Parses a handshake. Reserved (extension) bits are kept but not interpreted.
    pub fn parse(buf: &[u8; HANDSHAKE_LEN]) -> Result<Self, SessionError> {
        if buf[0] as usize != PROTOCOL.len() || &buf[1..20] != PROTOCOL {
            return Err(SessionError::InvalidHandshake);
        }
        let mut hs = Handshake::new([0u8; 20], [0u8; 20]);
        hs.reserved.copy_from_slice(&buf[20..28]);
        hs.info_hash.copy_from_slice(&buf[28..48]);
        hs.peer_id.copy_from_slice(&buf[48..68]);
        Ok(hs)
    }
}

/// Sends our handshake and reads the peer's.
///
/// The peer must answer with exactly our info hash; anything else is
/// [`SessionError::InfoHashMismatch`].
pub async fn exchange<S>(stream: &mut S, ours: &Handshake) -> Result<Handshake, SessionError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&ours.to_bytes()).await?;
    stream.flush().await?;

    let mut response = [0u8; HANDSHAKE_LEN];
    stream.read_exact(&mut response).await?;
    let theirs = Handshake::parse(&response)?;
    if theirs.info_hash != ours.info_hash {
        return Err(SessionError::InfoHashMismatch);
    }
    Ok(theirs)
}
