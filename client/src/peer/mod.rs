//! The peer wire protocol: handshake, framing, and per-connection sessions.

mod error;
pub mod handshake;
pub mod message;
mod session;
#[cfg(test)]
mod tests;

pub use error::SessionError;
pub use handshake::Handshake;
pub use message::Message;
pub use session::{
    PeerSession, SessionConfig, SessionEnd, SessionEvent, SessionState, SessionStats,
};
