//! Tunables for a download.
//!
//! Defaults suit a desktop client on an ordinary connection; every field can
//! be overridden through a `SHOAL_*` environment variable.

use crate::peer::SessionConfig;
use std::str::FromStr;
use std::time::Duration;

/// The conventional block size; peers commonly refuse anything larger.
pub const DEFAULT_BLOCK_SIZE: u32 = 16 * 1024;

/// Largest frame accepted from a peer. Covers any sane bitfield as well as a
/// full block plus its header.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 1 << 20;

/// Bytes a piece message spends on its id, index and offset.
const PIECE_HEADER_LEN: u32 = 9;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    pub block_size: u32,
    /// Outstanding requests allowed per session.
    pub pipeline_depth: usize,
    pub connect_timeout: Duration,
    pub handshake_timeout: Duration,
    pub read_timeout: Duration,
    /// How long to wait for the first unchoke before giving up on the swarm.
    pub connection_phase_timeout: Duration,
    pub poll_interval: Duration,
    /// Time sessions get to close on their own before being aborted.
    pub shutdown_grace: Duration,
    pub max_peers: usize,
    pub max_violations: u32,
    pub max_frame_len: u32,
    /// Port reported to the tracker. Nothing listens on it.
    pub listen_port: u16,
    /// Re-verify existing bytes on disk before downloading.
    pub recheck: bool,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            pipeline_depth: 5,
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            connection_phase_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(2),
            max_peers: 25,
            max_violations: 3,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            listen_port: 6881,
            recheck: true,
        }
    }
}

impl DownloadConfig {
    /// Defaults with `SHOAL_*` environment overrides applied.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults with overrides taken from `lookup`. Unparsable values are
    /// logged and ignored.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        override_with(&lookup, "SHOAL_BLOCK_SIZE", &mut config.block_size);
        override_with(&lookup, "SHOAL_PIPELINE_DEPTH", &mut config.pipeline_depth);
        override_secs(&lookup, "SHOAL_CONNECT_TIMEOUT", &mut config.connect_timeout);
        override_secs(&lookup, "SHOAL_HANDSHAKE_TIMEOUT", &mut config.handshake_timeout);
        override_secs(&lookup, "SHOAL_READ_TIMEOUT", &mut config.read_timeout);
        override_secs(
            &lookup,
            "SHOAL_CONNECTION_PHASE_TIMEOUT",
            &mut config.connection_phase_timeout,
        );
        override_with(&lookup, "SHOAL_MAX_PEERS", &mut config.max_peers);
        override_with(&lookup, "SHOAL_MAX_VIOLATIONS", &mut config.max_violations);
        override_with(&lookup, "SHOAL_MAX_FRAME_LEN", &mut config.max_frame_len);
        override_with(&lookup, "SHOAL_LISTEN_PORT", &mut config.listen_port);
        override_with(&lookup, "SHOAL_RECHECK", &mut config.recheck);

        // A requested block must fit in a frame we are willing to read.
        config.max_frame_len = config.max_frame_len.max(PIECE_HEADER_LEN + 1);
        let largest_block = DEFAULT_BLOCK_SIZE.min(config.max_frame_len - PIECE_HEADER_LEN);
        config.block_size = config.block_size.clamp(1, largest_block);
        config.pipeline_depth = config.pipeline_depth.max(1);
        config.max_violations = config.max_violations.max(1);
        config
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            connect_timeout: self.connect_timeout,
            handshake_timeout: self.handshake_timeout,
            read_timeout: self.read_timeout,
            max_violations: self.max_violations,
            max_frame_len: self.max_frame_len,
        }
    }
}

fn override_with<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *slot = value,
        Err(_) => tracing::warn!(key, value = %raw, "ignoring invalid config override"),
    }
}

fn override_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut Duration) {
    let mut secs = slot.as_secs();
    override_with(lookup, key, &mut secs);
    *slot = Duration::from_secs(secs);
}
