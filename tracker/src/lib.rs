//! Tracker announce client.
//!
//! Given a content identifier and the local session identity, asks a tracker
//! for candidate peers. Only HTTP(S) trackers are supported.

use std::net::SocketAddrV4;
use std::time::Duration;
use thiserror::Error;

pub mod http;

pub use http::HttpTracker;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("unsupported tracker url scheme: {0}")]
    UnsupportedScheme(String),

    #[error("invalid tracker url: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("malformed tracker response: {0}")]
    Bencode(#[from] shoal_core::bencoding::BencodeError),

    #[error("tracker response is missing `{0}`")]
    MissingField(&'static str),

    #[error("tracker rejected announce: {0}")]
    Failure(String),
}

#[derive(Debug, Clone)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub compact: bool,
    pub event: Option<AnnounceEvent>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnnounceEvent {
    Started,
    Stopped,
    Completed,
}

impl AnnounceEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            AnnounceEvent::Started => "started",
            AnnounceEvent::Stopped => "stopped",
            AnnounceEvent::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub peers: Vec<SocketAddrV4>,
    pub complete: Option<u32>,   // seeders
    pub incomplete: Option<u32>, // leechers
}

pub trait TrackerClient {
    fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError>;
}

/// Returns a client able to talk to `url`.
pub fn tracker_for(
    url: &str,
    timeout: Duration,
) -> Result<Box<dyn TrackerClient + Send>, TrackerError> {
    let parsed = url::Url::parse(url)?;
    match parsed.scheme() {
        "http" | "https" => Ok(Box::new(HttpTracker::new(url, timeout))),
        other => Err(TrackerError::UnsupportedScheme(other.to_string())),
    }
}
