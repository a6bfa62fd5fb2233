//! HTTP Tracker Client implementation.

use super::{AnnounceRequest, AnnounceResponse, TrackerClient, TrackerError};
use shoal_core::bencoding::{Bencode, decode_prefix};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

/// Client for communicating with HTTP/HTTPS trackers.
pub struct HttpTracker {
    url: String,
    timeout: Duration,
}

impl HttpTracker {
    /// Creates a new `HttpTracker`.
    ///
    /// # Arguments
    /// * `url` - The URL of the tracker announce endpoint.
    /// * `timeout` - Upper bound on the whole announce round trip.
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
        }
    }

    /// Builds the full announce URL.
    ///
    /// `info_hash` and `peer_id` are raw bytes and must be percent-encoded
    /// byte-wise rather than as UTF-8 text.
    pub fn announce_url(&self, request: &AnnounceRequest) -> String {
        let info_hash_encoded =
            form_urlencoded::byte_serialize(&request.info_hash).collect::<String>();
        let peer_id_encoded = form_urlencoded::byte_serialize(&request.peer_id).collect::<String>();

        let mut params = form_urlencoded::Serializer::new(String::new());
        params
            .append_pair("port", &request.port.to_string())
            .append_pair("uploaded", &request.uploaded.to_string())
            .append_pair("downloaded", &request.downloaded.to_string())
            .append_pair("left", &request.left.to_string())
            .append_pair("compact", if request.compact { "1" } else { "0" });
        if let Some(event) = request.event {
            params.append_pair("event", event.as_str());
        }

        let separator = if self.url.contains('?') { "&" } else { "?" };
        format!(
            "{}{separator}info_hash={}&peer_id={}&{}",
            self.url,
            info_hash_encoded,
            peer_id_encoded,
            params.finish()
        )
    }
}

impl TrackerClient for HttpTracker {
    /// Sends an announce request to the HTTP tracker.
    ///
    /// This blocks the calling thread; async callers should go through
    /// `spawn_blocking`.
    fn announce(&self, request: &AnnounceRequest) -> Result<AnnounceResponse, TrackerError> {
        let full_url = self.announce_url(request);
        tracing::debug!(url = %self.url, "announcing to tracker");

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()?;
        let bytes = client.get(&full_url).send()?.error_for_status()?.bytes()?;

        parse_announce_response(&bytes)
    }
}

/// Decodes a bencoded announce response body.
pub fn parse_announce_response(body: &[u8]) -> Result<AnnounceResponse, TrackerError> {
    let root = decode_prefix(body)?;
    if root.as_dict().is_none() {
        return Err(TrackerError::MissingField("response dictionary"));
    }

    if let Some(reason) = root.get(b"failure reason").and_then(Bencode::as_str_lossy) {
        return Err(TrackerError::Failure(reason));
    }

    let interval = root
        .get(b"interval")
        .and_then(Bencode::as_int)
        .ok_or(TrackerError::MissingField("interval"))?
        .clamp(0, u32::MAX as i64) as u32;

    let count = |key: &[u8]| {
        root.get(key)
            .and_then(Bencode::as_int)
            .map(|i| i.clamp(0, u32::MAX as i64) as u32)
    };

    let peers = match root.get(b"peers") {
        Some(Bencode::Bytes(compact)) => parse_compact_peers(compact),
        Some(Bencode::List(list)) => list.iter().filter_map(parse_dict_peer).collect(),
        _ => Vec::new(),
    };

    Ok(AnnounceResponse {
        interval,
        peers,
        complete: count(b"complete"),
        incomplete: count(b"incomplete"),
    })
}

/// Decodes 6-byte compact peer records, dropping a trailing partial record.
pub fn parse_compact_peers(bytes: &[u8]) -> Vec<SocketAddrV4> {
    bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddrV4::new(ip, port)
        })
        .collect()
}

fn parse_dict_peer(item: &Bencode) -> Option<SocketAddrV4> {
    let ip: Ipv4Addr = item.get(b"ip")?.as_str_lossy()?.parse().ok()?;
    let port = u16::try_from(item.get(b"port")?.as_int()?).ok()?;
    Some(SocketAddrV4::new(ip, port))
}
