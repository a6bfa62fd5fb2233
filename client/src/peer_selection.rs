//! Ordering of tracker-supplied candidates before connecting.
//!
//! The tracker list is advisory. A prioritizer only decides which candidates
//! get the limited connection slots first; it never affects the protocol.

use std::collections::HashSet;
use std::net::SocketAddrV4;

/// Ports commonly used by BitTorrent clients.
pub const WELL_KNOWN_PORTS: &[u16] = &[6881, 6882, 6883, 6884, 6885, 6886, 6887, 6888, 6889, 51413];

/// First octets of address blocks dominated by hosting providers.
pub const HOSTING_FIRST_OCTETS: &[u8] = &[
    2, 5, 8, 9, 37, 45, 46, 47, 77, 78, 79, 80, 81, 82, 83, 84, 85, 86, 87, 88, 89, 93, 94, 95,
];

pub trait PeerPrioritizer {
    /// Returns at most `max` distinct candidates, best first.
    fn prioritize(&self, candidates: &[SocketAddrV4], max: usize) -> Vec<SocketAddrV4>;
}

fn dedup(candidates: &[SocketAddrV4]) -> Vec<SocketAddrV4> {
    let mut seen = HashSet::new();
    candidates
        .iter()
        .copied()
        .filter(|addr| seen.insert(*addr))
        .collect()
}

/// Keeps the tracker's order.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrackerOrder;

impl PeerPrioritizer for TrackerOrder {
    fn prioritize(&self, candidates: &[SocketAddrV4], max: usize) -> Vec<SocketAddrV4> {
        let mut out = dedup(candidates);
        out.truncate(max);
        out
    }
}

/// Moves candidates listening on [`WELL_KNOWN_PORTS`] to the front.
#[derive(Debug, Default, Clone, Copy)]
pub struct PreferredPorts;

impl PeerPrioritizer for PreferredPorts {
    fn prioritize(&self, candidates: &[SocketAddrV4], max: usize) -> Vec<SocketAddrV4> {
        let (mut preferred, rest): (Vec<_>, Vec<_>) = dedup(candidates)
            .into_iter()
            .partition(|addr| WELL_KNOWN_PORTS.contains(&addr.port()));
        preferred.extend(rest);
        preferred.truncate(max);
        preferred
    }
}

/// Reserves a share of the slots for candidates in preferred address blocks.
#[derive(Debug, Clone)]
pub struct PreferredPrefixes {
    first_octets: Vec<u8>,
    share: f64,
}

impl Default for PreferredPrefixes {
    fn default() -> Self {
        Self::new(HOSTING_FIRST_OCTETS.to_vec(), 0.8)
    }
}

impl PreferredPrefixes {
    /// `share` is clamped to `0.0..=1.0`.
    pub fn new(first_octets: Vec<u8>, share: f64) -> Self {
        Self {
            first_octets,
            share: share.clamp(0.0, 1.0),
        }
    }

    fn is_preferred(&self, addr: &SocketAddrV4) -> bool {
        self.first_octets.contains(&addr.ip().octets()[0])
    }
}

impl PeerPrioritizer for PreferredPrefixes {
    fn prioritize(&self, candidates: &[SocketAddrV4], max: usize) -> Vec<SocketAddrV4> {
        let (preferred, regular): (Vec<_>, Vec<_>) = dedup(candidates)
            .into_iter()
            .partition(|addr| self.is_preferred(addr));

        let preferred_slots = ((max as f64 * self.share) as usize).min(preferred.len());
        let regular_slots = (max - preferred_slots).min(regular.len());

        let mut out: Vec<SocketAddrV4> = preferred[..preferred_slots]
            .iter()
            .chain(&regular[..regular_slots])
            .copied()
            .collect();

        // Unused slots go back to whichever class still has candidates.
        let leftovers = preferred[preferred_slots..]
            .iter()
            .chain(&regular[regular_slots..])
            .copied();
        out.extend(leftovers.take(max - out.len()));
        out
    }
}

/// The `--prefer` choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum Preference {
    #[default]
    Tracker,
    Ports,
    Prefixes,
}

impl Preference {
    pub fn prioritizer(self) -> Box<dyn PeerPrioritizer + Send + Sync> {
        match self {
            Preference::Tracker => Box::new(TrackerOrder),
            Preference::Ports => Box::new(PreferredPorts),
            Preference::Prefixes => Box::new(PreferredPrefixes::default()),
        }
    }
}
