//! A BitTorrent download client.
//!
//! The [`ledger`] decides what to fetch and verifies it, [`peer`] sessions
//! speak the wire protocol, [`storage`] places bytes on disk, and the
//! [`downloader`] supervises them all.

pub mod bitfield;
pub mod cli;
pub mod config;
pub mod downloader;
pub mod ledger;
pub mod logging;
pub mod peer;
pub mod peer_selection;
pub mod storage;

#[cfg(test)]
mod test_support;

pub use config::DownloadConfig;
pub use downloader::{DownloadError, DownloadReport, DownloadStatus, Downloader, PeerCounts};
