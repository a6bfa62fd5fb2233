use crate::logging::CliLogLevel;
use crate::peer_selection::Preference;
use clap::Parser;
use std::net::SocketAddrV4;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Downloads a torrent from its swarm", long_about = None)]
pub struct Args {
    /// Path to the torrent file
    #[arg(short, long)]
    pub torrent: PathBuf,

    /// Output directory for downloaded files
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Connect to this peer instead of asking the tracker (repeatable)
    #[arg(short, long = "peer", value_name = "IP:PORT")]
    pub peers: Vec<SocketAddrV4>,

    /// Maximum number of simultaneous peer connections
    #[arg(long)]
    pub max_peers: Option<usize>,

    /// How to order tracker candidates before connecting
    #[arg(long, value_enum, default_value_t = Preference::Tracker)]
    pub prefer: Preference,

    /// Console log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value_t = CliLogLevel::Info)]
    pub log_level: CliLogLevel,

    /// Skip re-verifying data already on disk
    #[arg(long)]
    pub no_recheck: bool,
}
