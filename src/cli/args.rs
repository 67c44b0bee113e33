//! CLI arguments module
//!
//! Defines command-line argument parsing using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// CLI arguments for the BitTorrent client
#[derive(Debug, Parser)]
#[command(name = "btclient", version)]
#[command(about = "A BitTorrent client with HTTP and UDP tracker support", long_about = None)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Command,

    /// Verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Quiet mode (no output except errors)
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Download (and then seed) the content of a .torrent file
    Download(DownloadArgs),
    /// Create a .torrent file from a local file or directory
    Create(CreateArgs),
}

#[derive(Debug, Clone, Args)]
pub struct DownloadArgs {
    /// Path to the .torrent file
    #[arg(value_name = "TORRENT_FILE")]
    pub torrent_file: PathBuf,

    /// Download directory
    #[arg(short, long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Listening port for incoming connections (0 picks a free one)
    #[arg(short, long, default_value_t = 6881)]
    pub port: u16,

    /// Maximum number of peer connections
    #[arg(short, long, default_value_t = 50)]
    pub max_connections: usize,

    /// Download pieces in order for playback
    #[arg(long)]
    pub streaming: bool,

    /// Keep seeding after the download completes
    #[arg(long)]
    pub seed: bool,

    /// Seed time in minutes (0 = until interrupted)
    #[arg(long, default_value_t = 0)]
    pub seed_time: u64,

    /// Directory holding resume state
    #[arg(long, value_name = "DIR")]
    pub resume_dir: Option<PathBuf>,

    /// Extra peer to connect to, may be repeated
    #[arg(long = "peer", value_name = "ADDR")]
    pub peers: Vec<std::net::SocketAddr>,
}

#[derive(Debug, Clone, Args)]
pub struct CreateArgs {
    /// File or directory to share
    #[arg(value_name = "SOURCE")]
    pub source: PathBuf,

    /// Where to write the .torrent file
    #[arg(short, long, value_name = "FILE")]
    pub output: PathBuf,

    /// Announce URL, may be repeated
    #[arg(short, long = "tracker", value_name = "URL")]
    pub trackers: Vec<String>,

    /// Piece length in KiB (picked from the content size if omitted)
    #[arg(long, value_name = "KIB")]
    pub piece_length: Option<u32>,

    /// Free-form comment
    #[arg(long)]
    pub comment: Option<String>,
}

impl CliArgs {
    /// Parse CLI arguments from command line
    pub fn parse_args() -> Self {
        Self::parse()
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn is_quiet(&self) -> bool {
        self.quiet
    }

    /// Get the log level based on verbosity settings
    pub fn log_level(&self) -> tracing::Level {
        if self.verbose {
            tracing::Level::DEBUG
        } else if self.quiet {
            tracing::Level::ERROR
        } else {
            tracing::Level::INFO
        }
    }
}
