//! btclient
//!
//! A BitTorrent client with HTTP and UDP trackers, end-game mode, streaming
//! piece selection and resume support.

pub mod cli;
pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod peer;
pub mod protocol;
pub mod storage;
pub mod torrent;
pub mod tracker;

pub use error::TorrentError;

pub use config::{EngineConfig, TrackerConfig};
pub use context::{TorrentContext, TransferStats};
pub use engine::{generate_peer_id, Engine, EngineStats};
pub use torrent::{TorrentBuilder, TorrentFile, TorrentInfo, TorrentParser};
pub use protocol::{Handshake, Message, MessageId};
pub use peer::{PeerConnection, PeerSession, PieceSelector, SessionManager};
pub use storage::{
    Bitfield, DiskIo, FileLayout, MemoryStorage, PieceLayout, PieceStore, ResumeData,
    ResumeManager, Storage,
};
pub use tracker::{Announcer, TrackerClient, TrackerEvent};
pub use cli::{CliArgs, Config, DownloadStats, ProgressDisplay};
