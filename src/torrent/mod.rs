//! Torrent file handling module
//!
//! Bencode codec, .torrent parsing and creation.

pub mod bencode;
pub mod info;
pub mod maker;
pub mod parser;

pub use bencode::{Value, ValueKind};
pub use info::{TorrentFile, TorrentInfo};
pub use maker::TorrentBuilder;
pub use parser::TorrentParser;
