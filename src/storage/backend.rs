//! Storage backend abstraction
//!
//! The piece store hands bytes to a [`Storage`] and learns about completion
//! through its `fragment_write_completed` / `piece_read_completed` callbacks,
//! so a backend is free to do the actual I/O on another thread.

use anyhow::Result;
use bytes::Bytes;

/// Where torrent data lives
pub trait Storage: Send + Sync {
    /// Queue a fragment write at `begin` inside piece `piece_index`
    ///
    /// Must not block. Completion is reported via
    /// `PieceStore::fragment_write_completed`.
    fn write_fragment(&self, piece_index: u32, begin: u32, data: Bytes);

    /// Queue a read of a whole piece for verification
    ///
    /// Must not block. Completion is reported via
    /// `PieceStore::piece_read_completed`.
    fn read_piece(&self, piece_index: u32);

    /// Read `length` bytes at an absolute offset of the concatenated file set
    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>>;
}
