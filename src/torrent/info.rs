//! Torrent information structures
//!
//! Provides high-level information about torrents.

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;
use crate::storage::PieceLayout;

/// A file of the torrent, relative to the download directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    /// Path components, starting with the torrent name
    pub path: Vec<String>,
    /// File size in bytes
    pub length: u64,
}

/// High-level torrent information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: Option<String>,
    /// All tracker URLs, primary first, without duplicates
    pub announce_list: Vec<String>,
    /// SHA1 hash of the info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u32,
    /// Piece hashes
    pub pieces: Vec<[u8; 20]>,
    /// Torrent name
    pub name: String,
    /// Files in download order
    ///
    /// A single-file torrent has one entry `[name]`; multi-file entries
    /// are `[name, path...]`.
    pub files: Vec<TorrentFile>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
}

impl TorrentInfo {
    /// Calculate total size of all files in torrent
    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.length).sum()
    }

    /// Get number of pieces in torrent
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Check if this is a multi-file torrent
    pub fn is_multi_file(&self) -> bool {
        self.files.len() != 1 || self.files[0].path.len() != 1
    }

    /// Get info hash as a hex string
    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// Piece geometry of this torrent
    pub fn layout(&self) -> Result<PieceLayout> {
        PieceLayout::new(self.piece_length, self.total_size())
    }

    /// Generate info hash from info dictionary bytes
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(info_dict_bytes);
        hasher.finalize().into()
    }

    /// Parse piece hashes from concatenated bytes in torrent file
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error(format!(
                "Pieces field length must be a multiple of 20, got {}",
                pieces_bytes.len()
            ))
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Get piece hash for a specific piece index
    pub fn piece_hash(&self, index: usize) -> Option<[u8; 20]> {
        self.pieces.get(index).copied()
    }

    /// Get byte range for a specific piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }

        let piece_length = u64::from(self.piece_length);
        let start = index as u64 * piece_length;
        let end = std::cmp::min(start + piece_length, self.total_size());
        Some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(files: Vec<TorrentFile>, pieces: usize) -> TorrentInfo {
        TorrentInfo {
            announce: Some("http://tracker.example.com/announce".to_string()),
            announce_list: vec!["http://tracker.example.com/announce".to_string()],
            info_hash: [1u8; 20],
            piece_length: 1024,
            pieces: vec![[2u8; 20]; pieces],
            name: "test".to_string(),
            files,
            comment: None,
            created_by: None,
        }
    }

    #[test]
    fn test_torrent_info_single_file() {
        let info = info(vec![TorrentFile { path: vec!["test".into()], length: 2048 }], 2);
        assert_eq!(info.total_size(), 2048);
        assert_eq!(info.piece_count(), 2);
        assert!(!info.is_multi_file());
        assert_eq!(info.info_hash_hex(), hex::encode([1u8; 20]));
    }

    #[test]
    fn test_torrent_info_multi_file() {
        let info = info(
            vec![
                TorrentFile { path: vec!["test".into(), "file1.txt".into()], length: 500 },
                TorrentFile { path: vec!["test".into(), "file2.txt".into()], length: 524 },
            ],
            1,
        );
        assert_eq!(info.total_size(), 1024);
        assert!(info.is_multi_file());
        assert_eq!(info.layout().unwrap().piece_count(), 1);
    }

    #[test]
    fn test_parse_piece_hashes() {
        let hashes: Vec<u8> = (0..40).collect();
        let result = TorrentInfo::parse_piece_hashes(&hashes).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(result[1][0], 20);

        let err = TorrentInfo::parse_piece_hashes(&[1u8; 21]).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TorrentError>(),
            Some(TorrentError::ParseError { .. })
        ));
    }

    #[test]
    fn test_piece_hash_and_range() {
        let info = info(vec![TorrentFile { path: vec!["test".into()], length: 1500 }], 2);
        assert_eq!(info.piece_hash(1), Some([2u8; 20]));
        assert_eq!(info.piece_hash(2), None);
        assert_eq!(info.piece_range(0), Some((0, 1024)));
        assert_eq!(info.piece_range(1), Some((1024, 1500)));
        assert_eq!(info.piece_range(2), None);
    }
}
