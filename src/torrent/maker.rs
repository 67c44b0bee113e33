//! Torrent file creation
//!
//! Builds a metainfo file from a local file or directory tree, hashing
//! pieces across file boundaries.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use anyhow::Result;
use sha1::{Digest, Sha1};
use tracing::{debug, info};

use crate::error::TorrentError;
use crate::torrent::bencode::{self, Value};
use crate::torrent::info::TorrentInfo;
use crate::torrent::parser::TorrentParser;

/// Piece length for content of `total_size` bytes
pub fn choose_piece_length(total_size: u64) -> u32 {
    if total_size <= 200 * 1024 * 1024 {
        32 * 1024
    } else if total_size <= 2 * 1024 * 1024 * 1024 {
        256 * 1024
    } else {
        1024 * 1024
    }
}

/// Builder for new .torrent files
#[derive(Debug, Clone)]
pub struct TorrentBuilder {
    source: PathBuf,
    trackers: Vec<String>,
    piece_length: Option<u32>,
    comment: Option<String>,
}

struct SourceFile {
    disk_path: PathBuf,
    /// Path below the torrent root, empty for a single-file torrent
    relative: Vec<String>,
    length: u64,
}

impl TorrentBuilder {
    pub fn new(source: impl Into<PathBuf>) -> Self {
        Self {
            source: source.into(),
            trackers: Vec::new(),
            piece_length: None,
            comment: None,
        }
    }

    pub fn tracker(mut self, url: impl Into<String>) -> Self {
        self.trackers.push(url.into());
        self
    }

    pub fn trackers(mut self, urls: impl IntoIterator<Item = String>) -> Self {
        self.trackers.extend(urls);
        self
    }

    /// Override the size-based default piece length
    pub fn piece_length(mut self, piece_length: u32) -> Self {
        self.piece_length = Some(piece_length);
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }

    /// Encode the metainfo for the source
    pub fn build(&self) -> Result<Vec<u8>> {
        let name = self
            .source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| TorrentError::validation_error_with_field("source has no file name", "source"))?;
        let metadata = std::fs::metadata(&self.source).map_err(|e| {
            TorrentError::storage_error_full("Cannot read source", self.source.display().to_string(), e.to_string())
        })?;

        let mut files = Vec::new();
        if metadata.is_dir() {
            collect_files(&self.source, &mut Vec::new(), &mut files)?;
        } else {
            files.push(SourceFile {
                disk_path: self.source.clone(),
                relative: Vec::new(),
                length: metadata.len(),
            });
        }

        let total_size: u64 = files.iter().map(|f| f.length).sum();
        if total_size == 0 {
            return Err(TorrentError::validation_error_with_field("source has no content", "source").into());
        }
        let piece_length = self.piece_length.unwrap_or_else(|| choose_piece_length(total_size));
        if piece_length == 0 {
            return Err(TorrentError::validation_error_with_field("must be positive", "piece_length").into());
        }
        info!(
            "Creating torrent '{}': {} files, {} bytes, piece length {}",
            name,
            files.len(),
            total_size,
            piece_length
        );

        let pieces = hash_pieces(&files, piece_length)?;

        let mut info = vec![
            ("name", Value::bytes(name)),
            ("piece length", Value::int(i64::from(piece_length))),
            ("pieces", Value::bytes(pieces)),
        ];
        if metadata.is_dir() {
            let entries = files
                .iter()
                .map(|f| {
                    Value::dict_from([
                        ("length", Value::int(f.length as i64)),
                        ("path", Value::list(f.relative.iter().map(|p| Value::bytes(p.as_str())).collect())),
                    ])
                })
                .collect();
            info.push(("files", Value::list(entries)));
        } else {
            info.push(("length", Value::int(total_size as i64)));
        }

        let mut root = vec![
            ("info", Value::dict_from(info)),
            ("created by", Value::bytes(concat!("btclient/", env!("CARGO_PKG_VERSION")))),
        ];
        if let Some(first) = self.trackers.first() {
            root.push(("announce", Value::bytes(first.as_str())));
        }
        if self.trackers.len() > 1 {
            let tiers = self
                .trackers
                .iter()
                .map(|url| Value::list(vec![Value::bytes(url.as_str())]))
                .collect();
            root.push(("announce-list", Value::list(tiers)));
        }
        if let Some(comment) = &self.comment {
            root.push(("comment", Value::bytes(comment.as_str())));
        }

        Ok(bencode::encode(&Value::dict_from(root)))
    }

    /// Build, write to `dst` and parse the result back
    pub fn write_to(&self, dst: &Path) -> Result<TorrentInfo> {
        let data = self.build()?;
        std::fs::write(dst, &data).map_err(|e| {
            TorrentError::storage_error_full("Failed to write torrent file", dst.display().to_string(), e.to_string())
        })?;
        debug!("Wrote {} bytes to {}", data.len(), dst.display());
        TorrentParser::parse_bytes(&data)
    }
}

/// Regular files below `dir`, in name order
fn collect_files(dir: &Path, prefix: &mut Vec<String>, out: &mut Vec<SourceFile>) -> Result<()> {
    let read_dir = std::fs::read_dir(dir).map_err(|e| {
        TorrentError::storage_error_full("Cannot list directory", dir.display().to_string(), e.to_string())
    })?;
    let mut entries = read_dir.collect::<std::io::Result<Vec<_>>>()?;
    entries.sort_by_key(|e| e.file_name());

    for entry in entries {
        let path = entry.path();
        let metadata = entry.metadata()?;
        prefix.push(entry.file_name().to_string_lossy().into_owned());
        if metadata.is_dir() {
            collect_files(&path, prefix, out)?;
        } else if metadata.is_file() {
            out.push(SourceFile {
                disk_path: path,
                relative: prefix.clone(),
                length: metadata.len(),
            });
        }
        prefix.pop();
    }
    Ok(())
}

/// SHA-1 of every piece of the concatenated files
fn hash_pieces(files: &[SourceFile], piece_length: u32) -> Result<Vec<u8>> {
    let mut pieces = Vec::new();
    let mut piece = Vec::with_capacity(piece_length as usize);

    for file in files {
        let mut reader = File::open(&file.disk_path).map_err(|e| {
            TorrentError::storage_error_full("Cannot open source file", file.disk_path.display().to_string(), e.to_string())
        })?;
        let mut remaining = file.length;
        while remaining > 0 {
            let want = (piece_length as usize - piece.len()).min(remaining as usize);
            let start = piece.len();
            piece.resize(start + want, 0);
            reader.read_exact(&mut piece[start..]).map_err(|e| {
                TorrentError::storage_error_full("Source file changed while hashing", file.disk_path.display().to_string(), e.to_string())
            })?;
            remaining -= want as u64;
            if piece.len() == piece_length as usize {
                pieces.extend_from_slice(&Sha1::digest(&piece));
                piece.clear();
            }
        }
    }
    if !piece.is_empty() {
        pieces.extend_from_slice(&Sha1::digest(&piece));
    }
    Ok(pieces)
}
