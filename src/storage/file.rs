//! File layout
//!
//! Maps absolute offsets of the concatenated file set onto the individual
//! files under the download directory.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Result;
use tracing::{debug, error, info, trace};

use crate::error::TorrentError;
use crate::torrent::TorrentFile;

/// One file of the torrent, placed in the concatenated byte space
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub offset: u64,
    pub length: u64,
}

/// The torrent's files under a download directory
#[derive(Debug, Clone)]
pub struct FileLayout {
    base_path: PathBuf,
    files: Vec<FileEntry>,
    total_size: u64,
}

impl FileLayout {
    /// Lay out `files` in order under `base_path`
    ///
    /// Path components that would escape the download directory are rejected.
    pub fn new(base_path: impl Into<PathBuf>, files: &[TorrentFile]) -> Result<Self> {
        let base_path = base_path.into();
        let mut entries = Vec::with_capacity(files.len());
        let mut offset = 0u64;

        for file in files {
            if file.path.is_empty() {
                return Err(TorrentError::parse_error("file entry has an empty path").into());
            }
            let mut path = base_path.clone();
            for component in &file.path {
                if component.is_empty()
                    || component == "."
                    || component == ".."
                    || component.contains(['/', '\\'])
                {
                    return Err(TorrentError::parse_error_with_source(
                        "unsafe path component in file list",
                        component.clone()
                    ).into());
                }
                path.push(component);
            }
            entries.push(FileEntry {
                path,
                offset,
                length: file.length,
            });
            offset += file.length;
        }

        Ok(Self {
            base_path,
            files: entries,
            total_size: offset,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn files(&self) -> &[FileEntry] {
        &self.files
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Create directories and size every file, keeping existing contents
    pub fn create_files(&self) -> Result<()> {
        info!("Creating {} files under {}", self.files.len(), self.base_path.display());

        for file in &self.files {
            if let Some(parent) = file.path.parent() {
                fs::create_dir_all(parent).map_err(|e| {
                    error!("Failed to create directory '{}': {}", parent.display(), e);
                    TorrentError::storage_error_full("Failed to create directory", parent.display().to_string(), e.to_string())
                })?;
            }

            let handle = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&file.path)
                .map_err(|e| {
                    error!("Failed to create file '{}': {}", file.path.display(), e);
                    TorrentError::storage_error_full("Failed to create file", file.path.display().to_string(), e.to_string())
                })?;

            let current = handle.metadata().map(|m| m.len()).unwrap_or(0);
            if current != file.length {
                debug!("Sizing {} to {} bytes", file.path.display(), file.length);
                handle.set_len(file.length).map_err(|e| {
                    error!("Failed to set file length for '{}': {}", file.path.display(), e);
                    TorrentError::storage_error_full("Failed to set file length", file.path.display().to_string(), e.to_string())
                })?;
            }
        }
        Ok(())
    }

    /// The file slices covering `length` bytes at `offset`
    fn spans(&self, offset: u64, length: u64) -> Result<Vec<(&FileEntry, u64, usize)>> {
        if offset.checked_add(length).map_or(true, |end| end > self.total_size) {
            return Err(TorrentError::storage_error(format!(
                "range {}+{} is outside the {} byte file set",
                offset, length, self.total_size
            )).into());
        }

        let mut spans = Vec::new();
        let mut current = offset;
        let end = offset + length;
        for file in &self.files {
            let file_end = file.offset + file.length;
            if file_end <= current || file.length == 0 {
                continue;
            }
            if file.offset >= end {
                break;
            }
            let within = current - file.offset;
            let take = (file_end.min(end) - current) as usize;
            spans.push((file, within, take));
            current += take as u64;
        }
        Ok(spans)
    }

    /// Write `data` at an absolute offset
    pub fn write_at(&self, offset: u64, data: &[u8]) -> Result<()> {
        trace!("Writing {} bytes at offset {}", data.len(), offset);
        let mut remaining = data;
        for (file, within, take) in self.spans(offset, data.len() as u64)? {
            let mut handle = OpenOptions::new().write(true).open(&file.path).map_err(|e| {
                error!("Failed to open file '{}': {}", file.path.display(), e);
                TorrentError::storage_error_full("Failed to open file for writing", file.path.display().to_string(), e.to_string())
            })?;
            handle.seek(SeekFrom::Start(within)).map_err(|e| {
                TorrentError::storage_error_full("Failed to seek in file", file.path.display().to_string(), e.to_string())
            })?;
            handle.write_all(&remaining[..take]).map_err(|e| {
                error!("Failed to write to file '{}': {}", file.path.display(), e);
                TorrentError::storage_error_full("Failed to write to file", file.path.display().to_string(), e.to_string())
            })?;
            remaining = &remaining[take..];
        }
        Ok(())
    }

    /// Read `length` bytes at an absolute offset
    pub fn read_at(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        trace!("Reading {} bytes at offset {}", length, offset);
        let mut buffer = Vec::with_capacity(length);
        for (file, within, take) in self.spans(offset, length as u64)? {
            let mut handle = fs::File::open(&file.path).map_err(|e| {
                TorrentError::storage_error_full("Failed to open file for reading", file.path.display().to_string(), e.to_string())
            })?;
            handle.seek(SeekFrom::Start(within)).map_err(|e| {
                TorrentError::storage_error_full("Failed to seek in file", file.path.display().to_string(), e.to_string())
            })?;
            let start = buffer.len();
            buffer.resize(start + take, 0);
            handle.read_exact(&mut buffer[start..]).map_err(|e| {
                TorrentError::storage_error_full("Failed to read from file", file.path.display().to_string(), e.to_string())
            })?;
        }
        Ok(buffer)
    }
}
