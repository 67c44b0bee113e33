//! In-memory storage
//!
//! Queues writes and reads instead of performing them, so the caller decides
//! when completions are delivered. Useful for tests and for simulating a slow
//! disk.

use std::collections::VecDeque;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;

use super::backend::Storage;
use super::piece::{PieceLayout, PieceStore};
use crate::error::TorrentError;

#[derive(Debug)]
enum PendingOp {
    Write { index: u32, begin: u32, data: Bytes },
    Read { index: u32 },
}

/// Storage backed by a byte vector
#[derive(Debug)]
pub struct MemoryStorage {
    layout: PieceLayout,
    data: Mutex<Vec<u8>>,
    pending: Mutex<VecDeque<PendingOp>>,
}

impl MemoryStorage {
    /// Zero-filled storage sized for `layout`
    pub fn new(layout: PieceLayout) -> Self {
        Self {
            data: Mutex::new(vec![0u8; layout.total_size() as usize]),
            pending: Mutex::new(VecDeque::new()),
            layout,
        }
    }

    /// Overwrite the stored bytes, e.g. to seed a complete copy
    pub fn load(&self, contents: &[u8]) {
        let mut data = self.data.lock();
        let len = contents.len().min(data.len());
        data[..len].copy_from_slice(&contents[..len]);
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }

    /// Number of queued operations
    pub fn pending(&self) -> usize {
        self.pending.lock().len()
    }

    /// Perform queued operations, delivering completions to `store`, until
    /// nothing is left. Returns how many operations ran.
    pub fn process(&self, store: &PieceStore) -> usize {
        let mut done = 0;
        loop {
            let Some(op) = self.pending.lock().pop_front() else {
                return done;
            };
            done += 1;
            match op {
                PendingOp::Write { index, begin, data } => {
                    let offset = (self.layout.piece_offset(index) + begin as u64) as usize;
                    {
                        let mut stored = self.data.lock();
                        stored[offset..offset + data.len()].copy_from_slice(&data);
                    }
                    store.fragment_write_completed(index, begin, data.len() as u32);
                }
                PendingOp::Read { index } => {
                    let offset = self.layout.piece_offset(index) as usize;
                    let len = self.layout.piece_len(index) as usize;
                    let piece = self.data.lock()[offset..offset + len].to_vec();
                    store.piece_read_completed(index, &piece);
                }
            }
        }
    }
}

impl MemoryStorage {
    /// Drop every queued write, reporting each as failed to `store`
    pub fn fail_writes(&self, store: &PieceStore) -> usize {
        let failed: Vec<(u32, u32)> = {
            let mut pending = self.pending.lock();
            let mut failed = Vec::new();
            pending.retain(|op| match op {
                PendingOp::Write { index, begin, .. } => {
                    failed.push((*index, *begin));
                    false
                }
                PendingOp::Read { .. } => true,
            });
            failed
        };
        for &(index, begin) in &failed {
            store.fragment_write_failed(index, begin);
        }
        failed.len()
    }
}

impl Storage for MemoryStorage {
    fn write_fragment(&self, piece_index: u32, begin: u32, data: Bytes) {
        self.pending.lock().push_back(PendingOp::Write {
            index: piece_index,
            begin,
            data,
        });
    }

    fn read_piece(&self, piece_index: u32) {
        self.pending.lock().push_back(PendingOp::Read { index: piece_index });
    }

    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        let data = self.data.lock();
        let start = offset as usize;
        let end = start.checked_add(length).filter(|&end| end <= data.len()).ok_or_else(|| {
            TorrentError::storage_error(format!("read of {} bytes at {} is out of range", length, offset))
        })?;
        Ok(data[start..end].to_vec())
    }
}
