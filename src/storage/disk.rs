//! Disk worker
//!
//! [`DiskIo`] is the [`Storage`] the piece store talks to. It only queues
//! requests; a [`DiskWorker`] on a blocking thread performs them in order and
//! reports completions back to the piece store.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::backend::Storage;
use super::file::FileLayout;
use super::piece::{PieceLayout, PieceStore};
use crate::error::TorrentError;

/// Work for the disk thread
#[derive(Debug)]
pub enum DiskRequest {
    Write { index: u32, begin: u32, data: Bytes },
    Read { index: u32 },
    /// Acknowledged once everything queued before it is done
    Flush(oneshot::Sender<()>),
    Shutdown,
}

/// Queue-side handle of the disk worker
#[derive(Debug)]
pub struct DiskIo {
    files: Arc<FileLayout>,
    tx: mpsc::Sender<DiskRequest>,
}

impl DiskIo {
    /// Create the handle and the worker that serves it
    pub fn new(files: Arc<FileLayout>, pieces: PieceLayout, capacity: usize) -> (Self, DiskWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = DiskWorker {
            files: Arc::clone(&files),
            pieces,
            rx,
        };
        (Self { files, tx }, worker)
    }

    pub fn files(&self) -> &FileLayout {
        &self.files
    }

    fn enqueue(&self, request: DiskRequest) {
        match self.tx.try_send(request) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(request)) => {
                // queue is full; hand the request to a task instead of blocking the caller
                match tokio::runtime::Handle::try_current() {
                    Ok(handle) => {
                        let tx = self.tx.clone();
                        handle.spawn(async move {
                            if tx.send(request).await.is_err() {
                                warn!("Disk worker gone, request dropped");
                            }
                        });
                    }
                    Err(_) => {
                        if self.tx.blocking_send(request).is_err() {
                            warn!("Disk worker gone, request dropped");
                        }
                    }
                }
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!("Disk worker gone, request dropped");
            }
        }
    }

    /// Wait until every request queued so far has been performed
    pub async fn flush(&self) -> Result<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(DiskRequest::Flush(ack_tx))
            .await
            .map_err(|_| TorrentError::storage_error("disk worker is not running"))?;
        ack_rx
            .await
            .map_err(|_| TorrentError::storage_error("disk worker stopped before flushing"))?;
        Ok(())
    }

    /// Ask the worker to exit after draining its queue
    pub async fn shutdown(&self) {
        let _ = self.tx.send(DiskRequest::Shutdown).await;
    }
}

impl Storage for DiskIo {
    fn write_fragment(&self, piece_index: u32, begin: u32, data: Bytes) {
        self.enqueue(DiskRequest::Write {
            index: piece_index,
            begin,
            data,
        });
    }

    fn read_piece(&self, piece_index: u32) {
        self.enqueue(DiskRequest::Read { index: piece_index });
    }

    fn read_range(&self, offset: u64, length: usize) -> Result<Vec<u8>> {
        self.files.read_at(offset, length)
    }
}

/// The thread that performs queued disk work
#[derive(Debug)]
pub struct DiskWorker {
    files: Arc<FileLayout>,
    pieces: PieceLayout,
    rx: mpsc::Receiver<DiskRequest>,
}

impl DiskWorker {
    /// Run on a blocking thread until shut down or every handle is dropped
    pub fn spawn(self, store: Arc<PieceStore>) -> JoinHandle<()> {
        tokio::task::spawn_blocking(move || self.run(&store))
    }

    fn run(mut self, store: &PieceStore) {
        info!("Disk worker started for {}", self.files.base_path().display());
        while let Some(request) = self.rx.blocking_recv() {
            match request {
                DiskRequest::Write { index, begin, data } => {
                    let offset = self.pieces.piece_offset(index) + begin as u64;
                    match self.files.write_at(offset, &data) {
                        Ok(()) => store.fragment_write_completed(index, begin, data.len() as u32),
                        Err(e) => {
                            error!("Write of piece {} at {} failed: {}", index, begin, e);
                            store.fragment_write_failed(index, begin);
                        }
                    }
                }
                DiskRequest::Read { index } => {
                    let offset = self.pieces.piece_offset(index);
                    let length = self.pieces.piece_len(index) as usize;
                    match self.files.read_at(offset, length) {
                        Ok(data) => store.piece_read_completed(index, &data),
                        Err(e) => {
                            error!("Read-back of piece {} failed: {}", index, e);
                            store.piece_read_failed(index);
                        }
                    }
                }
                DiskRequest::Flush(ack) => {
                    let _ = ack.send(());
                }
                DiskRequest::Shutdown => break,
            }
        }
        debug!("Disk worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::PeerHandle;
    use crate::storage::piece::PieceFrag;
    use crate::torrent::TorrentFile;
    use sha1::{Digest, Sha1};

    #[tokio::test]
    async fn test_worker_writes_and_verifies() {
        let dir = tempfile::tempdir().unwrap();
        let data: Vec<u8> = (0..40_000u32).map(|i| (i % 253) as u8).collect();
        let files = Arc::new(
            FileLayout::new(
                dir.path(),
                &[
                    TorrentFile { path: vec!["a".into()], length: 30_000 },
                    TorrentFile { path: vec!["b".into()], length: 10_000 },
                ],
            )
            .unwrap(),
        );
        files.create_files().unwrap();

        let pieces = PieceLayout::new(32768, data.len() as u64).unwrap();
        let hashes = data
            .chunks(32768)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(&Sha1::digest(chunk));
                hash
            })
            .collect();
        let (disk, worker) = DiskIo::new(Arc::clone(&files), pieces, 4);
        let disk = Arc::new(disk);
        let (store, mut events) = PieceStore::new(pieces, hashes, disk.clone()).unwrap();
        let store = Arc::new(store);
        let handle = worker.spawn(Arc::clone(&store));

        let peer = Arc::new(PeerHandle::new("127.0.0.1:1".parse().unwrap()));
        for index in 0..pieces.piece_count() {
            assert!(store.request_piece(index, &peer));
            while let Some(frag) = store.request_fragment(index) {
                let start = (pieces.piece_offset(index) + frag.begin() as u64) as usize;
                let end = start + pieces.frag_len(frag) as usize;
                store.fragment_received(frag, Bytes::copy_from_slice(&data[start..end]));
            }
        }

        for _ in 0..3 {
            assert!(matches!(events.recv().await, Some(_)));
        }
        disk.flush().await.unwrap();
        assert!(store.is_complete());
        assert!(store.has_fragment(PieceFrag::new(1, 0)));
        assert_eq!(files.read_at(0, data.len()).unwrap(), data);

        disk.shutdown().await;
        handle.await.unwrap();
    }
}
