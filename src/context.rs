//! Per-torrent state shared by sessions, trackers and the engine

use std::sync::atomic::{AtomicU16, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::storage::PieceStore;

/// Torrent-wide transfer counters
#[derive(Debug, Default)]
pub struct TransferStats {
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl TransferStats {
    pub fn add_downloaded(&self, bytes: u64) {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_uploaded(&self, bytes: u64) {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }
}

/// Everything a session or tracker needs to know about its torrent
#[derive(Debug)]
pub struct TorrentContext {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub store: Arc<PieceStore>,
    pub stats: TransferStats,
    listen_port: AtomicU16,
    active_peers: AtomicUsize,
}

impl TorrentContext {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20], store: Arc<PieceStore>) -> Self {
        Self {
            info_hash,
            peer_id,
            store,
            stats: TransferStats::default(),
            listen_port: AtomicU16::new(0),
            active_peers: AtomicUsize::new(0),
        }
    }

    /// Port announced to trackers; set once the listener is bound
    pub fn listen_port(&self) -> u16 {
        self.listen_port.load(Ordering::SeqCst)
    }

    pub fn set_listen_port(&self, port: u16) {
        self.listen_port.store(port, Ordering::SeqCst);
    }

    /// Sessions that completed the handshake and are still open
    pub fn active_peers(&self) -> usize {
        self.active_peers.load(Ordering::SeqCst)
    }

    pub fn peer_connected(&self) -> usize {
        self.active_peers.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn peer_disconnected(&self) {
        let _ = self
            .active_peers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Bytes still missing
    pub fn left(&self) -> u64 {
        self.store.left()
    }
}
