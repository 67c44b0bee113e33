//! Peer state module
//!
//! Session lifecycle states, the four choke/interest flags, and the
//! [`PeerHandle`] shared between a session and the piece store.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Lifecycle of a peer session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Dialing the remote
    #[default]
    Connecting,
    /// Waiting for the remote handshake
    Handshaking,
    /// Exchanging messages
    Active,
    /// Torn down; terminal
    Closed,
}

impl SessionState {
    pub fn is_active(&self) -> bool {
        matches!(self, SessionState::Active)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// Choke and interest flags for both directions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerFlags {
    /// We're choking them
    pub am_choking: bool,
    /// We're interested
    pub am_interested: bool,
    /// They're choking us
    pub peer_choking: bool,
    /// They're interested
    pub peer_interested: bool,
}

impl Default for PeerFlags {
    fn default() -> Self {
        Self {
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
        }
    }
}

impl PeerFlags {
    /// Check if we can request from peer
    pub fn can_request(&self) -> bool {
        !self.peer_choking && self.am_interested
    }
}

/// Identity and counters of one remote peer, shared with the piece store
///
/// The piece store keeps a handle as the owner of a piece it hands out, so a
/// later verification result can trust or blame that peer.
#[derive(Debug)]
pub struct PeerHandle {
    addr: SocketAddr,
    trusted: AtomicBool,
    downloaded: AtomicU64,
    uploaded: AtomicU64,
}

impl PeerHandle {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            trusted: AtomicBool::new(false),
            downloaded: AtomicU64::new(0),
            uploaded: AtomicU64::new(0),
        }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Whether this peer contributed a verified piece
    pub fn is_trusted(&self) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }

    /// Returns true if the peer was not trusted before
    pub fn mark_trusted(&self) -> bool {
        !self.trusted.swap(true, Ordering::SeqCst)
    }

    pub fn add_downloaded(&self, bytes: u64) -> u64 {
        self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn add_uploaded(&self, bytes: u64) -> u64 {
        self.uploaded.fetch_add(bytes, Ordering::Relaxed) + bytes
    }

    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn uploaded(&self) -> u64 {
        self.uploaded.load(Ordering::Relaxed)
    }
}
