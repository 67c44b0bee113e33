//! Piece store
//!
//! Owns the download state of every piece: which fragments are requested,
//! which are present on disk, and which pieces passed hash verification.
//! Each piece sits behind its own lock; torrent-wide counters are atomics so
//! sessions can read them without touching any piece.

use std::collections::BTreeSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

use super::backend::Storage;
use super::bitfield::Bitfield;
use crate::error::TorrentError;
use crate::peer::PeerHandle;
use crate::protocol::MAX_BLOCK_LEN;

/// Transfer unit inside a piece
pub const FRAG_LENGTH: u32 = 16384;

/// A fragment addressed by its ordinal inside a piece
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PieceFrag {
    pub index: u32,
    pub frag: u32,
}

impl PieceFrag {
    pub fn new(index: u32, frag: u32) -> Self {
        Self { index, frag }
    }

    /// Byte offset of this fragment inside its piece
    pub fn begin(&self) -> u32 {
        self.frag * FRAG_LENGTH
    }
}

/// A block addressed the way wire messages address it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerFrag {
    pub index: u32,
    pub begin: u32,
    pub length: u32,
}

/// Download state of one piece
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PieceState {
    /// Nobody is downloading it
    Free,
    /// Claimed by at least one session
    Downloading,
    /// Every fragment is on disk, verification pending
    Downloaded,
    /// Hash matched
    Verified,
}

/// Piece and fragment geometry derived from the total size and piece length
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PieceLayout {
    piece_length: u32,
    total_size: u64,
    piece_count: u32,
}

impl PieceLayout {
    pub fn new(piece_length: u32, total_size: u64) -> Result<Self> {
        if piece_length == 0 {
            return Err(TorrentError::config_error_with_field("piece length must be positive", "piece_length").into());
        }
        if total_size == 0 {
            return Err(TorrentError::config_error_with_field("torrent has no content", "total_size").into());
        }
        let piece_count = total_size.div_ceil(piece_length as u64);
        let piece_count = u32::try_from(piece_count).map_err(|_| {
            TorrentError::config_error_with_field("too many pieces", "piece_length")
        })?;

        Ok(Self {
            piece_length,
            total_size,
            piece_count,
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_count
    }

    /// Nominal piece length; only the last piece may be shorter
    pub fn piece_length(&self) -> u32 {
        self.piece_length
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Length of piece `index`
    pub fn piece_len(&self, index: u32) -> u32 {
        if index + 1 < self.piece_count {
            return self.piece_length;
        }
        match (self.total_size % self.piece_length as u64) as u32 {
            0 => self.piece_length,
            rem => rem,
        }
    }

    /// Byte offset of piece `index` in the concatenated file set
    pub fn piece_offset(&self, index: u32) -> u64 {
        index as u64 * self.piece_length as u64
    }

    /// Number of fragments in piece `index`
    pub fn frag_count(&self, index: u32) -> u32 {
        self.piece_len(index).div_ceil(FRAG_LENGTH)
    }

    /// Fragments in a full-length piece
    pub fn frags_per_piece(&self) -> u32 {
        self.piece_length.div_ceil(FRAG_LENGTH)
    }

    /// Fragments across the whole torrent
    pub fn total_frags(&self) -> usize {
        let last = self.piece_count - 1;
        last as usize * self.frags_per_piece() as usize + self.frag_count(last) as usize
    }

    /// Length of one fragment
    pub fn frag_len(&self, frag: PieceFrag) -> u32 {
        (self.piece_len(frag.index) - frag.begin()).min(FRAG_LENGTH)
    }

    /// Position of a fragment in the torrent-wide fragment bitset
    pub fn global_frag(&self, frag: PieceFrag) -> usize {
        frag.index as usize * self.frags_per_piece() as usize + frag.frag as usize
    }

    /// Convert a wire (index, begin) pair into a fragment, if it names one
    pub fn frag_at(&self, index: u32, begin: u32) -> Option<PieceFrag> {
        if index >= self.piece_count || begin % FRAG_LENGTH != 0 {
            return None;
        }
        let frag = PieceFrag::new(index, begin / FRAG_LENGTH);
        (frag.frag < self.frag_count(index)).then_some(frag)
    }

    /// Wire addressing for a fragment
    pub fn to_peer_frag(&self, frag: PieceFrag) -> PeerFrag {
        PeerFrag {
            index: frag.index,
            begin: frag.begin(),
            length: self.frag_len(frag),
        }
    }
}

/// Notifications the store emits for the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A piece passed verification; every session should advertise it
    PieceVerified { index: u32 },
    /// A piece failed verification; `offender` is the sole contributor, if known
    PieceCorrupted { index: u32, offender: Option<SocketAddr> },
    /// The last piece was verified
    Completed,
}

/// Persisted form of the store: fragment presence and piece verification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceSnapshot {
    pub have: Bitfield,
    pub verified: Bitfield,
}

#[derive(Debug)]
struct Piece {
    state: PieceState,
    hash: [u8; 20],
    requested: Bitfield,
    have: Bitfield,
    write_count: u32,
    owner: Option<Arc<PeerHandle>>,
}

impl Piece {
    fn reset(&mut self) {
        self.state = PieceState::Free;
        self.requested.clear_all();
        self.have.clear_all();
        self.write_count = 0;
        self.owner = None;
    }
}

/// Shared download state for one torrent
pub struct PieceStore {
    layout: PieceLayout,
    pieces: Vec<Mutex<Piece>>,
    free_count: AtomicUsize,
    verified_count: AtomicUsize,
    verified_bytes: AtomicU64,
    end_game: AtomicBool,
    /// Torrent-wide fragment bitset of data known to be written
    persisted: Mutex<Bitfield>,
    verified: Mutex<Bitfield>,
    readvertise: Mutex<Vec<u32>>,
    storage: Arc<dyn Storage>,
    events: mpsc::UnboundedSender<StoreEvent>,
    rng: Mutex<StdRng>,
}

impl std::fmt::Debug for PieceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PieceStore")
            .field("layout", &self.layout)
            .field("free", &self.free_count())
            .field("verified", &self.verified_count())
            .field("end_game", &self.is_end_game())
            .finish()
    }
}

impl PieceStore {
    /// Create a store with every piece Free
    pub fn new(
        layout: PieceLayout,
        hashes: Vec<[u8; 20]>,
        storage: Arc<dyn Storage>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<StoreEvent>)> {
        if hashes.len() != layout.piece_count() as usize {
            return Err(TorrentError::parse_error_with_source(
                "piece hash count does not match content size",
                format!("{} hashes for {} pieces", hashes.len(), layout.piece_count())
            ).into());
        }

        let pieces = hashes
            .into_iter()
            .enumerate()
            .map(|(index, hash)| {
                let frags = layout.frag_count(index as u32) as usize;
                Mutex::new(Piece {
                    state: PieceState::Free,
                    hash,
                    requested: Bitfield::new(frags),
                    have: Bitfield::new(frags),
                    write_count: 0,
                    owner: None,
                })
            })
            .collect::<Vec<_>>();

        let (events, rx) = mpsc::unbounded_channel();
        debug!(
            "Piece store: {} pieces of {} bytes, {} fragments",
            layout.piece_count(),
            layout.piece_length(),
            layout.total_frags()
        );

        let store = Self {
            free_count: AtomicUsize::new(pieces.len()),
            pieces,
            verified_count: AtomicUsize::new(0),
            verified_bytes: AtomicU64::new(0),
            end_game: AtomicBool::new(false),
            persisted: Mutex::new(Bitfield::new(layout.total_frags())),
            verified: Mutex::new(Bitfield::new(layout.piece_count() as usize)),
            readvertise: Mutex::new(Vec::new()),
            storage,
            events,
            rng: Mutex::new(StdRng::from_entropy()),
            layout,
        };
        Ok((store, rx))
    }

    /// Use a fixed seed for the end-game fragment choice
    pub fn with_rng_seed(self, seed: u64) -> Self {
        *self.rng.lock() = StdRng::seed_from_u64(seed);
        self
    }

    pub fn layout(&self) -> &PieceLayout {
        &self.layout
    }

    pub fn piece_count(&self) -> u32 {
        self.layout.piece_count()
    }

    /// Claim a piece for download
    ///
    /// A Free piece becomes Downloading. During end-game a trusted requester
    /// may also join a piece that is already Downloading.
    pub fn request_piece(&self, index: u32, requester: &Arc<PeerHandle>) -> bool {
        let Some(slot) = self.pieces.get(index as usize) else {
            return false;
        };
        let mut piece = slot.lock();
        let state = piece.state;
        match state {
            PieceState::Free => {
                piece.state = PieceState::Downloading;
                piece.owner = if piece.have.count_ones() == 0 {
                    Some(Arc::clone(requester))
                } else {
                    None
                };
                self.free_count.fetch_sub(1, Ordering::SeqCst);
                trace!("Piece {} claimed by {}", index, requester.addr());
                true
            }
            PieceState::Downloading if self.is_end_game() && requester.is_trusted() => {
                // more than one source now, so a bad hash can no longer be pinned on anyone
                piece.owner = None;
                trace!("Piece {} joined by {} in end-game", index, requester.addr());
                true
            }
            _ => false,
        }
    }

    /// Next fragment to request from a Downloading piece
    ///
    /// Hands out fragments in order. Once all are requested, end-game mode
    /// returns a random fragment that has not arrived yet.
    pub fn request_fragment(&self, index: u32) -> Option<PieceFrag> {
        let mut piece = self.pieces.get(index as usize)?.lock();
        if piece.state != PieceState::Downloading {
            return None;
        }

        let count = self.layout.frag_count(index);
        if let Some(frag) = (0..count).find(|&f| !piece.requested.get(f as usize)) {
            piece.requested.set(frag as usize);
            return Some(PieceFrag::new(index, frag));
        }

        if !self.is_end_game() {
            return None;
        }

        let missing: Vec<u32> = (0..count).filter(|&f| !piece.have.get(f as usize)).collect();
        if missing.is_empty() {
            return None;
        }
        let pick = missing[self.rng.lock().gen_range(0..missing.len())];
        Some(PieceFrag::new(index, pick))
    }

    /// Accept fragment bytes from a peer
    ///
    /// Returns false if the fragment was already present; the bytes are then dropped.
    pub fn fragment_received(&self, frag: PieceFrag, data: Bytes) -> bool {
        let Some(slot) = self.pieces.get(frag.index as usize) else {
            return false;
        };
        {
            let mut piece = slot.lock();
            if piece.state == PieceState::Verified || piece.have.get(frag.frag as usize) {
                trace!("Fragment {:?} already present", frag);
                return false;
            }
            piece.have.set(frag.frag as usize);
            piece.requested.set(frag.frag as usize);
        }
        self.storage.write_fragment(frag.index, frag.begin(), data);
        true
    }

    /// Storage finished writing a fragment
    pub fn fragment_write_completed(&self, index: u32, begin: u32, length: u32) {
        let Some(frag) = self.layout.frag_at(index, begin) else {
            warn!("Write completion for unknown fragment {}:{}", index, begin);
            return;
        };
        if length != self.layout.frag_len(frag) {
            warn!("Write completion for {:?} has length {}", frag, length);
            return;
        }

        let mut piece = self.pieces[index as usize].lock();
        if !piece.have.get(frag.frag as usize) {
            debug!("Dropping stale write completion for {:?}", frag);
            return;
        }
        {
            let mut persisted = self.persisted.lock();
            let global = self.layout.global_frag(frag);
            if persisted.get(global) {
                return;
            }
            persisted.set(global);
        }

        piece.write_count += 1;
        let complete = piece.write_count == self.layout.frag_count(index);
        if !complete || !matches!(piece.state, PieceState::Downloading | PieceState::Free) {
            return;
        }
        if piece.state == PieceState::Free {
            self.free_count.fetch_sub(1, Ordering::SeqCst);
        }
        piece.state = PieceState::Downloaded;
        drop(piece);

        debug!("Piece {} fully written, verifying", index);
        self.storage.read_piece(index);
    }

    /// Storage could not write a fragment; make it requestable again
    pub fn fragment_write_failed(&self, index: u32, begin: u32) {
        let Some(frag) = self.layout.frag_at(index, begin) else {
            return;
        };
        let mut piece = self.pieces[index as usize].lock();
        if piece.state == PieceState::Verified {
            return;
        }
        piece.have.clear(frag.frag as usize);
        piece.requested.clear(frag.frag as usize);
        let returned = piece.state == PieceState::Downloading;
        if returned {
            piece.state = PieceState::Free;
            piece.owner = None;
        }
        drop(piece);

        if returned {
            self.free_count.fetch_add(1, Ordering::SeqCst);
            self.readvertise.lock().push(index);
        }
        warn!("Write of {:?} failed, fragment will be fetched again", frag);
    }

    /// Storage read back a complete piece
    pub fn piece_read_completed(&self, index: u32, data: &[u8]) {
        let Some(slot) = self.pieces.get(index as usize) else {
            return;
        };
        let mut piece = slot.lock();
        if piece.state != PieceState::Downloaded {
            debug!("Ignoring read-back of piece {} in state {:?}", index, piece.state);
            return;
        }

        let matches = data.len() == self.layout.piece_len(index) as usize
            && Sha1::digest(data).as_slice() == piece.hash.as_slice();

        if matches {
            piece.state = PieceState::Verified;
            let owner = piece.owner.take();
            drop(piece);

            self.verified.lock().set(index as usize);
            let verified = self.verified_count.fetch_add(1, Ordering::SeqCst) + 1;
            self.verified_bytes.fetch_add(self.layout.piece_len(index) as u64, Ordering::SeqCst);
            info!("Piece {} verified ({}/{})", index, verified, self.piece_count());

            if let Some(peer) = owner {
                if peer.mark_trusted() {
                    info!("Peer {} is now trusted", peer.addr());
                }
            }

            let _ = self.events.send(StoreEvent::PieceVerified { index });
            if verified == self.piece_count() as usize {
                info!("All {} pieces verified", verified);
                let _ = self.events.send(StoreEvent::Completed);
            }
        } else {
            let offender = piece.owner.as_ref().map(|peer| peer.addr());
            piece.reset();
            drop(piece);
            self.free_count.fetch_add(1, Ordering::SeqCst);
            self.forget_fragments(index);
            self.readvertise.lock().push(index);

            warn!(
                "Piece {} failed verification{}",
                index,
                offender.map(|a| format!(", blaming {}", a)).unwrap_or_default()
            );
            let _ = self.events.send(StoreEvent::PieceCorrupted { index, offender });
        }
    }

    /// Storage could not read a piece back; start it over without blaming anyone
    pub fn piece_read_failed(&self, index: u32) {
        let Some(slot) = self.pieces.get(index as usize) else {
            return;
        };
        let mut piece = slot.lock();
        if piece.state != PieceState::Downloaded {
            return;
        }
        piece.reset();
        drop(piece);
        self.free_count.fetch_add(1, Ordering::SeqCst);
        self.forget_fragments(index);
        self.readvertise.lock().push(index);
        warn!("Read-back of piece {} failed, piece reset", index);
    }

    /// Return fragments a session will never deliver
    pub fn request_failed(&self, frags: &[PieceFrag]) {
        let mut touched = BTreeSet::new();
        for frag in frags {
            let Some(slot) = self.pieces.get(frag.index as usize) else {
                continue;
            };
            let mut piece = slot.lock();
            if !piece.have.get(frag.frag as usize) {
                piece.requested.clear(frag.frag as usize);
            }
            touched.insert(frag.index);
        }

        for index in touched {
            let mut piece = self.pieces[index as usize].lock();
            if piece.state != PieceState::Downloading {
                continue;
            }
            piece.state = PieceState::Free;
            piece.owner = None;
            drop(piece);
            self.free_count.fetch_add(1, Ordering::SeqCst);
            self.readvertise.lock().push(index);
            trace!("Piece {} returned to the pool", index);
        }
    }

    /// Enter end-game mode; later calls do nothing
    pub fn start_end_game(&self) {
        if self.end_game.swap(true, Ordering::SeqCst) {
            return;
        }
        let downloading: Vec<u32> = (0..self.piece_count())
            .filter(|&i| self.pieces[i as usize].lock().state == PieceState::Downloading)
            .collect();
        info!("Entering end-game with {} pieces in flight", downloading.len());
        self.readvertise.lock().extend(downloading);
    }

    pub fn is_end_game(&self) -> bool {
        self.end_game.load(Ordering::SeqCst)
    }

    /// Pieces that every session should offer to its selector again
    pub fn take_readvertised(&self) -> Vec<u32> {
        std::mem::take(&mut *self.readvertise.lock())
    }

    pub fn free_count(&self) -> usize {
        self.free_count.load(Ordering::SeqCst)
    }

    pub fn verified_count(&self) -> usize {
        self.verified_count.load(Ordering::SeqCst)
    }

    /// Bytes covered by verified pieces
    pub fn verified_bytes(&self) -> u64 {
        self.verified_bytes.load(Ordering::SeqCst)
    }

    /// Bytes still missing, as reported to trackers
    pub fn left(&self) -> u64 {
        self.layout.total_size().saturating_sub(self.verified_bytes())
    }

    pub fn is_complete(&self) -> bool {
        self.verified_count() == self.piece_count() as usize
    }

    pub fn piece_state(&self, index: u32) -> Option<PieceState> {
        self.pieces.get(index as usize).map(|p| p.lock().state)
    }

    pub fn is_verified(&self, index: u32) -> bool {
        self.piece_state(index) == Some(PieceState::Verified)
    }

    pub fn has_fragment(&self, frag: PieceFrag) -> bool {
        self.pieces
            .get(frag.index as usize)
            .map(|p| p.lock().have.get(frag.frag as usize))
            .unwrap_or(false)
    }

    /// Piece-level bitfield of verified pieces, as sent to peers
    pub fn verified_bitfield(&self) -> Bitfield {
        self.verified.lock().clone()
    }

    /// Whether a remote request can be served
    pub fn valid_request(&self, index: u32, begin: u32, length: u32) -> bool {
        if index >= self.piece_count() || length == 0 || length as usize > MAX_BLOCK_LEN {
            return false;
        }
        let end = begin as u64 + length as u64;
        end <= self.layout.piece_len(index) as u64 && self.is_verified(index)
    }

    /// Read the bytes of a block we are serving
    pub fn read_block(&self, block: &PeerFrag) -> Result<Vec<u8>> {
        let offset = self.layout.piece_offset(block.index) + block.begin as u64;
        self.storage.read_range(offset, block.length as usize)
    }

    /// Hash data already on disk and mark every matching piece Verified
    ///
    /// Pieces whose bytes cannot be read are left alone.
    pub fn verify_existing(&self) -> usize {
        let mut found = 0;
        for index in 0..self.piece_count() {
            if self.is_verified(index) {
                continue;
            }
            let offset = self.layout.piece_offset(index);
            let data = match self.storage.read_range(offset, self.layout.piece_len(index) as usize) {
                Ok(data) => data,
                Err(e) => {
                    trace!("Piece {} not readable: {}", index, e);
                    continue;
                }
            };
            let expected = self.pieces[index as usize].lock().hash;
            if Sha1::digest(&data).as_slice() == expected.as_slice() {
                self.mark_present(index);
                found += 1;
            }
        }
        info!("Found {} verified pieces on disk", found);
        found
    }

    fn mark_present(&self, index: u32) {
        let frags = self.layout.frag_count(index);
        let mut piece = self.pieces[index as usize].lock();
        if piece.state == PieceState::Verified {
            return;
        }
        if piece.state == PieceState::Free {
            self.free_count.fetch_sub(1, Ordering::SeqCst);
        }
        piece.state = PieceState::Verified;
        piece.have.set_range(0..frags as usize);
        piece.requested.set_range(0..frags as usize);
        piece.write_count = frags;
        piece.owner = None;
        drop(piece);

        let first = self.layout.global_frag(PieceFrag::new(index, 0));
        self.persisted.lock().set_range(first..first + frags as usize);
        self.verified.lock().set(index as usize);
        self.verified_count.fetch_add(1, Ordering::SeqCst);
        self.verified_bytes.fetch_add(self.layout.piece_len(index) as u64, Ordering::SeqCst);
    }

    fn forget_fragments(&self, index: u32) {
        let first = self.layout.global_frag(PieceFrag::new(index, 0));
        let frags = self.layout.frag_count(index) as usize;
        self.persisted.lock().clear_range(first..first + frags);
    }

    /// Capture the persisted bitsets
    pub fn snapshot(&self) -> PieceSnapshot {
        PieceSnapshot {
            have: self.persisted.lock().clone(),
            verified: self.verified.lock().clone(),
        }
    }

    /// Load persisted bitsets and rebuild piece state from them
    ///
    /// Bitsets whose size does not match this torrent are rejected.
    pub fn restore(&self, snapshot: PieceSnapshot) -> Result<()> {
        let have = snapshot.have.validated()?;
        let verified = snapshot.verified.validated()?;

        if have.len() != self.layout.total_frags() {
            return Err(TorrentError::validation_error_with_field(
                format!("fragment bitset has {} bits, expected {}", have.len(), self.layout.total_frags()),
                "have"
            ).into());
        }
        if verified.len() != self.piece_count() as usize {
            return Err(TorrentError::validation_error_with_field(
                format!("verified bitset has {} bits, expected {}", verified.len(), self.piece_count()),
                "verified"
            ).into());
        }

        *self.persisted.lock() = have;
        *self.verified.lock() = verified;
        self.init();
        Ok(())
    }

    /// Rebuild every piece from the persisted bitsets
    ///
    /// Pieces whose fragments are all present but unverified are queued for
    /// read-back verification.
    pub fn init(&self) {
        let persisted = self.persisted.lock().clone();
        let verified = self.verified.lock().clone();

        let mut free = 0;
        let mut verified_count = 0;
        let mut verified_bytes = 0u64;
        let mut to_verify = Vec::new();

        for index in 0..self.piece_count() {
            let frags = self.layout.frag_count(index);
            let first = self.layout.global_frag(PieceFrag::new(index, 0));
            let mut piece = self.pieces[index as usize].lock();
            piece.requested.clear_all();
            piece.have.clear_all();
            piece.owner = None;

            if verified.get(index as usize) {
                piece.state = PieceState::Verified;
                piece.have.set_range(0..frags as usize);
                piece.requested.set_range(0..frags as usize);
                piece.write_count = frags;
                verified_count += 1;
                verified_bytes += self.layout.piece_len(index) as u64;
                continue;
            }

            for frag in 0..frags as usize {
                if persisted.get(first + frag) {
                    piece.have.set(frag);
                    piece.requested.set(frag);
                }
            }
            piece.write_count = piece.have.count_ones() as u32;

            if piece.write_count < frags {
                piece.state = PieceState::Free;
                free += 1;
            } else {
                piece.state = PieceState::Downloaded;
                to_verify.push(index);
            }
        }

        self.free_count.store(free, Ordering::SeqCst);
        self.verified_count.store(verified_count, Ordering::SeqCst);
        self.verified_bytes.store(verified_bytes, Ordering::SeqCst);
        self.end_game.store(false, Ordering::SeqCst);
        self.readvertise.lock().clear();

        info!(
            "Restored state: {} verified, {} awaiting verification, {} free",
            verified_count,
            to_verify.len(),
            free
        );
        for index in to_verify {
            self.storage.read_piece(index);
        }
    }
}
