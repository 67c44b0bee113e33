//! Peer session
//!
//! The protocol state machine for one remote peer. It does no I/O itself:
//! the connection driver feeds it received bytes with [`PeerSession::receive`]
//! and writes whatever [`PeerSession::poll_send`] hands back.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use bytes::{Bytes, BytesMut};
use tracing::{debug, error, trace, warn};

use super::selector::{PieceSelector, StreamingSelector};
use super::state::{PeerFlags, PeerHandle, SessionState};
use crate::context::TorrentContext;
use crate::error::TorrentError;
use crate::protocol::{max_frame_len, read_handshake, read_message, Handshake, Message};
use crate::storage::{Bitfield, PeerFrag, PieceFrag};

/// Outstanding requests per session
pub const MAX_REQUESTED_FRAGS: usize = 8;

/// Remote requests queued beyond this are dropped
const MAX_REMOTE_REQUESTS: usize = 256;

/// Canceled fragments remembered for late arrivals
const MAX_CANCELED_FRAGS: usize = 4 * MAX_REQUESTED_FRAGS;

/// Instructions from the session manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCommand {
    /// We verified a piece; tell the remote
    Have(u32),
    /// Offer a piece to the selector again if the remote has it
    AddPiece(u32),
    SetStreaming(bool),
    Close,
}

/// One peer's protocol state
#[derive(Debug)]
pub struct PeerSession {
    ctx: Arc<TorrentContext>,
    handle: Arc<PeerHandle>,
    state: SessionState,
    flags: PeerFlags,
    remote_pieces: Bitfield,
    bitfield_received: bool,
    selector: PieceSelector,
    requested: Vec<PieceFrag>,
    canceled: Vec<PieceFrag>,
    remote_requests: VecDeque<PeerFrag>,
    pending_haves: VecDeque<u32>,
    handshake_sent: bool,
    bitfield_sent: bool,
    one_downloaded: bool,
    recv: BytesMut,
    max_frame: usize,
}

impl PeerSession {
    /// A session for a connected transport, waiting for the remote handshake
    pub fn new(ctx: Arc<TorrentContext>, handle: Arc<PeerHandle>, streaming: bool) -> Self {
        let piece_count = ctx.store.piece_count() as usize;
        Self {
            remote_pieces: Bitfield::new(piece_count),
            max_frame: max_frame_len(piece_count),
            one_downloaded: ctx.store.verified_count() > 0,
            selector: PieceSelector::new(streaming),
            ctx,
            handle,
            state: SessionState::Handshaking,
            flags: PeerFlags::default(),
            bitfield_received: false,
            requested: Vec::with_capacity(MAX_REQUESTED_FRAGS),
            canceled: Vec::new(),
            remote_requests: VecDeque::new(),
            pending_haves: VecDeque::new(),
            handshake_sent: false,
            bitfield_sent: false,
            recv: BytesMut::with_capacity(32 * 1024),
        }
    }

    pub fn addr(&self) -> std::net::SocketAddr {
        self.handle.addr()
    }

    pub fn handle(&self) -> &Arc<PeerHandle> {
        &self.handle
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn flags(&self) -> PeerFlags {
        self.flags
    }

    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    pub fn remote_pieces(&self) -> &Bitfield {
        &self.remote_pieces
    }

    pub fn requested(&self) -> &[PieceFrag] {
        &self.requested
    }

    /// Feed bytes read from the transport
    pub fn receive(&mut self, data: &[u8]) -> Result<()> {
        if self.state.is_closed() {
            return Ok(());
        }
        self.recv.extend_from_slice(data);

        if self.state == SessionState::Handshaking {
            let Some(handshake) = read_handshake(&mut self.recv, &self.ctx.info_hash)? else {
                return Ok(());
            };
            if handshake.peer_id == self.ctx.peer_id {
                return Err(TorrentError::protocol_error("connected to ourselves").into());
            }
            self.state = SessionState::Active;
            let active = self.ctx.peer_connected();
            debug!(
                "Handshake with {} complete, peer id {} ({} active)",
                self.addr(),
                String::from_utf8_lossy(&handshake.peer_id),
                active
            );
        }

        while let Some(message) = read_message(&mut self.recv, self.max_frame)? {
            self.handle_message(message)?;
        }
        Ok(())
    }

    fn violation(&self, message: impl Into<String>) -> anyhow::Error {
        let message = message.into();
        error!("Protocol violation from {}: {}", self.addr(), message);
        TorrentError::protocol_error_with_source(message, self.addr().to_string()).into()
    }

    fn handle_message(&mut self, message: Message) -> Result<()> {
        trace!("{} -> {:?}", self.addr(), message.message_id());
        let store = Arc::clone(&self.ctx.store);

        match message {
            Message::KeepAlive => {}
            Message::Choke => {
                self.flags.peer_choking = true;
                if !self.requested.is_empty() {
                    let dropped = std::mem::take(&mut self.requested);
                    store.request_failed(&dropped);
                    self.remember_canceled(dropped);
                }
            }
            Message::Unchoke => {
                self.flags.peer_choking = false;
            }
            Message::Interested => {
                self.flags.peer_interested = true;
            }
            Message::NotInterested => {
                self.flags.peer_interested = false;
            }
            Message::Have { piece_index } => {
                if piece_index >= store.piece_count() {
                    return Err(self.violation(format!("have for piece {} out of range", piece_index)));
                }
                if !self.remote_pieces.get(piece_index as usize) {
                    self.remote_pieces.set(piece_index as usize);
                    if !store.is_verified(piece_index) {
                        self.selector.add_piece(piece_index);
                    }
                }
            }
            Message::Bitfield { bitfield } => {
                if self.bitfield_received {
                    return Err(self.violation("duplicate bitfield"));
                }
                let remote = Bitfield::from_bytes(&bitfield, store.piece_count() as usize)
                    .map_err(|e| self.violation(format!("bad bitfield: {}", e)))?;
                for index in remote.iter_ones() {
                    if !store.is_verified(index as u32) {
                        self.selector.add_piece(index as u32);
                    }
                }
                debug!("{} has {}/{} pieces", self.addr(), remote.count_ones(), remote.len());
                self.remote_pieces = remote;
                self.bitfield_received = true;
            }
            Message::Request { index, begin, length } => {
                let in_range = index < store.piece_count()
                    && begin as u64 + length as u64 <= store.layout().piece_len(index) as u64;
                if !in_range {
                    return Err(self.violation(format!("request {}:{}+{} out of range", index, begin, length)));
                }
                if self.flags.am_choking || !store.valid_request(index, begin, length) {
                    trace!("Ignoring request {}:{} from {}", index, begin, self.addr());
                } else if self.remote_requests.len() < MAX_REMOTE_REQUESTS {
                    self.remote_requests.push_back(PeerFrag { index, begin, length });
                }
            }
            Message::Piece { index, begin, block } => {
                let layout = *store.layout();
                let Some(frag) = layout.frag_at(index, begin) else {
                    return Err(self.violation(format!("piece {}:{} is not a fragment", index, begin)));
                };
                if block.len() != layout.frag_len(frag) as usize {
                    return Err(self.violation(format!(
                        "piece {}:{} has {} bytes, expected {}",
                        index,
                        begin,
                        block.len(),
                        layout.frag_len(frag)
                    )));
                }
                if let Some(pos) = self.requested.iter().position(|f| *f == frag) {
                    self.requested.swap_remove(pos);
                } else if let Some(pos) = self.canceled.iter().position(|f| *f == frag) {
                    self.canceled.swap_remove(pos);
                } else {
                    return Err(self.violation(format!("unrequested piece {}:{}", index, begin)));
                }

                let len = block.len() as u64;
                self.handle.add_downloaded(len);
                self.ctx.stats.add_downloaded(len);
                if !store.fragment_received(frag, block) {
                    trace!("Fragment {:?} from {} was already held", frag, self.addr());
                }
            }
            Message::Cancel { index, begin, length } => {
                self.remote_requests
                    .retain(|r| !(r.index == index && r.begin == begin && r.length == length));
            }
            Message::Unknown { id, length } => {
                trace!("Skipped unknown message {} ({} bytes) from {}", id, length, self.addr());
            }
        }
        Ok(())
    }

    fn remember_canceled(&mut self, frags: impl IntoIterator<Item = PieceFrag>) {
        self.canceled.extend(frags);
        if self.canceled.len() > MAX_CANCELED_FRAGS {
            let excess = self.canceled.len() - MAX_CANCELED_FRAGS;
            self.canceled.drain(..excess);
        }
    }

    /// Apply a command from the session manager
    pub fn handle_command(&mut self, command: SessionCommand) {
        match command {
            SessionCommand::Have(index) => {
                self.one_downloaded = true;
                self.pending_haves.push_back(index);
            }
            SessionCommand::AddPiece(index) => {
                if self.remote_pieces.get(index as usize) && !self.ctx.store.is_verified(index) {
                    self.selector.add_piece(index);
                }
            }
            SessionCommand::SetStreaming(streaming) => {
                if streaming && !self.selector.is_streaming() && !self.tail_verified() {
                    // fetch the tail again before committing to index order
                    self.one_downloaded = false;
                }
                self.selector.switch_to(streaming);
            }
            SessionCommand::Close => self.close(),
        }
    }

    fn tail_verified(&self) -> bool {
        let store = &self.ctx.store;
        let count = store.piece_count();
        (StreamingSelector::tail_start(count)..count).all(|index| store.is_verified(index))
    }

    /// Next batch of bytes to write, if there is anything to say
    pub fn poll_send(&mut self) -> Option<Bytes> {
        let mut out = BytesMut::new();

        if !self.handshake_sent {
            self.handshake_sent = true;
            Handshake::new(self.ctx.info_hash, self.ctx.peer_id).encode(&mut out);
            return Some(out.freeze());
        }
        if !self.state.is_active() {
            return None;
        }

        let store = Arc::clone(&self.ctx.store);

        if !self.bitfield_sent {
            self.bitfield_sent = true;
            let ours = store.verified_bitfield();
            if ours.count_ones() > 0 {
                Message::Bitfield {
                    bitfield: Bytes::copy_from_slice(ours.as_bytes()),
                }
                .encode(&mut out);
            }
        }

        if !self.flags.am_interested && self.selector.has_candidates() {
            self.flags.am_interested = true;
            Message::Interested.encode(&mut out);
        } else if self.flags.am_interested && !self.selector.has_candidates() && self.requested.is_empty() {
            self.flags.am_interested = false;
            Message::NotInterested.encode(&mut out);
        }

        if self.flags.peer_interested && self.flags.am_choking {
            self.flags.am_choking = false;
            Message::Unchoke.encode(&mut out);
        }

        if self.flags.can_request() {
            while self.requested.len() < MAX_REQUESTED_FRAGS {
                let Some(frag) = self.selector.select_piece(&store, &self.handle, self.one_downloaded) else {
                    break;
                };
                if self.requested.contains(&frag) {
                    break;
                }
                self.canceled.retain(|f| *f != frag);
                let block = store.layout().to_peer_frag(frag);
                Message::Request {
                    index: block.index,
                    begin: block.begin,
                    length: block.length,
                }
                .encode(&mut out);
                self.requested.push(frag);
            }
        }

        if store.is_end_game() {
            let (held, waiting): (Vec<PieceFrag>, Vec<PieceFrag>) =
                self.requested.iter().partition(|f| store.has_fragment(**f));
            if !held.is_empty() {
                for frag in &held {
                    let block = store.layout().to_peer_frag(*frag);
                    Message::Cancel {
                        index: block.index,
                        begin: block.begin,
                        length: block.length,
                    }
                    .encode(&mut out);
                }
                trace!("Canceled {} fragments at {}", held.len(), self.addr());
                self.requested = waiting;
                self.remember_canceled(held);
            }
        }

        while let Some(index) = self.pending_haves.pop_front() {
            Message::Have { piece_index: index }.encode(&mut out);
        }

        while let Some(block) = self.remote_requests.pop_front() {
            match store.read_block(&block) {
                Ok(data) => {
                    Message::Piece {
                        index: block.index,
                        begin: block.begin,
                        block: Bytes::from(data),
                    }
                    .encode(&mut out);
                    self.handle.add_uploaded(block.length as u64);
                    self.ctx.stats.add_uploaded(block.length as u64);
                    break;
                }
                Err(e) => warn!("Cannot serve {:?} to {}: {}", block, self.addr(), e),
            }
        }

        if out.is_empty() {
            None
        } else {
            Some(out.freeze())
        }
    }

    /// Encoded keep-alive
    pub fn keepalive() -> Bytes {
        Bytes::from(Message::KeepAlive.serialize())
    }

    /// Tear down: return outstanding requests to the piece store
    ///
    /// Fragments canceled earlier were already returned. Later calls do nothing.
    pub fn close(&mut self) {
        if self.state.is_closed() {
            return;
        }
        if !self.requested.is_empty() {
            let requested = std::mem::take(&mut self.requested);
            self.ctx.store.request_failed(&requested);
        }
        self.canceled.clear();
        self.remote_requests.clear();
        if self.state.is_active() {
            self.ctx.peer_disconnected();
        }
        self.state = SessionState::Closed;
        debug!("Session with {} closed", self.addr());
    }
}

impl Drop for PeerSession {
    fn drop(&mut self) {
        self.close();
    }
}
