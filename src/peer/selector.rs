//! Piece selection
//!
//! Each session owns a [`PieceSelector`] holding the pieces its remote has
//! that might still be worth requesting. The selector keeps draining the piece
//! it is working on before claiming another one from the piece store.

use std::collections::BTreeSet;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::state::PeerHandle;
use crate::storage::{PieceFrag, PieceStore};

/// Candidates in random order
#[derive(Debug)]
pub struct RaritySelector {
    pieces: Vec<u32>,
    current: Option<u32>,
    rng: StdRng,
}

impl RaritySelector {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_entropy())
    }

    pub fn with_rng(rng: StdRng) -> Self {
        Self {
            pieces: Vec::new(),
            current: None,
            rng,
        }
    }

    fn add_piece(&mut self, index: u32) {
        self.pieces.push(index);
        let last = self.pieces.len() - 1;
        let swap = self.rng.gen_range(0..=last);
        self.pieces.swap(swap, last);
    }
}

impl Default for RaritySelector {
    fn default() -> Self {
        Self::new()
    }
}

/// Candidates in index order, for playing content while it downloads
#[derive(Debug, Default)]
pub struct StreamingSelector {
    pieces: BTreeSet<u32>,
    current: Option<u32>,
}

impl StreamingSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// First index of the tail (top tenth) fetched before going sequential
    pub fn tail_start(piece_count: u32) -> u32 {
        (piece_count as u64 * 9 / 10) as u32
    }

    /// Lowest index once a piece has come in; before that only the tail
    /// is fetched
    fn next_candidate(&mut self, piece_count: u32, one_downloaded: bool) -> Option<u32> {
        if one_downloaded {
            return self.pieces.pop_first();
        }
        let index = self.pieces.pop_last()?;
        if index < Self::tail_start(piece_count) {
            self.pieces.insert(index);
            return None;
        }
        Some(index)
    }
}

/// Strategy deciding which fragment a session requests next
#[derive(Debug)]
pub enum PieceSelector {
    Rarity(RaritySelector),
    Streaming(StreamingSelector),
}

impl PieceSelector {
    pub fn new(streaming: bool) -> Self {
        if streaming {
            PieceSelector::Streaming(StreamingSelector::new())
        } else {
            PieceSelector::Rarity(RaritySelector::new())
        }
    }

    pub fn is_streaming(&self) -> bool {
        matches!(self, PieceSelector::Streaming(_))
    }

    /// Offer a piece the remote has
    pub fn add_piece(&mut self, index: u32) {
        match self {
            PieceSelector::Rarity(s) => s.add_piece(index),
            PieceSelector::Streaming(s) => {
                s.pieces.insert(index);
            }
        }
    }

    /// Whether anything is left to ask for
    pub fn has_candidates(&self) -> bool {
        match self {
            PieceSelector::Rarity(s) => s.current.is_some() || !s.pieces.is_empty(),
            PieceSelector::Streaming(s) => s.current.is_some() || !s.pieces.is_empty(),
        }
    }

    pub fn candidate_count(&self) -> usize {
        match self {
            PieceSelector::Rarity(s) => s.pieces.len(),
            PieceSelector::Streaming(s) => s.pieces.len(),
        }
    }

    fn current_mut(&mut self) -> &mut Option<u32> {
        match self {
            PieceSelector::Rarity(s) => &mut s.current,
            PieceSelector::Streaming(s) => &mut s.current,
        }
    }

    /// Next fragment to request, claiming a new piece from the store if the
    /// current one has nothing left to hand out
    pub fn select_piece(
        &mut self,
        store: &PieceStore,
        requester: &Arc<PeerHandle>,
        one_downloaded: bool,
    ) -> Option<PieceFrag> {
        if let Some(index) = *self.current_mut() {
            if let Some(frag) = store.request_fragment(index) {
                return Some(frag);
            }
            *self.current_mut() = None;
        }

        let piece_count = store.piece_count();
        loop {
            let index = match self {
                PieceSelector::Rarity(s) => s.pieces.pop(),
                PieceSelector::Streaming(s) => s.next_candidate(piece_count, one_downloaded),
            }?;
            if !store.request_piece(index, requester) {
                continue;
            }
            if let Some(frag) = store.request_fragment(index) {
                *self.current_mut() = Some(index);
                return Some(frag);
            }
        }
    }

    /// Hand every candidate, including the piece in progress, to `other`
    pub fn move_pieces_to(&mut self, other: &mut PieceSelector) {
        let pieces: Vec<u32> = match self {
            PieceSelector::Rarity(s) => std::mem::take(&mut s.pieces),
            PieceSelector::Streaming(s) => std::mem::take(&mut s.pieces).into_iter().collect(),
        };
        for index in pieces {
            other.add_piece(index);
        }
        if let Some(current) = self.current_mut().take() {
            if other.current_mut().is_none() {
                *other.current_mut() = Some(current);
            } else {
                other.add_piece(current);
            }
        }
    }

    /// Swap to the other variant if `streaming` differs, keeping every candidate
    pub fn switch_to(&mut self, streaming: bool) {
        if self.is_streaming() == streaming {
            return;
        }
        let mut next = PieceSelector::new(streaming);
        self.move_pieces_to(&mut next);
        *self = next;
    }
}
