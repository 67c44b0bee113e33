//! Storage module
//!
//! Piece bookkeeping, the storage backends it writes through, and resume
//! state.

pub mod backend;
pub mod bitfield;
pub mod disk;
pub mod file;
pub mod memory;
pub mod piece;
pub mod resume;

pub use backend::Storage;
pub use bitfield::Bitfield;
pub use disk::{DiskIo, DiskRequest, DiskWorker};
pub use file::{FileEntry, FileLayout};
pub use memory::MemoryStorage;
pub use piece::{
    PeerFrag, PieceFrag, PieceLayout, PieceSnapshot, PieceState, PieceStore, StoreEvent,
    FRAG_LENGTH,
};
pub use resume::{ResumeData, ResumeManager};
