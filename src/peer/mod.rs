//! Peer module
//!
//! Peer sessions, the piece selection they use, and the manager that owns
//! them.

pub mod connection;
pub mod manager;
pub mod selector;
pub mod session;
pub mod state;

pub use connection::{ConnectionTimeouts, PeerConnection};
pub use manager::SessionManager;
pub use selector::{PieceSelector, RaritySelector, StreamingSelector};
pub use session::{PeerSession, SessionCommand, MAX_REQUESTED_FRAGS};
pub use state::{PeerFlags, PeerHandle, SessionState};
