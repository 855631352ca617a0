//! Peer wire protocol: handshake, message framing, per-peer session state,
//! and the piece worker that drives a session to fetch whole pieces.
use std::time::Duration;
use thiserror::Error;

pub mod bitfield;
pub mod handshake;
pub mod message;
pub mod session;
pub mod worker;

pub use bitfield::Bitfield;
pub use handshake::Handshake;
pub use message::Message;
pub use session::PeerSession;

/// Block size for piece requests: 16 KiB, fixed by the wire protocol.
pub const BLOCK_SIZE: u32 = 1 << 14;

/// Maximum number of block requests a worker keeps in flight per piece.
pub const MAX_BACKLOG: usize = 5;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(3);
pub const BITFIELD_TIMEOUT: Duration = Duration::from_secs(5);
pub const PIECE_TIMEOUT: Duration = Duration::from_secs(30);

/// 20-byte client identifier, generated once per run by the tracker client
/// and shared with every peer session and handshake.
pub type PeerId = [u8; 20];

/// Errors that terminate a single peer session. All of these are recovered
/// locally by the piece worker: the session is torn down, its current work
/// item is requeued, and the download continues with whatever workers
/// remain.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("handshake mismatch: {0}")]
    HandshakeMismatch(String),

    #[error("unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    #[error("piece hash mismatch for piece {0}")]
    HashMismatch(u32),

    #[error("every worker exited with {done}/{total} pieces downloaded")]
    NoPeersRemaining { done: usize, total: usize },
}

pub type PeerResult<T> = std::result::Result<T, PeerError>;

impl From<tokio::time::error::Elapsed> for PeerError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        PeerError::Timeout
    }
}
