//! Torrent file parsing and error handling logic.
//!
//! This module provides types and error handling for working with `.torrent`
//! files: projecting a decoded Bencode tree into a typed metainfo record and
//! computing its info-hash.
use thiserror::Error;

pub mod descriptor;

pub use descriptor::{FileEntry, PieceWork, TorrentFile};

#[derive(Debug, Error)]
pub enum TorrentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("Invalid torrent file format: {0}")]
    InvalidFormat(String),

    #[error("Missing or invalid field: {0}")]
    MissingField(String),

    #[error("Invalid pieces hash length")]
    InvalidPiecesHashLength,

    #[error("Date parse error")]
    DateParseError,

    #[error("Url parsing error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("HTTP request error: {0}")]
    HttpRequest(#[from] reqwest::Error),

    #[error("Bencode deserialization error: {0}")]
    BencodeDe(#[from] serde_bencode::Error),
}

/// Result type for torrent operations derived from `std::result`.
pub type TorrentResult<T> = std::result::Result<T, TorrentError>;
