//! Library root for rs-torrent-client.
//!
//! Re-exports core modules: bencode, torrent, peer, download, and tracker
//! for use in the `rstc` binary and other consumers.
pub mod bencode;
pub mod download;
pub mod peer;
pub mod torrent;
pub mod tracker;
