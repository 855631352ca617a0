//! Projects a decoded Bencode tree into a typed, immutable torrent
//! descriptor and the piece-work items derived from it.
use super::{TorrentError, TorrentResult};
use crate::bencode::{decoder, Node, Value};
use sha1::{Digest, Sha1};
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};
use tracing::instrument;

/// SHA-1 of an arbitrary byte slice. Shared by info-hash computation and
/// per-piece hash verification so there is exactly one place that reaches
/// for the `sha1` crate.
pub fn sha1(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    hasher.finalize().into()
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct FileEntry {
    pub length: i64,
    pub path: Vec<String>,
}

/// A fully projected `.torrent` file.
///
/// Everything here is computed once at parse time and never mutated
/// afterward; workers and the coordinator only ever read it.
#[derive(Debug, Clone)]
pub struct TorrentFile {
    pub announce: String,
    pub announce_list: Vec<Vec<String>>,
    pub creation_date: Option<std::time::SystemTime>,
    pub comment: String,
    pub created_by: String,
    pub encoding: String,
    pub name: String,
    pub piece_length: i64,
    pub files: Vec<FileEntry>,
    pub info_hash: [u8; 20],
    pub piece_hashes: Vec<[u8; 20]>,
}

/// One piece's worth of scheduling metadata: what the worker must fetch and
/// what hash it must match. Carries no bytes of its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceWork {
    pub index: u32,
    pub hash: [u8; 20],
    pub length: u32,
}

impl TorrentFile {
    /// Total byte length of the torrent's content: the summed file lengths
    /// in multi-file mode, or the single top-level length otherwise.
    pub fn length(&self) -> i64 {
        self.files.iter().map(|f| f.length).sum()
    }

    pub fn num_pieces(&self) -> usize {
        self.piece_hashes.len()
    }

    /// Byte length of piece `index`: `piece_length` for every piece except
    /// the last, which absorbs whatever remainder is left over.
    pub fn piece_size(&self, index: usize) -> u32 {
        let total = self.length();
        let full = self.piece_length;
        if index + 1 == self.num_pieces() {
            (total - full * (self.num_pieces() as i64 - 1)) as u32
        } else {
            full as u32
        }
    }

    /// Builds the full set of piece-work items, one per piece index, in
    /// order. This is the sole producer of work items: the coordinator
    /// seeds its queue from this list exactly once at the start of a
    /// download and never constructs another `PieceWork` afterward.
    pub fn piece_work_items(&self) -> Vec<PieceWork> {
        (0..self.num_pieces())
            .map(|i| PieceWork {
                index: i as u32,
                hash: self.piece_hashes[i],
                length: self.piece_size(i),
            })
            .collect()
    }

    /// Parses a `.torrent` file's raw bytes into a [`TorrentFile`].
    ///
    /// The info-hash is computed over `data[info_node.span]` directly —
    /// the original bytes as they appeared in the file — never over a
    /// re-encoding of the parsed dictionary. Re-encoding would only
    /// reproduce the original bytes if the source happened to already be
    /// canonical (sorted keys, no redundant leading zeros, etc.), which is
    /// not guaranteed for files produced by other clients.
    #[instrument(skip(data), level = "debug")]
    pub fn parse(data: &[u8]) -> TorrentResult<TorrentFile> {
        let root = decoder::decode(data)?;
        let dict = root
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("root is not a dictionary".into()))?;

        let announce = get_string(dict, "announce")?;

        let info_node = dict
            .get(&b"info".to_vec())
            .ok_or_else(|| TorrentError::MissingField("info".into()))?;
        let info_hash = sha1(&data[info_node.span.clone()]);
        let info_dict = info_node
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("info is not a dictionary".into()))?;

        let piece_length = get_int(info_dict, "piece length")?;
        let pieces_bytes = get_bytes(info_dict, "pieces")?;
        let name = get_string(info_dict, "name")?;

        let length_field = info_dict.get(&b"length".to_vec());
        let files_field = info_dict.get(&b"files".to_vec());
        let files = match (length_field, files_field) {
            (Some(_), Some(_)) => {
                return Err(TorrentError::InvalidFormat(
                    "info dict has both `length` and `files`".into(),
                ));
            }
            (None, None) => {
                return Err(TorrentError::InvalidFormat(
                    "info dict has neither `length` nor `files`".into(),
                ));
            }
            (Some(node), None) => {
                let length = node
                    .as_int()
                    .ok_or_else(|| TorrentError::InvalidFormat("length is not an integer".into()))?;
                vec![FileEntry {
                    length,
                    path: vec![name.clone()],
                }]
            }
            (None, Some(node)) => parse_files(node)?,
        };

        let piece_hashes = split_piece_hashes(&pieces_bytes)?;

        let announce_list = dict
            .get(&b"announce-list".to_vec())
            .map(parse_announce_list)
            .transpose()?
            .unwrap_or_default();

        let creation_date = dict
            .get(&b"creation date".to_vec())
            .and_then(|n| n.as_int())
            .and_then(|secs| u64::try_from(secs).ok())
            .map(|secs| UNIX_EPOCH + Duration::from_secs(secs));

        let comment = dict
            .get(&b"comment".to_vec())
            .and_then(|n| n.as_str_bytes())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let created_by = dict
            .get(&b"created by".to_vec())
            .and_then(|n| n.as_str_bytes())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();
        let encoding = dict
            .get(&b"encoding".to_vec())
            .and_then(|n| n.as_str_bytes())
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .unwrap_or_default();

        let torrent = TorrentFile {
            announce,
            announce_list,
            creation_date,
            comment,
            created_by,
            encoding,
            name,
            piece_length,
            files,
            info_hash,
            piece_hashes,
        };

        let expected_pieces = (torrent.length() + torrent.piece_length - 1) / torrent.piece_length;
        if torrent.num_pieces() as i64 != expected_pieces {
            return Err(TorrentError::InvalidFormat(format!(
                "piece count {} does not match ceil(length / piece_length) = {}",
                torrent.num_pieces(),
                expected_pieces
            )));
        }

        Ok(torrent)
    }

    /// File paths (joined under `name`) that overlap piece `index`. Purely
    /// presentational: the core never opens or writes these paths itself.
    pub fn file_paths_for_piece(&self, index: usize) -> Vec<PathBuf> {
        if index >= self.num_pieces() {
            return Vec::new();
        }
        let piece_start = index as i64 * self.piece_length;
        let piece_end = piece_start + self.piece_size(index) as i64;

        let mut cursor = 0i64;
        let mut paths = Vec::new();
        for file in &self.files {
            let file_start = cursor;
            let file_end = file_start + file.length;
            if file_end > piece_start && file_start < piece_end {
                let mut full = PathBuf::from(&self.name);
                for component in &file.path {
                    full = full.join(component);
                }
                paths.push(full);
            }
            cursor = file_end;
        }
        paths
    }
}

fn get_string(dict: &std::collections::BTreeMap<Vec<u8>, Node>, key: &str) -> TorrentResult<String> {
    let bytes = get_bytes(dict, key)?;
    String::from_utf8(bytes)
        .map_err(|e| TorrentError::InvalidFormat(format!("`{key}` is not UTF-8: {e}")))
}

fn get_bytes(dict: &std::collections::BTreeMap<Vec<u8>, Node>, key: &str) -> TorrentResult<Vec<u8>> {
    dict.get(key.as_bytes())
        .and_then(|n| n.as_str_bytes())
        .map(|b| b.to_vec())
        .ok_or_else(|| TorrentError::MissingField(key.to_string()))
}

fn get_int(dict: &std::collections::BTreeMap<Vec<u8>, Node>, key: &str) -> TorrentResult<i64> {
    dict.get(key.as_bytes())
        .and_then(|n| n.as_int())
        .ok_or_else(|| TorrentError::MissingField(key.to_string()))
}

fn parse_files(node: &Node) -> TorrentResult<Vec<FileEntry>> {
    let list = node
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("files is not a list".into()))?;
    let mut out = Vec::with_capacity(list.len());
    for entry in list {
        let dict = entry
            .as_dict()
            .ok_or_else(|| TorrentError::InvalidFormat("file entry is not a dict".into()))?;
        let length = get_int(dict, "length")?;
        let path_node = dict
            .get(&b"path".to_vec())
            .ok_or_else(|| TorrentError::MissingField("path".into()))?;
        let path_list = path_node
            .as_list()
            .ok_or_else(|| TorrentError::InvalidFormat("path is not a list".into()))?;
        let mut path = Vec::with_capacity(path_list.len());
        for component in path_list {
            let bytes = component
                .as_str_bytes()
                .ok_or_else(|| TorrentError::InvalidFormat("path component is not a string".into()))?;
            path.push(String::from_utf8(bytes.to_vec()).map_err(|e| {
                TorrentError::InvalidFormat(format!("path component is not UTF-8: {e}"))
            })?);
        }
        out.push(FileEntry { length, path });
    }
    Ok(out)
}

fn parse_announce_list(node: &Node) -> TorrentResult<Vec<Vec<String>>> {
    let tiers = node
        .as_list()
        .ok_or_else(|| TorrentError::InvalidFormat("announce-list is not a list".into()))?;
    let mut result = Vec::with_capacity(tiers.len());
    for tier in tiers {
        let tier_list = tier
            .as_list()
            .ok_or_else(|| TorrentError::InvalidFormat("announce-list tier is not a list".into()))?;
        let mut urls = Vec::with_capacity(tier_list.len());
        for url in tier_list {
            let bytes = url
                .as_str_bytes()
                .ok_or_else(|| TorrentError::InvalidFormat("tracker URL is not a string".into()))?;
            urls.push(String::from_utf8(bytes.to_vec()).map_err(|e| {
                TorrentError::InvalidFormat(format!("tracker URL is not UTF-8: {e}"))
            })?);
        }
        result.push(urls);
    }
    Ok(result)
}

/// `pieces` is the concatenation of one 20-byte SHA-1 digest per piece.
fn split_piece_hashes(pieces: &[u8]) -> TorrentResult<Vec<[u8; 20]>> {
    if pieces.len() % 20 != 0 {
        return Err(TorrentError::InvalidPiecesHashLength);
    }
    Ok(pieces
        .chunks_exact(20)
        .map(|chunk| {
            let mut h = [0u8; 20];
            h.copy_from_slice(chunk);
            h
        })
        .collect())
}
