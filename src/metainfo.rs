//! `.torrent` metadata parsing: v1 (BEP 3), v2 (BEP 52), and hybrid
//! torrents, plus BEP 47 padding-file handling.
//!
//! Parsing goes through [`crate::bencode::BencodeValue`] rather than typed
//! `serde` structs: BEP 52's `piece layers` dict is keyed by raw 32-byte
//! Merkle roots, which serde's string-keyed map deserialization can't
//! represent. A value-level walk handles both the regular fields and that
//! exotic one uniformly.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use sha1::Digest;
use url::Url;

use crate::bencode::BencodeValue;
use crate::error::metainfo::MetainfoError;
use crate::storage_info::FileInfo;
use crate::{Sha1Hash, Sha256Hash, BLOCK_LEN};

pub(crate) type Result<T> = std::result::Result<T, MetainfoError>;

const MIN_V2_PIECE_LEN: u32 = BLOCK_LEN;

/// A parsed `.torrent` file, covering v1, v2, and hybrid metadata.
#[derive(Clone)]
pub struct TorrentInfo {
    pub name: String,
    /// Present for pure-v1 and hybrid torrents.
    pub info_hash_v1: Option<Sha1Hash>,
    /// Present for pure-v2 and hybrid torrents. BEP 52 defines this as the
    /// SHA-256 hash of the bencoded `info` dict; when a 20-byte identifier is
    /// needed (e.g. the peer-wire handshake) it is truncated to the first 20
    /// bytes.
    pub info_hash_v2: Option<Sha256Hash>,
    pub piece_len: u32,
    pub files: Vec<FileInfo>,
    /// The flat concatenation of 20-byte SHA-1 piece hashes, present for
    /// pure-v1 and hybrid torrents.
    pub pieces: Option<Vec<u8>>,
    /// Per-file v2 Merkle piece layers, keyed by the file's `pieces_root`.
    /// Present for pure-v2 and hybrid torrents.
    pub piece_layers: HashMap<Sha256Hash, Vec<Sha256Hash>>,
    pub trackers: Vec<Url>,
    pub private: bool,
}

impl fmt::Debug for TorrentInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TorrentInfo")
            .field("name", &self.name)
            .field("info_hash_v1", &self.info_hash_v1)
            .field("info_hash_v2", &self.info_hash_v2.is_some())
            .field("piece_len", &self.piece_len)
            .field("files", &self.files.len())
            .finish()
    }
}

impl TorrentInfo {
    pub fn is_v1(&self) -> bool {
        self.info_hash_v1.is_some()
    }

    pub fn is_v2(&self) -> bool {
        self.info_hash_v2.is_some()
    }

    pub fn is_hybrid(&self) -> bool {
        self.is_v1() && self.is_v2()
    }

    pub fn is_archive(&self) -> bool {
        self.files.iter().filter(|f| !f.is_padding).count() > 1
    }

    /// Parses and validates a `.torrent` file's raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let (root, _) = BencodeValue::decode(bytes).map_err(|_| MetainfoError::InvalidMetainfo)?;
        let info = root.get(b"info").ok_or(MetainfoError::InvalidMetainfo)?;

        let name = info
            .get(b"name")
            .and_then(BencodeValue::as_bytes)
            .map(|b| String::from_utf8_lossy(b).into_owned())
            .ok_or(MetainfoError::InvalidMetainfo)?;

        let piece_len = info
            .get(b"piece length")
            .and_then(BencodeValue::as_int)
            .ok_or(MetainfoError::InvalidMetainfo)?;
        if piece_len <= 0 {
            return Err(MetainfoError::InvalidMetainfo);
        }
        let piece_len = piece_len as u32;

        let private = info.get(b"private").and_then(BencodeValue::as_int) == Some(1);

        let meta_version = info.get(b"meta version").and_then(BencodeValue::as_int);
        let has_v2 = meta_version.is_some() || info.get(b"file tree").is_some();
        if let Some(version) = meta_version {
            if version != 2 {
                return Err(MetainfoError::UnsupportedMetaVersion(version));
            }
            if !piece_len.is_power_of_two() || piece_len < MIN_V2_PIECE_LEN {
                return Err(MetainfoError::InvalidPieceLength);
            }
        }

        let raw_pieces = info.get(b"pieces").and_then(BencodeValue::as_bytes);
        let has_v1 = raw_pieces.is_some();
        if !has_v1 && !has_v2 {
            return Err(MetainfoError::InvalidMetainfo);
        }
        if let Some(pieces) = raw_pieces {
            if pieces.len() % 20 != 0 {
                return Err(MetainfoError::InvalidPieces);
            }
        }

        let v1_files = if has_v1 {
            Some(parse_v1_files(info, &name)?)
        } else {
            None
        };

        let (v2_files, piece_layers) = if has_v2 {
            let tree = info
                .get(b"file tree")
                .ok_or(MetainfoError::InvalidMetainfo)?;
            let mut entries = Vec::new();
            let mut prefix = Vec::new();
            walk_file_tree(tree, &mut prefix, &mut entries)?;
            if entries.is_empty() {
                return Err(MetainfoError::InvalidMetainfo);
            }

            let mut piece_layers = HashMap::new();
            if let Some(layers_dict) = root.get(b"piece layers").and_then(BencodeValue::as_dict) {
                for (key, value) in layers_dict {
                    let root_hash: Sha256Hash = key
                        .as_slice()
                        .try_into()
                        .map_err(|_| MetainfoError::InvalidMetainfo)?;
                    let raw = value.as_bytes().ok_or(MetainfoError::InvalidMetainfo)?;
                    if raw.len() % 32 != 0 {
                        return Err(MetainfoError::InvalidMetainfo);
                    }
                    let hashes = raw
                        .chunks(32)
                        .map(|c| c.try_into().expect("chunked to 32"))
                        .collect();
                    piece_layers.insert(root_hash, hashes);
                }
            }

            (Some(entries), piece_layers)
        } else {
            (None, HashMap::new())
        };

        let files = reconcile_files(v1_files, v2_files)?;

        let info_hash_v1 = if has_v1 {
            Some(sha1_info_hash(info))
        } else {
            None
        };
        let info_hash_v2 = if has_v2 {
            Some(sha256_info_hash(info))
        } else {
            None
        };

        let trackers = parse_trackers(&root);

        Ok(TorrentInfo {
            name,
            info_hash_v1,
            info_hash_v2,
            piece_len,
            files,
            pieces: raw_pieces.map(|b| b.to_vec()),
            piece_layers,
            trackers,
            private,
        })
    }
}

struct V2FileEntry {
    path: PathBuf,
    len: u64,
    pieces_root: Option<Sha256Hash>,
}

fn walk_file_tree(
    node: &BencodeValue,
    prefix: &mut Vec<String>,
    out: &mut Vec<V2FileEntry>,
) -> Result<()> {
    let dict = node
        .as_dict()
        .ok_or_else(|| MetainfoError::InvalidFileTree(format!("{:?}", prefix)))?;

    for (key, value) in dict {
        if key.is_empty() {
            // leaf marker: { "": { "length": .., "pieces root": .. } }
            let leaf = value
                .as_dict()
                .ok_or_else(|| MetainfoError::InvalidFileTree(format!("{:?}", prefix)))?;
            let len = leaf
                .get(b"length".as_slice())
                .and_then(BencodeValue::as_int)
                .ok_or_else(|| MetainfoError::InvalidFileTree(format!("{:?}", prefix)))?;
            let pieces_root = leaf
                .get(b"pieces root".as_slice())
                .and_then(BencodeValue::as_bytes)
                .map(|b| {
                    b.try_into()
                        .map_err(|_| MetainfoError::InvalidFileTree(format!("{:?}", prefix)))
                })
                .transpose()?;

            let path: PathBuf = prefix.iter().collect();
            if len > 0 && pieces_root.is_none() {
                return Err(MetainfoError::MissingPiecesRoot(path));
            }
            out.push(V2FileEntry {
                path,
                len: len as u64,
                pieces_root,
            });
        } else {
            let segment = String::from_utf8_lossy(key).into_owned();
            prefix.push(segment);
            walk_file_tree(value, prefix, out)?;
            prefix.pop();
        }
    }
    Ok(())
}

struct V1FileEntry {
    path: PathBuf,
    len: u64,
    is_padding: bool,
}

fn parse_v1_files(info: &BencodeValue, name: &str) -> Result<Vec<V1FileEntry>> {
    if let Some(len) = info.get(b"length").and_then(BencodeValue::as_int) {
        if info.get(b"files").is_some() {
            return Err(MetainfoError::InvalidMetainfo);
        }
        if len < 0 {
            return Err(MetainfoError::InvalidMetainfo);
        }
        return Ok(vec![V1FileEntry {
            path: PathBuf::from(name),
            len: len as u64,
            is_padding: false,
        }]);
    }

    let raw_files = info
        .get(b"files")
        .and_then(BencodeValue::as_list)
        .ok_or(MetainfoError::InvalidMetainfo)?;
    if raw_files.is_empty() {
        return Err(MetainfoError::InvalidMetainfo);
    }

    let mut files = Vec::with_capacity(raw_files.len());
    for entry in raw_files {
        let len = entry
            .get(b"length")
            .and_then(BencodeValue::as_int)
            .ok_or(MetainfoError::InvalidMetainfo)?;
        if len < 0 {
            return Err(MetainfoError::InvalidMetainfo);
        }
        let path_segments = entry
            .get(b"path")
            .and_then(BencodeValue::as_list)
            .ok_or(MetainfoError::InvalidMetainfo)?;
        let mut path = PathBuf::new();
        for seg in path_segments {
            let seg = seg.as_bytes().ok_or(MetainfoError::InvalidMetainfo)?;
            path.push(String::from_utf8_lossy(seg).into_owned());
        }
        if path.as_os_str().is_empty() || path.is_absolute() {
            return Err(MetainfoError::InvalidMetainfo);
        }

        // BEP 47: a padding file is marked with an "attr" string containing 'p'.
        let is_padding = entry
            .get(b"attr")
            .and_then(BencodeValue::as_bytes)
            .map(|a| a.contains(&b'p'))
            .unwrap_or(false);

        files.push(V1FileEntry {
            path,
            len: len as u64,
            is_padding,
        });
    }
    Ok(files)
}

/// Merges the v1 file list and v2 file tree into the final, offset-assigned
/// [`FileInfo`] vector. For hybrid torrents the two must describe files of
/// matching length in matching order; the two views are then fused so each
/// file carries both its v1 byte-range and its v2 `pieces_root`.
fn reconcile_files(
    v1: Option<Vec<V1FileEntry>>,
    v2: Option<Vec<V2FileEntry>>,
) -> Result<Vec<FileInfo>> {
    match (v1, v2) {
        (Some(v1), None) => {
            let mut offset = 0u64;
            Ok(v1
                .into_iter()
                .map(|f| {
                    let info = FileInfo {
                        path: f.path,
                        len: f.len,
                        torrent_offset: offset,
                        is_padding: f.is_padding,
                        pieces_root: None,
                    };
                    offset += f.len;
                    info
                })
                .collect())
        }
        (None, Some(v2)) => {
            let mut offset = 0u64;
            Ok(v2
                .into_iter()
                .map(|f| {
                    let info = FileInfo {
                        path: f.path,
                        len: f.len,
                        torrent_offset: offset,
                        is_padding: false,
                        pieces_root: f.pieces_root,
                    };
                    offset += f.len;
                    info
                })
                .collect())
        }
        (Some(v1), Some(v2)) => {
            let non_padding: Vec<&V1FileEntry> = v1.iter().filter(|f| !f.is_padding).collect();
            if non_padding.len() != v2.len() {
                return Err(MetainfoError::InvalidMetainfo);
            }
            for (a, b) in non_padding.iter().zip(v2.iter()) {
                if a.path != b.path || a.len != b.len {
                    return Err(MetainfoError::InvalidMetainfo);
                }
            }
            let mut v2_iter = v2.into_iter();
            let mut offset = 0u64;
            let mut out = Vec::with_capacity(v1.len());
            for f in v1 {
                let pieces_root = if f.is_padding {
                    None
                } else {
                    v2_iter.next().and_then(|e| e.pieces_root)
                };
                out.push(FileInfo {
                    path: f.path,
                    len: f.len,
                    torrent_offset: offset,
                    is_padding: f.is_padding,
                    pieces_root,
                });
                offset += f.len;
            }
            Ok(out)
        }
        (None, None) => Err(MetainfoError::InvalidMetainfo),
    }
}

fn parse_trackers(root: &BencodeValue) -> Vec<Url> {
    let mut trackers = Vec::new();

    if let Some(list) = root.get(b"announce-list").and_then(BencodeValue::as_list) {
        for tier in list {
            if let Some(tier) = tier.as_list() {
                for entry in tier {
                    if let Some(url) = entry.as_bytes().and_then(|b| Url::parse(&String::from_utf8_lossy(b)).ok()) {
                        if url.scheme() == "http" || url.scheme() == "https" {
                            trackers.push(url);
                        }
                    }
                }
            }
        }
    }

    if trackers.is_empty() {
        if let Some(announce) = root.get(b"announce").and_then(BencodeValue::as_bytes) {
            if let Ok(url) = Url::parse(&String::from_utf8_lossy(announce)) {
                if url.scheme() == "http" || url.scheme() == "https" {
                    trackers.push(url);
                }
            }
        }
    }

    if trackers.is_empty() {
        log::warn!("No HTTP trackers in metainfo");
    }

    trackers
}

fn sha1_info_hash(info: &BencodeValue) -> Sha1Hash {
    let encoded = info.to_vec();
    let digest = sha1::Sha1::digest(&encoded);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

fn sha256_info_hash(info: &BencodeValue) -> Sha256Hash {
    let encoded = info.to_vec();
    let digest = sha2::Sha256::digest(&encoded);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn dict(pairs: Vec<(&[u8], BencodeValue)>) -> BencodeValue {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.to_vec(), v);
        }
        BencodeValue::Dict(map)
    }

    fn single_file_v1_bytes(piece_hashes: usize) -> Vec<u8> {
        let info = dict(vec![
            (b"name", BencodeValue::bytes(b"file.bin".to_vec())),
            (b"piece length", BencodeValue::Int(16384)),
            (b"length", BencodeValue::Int(16384 * piece_hashes as i64)),
            (b"pieces", BencodeValue::bytes(vec![0u8; 20 * piece_hashes])),
        ]);
        let root = dict(vec![
            (b"info", info),
            (b"announce", BencodeValue::bytes(b"http://tracker.example/announce".to_vec())),
        ]);
        root.to_vec()
    }

    #[test]
    fn test_parse_v1_single_file() {
        let bytes = single_file_v1_bytes(2);
        let info = TorrentInfo::from_bytes(&bytes).unwrap();
        assert!(info.is_v1());
        assert!(!info.is_v2());
        assert_eq!(info.files.len(), 1);
        assert_eq!(info.files[0].len, 32768);
        assert_eq!(info.trackers.len(), 1);
    }

    #[test]
    fn test_rejects_missing_length_and_files() {
        let info = dict(vec![
            (b"name", BencodeValue::bytes(b"x".to_vec())),
            (b"piece length", BencodeValue::Int(16384)),
            (b"pieces", BencodeValue::bytes(vec![0u8; 20])),
        ]);
        let root = dict(vec![(b"info", info)]);
        assert!(TorrentInfo::from_bytes(&root.to_vec()).is_err());
    }

    #[test]
    fn test_rejects_uneven_pieces() {
        let info = dict(vec![
            (b"name", BencodeValue::bytes(b"x".to_vec())),
            (b"piece length", BencodeValue::Int(16384)),
            (b"length", BencodeValue::Int(16384)),
            (b"pieces", BencodeValue::bytes(vec![0u8; 19])),
        ]);
        let root = dict(vec![(b"info", info)]);
        assert!(matches!(
            TorrentInfo::from_bytes(&root.to_vec()),
            Err(MetainfoError::InvalidPieces)
        ));
    }

    #[test]
    fn test_padding_file_marked() {
        let files = BencodeValue::List(vec![
            dict(vec![
                (b"length", BencodeValue::Int(100)),
                (b"path", BencodeValue::List(vec![BencodeValue::bytes(b"a.txt".to_vec())])),
            ]),
            dict(vec![
                (b"length", BencodeValue::Int(28)),
                (b"path", BencodeValue::List(vec![BencodeValue::bytes(b".pad".to_vec()), BencodeValue::bytes(b"28".to_vec())])),
                (b"attr", BencodeValue::bytes(b"p".to_vec())),
            ]),
        ]);
        let info = dict(vec![
            (b"name", BencodeValue::bytes(b"archive".to_vec())),
            (b"piece length", BencodeValue::Int(128)),
            (b"files", files),
            (b"pieces", BencodeValue::bytes(vec![0u8; 20])),
        ]);
        let root = dict(vec![(b"info", info)]);
        let parsed = TorrentInfo::from_bytes(&root.to_vec()).unwrap();
        assert_eq!(parsed.files.len(), 2);
        assert!(parsed.files[1].is_padding);
        assert!(!parsed.is_archive() || parsed.files.iter().filter(|f| !f.is_padding).count() == 1);
    }

    #[test]
    fn test_unsupported_meta_version_rejected() {
        let info = dict(vec![
            (b"name", BencodeValue::bytes(b"x".to_vec())),
            (b"piece length", BencodeValue::Int(16384)),
            (b"meta version", BencodeValue::Int(3)),
            (b"length", BencodeValue::Int(16384)),
            (b"pieces", BencodeValue::bytes(vec![0u8; 20])),
        ]);
        let root = dict(vec![(b"info", info)]);
        assert!(matches!(
            TorrentInfo::from_bytes(&root.to_vec()),
            Err(MetainfoError::UnsupportedMetaVersion(3))
        ));
    }
}
