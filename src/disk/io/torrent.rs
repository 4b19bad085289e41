use std::{
    collections::{BTreeMap, HashMap},
    io,
    sync::RwLock,
};

use crate::{
    blockinfo::BlockInfo,
    error::disk::{NewTorrentError, ReadError, WriteError},
    merkle::MerkleTree,
    storage_info::StorageInfo,
    FileIndex, PieceIndex, Sha1Hash,
};

use super::{
    file::TorrentFile,
    piece::{read_span, Piece, Verification, VerifyOutcome},
};

/// Torrent information related to disk IO.
///
/// Contains the in-progress pieces (i.e. the writer buffer), the open file
/// handles, and whatever verification data (v1 SHA-1 hashes, v2 Merkle
/// trees, or both for a hybrid torrent) is needed to check a piece once it's
/// fully assembled.
pub struct Torrent {
    /// All information concerning this torrent's storage.
    info: StorageInfo,

    /// The torrent's open files, index-aligned with `info.files()`.
    files: Vec<RwLock<TorrentFile>>,

    /// The in-progress piece downloads and disk writes. This is the
    /// torrent's disk write buffer. Each piece is mapped to its index for
    /// faster lookups.
    write_buf: HashMap<PieceIndex, Piece>,

    /// The flat concatenation of expected v1 piece hashes (20 bytes each),
    /// for pure-v1 and hybrid torrents.
    piece_hashes: Option<Vec<u8>>,

    /// Per-file v2 Merkle trees, index-aligned with `info.files()`. `None`
    /// entries are files with no v2 metadata (pure-v1 torrents, or padding
    /// files).
    file_merkle_trees: Vec<Option<MerkleTree>>,
}

impl Torrent {
    /// Opens all of torrent's files and builds the disk-IO side of a
    /// torrent entry.
    ///
    /// `file_merkle_trees` must be index-aligned with `info.files()`; pass
    /// an all-`None` vector the same length as `info.files()` for a pure-v1
    /// torrent.
    pub fn new(
        info: StorageInfo,
        piece_hashes: Option<Vec<u8>>,
        file_merkle_trees: Vec<Option<MerkleTree>>,
    ) -> Result<Self, NewTorrentError> {
        debug_assert_eq!(file_merkle_trees.len(), info.files().len());

        let mut files = Vec::with_capacity(info.files().len());
        for file_info in info.files() {
            let file = TorrentFile::new(&info.download_dir, file_info.clone())?;
            files.push(RwLock::new(file));
        }

        Ok(Self {
            info,
            files,
            write_buf: HashMap::new(),
            piece_hashes,
            file_merkle_trees,
        })
    }

    /// Places `data` in the piece's write buffer. If this completes the
    /// piece, verifies it against whichever of v1/v2/hybrid data this
    /// torrent carries and, if valid, writes it to disk.
    ///
    /// Returns `None` while the piece is still incomplete.
    pub fn write_block(
        &mut self,
        block_info: BlockInfo,
        data: Vec<u8>,
    ) -> Result<Option<VerifyOutcome>, WriteError> {
        let index = block_info.piece_index;

        if !self.write_buf.contains_key(&index) {
            let len = self
                .info
                .piece_len(index)
                .map_err(|_| invalid_piece_index(index))?;
            let file_range = self
                .info
                .files_intersecting_piece(index)
                .map_err(|_| invalid_piece_index(index))?;
            self.write_buf.insert(
                index,
                Piece {
                    len,
                    blocks: BTreeMap::new(),
                    file_range,
                },
            );
        }

        let piece = self.write_buf.get_mut(&index).expect("just inserted above");
        piece.enqueue_block(block_info.offset, data);
        if !piece.is_complete() {
            return Ok(None);
        }

        let piece = self.write_buf.remove(&index).expect("checked complete above");
        let outcome = {
            let verification = self
                .verification_for(index)
                .map_err(|_| invalid_piece_index(index))?;
            piece.verify(&verification)
        };

        if matches!(outcome, VerifyOutcome::Valid) {
            let torrent_piece_offset = index as u64 * self.info.piece_len as u64;
            piece.write(torrent_piece_offset, &self.files)?;
        }

        Ok(Some(outcome))
    }

    /// Reads a block, either from the in-progress write buffer (if the
    /// piece hasn't been flushed to disk yet) or from the underlying files.
    pub fn read_block(&self, block_info: BlockInfo) -> Result<Vec<u8>, ReadError> {
        let index = block_info.piece_index;
        let len = block_info.len as usize;

        if let Some(piece) = self.write_buf.get(&index) {
            if let Some(block) = piece.blocks.get(&block_info.offset) {
                if block.len() < len {
                    return Err(ReadError::InvalidBlockOffset);
                }
                return Ok(block[..len].to_vec());
            }
        }

        let file_range = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| ReadError::InvalidBlockOffset)?;
        let torrent_offset = index as u64 * self.info.piece_len as u64 + block_info.offset as u64;
        read_span(torrent_offset, block_info.len, file_range, &self.files)
    }

    /// Determines which of v1 SHA-1, v2 Merkle, or both a piece must be
    /// checked against.
    fn verification_for(&self, index: PieceIndex) -> Result<Verification<'_>, ReadError> {
        let sha1 = self.sha1_hash(index);
        let file_range = self
            .info
            .files_intersecting_piece(index)
            .map_err(|_| ReadError::InvalidBlockOffset)?;
        let merkle = file_range
            .clone()
            .find_map(|fi| self.file_merkle_trees[fi].as_ref().map(|tree| (fi, tree)));

        match (sha1, merkle) {
            (Some(sha1), None) => Ok(Verification::Sha1(sha1)),
            (None, Some((fi, tree))) => Ok(Verification::Merkle {
                tree,
                piece_in_file: self.piece_in_file(index, fi),
            }),
            (Some(sha1), Some((fi, tree))) => Ok(Verification::Hybrid {
                sha1,
                tree,
                piece_in_file: self.piece_in_file(index, fi),
            }),
            (None, None) => Err(ReadError::MissingData),
        }
    }

    fn sha1_hash(&self, index: PieceIndex) -> Option<Sha1Hash> {
        let hashes = self.piece_hashes.as_ref()?;
        let start = index * 20;
        let slice = hashes.get(start..start + 20)?;
        let mut hash = [0u8; 20];
        hash.copy_from_slice(slice);
        Some(hash)
    }

    /// Returns the piece's index relative to the start of `file_index`'s own
    /// Merkle tree. BEP 52 pieces never straddle a file boundary, so this is
    /// just the piece's distance from the file's first piece.
    fn piece_in_file(&self, index: PieceIndex, file_index: FileIndex) -> usize {
        let file = &self.info.files()[file_index];
        let piece_offset = index as u64 * self.info.piece_len as u64;
        ((piece_offset - file.torrent_offset) / self.info.piece_len as u64) as usize
    }
}

fn invalid_piece_index(index: PieceIndex) -> WriteError {
    WriteError::Io(io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("invalid piece index {index}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_info::FileInfo;
    use std::path::PathBuf;

    fn v1_torrent(dir: &std::path::Path, data: &[u8], piece_len: u32) -> (Torrent, Vec<u8>) {
        use sha1::{Digest, Sha1};

        let file_info = FileInfo {
            path: PathBuf::from("file.bin"),
            len: data.len() as u64,
            torrent_offset: 0,
            is_padding: false,
            pieces_root: None,
        };
        let info = StorageInfo::new("t", piece_len, vec![file_info], dir.to_path_buf());
        let mut hashes = Vec::new();
        for chunk in data.chunks(piece_len as usize) {
            let mut hasher = Sha1::new();
            hasher.update(chunk);
            hashes.extend_from_slice(&hasher.finalize());
        }
        let torrent = Torrent::new(info, Some(hashes.clone()), vec![None]).unwrap();
        (torrent, hashes)
    }

    #[test]
    fn test_write_block_completes_and_verifies_piece() {
        let dir = tempdir();
        let data = vec![7u8; 32];
        let (mut torrent, _hashes) = v1_torrent(dir.path(), &data, 16);

        let block_info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16,
        };
        assert!(torrent
            .write_block(block_info, data[0..16].to_vec())
            .unwrap()
            .is_none());

        let block_info = BlockInfo {
            piece_index: 0,
            offset: 16,
            len: 16,
        };
        let outcome = torrent
            .write_block(block_info, data[16..32].to_vec())
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::Valid));
        assert!(!torrent.write_buf.contains_key(&0));
    }

    #[test]
    fn test_write_block_detects_corruption() {
        let dir = tempdir();
        let data = vec![7u8; 16];
        let (mut torrent, _hashes) = v1_torrent(dir.path(), &data, 16);

        let block_info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16,
        };
        let outcome = torrent
            .write_block(block_info, vec![0u8; 16])
            .unwrap()
            .unwrap();
        assert!(matches!(outcome, VerifyOutcome::Invalid));
    }

    #[test]
    fn test_read_block_from_write_buffer_before_flush() {
        let dir = tempdir();
        let data = vec![9u8; 32];
        let (mut torrent, _hashes) = v1_torrent(dir.path(), &data, 32);

        let block_info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16,
        };
        torrent
            .write_block(block_info, data[0..16].to_vec())
            .unwrap();

        let read_back = torrent.read_block(block_info).unwrap();
        assert_eq!(read_back, data[0..16]);
    }

    #[test]
    fn test_read_block_from_disk_after_flush() {
        let dir = tempdir();
        let data = vec![3u8; 16];
        let (mut torrent, _hashes) = v1_torrent(dir.path(), &data, 16);

        let block_info = BlockInfo {
            piece_index: 0,
            offset: 0,
            len: 16,
        };
        torrent.write_block(block_info, data.clone()).unwrap();

        let read_back = torrent.read_block(block_info).unwrap();
        assert_eq!(read_back, data);
    }

    fn tempdir() -> tempfile::TempDir {
        tempfile::tempdir().expect("failed to create temp dir")
    }
}
