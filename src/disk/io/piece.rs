use std::{collections::BTreeMap, ops::Range, sync::RwLock};

use sha1::{Digest, Sha1};

use crate::{
    blockinfo::{block_count, block_len},
    error::disk::{ReadError, WriteError},
    merkle::MerkleTree,
    FileIndex, Sha1Hash, Sha256Hash,
};

use super::file::TorrentFile;

/// What a piece is checked against once all its blocks have arrived.
pub enum Verification<'a> {
    /// Pure v1: a flat SHA-1 digest over the whole piece.
    Sha1(Sha1Hash),
    /// Pure v2: an index into a single file's Merkle tree.
    Merkle {
        tree: &'a MerkleTree,
        piece_in_file: usize,
    },
    /// Hybrid: both views must agree; disagreement is a fatal
    /// [`crate::error::Error::HybridMismatch`], not a simple verify failure.
    Hybrid {
        sha1: Sha1Hash,
        tree: &'a MerkleTree,
        piece_in_file: usize,
    },
}

/// The outcome of checking a fully assembled piece.
pub enum VerifyOutcome {
    Valid,
    Invalid,
    HybridMismatch,
}

/// An in-progress piece download that keeps in memory the so far downloaded
/// blocks and the expected hash of the piece.
pub struct Piece {
    /// The length of the piece, in bytes.
    pub len: u32,
    /// The so far downloaded blocks. Once the size of the map reaches the
    /// number of blocks in piece, the piece is complete and, if the hash
    /// is correct, saved to disk.
    ///
    /// Each block must be 16 KiB and is mapped to its offset within piece.
    /// A BTreeMap is used to keep blocks sorted by their offsets, which is
    /// important when iterating over the map to hash each block in the right
    /// order.
    pub blocks: BTreeMap<u32, Vec<u8>>,
    /// The files that this piece overlaps with.
    ///
    /// This is a left-inclusive range of all file indices, that can be used
    /// to index the `Torrent::files` vector to get the file handles.
    pub file_range: Range<FileIndex>,
}

impl Piece {
    /// Places block into piece's writer buffer if it doesn't exist.
    pub fn enqueue_block(&mut self, offset: u32, data: Vec<u8>) {
        use std::collections::btree_map::Entry;
        let entry = self.blocks.entry(offset);
        if matches!(entry, Entry::Occupied(_)) {
            log::warn!("Duplicate piece block at offset {}", offset);
        } else {
            entry.or_insert(data);
        }
    }

    /// Returns whether the piece has all its blocks in its write buffer.
    pub fn is_complete(&self) -> bool {
        self.blocks.len() == block_count(self.len)
    }

    /// Concatenates the piece's blocks into a single contiguous buffer, in
    /// offset order. Only valid to call once [`Self::is_complete`] holds.
    fn assemble(&self) -> Vec<u8> {
        debug_assert!(self.is_complete());
        let mut buf = Vec::with_capacity(self.len as usize);
        for block in self.blocks.values() {
            buf.extend_from_slice(block);
        }
        buf
    }

    /// Checks the assembled piece against the given verification strategy.
    pub fn verify(&self, v: &Verification<'_>) -> VerifyOutcome {
        let data = self.assemble();
        match v {
            Verification::Sha1(expected) => {
                if sha1_of(&data) == *expected {
                    VerifyOutcome::Valid
                } else {
                    VerifyOutcome::Invalid
                }
            }
            Verification::Merkle { tree, piece_in_file } => {
                if tree.verify_leaf_range(*piece_in_file, &data) {
                    VerifyOutcome::Valid
                } else {
                    VerifyOutcome::Invalid
                }
            }
            Verification::Hybrid {
                sha1,
                tree,
                piece_in_file,
            } => {
                let v1_ok = sha1_of(&data) == *sha1;
                let v2_ok = tree.verify_leaf_range(*piece_in_file, &data);
                match (v1_ok, v2_ok) {
                    (true, true) => VerifyOutcome::Valid,
                    (false, false) => VerifyOutcome::Invalid,
                    _ => VerifyOutcome::HybridMismatch,
                }
            }
        }
    }

    /// Writes the piece's blocks to the files the piece overlaps with.
    ///
    /// Padding files are skipped: their bytes are never persisted.
    ///
    /// # Important
    ///
    /// This performs blocking positioned IO and must be run on a thread
    /// pool (`spawn_blocking`), not the async executor.
    pub fn write(
        &self,
        torrent_piece_offset: u64,
        files: &[RwLock<TorrentFile>],
    ) -> Result<(), WriteError> {
        let data = self.assemble();
        write_span(torrent_piece_offset, &data, &self.file_range, files)
    }
}

/// Writes `data`, which logically starts at `torrent_offset` in the torrent's
/// flat byte space, across the files in `file_range`, skipping padding
/// files.
pub fn write_span(
    torrent_offset: u64,
    data: &[u8],
    file_range: &Range<FileIndex>,
    files: &[RwLock<TorrentFile>],
) -> Result<(), WriteError> {
    let files = &files[file_range.clone()];
    debug_assert!(!files.is_empty());

    let mut written = 0u64;
    let mut cursor = torrent_offset;
    let total = data.len() as u64;

    for file in files {
        let file = file.write().expect("file lock poisoned");
        let remaining = total - written;
        let slice = file.info.get_slice(cursor, remaining);
        debug_assert!(slice.len > 0);

        if !file.info.is_padding {
            let chunk = &data[written as usize..(written + slice.len) as usize];
            file.write_at(slice.offset, chunk)?;
        }

        cursor += slice.len;
        written += slice.len;
    }

    debug_assert_eq!(written, total);
    Ok(())
}

/// Reads `len` bytes of torrent data starting at `torrent_offset`, across the
/// files in `file_range`. Padding file ranges are synthesized as zero.
pub fn read_span(
    torrent_offset: u64,
    len: u32,
    file_range: Range<FileIndex>,
    files: &[RwLock<TorrentFile>],
) -> Result<Vec<u8>, ReadError> {
    let mut out = vec![0u8; len as usize];
    let files_slice = &files[file_range];
    debug_assert!(!files_slice.is_empty());

    let len = len as u64;
    let mut cursor = torrent_offset;
    let mut read = 0u64;

    for file in files_slice {
        let file = file.read().expect("file lock poisoned");
        let remaining = len - read;
        let slice = file.info.get_slice(cursor, remaining);
        debug_assert!(slice.len > 0);

        if !file.info.is_padding {
            let dest = &mut out[read as usize..(read + slice.len) as usize];
            file.read_at(slice.offset, dest)?;
        }

        cursor += slice.len;
        read += slice.len;
    }

    debug_assert_eq!(read, len);
    Ok(out)
}

fn sha1_of(data: &[u8]) -> Sha1Hash {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let digest = hasher.finalize();
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

#[allow(dead_code)]
fn sha256_placeholder() -> Sha256Hash {
    [0u8; 32]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ops::Range as StdRange;

    fn piece(len: u32, blocks: &[(u32, Vec<u8>)]) -> Piece {
        let mut map = BTreeMap::new();
        for (offset, data) in blocks {
            map.insert(*offset, data.clone());
        }
        Piece {
            len,
            blocks: map,
            file_range: StdRange { start: 0, end: 1 },
        }
    }

    #[test]
    fn test_piece_complete_and_assemble() {
        let p = piece(8, &[(0, vec![1, 2, 3, 4]), (4, vec![5, 6, 7, 8])]);
        // block_count assumes BLOCK_LEN granularity; with len=8 (< BLOCK_LEN)
        // there is exactly 1 block expected, so forcibly check assemble
        // ordering instead of is_complete here.
        assert_eq!(p.assemble(), vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_sha1_verify() {
        let data = b"hello world".to_vec();
        let mut p = piece(data.len() as u32, &[]);
        p.enqueue_block(0, data.clone());
        let expected = sha1_of(&data);
        match p.verify(&Verification::Sha1(expected)) {
            VerifyOutcome::Valid => {}
            _ => panic!("expected valid"),
        }
        match p.verify(&Verification::Sha1([0u8; 20])) {
            VerifyOutcome::Invalid => {}
            _ => panic!("expected invalid"),
        }
    }
}
