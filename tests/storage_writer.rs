//! End-to-end storage-writer scenarios (spec-level tests that need the
//! `StorageInfo` + `MerkleTree` + `disk::io::torrent::Torrent` pieces wired
//! together, rather than a single module's unit tests).

use std::path::PathBuf;

use sha1::{Digest as _, Sha1};
use sha2::{Digest as _, Sha256};
use tempfile::tempdir;

use bittorrent_engine::{
    blockinfo::{block_count, block_len, BlockInfo},
    disk::io::{piece::VerifyOutcome, torrent::Torrent},
    merkle::MerkleTree,
    storage_info::{FileInfo, StorageInfo},
    BLOCK_LEN,
};

fn sha1_of(data: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Writes every block of every piece of a torrent, in order, asserting each
/// piece verifies once its last block lands.
fn write_all_pieces(torrent: &mut Torrent, data: &[u8], piece_len: u32) {
    for (piece_index, piece_data) in data.chunks(piece_len as usize).enumerate() {
        let n_blocks = block_count(piece_data.len() as u32);
        let mut outcome = None;
        for block_index in 0..n_blocks {
            let offset = block_index as u32 * BLOCK_LEN;
            let len = block_len(piece_data.len() as u32, block_index);
            let block_info = BlockInfo {
                piece_index,
                offset,
                len,
            };
            let chunk = piece_data[offset as usize..offset as usize + len as usize].to_vec();
            outcome = torrent.write_block(block_info, chunk).unwrap();
        }
        assert!(
            matches!(outcome, Some(VerifyOutcome::Valid)),
            "piece {piece_index} failed to verify"
        );
    }
}

#[test]
fn v1_multi_file_one_mib_transfer_round_trips() {
    const TOTAL_LEN: usize = 1024 * 1024;
    const PIECE_LEN: u32 = 4 * BLOCK_LEN;

    // Three files of uneven length, none of which align to a piece boundary,
    // so several pieces straddle a file split.
    let file_lens = [TOTAL_LEN / 3, TOTAL_LEN / 3 + 1000, 0];
    let file_lens = [file_lens[0], file_lens[1], TOTAL_LEN - file_lens[0] - file_lens[1]];

    let data: Vec<u8> = (0..TOTAL_LEN).map(|i| (i % 251) as u8).collect();

    let mut files = Vec::new();
    let mut offset = 0u64;
    for (i, len) in file_lens.iter().enumerate() {
        files.push(FileInfo {
            path: PathBuf::from(format!("part-{i}.bin")),
            len: *len as u64,
            torrent_offset: offset,
            is_padding: false,
            pieces_root: None,
        });
        offset += *len as u64;
    }

    let piece_hashes: Vec<u8> = data
        .chunks(PIECE_LEN as usize)
        .flat_map(|chunk| sha1_of(chunk))
        .collect();

    let dir = tempdir().unwrap();
    let info = StorageInfo::new("archive", PIECE_LEN, files, dir.path().to_path_buf());
    let merkle_trees = vec![None, None, None];
    let mut torrent = Torrent::new(info, Some(piece_hashes), merkle_trees).unwrap();

    write_all_pieces(&mut torrent, &data, PIECE_LEN);

    // Read every piece back and confirm it matches the source data.
    for (piece_index, expected) in data.chunks(PIECE_LEN as usize).enumerate() {
        let block_info = BlockInfo {
            piece_index,
            offset: 0,
            len: expected.len() as u32,
        };
        let read_back = torrent.read_block(block_info).unwrap();
        assert_eq!(read_back, expected);
    }

    for (i, len) in file_lens.iter().enumerate() {
        let path = dir.path().join("archive").join(format!("part-{i}.bin"));
        assert_eq!(std::fs::metadata(&path).unwrap().len(), *len as u64);
    }
}

#[test]
fn padding_file_content_is_never_written() {
    const PIECE_LEN: u32 = BLOCK_LEN;

    let real_data = vec![0xABu8; PIECE_LEN as usize];
    let files = vec![
        FileInfo {
            path: PathBuf::from("real.bin"),
            len: PIECE_LEN as u64,
            torrent_offset: 0,
            is_padding: false,
            pieces_root: None,
        },
        FileInfo {
            path: PathBuf::from(".pad/0"),
            len: PIECE_LEN as u64,
            torrent_offset: PIECE_LEN as u64,
            is_padding: true,
            pieces_root: None,
        },
    ];

    let mut all_data = real_data.clone();
    all_data.extend(std::iter::repeat(0u8).take(PIECE_LEN as usize));
    let piece_hashes: Vec<u8> = all_data
        .chunks(PIECE_LEN as usize)
        .flat_map(|chunk| sha1_of(chunk))
        .collect();

    let dir = tempdir().unwrap();
    let info = StorageInfo::new("archive", PIECE_LEN, files, dir.path().to_path_buf());
    let mut torrent = Torrent::new(info, Some(piece_hashes), vec![None, None]).unwrap();

    // Piece 0 is the real file's only piece.
    torrent
        .write_block(
            BlockInfo {
                piece_index: 0,
                offset: 0,
                len: PIECE_LEN,
            },
            real_data.clone(),
        )
        .unwrap();

    // The real file holds the written data; the padding entry's content is
    // never touched by a write and reads back all zero regardless of what
    // was requested of it.
    let archive_dir = dir.path().join("archive");
    assert_eq!(std::fs::read(archive_dir.join("real.bin")).unwrap(), real_data);
    assert_eq!(
        std::fs::read(archive_dir.join(".pad/0")).unwrap(),
        vec![0u8; PIECE_LEN as usize]
    );
}

#[test]
fn hybrid_piece_disagreement_is_reported_as_hybrid_mismatch() {
    const PIECE_LEN: u32 = BLOCK_LEN;

    let data = vec![0x42u8; PIECE_LEN as usize];
    let correct_sha1 = sha1_of(&data);

    // A Merkle tree built over different piece content, so v2 verification
    // disagrees with the (correct) v1 hash.
    let other_piece_root = {
        let mut hasher = Sha256::new();
        hasher.update(vec![0x99u8; PIECE_LEN as usize]);
        let mut out = [0u8; 32];
        out.copy_from_slice(&hasher.finalize());
        out
    };
    let mismatched_tree = MerkleTree::single_piece(other_piece_root);

    let files = vec![FileInfo {
        path: PathBuf::from("hybrid.bin"),
        len: PIECE_LEN as u64,
        torrent_offset: 0,
        is_padding: false,
        pieces_root: Some(other_piece_root),
    }];

    let dir = tempdir().unwrap();
    let info = StorageInfo::new("hybrid", PIECE_LEN, files, dir.path().to_path_buf());
    let mut torrent =
        Torrent::new(info, Some(correct_sha1.to_vec()), vec![Some(mismatched_tree)]).unwrap();

    let outcome = torrent
        .write_block(
            BlockInfo {
                piece_index: 0,
                offset: 0,
                len: PIECE_LEN,
            },
            data,
        )
        .unwrap()
        .unwrap();
    assert!(matches!(outcome, VerifyOutcome::HybridMismatch));
}
