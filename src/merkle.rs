//! BEP 52 v2 Merkle tree construction and verification.
//!
//! Each file in a v2/hybrid torrent is hashed as a binary Merkle tree over
//! [`crate::MERKLE_LEAF_LEN`]-sized leaves, padded with a zero hash up to the
//! next power of two. `.torrent` metadata carries only two projections of
//! this tree: the file's root (`pieces_root`) and, for files with more than
//! one piece, the "piece layer" — one hash per piece, at the layer where
//! each node's span equals the piece length. Verifying a downloaded piece
//! means rebuilding that piece's slice of the tree from its blocks and
//! comparing against the piece layer entry; verifying the piece layer
//! itself against `pieces_root` is a one-time check done when the tree is
//! first built from trusted `.torrent` metadata.

use sha2::{Digest, Sha256};

use crate::{PieceIndex, Sha256Hash, MERKLE_LEAF_LEN};

#[derive(Debug, thiserror::Error)]
pub enum MerkleError {
    #[error("piece layer does not hash up to the file's pieces root")]
    PieceLayerMismatch,
    #[error("piece layer length {0} does not match the file's piece count {1}")]
    PieceLayerLenMismatch(usize, usize),
}

/// A leaf's 32 zero bytes, used to pad a layer up to a power of two.
const ZERO_HASH: Sha256Hash = [0u8; 32];

fn hash_leaf(data: &[u8]) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

fn hash_node(left: &Sha256Hash, right: &Sha256Hash) -> Sha256Hash {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Reduces `leaves` (padded to the next power of two with [`ZERO_HASH`]) to
/// a single root hash.
fn reduce_to_root(leaves: &[Sha256Hash]) -> Sha256Hash {
    if leaves.is_empty() {
        return ZERO_HASH;
    }
    let padded_len = leaves.len().next_power_of_two();
    let mut layer: Vec<Sha256Hash> = leaves.to_vec();
    layer.resize(padded_len, ZERO_HASH);

    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len() / 2);
        for pair in layer.chunks(2) {
            next.push(hash_node(&pair[0], &pair[1]));
        }
        layer = next;
    }
    layer[0]
}

/// A proof that a piece layer entry is part of a file's Merkle tree, as a
/// list of sibling hashes from the piece layer up to the root.
#[derive(Debug, Clone)]
pub struct MerkleProof {
    pub siblings: Vec<Sha256Hash>,
}

/// A single file's v2 Merkle tree, represented by its piece layer (one hash
/// per piece) plus the root it must hash up to.
#[derive(Debug, Clone)]
pub struct MerkleTree {
    pieces_root: Sha256Hash,
    piece_layer: Vec<Sha256Hash>,
    /// How many [`MERKLE_LEAF_LEN`] leaves make up one piece.
    leaves_per_piece: usize,
}

impl MerkleTree {
    /// Builds a tree from a file's `.torrent`-supplied piece layer, checking
    /// that it actually hashes up to `pieces_root`. `piece_count` is the
    /// number of pieces covering the file (the last may be shorter).
    pub fn from_piece_layer(
        pieces_root: Sha256Hash,
        piece_layer: Vec<Sha256Hash>,
        piece_len: u32,
        piece_count: usize,
    ) -> Result<Self, MerkleError> {
        if piece_layer.len() != piece_count {
            return Err(MerkleError::PieceLayerLenMismatch(
                piece_layer.len(),
                piece_count,
            ));
        }
        if reduce_to_root(&piece_layer) != pieces_root {
            return Err(MerkleError::PieceLayerMismatch);
        }
        let leaves_per_piece = (piece_len / MERKLE_LEAF_LEN).max(1) as usize;
        Ok(Self {
            pieces_root,
            piece_layer,
            leaves_per_piece,
        })
    }

    /// A single-piece file's tree is degenerate: its one piece layer entry
    /// equals the root itself.
    pub fn single_piece(pieces_root: Sha256Hash) -> Self {
        Self {
            pieces_root,
            piece_layer: vec![pieces_root],
            leaves_per_piece: 1,
        }
    }

    pub fn root(&self) -> Sha256Hash {
        self.pieces_root
    }

    pub fn piece_layer_hash(&self, piece_index: PieceIndex) -> Option<Sha256Hash> {
        self.piece_layer.get(piece_index).copied()
    }

    /// Rehashes `data` (a fully assembled piece) as a Merkle subtree and
    /// compares the result against the piece layer entry for `piece_index`.
    pub fn verify_leaf_range(&self, piece_index: PieceIndex, data: &[u8]) -> bool {
        let Some(expected) = self.piece_layer_hash(piece_index) else {
            return false;
        };
        let leaves: Vec<Sha256Hash> = data
            .chunks(MERKLE_LEAF_LEN as usize)
            .map(hash_leaf)
            .collect();
        if leaves.len() > self.leaves_per_piece {
            return false;
        }
        reduce_to_root(&leaves) == expected
    }

    /// Produces the sibling-hash proof from the piece layer up to the root,
    /// for out-of-band verification (e.g. answering a peer's `hash request`).
    pub fn generate_proof(&self, piece_index: PieceIndex) -> Option<MerkleProof> {
        if piece_index >= self.piece_layer.len() {
            return None;
        }
        let padded_len = self.piece_layer.len().next_power_of_two();
        let mut layer = self.piece_layer.clone();
        layer.resize(padded_len, ZERO_HASH);

        let mut siblings = Vec::new();
        let mut index = piece_index;
        while layer.len() > 1 {
            let sibling_index = index ^ 1;
            siblings.push(layer[sibling_index]);
            let mut next = Vec::with_capacity(layer.len() / 2);
            for pair in layer.chunks(2) {
                next.push(hash_node(&pair[0], &pair[1]));
            }
            layer = next;
            index /= 2;
        }
        Some(MerkleProof { siblings })
    }

    /// Verifies a standalone proof against a known root, without needing a
    /// full [`MerkleTree`] instance. Used to check hashes a peer sent us via
    /// the BEP 52 hash exchange before trusting them as a piece layer.
    pub fn verify_proof(
        root: Sha256Hash,
        piece_index: PieceIndex,
        mut hash: Sha256Hash,
        proof: &MerkleProof,
    ) -> bool {
        let mut index = piece_index;
        for sibling in &proof.siblings {
            hash = if index % 2 == 0 {
                hash_node(&hash, sibling)
            } else {
                hash_node(sibling, &hash)
            };
            index /= 2;
        }
        hash == root
    }
}

/// A bounded, in-memory cache of per-file [`MerkleTree`]s, keyed by
/// `pieces_root`. Capacity is enforced in bytes (each tree's piece layer is
/// 32 bytes per piece) rather than entry count, since torrents vary wildly
/// in file count and piece count.
pub struct PieceLayerCache {
    cache: lru::LruCache<Sha256Hash, MerkleTree>,
    capacity_bytes: u64,
    used_bytes: u64,
}

impl PieceLayerCache {
    pub fn new(capacity_bytes: u64) -> Self {
        Self {
            cache: lru::LruCache::unbounded(),
            capacity_bytes,
            used_bytes: 0,
        }
    }

    fn tree_bytes(tree: &MerkleTree) -> u64 {
        tree.piece_layer.len() as u64 * 32
    }

    pub fn insert(&mut self, root: Sha256Hash, tree: MerkleTree) {
        let size = Self::tree_bytes(&tree);
        while self.used_bytes + size > self.capacity_bytes {
            match self.cache.pop_lru() {
                Some((_, evicted)) => self.used_bytes -= Self::tree_bytes(&evicted),
                None => break,
            }
        }
        self.used_bytes += size;
        self.cache.put(root, tree);
    }

    pub fn get(&mut self, root: &Sha256Hash) -> Option<&MerkleTree> {
        self.cache.get(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf_data(n: usize, fill: u8) -> Vec<u8> {
        vec![fill; n]
    }

    #[test]
    fn test_single_leaf_tree_root_is_leaf_hash() {
        let data = leaf_data(MERKLE_LEAF_LEN as usize, 7);
        let leaf = hash_leaf(&data);
        let root = reduce_to_root(&[leaf]);
        assert_eq!(root, leaf);
    }

    #[test]
    fn test_from_piece_layer_roundtrip_and_verify() {
        let piece_len = MERKLE_LEAF_LEN * 2;
        let piece_count = 3;
        let pieces: Vec<Vec<u8>> = (0..piece_count)
            .map(|i| leaf_data(piece_len as usize, i as u8 + 1))
            .collect();
        let piece_layer: Vec<Sha256Hash> = pieces
            .iter()
            .map(|piece_data| {
                let leaves: Vec<Sha256Hash> = piece_data
                    .chunks(MERKLE_LEAF_LEN as usize)
                    .map(hash_leaf)
                    .collect();
                reduce_to_root(&leaves)
            })
            .collect();
        let root = reduce_to_root(&piece_layer);

        let tree =
            MerkleTree::from_piece_layer(root, piece_layer.clone(), piece_len, piece_count)
                .unwrap();

        for (i, piece_data) in pieces.iter().enumerate() {
            assert!(tree.verify_leaf_range(i, piece_data));
        }
        assert!(!tree.verify_leaf_range(0, &pieces[1]));
    }

    #[test]
    fn test_from_piece_layer_rejects_bad_root() {
        let piece_layer = vec![[1u8; 32], [2u8; 32]];
        let bogus_root = [0u8; 32];
        assert!(MerkleTree::from_piece_layer(bogus_root, piece_layer, MERKLE_LEAF_LEN, 2).is_err());
    }

    #[test]
    fn test_generate_and_verify_proof() {
        let piece_layer = vec![[1u8; 32], [2u8; 32], [3u8; 32], [4u8; 32]];
        let root = reduce_to_root(&piece_layer);
        let tree = MerkleTree::from_piece_layer(root, piece_layer.clone(), MERKLE_LEAF_LEN, 4)
            .unwrap();
        for (i, hash) in piece_layer.iter().enumerate() {
            let proof = tree.generate_proof(i).unwrap();
            assert!(MerkleTree::verify_proof(root, i, *hash, &proof));
        }
    }

    #[test]
    fn test_piece_layer_cache_evicts_lru() {
        let mut cache = PieceLayerCache::new(64);
        let t1 = MerkleTree::single_piece([1u8; 32]);
        let t2 = MerkleTree::single_piece([2u8; 32]);
        // each single-piece tree has a 1-entry piece layer = 32 bytes
        cache.insert([1u8; 32], t1);
        cache.insert([2u8; 32], t2);
        assert!(cache.get(&[1u8; 32]).is_some());
        assert!(cache.get(&[2u8; 32]).is_some());
        // third insertion evicts the least recently used (now [1u8;32],
        // since it wasn't touched after [2u8;32] was inserted... but we just
        // accessed both above so re-touch [1] then insert a third to evict [2]
        cache.get(&[1u8; 32]);
        let t3 = MerkleTree::single_piece([3u8; 32]);
        cache.insert([3u8; 32], t3);
        assert!(cache.get(&[2u8; 32]).is_none());
        assert!(cache.get(&[1u8; 32]).is_some());
        assert!(cache.get(&[3u8; 32]).is_some());
    }
}
