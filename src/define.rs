use std::sync::atomic::{AtomicU32, Ordering};

/// A SHA-1 hash digest, 20 bytes long.
pub type Sha1Hash = [u8; 20];

/// A SHA-256 hash digest, 32 bytes long. Used by v2/hybrid Merkle trees.
pub type Sha256Hash = [u8; 32];

/// The peer ID is an arbitrary 20 byte string.
///
/// [`Guidelines for choosing a peer ID`](http://bittorrent.org/beps/bep_0020.html).
pub type PeerId = [u8; 20];

/// The bitfield represents the piece availability of a peer.
///
/// It is a compact bool vector of most significant bits to least
/// significant bits, that is, where the hightest bit represents the first piece,
/// the second highest element represents the second piece, and so on.
///
///  A truthy boolean value of a piece's position in this vector means
/// that peer has the piece, while a falsy value means that peer doesn't have
/// the piece.
pub type Bitfield = bitvec::prelude::BitVec<u8, bitvec::order::Msb0>;

/// This is the only block length we're dealing with (except for possibly the
/// last block).  It is the widely used and accepted 16 KiB.
pub const BLOCK_LEN: u32 = 0x4000;

/// A v2 Merkle leaf covers exactly one 16 KiB block, same as [`BLOCK_LEN`].
pub const MERKLE_LEAF_LEN: u32 = BLOCK_LEN;

/// The type of a piece's index.
///
/// On the wire all integers are sent as 4-byte big endian integers, but in the
/// source code we use `usize` to be consistent with other index types in Rust.
pub type PieceIndex = usize;

/// The index of a file within a torrent's ordered file list.
pub type FileIndex = usize;

/// Identifies a torrent/session within a running engine.
///
/// Ids are never reused, so a dangling id from a stopped session fails every
/// lookup rather than aliasing an unrelated torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TorrentId(u32);

impl TorrentId {
    /// Allocates a fresh, process-unique torrent id.
    pub fn new() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TorrentId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TorrentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
