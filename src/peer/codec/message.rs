use crate::{
    blockinfo::{BlockData, BlockInfo},
    Bitfield, PieceIndex,
};

/// Wire message ids, per BEP 3 plus the BEP 6 Fast extension and BEP 10
/// extended messaging ids. `HashRequest`/`Hashes`/`HashReject` are the BEP 52
/// v2 Merkle layer messages.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Block = 7,
    Cancel = 8,
    Port = 9,
    // BEP 6 Fast extension
    SuggestPiece = 13,
    HaveAll = 14,
    HaveNone = 15,
    RejectRequest = 16,
    AllowedFast = 17,
    // BEP 10
    Extended = 20,
    // BEP 52
    HashRequest = 21,
    Hashes = 22,
    HashReject = 23,
}

impl MessageId {
    pub fn from_u8(id: u8) -> Option<Self> {
        use MessageId::*;
        Some(match id {
            0 => Choke,
            1 => Unchoke,
            2 => Interested,
            3 => NotInterested,
            4 => Have,
            5 => Bitfield,
            6 => Request,
            7 => Block,
            8 => Cancel,
            9 => Port,
            13 => SuggestPiece,
            14 => HaveAll,
            15 => HaveNone,
            16 => RejectRequest,
            17 => AllowedFast,
            20 => Extended,
            21 => HashRequest,
            22 => Hashes,
            23 => HashReject,
            _ => return None,
        })
    }
}

/// A request for a range of leaf hashes in a v2 Merkle tree, per BEP 52.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HashRequest {
    pub pieces_root: crate::Sha256Hash,
    pub base_layer: u32,
    pub index: u32,
    pub length: u32,
    pub proof_layers: u32,
}

/// The actual messages exchanged by peers, covering BEP 3's base protocol,
/// the BEP 6 Fast extension, BEP 10's extended handshake envelope, and the
/// BEP 52 v2 hash exchange messages.
#[derive(Debug, PartialEq)]
#[cfg_attr(test, derive(Clone))]
pub enum Message {
    KeepAlive,
    Bitfield(Bitfield),
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have {
        piece_index: usize,
    },
    Request(BlockInfo),
    Block {
        piece_index: usize,
        offset: u32,
        data: BlockData,
    },
    Cancel(BlockInfo),
    Port(u16),

    /// BEP 6: sent in place of `Bitfield` when the peer has every piece.
    HaveAll,
    /// BEP 6: sent in place of `Bitfield` when the peer has no pieces.
    HaveNone,
    /// BEP 6: advisory hint that `piece_index` may be requested even while
    /// choked.
    SuggestPiece {
        piece_index: PieceIndex,
    },
    /// BEP 6: rejects a previously made request instead of silently
    /// dropping the connection.
    RejectRequest(BlockInfo),
    /// BEP 6: `piece_index` may be requested despite being choked.
    AllowedFast {
        piece_index: PieceIndex,
    },

    /// BEP 10: the extension payload is a bencoded dict; kept as raw bytes
    /// here and interpreted by the extension negotiation layer.
    Extended {
        id: u8,
        payload: Vec<u8>,
    },

    /// BEP 52: request for leaf hashes covering a v2 Merkle tree.
    HashRequest(HashRequest),
    /// BEP 52: response carrying the requested hashes, concatenated.
    Hashes {
        request: HashRequest,
        hashes: Vec<crate::Sha256Hash>,
    },
    /// BEP 52: the peer could not produce the requested hashes.
    HashReject(HashRequest),
}
