use crate::PieceIndex;

pub type Result<T, E = VerifyError> = std::result::Result<T, E>;

/// The spec's `VerifyError` kind: a single piece's hash (v1) or Merkle proof
/// (v2) failed to validate against the expected root. Non-fatal: the piece
/// returns to `MISSING`, its assembly buffer is discarded, and the
/// contributing peer's `hashfails` is debited.
#[derive(Debug, thiserror::Error)]
pub enum VerifyError {
    #[error("piece {0} SHA-1 hash mismatch")]
    Sha1Mismatch(PieceIndex),

    #[error("piece {0} Merkle proof failed to verify against pieces_root")]
    MerkleProofMismatch(PieceIndex),
}
