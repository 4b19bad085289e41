pub use serde_bencoded::Error as BencodeError;

pub(crate) type Result<T> = std::result::Result<T, MetainfoError>;

/// The spec's `MetadataError` kind: malformed bencode, a missing required
/// field, or an otherwise structurally invalid `.torrent` file. Aborts
/// session creation; never recovered from in place.
#[derive(thiserror::Error, Debug)]
pub enum MetainfoError {
  #[error("{0}")]
  Bencode(BencodeError),

  #[error("invalid metainfo")]
  InvalidMetainfo,

  #[error("invalid pieces")]
  InvalidPieces,

  #[error("invalid tracker url")]
  InvalidTrackerUrl,

  #[error("piece length must be a power of two >= 16 KiB for v2/hybrid torrents")]
  InvalidPieceLength,

  #[error("v2 file tree entry {0:?} is malformed")]
  InvalidFileTree(String),

  #[error("file {0:?} is missing its pieces root")]
  MissingPiecesRoot(std::path::PathBuf),

  #[error("hybrid torrent's v1 and v2 piece counts disagree: {v1} != {v2}")]
  HybridPieceCountMismatch { v1: usize, v2: usize },

  #[error("unsupported meta version {0}")]
  UnsupportedMetaVersion(i64),
}

impl From<BencodeError> for MetainfoError {
  fn from(error: BencodeError) -> Self {
    Self::Bencode(error)
  }
}

impl From<url::ParseError> for MetainfoError {
  fn from(_: url::ParseError) -> Self {
    Self::InvalidTrackerUrl
  }
}
