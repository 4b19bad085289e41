//! Set of module Error
pub mod disk;
pub mod metainfo;
pub mod peer;
pub mod torrent;
pub mod tracker;
pub mod transport;
pub mod verify;

use std::net::SocketAddr;

pub use disk::{NewTorrentError, ReadError, Result as DiskResult, WriteError};
pub use metainfo::MetainfoError;
use crate::merkle::MerkleError;
pub use peer::{PeerError, Result as PeerResult};
pub use tokio::{io::Error as IoError, sync::mpsc::error::SendError};
pub use torrent::{Result as TorrentResult, TorrentError};
pub use tracker::{Result as TrackerResult, TrackerError};
pub use transport::{Result as TransportResult, TransportError};
pub use verify::{Result as VerifyResult, VerifyError};

use crate::{PieceIndex, TorrentId};

pub type EngineResult<T, E = Error> = std::result::Result<T, E>;

/// A peer-list or connection-slot cap was already reached.
///
/// This is the spec's `ResourceError` kind: always benign, the caller simply
/// skips the operation (e.g. a discovered peer is dropped rather than
/// added).
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("peer list at capacity ({0})")]
    PeerListFull(usize),

    #[error("active connection slots at capacity ({0})")]
    ConnectionsFull(usize),
}

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
  #[error("channel error")]
  /// The cannel on which some component in engine was listening or sending died.
  Channel,

  #[error("invalid download path")]
  /// The torrent download location is not valid.
  InvalidDownloadPath,

  #[error("invalid torrent id")]
  /// The torrent ID did not correspond to any entry.
  /// This is returned when user specified a torrent that does not exist.
  InvalidTorrentId,

  #[error("{0}")]
  /// Holds global IO related errors.
  Io(IoError),

  #[error("torrent {id} error: {error}")]
  /// An error specific to a torrent
  Torrent { id: TorrentId, error: TorrentError },

  #[error("torrent {id} tracker error: {error}")]
  /// An error that occurred while a torrent was announcing to tracker.
  Tracker { id: TorrentId, error: TrackerError },

  #[error("torrent {id} peer {addr} protocol error: {error}")]
  /// A malformed frame or illegal state transition on a single connection.
  /// Closes the offending connection; never propagates further.
  Peer {
    id: TorrentId,
    addr: SocketAddr,
    error: PeerError,
  },

  #[error("torrent {id} peer {addr} transport error: {error}")]
  /// A TCP or uTP connection failure. The peer is debited and the
  /// connection torn down; recovered locally by the peer pool.
  Transport {
    id: TorrentId,
    addr: SocketAddr,
    error: TransportError,
  },

  #[error("torrent {id} piece {index} failed verification: {error}")]
  /// A single piece's hash or Merkle proof failed. Recovered locally: the
  /// piece returns to MISSING and the contributing peer is debited.
  Verify {
    id: TorrentId,
    index: PieceIndex,
    error: VerifyError,
  },

  #[error("torrent {id} piece {index}: v1 and v2 hashes disagree")]
  /// v1 SHA-1 and v2 Merkle verification disagree for a hybrid torrent.
  /// Severe: stops the session.
  HybridMismatch { id: TorrentId, index: PieceIndex },

  #[error("torrent {id} storage error: {error}")]
  /// A disk write failed or wrote fewer bytes than expected. Severe: stops
  /// the session.
  Storage { id: TorrentId, error: WriteError },

  #[error("{0}")]
  /// A `.torrent` file was malformed. Aborts session creation.
  Metadata(MetainfoError),

  #[error("invalid v2 piece layer: {0}")]
  /// A torrent's `.torrent`-supplied piece layer doesn't hash up to its
  /// file's `pieces root`. Aborts session creation.
  Merkle(MerkleError),

  #[error("{0}")]
  /// A benign resource cap was hit; the caller skips the operation.
  Resource(ResourceError),
}

impl From<IoError> for Error {
  fn from(value: IoError) -> Self {
    Self::Io(value)
  }
}

impl<T> From<SendError<T>> for Error {
  fn from(_: SendError<T>) -> Self {
    Self::Channel
  }
}

impl From<MetainfoError> for Error {
  fn from(value: MetainfoError) -> Self {
    Self::Metadata(value)
  }
}

impl From<ResourceError> for Error {
  fn from(value: ResourceError) -> Self {
    Self::Resource(value)
  }
}

impl From<MerkleError> for Error {
  fn from(value: MerkleError) -> Self {
    Self::Merkle(value)
  }
}
