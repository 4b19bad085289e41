//! This module defines types used to configure the engine and its parts.

use std::{path::PathBuf, time::Duration};

use crate::PeerId;

pub const CLIENT_ID: &PeerId = b"cbt-0000000000000000";

/// The global configuration for the torrent engine and all its parts.
#[derive(Debug, Clone)]
pub struct Conf {
  pub engine: EngineConf,
  pub torrent: TorrentConf,
}

impl Conf {
  /// Returns the torrent configuration with reasonable defaults,
  /// expected for the download directory, as it is not sensible
  /// to guess that for the user. It uses the default client id
  /// [`CLIENT_ID`]
  pub fn new(download_dir: impl Into<PathBuf>) -> Self {
    Self {
      engine: EngineConf {
        client_id: *CLIENT_ID,
        download_dir: download_dir.into(),
      },
      torrent: TorrentConf::default(),
    }
  }
}

/// Configuration related to the engine itself.
#[derive(Debug, Clone)]
pub struct EngineConf {
  /// The ID of the client to announce to trackers and other peers.
  pub client_id: PeerId,
  /// The directory in which a torrent's files are placed upon download and
  /// from which they are seeded.
  pub download_dir: PathBuf,
}

/// Configuration for a torrent.
///
/// The engine will have a default instance of this applied to all torrents
/// by default, but individual torrents may override this configuration.
#[derive(Debug, Clone)]
pub struct TorrentConf {
  /// The minimum number of peers we want to keep in torrent at all times.
  pub min_requested_peer_count: usize,

  /// The max number of connected peers the torrent should have.
  pub max_connected_peer_count: usize,

  /// The hard cap on the number of known (not necessarily connected) peers
  /// kept in the peer pool. Lowest-rank non-connected peers are evicted on
  /// overflow.
  pub max_peerlist_size: usize,

  /// Consecutive connection failures before a peer is marked `BANNED` and
  /// never retried.
  pub max_failcount: usize,

  /// If the tracker doesn't provide a minimum announce interval, we default
  /// to announcing every 30 seconds.
  pub announce_interval: Duration,

  /// After this many attempts, the torrent stops announcing to a tracker.
  pub tracker_error_threshold: usize,

  /// Per-connection pipeline depth is clamped to this range.
  pub min_pipeline_depth: usize,
  pub max_pipeline_depth: usize,

  /// A block's request deadline is `max(2 * rtt_est, block_timeout_floor)`.
  pub block_timeout_floor: Duration,

  /// Endgame is entered when remaining blocks <=
  /// `max(pipeline_sum, endgame_threshold)`.
  pub endgame_threshold: usize,

  /// Maximum number of peers a single block may be requested from during
  /// endgame.
  pub endgame_max_duplicate_requests: usize,

  /// No outbound traffic on a connection for this long triggers a
  /// keep-alive frame.
  pub keepalive_send_interval: Duration,

  /// No inbound traffic on a connection for this long closes it.
  pub keepalive_timeout: Duration,

  /// Capacity, in bytes, of the Merkle piece-layer cache (LRU).
  pub merkle_cache_capacity_bytes: u64,

  /// Number of worker threads in the bounded hash-verification pool.
  pub verify_worker_count: usize,

  /// Specifies which optional alerts to send, besides the default periodic
  /// stats update.
  pub alerts: TorrentAlertConf,
}

/// Configuration of a torrent's optional alerts.
///
/// By default, all optional alerts are turned off. This is because some of
/// these alerts may have overhead that shouldn't be paid when the alerts are
/// not used.
#[derive(Debug, Clone, Default)]
pub struct TorrentAlertConf {
  /// Receive the pieces that were completed each round.
  pub completed_pieces: bool,

  /// Receive aggregate statistics about the torrent's peers.
  pub peers: bool,
}

impl Default for TorrentConf {
  fn default() -> Self {
    TorrentConf {
      // We always request at least 10 peers as anything less is a waste
      // of network round trip and it allows us to buffer up a bit more
      // than needed.
      min_requested_peer_count: 10,
      // This value is mostly picked for performance while keeping in mind
      // not to overwhelm the host.
      max_connected_peer_count: 25,
      max_peerlist_size: 1000,
      max_failcount: 3,
      announce_interval: Duration::from_secs(60 * 60),
      tracker_error_threshold: 15,
      min_pipeline_depth: 4,
      max_pipeline_depth: 64,
      block_timeout_floor: Duration::from_secs(10),
      endgame_threshold: 20,
      endgame_max_duplicate_requests: 3,
      keepalive_send_interval: Duration::from_secs(90),
      keepalive_timeout: Duration::from_secs(120),
      merkle_cache_capacity_bytes: 50 * 1024 * 1024,
      verify_worker_count: 4,
      alerts: Default::default(),
    }
  }
}
