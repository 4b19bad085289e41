//! The torrent session (C8): owns a torrent's peer pool, piece scheduler,
//! and storage writer handle, drives tracker announces, and publishes
//! progress on the session [`crate::alert::EventBus`].
//!
//! Generalizes the teacher's `Engine`/`Torrent`/`EngineHandle` trio into a
//! single per-torrent actor, following the same `mpsc` command-channel,
//! task-per-component pattern as `engine.rs` and `disk/mod.rs`.

use std::{
    collections::{HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, RwLock},
    time::Duration,
};

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::interval;

use crate::{
    alert::{Event, EventSender},
    blockinfo::{BlockData, BlockInfo},
    collaborators::TrackerClient,
    conf::TorrentConf,
    counter::ThruputCounters,
    disk,
    download::PieceDownload,
    error::{disk::ReadError, disk::WriteError, Error, TorrentResult},
    picker::{PiecePicker, PieceState},
    pool::PeerPool,
    storage_info::StorageInfo,
    torrent::stats::TorrentStats,
    transport::tcp,
    tracker::announce::{Announce, Event as AnnounceEvent},
    peer::{self, session::ConnectionState, SessionTick},
    Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

pub mod stats;

/// The channel for communication with torrent.
pub type Sender = UnboundedSender<Command>;

/// The type of channel on which a torrent can listen for
/// block write completion.
pub type Receiver = UnboundedReceiver<Command>;

/// The types of message that torrent can receive from parts of
/// the engine.
pub enum Command {
    /// Sent when some blocks were written to disk or an error occurred while
    /// writing.
    PieceCompletion(Result<PieceCompletion, WriteError>),

    /// There was an error reading a block.
    ReadError {
        block_info: BlockInfo,
        error: ReadError,
    },

    /// A peer session was spawned after a successful dial; its command
    /// sender is registered so the scheduler can talk to it.
    PeerSpawned { addr: SocketAddr, tx: peer::Sender },

    /// An outbound connection attempt failed before a session ever spawned.
    PeerConnectFailed { addr: SocketAddr },

    /// A message sent only once, after the peer has been connected.
    PeerConnected { addr: SocketAddr, id: PeerId },

    /// Peer sessions periodically send this message when they have a state change.
    PeerState { addr: SocketAddr, info: SessionTick },

    /// A block arrived from a peer and is ready to be handed to the disk
    /// task's write buffer.
    BlockReceived {
        addr: SocketAddr,
        info: BlockInfo,
        data: BlockData,
    },

    /// A piece's v1 and v2 hashes disagreed for a hybrid torrent: a severe,
    /// session-stopping fault rather than an ordinary hash failure.
    HybridMismatch { index: PieceIndex },

    /// Suspends the piece scheduler: no new block requests are issued, but
    /// existing connections are kept open.
    Pause,

    /// Resumes a paused session's piece scheduler.
    Resume,

    /// Graceful shutdown the torrent.
    ///
    /// This command tells all active peer sessions of torrent to do the same,
    /// waits for them and announce to trackers our exit.
    Shutdown,
}

/// A torrent session's high-level lifecycle state (spec.md §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Downloading,
    Paused,
    Seeding,
    Stopped,
}

/// The type returned on completing a piece.
#[derive(Debug)]
pub struct PieceCompletion {
    /// The index of the piece.
    pub index: PieceIndex,
    /// Whether the piece is valid. If it's not, it's not written to disk.
    pub is_valid: bool,
}

/// State shared with peer sessions at spawn time.
pub struct TorrentContext {
    pub id: TorrentId,
    /// The 20-byte identifier sent in the peer-wire handshake: the v1 info
    /// hash for pure-v1/hybrid torrents, or the first 20 bytes of the v2
    /// info hash for pure-v2 torrents.
    pub handshake_hash: Sha1Hash,
    pub client_id: PeerId,
    pub cmd_tx: Sender,
    pub download: RwLock<HashMap<PieceIndex, RwLock<PieceDownload>>>,
    pub storage: StorageInfo,
}

/// Parameters for constructing a new torrent session.
pub struct Params {
    pub id: TorrentId,
    pub disk_tx: disk::Sender,
    pub handshake_hash: Sha1Hash,
    pub storage_info: StorageInfo,
    pub own_pieces: Bitfield,
    pub trackers: Vec<Box<dyn TrackerClient>>,
    pub client_id: PeerId,
    pub listen_addr: SocketAddr,
    pub conf: TorrentConf,
    pub event_tx: EventSender,
}

/// A connected peer's scheduling bookkeeping.
struct PeerHandle {
    tx: peer::Sender,
    pieces: Bitfield,
    peer_choking: bool,
    am_interested: bool,
    /// Latest throughput/RTT snapshot, used to size block request deadlines.
    counters: ThruputCounters,
    /// Consecutive block-request timeouts; at 3 the peer's pipeline is
    /// throttled to a single outstanding request (spec.md §4.6).
    timeout_count: usize,
}

/// A single torrent's session: peer pool, piece scheduler, and the tracker
/// announce loop.
pub struct Torrent {
    ctx: Arc<TorrentContext>,
    cmd_rx: Receiver,
    disk_tx: disk::Sender,
    pool: PeerPool,
    picker: PiecePicker,
    peers: HashMap<SocketAddr, PeerHandle>,
    trackers: Vec<Box<dyn TrackerClient>>,
    listen_addr: SocketAddr,
    conf: TorrentConf,
    event_tx: EventSender,
    state: State,
}

impl Torrent {
    /// Builds a new torrent session, returning it along with the command
    /// sender used to drive it.
    pub fn new(params: Params) -> (Self, Sender) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let piece_count = params.storage_info.piece_count;

        let ctx = Arc::new(TorrentContext {
            id: params.id,
            handshake_hash: params.handshake_hash,
            client_id: params.client_id,
            cmd_tx: cmd_tx.clone(),
            download: RwLock::new(HashMap::new()),
            storage: params.storage_info,
        });

        let picker = PiecePicker::new(piece_count, &params.own_pieces);

        let torrent = Self {
            ctx,
            cmd_rx,
            disk_tx: params.disk_tx,
            pool: PeerPool::new(&params.conf),
            picker,
            peers: HashMap::new(),
            trackers: params.trackers,
            listen_addr: params.listen_addr,
            conf: params.conf,
            event_tx: params.event_tx,
            state: State::Downloading,
        };

        (torrent, cmd_tx)
    }

    /// Runs the torrent's session loop until a graceful shutdown or a fatal
    /// error.
    pub async fn start(&mut self, seeds: &[SocketAddr]) -> TorrentResult<()> {
        log::info!("Starting torrent {}", self.ctx.id);
        let _ = self.event_tx.send(Event::SessionStarted { id: self.ctx.id });

        self.pool.add_peers(seeds.iter().copied());
        self.announce(Some(AnnounceEvent::Started)).await;
        self.connect_new_peers();

        let mut reannounce = interval(self.conf.announce_interval);
        reannounce.tick().await;
        let mut stats_tick = interval(Duration::from_secs(1));
        stats_tick.tick().await;
        let mut timeout_sweep = interval(Duration::from_secs(1));
        timeout_sweep.tick().await;

        loop {
            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(cmd) => {
                            if !self.handle_command(cmd).await {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = reannounce.tick() => {
                    self.announce(None).await;
                }
                _ = stats_tick.tick() => {
                    self.publish_stats();
                }
                _ = timeout_sweep.tick() => {
                    self.sweep_timeouts();
                }
            }
            self.connect_new_peers();
        }

        self.state = State::Stopped;
        self.shutdown().await;
        Ok(())
    }

    /// Handles a single command. Returns `false` if the session should stop.
    async fn handle_command(&mut self, cmd: Command) -> bool {
        match cmd {
            Command::PieceCompletion(Ok(PieceCompletion { index, is_valid })) => {
                if is_valid {
                    self.picker.set_written(index);
                    let _ = self.event_tx.send(Event::PieceCompleted { id: self.ctx.id, index });
                    if self.picker.is_complete() {
                        self.state = State::Seeding;
                        let _ = self.event_tx.send(Event::TorrentComplete(self.ctx.id));
                    }
                } else {
                    self.picker.set_missing(index);
                    let _ = self.event_tx.send(Event::PieceHashFailed { id: self.ctx.id, index });
                }
                self.fill_pipelines();
            }
            Command::PieceCompletion(Err(error)) => {
                log::error!("Torrent {} storage error: {}", self.ctx.id, error);
                let _ = self.event_tx.send(Event::Error(Error::Storage { id: self.ctx.id, error }));
            }
            Command::HybridMismatch { index } => {
                log::error!(
                    "Torrent {} piece {}: v1/v2 hash mismatch, stopping session",
                    self.ctx.id,
                    index
                );
                let _ = self
                    .event_tx
                    .send(Event::Error(Error::HybridMismatch { id: self.ctx.id, index }));
                return false;
            }
            Command::ReadError { block_info, error } => {
                log::warn!("Torrent {} failed to read {}: {}", self.ctx.id, block_info, error);
            }
            Command::PeerSpawned { addr, tx } => {
                self.peers.insert(
                    addr,
                    PeerHandle {
                        tx,
                        pieces: Bitfield::repeat(false, self.ctx.storage.piece_count),
                        peer_choking: true,
                        am_interested: false,
                        counters: ThruputCounters::default(),
                        timeout_count: 0,
                    },
                );
            }
            Command::PeerConnectFailed { addr } => {
                self.pool.record_connect_failure(addr);
            }
            Command::PeerConnected { addr, id } => {
                self.pool.set_id(addr, id);
                let _ = self.event_tx.send(Event::PeerConnected { id: self.ctx.id, addr, peer_id: id });
            }
            Command::PeerState { addr, info } => {
                self.on_peer_state(addr, info);
            }
            Command::BlockReceived { addr, info, data } => {
                self.on_block_received(addr, info, data);
            }
            Command::Pause => {
                if self.state == State::Downloading {
                    self.state = State::Paused;
                    let _ = self.event_tx.send(Event::SessionPaused { id: self.ctx.id });
                }
            }
            Command::Resume => {
                if self.state == State::Paused {
                    self.state = State::Downloading;
                    let _ = self.event_tx.send(Event::SessionResumed { id: self.ctx.id });
                    self.fill_pipelines();
                }
            }
            Command::Shutdown => return false,
        }
        true
    }

    fn on_peer_state(&mut self, addr: SocketAddr, tick: SessionTick) {
        let closed = matches!(tick.state.connection, ConnectionState::Closed);

        if let Some(handle) = self.peers.get_mut(&addr) {
            handle.counters = tick.counters;
            let old_pieces = std::mem::replace(&mut handle.pieces, tick.state.pieces.clone());
            for i in 0..self.ctx.storage.piece_count {
                let had = old_pieces.get(i).map(|b| *b).unwrap_or(false);
                let has = handle.pieces.get(i).map(|b| *b).unwrap_or(false);
                if has && !had {
                    self.picker.add_single_piece(i);
                } else if had && !has {
                    self.picker.remove_single_piece(i);
                }
            }
            handle.peer_choking = tick.state.peer_choking;

            let want_any = (0..self.ctx.storage.piece_count).any(|i| {
                self.picker.state(i) != PieceState::Written
                    && handle.pieces.get(i).map(|b| *b).unwrap_or(false)
            });
            if want_any != handle.am_interested {
                handle.am_interested = want_any;
                let _ = handle.tx.send(peer::session::Command::SetInterested(want_any));
            }
            if tick.state.peer_interested {
                let _ = handle.tx.send(peer::session::Command::SetChoke(false));
            }
            if tick.state.is_seed {
                self.pool.mark_seed(addr);
            }
        }

        if closed {
            if let Some(handle) = self.peers.remove(&addr) {
                self.picker.remove_peer_pieces(&handle.pieces);
            }
            let _ = self.event_tx.send(Event::PeerDisconnected { id: self.ctx.id, addr });
            for reconnect in self.pool.disconnect_peer(addr) {
                self.dial(reconnect);
            }
        }

        self.fill_pipelines();
    }

    fn on_block_received(&mut self, addr: SocketAddr, info: BlockInfo, data: BlockData) {
        let others = {
            let download = self.ctx.download.read().expect("download lock poisoned");
            match download.get(&info.piece_index) {
                Some(entry) => entry
                    .write()
                    .expect("piece download lock poisoned")
                    .receive_block(info.offset, addr),
                None => Vec::new(),
            }
        };
        for other in others {
            if let Some(handle) = self.peers.get(&other) {
                let _ = handle.tx.send(peer::session::Command::Cancel(vec![info]));
            }
        }
        if let Some(handle) = self.peers.get_mut(&addr) {
            handle.timeout_count = 0;
        }
        self.pool.mark_downloaded_from(addr);
        let _ = self.disk_tx.send(disk::Command::WriteBlock {
            id: self.ctx.id,
            block_info: info,
            data: data.to_vec(),
        });
        self.fill_pipelines();
    }

    /// Requests more blocks from every unchoked peer, up to the configured
    /// pipeline depth, rarest-first, entering endgame duplication once few
    /// enough pieces remain.
    fn fill_pipelines(&mut self) {
        if self.state == State::Paused {
            return;
        }

        let endgame = self.picker.missing_count()
            <= self.conf.endgame_threshold.max(self.peers.len() * self.conf.max_pipeline_depth / 4);

        let addrs: Vec<SocketAddr> = self.peers.keys().copied().collect();
        for addr in addrs {
            let (tx, peer_pieces, peer_choking, timeout_count) = match self.peers.get(&addr) {
                Some(handle) => {
                    (handle.tx.clone(), handle.pieces.clone(), handle.peer_choking, handle.timeout_count)
                }
                None => continue,
            };
            if peer_choking {
                continue;
            }

            // Three consecutive block timeouts throttle a peer's pipeline to
            // a single outstanding request until a block lands again.
            let throttled = timeout_count >= 3;
            let pipeline_cap = if throttled { 1 } else { self.conf.max_pipeline_depth };
            let request_batch = if throttled { 1 } else { self.conf.min_pipeline_depth };

            let mut requests = Vec::new();
            while requests.len() < pipeline_cap {
                let index = match self.picker.pick_piece(&peer_pieces, &[]) {
                    Some(index) => index,
                    None => break,
                };
                self.picker.set_partial(index);

                let piece_len = self.ctx.storage.piece_len(index).unwrap_or(self.ctx.storage.piece_len);
                let picked = {
                    let mut download = self.ctx.download.write().expect("download lock poisoned");
                    let entry = download
                        .entry(index)
                        .or_insert_with(|| RwLock::new(PieceDownload::new(index, piece_len)));
                    entry
                        .write()
                        .expect("piece download lock poisoned")
                        .pick_blocks(addr, request_batch, endgame, self.conf.endgame_max_duplicate_requests)
                };
                if picked.is_empty() {
                    break;
                }
                requests.extend(picked);
            }

            if !requests.is_empty() {
                let _ = tx.send(peer::session::Command::MakeRequests(requests));
            }
        }
    }

    /// Sweeps every piece's pending block requests for ones past their
    /// deadline (`max(2 * rtt_est, block_timeout_floor)`), withdrawing each
    /// to the free pool, sending CANCEL to the peers it was requested from,
    /// and counting the timeout against those peers for pipeline throttling.
    fn sweep_timeouts(&mut self) {
        let floor = self.conf.block_timeout_floor;
        let mut cancellations: HashMap<SocketAddr, Vec<BlockInfo>> = HashMap::new();
        let mut timed_out_peers: HashSet<SocketAddr> = HashSet::new();

        {
            let download = self.ctx.download.read().expect("download lock poisoned");
            for entry in download.values() {
                let mut piece = entry.write().expect("piece download lock poisoned");
                let stale: Vec<u32> = piece
                    .pending()
                    .filter(|(_, req)| {
                        let rtt_est = req
                            .peers
                            .iter()
                            .filter_map(|p| self.peers.get(p).map(|h| h.counters.rtt()))
                            .max()
                            .unwrap_or_default();
                        req.requested_at.elapsed() >= (rtt_est * 2).max(floor)
                    })
                    .map(|(offset, _)| offset)
                    .collect();
                for offset in stale {
                    if let Some((block, peers)) = piece.time_out_block(offset) {
                        for addr in peers {
                            cancellations.entry(addr).or_default().push(block);
                            timed_out_peers.insert(addr);
                        }
                    }
                }
            }
        }

        for (addr, blocks) in cancellations {
            if let Some(handle) = self.peers.get(&addr) {
                let _ = handle.tx.send(peer::session::Command::Cancel(blocks));
            }
        }
        for addr in &timed_out_peers {
            if let Some(handle) = self.peers.get_mut(addr) {
                handle.timeout_count += 1;
            }
        }

        if !timed_out_peers.is_empty() {
            self.fill_pipelines();
        }
    }

    /// Publishes a stats snapshot at most once per call, gated by
    /// [`crate::conf::TorrentAlertConf::peers`].
    fn publish_stats(&self) {
        if !self.conf.alerts.peers {
            return;
        }
        let stats = TorrentStats {
            piece_count: self.ctx.storage.piece_count,
            pieces_done: self.ctx.storage.piece_count - self.picker.missing_count(),
            connected_peers: self.pool.active_count(),
            known_peers: self.pool.known_count(),
            download_rate: self.peers.values().map(|h| h.counters.download_rate()).sum(),
            upload_rate: self.peers.values().map(|h| h.counters.upload_rate()).sum(),
        };
        let _ = self.event_tx.send(Event::StatsUpdate { id: self.ctx.id, stats });
    }

    fn connect_new_peers(&mut self) {
        for addr in self.pool.connect_to_peers() {
            self.dial(addr);
        }
    }

    /// Dials a peer in the background; the outcome is reported back via
    /// `Command::PeerSpawned`/`Command::PeerConnectFailed`.
    fn dial(&self, addr: SocketAddr) {
        let ctx = self.ctx.clone();
        let disk_tx = self.disk_tx.clone();
        let conf = self.conf.clone();
        let self_tx = self.ctx.cmd_tx.clone();

        tokio::spawn(async move {
            match tcp::connect(addr).await {
                Ok(stream) => {
                    let tx = peer::session::spawn(
                        ctx.id,
                        addr,
                        stream,
                        true,
                        ctx.handshake_hash,
                        ctx.client_id,
                        ctx.storage.piece_count,
                        conf,
                        ctx.cmd_tx.clone(),
                        disk_tx,
                    );
                    let _ = self_tx.send(Command::PeerSpawned { addr, tx });
                }
                Err(e) => {
                    log::debug!("Failed to connect to {}: {}", addr, e);
                    let _ = self_tx.send(Command::PeerConnectFailed { addr });
                }
            }
        });
    }

    async fn announce(&mut self, event: Option<AnnounceEvent>) {
        let Some(tracker) = self.trackers.first() else {
            return;
        };

        let params = Announce {
            info_hash: self.ctx.handshake_hash,
            peer_id: self.ctx.client_id,
            port: self.listen_addr.port(),
            ip: None,
            downloaded: 0,
            uploaded: 0,
            left: self.left_bytes(),
            peer_count: Some(self.conf.min_requested_peer_count),
            tracker_id: None,
            event,
        };

        match tracker.announce(params).await {
            Ok(response) => {
                let peer_count = response.peers.len();
                self.pool.add_peers(response.peers);
                let _ = self
                    .event_tx
                    .send(Event::TrackerSuccess { id: self.ctx.id, peer_count });
            }
            Err(e) => {
                let _ = self.event_tx.send(Event::TrackerFailed {
                    id: self.ctx.id,
                    reason: e.to_string(),
                });
            }
        }
    }

    fn left_bytes(&self) -> u64 {
        self.picker.missing_count() as u64 * self.ctx.storage.piece_len as u64
    }

    /// The session's current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    async fn shutdown(&mut self) {
        log::info!("Shutting down torrent {}", self.ctx.id);
        for addr in self.pool.disconnect_all_gracefully() {
            if let Some(handle) = self.peers.get(&addr) {
                let _ = handle.tx.send(peer::session::Command::Shutdown);
            }
        }
        self.announce(Some(AnnounceEvent::Stopped)).await;
        let _ = self.event_tx.send(Event::SessionStopped { id: self.ctx.id });
    }
}
