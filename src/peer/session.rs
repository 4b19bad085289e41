//! The peer-connection state machine (C4): handshake, BEP 10 extension
//! negotiation, BEP-3 choke/interest bookkeeping, keep-alive/inactivity
//! timeouts, and the two-phase `close()` cleanup discipline of spec.md
//! §4.4/§5.
//!
//! Generalizes the teacher's documented-but-unbuilt `peer/session.rs`
//! (referenced from `peer/mod.rs`'s `SessionTick`) into a full tokio task,
//! following the same task-per-component, `mpsc` command-channel pattern as
//! `engine.rs` and `disk/mod.rs`.

use std::{collections::HashSet, net::SocketAddr, time::Instant};

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    time::interval,
};
use tokio_util::codec::{Decoder, Encoder, Framed};

use crate::{
    blockinfo::{BlockData, BlockInfo},
    conf::TorrentConf,
    counter::ThruputCounters,
    disk,
    error::{PeerError, PeerResult},
    peer::codec::{
        handshake::{Handshake, HandshakeCodec},
        message::Message,
        peercodec::PeerCodec,
    },
    torrent, Bitfield, PeerId, PieceIndex, Sha1Hash, TorrentId,
};

/// The connection-level state machine of spec.md §4.4.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Ready,
    Closed,
}

/// A snapshot of a connection's BEP-3 state and piece availability, sent to
/// the torrent with each [`crate::peer::SessionTick`].
#[derive(Debug, Clone)]
pub struct SessionState {
    pub connection: ConnectionState,
    pub am_choking: bool,
    pub am_interested: bool,
    pub peer_choking: bool,
    pub peer_interested: bool,
    pub is_seed: bool,
    pub supports_fast_extension: bool,
    pub supports_extension_protocol: bool,
    pub pieces: Bitfield,
}

impl SessionState {
    fn new(piece_count: usize) -> Self {
        Self {
            connection: ConnectionState::Connecting,
            am_choking: true,
            am_interested: false,
            peer_choking: true,
            peer_interested: false,
            is_seed: false,
            supports_fast_extension: false,
            supports_extension_protocol: false,
            pieces: Bitfield::repeat(false, piece_count),
        }
    }
}

/// Commands the torrent (or the disk task, for read results) sends into a
/// running session.
pub enum Command {
    /// The scheduler wants these blocks requested on this connection.
    MakeRequests(Vec<BlockInfo>),
    /// Cancel previously requested blocks (endgame loser, piece timeout).
    Cancel(Vec<BlockInfo>),
    SetChoke(bool),
    SetInterested(bool),
    /// A disk read completed; send the bytes out as a PIECE message.
    PieceBytes { info: BlockInfo, data: BlockData },
    /// A piece finished verification; broadcast HAVE if valid.
    PieceCompletion { index: PieceIndex, is_valid: bool },
    /// Not idempotent: initiates the graceful close sequence.
    Shutdown,
}

pub type Sender = UnboundedSender<Command>;
pub type Receiver = UnboundedReceiver<Command>;

/// Spawns a session task for an already-accepted (or freshly dialled) TCP
/// connection and runs its FSM to completion.
#[allow(clippy::too_many_arguments)]
pub fn spawn(
    torrent_id: TorrentId,
    addr: SocketAddr,
    stream: TcpStream,
    is_outbound: bool,
    info_hash: Sha1Hash,
    client_id: PeerId,
    piece_count: usize,
    conf: TorrentConf,
    torrent_tx: torrent::Sender,
    disk_tx: disk::Sender,
) -> Sender {
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let session = PeerSession {
        torrent_id,
        addr,
        id: None,
        state: SessionState::new(piece_count),
        allowed_fast: HashSet::new(),
        outstanding: HashSet::new(),
        counters: ThruputCounters::default(),
        conf,
        closed: false,
        self_tx: cmd_tx.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = session
            .run(stream, is_outbound, info_hash, client_id, cmd_rx, torrent_tx.clone(), disk_tx)
            .await
        {
            log::debug!("Peer session {} ended with error: {}", addr, e);
        }
    });
    cmd_tx
}

struct PeerSession {
    torrent_id: TorrentId,
    addr: SocketAddr,
    id: Option<PeerId>,
    state: SessionState,
    /// Pieces the peer has advertised via ALLOWED_FAST that we may request
    /// even while choked.
    allowed_fast: HashSet<PieceIndex>,
    outstanding: HashSet<BlockInfo>,
    counters: ThruputCounters,
    conf: TorrentConf,
    closed: bool,
    /// A clone of this session's own command sender, handed to the disk task
    /// as the destination for `ReadBlock` results so upload replies re-enter
    /// through the normal `Command::PieceBytes` path.
    self_tx: Sender,
}

impl PeerSession {
    /// Not idempotent — callers must check [`Self::is_closed`] first.
    fn close(&mut self) {
        debug_assert!(!self.closed);
        self.allowed_fast.clear();
        self.outstanding.clear();
        self.state.connection = ConnectionState::Closed;
        self.closed = true;
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn run(
        mut self,
        mut stream: TcpStream,
        is_outbound: bool,
        info_hash: Sha1Hash,
        client_id: PeerId,
        mut cmd_rx: Receiver,
        torrent_tx: torrent::Sender,
        disk_tx: disk::Sender,
    ) -> PeerResult<()> {
        self.state.connection = ConnectionState::Handshaking;

        let peer_handshake = if is_outbound {
            send_handshake(&mut stream, info_hash, client_id).await?;
            recv_handshake(&mut stream).await?
        } else {
            let hs = recv_handshake(&mut stream).await?;
            if hs.info_hash != info_hash {
                return Err(PeerError::InvalidInfoHash);
            }
            send_handshake(&mut stream, info_hash, client_id).await?;
            hs
        };

        if peer_handshake.info_hash != info_hash {
            return Err(PeerError::InvalidInfoHash);
        }
        self.id = Some(peer_handshake.peer_id);
        self.state.supports_fast_extension = peer_handshake.supports_fast_extension();
        self.state.supports_extension_protocol = peer_handshake.supports_extension_protocol();
        self.state.connection = ConnectionState::Ready;

        torrent_tx
            .send(torrent::Command::PeerConnected {
                addr: self.addr,
                id: peer_handshake.peer_id,
            })
            .ok();

        let mut framed = Framed::new(stream, PeerCodec);
        let mut keepalive_send = interval(self.conf.keepalive_send_interval);
        let mut last_recv = Instant::now();
        let mut first_message = true;

        loop {
            if last_recv.elapsed() >= self.conf.keepalive_timeout {
                log::debug!("Peer {} inactivity timeout", self.addr);
                return Err(PeerError::InactivityTimeout);
            }

            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => break,
                        Some(cmd) => self.handle_command(cmd, &mut framed).await?,
                    }
                }
                msg = framed.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            last_recv = Instant::now();
                            let is_first = first_message;
                            first_message = false;
                            self.handle_message(msg, is_first, &torrent_tx, &disk_tx).await?;
                        }
                        Some(Err(e)) => return Err(e),
                        None => break,
                    }
                }
                _ = keepalive_send.tick() => {
                    framed.send(Message::KeepAlive).await?;
                }
            }

            if self.is_closed() {
                break;
            }
        }

        if !self.is_closed() {
            self.close();
        }
        torrent_tx
            .send(torrent::Command::PeerState {
                addr: self.addr,
                info: super::SessionTick {
                    state: self.state.clone(),
                    counters: self.counters.clone(),
                    piece_count: self.state.pieces.count_ones(),
                },
            })
            .ok();
        Ok(())
    }

    async fn handle_command(
        &mut self,
        cmd: Command,
        framed: &mut Framed<TcpStream, PeerCodec>,
    ) -> PeerResult<()> {
        if self.is_closed() {
            return Ok(());
        }
        match cmd {
            Command::MakeRequests(blocks) => {
                if self.state.peer_choking {
                    return Ok(());
                }
                for block in blocks {
                    self.outstanding.insert(block);
                    framed.send(Message::Request(block)).await?;
                }
            }
            Command::Cancel(blocks) => {
                for block in blocks {
                    self.outstanding.remove(&block);
                    framed.send(Message::Cancel(block)).await?;
                }
            }
            Command::SetChoke(choke) => {
                self.state.am_choking = choke;
                framed
                    .send(if choke { Message::Choke } else { Message::Unchoke })
                    .await?;
            }
            Command::SetInterested(interested) => {
                self.state.am_interested = interested;
                framed
                    .send(if interested {
                        Message::Interested
                    } else {
                        Message::NotInterested
                    })
                    .await?;
            }
            Command::PieceBytes { info, data } => {
                self.counters.uploaded.add_payload(info.len as u64);
                framed
                    .send(Message::Block {
                        piece_index: info.piece_index,
                        offset: info.offset,
                        data,
                    })
                    .await?;
            }
            Command::PieceCompletion { index, is_valid } => {
                if is_valid {
                    framed
                        .send(Message::Have {
                            piece_index: index,
                        })
                        .await?;
                }
            }
            Command::Shutdown => unreachable!("handled by caller"),
        }
        Ok(())
    }

    async fn handle_message(
        &mut self,
        msg: Message,
        is_first: bool,
        torrent_tx: &torrent::Sender,
        disk_tx: &disk::Sender,
    ) -> PeerResult<()> {
        match msg {
            Message::KeepAlive => {}
            Message::Bitfield(bits) => {
                if !is_first {
                    return Err(PeerError::IllegalStateTransition);
                }
                self.state.pieces = bits;
                self.state.is_seed = self.state.pieces.count_ones() == self.state.pieces.len();
            }
            Message::HaveAll => {
                if !is_first || !self.state.supports_fast_extension {
                    return Err(PeerError::IllegalStateTransition);
                }
                self.state.pieces.fill(true);
                self.state.is_seed = true;
            }
            Message::HaveNone => {
                if !is_first || !self.state.supports_fast_extension {
                    return Err(PeerError::IllegalStateTransition);
                }
                self.state.pieces.fill(false);
            }
            Message::Have { piece_index } => {
                if let Some(mut bit) = self.state.pieces.get_mut(piece_index) {
                    *bit = true;
                }
                self.state.is_seed = self.state.pieces.count_ones() == self.state.pieces.len();
            }
            Message::Choke => self.state.peer_choking = true,
            Message::Unchoke => self.state.peer_choking = false,
            Message::Interested => self.state.peer_interested = true,
            Message::NotInterested => self.state.peer_interested = false,
            Message::SuggestPiece { .. } => {}
            Message::AllowedFast { piece_index } => {
                if !self.state.supports_fast_extension {
                    return Err(PeerError::FastExtensionNotNegotiated);
                }
                self.allowed_fast.insert(piece_index);
            }
            Message::Request(info) => {
                if self.state.am_choking && !self.allowed_fast.contains(&info.piece_index) {
                    // dropped per spec: REQUEST while choking outside the
                    // allowed-fast set is simply ignored, not an error.
                    return Ok(());
                }
                disk_tx
                    .send(disk::Command::ReadBlock {
                        id: self.torrent_id,
                        block_info: info,
                        result_tx: self.self_tx.clone(),
                    })
                    .ok();
            }
            Message::Cancel(_) => {}
            Message::RejectRequest(info) => {
                if !self.state.supports_fast_extension {
                    return Err(PeerError::FastExtensionNotNegotiated);
                }
                self.outstanding.remove(&info);
            }
            Message::Port(_) => {}
            Message::Block {
                piece_index,
                offset,
                data,
            } => {
                let info = BlockInfo {
                    piece_index,
                    offset,
                    len: data.len() as u32,
                };
                self.outstanding.remove(&info);
                self.counters.downloaded.add_payload(info.len as u64);
                torrent_tx
                    .send(torrent::Command::BlockReceived {
                        addr: self.addr,
                        info,
                        data,
                    })
                    .ok();
            }
            Message::Extended { .. } => {}
            Message::HashRequest(_) | Message::Hashes { .. } | Message::HashReject(_) => {}
        }
        Ok(())
    }
}

async fn send_handshake(
    stream: &mut TcpStream,
    info_hash: Sha1Hash,
    peer_id: PeerId,
) -> PeerResult<()> {
    let handshake = Handshake::new(info_hash, peer_id)
        .with_fast_extension()
        .with_extension_protocol();
    let mut buf = BytesMut::new();
    HandshakeCodec.encode(handshake, &mut buf)?;
    stream.write_all(&buf).await?;
    Ok(())
}

async fn recv_handshake(stream: &mut TcpStream) -> PeerResult<Handshake> {
    let mut buf = BytesMut::with_capacity(68);
    let mut tmp = [0u8; 68];
    stream.read_exact(&mut tmp).await?;
    buf.extend_from_slice(&tmp);
    HandshakeCodec
        .decode(&mut buf)?
        .ok_or(PeerError::MalformedFrame)
}
