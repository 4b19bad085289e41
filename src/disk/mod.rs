//! The disk task (C3 storage writer): owns every torrent's open files and
//! write buffer, and performs all positioned IO off the async executor via
//! `spawn_blocking`, replying to the torrent (and, for reads, the requesting
//! peer session directly) once an operation completes.

use std::collections::HashMap;

use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task,
};

use crate::{
    blockinfo::BlockInfo, engine, error::*, merkle::MerkleTree, peer,
    storage_info::StorageInfo, torrent, TorrentId,
};

pub mod io;

use io::{piece::VerifyOutcome, torrent::Torrent};

pub type JoinHandle = task::JoinHandle<DiskResult<()>>;

/// The channel for sending commands to the disk task.
pub type Sender = UnboundedSender<Command>;
/// The channel for the disk task uses to listen for commands.
pub type Receiver = UnboundedReceiver<Command>;

/// The type of commands that the disk can execute.
#[derive(Debug)]
pub enum Command {
    /// Allocate a new torrent in `Disk`.
    NewTorrent {
        id: TorrentId,
        storage_info: StorageInfo,
        /// The flat concatenation of 20-byte v1 piece hashes. Empty for a
        /// pure-v2 torrent.
        piece_hashes: Vec<u8>,
        /// Per-file v2 Merkle trees, index-aligned with
        /// `storage_info.files()`. `None` entries are files with no v2
        /// metadata.
        file_merkle_trees: Vec<Option<MerkleTree>>,
        torrent_tx: torrent::Sender,
    },
    /// Request to eventually write a block to disk.
    WriteBlock {
        id: TorrentId,
        block_info: BlockInfo,
        data: Vec<u8>,
    },
    /// Request to eventually read a block from disk and return it via the
    /// sender.
    ReadBlock {
        id: TorrentId,
        block_info: BlockInfo,
        result_tx: peer::Sender,
    },
    /// Eventually shutdown the disk task.
    Shutdown,
}

/// Spawns the disk task, returning its join handle and command sender.
///
/// `engine_tx` is used to report the outcome of `NewTorrent` allocations
/// back to the engine, which owns the torrent's lifecycle decision on
/// failure.
pub fn spawn(engine_tx: engine::Sender) -> EngineResult<(JoinHandle, Sender)> {
    log::info!("Spawning disk task");
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let disk = Disk {
        torrents: HashMap::new(),
        engine_tx,
    };
    let join_handle = task::spawn(disk.run(cmd_rx));
    Ok((join_handle, cmd_tx))
}

/// A torrent's disk-IO state plus the channel back to its torrent task.
struct TorrentEntry {
    disk: Torrent,
    torrent_tx: torrent::Sender,
}

struct Disk {
    torrents: HashMap<TorrentId, TorrentEntry>,
    engine_tx: engine::Sender,
}

impl Disk {
    async fn run(mut self, mut cmd_rx: Receiver) -> DiskResult<()> {
        log::info!("Starting disk task");
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                Command::NewTorrent {
                    id,
                    storage_info,
                    piece_hashes,
                    file_merkle_trees,
                    torrent_tx,
                } => {
                    self.new_torrent(id, storage_info, piece_hashes, file_merkle_trees, torrent_tx)
                        .await
                }
                Command::WriteBlock { id, block_info, data } => {
                    self.write_block(id, block_info, data).await
                }
                Command::ReadBlock { id, block_info, result_tx } => {
                    self.read_block(id, block_info, result_tx).await
                }
                Command::Shutdown => {
                    log::info!("Shutting down disk task");
                    break;
                }
            }
        }
        Ok(())
    }

    async fn new_torrent(
        &mut self,
        id: TorrentId,
        storage_info: StorageInfo,
        piece_hashes: Vec<u8>,
        file_merkle_trees: Vec<Option<MerkleTree>>,
        torrent_tx: torrent::Sender,
    ) {
        if self.torrents.contains_key(&id) {
            let _ = self.engine_tx.send(engine::Command::TorrentAllocation {
                id,
                result: Err(NewTorrentError::AlreadyExists),
            });
            return;
        }

        let piece_hashes = if piece_hashes.is_empty() { None } else { Some(piece_hashes) };
        let result =
            task::spawn_blocking(move || Torrent::new(storage_info, piece_hashes, file_merkle_trees))
                .await
                .expect("disk allocation task panicked");

        match result {
            Ok(disk_torrent) => {
                self.torrents.insert(
                    id,
                    TorrentEntry {
                        disk: disk_torrent,
                        torrent_tx,
                    },
                );
                let _ = self
                    .engine_tx
                    .send(engine::Command::TorrentAllocation { id, result: Ok(()) });
            }
            Err(e) => {
                let _ = self
                    .engine_tx
                    .send(engine::Command::TorrentAllocation { id, result: Err(e) });
            }
        }
    }

    async fn write_block(&mut self, id: TorrentId, block_info: BlockInfo, data: Vec<u8>) {
        let Some(entry) = self.torrents.remove(&id) else {
            log::warn!("Write for unknown torrent {}", id);
            return;
        };
        let torrent_tx = entry.torrent_tx;

        let (result, disk) = task::spawn_blocking(move || {
            let mut disk = entry.disk;
            let result = disk.write_block(block_info, data);
            (result, disk)
        })
        .await
        .expect("disk write task panicked");

        self.torrents.insert(
            id,
            TorrentEntry {
                disk,
                torrent_tx: torrent_tx.clone(),
            },
        );

        let completion = match result {
            Ok(None) => return,
            Ok(Some(VerifyOutcome::Valid)) => Ok(torrent::PieceCompletion {
                index: block_info.piece_index,
                is_valid: true,
            }),
            Ok(Some(VerifyOutcome::Invalid)) => Ok(torrent::PieceCompletion {
                index: block_info.piece_index,
                is_valid: false,
            }),
            Ok(Some(VerifyOutcome::HybridMismatch)) => {
                log::error!(
                    "Torrent {} piece {}: v1/v2 hash mismatch",
                    id,
                    block_info.piece_index
                );
                let _ = torrent_tx.send(torrent::Command::HybridMismatch {
                    index: block_info.piece_index,
                });
                return;
            }
            Err(e) => Err(e),
        };

        let _ = torrent_tx.send(torrent::Command::PieceCompletion(completion));
    }

    async fn read_block(&mut self, id: TorrentId, block_info: BlockInfo, result_tx: peer::Sender) {
        let Some(entry) = self.torrents.remove(&id) else {
            log::warn!("Read for unknown torrent {}", id);
            return;
        };
        let torrent_tx = entry.torrent_tx;

        let (result, disk) = task::spawn_blocking(move || {
            let disk = entry.disk;
            let result = disk.read_block(block_info);
            (result, disk)
        })
        .await
        .expect("disk read task panicked");

        self.torrents.insert(
            id,
            TorrentEntry {
                disk,
                torrent_tx: torrent_tx.clone(),
            },
        );

        match result {
            Ok(data) => {
                let _ = result_tx.send(peer::Command::PieceBytes {
                    info: block_info,
                    data: data.into(),
                });
            }
            Err(error) => {
                let _ = torrent_tx.send(torrent::Command::ReadError { block_info, error });
            }
        }
    }
}
