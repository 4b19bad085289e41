//! Per-piece block-level download bookkeeping (C6): which blocks of a piece
//! are free, which are in flight (and with which peers, for endgame
//! duplication), and which have already arrived.

use std::{collections::HashMap, net::SocketAddr, time::Instant};

use crate::{
    blockinfo::{block_count, block_len, BlockInfo},
    PieceIndex, BLOCK_LEN,
};

/// A single in-flight block request, tracked for timeout and endgame
/// duplicate-request bookkeeping.
#[derive(Debug, Clone)]
pub struct PendingRequest {
    pub requested_at: Instant,
    pub peers: Vec<SocketAddr>,
}

/// Tracks a single piece's block-level download progress.
#[derive(Debug)]
pub struct PieceDownload {
    pub index: PieceIndex,
    piece_len: u32,
    free_blocks: Vec<BlockInfo>,
    pending: HashMap<u32, PendingRequest>,
    received: usize,
}

impl PieceDownload {
    pub fn new(index: PieceIndex, piece_len: u32) -> Self {
        let count = block_count(piece_len);
        // Pop from the end in `pick_blocks`, so push in descending offset
        // order to hand out block 0 first.
        let free_blocks = (0..count)
            .rev()
            .map(|i| BlockInfo {
                piece_index: index,
                offset: i as u32 * BLOCK_LEN,
                len: block_len(piece_len, i),
            })
            .collect();
        Self {
            index,
            piece_len,
            free_blocks,
            pending: HashMap::new(),
            received: 0,
        }
    }

    pub fn block_count(&self) -> usize {
        block_count(self.piece_len)
    }

    pub fn received_count(&self) -> usize {
        self.received
    }

    pub fn is_complete(&self) -> bool {
        self.received == self.block_count()
    }

    /// Picks up to `n` blocks this peer may request: free blocks first, then
    /// (only in endgame) blocks already pending elsewhere that this peer
    /// hasn't duplicated yet, up to `max_duplicate_requests` peers per
    /// block.
    pub fn pick_blocks(
        &mut self,
        peer: SocketAddr,
        n: usize,
        endgame: bool,
        max_duplicate_requests: usize,
    ) -> Vec<BlockInfo> {
        let mut picked = Vec::with_capacity(n);
        while picked.len() < n {
            if let Some(block) = self.free_blocks.pop() {
                self.pending.insert(
                    block.offset,
                    PendingRequest {
                        requested_at: Instant::now(),
                        peers: vec![peer],
                    },
                );
                picked.push(block);
                continue;
            }
            if !endgame {
                break;
            }
            let candidate = self.pending.iter_mut().find(|(_, req)| {
                req.peers.len() < max_duplicate_requests && !req.peers.contains(&peer)
            });
            match candidate {
                Some((&offset, req)) => {
                    req.peers.push(peer);
                    let block_index = (offset / BLOCK_LEN) as usize;
                    picked.push(BlockInfo {
                        piece_index: self.index,
                        offset,
                        len: block_len(self.piece_len, block_index),
                    });
                }
                None => break,
            }
        }
        picked
    }

    /// Marks a block as received, returning the other peers it was pending
    /// from so the scheduler can cancel the duplicate requests on them.
    pub fn receive_block(&mut self, offset: u32, from: SocketAddr) -> Vec<SocketAddr> {
        match self.pending.remove(&offset) {
            Some(req) => {
                self.received += 1;
                req.peers.into_iter().filter(|&p| p != from).collect()
            }
            None => Vec::new(),
        }
    }

    /// Withdraws a timed-out block, returning it to the pickable pool and
    /// yielding its descriptor (for a CANCEL) plus the peers it was pending
    /// from.
    pub fn time_out_block(&mut self, offset: u32) -> Option<(BlockInfo, Vec<SocketAddr>)> {
        let req = self.pending.remove(&offset)?;
        let block_index = (offset / BLOCK_LEN) as usize;
        let block = BlockInfo {
            piece_index: self.index,
            offset,
            len: block_len(self.piece_len, block_index),
        };
        self.free_blocks.push(block);
        Some((block, req.peers))
    }

    /// Pending blocks whose deadline may have elapsed, for the scheduler's
    /// timeout sweep.
    pub fn pending(&self) -> impl Iterator<Item = (u32, &PendingRequest)> {
        self.pending.iter().map(|(&offset, req)| (offset, req))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn test_pick_and_receive() {
        let mut dl = PieceDownload::new(0, BLOCK_LEN * 2);
        let blocks = dl.pick_blocks(peer(1), 4, false, 3);
        assert_eq!(blocks.len(), 2);
        assert!(!dl.is_complete());
        dl.receive_block(blocks[0].offset, peer(1));
        dl.receive_block(blocks[1].offset, peer(1));
        assert!(dl.is_complete());
    }

    #[test]
    fn test_endgame_duplicate_and_cancel_others() {
        let mut dl = PieceDownload::new(0, BLOCK_LEN);
        let first = dl.pick_blocks(peer(1), 1, false, 3);
        assert_eq!(first.len(), 1);
        // no free blocks left; endgame duplication picks the pending one
        let dup = dl.pick_blocks(peer(2), 1, true, 3);
        assert_eq!(dup, first);
        let others = dl.receive_block(first[0].offset, peer(1));
        assert_eq!(others, vec![peer(2)]);
    }

    #[test]
    fn test_time_out_returns_block_to_pool() {
        let mut dl = PieceDownload::new(0, BLOCK_LEN);
        let picked = dl.pick_blocks(peer(1), 1, false, 3);
        let (timed_out, peers) = dl.time_out_block(picked[0].offset).unwrap();
        assert_eq!(timed_out, picked[0]);
        assert_eq!(peers, vec![peer(1)]);
        let picked_again = dl.pick_blocks(peer(2), 1, false, 3);
        assert_eq!(picked_again, picked);
    }

    #[test]
    fn test_time_out_unknown_offset_is_a_no_op() {
        let mut dl = PieceDownload::new(0, BLOCK_LEN);
        assert!(dl.time_out_block(0).is_none());
    }
}
