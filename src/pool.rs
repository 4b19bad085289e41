//! The peer pool (C7): the endpoint-keyed table of known peers, a
//! rank-ordered connect-candidate heap, and the set of active connections.
//!
//! Grounded on the teacher's `TorrentEntry`/`HashMap<TorrentId, _>`
//! bookkeeping style in `engine.rs`, generalized to per-torrent peers and
//! the lifecycle invariants of spec.md §4.7.

use std::{
    collections::{BinaryHeap, HashMap, HashSet},
    net::SocketAddr,
};

use crate::{conf::TorrentConf, PeerId};

/// A known peer's bookkeeping: everything needed to compute its rank and to
/// decide whether it's still eligible to connect to.
#[derive(Debug, Clone)]
pub struct PeerEntry {
    pub addr: SocketAddr,
    pub id: Option<PeerId>,
    pub prev_downloaded: bool,
    pub is_seed: bool,
    pub failcount: usize,
    pub hashfails: usize,
    pub banned: bool,
    pub connected: bool,
}

impl PeerEntry {
    fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            id: None,
            prev_downloaded: false,
            is_seed: false,
            failcount: 0,
            hashfails: 0,
            banned: false,
            connected: false,
        }
    }

    /// `100*(prev_down>0) + 50*(seed?) - 20*failcount - 30*hashfails +
    /// deterministic_jitter(endpoint) (0..19)`.
    fn rank(&self) -> i64 {
        let mut rank = 0i64;
        if self.prev_downloaded {
            rank += 100;
        }
        if self.is_seed {
            rank += 50;
        }
        rank -= 20 * self.failcount as i64;
        rank -= 30 * self.hashfails as i64;
        rank += deterministic_jitter(&self.addr) as i64;
        rank
    }
}

/// A stable, order-preserving 0..19 jitter derived from the endpoint, so
/// every pool computes the same rank for the same peer without a shared
/// source of randomness.
fn deterministic_jitter(addr: &SocketAddr) -> u8 {
    use std::hash::{Hash, Hasher};
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    addr.hash(&mut hasher);
    (hasher.finish() % 20) as u8
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Candidate {
    rank: i64,
    addr: SocketAddr,
}

impl Ord for Candidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.rank
            .cmp(&other.rank)
            .then_with(|| self.addr.to_string().cmp(&other.addr.to_string()))
    }
}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Known peers, the connect-candidate heap, and active connection tracking
/// for a single torrent.
pub struct PeerPool {
    peers: HashMap<SocketAddr, PeerEntry>,
    active: HashSet<SocketAddr>,
    max_peerlist_size: usize,
    max_connected_peer_count: usize,
    max_failcount: usize,
    shutting_down: bool,
}

impl PeerPool {
    pub fn new(conf: &TorrentConf) -> Self {
        Self {
            peers: HashMap::new(),
            active: HashSet::new(),
            max_peerlist_size: conf.max_peerlist_size,
            max_connected_peer_count: conf.max_connected_peer_count,
            max_failcount: conf.max_failcount,
            shutting_down: false,
        }
    }

    /// Adds a peer, deduping by endpoint and enforcing the peerlist cap by
    /// evicting the lowest-rank non-connected entry. Returns whether the
    /// peer was actually added.
    pub fn add_peer(&mut self, addr: SocketAddr) -> bool {
        if self.peers.contains_key(&addr) {
            return false;
        }
        if self.peers.len() >= self.max_peerlist_size {
            self.evict_lowest_rank_non_connected();
        }
        if self.peers.len() >= self.max_peerlist_size {
            return false;
        }
        self.peers.insert(addr, PeerEntry::new(addr));
        true
    }

    pub fn add_peers(&mut self, addrs: impl IntoIterator<Item = SocketAddr>) -> usize {
        addrs.into_iter().filter(|&addr| self.add_peer(addr)).count()
    }

    fn evict_lowest_rank_non_connected(&mut self) {
        let worst = self
            .peers
            .values()
            .filter(|p| !p.connected)
            .min_by_key(|p| p.rank())
            .map(|p| p.addr);
        if let Some(addr) = worst {
            self.peers.remove(&addr);
        }
    }

    /// Fills the active-connection budget from the candidate heap, marking
    /// chosen peers connected and returning their endpoints to dial.
    pub fn connect_to_peers(&mut self) -> Vec<SocketAddr> {
        if self.shutting_down {
            return Vec::new();
        }
        let budget = self.max_connected_peer_count.saturating_sub(self.active.len());
        if budget == 0 {
            return Vec::new();
        }

        let mut heap: BinaryHeap<Candidate> = self
            .peers
            .values()
            .filter(|p| !p.connected && !p.banned)
            .map(|p| Candidate {
                rank: p.rank(),
                addr: p.addr,
            })
            .collect();

        let mut chosen = Vec::with_capacity(budget);
        while chosen.len() < budget {
            match heap.pop() {
                Some(candidate) => {
                    if let Some(entry) = self.peers.get_mut(&candidate.addr) {
                        entry.connected = true;
                    }
                    self.active.insert(candidate.addr);
                    chosen.push(candidate.addr);
                }
                None => break,
            }
        }
        chosen
    }

    /// Records a failed connection attempt. Bans the peer once
    /// `failcount >= max_failcount`; banned peers are never retried.
    pub fn record_connect_failure(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.peers.get_mut(&addr) {
            entry.failcount += 1;
            entry.connected = false;
            if entry.failcount >= self.max_failcount {
                entry.banned = true;
            }
        }
        self.active.remove(&addr);
    }

    pub fn record_hash_failure(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.peers.get_mut(&addr) {
            entry.hashfails += 1;
        }
    }

    pub fn mark_seed(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.peers.get_mut(&addr) {
            entry.is_seed = true;
        }
    }

    pub fn mark_downloaded_from(&mut self, addr: SocketAddr) {
        if let Some(entry) = self.peers.get_mut(&addr) {
            entry.prev_downloaded = true;
        }
    }

    pub fn set_id(&mut self, addr: SocketAddr, id: PeerId) {
        if let Some(entry) = self.peers.get_mut(&addr) {
            entry.id = Some(id);
        }
    }

    /// A connection closed. Per lifecycle rule 4: if not shutting down, the
    /// freed slot is immediately refilled from the candidate heap.
    pub fn disconnect_peer(&mut self, addr: SocketAddr) -> Vec<SocketAddr> {
        self.active.remove(&addr);
        if let Some(entry) = self.peers.get_mut(&addr) {
            entry.connected = false;
        }
        if self.shutting_down {
            Vec::new()
        } else {
            self.connect_to_peers()
        }
    }

    /// Initiates graceful shutdown of every active connection.
    ///
    /// Per lifecycle rule 1, this does not clear `active`/`connected`
    /// bookkeeping itself: the caller drives each `PeerConnection::close()`
    /// and only calls [`Self::disconnect_peer`] once its close callback
    /// actually fires, so the terminal sweep can free every connection in
    /// one pass rather than racing a partially-updated pool.
    pub fn disconnect_all_gracefully(&mut self) -> Vec<SocketAddr> {
        self.shutting_down = true;
        self.active.iter().copied().collect()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    pub fn known_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_active(&self, addr: &SocketAddr) -> bool {
        self.active.contains(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn conf() -> TorrentConf {
        TorrentConf::default()
    }

    #[test]
    fn test_add_peer_dedupes() {
        let mut pool = PeerPool::new(&conf());
        assert!(pool.add_peer(addr(1)));
        assert!(!pool.add_peer(addr(1)));
        assert_eq!(pool.known_count(), 1);
    }

    #[test]
    fn test_connect_to_peers_respects_budget() {
        let mut conf = conf();
        conf.max_connected_peer_count = 2;
        let mut pool = PeerPool::new(&conf);
        pool.add_peers((1..5).map(addr));
        let connected = pool.connect_to_peers();
        assert_eq!(connected.len(), 2);
        assert_eq!(pool.active_count(), 2);
    }

    #[test]
    fn test_ban_after_max_failcount() {
        let mut conf = conf();
        conf.max_failcount = 2;
        conf.max_connected_peer_count = 10;
        let mut pool = PeerPool::new(&conf);
        pool.add_peer(addr(1));
        pool.connect_to_peers();
        pool.record_connect_failure(addr(1));
        assert!(!pool.peers[&addr(1)].banned);
        pool.record_connect_failure(addr(1));
        assert!(pool.peers[&addr(1)].banned);
        // banned peers are never retried
        assert!(pool.connect_to_peers().is_empty());
    }

    #[test]
    fn test_disconnect_refills_from_heap_unless_shutting_down() {
        let mut conf = conf();
        conf.max_connected_peer_count = 1;
        let mut pool = PeerPool::new(&conf);
        pool.add_peers([addr(1), addr(2)]);
        let first = pool.connect_to_peers();
        assert_eq!(first.len(), 1);
        let refill = pool.disconnect_peer(first[0]);
        assert_eq!(refill.len(), 1);

        pool.disconnect_all_gracefully();
        let no_refill = pool.disconnect_peer(refill[0]);
        assert!(no_refill.is_empty());
    }
}
