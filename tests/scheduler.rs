//! End-to-end piece-scheduler scenarios: rarest-first selection, endgame
//! duplicate-request cancellation, and the peer pool's connect/shutdown
//! lifecycle, wired together the way a [`bittorrent_engine::torrent::Torrent`]
//! would drive them, without needing a live network.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use bittorrent_engine::{
    conf::TorrentConf,
    download::PieceDownload,
    picker::{PiecePicker, PieceState},
    pool::PeerPool,
    Bitfield, BLOCK_LEN,
};

fn peer(port: u16) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
}

fn bits(vals: &[bool]) -> Bitfield {
    vals.iter().copied().collect()
}

/// Three peers with overlapping but distinct piece sets; piece 2 is the
/// rarest (only peer C has it) and should be picked first once all three
/// are connected, ahead of the more common pieces 0 and 1.
#[test]
fn rarest_first_selection_across_a_small_swarm() {
    let own = bits(&[false, false, false, false]);
    let mut picker = PiecePicker::new(4, &own);

    let peer_a = bits(&[true, true, false, false]);
    let peer_b = bits(&[true, true, true, false]);
    let peer_c = bits(&[false, false, true, true]);
    for pieces in [&peer_a, &peer_b, &peer_c] {
        picker.add_peer_pieces(pieces);
    }

    // Piece 3 is shared by just peer C, piece 2 by B and C: piece 3 is
    // rarer and wins the tie against piece 2 for any peer offering both.
    let pick = picker.pick_piece(&peer_c, &[]);
    assert_eq!(pick, Some(3));

    picker.set_partial(3);
    assert_eq!(picker.state(3), PieceState::Partial);

    // Once 3 is marked complete, the picker moves on to the next rarest
    // piece peer C can still serve.
    picker.set_written(3);
    let next = picker.pick_piece(&peer_c, &[]);
    assert_eq!(next, Some(2));
}

/// Simulates a full piece download that enters endgame: the last block is
/// requested from two peers at once, and whichever arrives first cancels
/// the duplicate on the other.
#[test]
fn endgame_duplicate_request_cancels_on_first_arrival() {
    let piece_len = BLOCK_LEN * 3;
    let own = bits(&[false]);
    let mut picker = PiecePicker::new(1, &own);
    picker.set_partial(0);

    let mut download = PieceDownload::new(0, piece_len);

    // Peer A takes all three blocks; none are left free.
    let first_round = download.pick_blocks(peer(1), 3, false, 3);
    assert_eq!(first_round.len(), 3);

    // Endgame: peer B duplicates the request for every still-pending block
    // (order is unspecified, since candidates come off a hash map, so
    // compare by offset as a set).
    let endgame_round = download.pick_blocks(peer(2), 3, true, 3);
    assert_eq!(endgame_round.len(), 3);
    let mut first_offsets: Vec<u32> = first_round.iter().map(|b| b.offset).collect();
    let mut endgame_offsets: Vec<u32> = endgame_round.iter().map(|b| b.offset).collect();
    first_offsets.sort();
    endgame_offsets.sort();
    assert_eq!(endgame_offsets, first_offsets);

    // Peer A answers first; the scheduler must cancel the same requests on
    // peer B.
    let mut to_cancel = Vec::new();
    for block in &first_round {
        to_cancel.extend(download.receive_block(block.offset, peer(1)));
    }
    assert_eq!(to_cancel.len(), 3);
    assert!(to_cancel.iter().all(|&p| p == peer(2)));
    assert!(download.is_complete());

    picker.set_written(0);
    assert!(picker.is_complete());
}

/// A peer pool at its connection cap: a connection drop refills immediately
/// from the candidate heap, but once shutdown begins no further connect
/// happens, so a late-arriving disconnect can't leak a dangling dial.
#[test]
fn pool_shutdown_stops_refilling_after_disconnects_begin() {
    let mut conf = TorrentConf::default();
    conf.max_connected_peer_count = 2;
    let mut pool = PeerPool::new(&conf);

    pool.add_peers((1..=5).map(peer));
    let connected = pool.connect_to_peers();
    assert_eq!(connected.len(), 2);
    assert_eq!(pool.active_count(), 2);

    // One connection drops normally: its slot is refilled from the heap.
    let refill = pool.disconnect_peer(connected[0]);
    assert_eq!(refill.len(), 1);
    assert_eq!(pool.active_count(), 2);

    // Shutdown begins: every remaining active connection is handed back to
    // the caller to close, and the pool stops refilling from here on.
    let to_close = pool.disconnect_all_gracefully();
    assert_eq!(to_close.len(), 2);
    assert!(pool.is_shutting_down());

    for addr in to_close {
        let refill = pool.disconnect_peer(addr);
        assert!(refill.is_empty(), "shutdown must not refill connections");
    }
    assert_eq!(pool.active_count(), 0);

    // A late straggler connect attempt (e.g. a dial that was already in
    // flight before shutdown began) must not be handed new work either.
    assert!(pool.connect_to_peers().is_empty());
}
