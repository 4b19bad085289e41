//! The per-connection uTP state machine of spec.md §4.5: reliable,
//! in-order-only (Phase 1) delivery over UDP with AIMD congestion control.

use std::{
    collections::{BTreeMap, VecDeque},
    time::{Duration, Instant},
};

use crate::{
    avg::SlidingDurationAvg,
    error::transport::{Result, TransportError},
    transport::utp::{
        congestion::CongestionController,
        header::{Header, PacketType},
    },
};

const BASE_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_RETRANSMISSIONS: u32 = 5;
/// `1, 2, 4, 8, 16` seconds.
fn backoff(attempt: u32) -> Duration {
    BASE_TIMEOUT * (1 << attempt.min(4))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    None,
    SynSent,
    Connected,
    FinSent,
    ErrorWait,
    Closed,
}

struct InFlightPacket {
    payload: Vec<u8>,
    sent_at: Instant,
    attempt: u32,
}

/// A single uTP connection's send/receive bookkeeping.
///
/// Out-of-order packets are dropped rather than buffered (Phase 1 scope per
/// spec.md §4.5's open question decision), so `recv_seq` only ever advances
/// by exactly one per accepted data packet.
pub struct Connection {
    pub state: ConnState,
    pub conn_id_send: u16,
    pub conn_id_recv: u16,
    seq_nr: u16,
    recv_seq: u16,
    /// `registered_with_socket`: true once the owning `UtpSocket` has
    /// indexed this connection by its receive id. Guards against the
    /// connection's `Drop` trying to deregister an entry it was never
    /// given, which would otherwise double-free the socket's routing table
    /// if the same connection object is torn down twice.
    pub registered_with_socket: bool,
    cc: CongestionController,
    rtt: SlidingDurationAvg,
    inflight: BTreeMap<u16, InFlightPacket>,
    recv_buffer: VecDeque<Vec<u8>>,
    remote_wnd: u32,
}

impl Connection {
    pub fn new_initiator(conn_id_recv: u16) -> Self {
        Self::new(conn_id_recv, conn_id_recv + 1, ConnState::None)
    }

    /// `syn_connection_id` is the connection id carried by the incoming SYN
    /// packet, i.e. the initiator's recv id. The responder sends on that id
    /// and receives on `syn_connection_id + 1`, the initiator's send id.
    pub fn new_responder(syn_connection_id: u16) -> Self {
        Self::new(
            syn_connection_id.wrapping_add(1),
            syn_connection_id,
            ConnState::None,
        )
    }

    fn new(conn_id_recv: u16, conn_id_send: u16, state: ConnState) -> Self {
        Self {
            state,
            conn_id_send,
            conn_id_recv,
            seq_nr: 1,
            recv_seq: 0,
            registered_with_socket: false,
            cc: CongestionController::new(),
            rtt: SlidingDurationAvg::default(),
            inflight: BTreeMap::new(),
            recv_buffer: VecDeque::new(),
            remote_wnd: u32::MAX,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ConnState::Closed)
    }

    pub fn open(&mut self) -> Header {
        self.state = ConnState::SynSent;
        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.inflight.insert(
            seq,
            InFlightPacket {
                payload: Vec::new(),
                sent_at: Instant::now(),
                attempt: 0,
            },
        );
        Header {
            ty: PacketType::Syn,
            extension: 0,
            connection_id: self.conn_id_recv,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: self.cc.cwnd(),
            seq_nr: seq,
            ack_nr: 0,
        }
    }

    /// The number of bytes we may hand to `send` right now.
    pub fn send_window(&self) -> u32 {
        if matches!(self.state, ConnState::Connected) {
            self.cc.send_window(self.remote_wnd)
        } else {
            0
        }
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.cc.bytes_in_flight()
    }

    /// Queues a DATA packet and returns the header to send alongside it.
    pub fn send(&mut self, payload: Vec<u8>) -> Header {
        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.cc.on_send(payload.len() as u32);
        let header = Header {
            ty: PacketType::Data,
            extension: 0,
            connection_id: self.conn_id_send,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: self.cc.cwnd(),
            seq_nr: seq,
            ack_nr: self.recv_seq,
        };
        self.inflight.insert(
            seq,
            InFlightPacket {
                payload,
                sent_at: Instant::now(),
                attempt: 0,
            },
        );
        header
    }

    /// Processes an incoming packet, returning data ready for the adapter to
    /// pull (if any became available) or a reset/error.
    pub fn on_packet(&mut self, header: &Header, payload: &[u8]) -> Result<()> {
        match header.ty {
            PacketType::Reset => {
                self.state = ConnState::Closed;
                return Err(TransportError::Reset);
            }
            PacketType::Syn => {
                self.state = ConnState::Connected;
                self.recv_seq = header.seq_nr;
            }
            PacketType::State => {
                self.ack_up_to(header.ack_nr);
                if self.state == ConnState::SynSent {
                    self.state = ConnState::Connected;
                }
            }
            PacketType::Data => {
                self.ack_up_to(header.ack_nr);
                if header.seq_nr == self.recv_seq.wrapping_add(1) {
                    self.recv_seq = header.seq_nr;
                    self.recv_buffer.push_back(payload.to_vec());
                }
                // out-of-order packets are silently dropped (Phase 1 scope)
            }
            PacketType::Fin => {
                self.ack_up_to(header.ack_nr);
                self.state = ConnState::Closed;
            }
        }
        self.remote_wnd = header.wnd_size;
        Ok(())
    }

    fn ack_up_to(&mut self, ack_nr: u16) {
        let acked: Vec<u16> = self
            .inflight
            .range(..=ack_nr)
            .map(|(&seq, _)| seq)
            .collect();
        for seq in acked {
            if let Some(pkt) = self.inflight.remove(&seq) {
                self.cc.on_ack(pkt.payload.len() as u32);
                self.rtt.update(pkt.sent_at.elapsed());
            }
        }
    }

    /// Sweeps inflight packets past their retransmission deadline, returning
    /// the payloads to resend (with updated attempt counts) or an error if
    /// any packet exceeded [`MAX_RETRANSMISSIONS`].
    pub fn poll_timeouts(&mut self) -> Result<Vec<(u16, Vec<u8>)>> {
        let now = Instant::now();
        let mut to_resend = Vec::new();
        let mut failed = false;
        for (&seq, pkt) in self.inflight.iter_mut() {
            if now.duration_since(pkt.sent_at) >= backoff(pkt.attempt) {
                if pkt.attempt >= MAX_RETRANSMISSIONS {
                    failed = true;
                    break;
                }
                pkt.attempt += 1;
                pkt.sent_at = now;
                self.cc.on_timeout();
                to_resend.push((seq, pkt.payload.clone()));
            }
        }
        if failed {
            self.state = ConnState::ErrorWait;
            return Err(TransportError::UtpMaxRetriesExceeded);
        }
        Ok(to_resend)
    }

    pub fn has_data(&self) -> bool {
        !self.recv_buffer.is_empty()
    }

    pub fn recv_data(&mut self) -> Option<Vec<u8>> {
        self.recv_buffer.pop_front()
    }

    pub fn close(&mut self) -> Header {
        let seq = self.seq_nr;
        self.seq_nr = self.seq_nr.wrapping_add(1);
        self.state = ConnState::FinSent;
        Header {
            ty: PacketType::Fin,
            extension: 0,
            connection_id: self.conn_id_send,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: self.cc.cwnd(),
            seq_nr: seq,
            ack_nr: self.recv_seq,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_initiator_responder_ids_are_mirrored() {
        let initiator = Connection::new_initiator(10);
        assert_eq!(initiator.conn_id_recv, 10);
        assert_eq!(initiator.conn_id_send, 11);

        // the responder hears the initiator's recv id (10) in the SYN packet
        let responder = Connection::new_responder(10);
        assert_eq!(responder.conn_id_send, 10);
        assert_eq!(responder.conn_id_recv, 11);
    }

    #[test]
    fn test_in_order_data_is_delivered_and_out_of_order_dropped() {
        let mut conn = Connection::new_responder(5);
        conn.state = ConnState::Connected;
        conn.recv_seq = 0;

        let in_order = Header {
            ty: PacketType::Data,
            extension: 0,
            connection_id: 5,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 1024,
            seq_nr: 1,
            ack_nr: 0,
        };
        conn.on_packet(&in_order, b"hello").unwrap();
        assert!(conn.has_data());
        assert_eq!(conn.recv_data().unwrap(), b"hello");

        let out_of_order = Header {
            seq_nr: 3,
            ..in_order
        };
        conn.on_packet(&out_of_order, b"skipped").unwrap();
        assert!(!conn.has_data());
    }

    #[test]
    fn test_reset_closes_connection() {
        let mut conn = Connection::new_initiator(1);
        let header = Header {
            ty: PacketType::Reset,
            extension: 0,
            connection_id: 1,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 0,
            seq_nr: 0,
            ack_nr: 0,
        };
        let err = conn.on_packet(&header, &[]).unwrap_err();
        assert!(matches!(err, TransportError::Reset));
        assert!(conn.is_closed());
    }

    #[test]
    fn test_ack_removes_inflight_and_feeds_congestion_control() {
        let mut conn = Connection::new_initiator(1);
        conn.state = ConnState::Connected;
        let _header = conn.send(vec![1, 2, 3]);
        assert!(conn.bytes_in_flight() > 0);

        let ack = Header {
            ty: PacketType::State,
            extension: 0,
            connection_id: 1,
            timestamp_us: 0,
            timestamp_diff_us: 0,
            wnd_size: 4096,
            seq_nr: 0,
            ack_nr: 1,
        };
        conn.on_packet(&ack, &[]).unwrap();
        assert_eq!(conn.bytes_in_flight(), 0);
    }
}
