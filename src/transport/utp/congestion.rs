//! AIMD congestion control for uTP connections, per spec.md §4.5: additive
//! increase on ACK, multiplicative decrease on timeout, clamped to
//! `[MSS, 1 MiB]`.

const MSS: u32 = 1400;
const MIN_CWND: u32 = MSS;
const MAX_CWND: u32 = 1 << 20;

#[derive(Debug)]
pub struct CongestionController {
    cwnd: u32,
    bytes_in_flight: u32,
}

impl CongestionController {
    pub fn new() -> Self {
        Self {
            cwnd: MIN_CWND * 2,
            bytes_in_flight: 0,
        }
    }

    pub fn cwnd(&self) -> u32 {
        self.cwnd
    }

    pub fn bytes_in_flight(&self) -> u32 {
        self.bytes_in_flight
    }

    pub fn on_send(&mut self, bytes: u32) {
        self.bytes_in_flight += bytes;
    }

    /// `cwnd += MSS * bytes_acked / cwnd`.
    pub fn on_ack(&mut self, bytes_acked: u32) {
        self.bytes_in_flight = self.bytes_in_flight.saturating_sub(bytes_acked);
        let increase = (MSS as u64 * bytes_acked as u64 / self.cwnd as u64) as u32;
        self.cwnd = (self.cwnd + increase).min(MAX_CWND);
    }

    /// `cwnd /= 2`, clamped to `MIN_CWND`.
    pub fn on_timeout(&mut self) {
        self.cwnd = (self.cwnd / 2).max(MIN_CWND);
    }

    /// The number of bytes that may be sent right now, bounded by both the
    /// local congestion window and the peer's advertised receive window.
    pub fn send_window(&self, remote_wnd: u32) -> u32 {
        self.cwnd.saturating_sub(self.bytes_in_flight).min(remote_wnd)
    }
}

impl Default for CongestionController {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ack_increases_cwnd() {
        let mut cc = CongestionController::new();
        let initial = cc.cwnd();
        cc.on_send(1000);
        cc.on_ack(1000);
        assert!(cc.cwnd() >= initial);
        assert_eq!(cc.bytes_in_flight(), 0);
    }

    #[test]
    fn test_timeout_halves_cwnd_with_floor() {
        let mut cc = CongestionController::new();
        cc.on_timeout();
        assert_eq!(cc.cwnd(), MIN_CWND);
        cc.on_timeout();
        assert_eq!(cc.cwnd(), MIN_CWND);
    }

    #[test]
    fn test_send_window_respects_remote_wnd() {
        let mut cc = CongestionController::new();
        cc.on_send(100);
        let window = cc.send_window(10);
        assert_eq!(window, 10);
    }
}
