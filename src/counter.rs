use std::time::Duration;

use crate::avg::SlidingAvg;

/// A directional byte counter, split into protocol overhead and payload, plus
/// a sliding-average rate estimate.
#[derive(Debug, Default)]
pub struct Counter {
    protocol: u64,
    payload: u64,
    rate: SlidingAvg,
}

impl Counter {
    pub fn add_protocol(&mut self, bytes: u64) {
        self.protocol += bytes;
    }

    pub fn add_payload(&mut self, bytes: u64) {
        self.payload += bytes;
        self.rate.update(bytes as i64);
    }

    pub fn protocol(&self) -> u64 {
        self.protocol
    }

    pub fn payload(&self) -> u64 {
        self.payload
    }

    pub fn total(&self) -> u64 {
        self.protocol + self.payload
    }

    /// Payload bytes per second, averaged over recent samples.
    pub fn payload_rate(&self) -> u64 {
        self.rate.mean().max(0) as u64
    }
}

/// Upload and download throughput counters for a single peer session, plus
/// the round trip time estimate used to size the request pipeline.
#[derive(Debug, Default)]
pub struct ThruputCounters {
    pub downloaded: Counter,
    pub uploaded: Counter,
    rtt: SlidingAvg,
}

impl ThruputCounters {
    pub fn update_rtt(&mut self, rtt: Duration) {
        self.rtt.update(rtt.as_millis() as i64);
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_millis(self.rtt.mean().max(0) as u64)
    }

    pub fn download_rate(&self) -> u64 {
        self.downloaded.payload_rate()
    }

    pub fn upload_rate(&self) -> u64 {
        self.uploaded.payload_rate()
    }
}

impl Clone for ThruputCounters {
    fn clone(&self) -> Self {
        Self {
            downloaded: Counter {
                protocol: self.downloaded.protocol,
                payload: self.downloaded.payload,
                rate: SlidingAvg::new(20),
            },
            uploaded: Counter {
                protocol: self.uploaded.protocol,
                payload: self.uploaded.payload,
                rate: SlidingAvg::new(20),
            },
            rtt: SlidingAvg::new(20),
        }
    }
}
