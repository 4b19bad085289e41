pub type Result<T, E = TransportError> = std::result::Result<T, E>;

/// The spec's `TransportError` kind: covers both TCP and uTP connection
/// establishment/teardown failures. Transient — the peer is debited
/// (`failcount`) and the connection is torn down; the scheduler refills.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connection refused")]
    Refused,

    #[error("connection reset by peer")]
    Reset,

    #[error("connection timed out")]
    TimedOut,

    #[error("uTP connection exceeded its retransmission budget")]
    UtpMaxRetriesExceeded,

    #[error("{0}")]
    Io(std::io::Error),
}

impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        use std::io::ErrorKind::*;
        match value.kind() {
            ConnectionRefused => Self::Refused,
            ConnectionReset => Self::Reset,
            TimedOut => Self::TimedOut,
            _ => Self::Io(value),
        }
    }
}
