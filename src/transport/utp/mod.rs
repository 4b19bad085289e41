//! μTP (BEP 29-style) transport (C5): a reliable, congestion-controlled
//! protocol layered over UDP, used as a fallback when TCP can't traverse a
//! peer's NAT.
//!
//! Phase 1 scope, per spec.md §4.5: in-order delivery only, no selective
//! ACK, no PEX-style extension negotiation over the transport itself.

pub mod congestion;
pub mod connection;
pub mod header;
pub mod socket;
pub mod stream;

pub use connection::{ConnState, Connection};
pub use socket::UtpSocket;
pub use stream::UtpStream;
