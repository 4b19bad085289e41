//! Transport implementations (C5): TCP, the default, and μTP, used when a
//! peer is only reachable over UDP.

pub mod tcp;
pub mod utp;
