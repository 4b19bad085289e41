//! External collaborator traits.
//!
//! Only the HTTP tracker crosses this boundary with a concrete
//! implementation; DHT and general peer discovery (PEX/LSD/UPnP) are out of
//! scope, so only their trait shape is given here, letting a session
//! compose against them once they exist.

use std::net::SocketAddr;

use futures::future::BoxFuture;
use url::Url;

use crate::{
    error::tracker::Result as TrackerResult,
    tracker::{announce::Announce, response::Response, tracker::Tracker},
    Sha1Hash,
};

/// A tracker collaborator: announces progress and requests peers.
pub trait TrackerClient: Send + Sync {
    fn announce<'a>(&'a self, params: Announce) -> BoxFuture<'a, TrackerResult<Response>>;
}

/// The real, `reqwest`-based HTTP tracker client.
pub struct HttpTrackerClient {
    inner: Tracker,
}

impl HttpTrackerClient {
    pub fn new(url: Url) -> Self {
        Self { inner: Tracker::new(url) }
    }
}

impl TrackerClient for HttpTrackerClient {
    fn announce<'a>(&'a self, params: Announce) -> BoxFuture<'a, TrackerResult<Response>> {
        Box::pin(self.inner.announce(params))
    }
}

/// A DHT collaborator, for trackerless peer discovery. Out of scope: no
/// concrete implementation is provided, only the shape a session would
/// compose against.
pub trait DhtClient: Send + Sync {
    fn find_peers<'a>(&'a self, info_hash: Sha1Hash) -> BoxFuture<'a, Vec<SocketAddr>>;
}

/// Peer exchange / local service discovery, generalized. Out of scope: no
/// concrete implementation is provided.
pub trait PeerDiscovery: Send + Sync {
    fn discover<'a>(&'a self) -> BoxFuture<'a, Vec<SocketAddr>>;
}
