//! Peer Link Abstraction
//!
//! A peer link is an out-of-band, bidirectional, ordered, reliable byte
//! channel between two peers (e.g. a datagram channel negotiated by the
//! application). The circuit layer only depends on these two seams; the
//! in-memory fabric in [`crate::memory`] implements them for tests and
//! single-process demos.

use async_trait::async_trait;
use bytes::Bytes;

use veil_crypto::NodeId;

use crate::error::SignalResult;

/// One end of an established peer link
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// The peer on the far end
    fn peer(&self) -> NodeId;

    /// Write one frame; frames arrive in order
    async fn send(&self, frame: Bytes) -> SignalResult<()>;

    /// Read the next frame; `None` once the link is closed and drained
    async fn recv(&self) -> Option<Bytes>;

    /// Close the link (idempotent)
    async fn close(&self);

    /// Whether this end is still open
    fn is_open(&self) -> bool;
}

/// Opens peer links by node id
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn open(&self, peer: NodeId) -> SignalResult<Box<dyn PeerLink>>;
}
