//! Signaling and link error types

use thiserror::Error;

use veil_crypto::NodeId;

/// Errors surfaced by the signaling plane and peer links
#[derive(Debug, Error)]
pub enum SignalError {
    /// Send requested while the signaling connection is down
    #[error("Not connected to signaling")]
    NotConnected,

    /// Reconnection attempts exhausted
    #[error("Signaling unavailable after {attempts} reconnect attempts")]
    SignalingUnavailable { attempts: u32 },

    /// A bounded await expired
    #[error("Timed out: {scope}")]
    Timeout { scope: &'static str },

    /// Frame could not be serialized
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The underlying transport closed
    #[error("Signaling transport closed")]
    TransportClosed,

    /// Peer link is closed
    #[error("Peer link closed")]
    LinkClosed,

    /// Peer refused or cannot accept a link
    #[error("Peer {0} refused the link")]
    LinkRefused(NodeId),

    /// Crypto error while framing
    #[error("Crypto error: {0}")]
    Crypto(#[from] veil_crypto::CryptoError),
}

/// Result type for signaling operations
pub type SignalResult<T> = Result<T, SignalError>;
