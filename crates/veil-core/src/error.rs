//! Core engine errors

use thiserror::Error;

use veil_crypto::{CryptoError, NodeId};
use veil_signal::{CircuitId, SignalError};

/// Errors surfaced by the circuit engine
#[derive(Debug, Error)]
pub enum CoreError {
    /// Candidate selection could not fill all slots
    #[error("Insufficient peers: needed {needed}, {available} admissible")]
    InsufficientPeers { needed: usize, available: usize },

    /// A hop rejected establishment or its link could not be opened
    #[error("Hop {hop} establishment failed: {reason}")]
    HopEstablishFailed { hop: usize, reason: String },

    /// Operation requires a `Ready` circuit
    #[error("Circuit {0} not ready")]
    CircuitNotReady(CircuitId),

    /// Operation on a closed circuit
    #[error("Circuit {0} is closed")]
    CircuitClosed(CircuitId),

    /// No such circuit
    #[error("Circuit not found: {0}")]
    CircuitNotFound(CircuitId),

    /// Peer failed validation
    #[error("Peer {0} failed validation")]
    ValidationFailed(NodeId),

    /// Unknown peer referenced
    #[error("Peer not found: {0}")]
    PeerNotFound(NodeId),

    /// A bounded await expired
    #[error("Timed out: {scope}")]
    Timeout { scope: &'static str },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Signaling error
    #[error("Signaling error: {0}")]
    Signal(#[from] SignalError),

    /// Crypto error
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type for core operations
pub type CoreResult<T> = Result<T, CoreError>;
