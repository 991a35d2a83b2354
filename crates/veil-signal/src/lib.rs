//! Veil Signaling Plane
//!
//! The message plane between peers and the rendezvous service, plus the
//! peer-link seam the circuit layer forwards bytes over:
//! - JSON wire protocol for announcements, validation, pings, and
//!   circuit frames
//! - Signaling adapter with reconnect/backoff over an abstract transport
//! - `PeerLink`/`PeerConnector` traits for the out-of-band byte channel
//! - In-process rendezvous and link fabric for tests and demos

pub mod adapter;
pub mod error;
pub mod link;
pub mod memory;
pub mod wire;

pub use adapter::{AdapterEvent, ReconnectConfig, SignalingAdapter, SignalingConnection, SignalingTransport};
pub use error::{SignalError, SignalResult};
pub use link::{PeerConnector, PeerLink};
pub use memory::{MemoryConnector, MemoryEndpoint, MemoryFabric, MemoryLink, MemoryRendezvous};
pub use wire::{
    CircuitDataFrame, CircuitId, CircuitSignalingFrame, LinkFrame, PeerStatus, Role,
    SignalMessage, WireCapabilities, WireLocation,
};
