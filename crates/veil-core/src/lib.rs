//! Veil Core Engine
//!
//! The anonymous circuit engine behind the veil file-transfer network:
//! - Peer registry: membership, capability measurement, candidate
//!   ranking with regional diversity
//! - Circuit builder: multi-hop establishment under layered encryption,
//!   targeted repair, full rebuild
//! - Relay: per-hop peel-and-forward with exit delivery
//! - Monitor: periodic health evaluation driving repair vs. rebuild
//! - Channel: byte-oriented façade for upper layers
//!
//! Transports (rendezvous and peer links) are injected; see
//! `veil-signal` for the seams and the in-process implementations.

pub mod channel;
pub mod circuit;
pub mod config;
pub mod engine;
pub mod error;
pub mod measure;
pub mod monitor;
pub mod region;
pub mod registry;
pub mod relay;

pub use channel::{ChannelEvent, ChannelState, CircuitChannel};
pub use circuit::{CircuitBuilder, CircuitState, CircuitStats, Hop};
pub use config::{AdmissionThresholds, BandwidthConfig, Config};
pub use engine::NodeEngine;
pub use error::{CoreError, CoreResult};
pub use monitor::{CircuitMonitor, HealthDetails, MonitorStatus, StatusEvent};
pub use region::Region;
pub use registry::{PeerEntry, PeerRegistry};
pub use relay::{ExitDelivery, RelayHandler};

/// Minimum circuit length; shorter builds are coerced up
pub const MIN_HOPS: usize = 3;

/// Other peers required before a node leaves the waiting state
pub const MIN_NODES_REQUIRED: usize = 2;

/// Default staleness window in seconds
pub const STALENESS_WINDOW_SECS: u64 = 30;
