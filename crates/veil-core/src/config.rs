//! Engine configuration

use std::time::Duration;

use veil_crypto::NodeId;
use veil_signal::{Role, WireLocation};

/// Admission thresholds a peer must clear to be usable as a hop
#[derive(Clone, Debug)]
pub struct AdmissionThresholds {
    /// Minimum bandwidth, bytes per second
    pub min_bandwidth_bps: u64,
    /// Maximum round-trip latency, milliseconds
    pub max_latency_ms: u64,
    /// Minimum continuous uptime
    pub min_uptime: Duration,
    /// Minimum transfer success ratio
    pub min_reliability: f64,
}

impl Default for AdmissionThresholds {
    fn default() -> Self {
        Self {
            min_bandwidth_bps: 50 * 1024,
            max_latency_ms: 1_000,
            min_uptime: Duration::from_secs(5 * 60),
            min_reliability: 0.8,
        }
    }
}

/// Bandwidth measurement policy
#[derive(Clone, Debug)]
pub struct BandwidthConfig {
    /// Probe transfer size
    pub probe_bytes: usize,
    /// Samples kept for smoothing
    pub sample_window: usize,
    /// Minimum interval between probes
    pub sample_interval: Duration,
    /// Platform-reported downlink estimate, if any
    pub downlink_estimate_bps: Option<u64>,
    /// Test endpoint for probe transfers, if any
    pub probe_endpoint: Option<NodeId>,
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            probe_bytes: 256 * 1024,
            sample_window: 5,
            sample_interval: Duration::from_secs(30),
            downlink_estimate_bps: None,
            probe_endpoint: None,
        }
    }
}

/// Engine configuration
#[derive(Clone, Debug)]
pub struct Config {
    /// Rendezvous endpoint (informational; the transport is injected)
    pub signaling_endpoint: String,
    /// Initial role
    pub role_hint: Role,
    /// Announced location, if known
    pub location: Option<WireLocation>,
    /// Waiting window before admission is re-evaluated
    pub waiting_period: Duration,
    /// Announcement heartbeat interval
    pub announce_interval: Duration,
    /// First signaling reconnect delay (doubles per attempt)
    pub reconnect_backoff: Duration,
    /// Reconnect attempts before giving up
    pub max_reconnect_attempts: u32,
    /// Other peers required before this node becomes Available
    pub min_nodes_required: usize,
    /// Minimum circuit length; shorter builds are coerced up
    pub min_hops: usize,
    /// Circuit monitor tick period
    pub monitor_interval: Duration,
    /// Silence after which a peer is treated as Offline
    pub staleness_window: Duration,
    /// Deadline per hop during circuit establishment
    pub hop_establish_timeout: Duration,
    /// Deadline for validation and ping round-trips
    pub validation_timeout: Duration,
    /// Interval between role rotations
    pub role_rotation: Duration,
    /// Bootstrap policy: keep a peer-starved build in `Building`
    /// instead of failing it
    pub wait_for_peers: bool,
    /// Admission thresholds
    pub admission: AdmissionThresholds,
    /// Bandwidth measurement policy
    pub bandwidth: BandwidthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            signaling_endpoint: String::new(),
            role_hint: Role::Relay,
            location: None,
            waiting_period: Duration::from_secs(30),
            announce_interval: Duration::from_secs(5),
            reconnect_backoff: Duration::from_secs(1),
            max_reconnect_attempts: 5,
            min_nodes_required: 2,
            min_hops: crate::MIN_HOPS,
            monitor_interval: Duration::from_secs(5),
            staleness_window: Duration::from_secs(30),
            hop_establish_timeout: Duration::from_secs(30),
            validation_timeout: Duration::from_secs(5),
            role_rotation: Duration::from_secs(30 * 60),
            wait_for_peers: false,
            admission: AdmissionThresholds::default(),
            bandwidth: BandwidthConfig::default(),
        }
    }
}

impl Config {
    /// Config for single-process networks (demos, integration tests):
    /// tight timers and admission thresholds a freshly started node can
    /// clear.
    pub fn loopback() -> Self {
        Self {
            waiting_period: Duration::from_millis(200),
            announce_interval: Duration::from_millis(50),
            reconnect_backoff: Duration::from_millis(20),
            monitor_interval: Duration::from_millis(200),
            staleness_window: Duration::from_millis(900),
            hop_establish_timeout: Duration::from_secs(5),
            validation_timeout: Duration::from_millis(500),
            admission: AdmissionThresholds {
                min_uptime: Duration::ZERO,
                ..AdmissionThresholds::default()
            },
            ..Self::default()
        }
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.min_hops == 0 {
            return Err("min_hops must be at least 1".into());
        }
        if self.min_hops > veil_crypto::constants::MAX_ONION_LAYERS {
            return Err(format!(
                "min_hops {} exceeds maximum {}",
                self.min_hops,
                veil_crypto::constants::MAX_ONION_LAYERS
            ));
        }
        if self.min_nodes_required == 0 {
            return Err("min_nodes_required must be at least 1".into());
        }
        if !(0.0..=1.0).contains(&self.admission.min_reliability) {
            return Err("min_reliability must be within [0, 1]".into());
        }
        if self.bandwidth.sample_window == 0 {
            return Err("bandwidth sample_window must be at least 1".into());
        }
        Ok(())
    }
}
