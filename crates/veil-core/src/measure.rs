//! Local Capability Measurement
//!
//! Bandwidth is sampled by timing a probe transfer over a transient peer
//! link when a test endpoint is configured, falling back to a
//! platform-reported downlink estimate, then to a fixed default. Samples
//! are smoothed over a short window and taken at most once per interval.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tracing::debug;

use veil_crypto::NodeId;
use veil_signal::PeerConnector;

use crate::error::CoreResult;

/// Fallback when neither a probe nor a downlink estimate is available
pub const DEFAULT_BANDWIDTH_BPS: u64 = 1024 * 1024;

/// Smoothed bandwidth estimator
pub struct BandwidthMeter {
    samples: VecDeque<u64>,
    window: usize,
    last_probe: Option<Instant>,
}

impl BandwidthMeter {
    pub fn new(window: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(window),
            window,
            last_probe: None,
        }
    }

    /// Record one sample, evicting the oldest beyond the window
    pub fn record(&mut self, bps: u64) {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(bps);
        self.last_probe = Some(Instant::now());
    }

    /// Mean over the retained samples
    pub fn smoothed(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() / self.samples.len() as u64)
    }

    /// Whether enough time has passed for another probe
    pub fn probe_due(&self, interval: Duration) -> bool {
        match self.last_probe {
            Some(at) => at.elapsed() >= interval,
            None => true,
        }
    }
}

/// Time the transfer of a probe buffer over a transient link
pub async fn probe_bandwidth(
    connector: &dyn PeerConnector,
    endpoint: NodeId,
    probe_bytes: usize,
) -> CoreResult<u64> {
    let started = Instant::now();

    let link = connector.open(endpoint).await?;
    link.send(Bytes::from(vec![0u8; probe_bytes])).await?;
    link.close().await;

    let elapsed = started.elapsed().max(Duration::from_millis(1));
    let bps = (probe_bytes as f64 / elapsed.as_secs_f64()) as u64;
    debug!(endpoint = %endpoint, bps, "Bandwidth probe complete");
    Ok(bps)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smoothing_window() {
        let mut meter = BandwidthMeter::new(5);
        assert_eq!(meter.smoothed(), None);

        for bps in [100, 200, 300, 400, 500, 600, 700] {
            meter.record(bps);
        }

        // Only the last five samples survive: 300..=700
        assert_eq!(meter.smoothed(), Some(500));
    }

    #[test]
    fn test_probe_due_respects_interval() {
        let mut meter = BandwidthMeter::new(3);
        assert!(meter.probe_due(Duration::from_secs(30)));

        meter.record(1000);
        assert!(!meter.probe_due(Duration::from_secs(30)));
        assert!(meter.probe_due(Duration::ZERO));
    }

    #[tokio::test]
    async fn test_probe_over_memory_fabric() {
        use veil_crypto::constants::NODE_ID_SIZE;
        use veil_signal::MemoryFabric;

        let fabric = MemoryFabric::new();
        let endpoint = NodeId::from_bytes([9; NODE_ID_SIZE]);
        let mut acceptor = fabric.register(endpoint);

        // Drain the probe on the endpoint side
        tokio::spawn(async move {
            if let Some(link) = acceptor.recv().await {
                while link.recv().await.is_some() {}
            }
        });

        let connector = fabric.connector(NodeId::from_bytes([1; NODE_ID_SIZE]));
        let bps = probe_bandwidth(&connector, endpoint, 64 * 1024).await.unwrap();
        assert!(bps > 0);
    }
}
