//! Circuit Health Monitoring
//!
//! One monitor runs per circuit. Each tick it reads the peer view from
//! the registry and the hop list from the builder, classifies hops,
//! and either reports health, repairs individual hops, or triggers a
//! full rebuild. Listeners receive status events in tick order and must
//! tolerate coalescing when several transitions land in one tick.
//!
//! The monitor holds non-owning handles to the registry and builder and
//! is discarded with its circuit.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use veil_crypto::NodeId;
use veil_signal::{CircuitId, PeerStatus};

use crate::circuit::{CircuitBuilder, CircuitState};
use crate::config::Config;
use crate::registry::PeerRegistry;

/// Monitor-visible circuit status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorStatus {
    /// Peer pool below the minimum; nothing to do yet
    Waiting,
    /// All hops healthy
    Ready,
    /// Unhealthy hops observed
    Degraded,
    /// Targeted hop replacement in progress
    Repairing,
    /// Full rebuild in progress
    Rebuilding,
    /// The circuit could not be kept alive
    Failed,
}

/// Aggregate health for one tick
#[derive(Debug, Clone, Default)]
pub struct HealthDetails {
    pub total: usize,
    pub healthy: usize,
    /// Mean latency over healthy hops with a finite measurement
    pub avg_latency_ms: Option<u64>,
    /// Minimum bandwidth over healthy hops
    pub min_bandwidth_bps: Option<u64>,
    pub unhealthy: Vec<NodeId>,
}

/// One status emission
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub status: MonitorStatus,
    pub details: HealthDetails,
}

enum Decision {
    Healthy,
    Repair,
    Rebuild,
}

/// Repair when the unhealthy share is at most one third of the hops,
/// rebuild beyond that.
fn decide(total: usize, unhealthy: usize) -> Decision {
    if unhealthy == 0 {
        Decision::Healthy
    } else if unhealthy > total / 3 {
        Decision::Rebuild
    } else {
        Decision::Repair
    }
}

/// Per-circuit health monitor
pub struct CircuitMonitor {
    registry: Arc<PeerRegistry>,
    builder: Arc<CircuitBuilder>,
    circuit_id: CircuitId,
    config: Config,
    listeners: RwLock<Vec<mpsc::UnboundedSender<StatusEvent>>>,
    shutdown: AtomicBool,
}

impl CircuitMonitor {
    pub fn new(
        registry: Arc<PeerRegistry>,
        builder: Arc<CircuitBuilder>,
        circuit_id: CircuitId,
        config: Config,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry,
            builder,
            circuit_id,
            config,
            listeners: RwLock::new(Vec::new()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// Register a listener; may be called while the monitor runs
    pub async fn subscribe(&self) -> mpsc::UnboundedReceiver<StatusEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners.write().await.push(tx);
        rx
    }

    /// Spawn the tick loop
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                sleep(monitor.config.monitor_interval).await;
                if monitor.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                if !monitor.tick().await {
                    break;
                }
            }
            debug!(circuit = monitor.circuit_id, "Monitor stopped");
        });
    }

    /// Stop the tick loop
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    async fn emit(&self, status: MonitorStatus, details: HealthDetails) {
        let mut listeners = self.listeners.write().await;
        listeners.retain(|tx| tx.send(StatusEvent { status, details: details.clone() }).is_ok());
    }

    /// One evaluation cycle; returns false when monitoring should end
    pub async fn tick(&self) -> bool {
        let id = self.circuit_id;

        let Some(hops) = self.builder.hops(id).await else {
            // Circuit was torn down under us.
            return false;
        };

        if self.registry.available_count().await < self.config.min_nodes_required {
            self.emit(MonitorStatus::Waiting, HealthDetails::default()).await;
            return true;
        }

        // A circuit parked during bootstrap has no hops yet; now that
        // the pool is big enough, bring it up.
        if hops.is_empty() {
            return self.rebuild(&HashSet::new(), HealthDetails::default()).await;
        }

        // Classify each hop
        let staleness = self.config.staleness_window;
        let mut unhealthy = Vec::new();
        let mut latencies = Vec::new();
        let mut bandwidths = Vec::new();

        for hop in &hops {
            let healthy = match self.registry.peer(hop.peer).await {
                Some(entry) if entry.effective_status(staleness) == PeerStatus::Available => {
                    self.registry.validate(hop.peer).await
                }
                _ => false,
            };
            if healthy {
                if let Some(caps) = self.registry.peer(hop.peer).await.and_then(|e| e.capabilities) {
                    if caps.latency_ms != u64::MAX {
                        latencies.push(caps.latency_ms);
                    }
                    bandwidths.push(caps.max_bandwidth_bps);
                }
            } else {
                unhealthy.push(hop.peer);
            }
        }

        let details = HealthDetails {
            total: hops.len(),
            healthy: hops.len() - unhealthy.len(),
            avg_latency_ms: if latencies.is_empty() {
                None
            } else {
                Some(latencies.iter().sum::<u64>() / latencies.len() as u64)
            },
            min_bandwidth_bps: bandwidths.iter().copied().min(),
            unhealthy: unhealthy.clone(),
        };

        match decide(hops.len(), unhealthy.len()) {
            Decision::Healthy => {
                self.emit(MonitorStatus::Ready, details).await;
                true
            }
            Decision::Repair => {
                self.emit(MonitorStatus::Degraded, details.clone()).await;
                self.repair(&hops, &unhealthy, details).await
            }
            Decision::Rebuild => {
                let exclude: HashSet<NodeId> = unhealthy.iter().copied().collect();
                self.rebuild(&exclude, details).await
            }
        }
    }

    /// Replace each unhealthy hop; escalate to a rebuild on any failure
    async fn repair(
        &self,
        hops: &[crate::circuit::Hop],
        unhealthy: &[NodeId],
        details: HealthDetails,
    ) -> bool {
        let id = self.circuit_id;
        self.emit(MonitorStatus::Repairing, details.clone()).await;
        self.builder.set_state(id, CircuitState::Repairing).await;
        info!(circuit = id, count = unhealthy.len(), "Repairing circuit");

        // Neither current members nor the failing peers may be reused.
        let mut exclude: HashSet<NodeId> = hops.iter().map(|h| h.peer).collect();
        exclude.extend(unhealthy.iter().copied());

        for &old_peer in unhealthy {
            let role = match hops.iter().find(|h| h.peer == old_peer) {
                Some(hop) => hop.role,
                None => continue,
            };

            let Some(replacement) = self.registry.replacement_candidate(role, &exclude).await
            else {
                warn!(circuit = id, peer = %old_peer, "No replacement, escalating to rebuild");
                return self.rebuild(&exclude, details).await;
            };

            let new_peer = replacement.node_id;
            if let Err(e) = self.builder.replace_hop(id, old_peer, replacement).await {
                warn!(circuit = id, "Hop replacement failed ({}), escalating to rebuild", e);
                return self.rebuild(&exclude, details).await;
            }
            exclude.insert(new_peer);
        }

        let healthy = HealthDetails {
            total: details.total,
            healthy: details.total,
            ..details
        };
        self.emit(MonitorStatus::Ready, healthy).await;
        true
    }

    /// Rebuild the full hop set under the preserved circuit id
    async fn rebuild(&self, exclude: &HashSet<NodeId>, details: HealthDetails) -> bool {
        let id = self.circuit_id;
        self.emit(MonitorStatus::Rebuilding, details.clone()).await;
        self.builder.set_state(id, CircuitState::Rebuilding).await;
        info!(circuit = id, "Rebuilding circuit");

        match self.builder.rebuild(id, exclude).await {
            Ok(()) => {
                let healthy = HealthDetails {
                    total: details.total,
                    healthy: details.total,
                    ..details
                };
                self.emit(MonitorStatus::Ready, healthy).await;
                true
            }
            Err(e) => {
                warn!(circuit = id, "Rebuild failed: {}", e);
                self.builder.set_state(id, CircuitState::Failed).await;
                self.emit(MonitorStatus::Failed, details).await;
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_boundary() {
        // N = 3: floor(3/3) = 1 unhealthy still repairs, 2 rebuilds
        assert!(matches!(decide(3, 0), Decision::Healthy));
        assert!(matches!(decide(3, 1), Decision::Repair));
        assert!(matches!(decide(3, 2), Decision::Rebuild));

        // N = 6: the boundary sits at 2
        assert!(matches!(decide(6, 2), Decision::Repair));
        assert!(matches!(decide(6, 3), Decision::Rebuild));

        // N = 7: floor(7/3) = 2
        assert!(matches!(decide(7, 2), Decision::Repair));
        assert!(matches!(decide(7, 3), Decision::Rebuild));
    }
}
