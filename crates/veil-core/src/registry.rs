//! Peer Registry
//!
//! Maintains the local view of the network: announces this node,
//! tracks peers from signaling traffic, measures local capabilities,
//! validates candidates against admission thresholds, and answers
//! ranked candidate queries for the circuit builder.
//!
//! The registry owns the peer table; every read returns value copies so
//! callers never hold references into it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use rand::Rng;
use tokio::sync::{oneshot, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, trace, warn};

use veil_crypto::{NodeId, NodeIdentity, PublicKey};
use veil_signal::{
    PeerConnector, PeerStatus, Role, SignalMessage, SignalingAdapter, WireCapabilities,
    WireLocation,
};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::measure::{probe_bandwidth, BandwidthMeter, DEFAULT_BANDWIDTH_BPS};
use crate::region::Region;

/// Milliseconds since the Unix epoch
pub(crate) fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// One peer as seen by this node
#[derive(Clone)]
pub struct PeerEntry {
    pub node_id: NodeId,
    pub role: Role,
    pub status: PeerStatus,
    pub public_key: PublicKey,
    pub location: Option<WireLocation>,
    /// Last observed capabilities; unknown until the peer answers a
    /// validation request
    pub capabilities: Option<WireCapabilities>,
    pub last_seen: Instant,
}

impl PeerEntry {
    /// Whether the peer has been seen within the staleness window
    /// (the window edge itself still counts as live)
    pub fn is_live(&self, staleness: Duration) -> bool {
        self.last_seen.elapsed() <= staleness
    }

    /// Status with staleness applied
    pub fn effective_status(&self, staleness: Duration) -> PeerStatus {
        if self.is_live(staleness) {
            self.status
        } else {
            PeerStatus::Offline
        }
    }

    /// The peer's continental region
    pub fn region(&self) -> Region {
        Region::locate(self.location.as_ref())
    }
}

impl std::fmt::Debug for PeerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEntry")
            .field("node_id", &self.node_id)
            .field("role", &self.role)
            .field("status", &self.status)
            .finish()
    }
}

/// Local, registry-owned state
struct LocalState {
    role: Role,
    status: PeerStatus,
    last_rotation: Instant,
    transfers_total: u64,
    transfers_ok: u64,
    /// Latest round-trip measurement, milliseconds
    latency_ms: u64,
    bandwidth: BandwidthMeter,
}

type ValidationReply = (PeerStatus, WireCapabilities);

/// The peer registry
pub struct PeerRegistry {
    identity: Arc<NodeIdentity>,
    config: Config,
    adapter: Arc<SignalingAdapter>,
    connector: Option<Arc<dyn PeerConnector>>,
    peers: RwLock<HashMap<NodeId, PeerEntry>>,
    local: RwLock<LocalState>,
    pending_validations: StdMutex<HashMap<(NodeId, u64), oneshot::Sender<ValidationReply>>>,
    pending_pings: StdMutex<HashMap<(NodeId, u64), oneshot::Sender<()>>>,
    /// Validation verdict cache, refreshed per staleness window
    validated: RwLock<HashMap<NodeId, (Instant, bool)>>,
    /// Correlation counter for request/response pairs
    seq: AtomicU64,
    shutdown: AtomicBool,
}

impl PeerRegistry {
    /// Create a registry; `connector` enables bandwidth probing
    pub fn new(
        identity: Arc<NodeIdentity>,
        config: Config,
        adapter: Arc<SignalingAdapter>,
        connector: Option<Arc<dyn PeerConnector>>,
    ) -> Arc<Self> {
        let window = config.bandwidth.sample_window;
        let role = config.role_hint;
        Arc::new(Self {
            identity,
            config,
            adapter,
            connector,
            peers: RwLock::new(HashMap::new()),
            local: RwLock::new(LocalState {
                role,
                status: PeerStatus::Waiting,
                last_rotation: Instant::now(),
                transfers_total: 0,
                transfers_ok: 0,
                latency_ms: 0,
                bandwidth: BandwidthMeter::new(window),
            }),
            pending_validations: StdMutex::new(HashMap::new()),
            pending_pings: StdMutex::new(HashMap::new()),
            validated: RwLock::new(HashMap::new()),
            seq: AtomicU64::new(unix_millis()),
            shutdown: AtomicBool::new(false),
        })
    }

    /// This node's id
    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// Spawn the announcement loop
    pub fn start(self: &Arc<Self>) {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            registry.announce_loop().await;
        });
    }

    /// Stop background work
    pub fn stop(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Announce until admitted, then heartbeat
    async fn announce_loop(self: Arc<Self>) {
        // Waiting window: announce every interval; admit once enough
        // other peers are visible, otherwise re-enter the window.
        'waiting: loop {
            let window_end = Instant::now() + self.config.waiting_period;
            while Instant::now() < window_end {
                if self.is_shutdown() {
                    return;
                }
                self.announce().await;

                if self.admission_pool_size().await >= self.config.min_nodes_required {
                    self.set_status(PeerStatus::Available).await;
                    info!(node = %self.node_id(), "Peer pool sufficient, now available");
                    break 'waiting;
                }
                sleep(self.config.announce_interval).await;
            }
            debug!(node = %self.node_id(), "Waiting window elapsed, re-entering");
        }

        // Steady state: heartbeat announcements, rotation checks, and
        // bandwidth probes.
        loop {
            if self.is_shutdown() {
                return;
            }
            self.update_status().await;
            self.announce().await;
            self.maybe_probe_bandwidth().await;
            self.evict_stale().await;
            sleep(self.config.announce_interval).await;
        }
    }

    /// Other peers currently visible as Waiting or Available
    async fn admission_pool_size(&self) -> usize {
        let staleness = self.config.staleness_window;
        self.peers
            .read()
            .await
            .values()
            .filter(|p| {
                matches!(
                    p.effective_status(staleness),
                    PeerStatus::Waiting | PeerStatus::Available
                )
            })
            .count()
    }

    /// Broadcast a `node_announcement` for this node
    pub async fn announce(&self) {
        let (role, status) = {
            let local = self.local.read().await;
            (local.role, local.status)
        };
        let msg = SignalMessage::NodeAnnouncement {
            node_id: self.node_id(),
            role,
            status,
            public_key: self.identity.public_key().to_base64(),
            location: self.config.location,
        };
        if let Err(e) = self.adapter.send(&msg).await {
            trace!("Announcement not sent: {}", e);
        }
    }

    /// Apply pending role rotation and broadcast current status
    pub async fn update_status(&self) {
        let (role, status) = {
            let mut local = self.local.write().await;
            if local.last_rotation.elapsed() >= self.config.role_rotation {
                let next = local.role.next();
                debug!(node = %self.node_id(), from = ?local.role, to = ?next, "Rotating role");
                local.role = next;
                local.last_rotation = Instant::now();
            }
            (local.role, local.status)
        };
        let msg = SignalMessage::NodeStatus {
            node_id: self.node_id(),
            status,
            role: Some(role),
        };
        if let Err(e) = self.adapter.send(&msg).await {
            trace!("Status not sent: {}", e);
        }
    }

    /// Set the local status (announced on the next status update)
    pub async fn set_status(&self, status: PeerStatus) {
        self.local.write().await.status = status;
        let msg = SignalMessage::NodeStatus {
            node_id: self.node_id(),
            status,
            role: Some(self.local.read().await.role),
        };
        if let Err(e) = self.adapter.send(&msg).await {
            trace!("Status not sent: {}", e);
        }
    }

    /// Current local role
    pub async fn local_role(&self) -> Role {
        self.local.read().await.role
    }

    /// Current local status
    pub async fn local_status(&self) -> PeerStatus {
        self.local.read().await.status
    }

    /// Record the outcome of a transfer for the reliability ratio
    pub async fn record_transfer(&self, ok: bool) {
        let mut local = self.local.write().await;
        local.transfers_total += 1;
        if ok {
            local.transfers_ok += 1;
        }
    }

    /// Consistent snapshot of local capabilities
    pub async fn local_capabilities(&self) -> WireCapabilities {
        let local = self.local.read().await;
        let bandwidth = local
            .bandwidth
            .smoothed()
            .or(self.config.bandwidth.downlink_estimate_bps)
            .unwrap_or(DEFAULT_BANDWIDTH_BPS);
        let reliability = if local.transfers_total == 0 {
            1.0
        } else {
            local.transfers_ok as f64 / local.transfers_total.max(1) as f64
        };
        WireCapabilities {
            max_bandwidth_bps: bandwidth,
            latency_ms: local.latency_ms,
            reliability,
            uptime_ms: self.identity.uptime().as_millis() as u64,
        }
    }

    async fn maybe_probe_bandwidth(&self) {
        let Some(endpoint) = self.config.bandwidth.probe_endpoint else {
            return;
        };
        let Some(connector) = self.connector.as_deref() else {
            return;
        };
        let due = {
            let local = self.local.read().await;
            local.bandwidth.probe_due(self.config.bandwidth.sample_interval)
        };
        if !due {
            return;
        }
        match probe_bandwidth(connector, endpoint, self.config.bandwidth.probe_bytes).await {
            Ok(bps) => self.local.write().await.bandwidth.record(bps),
            Err(e) => debug!("Bandwidth probe failed: {}", e),
        }
    }

    // -----------------------------------------------------------------
    // Inbound signaling
    // -----------------------------------------------------------------

    /// Apply one inbound control message
    pub async fn handle_message(&self, msg: SignalMessage) {
        match msg {
            SignalMessage::NodeAnnouncement {
                node_id,
                role,
                status,
                public_key,
                location,
            } => {
                if node_id == self.node_id() {
                    return;
                }
                let public_key = match PublicKey::from_base64(&public_key) {
                    Ok(pk) => pk,
                    Err(e) => {
                        warn!(peer = %node_id, "Announcement with bad public key: {}", e);
                        return;
                    }
                };
                let mut peers = self.peers.write().await;
                match peers.get_mut(&node_id) {
                    Some(entry) => {
                        entry.role = role;
                        entry.status = status;
                        entry.public_key = public_key;
                        entry.location = location;
                        entry.last_seen = Instant::now();
                    }
                    None => {
                        debug!(peer = %node_id, ?role, "New peer announced");
                        peers.insert(
                            node_id,
                            PeerEntry {
                                node_id,
                                role,
                                status,
                                public_key,
                                location,
                                capabilities: None,
                                last_seen: Instant::now(),
                            },
                        );
                    }
                }
            }

            SignalMessage::NodeStatus { node_id, status, role } => {
                let mut peers = self.peers.write().await;
                if let Some(entry) = peers.get_mut(&node_id) {
                    entry.status = status;
                    if let Some(role) = role {
                        entry.role = role;
                    }
                    entry.last_seen = Instant::now();
                }
            }

            SignalMessage::NodeValidation { node_id, target_node_id, timestamp } => {
                if target_node_id != self.node_id() {
                    return;
                }
                let reply = SignalMessage::NodeValidationResponse {
                    node_id: self.node_id(),
                    target_node_id: node_id,
                    timestamp,
                    status: self.local_status().await,
                    capabilities: self.local_capabilities().await,
                };
                if let Err(e) = self.adapter.send(&reply).await {
                    trace!("Validation response not sent: {}", e);
                }
            }

            SignalMessage::NodeValidationResponse {
                node_id,
                target_node_id,
                timestamp,
                status,
                capabilities,
            } => {
                if target_node_id != self.node_id() {
                    return;
                }
                {
                    let mut peers = self.peers.write().await;
                    if let Some(entry) = peers.get_mut(&node_id) {
                        entry.status = status;
                        entry.capabilities = Some(capabilities);
                        entry.last_seen = Instant::now();
                    }
                }
                let waiter = self
                    .pending_validations
                    .lock()
                    .unwrap()
                    .remove(&(node_id, timestamp));
                if let Some(tx) = waiter {
                    let _ = tx.send((status, capabilities));
                }
            }

            SignalMessage::NodePing { node_id, target_node_id, timestamp } => {
                if target_node_id != self.node_id() {
                    return;
                }
                let reply = SignalMessage::NodePong {
                    node_id: self.node_id(),
                    target_node_id: node_id,
                    timestamp,
                };
                if let Err(e) = self.adapter.send(&reply).await {
                    trace!("Pong not sent: {}", e);
                }
            }

            SignalMessage::NodePong { node_id, target_node_id, timestamp } => {
                if target_node_id != self.node_id() {
                    return;
                }
                let waiter = self.pending_pings.lock().unwrap().remove(&(node_id, timestamp));
                if let Some(tx) = waiter {
                    let _ = tx.send(());
                }
            }

            SignalMessage::NodeDiscovery { request_id, .. } => {
                trace!(request_id = %request_id, "Answering discovery with an announcement");
                self.announce().await;
            }

            // Circuit-plane frames are routed by the engine, not here.
            SignalMessage::CircuitSignaling(_) | SignalMessage::CircuitData(_) => {}
        }
    }

    // -----------------------------------------------------------------
    // Validation & ping
    // -----------------------------------------------------------------

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    /// Measure round-trip latency to a peer
    ///
    /// Updates the peer's observed latency; a timeout records it as
    /// unreachable (`u64::MAX`).
    pub async fn ping(&self, peer: NodeId) -> CoreResult<Duration> {
        let timestamp = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending_pings.lock().unwrap().insert((peer, timestamp), tx);

        let started = Instant::now();
        let msg = SignalMessage::NodePing {
            node_id: self.node_id(),
            target_node_id: peer,
            timestamp,
        };
        if let Err(e) = self.adapter.send(&msg).await {
            self.pending_pings.lock().unwrap().remove(&(peer, timestamp));
            return Err(e.into());
        }

        match timeout(self.config.validation_timeout, rx).await {
            Ok(Ok(())) => {
                let rtt = started.elapsed();
                self.local.write().await.latency_ms = rtt.as_millis() as u64;
                let mut peers = self.peers.write().await;
                if let Some(entry) = peers.get_mut(&peer) {
                    if let Some(caps) = entry.capabilities.as_mut() {
                        caps.latency_ms = rtt.as_millis() as u64;
                    }
                }
                Ok(rtt)
            }
            _ => {
                self.pending_pings.lock().unwrap().remove(&(peer, timestamp));
                let mut peers = self.peers.write().await;
                if let Some(entry) = peers.get_mut(&peer) {
                    if let Some(caps) = entry.capabilities.as_mut() {
                        caps.latency_ms = u64::MAX;
                    }
                }
                Err(CoreError::Timeout { scope: "ping" })
            }
        }
    }

    /// Check a peer against the admission thresholds
    ///
    /// Sends a validation request and scores the response; verdicts are
    /// cached for one staleness window. Timeouts and missing peers are
    /// simply inadmissible.
    pub async fn validate(&self, peer: NodeId) -> bool {
        if peer == self.node_id() {
            return false;
        }
        {
            let cache = self.validated.read().await;
            if let Some((at, verdict)) = cache.get(&peer) {
                if at.elapsed() <= self.config.staleness_window {
                    return *verdict;
                }
            }
        }

        let verdict = self.validate_uncached(peer).await;
        self.validated.write().await.insert(peer, (Instant::now(), verdict));
        verdict
    }

    async fn validate_uncached(&self, peer: NodeId) -> bool {
        {
            let peers = self.peers.read().await;
            match peers.get(&peer) {
                Some(entry) if entry.is_live(self.config.staleness_window) => {}
                _ => return false,
            }
        }

        let timestamp = self.next_seq();
        let (tx, rx) = oneshot::channel();
        self.pending_validations
            .lock()
            .unwrap()
            .insert((peer, timestamp), tx);

        let msg = SignalMessage::NodeValidation {
            node_id: self.node_id(),
            target_node_id: peer,
            timestamp,
        };
        if self.adapter.send(&msg).await.is_err() {
            self.pending_validations.lock().unwrap().remove(&(peer, timestamp));
            return false;
        }

        match timeout(self.config.validation_timeout, rx).await {
            Ok(Ok((_, caps))) => self.admissible(&caps),
            _ => {
                self.pending_validations.lock().unwrap().remove(&(peer, timestamp));
                trace!(peer = %peer, "Validation timed out");
                false
            }
        }
    }

    fn admissible(&self, caps: &WireCapabilities) -> bool {
        let adm = &self.config.admission;
        caps.max_bandwidth_bps >= adm.min_bandwidth_bps
            && caps.latency_ms <= adm.max_latency_ms
            && caps.uptime_ms as u128 >= adm.min_uptime.as_millis()
            && caps.reliability >= adm.min_reliability
    }

    // -----------------------------------------------------------------
    // Candidate selection
    // -----------------------------------------------------------------

    /// Weighted candidate score in [0, 1]
    fn score(caps: &WireCapabilities) -> f64 {
        let bw = (caps.max_bandwidth_bps as f64 / (1024.0 * 1024.0)).min(1.0);
        let latency = if caps.latency_ms == u64::MAX {
            0.0
        } else {
            (1.0 - caps.latency_ms as f64 / 1000.0).max(0.0)
        };
        let uptime = (caps.uptime_ms as f64 / (24.0 * 3600.0 * 1000.0)).min(1.0);
        0.3 * bw + 0.2 * latency + 0.3 * caps.reliability + 0.2 * uptime
    }

    /// Slot roles along a circuit of length `n`
    pub fn roles_for_slots(n: usize) -> Vec<Role> {
        match n {
            0 => Vec::new(),
            1 => vec![Role::Exit],
            _ => {
                let mut roles = Vec::with_capacity(n);
                roles.push(Role::Entry);
                roles.extend(std::iter::repeat(Role::Relay).take(n - 2));
                roles.push(Role::Exit);
                roles
            }
        }
    }

    /// Select `n` validated peers ordered from Entry through Relay(s)
    /// to Exit
    ///
    /// Returns an empty vector when any slot cannot be filled; callers
    /// interpret that as "insufficient peers".
    pub async fn suitable_relays(&self, n: usize, exclude: &HashSet<NodeId>) -> Vec<PeerEntry> {
        let staleness = self.config.staleness_window;

        // Live candidates, by value
        let live: Vec<PeerEntry> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|p| !exclude.contains(&p.node_id))
                .filter(|p| p.effective_status(staleness) == PeerStatus::Available)
                .cloned()
                .collect()
        };

        // Validate each survivor; validation refreshes capabilities.
        let mut admitted = Vec::with_capacity(live.len());
        for peer in live {
            if self.validate(peer.node_id).await {
                // Re-read for the capabilities the validation imported
                if let Some(entry) = self.peers.read().await.get(&peer.node_id) {
                    if entry.capabilities.is_some() {
                        admitted.push(entry.clone());
                    }
                }
            }
        }

        // Rank by weighted score
        admitted.sort_by(|a, b| {
            let sa = a.capabilities.as_ref().map_or(0.0, Self::score);
            let sb = b.capabilities.as_ref().map_or(0.0, Self::score);
            sb.partial_cmp(&sa).unwrap_or(std::cmp::Ordering::Equal)
        });

        // Regional diversity: at most two peers per region
        let mut per_region: HashMap<Region, usize> = HashMap::new();
        let mut pool: Vec<PeerEntry> = Vec::with_capacity(admitted.len());
        for peer in admitted {
            let count = per_region.entry(peer.region()).or_insert(0);
            if *count < 2 {
                *count += 1;
                pool.push(peer);
            }
        }

        // Fill each slot from the top three of the matching role,
        // picked uniformly to keep selection unpredictable.
        let mut selection = Vec::with_capacity(n);
        for role in Self::roles_for_slots(n) {
            let top: Vec<usize> = pool
                .iter()
                .enumerate()
                .filter(|(_, p)| p.role == role)
                .map(|(i, _)| i)
                .take(3)
                .collect();
            if top.is_empty() {
                debug!(?role, "No candidate for slot, selection failed");
                return Vec::new();
            }
            let pick = top[rand::thread_rng().gen_range(0..top.len())];
            selection.push(pool.remove(pick));
        }
        selection
    }

    /// One validated replacement of the given role
    pub async fn replacement_candidate(
        &self,
        role: Role,
        exclude: &HashSet<NodeId>,
    ) -> Option<PeerEntry> {
        let staleness = self.config.staleness_window;
        let live: Vec<PeerEntry> = {
            let peers = self.peers.read().await;
            peers
                .values()
                .filter(|p| !exclude.contains(&p.node_id))
                .filter(|p| p.role == role)
                .filter(|p| p.effective_status(staleness) == PeerStatus::Available)
                .cloned()
                .collect()
        };
        for peer in live {
            if self.validate(peer.node_id).await {
                if let Some(entry) = self.peers.read().await.get(&peer.node_id) {
                    return Some(entry.clone());
                }
            }
        }
        None
    }

    // -----------------------------------------------------------------
    // Table reads
    // -----------------------------------------------------------------

    /// Value copy of one peer entry
    pub async fn peer(&self, id: NodeId) -> Option<PeerEntry> {
        self.peers.read().await.get(&id).cloned()
    }

    /// Value copies of all peer entries
    pub async fn peers(&self) -> Vec<PeerEntry> {
        self.peers.read().await.values().cloned().collect()
    }

    /// Live peers currently Available
    pub async fn available_count(&self) -> usize {
        let staleness = self.config.staleness_window;
        self.peers
            .read()
            .await
            .values()
            .filter(|p| p.effective_status(staleness) == PeerStatus::Available)
            .count()
    }

    /// Evict entries beyond the staleness window
    ///
    /// Staleness is already applied on every read; eviction just keeps
    /// the table from accumulating dead peers.
    pub async fn evict_stale(&self) -> usize {
        let staleness = self.config.staleness_window;
        let mut peers = self.peers.write().await;
        let before = peers.len();
        peers.retain(|_, p| p.is_live(staleness));
        before - peers.len()
    }

    #[cfg(test)]
    pub(crate) async fn seed_peer(&self, entry: PeerEntry, validated: bool) {
        let id = entry.node_id;
        self.peers.write().await.insert(id, entry);
        self.validated
            .write()
            .await
            .insert(id, (Instant::now(), validated));
    }

    #[cfg(test)]
    pub(crate) async fn set_last_seen(&self, id: NodeId, at: Instant) {
        if let Some(entry) = self.peers.write().await.get_mut(&id) {
            entry.last_seen = at;
        }
    }
}
