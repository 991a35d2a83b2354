//! End-to-end circuit scenarios over the in-process network.
//!
//! Each test spins up a whole network (rendezvous bus + link fabric +
//! several engines), builds real circuits, and drives them through the
//! failure modes the monitor has to survive.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use veil_core::{
    ChannelEvent, Config, CoreError, MonitorStatus, NodeEngine, StatusEvent,
};
use veil_crypto::{NodeId, NodeIdentity};
use veil_signal::{MemoryFabric, MemoryRendezvous, Role, WireLocation};

/// Six cities in six regions
const CITIES: [(f64, f64); 6] = [
    (40.7, -74.0),   // New York
    (52.5, 13.4),    // Berlin
    (35.7, 139.7),   // Tokyo
    (-23.5, -46.6),  // Sao Paulo
    (6.5, 3.4),      // Lagos
    (-33.8, 151.2),  // Sydney
];

fn city(i: usize) -> Option<WireLocation> {
    let (latitude, longitude) = CITIES[i % CITIES.len()];
    Some(WireLocation { latitude, longitude, accuracy: 1000.0 })
}

struct TestNet {
    bus: Arc<MemoryRendezvous>,
    fabric: Arc<MemoryFabric>,
    engines: Vec<Arc<NodeEngine>>,
}

impl TestNet {
    /// Spawn one engine per spec; index 0 is the originator
    async fn spawn(specs: &[(Role, Option<WireLocation>)], config: Config) -> Self {
        let bus = MemoryRendezvous::new();
        let fabric = MemoryFabric::new();
        let mut engines = Vec::new();

        for (role, location) in specs {
            let identity = Arc::new(
                tokio::task::spawn_blocking(NodeIdentity::generate)
                    .await
                    .unwrap()
                    .unwrap(),
            );
            let node_id = identity.node_id();

            let mut config = config.clone();
            config.role_hint = *role;
            config.location = *location;

            let acceptor = fabric.register(node_id);
            let engine = NodeEngine::new(
                identity,
                config,
                Arc::new(bus.endpoint(node_id)),
                Arc::new(fabric.connector(node_id)),
                acceptor,
            )
            .await
            .unwrap();
            engine.start().await;
            engines.push(engine);
        }

        Self { bus, fabric, engines }
    }

    fn origin(&self) -> &Arc<NodeEngine> {
        &self.engines[0]
    }

    fn engine_for(&self, node_id: NodeId) -> &Arc<NodeEngine> {
        self.engines
            .iter()
            .find(|e| e.node_id() == node_id)
            .expect("no engine for node id")
    }

    /// Wait until the originator sees `n` Available peers
    async fn wait_for_pool(&self, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if self.origin().registry().available_count().await >= n {
                return;
            }
            assert!(Instant::now() < deadline, "peer pool never reached {n}");
            sleep(Duration::from_millis(50)).await;
        }
    }

    /// Funnel every peer's exit deliveries into one stream
    async fn collect_deliveries(&self) -> mpsc::UnboundedReceiver<(NodeId, u32, bytes::Bytes)> {
        let (tx, rx) = mpsc::unbounded_channel();
        for engine in self.engines.iter().skip(1) {
            if let Some(mut incoming) = engine.take_incoming().await {
                let tx = tx.clone();
                let node = engine.node_id();
                tokio::spawn(async move {
                    while let Some((circuit_id, data)) = incoming.recv().await {
                        let _ = tx.send((node, circuit_id, data));
                    }
                });
            }
        }
        rx
    }
}

/// Skip unrelated emissions until the wanted status arrives
async fn wait_for_status(
    rx: &mut mpsc::UnboundedReceiver<StatusEvent>,
    want: MonitorStatus,
    deadline: Duration,
) -> StatusEvent {
    timeout(deadline, async {
        loop {
            match rx.recv().await {
                Some(event) if event.status == want => return event,
                Some(_) => continue,
                None => panic!("monitor event stream closed while waiting for {want:?}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {want:?}"))
}

fn full_mesh_specs() -> Vec<(Role, Option<WireLocation>)> {
    vec![
        (Role::Relay, None), // originator
        (Role::Entry, city(0)),
        (Role::Relay, city(1)),
        (Role::Exit, city(2)),
        (Role::Relay, city(3)),
        (Role::Entry, city(4)),
        (Role::Exit, city(5)),
    ]
}

#[tokio::test(flavor = "multi_thread")]
async fn test_build_and_send_end_to_end() {
    let net = TestNet::spawn(&full_mesh_specs(), Config::loopback()).await;
    net.wait_for_pool(6).await;

    let mut deliveries = net.collect_deliveries().await;

    let (channel, mut events) = net.origin().open_channel(3).await.unwrap();
    let circuit_id = channel.circuit_id();

    // The channel opened exactly once
    assert!(matches!(events.recv().await, Some(ChannelEvent::Opened)));

    // One Entry, one Relay, one Exit, all distinct, regions within cap
    let hops = net.origin().builder().hops(circuit_id).await.unwrap();
    assert_eq!(hops.len(), 3);
    assert_eq!(hops[0].role, Role::Entry);
    assert_eq!(hops[1].role, Role::Relay);
    assert_eq!(hops[2].role, Role::Exit);
    let distinct: HashSet<_> = hops.iter().map(|h| h.peer).collect();
    assert_eq!(distinct.len(), 3);

    channel.send_text("hello").await.unwrap();

    let (exit_node, got_circuit, data) = timeout(Duration::from_secs(10), deliveries.recv())
        .await
        .expect("no exit delivery")
        .unwrap();
    assert_eq!(got_circuit, circuit_id);
    assert_eq!(data.as_ref(), b"hello");
    assert_eq!(exit_node, hops[2].peer);

    // Exactly once
    sleep(Duration::from_millis(300)).await;
    assert!(deliveries.try_recv().is_err());

    // Ordered multi-frame send
    channel.send(b"frame one").await.unwrap();
    channel.send(b"frame two").await.unwrap();
    let (_, _, first) = timeout(Duration::from_secs(5), deliveries.recv()).await.unwrap().unwrap();
    let (_, _, second) = timeout(Duration::from_secs(5), deliveries.recv()).await.unwrap().unwrap();
    assert_eq!(first.as_ref(), b"frame one");
    assert_eq!(second.as_ref(), b"frame two");

    // Idempotent close
    channel.close().await.unwrap();
    channel.close().await.unwrap();
    assert!(net.origin().builder().state(circuit_id).await.is_none());

    // A send after close fails cleanly
    let err = channel.send(b"too late").await.unwrap_err();
    assert!(matches!(err, CoreError::CircuitClosed(_)));

    for engine in &net.engines {
        engine.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_insufficient_peers_fails_build() {
    let mut config = Config::loopback();
    // Let the single peer admit itself so the failure is selection,
    // not admission.
    config.min_nodes_required = 1;

    let specs = vec![(Role::Relay, None), (Role::Entry, city(0))];
    let net = TestNet::spawn(&specs, config).await;
    net.wait_for_pool(1).await;

    let err = net.origin().build_circuit(3).await.unwrap_err();
    assert!(matches!(err, CoreError::InsufficientPeers { needed: 3, .. }));

    // The build failed before any peer link was touched
    assert_eq!(net.fabric.links_opened(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_short_build_coerced_to_min_hops() {
    let net = TestNet::spawn(&full_mesh_specs(), Config::loopback()).await;
    net.wait_for_pool(6).await;

    let circuit_id = net.origin().build_circuit(1).await.unwrap();
    let hops = net.origin().builder().hops(circuit_id).await.unwrap();
    assert_eq!(hops.len(), 3);

    for engine in &net.engines {
        engine.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_single_hop_failure_repairs() {
    let net = TestNet::spawn(&full_mesh_specs(), Config::loopback()).await;
    net.wait_for_pool(6).await;

    let (channel, _events) = net.origin().open_channel(3).await.unwrap();
    let circuit_id = channel.circuit_id();
    let before = net.origin().builder().hops(circuit_id).await.unwrap();

    let monitor = net.origin().monitor(circuit_id).await.unwrap();
    let mut status = monitor.subscribe().await;

    // Kill the middle hop: it stops announcing and goes stale
    let failed = before[1].peer;
    net.engine_for(failed).stop().await;

    wait_for_status(&mut status, MonitorStatus::Degraded, Duration::from_secs(15)).await;
    wait_for_status(&mut status, MonitorStatus::Repairing, Duration::from_secs(15)).await;
    wait_for_status(&mut status, MonitorStatus::Ready, Duration::from_secs(15)).await;

    let after = net.origin().builder().hops(circuit_id).await.unwrap();
    assert_eq!(after.len(), 3);
    assert!(after.iter().all(|h| h.peer != failed));
    // The replaced slot references a peer that was not in the circuit
    let old_members: HashSet<_> = before.iter().map(|h| h.peer).collect();
    assert!(!old_members.contains(&after[1].peer));

    // Traffic still flows over the repaired circuit
    let mut deliveries = net.collect_deliveries().await;
    channel.send(b"after repair").await.unwrap();
    let (_, _, data) = timeout(Duration::from_secs(10), deliveries.recv())
        .await
        .expect("no delivery after repair")
        .unwrap();
    assert_eq!(data.as_ref(), b"after repair");

    for engine in &net.engines {
        engine.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_majority_failure_rebuilds() {
    let net = TestNet::spawn(&full_mesh_specs(), Config::loopback()).await;
    net.wait_for_pool(6).await;

    let (channel, _events) = net.origin().open_channel(3).await.unwrap();
    let circuit_id = channel.circuit_id();
    let before = net.origin().builder().hops(circuit_id).await.unwrap();

    let monitor = net.origin().monitor(circuit_id).await.unwrap();
    let mut status = monitor.subscribe().await;

    // Two of three hops fail: beyond the repair threshold
    let dead: Vec<NodeId> = vec![before[0].peer, before[1].peer];
    for &node in &dead {
        net.engine_for(node).stop().await;
    }

    wait_for_status(&mut status, MonitorStatus::Rebuilding, Duration::from_secs(15)).await;
    wait_for_status(&mut status, MonitorStatus::Ready, Duration::from_secs(15)).await;

    // Identity preserved, no overlap with the unhealthy set
    let after = net.origin().builder().hops(circuit_id).await.unwrap();
    assert_eq!(after.len(), 3);
    assert!(after.iter().all(|h| !dead.contains(&h.peer)));
    assert_eq!(
        net.origin().builder().state(circuit_id).await,
        Some(veil_core::CircuitState::Ready)
    );

    for engine in &net.engines {
        engine.stop().await;
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_signaling_drop_leaves_circuit_usable() {
    let net = TestNet::spawn(&full_mesh_specs(), Config::loopback()).await;
    net.wait_for_pool(6).await;

    let mut deliveries = net.collect_deliveries().await;
    let (channel, _events) = net.origin().open_channel(3).await.unwrap();

    let mut adapter_events = net.origin().adapter().events();

    // Sever the originator's signaling connection
    net.bus.disconnect(net.origin().node_id());

    // Peer links are independent of signaling: sends keep working
    channel.send(b"mid-outage").await.unwrap();
    let (_, _, data) = timeout(Duration::from_secs(10), deliveries.recv())
        .await
        .expect("no delivery during outage")
        .unwrap();
    assert_eq!(data.as_ref(), b"mid-outage");

    // The adapter reconnects with backoff
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        let event = timeout(Duration::from_secs(10), adapter_events.recv())
            .await
            .expect("no adapter event")
            .unwrap();
        if event == veil_signal::AdapterEvent::Connected {
            break;
        }
        assert!(Instant::now() < deadline);
    }
    assert!(net.origin().adapter().is_connected());

    // The registry resynchronizes from fresh announcements
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if net.origin().registry().available_count().await >= 6 {
            break;
        }
        assert!(Instant::now() < deadline, "registry never resynchronized");
        sleep(Duration::from_millis(50)).await;
    }

    for engine in &net.engines {
        engine.stop().await;
    }
}
