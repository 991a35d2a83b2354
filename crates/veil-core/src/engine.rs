//! Node Engine
//!
//! Wires identity, signaling, registry, builder, relay, and monitors
//! into one running node. The engine owns the inbound dispatch: control
//! messages feed the registry, establishment frames feed the relay, and
//! inbound peer links are handed to the relay's per-link tasks. Exit
//! plaintext is routed to the owning channel when one exists, otherwise
//! surfaced on the incoming stream.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as TokioMutex, RwLock};
use tracing::{debug, info, warn};

use veil_crypto::{NodeId, NodeIdentity};
use veil_signal::{
    CircuitId, PeerConnector, PeerLink, ReconnectConfig, SignalMessage, SignalingAdapter,
    SignalingTransport,
};

use crate::channel::{ChannelEvent, CircuitChannel};
use crate::circuit::CircuitBuilder;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::monitor::CircuitMonitor;
use crate::registry::PeerRegistry;
use crate::relay::{ExitDelivery, RelayHandler};

/// One running veil node
pub struct NodeEngine {
    identity: Arc<NodeIdentity>,
    config: Config,
    adapter: Arc<SignalingAdapter>,
    registry: Arc<PeerRegistry>,
    builder: Arc<CircuitBuilder>,
    relay: Arc<RelayHandler>,
    monitors: RwLock<HashMap<CircuitId, Arc<CircuitMonitor>>>,
    channels: Arc<RwLock<HashMap<CircuitId, Arc<CircuitChannel>>>>,
    /// Inbound link acceptor, consumed by `start`
    acceptor: TokioMutex<Option<mpsc::UnboundedReceiver<Box<dyn PeerLink>>>>,
    /// Relay exit deliveries, consumed by `start`
    deliveries: TokioMutex<Option<mpsc::UnboundedReceiver<ExitDelivery>>>,
    /// Deliveries for circuits without a local channel
    incoming_tx: mpsc::UnboundedSender<ExitDelivery>,
    incoming_rx: TokioMutex<Option<mpsc::UnboundedReceiver<ExitDelivery>>>,
    shutdown: AtomicBool,
}

impl NodeEngine {
    /// Connect signaling and assemble the components
    pub async fn new(
        identity: Arc<NodeIdentity>,
        config: Config,
        transport: Arc<dyn SignalingTransport>,
        connector: Arc<dyn PeerConnector>,
        acceptor: mpsc::UnboundedReceiver<Box<dyn PeerLink>>,
    ) -> CoreResult<Arc<Self>> {
        config.validate().map_err(CoreError::Config)?;

        let adapter = SignalingAdapter::connect(
            transport,
            ReconnectConfig {
                base_backoff: config.reconnect_backoff,
                max_attempts: config.max_reconnect_attempts,
                ..ReconnectConfig::default()
            },
        )
        .await?;

        let registry = PeerRegistry::new(
            Arc::clone(&identity),
            config.clone(),
            Arc::clone(&adapter),
            Some(Arc::clone(&connector)),
        );
        let (relay, deliveries) = RelayHandler::new(
            Arc::clone(&identity),
            Arc::clone(&connector),
            config.hop_establish_timeout,
        );
        let builder = CircuitBuilder::new(
            Arc::clone(&identity),
            config.clone(),
            Arc::clone(&registry),
            Arc::clone(&adapter),
            connector,
        );

        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        Ok(Arc::new(Self {
            identity,
            config,
            adapter,
            registry,
            builder,
            relay,
            monitors: RwLock::new(HashMap::new()),
            channels: Arc::new(RwLock::new(HashMap::new())),
            acceptor: TokioMutex::new(Some(acceptor)),
            deliveries: TokioMutex::new(Some(deliveries)),
            incoming_tx,
            incoming_rx: TokioMutex::new(Some(incoming_rx)),
            shutdown: AtomicBool::new(false),
        }))
    }

    /// This node's id
    pub fn node_id(&self) -> NodeId {
        self.identity.node_id()
    }

    /// The peer registry
    pub fn registry(&self) -> &Arc<PeerRegistry> {
        &self.registry
    }

    /// The circuit builder
    pub fn builder(&self) -> &Arc<CircuitBuilder> {
        &self.builder
    }

    /// The signaling adapter
    pub fn adapter(&self) -> &Arc<SignalingAdapter> {
        &self.adapter
    }

    /// The relay handler
    pub fn relay(&self) -> &Arc<RelayHandler> {
        &self.relay
    }

    /// Start announcement, dispatch, link acceptance, and delivery
    /// routing
    pub async fn start(self: &Arc<Self>) {
        info!(node = %self.node_id(), role = ?self.config.role_hint, "Starting node");
        self.registry.start();
        self.spawn_dispatch();
        self.spawn_acceptor().await;
        self.spawn_delivery_pump().await;
    }

    /// Stop background work and tear down circuits
    pub async fn stop(&self) {
        info!(node = %self.node_id(), "Stopping node");
        self.shutdown.store(true, Ordering::SeqCst);

        for (_, monitor) in self.monitors.write().await.drain() {
            monitor.stop();
        }
        for id in self.builder.circuit_ids().await {
            if let Err(e) = self.builder.close(id).await {
                warn!(circuit = id, "Error closing circuit: {}", e);
            }
        }
        self.relay.shutdown().await;
        self.registry.stop();
        self.adapter.close().await;
    }

    fn spawn_dispatch(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        let mut rx = self.adapter.subscribe();
        tokio::spawn(async move {
            use tokio::sync::broadcast::error::RecvError;
            loop {
                if engine.shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match rx.recv().await {
                    Ok(SignalMessage::CircuitSignaling(frame)) => {
                        if frame.target_node_id == engine.node_id() {
                            engine.relay.handle_signaling(frame).await;
                        }
                    }
                    // Data frames ride peer links, not signaling.
                    Ok(SignalMessage::CircuitData(_)) => {}
                    Ok(msg) => engine.registry.handle_message(msg).await,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Signaling dispatch lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!("Dispatch task stopped");
        });
    }

    async fn spawn_acceptor(self: &Arc<Self>) {
        let Some(mut acceptor) = self.acceptor.lock().await.take() else {
            return;
        };
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(link) = acceptor.recv().await {
                engine.relay.handle_link(link);
            }
        });
    }

    async fn spawn_delivery_pump(self: &Arc<Self>) {
        let Some(mut deliveries) = self.deliveries.lock().await.take() else {
            return;
        };
        let channels = Arc::clone(&self.channels);
        let incoming = self.incoming_tx.clone();
        tokio::spawn(async move {
            while let Some((circuit_id, bytes)) = deliveries.recv().await {
                let channel = channels.read().await.get(&circuit_id).cloned();
                match channel {
                    Some(channel) => channel.deliver(bytes).await,
                    None => {
                        let _ = incoming.send((circuit_id, bytes));
                    }
                }
            }
        });
    }

    /// Exit plaintext for circuits with no registered channel
    ///
    /// Can be taken once; this is the application-layer receive path on
    /// exit nodes.
    pub async fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<ExitDelivery>> {
        self.incoming_rx.lock().await.take()
    }

    /// Build a circuit of `hops` hops
    pub async fn build_circuit(&self, hops: usize) -> CoreResult<CircuitId> {
        self.builder.build(hops, &HashSet::new()).await
    }

    /// Start a health monitor for a circuit
    pub async fn monitor_circuit(&self, circuit_id: CircuitId) -> Arc<CircuitMonitor> {
        let monitor = CircuitMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.builder),
            circuit_id,
            self.config.clone(),
        );
        monitor.start();
        self.monitors
            .write()
            .await
            .insert(circuit_id, Arc::clone(&monitor));
        monitor
    }

    /// The monitor for a circuit, if one is running
    pub async fn monitor(&self, circuit_id: CircuitId) -> Option<Arc<CircuitMonitor>> {
        self.monitors.read().await.get(&circuit_id).cloned()
    }

    /// Build a circuit, start its monitor, and open a channel over it
    pub async fn open_channel(
        &self,
        hops: usize,
    ) -> CoreResult<(Arc<CircuitChannel>, mpsc::UnboundedReceiver<ChannelEvent>)> {
        let circuit_id = self.build_circuit(hops).await?;
        self.monitor_circuit(circuit_id).await;

        let (channel, events) = CircuitChannel::new(Arc::clone(&self.builder), circuit_id);
        channel.connect().await?;
        self.channels
            .write()
            .await
            .insert(circuit_id, Arc::clone(&channel));
        Ok((channel, events))
    }

    /// Accept the receiving side of an inbound circuit
    pub async fn accept_channel(
        &self,
        circuit_id: CircuitId,
    ) -> (Arc<CircuitChannel>, mpsc::UnboundedReceiver<ChannelEvent>) {
        let (channel, events) = CircuitChannel::accept(Arc::clone(&self.builder), circuit_id);
        self.channels
            .write()
            .await
            .insert(circuit_id, Arc::clone(&channel));
        (channel, events)
    }

    /// Close a circuit and discard its monitor
    pub async fn close_circuit(&self, circuit_id: CircuitId) -> CoreResult<()> {
        if let Some(monitor) = self.monitors.write().await.remove(&circuit_id) {
            monitor.stop();
        }
        self.channels.write().await.remove(&circuit_id);
        self.builder.close(circuit_id).await
    }
}
