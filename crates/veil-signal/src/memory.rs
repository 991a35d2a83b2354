//! In-Process Rendezvous and Link Fabric
//!
//! Reference implementations of the signaling transport and peer-link
//! seams, routing entirely inside one process. Tests and the demo binary
//! run whole multi-node networks on top of these; they also double as
//! the behavioral contract for real transports (broadcast vs. unicast
//! routing, drop-on-disconnect, refusal semantics).
//!
//! Fault injection: [`MemoryRendezvous::disconnect`] severs a client's
//! current connection (exercising adapter reconnect),
//! [`MemoryRendezvous::set_offline`] makes subsequent handshakes fail,
//! and [`MemoryFabric::set_refuse`] makes a node reject link opens.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tracing::trace;

use veil_crypto::NodeId;

use crate::adapter::{SignalingConnection, SignalingTransport};
use crate::error::{SignalError, SignalResult};
use crate::link::{PeerConnector, PeerLink};
use crate::wire::SignalMessage;

// ---------------------------------------------------------------------
// Rendezvous bus
// ---------------------------------------------------------------------

struct BusShared {
    /// Attached clients: node id -> (connection epoch, inbound sender)
    clients: HashMap<NodeId, (u64, mpsc::UnboundedSender<String>)>,
    /// Nodes whose handshakes currently fail
    offline: HashSet<NodeId>,
    next_epoch: u64,
}

/// An in-process rendezvous service
pub struct MemoryRendezvous {
    shared: Arc<StdMutex<BusShared>>,
}

impl MemoryRendezvous {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(StdMutex::new(BusShared {
                clients: HashMap::new(),
                offline: HashSet::new(),
                next_epoch: 0,
            })),
        })
    }

    /// A transport endpoint bound to one node
    pub fn endpoint(&self, node: NodeId) -> MemoryEndpoint {
        MemoryEndpoint {
            node,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Sever the node's current connection (it may reconnect)
    pub fn disconnect(&self, node: NodeId) {
        let mut shared = self.shared.lock().unwrap();
        shared.clients.remove(&node);
    }

    /// Make future handshakes for the node fail (or succeed again)
    pub fn set_offline(&self, node: NodeId, offline: bool) {
        let mut shared = self.shared.lock().unwrap();
        if offline {
            shared.offline.insert(node);
        } else {
            shared.offline.remove(&node);
        }
    }
}

/// One node's view of the rendezvous service
pub struct MemoryEndpoint {
    node: NodeId,
    shared: Arc<StdMutex<BusShared>>,
}

#[async_trait]
impl SignalingTransport for MemoryEndpoint {
    async fn connect(&self) -> SignalResult<Box<dyn SignalingConnection>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let epoch;
        {
            let mut shared = self.shared.lock().unwrap();
            if shared.offline.contains(&self.node) {
                return Err(SignalError::TransportClosed);
            }
            epoch = shared.next_epoch;
            shared.next_epoch += 1;
            shared.clients.insert(self.node, (epoch, tx));
        }
        Ok(Box::new(MemoryConnection {
            node: self.node,
            epoch,
            shared: Arc::clone(&self.shared),
            rx: TokioMutex::new(rx),
        }))
    }
}

struct MemoryConnection {
    node: NodeId,
    epoch: u64,
    shared: Arc<StdMutex<BusShared>>,
    rx: TokioMutex<mpsc::UnboundedReceiver<String>>,
}

#[async_trait]
impl SignalingConnection for MemoryConnection {
    async fn send(&self, text: String) -> SignalResult<()> {
        // Route the way a real rendezvous would: unicast when the frame
        // names a target, broadcast to everyone else otherwise.
        let target = match SignalMessage::decode(&text) {
            Some(msg) => msg.target(),
            None => return Ok(()), // rendezvous drops junk silently
        };

        let shared = self.shared.lock().unwrap();
        match target {
            Some(target) => {
                if let Some((_, tx)) = shared.clients.get(&target) {
                    let _ = tx.send(text);
                } else {
                    trace!("Dropping unicast to unknown node {}", target);
                }
            }
            None => {
                for (node, (_, tx)) in shared.clients.iter() {
                    if *node != self.node {
                        let _ = tx.send(text.clone());
                    }
                }
            }
        }
        Ok(())
    }

    async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        let mut shared = self.shared.lock().unwrap();
        // Only remove our own registration; a newer connection for the
        // same node must survive.
        if let Some((epoch, _)) = shared.clients.get(&self.node) {
            if *epoch == self.epoch {
                shared.clients.remove(&self.node);
            }
        }
    }
}

// ---------------------------------------------------------------------
// Link fabric
// ---------------------------------------------------------------------

struct FabricShared {
    acceptors: HashMap<NodeId, mpsc::UnboundedSender<Box<dyn PeerLink>>>,
    refuse: HashSet<NodeId>,
    opened: usize,
}

/// An in-process peer-link fabric
pub struct MemoryFabric {
    shared: Arc<StdMutex<FabricShared>>,
}

impl MemoryFabric {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(StdMutex::new(FabricShared {
                acceptors: HashMap::new(),
                refuse: HashSet::new(),
                opened: 0,
            })),
        })
    }

    /// Register a node; inbound links arrive on the returned receiver
    pub fn register(&self, node: NodeId) -> mpsc::UnboundedReceiver<Box<dyn PeerLink>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared.lock().unwrap().acceptors.insert(node, tx);
        rx
    }

    /// A connector that opens links on behalf of `local`
    pub fn connector(&self, local: NodeId) -> MemoryConnector {
        MemoryConnector {
            local,
            shared: Arc::clone(&self.shared),
        }
    }

    /// Make the node refuse (or accept again) inbound link opens
    pub fn set_refuse(&self, node: NodeId, refuse: bool) {
        let mut shared = self.shared.lock().unwrap();
        if refuse {
            shared.refuse.insert(node);
        } else {
            shared.refuse.remove(&node);
        }
    }

    /// Total links opened through this fabric
    pub fn links_opened(&self) -> usize {
        self.shared.lock().unwrap().opened
    }
}

/// Opens links through a [`MemoryFabric`]
pub struct MemoryConnector {
    local: NodeId,
    shared: Arc<StdMutex<FabricShared>>,
}

#[async_trait]
impl PeerConnector for MemoryConnector {
    async fn open(&self, peer: NodeId) -> SignalResult<Box<dyn PeerLink>> {
        let mut shared = self.shared.lock().unwrap();
        if shared.refuse.contains(&peer) {
            return Err(SignalError::LinkRefused(peer));
        }
        let acceptor = shared
            .acceptors
            .get(&peer)
            .ok_or(SignalError::LinkRefused(peer))?;

        let (near, far) = MemoryLink::pair(self.local, peer);
        acceptor
            .send(Box::new(far))
            .map_err(|_| SignalError::LinkRefused(peer))?;
        shared.opened += 1;
        Ok(Box::new(near))
    }
}

/// One end of an in-process peer link
pub struct MemoryLink {
    peer: NodeId,
    tx: StdMutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: TokioMutex<mpsc::UnboundedReceiver<Bytes>>,
    open: AtomicBool,
}

impl MemoryLink {
    /// A connected pair; the first end talks to `b`, the second to `a`
    pub fn pair(a: NodeId, b: NodeId) -> (Self, Self) {
        let (tx_ab, rx_ab) = mpsc::unbounded_channel();
        let (tx_ba, rx_ba) = mpsc::unbounded_channel();
        (
            Self {
                peer: b,
                tx: StdMutex::new(Some(tx_ab)),
                rx: TokioMutex::new(rx_ba),
                open: AtomicBool::new(true),
            },
            Self {
                peer: a,
                tx: StdMutex::new(Some(tx_ba)),
                rx: TokioMutex::new(rx_ab),
                open: AtomicBool::new(true),
            },
        )
    }
}

#[async_trait]
impl PeerLink for MemoryLink {
    fn peer(&self) -> NodeId {
        self.peer
    }

    async fn send(&self, frame: Bytes) -> SignalResult<()> {
        if !self.is_open() {
            return Err(SignalError::LinkClosed);
        }
        let tx = self.tx.lock().unwrap().clone();
        match tx {
            Some(tx) => tx.send(frame).map_err(|_| SignalError::LinkClosed),
            None => Err(SignalError::LinkClosed),
        }
    }

    async fn recv(&self) -> Option<Bytes> {
        self.rx.lock().await.recv().await
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        // Dropping the sender lets the far end drain and observe EOF.
        self.tx.lock().unwrap().take();
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_crypto::constants::NODE_ID_SIZE;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; NODE_ID_SIZE])
    }

    #[tokio::test]
    async fn test_link_pair_preserves_order() {
        let fabric = MemoryFabric::new();
        let mut acceptor = fabric.register(id(2));
        let connector = fabric.connector(id(1));

        let near = connector.open(id(2)).await.unwrap();
        let far = acceptor.recv().await.unwrap();
        assert_eq!(near.peer(), id(2));
        assert_eq!(far.peer(), id(1));

        for i in 0..10u8 {
            near.send(Bytes::from(vec![i])).await.unwrap();
        }
        for i in 0..10u8 {
            assert_eq!(far.recv().await.unwrap(), Bytes::from(vec![i]));
        }
    }

    #[tokio::test]
    async fn test_closed_link_rejects_send_and_eofs() {
        let fabric = MemoryFabric::new();
        let mut acceptor = fabric.register(id(2));
        let connector = fabric.connector(id(1));

        let near = connector.open(id(2)).await.unwrap();
        let far = acceptor.recv().await.unwrap();

        near.send(Bytes::from_static(b"last")).await.unwrap();
        near.close().await;

        assert!(matches!(
            near.send(Bytes::from_static(b"x")).await,
            Err(SignalError::LinkClosed)
        ));

        // In-flight frame still drains, then EOF.
        assert_eq!(far.recv().await.unwrap(), Bytes::from_static(b"last"));
        assert!(far.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_refused_and_unknown_peers() {
        let fabric = MemoryFabric::new();
        let _acceptor = fabric.register(id(2));
        let connector = fabric.connector(id(1));

        fabric.set_refuse(id(2), true);
        assert!(matches!(
            connector.open(id(2)).await,
            Err(SignalError::LinkRefused(_))
        ));

        assert!(matches!(
            connector.open(id(9)).await,
            Err(SignalError::LinkRefused(_))
        ));

        assert_eq!(fabric.links_opened(), 0);
    }
}
