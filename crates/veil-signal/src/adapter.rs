//! Signaling Adapter
//!
//! Bidirectional JSON message plane to the rendezvous service. The
//! transport itself is abstract; the adapter owns the connection
//! lifecycle, fans inbound frames out to subscribers, and reconnects
//! with exponential backoff when the transport drops. While
//! disconnected, outbound sends are rejected with `NotConnected`; there
//! is no local queueing, so upper layers must cope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use crate::error::{SignalError, SignalResult};
use crate::wire::SignalMessage;

/// An established signaling connection
#[async_trait]
pub trait SignalingConnection: Send + Sync {
    /// Write one text frame
    async fn send(&self, text: String) -> SignalResult<()>;

    /// Read the next inbound frame; `None` when the connection closed
    async fn recv(&self) -> Option<String>;

    /// Close the connection
    async fn close(&self);
}

/// Factory for signaling connections (one handshake per call)
#[async_trait]
pub trait SignalingTransport: Send + Sync {
    async fn connect(&self) -> SignalResult<Box<dyn SignalingConnection>>;
}

/// Reconnection policy
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// First retry delay; doubles per attempt
    pub base_backoff: Duration,
    /// Attempts before giving up
    pub max_attempts: u32,
    /// Handshake deadline per attempt
    pub handshake_timeout: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_backoff: Duration::from_secs(1),
            max_attempts: 5,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Connection lifecycle events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterEvent {
    Connected,
    Disconnected,
    /// Reconnect attempts exhausted; fatal for this run
    Unavailable,
}

/// The signaling adapter
pub struct SignalingAdapter {
    transport: Arc<dyn SignalingTransport>,
    conn: RwLock<Option<Arc<dyn SignalingConnection>>>,
    connected: AtomicBool,
    /// Set once reconnect attempts are exhausted; fatal for this run
    given_up: AtomicBool,
    frames: broadcast::Sender<SignalMessage>,
    events: broadcast::Sender<AdapterEvent>,
    reconnect: ReconnectConfig,
}

impl SignalingAdapter {
    /// Connect and start the reader task
    pub async fn connect(
        transport: Arc<dyn SignalingTransport>,
        reconnect: ReconnectConfig,
    ) -> SignalResult<Arc<Self>> {
        let conn: Arc<dyn SignalingConnection> =
            match timeout(reconnect.handshake_timeout, transport.connect()).await {
                Ok(Ok(conn)) => Arc::from(conn),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(SignalError::Timeout { scope: "signaling handshake" }),
            };

        let (frames, _) = broadcast::channel(256);
        let (events, _) = broadcast::channel(16);

        let adapter = Arc::new(Self {
            transport,
            conn: RwLock::new(Some(conn.clone())),
            connected: AtomicBool::new(true),
            given_up: AtomicBool::new(false),
            frames,
            events,
            reconnect,
        });

        adapter.spawn_reader(conn);
        debug!("Signaling adapter connected");
        Ok(adapter)
    }

    /// Whether the signaling plane is currently up
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Subscribe to inbound frames
    pub fn subscribe(&self) -> broadcast::Receiver<SignalMessage> {
        self.frames.subscribe()
    }

    /// Subscribe to connection lifecycle events
    pub fn events(&self) -> broadcast::Receiver<AdapterEvent> {
        self.events.subscribe()
    }

    /// Send one frame
    pub async fn send(&self, msg: &SignalMessage) -> SignalResult<()> {
        if self.given_up.load(Ordering::SeqCst) {
            return Err(SignalError::SignalingUnavailable {
                attempts: self.reconnect.max_attempts,
            });
        }
        if !self.is_connected() {
            return Err(SignalError::NotConnected);
        }
        let text = msg.encode()?;
        let conn = {
            let guard = self.conn.read().await;
            guard.clone().ok_or(SignalError::NotConnected)?
        };
        conn.send(text).await
    }

    /// Close the adapter; no reconnection is attempted afterwards
    pub async fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
        if let Some(conn) = self.conn.write().await.take() {
            conn.close().await;
        }
    }

    fn spawn_reader(self: &Arc<Self>, conn: Arc<dyn SignalingConnection>) {
        let adapter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match conn.recv().await {
                    Some(text) => {
                        if let Some(msg) = SignalMessage::decode(&text) {
                            let _ = adapter.frames.send(msg);
                        }
                    }
                    None => break,
                }
            }
            // Connection gone; if we were still supposed to be up,
            // enter the reconnect loop.
            if adapter.connected.swap(false, Ordering::SeqCst) {
                let _ = adapter.events.send(AdapterEvent::Disconnected);
                adapter.reconnect_loop().await;
            }
        });
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let mut backoff = self.reconnect.base_backoff;

        for attempt in 1..=self.reconnect.max_attempts {
            sleep(backoff).await;
            backoff *= 2;

            debug!(attempt, "Attempting signaling reconnect");
            match timeout(self.reconnect.handshake_timeout, self.transport.connect()).await {
                Ok(Ok(conn)) => {
                    let conn: Arc<dyn SignalingConnection> = Arc::from(conn);
                    *self.conn.write().await = Some(conn.clone());
                    self.connected.store(true, Ordering::SeqCst);
                    let _ = self.events.send(AdapterEvent::Connected);
                    info!(attempt, "Signaling reconnected");
                    self.spawn_reader(conn);
                    return;
                }
                Ok(Err(e)) => warn!(attempt, "Reconnect failed: {}", e),
                Err(_) => warn!(attempt, "Reconnect handshake timed out"),
            }
        }

        warn!(
            attempts = self.reconnect.max_attempts,
            "Signaling unavailable, giving up"
        );
        self.given_up.store(true, Ordering::SeqCst);
        let _ = self.events.send(AdapterEvent::Unavailable);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRendezvous;
    use crate::wire::{PeerStatus, SignalMessage};
    use veil_crypto::constants::NODE_ID_SIZE;
    use veil_crypto::NodeId;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; NODE_ID_SIZE])
    }

    fn fast_reconnect() -> ReconnectConfig {
        ReconnectConfig {
            base_backoff: Duration::from_millis(10),
            max_attempts: 5,
            handshake_timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_broadcast_between_clients() {
        let bus = MemoryRendezvous::new();
        let a = SignalingAdapter::connect(Arc::new(bus.endpoint(id(1))), fast_reconnect())
            .await
            .unwrap();
        let b = SignalingAdapter::connect(Arc::new(bus.endpoint(id(2))), fast_reconnect())
            .await
            .unwrap();

        let mut inbox = b.subscribe();

        a.send(&SignalMessage::NodeStatus {
            node_id: id(1),
            status: PeerStatus::Available,
            role: None,
        })
        .await
        .unwrap();

        let msg = timeout(Duration::from_secs(1), inbox.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(msg, SignalMessage::NodeStatus { .. }));
    }

    #[tokio::test]
    async fn test_send_while_disconnected_rejected() {
        let bus = MemoryRendezvous::new();
        let a = SignalingAdapter::connect(Arc::new(bus.endpoint(id(1))), fast_reconnect())
            .await
            .unwrap();

        bus.set_offline(id(1), true);
        bus.disconnect(id(1));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let result = a
            .send(&SignalMessage::NodeStatus {
                node_id: id(1),
                status: PeerStatus::Available,
                role: None,
            })
            .await;
        assert!(matches!(result, Err(SignalError::NotConnected)));
    }

    #[tokio::test]
    async fn test_reconnects_after_drop() {
        let bus = MemoryRendezvous::new();
        let a = SignalingAdapter::connect(Arc::new(bus.endpoint(id(1))), fast_reconnect())
            .await
            .unwrap();
        let mut events = a.events();

        bus.disconnect(id(1));

        assert_eq!(
            timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap(),
            AdapterEvent::Disconnected
        );
        assert_eq!(
            timeout(Duration::from_secs(1), events.recv()).await.unwrap().unwrap(),
            AdapterEvent::Connected
        );
        assert!(a.is_connected());
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let bus = MemoryRendezvous::new();
        let a = SignalingAdapter::connect(Arc::new(bus.endpoint(id(1))), fast_reconnect())
            .await
            .unwrap();
        let mut events = a.events();

        bus.set_offline(id(1), true);
        bus.disconnect(id(1));

        assert_eq!(
            timeout(Duration::from_secs(2), events.recv()).await.unwrap().unwrap(),
            AdapterEvent::Disconnected
        );
        assert_eq!(
            timeout(Duration::from_secs(5), events.recv()).await.unwrap().unwrap(),
            AdapterEvent::Unavailable
        );
        assert!(!a.is_connected());

        // Once exhausted, sends surface the fatal error
        let result = a
            .send(&SignalMessage::NodeStatus {
                node_id: id(1),
                status: PeerStatus::Available,
                role: None,
            })
            .await;
        assert!(matches!(
            result,
            Err(SignalError::SignalingUnavailable { attempts: 5 })
        ));
    }
}
