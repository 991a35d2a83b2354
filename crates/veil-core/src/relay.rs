//! Relay Operations
//!
//! The hop side of a circuit: accept establishment records, confirm
//! link opens, peel one onion layer per data frame, and either forward
//! toward the next hop or deliver exit plaintext locally.
//!
//! A hop knows only its neighbors. The establishment record names the
//! previous hop (for return routing) and, unless this hop is the exit,
//! the next hop; the rest of the path never reaches it. Crypto failures
//! drop the frame without signaling anything back, so an active
//! attacker learns nothing from this node.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, Mutex as TokioMutex};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use veil_crypto::{decrypt_layer, peel_layer, NodeId, NodeIdentity, Peeled, SecretKey};
use veil_signal::{
    CircuitDataFrame, CircuitId, CircuitSignalingFrame, LinkFrame, PeerConnector, PeerLink,
};

use crate::circuit::EstablishmentRecord;
use crate::error::{CoreError, CoreResult};

/// Plaintext that emerged at this node as the exit hop
pub type ExitDelivery = (CircuitId, Bytes);

/// Per-circuit relay state
struct RelayEntry {
    /// Bumped on every (re-)establishment, so a dying link tears down
    /// only the binding it actually owned
    generation: u64,
    hop_index: usize,
    /// For return routing
    #[allow(dead_code)]
    prev_hop: NodeId,
    /// Ephemeral secret this hop peels with; zeroed when the entry drops
    ephemeral: SecretKey,
    /// Next hop, absent for the exit
    next_hop: Option<NodeId>,
    /// Forward link toward the next hop, opened on first use
    forward: Option<Box<dyn PeerLink>>,
}

/// Handles the relay role for one node
pub struct RelayHandler {
    identity: Arc<NodeIdentity>,
    connector: Arc<dyn PeerConnector>,
    entries: TokioMutex<HashMap<CircuitId, RelayEntry>>,
    delivery: mpsc::UnboundedSender<ExitDelivery>,
    /// How long a link open may wait for its establishment record
    record_wait: Duration,
    generation: std::sync::atomic::AtomicU64,
}

impl RelayHandler {
    /// Create a handler and the exit-plaintext receiver
    pub fn new(
        identity: Arc<NodeIdentity>,
        connector: Arc<dyn PeerConnector>,
        record_wait: Duration,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<ExitDelivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                identity,
                connector,
                entries: TokioMutex::new(HashMap::new()),
                delivery: tx,
                record_wait,
                generation: std::sync::atomic::AtomicU64::new(0),
            }),
            rx,
        )
    }

    /// Apply an establishment record addressed to this node
    pub async fn handle_signaling(&self, frame: CircuitSignalingFrame) {
        if frame.target_node_id != self.identity.node_id() {
            return;
        }

        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let (ciphertext, wrapped_key) = match (
            STANDARD.decode(&frame.encrypted_data),
            STANDARD.decode(&frame.encrypted_key),
        ) {
            (Ok(ct), Ok(wk)) => (ct, wk),
            _ => {
                trace!("Dropping establishment frame with bad encoding");
                return;
            }
        };

        let plaintext = match decrypt_layer(
            &ciphertext,
            &wrapped_key,
            &frame.iv,
            self.identity.secret_key(),
        ) {
            Ok(plain) => plain,
            Err(e) => {
                // Never leak the cause back to the peer.
                debug!("Dropping undecryptable establishment frame: {}", e);
                return;
            }
        };

        let record: EstablishmentRecord = match serde_json::from_slice(&plaintext) {
            Ok(record) => record,
            Err(e) => {
                debug!("Dropping malformed establishment record: {}", e);
                return;
            }
        };

        let ephemeral = {
            let der = match STANDARD.decode(&record.ephemeral_private_key) {
                Ok(der) => der,
                Err(e) => {
                    debug!("Dropping record with bad ephemeral encoding: {}", e);
                    return;
                }
            };
            match SecretKey::from_pkcs8_der(&der) {
                Ok(key) => key,
                Err(e) => {
                    debug!("Dropping record with bad ephemeral key: {}", e);
                    return;
                }
            }
        };

        debug!(
            circuit = record.circuit_id,
            hop = record.hop_index,
            exit = record.next_hop.is_none(),
            "Relay entry established"
        );

        // Re-establishment (repair splice) overwrites the old entry.
        let generation = self
            .generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.entries.lock().await.insert(
            record.circuit_id,
            RelayEntry {
                generation,
                hop_index: record.hop_index,
                prev_hop: record.previous_hop_id,
                ephemeral,
                next_hop: record.next_hop.map(|n| n.node_id),
                forward: None,
            },
        );
    }

    /// Serve one inbound peer link until it closes
    ///
    /// Circuits whose `link_open` arrived on this link are torn down
    /// with it.
    pub fn handle_link(self: &Arc<Self>, link: Box<dyn PeerLink>) {
        let handler = Arc::clone(self);
        tokio::spawn(async move {
            let link: Arc<dyn PeerLink> = Arc::from(link);
            let mut bound: Vec<(CircuitId, u64)> = Vec::new();

            while let Some(bytes) = link.recv().await {
                match LinkFrame::decode(&bytes) {
                    Some(LinkFrame::LinkOpen { circuit_id, hop_index }) => {
                        // The record travels over signaling and may still
                        // be in flight; wait briefly for it.
                        if let Some(generation) = handler.await_entry(circuit_id).await {
                            bound.push((circuit_id, generation));
                            let ack = LinkFrame::LinkOpenAck { circuit_id };
                            if let Ok(frame) = ack.encode() {
                                let _ = link.send(frame).await;
                            }
                        } else {
                            debug!(
                                circuit = circuit_id,
                                hop = hop_index,
                                "Link open without establishment record"
                            );
                        }
                    }
                    Some(LinkFrame::CircuitData(frame)) => {
                        handler.process_data(frame).await;
                    }
                    Some(LinkFrame::LinkOpenAck { .. }) | None => {}
                }
            }

            // Tear down only what this link still owns: a repair splice
            // may have re-established the circuit over a newer link.
            for (circuit_id, generation) in bound {
                handler.remove_if_generation(circuit_id, generation).await;
            }
        });
    }

    async fn await_entry(&self, circuit_id: CircuitId) -> Option<u64> {
        let deadline = tokio::time::Instant::now() + self.record_wait;
        loop {
            if let Some(entry) = self.entries.lock().await.get(&circuit_id) {
                return Some(entry.generation);
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            sleep(Duration::from_millis(20)).await;
        }
    }

    async fn remove_if_generation(&self, circuit_id: CircuitId, generation: u64) {
        let mut entries = self.entries.lock().await;
        if entries
            .get(&circuit_id)
            .map_or(false, |e| e.generation == generation)
        {
            if let Some(entry) = entries.remove(&circuit_id) {
                if let Some(link) = entry.forward {
                    link.close().await;
                }
                debug!(circuit = circuit_id, "Relay entry removed with its link");
            }
        }
    }

    /// Peel one layer and forward or deliver
    async fn process_data(&self, frame: CircuitDataFrame) {
        if let Err(e) = self.try_process_data(frame).await {
            // Frame is dropped; nothing goes back to the sender.
            debug!("Dropping circuit data frame: {}", e);
        }
    }

    async fn try_process_data(&self, frame: CircuitDataFrame) -> CoreResult<()> {
        let circuit_id = frame.circuit_id;
        let envelope = frame.to_envelope()?;

        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(&circuit_id)
            .ok_or(CoreError::CircuitNotFound(circuit_id))?;

        match peel_layer(envelope, &entry.ephemeral)? {
            Peeled::Exit(plaintext) => {
                trace!(circuit = circuit_id, bytes = plaintext.len(), "Exit delivery");
                let _ = self.delivery.send((circuit_id, Bytes::from(plaintext)));
            }
            Peeled::Inner(inner) => {
                let next = entry.next_hop.ok_or_else(|| CoreError::HopEstablishFailed {
                    hop: entry.hop_index,
                    reason: "relay layer but no next hop".into(),
                })?;

                if entry.forward.as_ref().map_or(true, |l| !l.is_open()) {
                    entry.forward = Some(self.connector.open(next).await?);
                }

                let Some(link) = entry.forward.as_ref() else {
                    return Err(CoreError::CircuitNotFound(circuit_id));
                };
                let frame = LinkFrame::CircuitData(CircuitDataFrame::from_envelope(
                    circuit_id, &inner,
                ))
                .encode()?;
                link.send(frame).await?;
                trace!(circuit = circuit_id, next = %next, "Frame forwarded");
            }
        }
        Ok(())
    }

    /// Drop a circuit's relay state
    pub async fn remove_circuit(&self, circuit_id: CircuitId) {
        if let Some(entry) = self.entries.lock().await.remove(&circuit_id) {
            if let Some(link) = entry.forward {
                link.close().await;
            }
            debug!(circuit = circuit_id, "Relay entry removed");
        }
    }

    /// Number of circuits currently relayed
    pub async fn circuit_count(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Close every forward link and clear all state
    pub async fn shutdown(&self) {
        let mut entries = self.entries.lock().await;
        for (_, entry) in entries.drain() {
            if let Some(link) = entry.forward {
                link.close().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use veil_crypto::{build_onion, encrypt_layer, KeyPair, NodeIdentity};
    use veil_signal::{MemoryFabric, SignalMessage};

    fn record_frame(
        target: &NodeIdentity,
        circuit_id: CircuitId,
        hop_index: usize,
        prev: NodeId,
        ephemeral: &KeyPair,
        next_hop: Option<crate::circuit::NextHop>,
    ) -> CircuitSignalingFrame {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let record = EstablishmentRecord {
            circuit_id,
            hop_index,
            previous_hop_id: prev,
            ephemeral_private_key: STANDARD
                .encode(ephemeral.secret.to_pkcs8_der().unwrap().as_slice()),
            next_hop,
        };
        let plain = serde_json::to_vec(&record).unwrap();
        let layer = encrypt_layer(&plain, target.public_key()).unwrap();
        CircuitSignalingFrame {
            target_node_id: target.node_id(),
            encrypted_data: STANDARD.encode(&layer.ciphertext),
            encrypted_key: STANDARD.encode(&layer.wrapped_key),
            iv: layer.iv,
        }
    }

    #[tokio::test]
    async fn test_exit_hop_delivers_plaintext() {
        let identity = Arc::new(NodeIdentity::generate().unwrap());
        let fabric = MemoryFabric::new();
        let _acceptor = fabric.register(identity.node_id());
        let connector = Arc::new(fabric.connector(identity.node_id()));

        let (handler, mut deliveries) =
            RelayHandler::new(Arc::clone(&identity), connector, Duration::from_secs(1));

        let ephemeral = KeyPair::generate().unwrap();
        handler
            .handle_signaling(record_frame(
                &identity,
                7,
                0,
                identity.node_id(),
                &ephemeral,
                None,
            ))
            .await;
        assert_eq!(handler.circuit_count().await, 1);

        // Feed a link carrying open + one single-layer onion
        let (near, far) = veil_signal::MemoryLink::pair(identity.node_id(), identity.node_id());
        handler.handle_link(Box::new(far));

        near.send(LinkFrame::LinkOpen { circuit_id: 7, hop_index: 0 }.encode().unwrap())
            .await
            .unwrap();
        let ack = near.recv().await.unwrap();
        assert!(matches!(
            LinkFrame::decode(&ack),
            Some(LinkFrame::LinkOpenAck { circuit_id: 7 })
        ));

        let envelope = build_onion(b"hello exit", &[ephemeral.public.clone()]).unwrap();
        near.send(
            LinkFrame::CircuitData(CircuitDataFrame::from_envelope(7, &envelope))
                .encode()
                .unwrap(),
        )
        .await
        .unwrap();

        let (circuit_id, plain) = deliveries.recv().await.unwrap();
        assert_eq!(circuit_id, 7);
        assert_eq!(plain.as_ref(), b"hello exit");
    }

    #[tokio::test]
    async fn test_tampered_frame_dropped_silently() {
        let identity = Arc::new(NodeIdentity::generate().unwrap());
        let fabric = MemoryFabric::new();
        let connector = Arc::new(fabric.connector(identity.node_id()));

        let (handler, mut deliveries) =
            RelayHandler::new(Arc::clone(&identity), connector, Duration::from_secs(1));

        let ephemeral = KeyPair::generate().unwrap();
        handler
            .handle_signaling(record_frame(
                &identity,
                9,
                0,
                identity.node_id(),
                &ephemeral,
                None,
            ))
            .await;

        let mut envelope = build_onion(b"payload", &[ephemeral.public.clone()]).unwrap();
        envelope.wrapped_keys[0][5] ^= 0x10;

        handler
            .process_data(CircuitDataFrame::from_envelope(9, &envelope))
            .await;

        // Nothing delivered, nothing sent back
        assert!(deliveries.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_record_not_for_us_ignored() {
        let identity = Arc::new(NodeIdentity::generate().unwrap());
        let other = NodeIdentity::generate().unwrap();
        let fabric = MemoryFabric::new();
        let connector = Arc::new(fabric.connector(identity.node_id()));

        let (handler, _deliveries) =
            RelayHandler::new(Arc::clone(&identity), connector, Duration::from_secs(1));

        let ephemeral = KeyPair::generate().unwrap();
        handler
            .handle_signaling(record_frame(
                &other,
                3,
                0,
                other.node_id(),
                &ephemeral,
                None,
            ))
            .await;

        assert_eq!(handler.circuit_count().await, 0);
    }

    #[test]
    fn test_circuit_data_decodes_from_signal_plane() {
        let text = r#"{"type":"circuit_data","circuitId":1,"data":"","keys":[],"ivs":[]}"#;
        assert!(matches!(
            SignalMessage::decode(text),
            Some(SignalMessage::CircuitData(_))
        ));
    }
}
