//! Circuit Construction and Lifetime
//!
//! The builder owns every circuit this node originates. A circuit is an
//! ordered hop list with per-hop ephemeral RSA keypairs, plus one peer
//! link per hop; only `links[0]` carries data. Establishment is
//! sequential hop by hop: the establishment record travels to the hop
//! hybrid-encrypted under its announced long-term key, then the peer
//! link is opened and confirmed with a bounded handshake.
//!
//! Ephemeral secrets live exactly as long as the circuit; teardown drops
//! them and the underlying key material is zeroed.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as TokioMutex, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use veil_crypto::{encrypt_layer, generate_circuit_keys, NodeId, NodeIdentity, PublicKey, SecretKey};
use veil_signal::{
    CircuitDataFrame, CircuitId, CircuitSignalingFrame, LinkFrame, PeerConnector, PeerLink, Role,
    SignalError, SignalMessage, SignalingAdapter,
};

use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::registry::{PeerEntry, PeerRegistry};

/// Circuit state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Hop establishment in progress (or parked awaiting peers)
    Building,
    /// Ready for traffic
    Ready,
    /// Monitor observed unhealthy hops
    Degraded,
    /// Targeted hop replacement in progress
    Repairing,
    /// Full rebuild in progress
    Rebuilding,
    /// Build or repair failed
    Failed,
    /// Torn down
    Closed,
}

/// One hop of an established circuit
#[derive(Clone)]
pub struct Hop {
    pub peer: NodeId,
    pub role: Role,
    /// Public half of the ephemeral pair this hop peels with
    pub ephemeral_public: PublicKey,
}

impl std::fmt::Debug for Hop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hop")
            .field("peer", &self.peer)
            .field("role", &self.role)
            .finish()
    }
}

/// Circuit statistics snapshot
#[derive(Debug, Clone)]
pub struct CircuitStats {
    pub id: CircuitId,
    pub state: CircuitState,
    pub hop_count: usize,
    pub bytes_sent: u64,
    pub frames_sent: u64,
    pub age_secs: u64,
}

struct CircuitInner {
    id: CircuitId,
    state: CircuitState,
    hops: Vec<Hop>,
    /// Ephemeral secrets, aligned with `hops`; dropped (and zeroed) on
    /// close or failure
    ephemerals: Vec<SecretKey>,
    /// Peer links aligned with `hops`; only `links[0]` carries data
    links: Vec<Box<dyn PeerLink>>,
    created_at: Instant,
    bytes_sent: u64,
    frames_sent: u64,
}

impl CircuitInner {
    fn teardown(&mut self, state: CircuitState) {
        self.links.clear();
        self.ephemerals.clear();
        self.state = state;
    }
}

/// The establishment record sent to each hop, hybrid-encrypted under the
/// hop's announced long-term key
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct EstablishmentRecord {
    pub circuit_id: CircuitId,
    pub hop_index: usize,
    /// For return routing; the originator for hop 0
    pub previous_hop_id: NodeId,
    /// PKCS#8 DER, base64. The originator generates every per-hop pair;
    /// both ends discard it at teardown.
    pub ephemeral_private_key: String,
    /// Absent for the exit hop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_hop: Option<NextHop>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct NextHop {
    pub node_id: NodeId,
    /// SPKI, base64
    pub public_key: String,
}

/// Builds, repairs, and tears down circuits
pub struct CircuitBuilder {
    identity: Arc<NodeIdentity>,
    config: Config,
    registry: Arc<PeerRegistry>,
    adapter: Arc<SignalingAdapter>,
    connector: Arc<dyn PeerConnector>,
    circuits: RwLock<HashMap<CircuitId, Arc<TokioMutex<CircuitInner>>>>,
}

impl CircuitBuilder {
    pub fn new(
        identity: Arc<NodeIdentity>,
        config: Config,
        registry: Arc<PeerRegistry>,
        adapter: Arc<SignalingAdapter>,
        connector: Arc<dyn PeerConnector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            config,
            registry,
            adapter,
            connector,
            circuits: RwLock::new(HashMap::new()),
        })
    }

    async fn fresh_id(&self) -> CircuitId {
        let circuits = self.circuits.read().await;
        loop {
            let id: CircuitId = rand::random();
            if !circuits.contains_key(&id) {
                return id;
            }
        }
    }

    /// Build a circuit of `hops` hops (coerced up to the minimum),
    /// excluding the given peers from selection
    pub async fn build(&self, hops: usize, exclude: &HashSet<NodeId>) -> CoreResult<CircuitId> {
        let n = hops.max(self.config.min_hops);
        let id = self.fresh_id().await;

        debug!(circuit = id, hops = n, "Building circuit");
        let candidates = self.registry.suitable_relays(n, exclude).await;
        if candidates.len() < n {
            if self.config.wait_for_peers {
                // Bootstrap policy: park the circuit; the monitor
                // rebuilds it once the pool fills up.
                let inner = CircuitInner {
                    id,
                    state: CircuitState::Building,
                    hops: Vec::new(),
                    ephemerals: Vec::new(),
                    links: Vec::new(),
                    created_at: Instant::now(),
                    bytes_sent: 0,
                    frames_sent: 0,
                };
                self.circuits
                    .write()
                    .await
                    .insert(id, Arc::new(TokioMutex::new(inner)));
                debug!(circuit = id, "Peer pool too small, parked in Building");
                return Ok(id);
            }
            return Err(CoreError::InsufficientPeers {
                needed: n,
                available: candidates.len(),
            });
        }

        let (hops, ephemerals, links) = self
            .establish(id, &candidates, 0, self.identity.node_id())
            .await?;

        let inner = CircuitInner {
            id,
            state: CircuitState::Ready,
            hops,
            ephemerals,
            links,
            created_at: Instant::now(),
            bytes_sent: 0,
            frames_sent: 0,
        };
        self.circuits
            .write()
            .await
            .insert(id, Arc::new(TokioMutex::new(inner)));

        info!(circuit = id, hops = n, "Circuit ready");
        Ok(id)
    }

    /// Establish hops for slots `offset..offset + candidates.len()`
    ///
    /// Atomic: on any failure every link opened here is closed and the
    /// fresh ephemerals are dropped before the error returns.
    async fn establish(
        &self,
        id: CircuitId,
        candidates: &[PeerEntry],
        offset: usize,
        prev_for_first: NodeId,
    ) -> CoreResult<(Vec<Hop>, Vec<SecretKey>, Vec<Box<dyn PeerLink>>)> {
        let count = candidates.len();

        // Ephemeral keygen is CPU-bound; keep it off the reactor.
        let pairs = tokio::task::spawn_blocking(move || generate_circuit_keys(count))
            .await
            .map_err(|e| {
                CoreError::Crypto(veil_crypto::CryptoError::KeyGeneration(e.to_string()))
            })??;

        let mut hops = Vec::with_capacity(count);
        let mut ephemerals = Vec::with_capacity(count);
        let mut links: Vec<Box<dyn PeerLink>> = Vec::with_capacity(count);

        for (i, candidate) in candidates.iter().enumerate() {
            let hop_index = offset + i;
            let previous_hop_id = if i == 0 {
                prev_for_first
            } else {
                candidates[i - 1].node_id
            };
            let next_hop = candidates.get(i + 1).map(|next| NextHop {
                node_id: next.node_id,
                public_key: next.public_key.to_base64(),
            });

            let result = timeout(
                self.config.hop_establish_timeout,
                self.establish_hop(id, hop_index, previous_hop_id, next_hop, candidate, &pairs[i]),
            )
            .await;

            match result {
                Ok(Ok(link)) => {
                    hops.push(Hop {
                        peer: candidate.node_id,
                        role: candidate.role,
                        ephemeral_public: pairs[i].public.clone(),
                    });
                    links.push(link);
                }
                Ok(Err(e)) => {
                    warn!(circuit = id, hop = hop_index, "Hop establishment failed: {}", e);
                    for link in &links {
                        link.close().await;
                    }
                    return Err(CoreError::HopEstablishFailed {
                        hop: hop_index,
                        reason: e.to_string(),
                    });
                }
                Err(_) => {
                    warn!(circuit = id, hop = hop_index, "Hop establishment timed out");
                    for link in &links {
                        link.close().await;
                    }
                    return Err(CoreError::HopEstablishFailed {
                        hop: hop_index,
                        reason: "establishment deadline expired".into(),
                    });
                }
            }
        }

        for pair in pairs {
            ephemerals.push(pair.secret);
        }
        Ok((hops, ephemerals, links))
    }

    /// One hop: record over signaling, link open, bounded confirmation
    async fn establish_hop(
        &self,
        id: CircuitId,
        hop_index: usize,
        previous_hop_id: NodeId,
        next_hop: Option<NextHop>,
        candidate: &PeerEntry,
        pair: &veil_crypto::KeyPair,
    ) -> CoreResult<Box<dyn PeerLink>> {
        let record = EstablishmentRecord {
            circuit_id: id,
            hop_index,
            previous_hop_id,
            ephemeral_private_key: {
                use base64::{engine::general_purpose::STANDARD, Engine as _};
                STANDARD.encode(pair.secret.to_pkcs8_der()?.as_slice())
            },
            next_hop,
        };
        let plaintext = serde_json::to_vec(&record)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;

        let layer = encrypt_layer(&plaintext, &candidate.public_key)?;
        let frame = {
            use base64::{engine::general_purpose::STANDARD, Engine as _};
            CircuitSignalingFrame {
                target_node_id: candidate.node_id,
                encrypted_data: STANDARD.encode(&layer.ciphertext),
                encrypted_key: STANDARD.encode(&layer.wrapped_key),
                iv: layer.iv,
            }
        };
        self.adapter
            .send(&SignalMessage::CircuitSignaling(frame))
            .await?;

        let link = self.connector.open(candidate.node_id).await?;
        link.send(LinkFrame::LinkOpen { circuit_id: id, hop_index }.encode()?)
            .await?;

        // Confirmation: the hop acks once it has applied the record.
        loop {
            match link.recv().await {
                Some(bytes) => match LinkFrame::decode(&bytes) {
                    Some(LinkFrame::LinkOpenAck { circuit_id }) if circuit_id == id => {
                        return Ok(link);
                    }
                    _ => continue,
                },
                None => return Err(SignalError::LinkClosed.into()),
            }
        }
    }

    /// Send one payload through a ready circuit
    ///
    /// Sends on a circuit serialize: each frame is fully written to the
    /// first link before the next begins.
    pub async fn send(&self, id: CircuitId, data: &[u8]) -> CoreResult<()> {
        let circuit = self
            .circuits
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoreError::CircuitClosed(id))?;

        let mut inner = circuit.lock().await;
        match inner.state {
            CircuitState::Ready => {}
            CircuitState::Closed => return Err(CoreError::CircuitClosed(id)),
            _ => return Err(CoreError::CircuitNotReady(id)),
        }

        let pks: Vec<PublicKey> = inner.hops.iter().map(|h| h.ephemeral_public.clone()).collect();
        let envelope = veil_crypto::build_onion(data, &pks)?;
        let frame = LinkFrame::CircuitData(CircuitDataFrame::from_envelope(id, &envelope)).encode()?;

        match inner.links[0].send(frame).await {
            Ok(()) => {
                inner.bytes_sent += data.len() as u64;
                inner.frames_sent += 1;
                self.registry.record_transfer(true).await;
                Ok(())
            }
            Err(SignalError::LinkClosed) => {
                self.registry.record_transfer(false).await;
                Err(CoreError::CircuitClosed(id))
            }
            Err(e) => {
                self.registry.record_transfer(false).await;
                Err(e.into())
            }
        }
    }

    /// Tear the circuit down; idempotent
    pub async fn close(&self, id: CircuitId) -> CoreResult<()> {
        let circuit = self.circuits.write().await.remove(&id);
        if let Some(circuit) = circuit {
            let mut inner = circuit.lock().await;
            for link in &inner.links {
                link.close().await;
            }
            inner.teardown(CircuitState::Closed);
            info!(circuit = id, "Circuit closed");
        }
        Ok(())
    }

    /// Rebuild the whole hop set under the same circuit id
    ///
    /// The caller-visible identity is preserved; the old path keeps
    /// carrying traffic until the replacement is established.
    pub async fn rebuild(&self, id: CircuitId, exclude: &HashSet<NodeId>) -> CoreResult<()> {
        let circuit = self
            .circuits
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoreError::CircuitNotFound(id))?;

        let n = {
            let inner = circuit.lock().await;
            inner.hops.len().max(self.config.min_hops)
        };

        let candidates = self.registry.suitable_relays(n, exclude).await;
        if candidates.len() < n {
            return Err(CoreError::InsufficientPeers {
                needed: n,
                available: candidates.len(),
            });
        }

        let (hops, ephemerals, links) = self
            .establish(id, &candidates, 0, self.identity.node_id())
            .await?;

        let mut inner = circuit.lock().await;
        for link in &inner.links {
            link.close().await;
        }
        inner.hops = hops;
        inner.ephemerals = ephemerals;
        inner.links = links;
        inner.state = CircuitState::Ready;
        info!(circuit = id, "Circuit rebuilt");
        Ok(())
    }

    /// Replace one hop in place
    ///
    /// Implemented as a suffix rebuild starting one slot before the
    /// replaced hop: the predecessor's forwarding record names the new
    /// peer, so it must re-establish too. Fresh ephemerals are issued
    /// for every re-established slot.
    pub async fn replace_hop(
        &self,
        id: CircuitId,
        old_peer: NodeId,
        replacement: PeerEntry,
    ) -> CoreResult<()> {
        let circuit = self
            .circuits
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoreError::CircuitNotFound(id))?;

        let (slot, suffix_peers) = {
            let inner = circuit.lock().await;
            let slot = inner
                .hops
                .iter()
                .position(|h| h.peer == old_peer)
                .ok_or(CoreError::PeerNotFound(old_peer))?;
            let start = slot.saturating_sub(1);
            (start, inner.hops[start..].to_vec())
        };

        // Candidate list for the suffix: existing peers, with the
        // failed slot swapped for the replacement.
        let mut candidates = Vec::with_capacity(suffix_peers.len());
        for hop in &suffix_peers {
            if hop.peer == old_peer {
                candidates.push(replacement.clone());
            } else {
                let entry = self
                    .registry
                    .peer(hop.peer)
                    .await
                    .ok_or(CoreError::PeerNotFound(hop.peer))?;
                candidates.push(entry);
            }
        }

        let prev_for_first = {
            let inner = circuit.lock().await;
            if slot == 0 {
                self.identity.node_id()
            } else {
                inner.hops[slot - 1].peer
            }
        };

        let (new_hops, new_ephemerals, new_links) =
            self.establish(id, &candidates, slot, prev_for_first).await?;

        let mut inner = circuit.lock().await;
        for link in &inner.links[slot..] {
            link.close().await;
        }
        inner.hops.truncate(slot);
        inner.ephemerals.truncate(slot);
        inner.links.truncate(slot);
        inner.hops.extend(new_hops);
        inner.ephemerals.extend(new_ephemerals);
        inner.links.extend(new_links);
        inner.state = CircuitState::Ready;

        info!(circuit = id, old = %old_peer, new = %replacement.node_id, "Hop replaced");
        Ok(())
    }

    /// Current state, if the circuit exists
    pub async fn state(&self, id: CircuitId) -> Option<CircuitState> {
        let circuit = self.circuits.read().await.get(&id).cloned()?;
        let inner = circuit.lock().await;
        Some(inner.state)
    }

    /// Value copy of the hop list
    pub async fn hops(&self, id: CircuitId) -> Option<Vec<Hop>> {
        let circuit = self.circuits.read().await.get(&id).cloned()?;
        let inner = circuit.lock().await;
        Some(inner.hops.clone())
    }

    /// Statistics snapshot
    pub async fn stats(&self, id: CircuitId) -> Option<CircuitStats> {
        let circuit = self.circuits.read().await.get(&id).cloned()?;
        let inner = circuit.lock().await;
        Some(CircuitStats {
            id: inner.id,
            state: inner.state,
            hop_count: inner.hops.len(),
            bytes_sent: inner.bytes_sent,
            frames_sent: inner.frames_sent,
            age_secs: inner.created_at.elapsed().as_secs(),
        })
    }

    /// All live circuit ids
    pub async fn circuit_ids(&self) -> Vec<CircuitId> {
        self.circuits.read().await.keys().copied().collect()
    }

    pub(crate) async fn set_state(&self, id: CircuitId, state: CircuitState) {
        if let Some(circuit) = self.circuits.read().await.get(&id).cloned() {
            let mut inner = circuit.lock().await;
            debug!(circuit = id, from = ?inner.state, to = ?state, "Circuit state");
            inner.state = state;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_establishment_record_wire_shape() {
        use veil_crypto::constants::NODE_ID_SIZE;

        let record = EstablishmentRecord {
            circuit_id: 42,
            hop_index: 2,
            previous_hop_id: NodeId::from_bytes([1; NODE_ID_SIZE]),
            ephemeral_private_key: "cGtjczg=".into(),
            next_hop: None,
        };

        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["circuitId"], 42);
        assert_eq!(value["hopIndex"], 2);
        // The exit hop has no next hop on the wire at all
        assert!(value.get("nextHop").is_none());

        let with_next = EstablishmentRecord {
            next_hop: Some(NextHop {
                node_id: NodeId::from_bytes([2; NODE_ID_SIZE]),
                public_key: "c3BraQ==".into(),
            }),
            ..record
        };
        let value = serde_json::to_value(&with_next).unwrap();
        assert_eq!(value["nextHop"]["publicKey"], "c3BraQ==");
    }
}
