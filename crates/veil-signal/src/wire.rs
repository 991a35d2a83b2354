//! Signaling Wire Protocol
//!
//! JSON frames exchanged over the rendezvous service and over peer
//! links. Field names are camelCase on the wire; role and status values
//! are SCREAMING_SNAKE strings. Frames with an unrecognized `type` (or
//! that fail to parse at all) are dropped by `decode`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::trace;

use veil_crypto::{Iv, NodeId, OnionEnvelope};

use crate::error::{SignalError, SignalResult};

/// Circuit identifier, unique per builder
pub type CircuitId = u32;

/// A peer's self-declared position in circuits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    Entry,
    Relay,
    Exit,
}

impl Role {
    /// Rotation cycle: Relay -> Entry -> Exit -> Relay
    pub fn next(self) -> Self {
        match self {
            Role::Relay => Role::Entry,
            Role::Entry => Role::Exit,
            Role::Exit => Role::Relay,
        }
    }
}

/// A peer's availability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PeerStatus {
    /// Registered but not yet admitted
    Waiting,
    /// Usable as a hop
    Available,
    /// Serving peak load
    Busy,
    /// Missed heartbeats
    Offline,
}

/// Geographic position, used only for diversity selection
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireLocation {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: f64,
}

/// Last observed capabilities of a peer
///
/// `latency_ms == u64::MAX` encodes an unreachable peer (measurement
/// timed out).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireCapabilities {
    pub max_bandwidth_bps: u64,
    pub latency_ms: u64,
    pub reliability: f64,
    pub uptime_ms: u64,
}

/// Hybrid-encrypted unicast blob carried over signaling
///
/// Used for circuit establishment records: `encrypted_data` is the
/// AES-GCM ciphertext, `encrypted_key` the session key wrapped under the
/// target's long-term public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSignalingFrame {
    pub target_node_id: NodeId,
    pub encrypted_data: String,
    pub encrypted_key: String,
    pub iv: Iv,
}

/// An onion frame as it travels over a peer link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitDataFrame {
    pub circuit_id: CircuitId,
    /// Base64 nested ciphertext
    pub data: String,
    /// Base64 wrapped session keys, outer first
    pub keys: Vec<String>,
    /// Per-layer IVs, aligned with `keys`
    pub ivs: Vec<Iv>,
}

impl CircuitDataFrame {
    /// Frame an onion envelope for the wire
    pub fn from_envelope(circuit_id: CircuitId, envelope: &OnionEnvelope) -> Self {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        Self {
            circuit_id,
            data: STANDARD.encode(&envelope.payload),
            keys: envelope.wrapped_keys.iter().map(|k| STANDARD.encode(k)).collect(),
            ivs: envelope.ivs.clone(),
        }
    }

    /// Recover the onion envelope
    pub fn to_envelope(&self) -> SignalResult<OnionEnvelope> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let payload = STANDARD
            .decode(&self.data)
            .map_err(|e| SignalError::Serialization(e.to_string()))?;
        let wrapped_keys = self
            .keys
            .iter()
            .map(|k| STANDARD.decode(k))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| SignalError::Serialization(e.to_string()))?;
        Ok(OnionEnvelope {
            payload,
            wrapped_keys,
            ivs: self.ivs.clone(),
        })
    }
}

/// Control messages on the signaling plane
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SignalMessage {
    #[serde(rename_all = "camelCase")]
    NodeAnnouncement {
        node_id: NodeId,
        role: Role,
        status: PeerStatus,
        /// SPKI public key, base64
        public_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<WireLocation>,
    },
    #[serde(rename_all = "camelCase")]
    NodeStatus {
        node_id: NodeId,
        status: PeerStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    #[serde(rename_all = "camelCase")]
    NodeValidation {
        node_id: NodeId,
        target_node_id: NodeId,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    NodeValidationResponse {
        node_id: NodeId,
        target_node_id: NodeId,
        timestamp: u64,
        status: PeerStatus,
        capabilities: WireCapabilities,
    },
    #[serde(rename_all = "camelCase")]
    NodeDiscovery {
        request_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        capabilities: Option<WireCapabilities>,
    },
    #[serde(rename_all = "camelCase")]
    NodePing {
        node_id: NodeId,
        target_node_id: NodeId,
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    NodePong {
        node_id: NodeId,
        target_node_id: NodeId,
        timestamp: u64,
    },
    CircuitSignaling(CircuitSignalingFrame),
    CircuitData(CircuitDataFrame),
}

impl SignalMessage {
    /// Unicast target, if this message has one
    pub fn target(&self) -> Option<NodeId> {
        match self {
            SignalMessage::NodeValidation { target_node_id, .. }
            | SignalMessage::NodeValidationResponse { target_node_id, .. }
            | SignalMessage::NodePing { target_node_id, .. }
            | SignalMessage::NodePong { target_node_id, .. } => Some(*target_node_id),
            SignalMessage::CircuitSignaling(frame) => Some(frame.target_node_id),
            _ => None,
        }
    }

    /// Serialize for the wire
    pub fn encode(&self) -> SignalResult<String> {
        serde_json::to_string(self).map_err(|e| SignalError::Serialization(e.to_string()))
    }

    /// Parse a frame, dropping anything unrecognized
    pub fn decode(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(msg) => Some(msg),
            Err(e) => {
                trace!("Ignoring unparseable signaling frame: {}", e);
                None
            }
        }
    }
}

/// Frames exchanged over a peer link
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkFrame {
    /// Sent by the link opener to bind the link to a circuit
    #[serde(rename_all = "camelCase")]
    LinkOpen { circuit_id: CircuitId, hop_index: usize },
    /// Establishment confirmation from the hop
    #[serde(rename_all = "camelCase")]
    LinkOpenAck { circuit_id: CircuitId },
    /// One onion frame moving toward the exit
    CircuitData(CircuitDataFrame),
}

impl LinkFrame {
    /// Serialize for a peer link
    pub fn encode(&self) -> SignalResult<Bytes> {
        serde_json::to_vec(self)
            .map(Bytes::from)
            .map_err(|e| SignalError::Serialization(e.to_string()))
    }

    /// Parse a link frame, dropping anything unrecognized
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        match serde_json::from_slice(bytes) {
            Ok(frame) => Some(frame),
            Err(e) => {
                trace!("Ignoring unparseable link frame: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veil_crypto::constants::NODE_ID_SIZE;

    fn id(b: u8) -> NodeId {
        NodeId::from_bytes([b; NODE_ID_SIZE])
    }

    #[test]
    fn test_announcement_wire_shape() {
        let msg = SignalMessage::NodeAnnouncement {
            node_id: id(1),
            role: Role::Entry,
            status: PeerStatus::Waiting,
            public_key: "c3BraQ==".into(),
            location: Some(WireLocation {
                latitude: 52.5,
                longitude: 13.4,
                accuracy: 100.0,
            }),
        };

        let text = msg.encode().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["type"], "node_announcement");
        assert_eq!(value["role"], "ENTRY");
        assert_eq!(value["status"], "WAITING");
        assert_eq!(value["nodeId"], id(1).to_full_hex());
        assert_eq!(value["location"]["latitude"], 52.5);

        let back = SignalMessage::decode(&text).unwrap();
        assert!(matches!(back, SignalMessage::NodeAnnouncement { .. }));
    }

    #[test]
    fn test_unknown_type_ignored() {
        assert!(SignalMessage::decode(r#"{"type":"node_gossip","x":1}"#).is_none());
        assert!(SignalMessage::decode("not json").is_none());
    }

    #[test]
    fn test_unicast_targets() {
        let ping = SignalMessage::NodePing {
            node_id: id(1),
            target_node_id: id(2),
            timestamp: 42,
        };
        assert_eq!(ping.target(), Some(id(2)));

        let status = SignalMessage::NodeStatus {
            node_id: id(1),
            status: PeerStatus::Available,
            role: None,
        };
        assert_eq!(status.target(), None);
    }

    #[test]
    fn test_circuit_data_roundtrip() {
        let envelope = OnionEnvelope {
            payload: vec![1, 2, 3, 4],
            wrapped_keys: vec![vec![9; 256], vec![8; 256]],
            ivs: vec![Iv::from_bytes([0; 12]), Iv::from_bytes([1; 12])],
        };

        let frame = CircuitDataFrame::from_envelope(7, &envelope);
        assert_eq!(frame.circuit_id, 7);
        assert_eq!(frame.keys.len(), 2);

        let back = frame.to_envelope().unwrap();
        assert_eq!(back.payload, envelope.payload);
        assert_eq!(back.wrapped_keys, envelope.wrapped_keys);
        assert_eq!(back.ivs, envelope.ivs);
    }

    #[test]
    fn test_role_rotation_cycle() {
        assert_eq!(Role::Relay.next(), Role::Entry);
        assert_eq!(Role::Entry.next(), Role::Exit);
        assert_eq!(Role::Exit.next(), Role::Relay);
    }

    #[test]
    fn test_link_frame_roundtrip() {
        let open = LinkFrame::LinkOpen {
            circuit_id: 3,
            hop_index: 1,
        };
        let bytes = open.encode().unwrap();
        let back = LinkFrame::decode(&bytes).unwrap();
        assert!(matches!(
            back,
            LinkFrame::LinkOpen { circuit_id: 3, hop_index: 1 }
        ));
    }
}
