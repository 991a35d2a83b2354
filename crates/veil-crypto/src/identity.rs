//! Node Identity
//!
//! Each node generates a fresh long-term RSA keypair at startup and
//! derives its `NodeId` from the SPKI encoding of the public key. Nothing
//! is persisted across restarts; a restarted node is a new identity.

use std::time::{Duration, Instant};

use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::constants::NODE_ID_SIZE;
use crate::error::CryptoResult;
use crate::keys::{KeyPair, PublicKey, SecretKey};

/// A 160-bit node identifier (truncated BLAKE3 hash of the SPKI public key)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    bytes: [u8; NODE_ID_SIZE],
}

impl NodeId {
    /// Derive from a public key
    pub fn from_public_key(key: &PublicKey) -> Self {
        let hash = blake3::hash(key.as_der());
        let mut bytes = [0u8; NODE_ID_SIZE];
        bytes.copy_from_slice(&hash.as_bytes()[..NODE_ID_SIZE]);
        Self { bytes }
    }

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; NODE_ID_SIZE]) -> Self {
        Self { bytes }
    }

    /// Get raw bytes
    pub fn as_bytes(&self) -> &[u8; NODE_ID_SIZE] {
        &self.bytes
    }

    /// Short hex form for display (8 bytes = 16 chars)
    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes[..8])
    }

    /// Full hex form for the wire (20 bytes = 40 chars)
    pub fn to_full_hex(&self) -> String {
        hex::encode(self.bytes)
    }

    /// Parse from the full hex form
    pub fn from_hex(hex_str: &str) -> Option<Self> {
        let bytes = hex::decode(hex_str).ok()?;
        if bytes.len() != NODE_ID_SIZE {
            return None;
        }
        let mut arr = [0u8; NODE_ID_SIZE];
        arr.copy_from_slice(&bytes);
        Some(Self { bytes: arr })
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "NodeId({})", self.to_hex())
    }
}

// On the wire a node ID is its full hex string.
impl Serialize for NodeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_full_hex())
    }
}

impl<'de> Deserialize<'de> for NodeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HexVisitor;

        impl Visitor<'_> for HexVisitor {
            type Value = NodeId;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a 40-character hex node id")
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<NodeId, E> {
                NodeId::from_hex(v)
                    .ok_or_else(|| E::custom(format!("invalid node id: {v}")))
            }
        }

        deserializer.deserialize_str(HexVisitor)
    }
}

/// A node's process-scoped identity
///
/// Threaded explicitly into the registry at construction so tests can
/// run several logical nodes in one process.
pub struct NodeIdentity {
    node_id: NodeId,
    keypair: KeyPair,
    start_time: Instant,
}

impl NodeIdentity {
    /// Generate a fresh identity (CPU-bound; callers may offload)
    pub fn generate() -> CryptoResult<Self> {
        let keypair = KeyPair::generate()?;
        let node_id = NodeId::from_public_key(&keypair.public);
        Ok(Self {
            node_id,
            keypair,
            start_time: Instant::now(),
        })
    }

    /// This node's identifier
    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// Long-term public key
    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    /// Long-term secret key
    pub fn secret_key(&self) -> &SecretKey {
        &self.keypair.secret
    }

    /// Time since this identity came up
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }
}

impl std::fmt::Debug for NodeIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeIdentity")
            .field("node_id", &self.node_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_node_id_is_stable_per_key() {
        let identity = NodeIdentity::generate().unwrap();
        let rederived = NodeId::from_public_key(identity.public_key());
        assert_eq!(identity.node_id(), rederived);
    }

    #[test]
    fn test_distinct_keys_distinct_ids() {
        let a = NodeIdentity::generate().unwrap();
        let b = NodeIdentity::generate().unwrap();
        assert_ne!(a.node_id(), b.node_id());
    }

    #[test]
    fn test_hex_roundtrip() {
        let id = NodeId::from_bytes([0xab; NODE_ID_SIZE]);
        let full = id.to_full_hex();
        assert_eq!(full.len(), NODE_ID_SIZE * 2);
        assert_eq!(NodeId::from_hex(&full), Some(id));
        assert_eq!(NodeId::from_hex("zz"), None);
    }

    #[test]
    fn test_serde_as_hex_string() {
        let id = NodeId::from_bytes([7u8; NODE_ID_SIZE]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", id.to_full_hex()));

        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
