//! Veil Cryptographic Primitives
//!
//! This crate provides all cryptographic operations for the veil network:
//! - Hybrid encryption (RSA-OAEP-2048 key wrap + AES-256-GCM)
//! - Onion envelopes for multi-hop routing
//! - Node identity derivation
//!
//! The envelope format is algorithm-agnostic: swapping the wrap or AEAD
//! primitive changes key sizes only, not the layer structure.

pub mod error;
pub mod identity;
pub mod keys;
pub mod onion;
pub mod symmetric;

pub use error::{CryptoError, CryptoResult};
pub use identity::{NodeId, NodeIdentity};
pub use keys::{generate_circuit_keys, KeyPair, PublicKey, SecretKey};
pub use onion::{build_onion, decrypt_layer, encrypt_layer, peel_layer, LayerCiphertext, OnionEnvelope, Peeled};
pub use symmetric::{decrypt, encrypt, Iv, SymmetricKey};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::error::*;
    pub use crate::identity::*;
    pub use crate::keys::*;
    pub use crate::onion::*;
    pub use crate::symmetric::*;
}

/// Protocol constants
pub mod constants {
    /// RSA modulus size in bits for long-term and ephemeral keys
    pub const RSA_KEY_BITS: usize = 2048;

    /// AES-256-GCM key size
    pub const SYMMETRIC_KEY_SIZE: usize = 32;

    /// GCM IV size
    pub const IV_SIZE: usize = 12;

    /// GCM authentication tag size
    pub const AUTH_TAG_SIZE: usize = 16;

    /// Wrapped session key size (RSA modulus bytes)
    pub const WRAPPED_KEY_SIZE: usize = RSA_KEY_BITS / 8;

    /// Node ID size (truncated BLAKE3 hash)
    pub const NODE_ID_SIZE: usize = 20;

    /// Maximum onion layers (hops)
    pub const MAX_ONION_LAYERS: usize = 7;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_crypto_flow() {
        // Three relays and an exit, each with a fresh circuit keypair
        let hops = generate_circuit_keys(4).expect("keygen");
        let path: Vec<_> = hops.iter().map(|kp| kp.public.clone()).collect();

        let message = b"Hello, anonymous internet!";
        let mut envelope = build_onion(message, &path).expect("failed to build onion");

        for (i, hop) in hops.iter().enumerate() {
            match peel_layer(envelope.clone(), &hop.secret).expect("peel failed") {
                Peeled::Inner(inner) => {
                    assert!(i < hops.len() - 1);
                    envelope = inner;
                }
                Peeled::Exit(plain) => {
                    assert_eq!(i, hops.len() - 1);
                    assert_eq!(plain, message);
                }
            }
        }
    }
}
