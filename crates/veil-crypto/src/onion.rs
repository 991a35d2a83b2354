//! Onion Envelopes
//!
//! Layered hybrid encryption for circuit traffic. Each layer is an
//! AES-256-GCM encryption under a fresh session key, with the session
//! key wrapped under that hop's RSA public key. Wrapped keys and IVs
//! ride alongside the nested ciphertext, ordered outermost first, so a
//! hop removes exactly one layer and can never peek further in.

use serde::{Deserialize, Serialize};

use crate::constants::MAX_ONION_LAYERS;
use crate::error::{CryptoError, CryptoResult};
use crate::keys::{PublicKey, SecretKey};
use crate::symmetric::{decrypt, encrypt, Iv, SymmetricKey};

/// A single hybrid-encrypted layer
pub struct LayerCiphertext {
    /// AES-GCM ciphertext (tag appended)
    pub ciphertext: Vec<u8>,
    /// Session key wrapped under the recipient's public key
    pub wrapped_key: Vec<u8>,
    /// GCM IV, carried verbatim so the receiver can reconstruct
    pub iv: Iv,
}

/// A multi-layer onion envelope
///
/// `wrapped_keys[0]` and `ivs[0]` belong to the outermost layer (the
/// entry hop); removing that layer yields the envelope intended for the
/// next hop.
#[derive(Clone, Serialize, Deserialize)]
pub struct OnionEnvelope {
    /// Nested ciphertext
    pub payload: Vec<u8>,
    /// Wrapped session keys, outer first
    pub wrapped_keys: Vec<Vec<u8>>,
    /// Per-layer IVs, aligned with `wrapped_keys`
    pub ivs: Vec<Iv>,
}

/// Result of removing one layer from an envelope
pub enum Peeled {
    /// More layers remain; forward this envelope to the next hop
    Inner(OnionEnvelope),
    /// This was the innermost layer; the plaintext is for this node
    Exit(Vec<u8>),
}

impl OnionEnvelope {
    /// Number of layers remaining
    pub fn depth(&self) -> usize {
        self.wrapped_keys.len()
    }

    fn check_shape(&self) -> CryptoResult<()> {
        if self.wrapped_keys.is_empty() {
            return Err(CryptoError::MalformedEnvelope("no layers".into()));
        }
        if self.wrapped_keys.len() != self.ivs.len() {
            return Err(CryptoError::MalformedEnvelope(format!(
                "{} wrapped keys but {} IVs",
                self.wrapped_keys.len(),
                self.ivs.len()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for OnionEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnionEnvelope")
            .field("depth", &self.depth())
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Encrypt a single hybrid layer for one recipient
///
/// Generates a fresh 256-bit session key and random IV, encrypts `data`
/// under AES-GCM, and wraps the session key under `pk`.
pub fn encrypt_layer(data: &[u8], pk: &PublicKey) -> CryptoResult<LayerCiphertext> {
    let key = SymmetricKey::generate();
    let iv = Iv::generate();

    let ciphertext = encrypt(&key, &iv, data)?;
    let wrapped_key = pk.wrap_key(key.as_bytes())?;

    Ok(LayerCiphertext {
        ciphertext,
        wrapped_key,
        iv,
    })
}

/// Decrypt a single hybrid layer
///
/// Fails with `UnwrapFailed` if the RSA step rejects the wrapped key, or
/// `AuthTagInvalid` if the GCM tag does not verify.
pub fn decrypt_layer(
    ciphertext: &[u8],
    wrapped_key: &[u8],
    iv: &Iv,
    sk: &SecretKey,
) -> CryptoResult<Vec<u8>> {
    let key_bytes = sk.unwrap_key(wrapped_key)?;
    let key = SymmetricKey::from_bytes(key_bytes);
    decrypt(&key, iv, ciphertext)
}

/// Build an onion envelope over an ordered hop key sequence
///
/// `pks[0]` is the entry hop, `pks[n-1]` the exit. Encryption proceeds
/// from the innermost layer outward: the exit's layer is applied first,
/// then each earlier hop wraps the previous ciphertext.
pub fn build_onion(data: &[u8], pks: &[PublicKey]) -> CryptoResult<OnionEnvelope> {
    if pks.is_empty() {
        return Err(CryptoError::EmptyCircuit);
    }
    if pks.len() > MAX_ONION_LAYERS {
        return Err(CryptoError::TooManyLayers {
            max: MAX_ONION_LAYERS,
            actual: pks.len(),
        });
    }

    let mut payload = data.to_vec();
    let mut wrapped_keys = Vec::with_capacity(pks.len());
    let mut ivs = Vec::with_capacity(pks.len());

    for pk in pks.iter().rev() {
        let layer = encrypt_layer(&payload, pk)?;
        payload = layer.ciphertext;
        wrapped_keys.push(layer.wrapped_key);
        ivs.push(layer.iv);
    }

    // Built inside out; flip so index 0 is the outermost layer.
    wrapped_keys.reverse();
    ivs.reverse();

    Ok(OnionEnvelope {
        payload,
        wrapped_keys,
        ivs,
    })
}

/// Remove exactly one layer from an envelope
///
/// The caller must hold the secret key for the outermost layer. A hop
/// learns nothing about deeper layers beyond their count.
pub fn peel_layer(envelope: OnionEnvelope, sk: &SecretKey) -> CryptoResult<Peeled> {
    envelope.check_shape()?;

    let OnionEnvelope {
        payload,
        mut wrapped_keys,
        mut ivs,
    } = envelope;

    let wrapped_key = wrapped_keys.remove(0);
    let iv = ivs.remove(0);

    let inner = decrypt_layer(&payload, &wrapped_key, &iv, sk)?;

    if wrapped_keys.is_empty() {
        Ok(Peeled::Exit(inner))
    } else {
        Ok(Peeled::Inner(OnionEnvelope {
            payload: inner,
            wrapped_keys,
            ivs,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_circuit_keys, KeyPair};

    #[test]
    fn test_single_layer_roundtrip() {
        let pair = KeyPair::generate().unwrap();
        let layer = encrypt_layer(b"payload", &pair.public).unwrap();

        let plain =
            decrypt_layer(&layer.ciphertext, &layer.wrapped_key, &layer.iv, &pair.secret).unwrap();
        assert_eq!(plain, b"payload");
    }

    #[test]
    fn test_single_hop_onion() {
        let pair = KeyPair::generate().unwrap();

        let onion = build_onion(b"exit plaintext", &[pair.public.clone()]).unwrap();
        assert_eq!(onion.depth(), 1);

        match peel_layer(onion, &pair.secret).unwrap() {
            Peeled::Exit(plain) => assert_eq!(plain, b"exit plaintext"),
            Peeled::Inner(_) => panic!("single layer should peel to plaintext"),
        }
    }

    #[test]
    fn test_multi_hop_peel_order() {
        let hops = generate_circuit_keys(3).unwrap();
        let pks: Vec<_> = hops.iter().map(|kp| kp.public.clone()).collect();
        let message = b"through three hops";

        let mut envelope = build_onion(message, &pks).unwrap();
        assert_eq!(envelope.depth(), 3);

        for (i, hop) in hops.iter().enumerate() {
            match peel_layer(envelope.clone(), &hop.secret).unwrap() {
                Peeled::Inner(inner) => {
                    assert!(i < hops.len() - 1, "inner layer at exit position");
                    assert_eq!(inner.depth(), hops.len() - i - 1);
                    envelope = inner;
                }
                Peeled::Exit(plain) => {
                    assert_eq!(i, hops.len() - 1);
                    assert_eq!(plain, message);
                }
            }
        }
    }

    #[test]
    fn test_empty_payload() {
        let hops = generate_circuit_keys(2).unwrap();
        let pks: Vec<_> = hops.iter().map(|kp| kp.public.clone()).collect();

        let envelope = build_onion(b"", &pks).unwrap();
        let inner = match peel_layer(envelope, &hops[0].secret).unwrap() {
            Peeled::Inner(inner) => inner,
            Peeled::Exit(_) => panic!("expected inner layer"),
        };
        match peel_layer(inner, &hops[1].secret).unwrap() {
            Peeled::Exit(plain) => assert!(plain.is_empty()),
            Peeled::Inner(_) => panic!("expected exit"),
        }
    }

    #[test]
    fn test_wrong_key_unwrap_fails() {
        let pair = KeyPair::generate().unwrap();
        let other = KeyPair::generate().unwrap();

        let onion = build_onion(b"secret", &[pair.public.clone()]).unwrap();
        let result = peel_layer(onion, &other.secret);

        assert!(matches!(result, Err(CryptoError::UnwrapFailed)));
    }

    #[test]
    fn test_tampered_payload_fails_auth() {
        let pair = KeyPair::generate().unwrap();

        let mut onion = build_onion(b"secret", &[pair.public.clone()]).unwrap();
        onion.payload[0] ^= 0x01;

        let result = peel_layer(onion, &pair.secret);
        assert!(matches!(result, Err(CryptoError::AuthTagInvalid)));
    }

    #[test]
    fn test_tampered_middle_wrapped_key() {
        // Flip one byte in the wrapped key for hop 2 of a 3-hop onion.
        // Hop 1 peels fine; hop 2 must fail the unwrap; hop 3 is never
        // reached and no plaintext is delivered.
        let hops = generate_circuit_keys(3).unwrap();
        let pks: Vec<_> = hops.iter().map(|kp| kp.public.clone()).collect();

        let mut envelope = build_onion(&[0xde, 0xad, 0xbe, 0xef], &pks).unwrap();
        envelope.wrapped_keys[1][10] ^= 0x40;

        let inner = match peel_layer(envelope, &hops[0].secret).unwrap() {
            Peeled::Inner(inner) => inner,
            Peeled::Exit(_) => panic!("expected inner layer at hop 1"),
        };

        let result = peel_layer(inner, &hops[1].secret);
        assert!(matches!(result, Err(CryptoError::UnwrapFailed)));
    }

    #[test]
    fn test_empty_path_rejected() {
        let result = build_onion(b"data", &[]);
        assert!(matches!(result, Err(CryptoError::EmptyCircuit)));
    }

    #[test]
    fn test_mismatched_shape_rejected() {
        let pair = KeyPair::generate().unwrap();
        let mut envelope = build_onion(b"data", &[pair.public.clone()]).unwrap();
        envelope.ivs.clear();

        let result = peel_layer(envelope, &pair.secret);
        assert!(matches!(result, Err(CryptoError::MalformedEnvelope(_))));
    }
}
