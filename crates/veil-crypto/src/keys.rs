//! RSA-OAEP Key Wrap
//!
//! Long-term and per-circuit ephemeral keys are 2048-bit RSA pairs.
//! Public keys travel as SPKI DER (base64 on the wire); the only thing
//! ever encrypted directly under RSA is a fresh 256-bit session key,
//! wrapped with OAEP over SHA-256.

use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::constants::{RSA_KEY_BITS, SYMMETRIC_KEY_SIZE};
use crate::error::{CryptoError, CryptoResult};

/// An RSA public key, kept alongside its SPKI DER encoding
#[derive(Clone)]
pub struct PublicKey {
    inner: RsaPublicKey,
    der: Vec<u8>,
}

/// An RSA private key
///
/// The underlying key material is zeroed on drop by the `rsa` crate.
pub struct SecretKey {
    inner: RsaPrivateKey,
}

/// A keypair containing both secret and public halves
pub struct KeyPair {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl PublicKey {
    /// Parse from SPKI DER bytes
    pub fn from_der(der: &[u8]) -> CryptoResult<Self> {
        let inner = RsaPublicKey::from_public_key_der(der)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self {
            inner,
            der: der.to_vec(),
        })
    }

    /// Parse from the base64 wire form
    pub fn from_base64(encoded: &str) -> CryptoResult<Self> {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        let der = STANDARD
            .decode(encoded)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Self::from_der(&der)
    }

    /// SPKI DER encoding
    pub fn as_der(&self) -> &[u8] {
        &self.der
    }

    /// Base64 wire form of the SPKI encoding
    pub fn to_base64(&self) -> String {
        use base64::{engine::general_purpose::STANDARD, Engine as _};
        STANDARD.encode(&self.der)
    }

    /// Wrap a session key under this public key (OAEP, SHA-256)
    pub fn wrap_key(&self, key: &[u8; SYMMETRIC_KEY_SIZE]) -> CryptoResult<Vec<u8>> {
        self.inner
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), key)
            .map_err(|e| CryptoError::WrapFailed(e.to_string()))
    }
}

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.der == other.der
    }
}

impl Eq for PublicKey {}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}...)", hex::encode(&self.der[..8.min(self.der.len())]))
    }
}

impl SecretKey {
    /// Generate a fresh 2048-bit key
    pub fn generate() -> CryptoResult<Self> {
        let inner = RsaPrivateKey::new(&mut OsRng, RSA_KEY_BITS)
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Unwrap a session key previously wrapped under the matching public key
    ///
    /// Any OAEP failure collapses to `UnwrapFailed`; the cause is not
    /// propagated further.
    pub fn unwrap_key(&self, wrapped: &[u8]) -> CryptoResult<[u8; SYMMETRIC_KEY_SIZE]> {
        let plain = Zeroizing::new(
            self.inner
                .decrypt(Oaep::new::<Sha256>(), wrapped)
                .map_err(|_| CryptoError::UnwrapFailed)?,
        );
        if plain.len() != SYMMETRIC_KEY_SIZE {
            return Err(CryptoError::UnwrapFailed);
        }
        let mut key = [0u8; SYMMETRIC_KEY_SIZE];
        key.copy_from_slice(&plain);
        Ok(key)
    }

    /// Derive the matching public key
    pub fn public_key(&self) -> CryptoResult<PublicKey> {
        let public = RsaPublicKey::from(&self.inner);
        let der = public
            .to_public_key_der()
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(PublicKey {
            inner: public,
            der: der.as_bytes().to_vec(),
        })
    }

    /// Export as PKCS#8 DER (for transporting circuit ephemerals)
    pub fn to_pkcs8_der(&self) -> CryptoResult<Zeroizing<Vec<u8>>> {
        let doc = self
            .inner
            .to_pkcs8_der()
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Zeroizing::new(doc.as_bytes().to_vec()))
    }

    /// Parse from PKCS#8 DER
    pub fn from_pkcs8_der(der: &[u8]) -> CryptoResult<Self> {
        let inner = RsaPrivateKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self { inner })
    }
}

// Never print private key material, even in debug output.
impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

impl KeyPair {
    /// Generate a fresh keypair
    pub fn generate() -> CryptoResult<Self> {
        let secret = SecretKey::generate()?;
        let public = secret.public_key()?;
        Ok(Self { secret, public })
    }

    /// Reconstruct from an existing secret key
    pub fn from_secret(secret: SecretKey) -> CryptoResult<Self> {
        let public = secret.public_key()?;
        Ok(Self { secret, public })
    }
}

/// Generate `n` independent keypairs for a fresh circuit, one per hop
pub fn generate_circuit_keys(n: usize) -> CryptoResult<Vec<KeyPair>> {
    if n == 0 {
        return Err(CryptoError::EmptyCircuit);
    }
    (0..n).map(|_| KeyPair::generate()).collect()
}
