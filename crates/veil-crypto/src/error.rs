//! Cryptographic error types

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Key generation failed (RNG or parameter failure)
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    /// Invalid key length provided
    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid IV length
    #[error("Invalid IV length: expected {expected}, got {actual}")]
    InvalidIvLength { expected: usize, actual: usize },

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    /// Wrapping the session key under the recipient's public key failed
    #[error("Key wrap failed: {0}")]
    WrapFailed(String),

    /// Unwrapping the session key failed (wrong key or corrupted wrap)
    #[error("Key unwrap failed")]
    UnwrapFailed,

    /// GCM authentication tag did not verify
    #[error("Authentication tag invalid")]
    AuthTagInvalid,

    /// Public key could not be parsed
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Private key could not be parsed
    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Onion envelope is structurally invalid
    #[error("Malformed onion envelope: {0}")]
    MalformedEnvelope(String),

    /// Too many onion layers requested
    #[error("Too many onion layers: maximum is {max}, got {actual}")]
    TooManyLayers { max: usize, actual: usize },

    /// No hops specified for the envelope
    #[error("Onion envelope must have at least one layer")]
    EmptyCircuit,
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
