//! Cryptographic error types.

use thiserror::Error;

/// Cryptographic errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AEAD encryption failed
    #[error("encryption failed")]
    EncryptionFailed,

    /// AEAD decryption failed (authentication failure)
    #[error("decryption failed: authentication failure")]
    DecryptionFailed,

    /// Invalid key length
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Key agreement produced a low-order shared secret
    #[error("key agreement rejected low-order point")]
    LowOrderPoint,

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key")]
    InvalidPublicKey,

    /// Invalid key material (corrupted or wrong format)
    #[error("invalid key material")]
    InvalidKeyMaterial,

    /// Hex string could not be parsed into a fingerprint
    #[error("invalid fingerprint: {0}")]
    InvalidFingerprint(String),
}
