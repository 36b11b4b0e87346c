//! # Beacon Crypto
//!
//! Cryptographic primitives for the LoRa beacon node.
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm |
//! |----------|-----------|
//! | Key Agreement | X25519 |
//! | Link Encryption | XChaCha20-Poly1305 |
//! | Hash / Fingerprint | BLAKE3 (truncated to 128 bits for addresses) |
//! | KDF | BLAKE3 derive-key mode |
//! | Signatures | Ed25519 |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod aead;
pub mod error;
pub mod hash;
pub mod identity;
pub mod signatures;
pub mod x25519;

pub use error::CryptoError;
pub use identity::{Fingerprint, Identity, PublicIdentity};
pub use signatures::Signature;
