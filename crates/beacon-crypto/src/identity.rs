//! Beacon identities and fingerprints.
//!
//! An identity is a pair of keys: an X25519 key for key agreement and an
//! Ed25519 key for signatures. The 64-byte public half is what peers learn
//! from announces; its truncated BLAKE3 hash is the identity fingerprint.
//!
//! The serialized private form is the 64-byte concatenation of the X25519
//! secret and the Ed25519 seed. The same bytes always produce the same
//! fingerprint, which is what lets a node keep its network reputation
//! across restarts.

use crate::CryptoError;
use crate::hash::{TRUNCATED_HASH_LEN, truncated_hash};
use crate::signatures::{Signature, SigningKey, VerifyingKey};
use crate::x25519;
use rand_core::{CryptoRng, OsRng, RngCore};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use zeroize::Zeroizing;

/// Length of the serialized public identity (X25519 || Ed25519).
pub const PUBLIC_IDENTITY_LEN: usize = 64;

/// Length of the serialized private identity blob.
pub const PRIVATE_IDENTITY_LEN: usize = 64;

/// Stable 16-byte hash used as a network-visible address.
///
/// Both identities and endpoints are addressed by fingerprints of this size.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint([u8; TRUNCATED_HASH_LEN]);

impl Fingerprint {
    /// Wrap raw fingerprint bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; TRUNCATED_HASH_LEN]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice of exactly 16 bytes
    #[must_use]
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        slice.try_into().ok().map(Self)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TRUNCATED_HASH_LEN] {
        &self.0
    }

    /// Lowercase hex, 32 characters
    #[must_use]
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<{}>", self.to_hex())
    }
}

impl FromStr for Fingerprint {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim().trim_start_matches('<').trim_end_matches('>');
        let bytes =
            hex::decode(trimmed).map_err(|e| CryptoError::InvalidFingerprint(e.to_string()))?;
        Self::from_slice(&bytes).ok_or_else(|| {
            CryptoError::InvalidFingerprint(format!(
                "expected {} bytes, got {}",
                TRUNCATED_HASH_LEN,
                bytes.len()
            ))
        })
    }
}

/// Public half of an identity, as learned from announces or identify packets.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicIdentity {
    encryption: x25519::PublicKey,
    signing: VerifyingKey,
}

impl PublicIdentity {
    /// Parse the 64-byte public form.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyLength`] for a wrong length and
    /// [`CryptoError::InvalidPublicKey`] if the signing half is not a valid point.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PUBLIC_IDENTITY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: PUBLIC_IDENTITY_LEN,
                actual: bytes.len(),
            });
        }
        let mut enc = [0u8; 32];
        let mut sig = [0u8; 32];
        enc.copy_from_slice(&bytes[..32]);
        sig.copy_from_slice(&bytes[32..]);

        Ok(Self {
            encryption: x25519::PublicKey::from_bytes(enc),
            signing: VerifyingKey::from_bytes(&sig)?,
        })
    }

    /// Serialize to the 64-byte public form.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PUBLIC_IDENTITY_LEN] {
        let mut out = [0u8; PUBLIC_IDENTITY_LEN];
        out[..32].copy_from_slice(self.encryption.as_bytes());
        out[32..].copy_from_slice(&self.signing.to_bytes());
        out
    }

    /// Fingerprint of this identity
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(truncated_hash(&self.to_bytes()))
    }

    /// X25519 half
    #[must_use]
    pub fn encryption_key(&self) -> &x25519::PublicKey {
        &self.encryption
    }

    /// Verify a signature made by the holder of this identity.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidSignature`] on mismatch.
    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<(), CryptoError> {
        self.signing.verify(message, signature)
    }
}

impl fmt::Debug for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicIdentity({:?})", self.fingerprint())
    }
}

impl fmt::Display for PublicIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.fingerprint())
    }
}

/// Full identity including private keys.
pub struct Identity {
    encryption: x25519::PrivateKey,
    signing: SigningKey,
    public: PublicIdentity,
}

impl Identity {
    /// Generate a fresh identity from the OS RNG.
    #[must_use]
    pub fn generate() -> Self {
        Self::generate_with(&mut OsRng)
    }

    /// Generate a fresh identity from the given RNG.
    #[must_use]
    pub fn generate_with<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let encryption = x25519::PrivateKey::generate(rng);
        let signing = SigningKey::generate(rng);
        Self::assemble(encryption, signing)
    }

    /// Restore from the 64-byte private blob.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the blob has the wrong size.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        if bytes.len() != PRIVATE_IDENTITY_LEN {
            return Err(CryptoError::InvalidKeyMaterial);
        }
        let mut enc = Zeroizing::new([0u8; 32]);
        let mut sig = Zeroizing::new([0u8; 32]);
        enc.copy_from_slice(&bytes[..32]);
        sig.copy_from_slice(&bytes[32..]);

        Ok(Self::assemble(
            x25519::PrivateKey::from_bytes(*enc),
            SigningKey::from_bytes(&sig),
        ))
    }

    fn assemble(encryption: x25519::PrivateKey, signing: SigningKey) -> Self {
        let public = PublicIdentity {
            encryption: encryption.public_key(),
            signing: signing.verifying_key(),
        };
        Self {
            encryption,
            signing,
            public,
        }
    }

    /// Serialize to the 64-byte private blob.
    #[must_use]
    pub fn to_bytes(&self) -> Zeroizing<[u8; PRIVATE_IDENTITY_LEN]> {
        let mut out = Zeroizing::new([0u8; PRIVATE_IDENTITY_LEN]);
        out[..32].copy_from_slice(&self.encryption.to_bytes());
        out[32..].copy_from_slice(&self.signing.to_bytes());
        out
    }

    /// Public half
    #[must_use]
    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    /// Fingerprint of the public half
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint()
    }

    /// Sign a message with the Ed25519 half.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing.sign(message)
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("fingerprint", &self.fingerprint())
            .finish_non_exhaustive()
    }
}
