//! BLAKE3 hashing and key derivation.
//!
//! Provides:
//! - Full-length hashing
//! - Truncated hashes used as network-visible addresses
//! - Name hashes for endpoint namespaces
//! - Context-specific KDF

/// BLAKE3 hash output (32 bytes).
pub type HashOutput = [u8; 32];

/// Truncated hash length used for fingerprints and addresses (128 bits).
pub const TRUNCATED_HASH_LEN: usize = 16;

/// Name hash length used in endpoint derivation (80 bits).
pub const NAME_HASH_LEN: usize = 10;

/// Compute BLAKE3 hash of input data.
#[must_use]
pub fn hash(data: &[u8]) -> HashOutput {
    *blake3::hash(data).as_bytes()
}

/// Compute the BLAKE3 hash of the concatenation of several parts.
#[must_use]
pub fn hash_parts(parts: &[&[u8]]) -> HashOutput {
    let mut hasher = blake3::Hasher::new();
    for part in parts {
        hasher.update(part);
    }
    *hasher.finalize().as_bytes()
}

/// First 16 bytes of the BLAKE3 hash of `data`.
#[must_use]
pub fn truncated_hash(data: &[u8]) -> [u8; TRUNCATED_HASH_LEN] {
    let full = hash(data);
    let mut out = [0u8; TRUNCATED_HASH_LEN];
    out.copy_from_slice(&full[..TRUNCATED_HASH_LEN]);
    out
}

/// Hash of a dotted endpoint name such as `lorabeacon.uplink`.
#[must_use]
pub fn name_hash(name: &str) -> [u8; NAME_HASH_LEN] {
    let full = hash(name.as_bytes());
    let mut out = [0u8; NAME_HASH_LEN];
    out.copy_from_slice(&full[..NAME_HASH_LEN]);
    out
}

/// BLAKE3 Key Derivation Function with context.
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Create a KDF with a specific context string.
    #[must_use]
    pub fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Derive output from input key material and a salt.
    pub fn derive(&self, ikm: &[u8], salt: &[u8], output: &mut [u8]) {
        let mut hasher = blake3::Hasher::new_derive_key(self.context);
        hasher.update(ikm);
        hasher.update(salt);

        let mut reader = hasher.finalize_xof();
        reader.fill(output);
    }

    /// Derive a 32-byte key.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8], salt: &[u8]) -> [u8; 32] {
        let mut output = [0u8; 32];
        self.derive(ikm, salt, &mut output);
        output
    }
}
