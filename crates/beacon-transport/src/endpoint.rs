//! Named, addressable endpoints.
//!
//! An endpoint is an identity plus a dotted name such as
//! `lorabeacon.uplink`. Its address is the truncated hash of the name hash
//! followed by the identity fingerprint, so the same identity gets a
//! different address per application and aspect.

use crate::transport::{TransportError, TransportResult};
use beacon_crypto::hash::{NAME_HASH_LEN, name_hash, truncated_hash};
use beacon_crypto::{Fingerprint, PublicIdentity};
use std::fmt;

/// An addressable endpoint owned by some identity.
#[derive(Clone, PartialEq, Eq)]
pub struct Endpoint {
    identity: PublicIdentity,
    name: String,
    name_hash: [u8; NAME_HASH_LEN],
    address: Fingerprint,
}

impl Endpoint {
    /// Build the endpoint `app_name.aspect[.aspect..]` owned by `identity`.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidEndpoint` if any component is empty or
    /// contains a dot.
    pub fn new(
        identity: PublicIdentity,
        app_name: &str,
        aspects: &[&str],
    ) -> TransportResult<Self> {
        let mut parts = Vec::with_capacity(aspects.len() + 1);
        for component in std::iter::once(app_name).chain(aspects.iter().copied()) {
            if component.is_empty() || component.contains('.') {
                return Err(TransportError::InvalidEndpoint(format!(
                    "bad name component {component:?}"
                )));
            }
            parts.push(component);
        }
        let name = parts.join(".");
        let name_hash = name_hash(&name);
        let address = Self::compute_address(&name_hash, &identity.fingerprint());

        Ok(Self {
            identity,
            name,
            name_hash,
            address,
        })
    }

    /// Address for a name hash and identity fingerprint.
    #[must_use]
    pub fn compute_address(
        name_hash: &[u8; NAME_HASH_LEN],
        identity: &Fingerprint,
    ) -> Fingerprint {
        let mut material = [0u8; NAME_HASH_LEN + 16];
        material[..NAME_HASH_LEN].copy_from_slice(name_hash);
        material[NAME_HASH_LEN..].copy_from_slice(identity.as_bytes());
        Fingerprint::from_bytes(truncated_hash(&material))
    }

    /// Network address
    #[must_use]
    pub fn address(&self) -> Fingerprint {
        self.address
    }

    /// Owning identity
    #[must_use]
    pub fn identity(&self) -> &PublicIdentity {
        &self.identity
    }

    /// Dotted full name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hash of the full name
    #[must_use]
    pub fn name_hash(&self) -> &[u8; NAME_HASH_LEN] {
        &self.name_hash
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("name", &self.name)
            .field("address", &self.address)
            .finish()
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self.address, self.name)
    }
}
