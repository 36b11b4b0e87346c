//! Signed endpoint announces.
//!
//! An announce binds an endpoint address to the public identity that owns
//! it. The random hash is five random bytes followed by the emission time
//! in seconds (40-bit big-endian), which lets receivers both drop replays
//! and prefer newer announces over stale ones.

use crate::endpoint::Endpoint;
use beacon_crypto::hash::NAME_HASH_LEN;
use beacon_crypto::{Fingerprint, Identity, PublicIdentity, Signature};
use rand_core::{OsRng, RngCore};
use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

/// Length of the announce random hash
pub const RANDOM_HASH_LEN: usize = 10;

const RANDOM_PREFIX_LEN: usize = 5;

/// Announce validation failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AnnounceError {
    /// Address is not derived from the carried identity and name hash
    #[error("announced address does not match identity")]
    AddressMismatch,
    /// Signature does not verify under the carried identity
    #[error("announce signature invalid")]
    BadSignature,
}

/// A signed announce.
#[derive(Debug, Clone, PartialEq)]
pub struct Announce {
    /// Announced endpoint address
    pub destination: Fingerprint,
    /// Owner of the endpoint
    pub identity: PublicIdentity,
    /// Hash of the endpoint's full name
    pub name_hash: [u8; NAME_HASH_LEN],
    /// Random prefix plus emission time
    pub random_hash: [u8; RANDOM_HASH_LEN],
    /// Application data
    pub app_data: Vec<u8>,
    /// Signature by `identity`
    pub signature: Signature,
}

impl Announce {
    /// Create an announce for `endpoint` stamped with the current time.
    #[must_use]
    pub fn create(endpoint: &Endpoint, identity: &Identity, app_data: &[u8]) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();
        Self::create_at(endpoint, identity, app_data, now, &mut OsRng)
    }

    /// Create an announce with an explicit emission time.
    pub fn create_at<R: RngCore>(
        endpoint: &Endpoint,
        identity: &Identity,
        app_data: &[u8],
        emitted_at: u64,
        rng: &mut R,
    ) -> Self {
        let mut random_hash = [0u8; RANDOM_HASH_LEN];
        rng.fill_bytes(&mut random_hash[..RANDOM_PREFIX_LEN]);
        random_hash[RANDOM_PREFIX_LEN..].copy_from_slice(&emitted_at.to_be_bytes()[3..]);

        let mut announce = Self {
            destination: endpoint.address(),
            identity: *identity.public(),
            name_hash: *endpoint.name_hash(),
            random_hash,
            app_data: app_data.to_vec(),
            signature: Signature::from_bytes([0u8; 64]),
        };
        announce.signature = identity.sign(&announce.signed_data());
        announce
    }

    fn signed_data(&self) -> Vec<u8> {
        let mut data =
            Vec::with_capacity(16 + 64 + NAME_HASH_LEN + RANDOM_HASH_LEN + self.app_data.len());
        data.extend_from_slice(self.destination.as_bytes());
        data.extend_from_slice(&self.identity.to_bytes());
        data.extend_from_slice(&self.name_hash);
        data.extend_from_slice(&self.random_hash);
        data.extend_from_slice(&self.app_data);
        data
    }

    /// Check the address binding and the signature.
    ///
    /// # Errors
    /// Returns the first check that failed.
    pub fn validate(&self) -> Result<(), AnnounceError> {
        let expected = Endpoint::compute_address(&self.name_hash, &self.identity.fingerprint());
        if expected != self.destination {
            return Err(AnnounceError::AddressMismatch);
        }
        self.identity
            .verify(&self.signed_data(), &self.signature)
            .map_err(|_| AnnounceError::BadSignature)
    }

    /// Emission time in seconds since the epoch.
    #[must_use]
    pub fn emitted_at(&self) -> u64 {
        let mut be = [0u8; 8];
        be[3..].copy_from_slice(&self.random_hash[RANDOM_PREFIX_LEN..]);
        u64::from_be_bytes(be)
    }
}

/// Replay and staleness filter for announces of one destination.
#[derive(Debug, Clone)]
pub struct AnnounceHistory {
    newest: u64,
    recent: VecDeque<[u8; RANDOM_HASH_LEN]>,
    capacity: usize,
}

impl AnnounceHistory {
    /// Remember up to `capacity` random hashes
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            newest: 0,
            recent: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Accept `announce` unless it is a replay or older than the newest seen.
    pub fn accept(&mut self, announce: &Announce) -> bool {
        if self.recent.contains(&announce.random_hash) || announce.emitted_at() < self.newest {
            return false;
        }
        if self.recent.len() == self.capacity {
            self.recent.pop_front();
        }
        self.recent.push_back(announce.random_hash);
        self.newest = announce.emitted_at();
        true
    }
}
