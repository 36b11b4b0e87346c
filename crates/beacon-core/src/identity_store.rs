//! Durable node identity and known-destination cache.
//!
//! The identity file is the node's reputation anchor: once written it is
//! only ever read back, and a file that cannot be parsed stops the node
//! instead of being silently replaced. The destination cache is the
//! opposite: it is best effort, loaded lazily, and rebuilt from announces
//! if it goes missing or bad.

use crate::error::{BeaconError, Result};
use crate::persist::{Persister, write_atomic};
use beacon_crypto::{Fingerprint, Identity, PublicIdentity};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

/// A peer destination seen on the mesh.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownDestination {
    /// Endpoint address
    pub address: Fingerprint,
    /// 64-byte public identity of the owner
    pub public_key: Vec<u8>,
    /// Hops to the destination when last heard
    pub hops: u8,
    /// Unix time (seconds) the destination was last heard from
    pub last_seen: i64,
    /// Application data from the last announce
    pub app_data: Vec<u8>,
}

impl KnownDestination {
    /// Entry for `address` owned by `identity`, seen now.
    #[must_use]
    pub fn new(address: Fingerprint, identity: &PublicIdentity, hops: u8) -> Self {
        Self {
            address,
            public_key: identity.to_bytes().to_vec(),
            hops,
            last_seen: chrono::Utc::now().timestamp(),
            app_data: Vec::new(),
        }
    }

    /// Parsed public identity, if the stored key is valid
    #[must_use]
    pub fn identity(&self) -> Option<PublicIdentity> {
        PublicIdentity::from_bytes(&self.public_key).ok()
    }
}

/// Owns the node identity and the known-destination cache.
pub struct IdentityStore {
    identity: Arc<Identity>,
    cache_path: PathBuf,
    known: OnceLock<DashMap<Fingerprint, KnownDestination>>,
}

impl IdentityStore {
    /// Load the identity at `identity_path`, creating it on first run.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::CorruptIdentity`] if the file exists but cannot
    /// be read or parsed.
    pub fn load_or_create(
        identity_path: impl AsRef<Path>,
        cache_path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let identity = Self::load_identity(identity_path.as_ref())?;
        Ok(Self {
            identity: Arc::new(identity),
            cache_path: cache_path.into(),
            known: OnceLock::new(),
        })
    }

    /// Load or create just the identity.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::CorruptIdentity`] on an unreadable or
    /// unparsable file.
    pub fn load_identity(path: &Path) -> Result<Identity> {
        match fs::read(path) {
            Ok(bytes) => {
                let identity = Identity::from_bytes(&bytes).map_err(|e| {
                    BeaconError::CorruptIdentity(Cow::Owned(format!("{}: {}", path.display(), e)))
                })?;
                tracing::info!(
                    "Loaded identity {} from {}",
                    identity.fingerprint(),
                    path.display()
                );
                Ok(identity)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                let identity = Identity::generate();
                match write_identity(path, &identity) {
                    Ok(()) => tracing::info!(
                        "Created new identity {} at {}",
                        identity.fingerprint(),
                        path.display()
                    ),
                    Err(e) => {
                        let err = BeaconError::Persistence(Cow::Owned(format!(
                            "could not save identity to {}: {}",
                            path.display(),
                            e
                        )));
                        tracing::error!("{}", err);
                    }
                }
                Ok(identity)
            }
            Err(e) => Err(BeaconError::CorruptIdentity(Cow::Owned(format!(
                "{}: {}",
                path.display(),
                e
            )))),
        }
    }

    /// The node identity
    #[must_use]
    pub fn identity(&self) -> &Arc<Identity> {
        &self.identity
    }

    /// Known destinations, loaded from disk on first access.
    pub fn known_destinations(&self) -> &DashMap<Fingerprint, KnownDestination> {
        self.known.get_or_init(|| load_cache(&self.cache_path))
    }

    /// Look up one destination
    #[must_use]
    pub fn get(&self, address: &Fingerprint) -> Option<KnownDestination> {
        self.known_destinations()
            .get(address)
            .map(|entry| entry.value().clone())
    }

    /// Upsert a destination. Keeps the existing entry if it is more recent.
    ///
    /// Returns whether the cache changed.
    pub fn remember(&self, destination: KnownDestination) -> bool {
        match self.known_destinations().entry(destination.address) {
            Entry::Vacant(slot) => {
                slot.insert(destination);
                true
            }
            Entry::Occupied(mut slot) => {
                if slot.get().last_seen > destination.last_seen || *slot.get() == destination {
                    return false;
                }
                slot.insert(destination);
                true
            }
        }
    }

    /// Refresh `address` after a path resolution, keeping stored hops and
    /// application data.
    pub fn remember_identity(&self, address: Fingerprint, identity: &PublicIdentity) -> bool {
        let mut fresh = KnownDestination::new(address, identity, 1);
        if let Some(existing) = self.get(&address) {
            if existing.public_key == fresh.public_key {
                fresh.hops = existing.hops;
                fresh.app_data = existing.app_data;
            }
        }
        self.remember(fresh)
    }

    /// Snapshot of the cache ordered by address
    #[must_use]
    pub fn snapshot(&self) -> Vec<KnownDestination> {
        let mut entries: Vec<_> = self
            .known_destinations()
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.address.cmp(&b.address));
        entries
    }

    /// Queue the destination cache on `persister`. Failures are logged
    /// only.
    pub fn persist(&self, persister: &Persister) {
        let entries = self.snapshot();
        match bincode::serialize(&entries) {
            Ok(bytes) => {
                tracing::debug!("Queued {} known destinations for saving", entries.len());
                persister.save(&self.cache_path, bytes);
            }
            Err(e) => tracing::error!("{}", BeaconError::Persistence(Cow::Owned(e.to_string()))),
        }
    }
}

fn write_identity(path: &Path, identity: &Identity) -> io::Result<()> {
    write_atomic(path, &identity.to_bytes()[..])?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}

fn load_cache(path: &Path) -> DashMap<Fingerprint, KnownDestination> {
    let known = DashMap::new();
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return known,
        Err(e) => {
            tracing::warn!("Could not read destination cache {}: {}", path.display(), e);
            return known;
        }
    };

    match bincode::deserialize::<Vec<KnownDestination>>(&bytes) {
        Ok(entries) => {
            for entry in entries {
                known.insert(entry.address, entry);
            }
            tracing::debug!("Loaded {} known destinations", known.len());
        }
        Err(e) => {
            tracing::warn!(
                "Destination cache {} is unreadable, starting empty: {}",
                path.display(),
                e
            );
        }
    }
    known
}
