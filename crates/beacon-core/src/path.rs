//! Path resolution.
//!
//! Discovery on the mesh is driven by announces, so there is no reply to
//! wait on. The resolver asks for a path once and then polls the transport
//! until the path shows up, the budget runs out, or the caller cancels.

use crate::error::{BeaconError, Result};
use crate::identity_store::IdentityStore;
use beacon_crypto::{Fingerprint, PublicIdentity};
use beacon_transport::Transport;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Interval between path checks
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default resolution budget
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Outcome of a path resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathResult {
    /// Path was already known; no request was sent
    Known(PublicIdentity),
    /// Path became known while polling
    Resolved(PublicIdentity),
    /// Budget elapsed without a path
    TimedOut,
}

impl PathResult {
    /// Identity of the destination owner, if a path exists
    #[must_use]
    pub fn identity(&self) -> Option<&PublicIdentity> {
        match self {
            PathResult::Known(identity) | PathResult::Resolved(identity) => Some(identity),
            PathResult::TimedOut => None,
        }
    }
}

/// Resolves paths through a [`Transport`].
pub struct PathResolver {
    transport: Arc<dyn Transport>,
    store: Arc<IdentityStore>,
    poll_interval: Duration,
}

impl PathResolver {
    /// Resolver over `transport`, remembering resolved destinations in `store`
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, store: Arc<IdentityStore>) -> Self {
        Self {
            transport,
            store,
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Override the poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.set_poll_interval(poll_interval);
        self
    }

    /// Change the poll interval in place
    pub fn set_poll_interval(&mut self, poll_interval: Duration) {
        self.poll_interval = poll_interval.max(Duration::from_millis(1));
    }

    /// Poll interval in use
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn known(&self, destination: &Fingerprint) -> Option<PublicIdentity> {
        if self.transport.has_path(destination) {
            self.transport.recall(destination)
        } else {
            None
        }
    }

    /// Make sure a path to `destination` is known.
    ///
    /// Returns within `timeout` plus one poll interval.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::Cancelled`] if `cancel` fires first, or
    /// [`BeaconError::Transport`] if the path request cannot be sent.
    pub async fn resolve(
        &self,
        destination: &Fingerprint,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<PathResult> {
        if let Some(identity) = self.known(destination) {
            return Ok(PathResult::Known(identity));
        }

        let deadline = Instant::now() + timeout;
        tracing::info!("Path to {} unknown, requesting", destination);
        self.transport.request_path(destination).await?;

        loop {
            if let Some(identity) = self.known(destination) {
                tracing::info!("Path to {} resolved", destination);
                self.store.remember_identity(*destination, &identity);
                return Ok(PathResult::Resolved(identity));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::warn!("Path to {} timed out after {:?}", destination, timeout);
                return Ok(PathResult::TimedOut);
            }

            tokio::select! {
                () = cancel.cancelled() => return Err(BeaconError::Cancelled),
                () = tokio::time::sleep(remaining.min(self.poll_interval)) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use beacon_crypto::Identity;
    use beacon_transport::{Endpoint, LinkId, TransportError, TransportEvent, TransportResult};
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;
    use tokio::sync::mpsc;

    /// Transport whose paths appear when the test says so
    #[derive(Default)]
    struct ScriptedPaths {
        paths: DashMap<Fingerprint, PublicIdentity>,
        requests: AtomicUsize,
    }

    #[async_trait]
    impl Transport for ScriptedPaths {
        fn has_path(&self, destination: &Fingerprint) -> bool {
            self.paths.contains_key(destination)
        }
        async fn request_path(&self, _destination: &Fingerprint) -> TransportResult<()> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn recall(&self, destination: &Fingerprint) -> Option<PublicIdentity> {
            self.paths.get(destination).map(|entry| *entry)
        }
        fn restore_path(&self, destination: Fingerprint, identity: PublicIdentity, _hops: u8) {
            self.paths.insert(destination, identity);
        }
        fn register_endpoint(&self, _: Endpoint, _: Arc<Identity>) -> TransportResult<()> {
            Ok(())
        }
        async fn announce(&self, _: &Fingerprint, _: &[u8]) -> TransportResult<()> {
            Ok(())
        }
        async fn open_link(&self, endpoint: &Endpoint) -> TransportResult<LinkId> {
            Err(TransportError::NoPath(endpoint.address()))
        }
        async fn identify(&self, link: LinkId, _: &Identity) -> TransportResult<()> {
            Err(TransportError::UnknownLink(link))
        }
        async fn send(&self, link: LinkId, _: &[u8]) -> TransportResult<()> {
            Err(TransportError::UnknownLink(link))
        }
        async fn close_link(&self, link: LinkId) -> TransportResult<()> {
            Err(TransportError::UnknownLink(link))
        }
        fn link_mdu(&self) -> usize {
            beacon_transport::LINK_MDU
        }
        fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
            mpsc::unbounded_channel().1
        }
    }

    fn resolver(dir: &TempDir) -> (Arc<ScriptedPaths>, Arc<IdentityStore>, PathResolver) {
        let transport = Arc::new(ScriptedPaths::default());
        let store = Arc::new(
            IdentityStore::load_or_create(dir.path().join("id"), dir.path().join("cache"))
                .unwrap(),
        );
        let resolver = PathResolver::new(transport.clone(), Arc::clone(&store))
            .with_poll_interval(Duration::from_millis(10));
        (transport, store, resolver)
    }

    #[tokio::test]
    async fn test_known_path_returns_immediately() {
        let dir = TempDir::new().unwrap();
        let (transport, _, resolver) = resolver(&dir);
        let peer = *Identity::generate().public();
        let address = Fingerprint::from_bytes([1; 16]);
        transport.restore_path(address, peer, 1);

        let result = resolver
            .resolve(&address, Duration::from_secs(1), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, PathResult::Known(peer));
        assert_eq!(transport.requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_path_resolves_while_polling() {
        let dir = TempDir::new().unwrap();
        let (transport, store, resolver) = resolver(&dir);
        let peer = *Identity::generate().public();
        let address = Fingerprint::from_bytes([2; 16]);

        let later = Arc::clone(&transport);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            later.restore_path(address, peer, 1);
        });

        let result = resolver
            .resolve(&address, Duration::from_secs(2), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result, PathResult::Resolved(peer));
        assert_eq!(transport.requests.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&address).unwrap().identity(), Some(peer));
    }

    #[tokio::test]
    async fn test_timeout_is_bounded() {
        let dir = TempDir::new().unwrap();
        let (_, _, resolver) = resolver(&dir);
        let address = Fingerprint::from_bytes([3; 16]);
        let budget = Duration::from_millis(120);

        let started = std::time::Instant::now();
        let result = resolver
            .resolve(&address, budget, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result, PathResult::TimedOut);
        assert!(started.elapsed() >= budget);
        assert!(started.elapsed() < budget + resolver.poll_interval() + Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_resolution() {
        let dir = TempDir::new().unwrap();
        let (_, _, resolver) = resolver(&dir);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            trigger.cancel();
        });

        let result = resolver
            .resolve(
                &Fingerprint::from_bytes([4; 16]),
                Duration::from_secs(10),
                &cancel,
            )
            .await;
        assert_eq!(result, Err(BeaconError::Cancelled));
    }
}
