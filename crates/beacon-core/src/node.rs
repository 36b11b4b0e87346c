//! Beacon node context.
//!
//! [`BeaconNode`] is built once at startup and owns everything the rest of
//! the program needs: configuration, storage layout, identity store, audit
//! recorder, persistence queue and session manager. Components receive it
//! (or the pieces they need) explicitly; there is no global state.

use crate::config::{BeaconConfig, StoragePaths};
use crate::error::{BeaconError, Result};
use crate::identity_store::IdentityStore;
use crate::persist::Persister;
use crate::record::Recorder;
use crate::session_manager::{Provenance, SessionManager, Target};
use crate::{APP_NAME, ASPECT};
use beacon_crypto::{Fingerprint, Identity};
use beacon_transport::{Endpoint, Transport};
use chrono::{DateTime, Timelike, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// A running beacon
pub struct BeaconNode {
    config: BeaconConfig,
    paths: StoragePaths,
    store: Arc<IdentityStore>,
    recorder: Arc<Recorder>,
    persister: Persister,
    sessions: Arc<SessionManager>,
    endpoint: Option<Endpoint>,
}

impl BeaconNode {
    /// Bring the node up on `transport`.
    ///
    /// Validates the configuration, loads (or creates) the identity, seeds
    /// the transport with cached paths and starts the session manager.
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::InvalidConfig`] or
    /// [`BeaconError::CorruptIdentity`], both fatal.
    pub fn start(
        config: BeaconConfig,
        paths: StoragePaths,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        if let Err(e) = paths.ensure() {
            tracing::error!("Storage root {} unusable: {}", paths.root().display(), e);
        }

        let recorder = Arc::new(Recorder::new(paths.root(), config.use_record_file));
        recorder.record("System startup");

        let store = Arc::new(IdentityStore::load_or_create(
            paths.identity(),
            paths.known_destinations(),
        )?);
        let fingerprint = store.identity().fingerprint();
        recorder.record(format!("Identity is {fingerprint}"));
        tracing::info!("Beacon {:?} running as {}", config.name, fingerprint);

        let restored = restore_paths(&store, transport.as_ref());
        if restored > 0 {
            tracing::info!("Restored {} cached paths", restored);
        }

        let persister = Persister::spawn();
        let sessions = Arc::new(SessionManager::new(
            transport,
            Arc::clone(&store),
            Arc::clone(&recorder),
            persister.clone(),
        ));

        Ok(Self {
            config,
            paths,
            store,
            recorder,
            persister,
            sessions,
            endpoint: None,
        })
    }

    /// Configuration in force
    #[must_use]
    pub fn config(&self) -> &BeaconConfig {
        &self.config
    }

    /// Storage layout
    #[must_use]
    pub fn paths(&self) -> &StoragePaths {
        &self.paths
    }

    /// Node identity
    #[must_use]
    pub fn identity(&self) -> &Arc<Identity> {
        self.store.identity()
    }

    /// Identity store
    #[must_use]
    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    /// Audit recorder
    #[must_use]
    pub fn recorder(&self) -> &Arc<Recorder> {
        &self.recorder
    }

    /// Session manager
    #[must_use]
    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    /// Address clients use to reach this node's uplink endpoint
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::Transport`] if the endpoint name is rejected.
    pub fn uplink_address(&self) -> Result<Fingerprint> {
        Ok(Endpoint::new(*self.identity().public(), APP_NAME, &[ASPECT])?.address())
    }

    /// Host the uplink endpoint so clients can link to this node.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::Transport`] if the transport refuses it.
    pub fn serve(&mut self) -> Result<Fingerprint> {
        let endpoint = Endpoint::new(*self.identity().public(), APP_NAME, &[ASPECT])?;
        self.sessions
            .transport()
            .register_endpoint(endpoint.clone(), Arc::clone(self.identity()))?;
        let address = endpoint.address();
        tracing::info!("Serving {} at {}", endpoint.name(), address);
        self.endpoint = Some(endpoint);
        Ok(address)
    }

    /// Announce the served endpoint with the beacon name as app data.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::Transport`] if [`BeaconNode::serve`] was not
    /// called or the announce cannot be sent.
    pub async fn announce(&self) -> Result<()> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or(BeaconError::transport("no endpoint is being served"))?;
        self.sessions
            .transport()
            .announce(&endpoint.address(), self.config.name.as_bytes())
            .await?;
        tracing::info!("Sent announce for {}", endpoint.address());
        Ok(())
    }

    /// Queue a configuration save
    pub fn save_config(&self) {
        self.config.save_with(&self.persister, self.paths.config());
    }

    /// Start the periodic check-in reporter.
    ///
    /// Returns `None` when `ReportTime` is zero. The first report fires on
    /// the next wall-clock second equal to `TargetSecond`, later ones every
    /// `ReportTime` seconds.
    #[must_use]
    pub fn spawn_reporter(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if self.config.report_time == 0 {
            return None;
        }
        let first = delay_until_second(Utc::now(), self.config.target_second);
        tracing::info!(
            "Check-ins every {}s, first in {:?}",
            self.config.report_time,
            first
        );
        Some(tokio::spawn(report_loop(
            Arc::clone(&self.sessions),
            self.config.name.clone(),
            first,
            self.config.report_interval(),
            cancel,
        )))
    }

    /// Close all links and drain pending writes.
    pub async fn shutdown(&self) {
        self.sessions.teardown_all().await;
        self.store.persist(&self.persister);
        self.persister.flush().await;
        self.sessions.flush_records().await;
    }
}

fn restore_paths(store: &IdentityStore, transport: &dyn Transport) -> usize {
    let mut restored = 0;
    for entry in store.snapshot() {
        match entry.identity() {
            Some(identity) => {
                transport.restore_path(entry.address, identity, entry.hops);
                restored += 1;
            }
            None => tracing::warn!("Cached key for {} is unusable", entry.address),
        }
    }
    restored
}

/// Time from `now` until the start of the next second-of-minute equal to
/// `target_second`. Zero if `now` is already at that instant.
#[must_use]
pub fn delay_until_second(now: DateTime<Utc>, target_second: u8) -> Duration {
    let into_minute =
        u64::from(now.second()) * 1000 + u64::from(now.timestamp_subsec_millis().min(999));
    let target = u64::from(target_second % 60) * 1000;
    Duration::from_millis((target + 60_000 - into_minute) % 60_000)
}

/// Reply sent by a server for an inbound message
#[must_use]
pub fn server_reply(text: &str, provenance: &Provenance) -> String {
    let peer = provenance
        .peer
        .map_or_else(|| "an unidentified peer".to_string(), |peer| peer.fingerprint().to_string());
    format!("I received \"{text}\" over the link from {peer}")
}

async fn report_loop(
    sessions: Arc<SessionManager>,
    name: String,
    first: Duration,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + first, interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut count: u64 = 0;

    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }
        count += 1;
        let message = format!("{name} check-in #{count}");
        let roles = sessions.active_roles().await;
        if roles.is_empty() {
            tracing::debug!("No active uplinks for check-in #{}", count);
        }
        for role in roles {
            match sessions.send(&Target::Role(role.clone()), message.as_str()).await {
                Ok(()) => tracing::info!("Check-in #{} sent to {}", count, role),
                Err(e) => tracing::warn!("Check-in #{} to {} failed: {}", count, role, e),
            }
        }
    }
    tracing::debug!("Reporter stopped after {} check-ins", count);
}
