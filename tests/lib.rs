//! Fixtures shared by the integration tests.
//!
//! A [`TestNode`] is a complete beacon (mesh transport, storage, recorder,
//! session manager) attached to an in-process [`MemoryHub`].

use beacon_core::{BeaconConfig, BeaconNode, SessionEvent, StoragePaths};
use beacon_transport::{MemoryHub, MemoryMedium, MeshConfig, MeshTransport};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

/// How long a test waits for any single event
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// Mesh timers short enough for tests
#[must_use]
pub fn test_mesh_config() -> MeshConfig {
    MeshConfig {
        establishment_timeout: Duration::from_secs(2),
        housekeeping_interval: Duration::from_millis(50),
        ..MeshConfig::default()
    }
}

/// Configuration with the audit record switched on and no reporter
#[must_use]
pub fn test_config(name: &str) -> BeaconConfig {
    BeaconConfig {
        name: name.to_string(),
        report_time: 0,
        use_record_file: true,
        ..BeaconConfig::default()
    }
}

/// One beacon on a shared hub
pub struct TestNode {
    /// The node under test
    pub node: BeaconNode,
    /// Its application events
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    /// Its radio, for range control
    pub medium: Arc<MemoryMedium>,
    /// Its transport, for statistics
    pub transport: Arc<MeshTransport>,
    dir: TempDir,
}

impl TestNode {
    /// Start a node with [`test_config`]
    pub fn start(hub: &MemoryHub, name: &str) -> Self {
        Self::start_with(hub, test_config(name))
    }

    /// Start a node with `config` in a fresh storage directory
    pub fn start_with(hub: &MemoryHub, config: BeaconConfig) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let medium = Arc::new(hub.attach());
        let transport = Arc::new(MeshTransport::start(medium.clone(), test_mesh_config()));
        let node = BeaconNode::start(
            config,
            StoragePaths::new(dir.path()),
            transport.clone(),
        )
        .expect("node start");
        let events = node.sessions().take_events().expect("event stream");
        Self {
            node,
            events,
            medium,
            transport,
            dir,
        }
    }

    /// Storage root
    #[must_use]
    pub fn storage(&self) -> &Path {
        self.dir.path()
    }

    /// Contents of every record file, concatenated
    #[must_use]
    pub fn records(&self) -> String {
        let mut all = String::new();
        let Ok(entries) = std::fs::read_dir(self.dir.path()) else {
            return all;
        };
        for entry in entries.flatten() {
            let is_record = entry.file_name().to_string_lossy().starts_with("record");
            if is_record {
                all.push_str(&std::fs::read_to_string(entry.path()).unwrap_or_default());
            }
        }
        all
    }

    /// Record contents once every line queued so far is written
    pub async fn flushed_records(&self) -> String {
        self.node.sessions().flush_records().await;
        self.records()
    }

    /// Next application event; panics after [`EVENT_TIMEOUT`]
    pub async fn next_event(&mut self) -> SessionEvent {
        tokio::time::timeout(EVENT_TIMEOUT, self.events.recv())
            .await
            .expect("timed out waiting for a session event")
            .expect("session event stream closed")
    }

    /// Skip events until one matches
    pub async fn wait_for(&mut self, mut matches: impl FnMut(&SessionEvent) -> bool) -> SessionEvent {
        loop {
            let event = self.next_event().await;
            if matches(&event) {
                return event;
            }
        }
    }
}

/// Poll `check` until it holds; panics after [`EVENT_TIMEOUT`]
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition never became true"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
