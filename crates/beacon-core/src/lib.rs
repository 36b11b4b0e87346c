//! # Beacon Core
//!
//! Link and path-discovery engine for the LoRa beacon node.
//!
//! This crate provides:
//! - Durable node identity and the known-destination cache
//! - Path resolution with a bounded, cancellable wait
//! - The link state machine
//! - Role-aware session management over any [`beacon_transport::Transport`]
//! - Message framing against the link MDU
//! - The audit record, configuration and persistence queue
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                       BeaconNode                                 │
//! │   (config, storage paths, recorder, persister, reporter)        │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                     SessionManager                               │
//! │   (role -> Link, inbound links, transport event dispatch)       │
//! ├───────────────────────────────┬─────────────────────────────────┤
//! │        PathResolver           │          IdentityStore           │
//! ├───────────────────────────────┴─────────────────────────────────┤
//! │                  Transport (beacon-transport)                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod framer;
pub mod identity_store;
pub mod link;
pub mod node;
pub mod path;
pub mod persist;
pub mod record;
pub mod session_manager;

pub use config::{BeaconConfig, StoragePaths};
pub use error::{BeaconError, Result};
pub use framer::Payload;
pub use identity_store::{IdentityStore, KnownDestination};
pub use link::{Link, LinkRole, LinkState, LinkStateMachine, TeardownReason};
pub use node::{BeaconNode, server_reply};
pub use path::{PathResolver, PathResult};
pub use persist::Persister;
pub use record::{RecordQueue, Recorder};
pub use session_manager::{Provenance, SessionEvent, SessionManager, Target};

/// Application namespace for endpoint names
pub const APP_NAME: &str = "lorabeacon";

/// Aspect of the endpoint servers expose to uplinks
pub const ASPECT: &str = "uplink";

/// Role name of the mandatory uplink
pub const INCIDENT_COMMAND: &str = "IncidentCommand";

/// Role name of the optional uplink
pub const TEAM_LEAD: &str = "TeamLead";
