//! Transport capability consumed by the beacon core.
//!
//! The core never touches radios or sockets directly. Everything it needs
//! from the mesh (path discovery, announces, encrypted links) goes through
//! the [`Transport`] trait, and everything the mesh has to tell the core
//! arrives as a [`TransportEvent`] on a single ordered channel.

use crate::endpoint::Endpoint;
use crate::wire::WireError;
use async_trait::async_trait;
use beacon_crypto::{CryptoError, Fingerprint, Identity, PublicIdentity};
use std::fmt;
use std::io;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying medium
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Transport is closed
    #[error("Transport is closed")]
    Closed,

    /// Medium could not be bound
    #[error("Failed to bind medium: {0}")]
    BindFailed(String),

    /// Frame could not be decoded or encoded
    #[error("Malformed packet: {0}")]
    Malformed(#[from] WireError),

    /// No path is known for the destination
    #[error("No path to destination {0}")]
    NoPath(Fingerprint),

    /// Announce or path operation targeted an endpoint this node does not host
    #[error("Endpoint {0} is not registered locally")]
    UnknownEndpoint(Fingerprint),

    /// Link id is not known to the transport
    #[error("Unknown link {0}")]
    UnknownLink(LinkId),

    /// Link exists but has not finished its handshake
    #[error("Link {0} is not established")]
    LinkNotEstablished(LinkId),

    /// Payload does not fit into one link packet
    #[error("Payload of {size} bytes exceeds link MDU of {mdu} bytes")]
    PayloadTooLarge {
        /// Offered payload size
        size: usize,
        /// Link MDU
        mdu: usize,
    },

    /// Endpoint name components are not acceptable
    #[error("Invalid endpoint name: {0}")]
    InvalidEndpoint(String),

    /// Cryptographic failure while sealing or proving
    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Transport-specific error
    #[error("Transport error: {0}")]
    Other(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Opaque link identifier, derived from the link request.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId([u8; 16]);

impl LinkId {
    /// Link id length in bytes
    pub const LEN: usize = 16;

    /// Wrap raw bytes
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// Raw bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LinkId({})", hex::encode(self.0))
    }
}

/// Radio signal quality attached to a received frame.
///
/// Either value may be missing: an IP medium has neither.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SignalQuality {
    /// Received signal strength in dBm
    pub rssi: Option<i16>,
    /// Signal-to-noise ratio in dB
    pub snr: Option<f32>,
}

impl SignalQuality {
    /// Both values present
    #[must_use]
    pub const fn new(rssi: i16, snr: f32) -> Self {
        Self {
            rssi: Some(rssi),
            snr: Some(snr),
        }
    }
}

/// Why the transport tore a link down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Handshake or keepalive timer expired
    Timeout,
    /// The destination side sent a close
    DestinationClosed,
    /// The initiating side sent a close
    InitiatorClosed,
    /// This node called [`Transport::close_link`]
    Local,
    /// Transport-level failure with no better explanation
    Failed,
}

/// Notifications delivered by a transport, in arrival order.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A valid announce was received
    AnnounceReceived {
        /// Announced endpoint address
        destination: Fingerprint,
        /// Public identity bound to the address
        identity: PublicIdentity,
        /// Application data carried by the announce
        app_data: Vec<u8>,
        /// Hops to the announcer
        hops: u8,
        /// Signal of the announce frame
        signal: SignalQuality,
    },

    /// A peer asked to open a link to one of our endpoints
    LinkRequested {
        /// New link
        link: LinkId,
        /// Our endpoint the request targets
        destination: Fingerprint,
    },

    /// Our link request went out; waiting for the proof
    HandshakeStarted {
        /// Link being opened
        link: LinkId,
    },

    /// Handshake finished, data may flow
    LinkEstablished {
        /// Established link
        link: LinkId,
        /// Largest payload one packet can carry on this link
        mdu: usize,
    },

    /// Remote side proved its identity on this link
    RemoteIdentified {
        /// Link concerned
        link: LinkId,
        /// Proven identity
        identity: PublicIdentity,
    },

    /// Decrypted application payload
    Packet {
        /// Link it arrived on
        link: LinkId,
        /// Plaintext
        payload: Vec<u8>,
        /// Signal of the carrying frame
        signal: SignalQuality,
    },

    /// Link is gone
    LinkClosed {
        /// Closed link
        link: LinkId,
        /// Why
        reason: CloseReason,
    },
}

/// Capability interface to the mesh.
///
/// Implementations must be cheap to share behind an `Arc` and must deliver
/// every [`TransportEvent`] for a given link in the order it happened.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Whether a path to `destination` is currently known.
    fn has_path(&self, destination: &Fingerprint) -> bool;

    /// Broadcast a path request for `destination`.
    ///
    /// # Errors
    /// Returns `TransportError` if the request cannot be transmitted
    async fn request_path(&self, destination: &Fingerprint) -> TransportResult<()>;

    /// Public identity last announced for `destination`, if any.
    fn recall(&self, destination: &Fingerprint) -> Option<PublicIdentity>;

    /// Seed the path table from a persisted cache.
    ///
    /// Never overrides a path learned live.
    fn restore_path(&self, destination: Fingerprint, identity: PublicIdentity, hops: u8);

    /// Host `endpoint` on this node so it can be announced and linked to.
    ///
    /// # Errors
    /// Returns `TransportError::InvalidEndpoint` if `identity` does not own `endpoint`
    fn register_endpoint(&self, endpoint: Endpoint, identity: Arc<Identity>)
    -> TransportResult<()>;

    /// Announce a locally hosted endpoint with optional application data.
    ///
    /// # Errors
    /// Returns `TransportError::UnknownEndpoint` if the endpoint is not registered
    async fn announce(&self, destination: &Fingerprint, app_data: &[u8]) -> TransportResult<()>;

    /// Start a link handshake towards `endpoint`.
    ///
    /// Returns as soon as the request is on the air; establishment is
    /// reported through [`TransportEvent::LinkEstablished`].
    ///
    /// # Errors
    /// Returns `TransportError::NoPath` if the destination is unknown
    async fn open_link(&self, endpoint: &Endpoint) -> TransportResult<LinkId>;

    /// Prove `identity` to the remote side of an established link.
    ///
    /// # Errors
    /// Returns `TransportError::LinkNotEstablished` before the handshake completes
    async fn identify(&self, link: LinkId, identity: &Identity) -> TransportResult<()>;

    /// Send one payload over an established link.
    ///
    /// # Errors
    /// Returns `TransportError::PayloadTooLarge` if the payload exceeds
    /// [`Transport::link_mdu`]
    async fn send(&self, link: LinkId, payload: &[u8]) -> TransportResult<()>;

    /// Tear a link down and notify the remote side.
    ///
    /// # Errors
    /// Returns `TransportError::UnknownLink` if the link does not exist
    async fn close_link(&self, link: LinkId) -> TransportResult<()>;

    /// Largest payload a single link packet carries.
    fn link_mdu(&self) -> usize;

    /// Hand out the event stream.
    ///
    /// Only one subscriber is served; a second call replaces the first.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;

    /// Get transport statistics (optional).
    fn stats(&self) -> TransportStats {
        TransportStats::default()
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Frames put on the medium
    pub frames_sent: u64,
    /// Frames taken off the medium
    pub frames_received: u64,
    /// Frames dropped as duplicates or own echoes
    pub frames_duplicate: u64,
    /// Frames that failed to decode or authenticate
    pub frames_rejected: u64,
    /// Links currently tracked
    pub links: usize,
    /// Destinations with a known path
    pub paths: usize,
}
