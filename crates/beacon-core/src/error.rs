//! Error types for the beacon core
//!
//! Errors fall into two groups:
//!
//! - **Fatal**: the node cannot safely run (corrupt identity, invalid
//!   configuration). Only these terminate the process.
//! - **Recoverable**: the caller decides what to do (retry a path, reconnect
//!   a link, shorten a message). Transport and persistence failures are in
//!   this group and are normally logged rather than surfaced.

use beacon_crypto::{CryptoError, Fingerprint};
use beacon_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Errors produced by the beacon core
#[derive(Debug, Error, Clone, PartialEq)]
pub enum BeaconError {
    // ============ Startup Errors ============
    /// Identity file exists but cannot be parsed
    #[error("Corrupt identity: {0}")]
    CorruptIdentity(Cow<'static, str>),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),

    // ============ Path Errors ============
    /// No path to the destination appeared in time
    #[error("Path to {0} timed out")]
    PathTimedOut(Fingerprint),

    // ============ Link Errors ============
    /// Payload exceeds the link MDU
    #[error("Payload too large: {size} bytes exceeds MDU of {mdu}")]
    PayloadTooLarge {
        /// Offered payload size
        size: usize,
        /// Link MDU
        mdu: usize,
    },

    /// Link exists but is not ACTIVE, or no link is tracked for the target
    #[error("Link not active: {0}")]
    LinkNotActive(Cow<'static, str>),

    /// No link has ever been tracked under this role
    #[error("Unknown role: {0}")]
    UnknownRole(String),

    /// Operation was cancelled by a teardown
    #[error("Operation cancelled")]
    Cancelled,

    // ============ Collaborator Errors ============
    /// Transport operation failed
    #[error("Transport error: {0}")]
    Transport(Cow<'static, str>),

    /// Cryptographic operation failed
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Save or audit write failed
    #[error("Persistence error: {0}")]
    Persistence(Cow<'static, str>),

    /// File I/O error
    #[error("File I/O error: {0}")]
    Io(String),
}

impl BeaconError {
    /// Returns true if the node cannot continue
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BeaconError::CorruptIdentity(_) | BeaconError::InvalidConfig(_)
        )
    }

    /// Returns true if the caller may retry or carry on
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        !self.is_fatal()
    }

    /// Create a transport error with static context (zero allocation)
    #[must_use]
    pub const fn transport(context: &'static str) -> Self {
        BeaconError::Transport(Cow::Borrowed(context))
    }

    /// Create a link-not-active error with static context (zero allocation)
    #[must_use]
    pub const fn link_not_active(context: &'static str) -> Self {
        BeaconError::LinkNotActive(Cow::Borrowed(context))
    }

    /// Create a persistence error with static context (zero allocation)
    #[must_use]
    pub const fn persistence(context: &'static str) -> Self {
        BeaconError::Persistence(Cow::Borrowed(context))
    }

    /// Create an invalid configuration error with static context (zero allocation)
    #[must_use]
    pub const fn invalid_config(context: &'static str) -> Self {
        BeaconError::InvalidConfig(Cow::Borrowed(context))
    }
}

impl From<CryptoError> for BeaconError {
    fn from(err: CryptoError) -> Self {
        BeaconError::Crypto(err.to_string())
    }
}

impl From<std::io::Error> for BeaconError {
    fn from(err: std::io::Error) -> Self {
        BeaconError::Io(err.to_string())
    }
}

impl From<TransportError> for BeaconError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::PayloadTooLarge { size, mdu } => {
                BeaconError::PayloadTooLarge { size, mdu }
            }
            TransportError::NoPath(destination) => BeaconError::PathTimedOut(destination),
            other => BeaconError::Transport(Cow::Owned(other.to_string())),
        }
    }
}

/// Result type for beacon core operations
pub type Result<T> = std::result::Result<T, BeaconError>;
