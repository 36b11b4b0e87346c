//! Message framing.
//!
//! Every message is exactly one link packet. Text goes out as UTF-8, binary
//! passes through untouched, and anything larger than the link MDU is
//! refused outright rather than split or truncated.

use crate::error::{BeaconError, Result};
use std::borrow::Cow;

/// Outbound application payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// UTF-8 text
    Text(String),
    /// Opaque bytes
    Binary(Vec<u8>),
}

impl Payload {
    /// Wire bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Payload::Text(text) => text.as_bytes(),
            Payload::Binary(bytes) => bytes,
        }
    }

    /// Encoded length in bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    /// Whether the payload is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode, refusing anything over `mdu`.
    ///
    /// # Errors
    ///
    /// Returns [`BeaconError::PayloadTooLarge`] if the encoded payload does
    /// not fit in one packet.
    pub fn encode(&self, mdu: usize) -> Result<&[u8]> {
        check_mdu(self.len(), mdu)?;
        Ok(self.as_bytes())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.to_string())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text)
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Binary(bytes)
    }
}

/// Reject sizes over `mdu`.
///
/// # Errors
///
/// Returns [`BeaconError::PayloadTooLarge`] when `size > mdu`.
pub fn check_mdu(size: usize, mdu: usize) -> Result<()> {
    if size > mdu {
        return Err(BeaconError::PayloadTooLarge { size, mdu });
    }
    Ok(())
}

/// Decode inbound bytes as text, replacing invalid sequences.
#[must_use]
pub fn decode_text(bytes: &[u8]) -> Cow<'_, str> {
    let text = String::from_utf8_lossy(bytes);
    if let Cow::Owned(_) = text {
        tracing::debug!("Inbound message had invalid UTF-8, replaced");
    }
    text
}
