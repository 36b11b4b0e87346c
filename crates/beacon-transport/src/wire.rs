//! Packet encoding and decoding for the beacon mesh.
//!
//! Every frame starts with one packet-type byte. Link data packets carry
//! the link id, a context byte, a random nonce and the sealed payload; the
//! context byte and link id are bound into the AEAD as associated data.
//! All multi-byte integers are big-endian.

use crate::announce::{Announce, RANDOM_HASH_LEN};
use crate::transport::LinkId;
use beacon_crypto::aead::{NONCE_SIZE, Nonce, TAG_SIZE};
use beacon_crypto::hash::NAME_HASH_LEN;
use beacon_crypto::identity::PUBLIC_IDENTITY_LEN;
use beacon_crypto::signatures::SIGNATURE_SIZE;
use beacon_crypto::{Fingerprint, PublicIdentity, Signature};

/// Largest frame the medium carries.
pub const MTU: usize = 500;

/// Fixed bytes of a link data packet: type, link id, context, nonce, tag.
pub const LINK_DATA_OVERHEAD: usize = 1 + LinkId::LEN + 1 + NONCE_SIZE + TAG_SIZE;

/// Largest application payload one link packet carries.
pub const LINK_MDU: usize = MTU - LINK_DATA_OVERHEAD;

/// Length of an X25519 public key on the wire
pub const EPHEMERAL_KEY_LEN: usize = 32;

/// Random bytes in a link request
pub const REQUEST_RANDOM_LEN: usize = 16;

/// Random tag in a path request
pub const PATH_TAG_LEN: usize = 16;

const ADDRESS_LEN: usize = 16;

/// Wire codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    /// Frame too short to parse
    #[error("frame too short: expected at least {expected}, got {actual}")]
    TooShort {
        /// Expected minimum size
        expected: usize,
        /// Actual size received
        actual: usize,
    },

    /// Unknown packet type byte
    #[error("invalid packet type: 0x{0:02X}")]
    InvalidPacketType(u8),

    /// Unknown link context byte
    #[error("invalid link context: 0x{0:02X}")]
    InvalidContext(u8),

    /// Fixed-size packet had trailing bytes
    #[error("unexpected trailing bytes: {0}")]
    TrailingBytes(usize),

    /// Embedded public identity did not parse
    #[error("invalid public identity")]
    InvalidIdentity,

    /// Encoded frame would exceed the MTU
    #[error("frame of {size} bytes exceeds MTU of {mtu}")]
    Oversized {
        /// Encoded size
        size: usize,
        /// Medium MTU
        mtu: usize,
    },
}

/// Packet types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Signed endpoint announce
    Announce = 0x01,
    /// Ask the owner of an address to announce
    PathRequest = 0x02,
    /// Open a link
    LinkRequest = 0x03,
    /// Destination's answer to a link request
    LinkProof = 0x04,
    /// Sealed traffic on an existing link
    LinkData = 0x05,
}

impl TryFrom<u8> for PacketType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Announce),
            0x02 => Ok(Self::PathRequest),
            0x03 => Ok(Self::LinkRequest),
            0x04 => Ok(Self::LinkProof),
            0x05 => Ok(Self::LinkData),
            _ => Err(WireError::InvalidPacketType(value)),
        }
    }
}

/// What a link data packet carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum LinkContext {
    /// Application payload
    Data = 0x00,
    /// Initiator confirms the proof; completes the responder's handshake
    Rtt = 0x01,
    /// Identity proof from one side of the link
    Identify = 0x02,
    /// Liveness probe or reply
    Keepalive = 0x03,
    /// Teardown notice
    Close = 0x04,
}

impl TryFrom<u8> for LinkContext {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Data),
            0x01 => Ok(Self::Rtt),
            0x02 => Ok(Self::Identify),
            0x03 => Ok(Self::Keepalive),
            0x04 => Ok(Self::Close),
            _ => Err(WireError::InvalidContext(value)),
        }
    }
}

/// A decoded packet
#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Signed announce
    Announce(Announce),

    /// Path request
    PathRequest {
        /// Address being looked for
        target: Fingerprint,
        /// Random tag so repeated requests are not suppressed as duplicates
        tag: [u8; PATH_TAG_LEN],
    },

    /// Link request
    LinkRequest {
        /// Endpoint being linked to
        destination: Fingerprint,
        /// Initiator's ephemeral X25519 key
        ephemeral: [u8; EPHEMERAL_KEY_LEN],
        /// Request randomness
        random: [u8; REQUEST_RANDOM_LEN],
    },

    /// Link proof
    LinkProof {
        /// Link being proven
        link: LinkId,
        /// Destination's ephemeral X25519 key
        ephemeral: [u8; EPHEMERAL_KEY_LEN],
        /// Destination signature over link id and both ephemeral keys
        signature: Signature,
    },

    /// Sealed link traffic
    LinkData {
        /// Link
        link: LinkId,
        /// Context
        context: LinkContext,
        /// AEAD nonce
        nonce: Nonce,
        /// Ciphertext with tag
        ciphertext: Vec<u8>,
    },
}

impl Packet {
    /// Packet type of this packet
    #[must_use]
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Announce(_) => PacketType::Announce,
            Self::PathRequest { .. } => PacketType::PathRequest,
            Self::LinkRequest { .. } => PacketType::LinkRequest,
            Self::LinkProof { .. } => PacketType::LinkProof,
            Self::LinkData { .. } => PacketType::LinkData,
        }
    }

    /// Encode to bytes.
    ///
    /// # Errors
    /// Returns `WireError::Oversized` if the frame exceeds [`MTU`].
    pub fn encode(&self) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(MTU);
        out.push(self.packet_type() as u8);

        match self {
            Self::Announce(announce) => {
                out.extend_from_slice(announce.destination.as_bytes());
                out.extend_from_slice(&announce.identity.to_bytes());
                out.extend_from_slice(&announce.name_hash);
                out.extend_from_slice(&announce.random_hash);
                out.extend_from_slice(announce.signature.as_bytes());
                out.extend_from_slice(&announce.app_data);
            }
            Self::PathRequest { target, tag } => {
                out.extend_from_slice(target.as_bytes());
                out.extend_from_slice(tag);
            }
            Self::LinkRequest {
                destination,
                ephemeral,
                random,
            } => {
                out.extend_from_slice(destination.as_bytes());
                out.extend_from_slice(ephemeral);
                out.extend_from_slice(random);
            }
            Self::LinkProof {
                link,
                ephemeral,
                signature,
            } => {
                out.extend_from_slice(link.as_bytes());
                out.extend_from_slice(ephemeral);
                out.extend_from_slice(signature.as_bytes());
            }
            Self::LinkData {
                link,
                context,
                nonce,
                ciphertext,
            } => {
                out.extend_from_slice(link.as_bytes());
                out.push(*context as u8);
                out.extend_from_slice(nonce.as_bytes());
                out.extend_from_slice(ciphertext);
            }
        }

        if out.len() > MTU {
            return Err(WireError::Oversized {
                size: out.len(),
                mtu: MTU,
            });
        }
        Ok(out)
    }

    /// Decode from bytes.
    ///
    /// # Errors
    /// Returns `WireError` if the frame is truncated or carries unknown types.
    pub fn decode(data: &[u8]) -> Result<Self, WireError> {
        let mut reader = Reader::new(data);
        let packet_type = PacketType::try_from(reader.array::<1>()?[0])?;

        let packet = match packet_type {
            PacketType::Announce => {
                let destination = Fingerprint::from_bytes(reader.array::<ADDRESS_LEN>()?);
                let identity = PublicIdentity::from_bytes(reader.take(PUBLIC_IDENTITY_LEN)?)
                    .map_err(|_| WireError::InvalidIdentity)?;
                let name_hash = reader.array::<NAME_HASH_LEN>()?;
                let random_hash = reader.array::<RANDOM_HASH_LEN>()?;
                let signature = Signature::from_bytes(reader.array::<SIGNATURE_SIZE>()?);
                let app_data = reader.rest().to_vec();
                return Ok(Self::Announce(Announce {
                    destination,
                    identity,
                    name_hash,
                    random_hash,
                    app_data,
                    signature,
                }));
            }
            PacketType::PathRequest => Self::PathRequest {
                target: Fingerprint::from_bytes(reader.array::<ADDRESS_LEN>()?),
                tag: reader.array::<PATH_TAG_LEN>()?,
            },
            PacketType::LinkRequest => Self::LinkRequest {
                destination: Fingerprint::from_bytes(reader.array::<ADDRESS_LEN>()?),
                ephemeral: reader.array::<EPHEMERAL_KEY_LEN>()?,
                random: reader.array::<REQUEST_RANDOM_LEN>()?,
            },
            PacketType::LinkProof => Self::LinkProof {
                link: LinkId::from_bytes(reader.array::<{ LinkId::LEN }>()?),
                ephemeral: reader.array::<EPHEMERAL_KEY_LEN>()?,
                signature: Signature::from_bytes(reader.array::<SIGNATURE_SIZE>()?),
            },
            PacketType::LinkData => {
                let link = LinkId::from_bytes(reader.array::<{ LinkId::LEN }>()?);
                let context = LinkContext::try_from(reader.array::<1>()?[0])?;
                let nonce = Nonce::from_bytes(reader.array::<NONCE_SIZE>()?);
                if reader.remaining() < TAG_SIZE {
                    return Err(WireError::TooShort {
                        expected: LINK_DATA_OVERHEAD,
                        actual: data.len(),
                    });
                }
                return Ok(Self::LinkData {
                    link,
                    context,
                    nonce,
                    ciphertext: reader.rest().to_vec(),
                });
            }
        };

        match reader.remaining() {
            0 => Ok(packet),
            n => Err(WireError::TrailingBytes(n)),
        }
    }
}

/// Bounds-checked cursor over a frame
struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], WireError> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(WireError::TooShort {
                expected: end,
                actual: self.data.len(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N], WireError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.pos..];
        self.pos = self.data.len();
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use beacon_crypto::Identity;
    use rand_core::OsRng;

    #[test]
    fn test_link_mdu_value() {
        assert_eq!(LINK_DATA_OVERHEAD, 58);
        assert_eq!(LINK_MDU, 442);
    }

    #[test]
    fn test_packet_type_from_u8() {
        assert_eq!(PacketType::try_from(0x01).unwrap(), PacketType::Announce);
        assert_eq!(PacketType::try_from(0x05).unwrap(), PacketType::LinkData);
        assert_eq!(
            PacketType::try_from(0x00),
            Err(WireError::InvalidPacketType(0x00))
        );
        assert_eq!(
            LinkContext::try_from(0x09),
            Err(WireError::InvalidContext(0x09))
        );
    }

    #[test]
    fn test_announce_survives_encoding() {
        let identity = Identity::generate();
        let endpoint = Endpoint::new(*identity.public(), "lorabeacon", &["uplink"]).unwrap();
        let announce = Announce::create(&endpoint, &identity, b"Station 7");

        let bytes = Packet::Announce(announce.clone()).encode().unwrap();
        match Packet::decode(&bytes).unwrap() {
            Packet::Announce(decoded) => {
                assert_eq!(decoded, announce);
                assert!(decoded.validate().is_ok());
            }
            other => panic!("unexpected packet {other:?}"),
        }
    }

    #[test]
    fn test_full_link_data_packet_fits_mtu() {
        let packet = Packet::LinkData {
            link: LinkId::from_bytes([1; 16]),
            context: LinkContext::Data,
            nonce: Nonce::generate(&mut OsRng),
            ciphertext: vec![0u8; LINK_MDU + TAG_SIZE],
        };
        assert_eq!(packet.encode().unwrap().len(), MTU);

        let oversized = Packet::LinkData {
            link: LinkId::from_bytes([1; 16]),
            context: LinkContext::Data,
            nonce: Nonce::generate(&mut OsRng),
            ciphertext: vec![0u8; LINK_MDU + TAG_SIZE + 1],
        };
        assert_eq!(
            oversized.encode(),
            Err(WireError::Oversized {
                size: MTU + 1,
                mtu: MTU
            })
        );
    }

    #[test]
    fn test_truncated_frames_rejected() {
        let packet = Packet::LinkRequest {
            destination: Fingerprint::from_bytes([2; 16]),
            ephemeral: [3; 32],
            random: [4; 16],
        };
        let bytes = packet.encode().unwrap();
        assert_eq!(Packet::decode(&bytes).unwrap(), packet);
        assert!(matches!(
            Packet::decode(&bytes[..bytes.len() - 1]),
            Err(WireError::TooShort { .. })
        ));

        let mut padded = bytes.clone();
        padded.push(0);
        assert_eq!(Packet::decode(&padded), Err(WireError::TrailingBytes(1)));
    }

    #[test]
    fn test_link_data_without_tag_rejected() {
        let mut bytes = vec![PacketType::LinkData as u8];
        bytes.extend_from_slice(&[0u8; 16]);
        bytes.push(LinkContext::Data as u8);
        bytes.extend_from_slice(&[0u8; NONCE_SIZE]);
        bytes.extend_from_slice(&[0u8; TAG_SIZE - 1]);
        assert!(matches!(
            Packet::decode(&bytes),
            Err(WireError::TooShort { .. })
        ));
    }

    #[test]
    fn test_empty_frame_rejected() {
        assert!(matches!(
            Packet::decode(&[]),
            Err(WireError::TooShort { .. })
        ));
    }

    proptest::proptest! {
        #[test]
        fn prop_decode_never_panics(bytes in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..600)) {
            let _ = Packet::decode(&bytes);
        }

        #[test]
        fn prop_unknown_packet_type_rejected(first in 6u8.., rest in proptest::collection::vec(proptest::prelude::any::<u8>(), 0..64)) {
            let mut bytes = vec![first];
            bytes.extend(rest);
            proptest::prop_assert!(Packet::decode(&bytes).is_err());
        }
    }
}
