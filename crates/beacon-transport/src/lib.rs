//! # Beacon Transport
//!
//! Mesh transport layer for the LoRa beacon.
//!
//! This crate provides:
//! - The [`Transport`] capability trait the beacon core is written against
//! - Endpoint naming and addressing
//! - Signed announces and path requests
//! - Encrypted point-to-point links with keepalive and teardown
//! - Broadcast media: UDP multicast and an in-process hub for tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod announce;
pub mod endpoint;
pub mod medium;
pub mod mesh;
pub mod transport;
pub mod udp;
pub mod wire;

pub use endpoint::Endpoint;
pub use medium::{Medium, MemoryHub, MemoryMedium, ReceivedFrame};
pub use mesh::{MeshConfig, MeshTransport};
pub use transport::{
    CloseReason, LinkId, SignalQuality, Transport, TransportError, TransportEvent,
    TransportResult, TransportStats,
};
pub use udp::{UdpMedium, UdpMediumConfig};
pub use wire::LINK_MDU;
