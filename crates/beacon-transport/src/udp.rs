//! UDP multicast medium.
//!
//! Stands in for a shared LoRa channel on an IP network: every node joins
//! the same IPv4 multicast group and hears every frame. Loopback stays on
//! so several nodes can share one host; the mesh drops its own echoes.

use crate::medium::{Medium, ReceivedFrame};
use crate::transport::{SignalQuality, TransportError, TransportResult};
use crate::wire::MTU;
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::net::UdpSocket;

/// Default multicast group
pub const DEFAULT_GROUP: Ipv4Addr = Ipv4Addr::new(239, 66, 67, 1);

/// Default UDP port
pub const DEFAULT_PORT: u16 = 4242;

/// Multicast group settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UdpMediumConfig {
    /// Multicast group address
    pub group: Ipv4Addr,
    /// UDP port shared by all nodes
    pub port: u16,
    /// Local interface to join on
    pub interface: Ipv4Addr,
    /// Multicast TTL
    pub ttl: u32,
}

impl Default for UdpMediumConfig {
    fn default() -> Self {
        Self {
            group: DEFAULT_GROUP,
            port: DEFAULT_PORT,
            interface: Ipv4Addr::UNSPECIFIED,
            ttl: 1,
        }
    }
}

/// Medium over a UDP multicast group.
pub struct UdpMedium {
    socket: UdpSocket,
    group: SocketAddr,
}

impl UdpMedium {
    /// Bind the shared port and join the multicast group.
    ///
    /// # Errors
    /// Returns `TransportError::BindFailed` if any socket option or the bind fails
    pub fn bind(config: UdpMediumConfig) -> TransportResult<Self> {
        if !config.group.is_multicast() {
            return Err(TransportError::BindFailed(format!(
                "{} is not a multicast address",
                config.group
            )));
        }
        let bind_failed = |e: std::io::Error| TransportError::BindFailed(e.to_string());

        let socket = socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(socket2::Protocol::UDP),
        )
        .map_err(bind_failed)?;

        // Several nodes on one host share the port
        socket.set_reuse_address(true).map_err(bind_failed)?;

        let local = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket.bind(&local.into()).map_err(bind_failed)?;
        socket
            .join_multicast_v4(&config.group, &config.interface)
            .map_err(bind_failed)?;
        socket.set_multicast_loop_v4(true).map_err(bind_failed)?;
        socket.set_multicast_ttl_v4(config.ttl).map_err(bind_failed)?;

        socket.set_nonblocking(true).map_err(bind_failed)?;
        let std_socket: std::net::UdpSocket = socket.into();
        let socket = UdpSocket::from_std(std_socket).map_err(bind_failed)?;

        tracing::info!(
            "Joined multicast group {}:{} on {}",
            config.group,
            config.port,
            config.interface
        );

        Ok(Self {
            socket,
            group: SocketAddrV4::new(config.group, config.port).into(),
        })
    }
}

#[async_trait]
impl Medium for UdpMedium {
    async fn transmit(&self, frame: &[u8]) -> TransportResult<()> {
        if frame.len() > MTU {
            return Err(TransportError::Other(format!(
                "frame of {} bytes exceeds MTU",
                frame.len()
            )));
        }
        self.socket.send_to(frame, self.group).await?;
        Ok(())
    }

    async fn receive(&self) -> TransportResult<ReceivedFrame> {
        let mut buf = vec![0u8; MTU * 2];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            if len > MTU {
                tracing::debug!("Dropping {} byte datagram from {}", len, from);
                continue;
            }
            return Ok(ReceivedFrame {
                bytes: buf[..len].to_vec(),
                signal: SignalQuality::default(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UdpMediumConfig::default();
        assert!(config.group.is_multicast());
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.ttl, 1);
    }

    #[tokio::test]
    async fn test_unicast_group_rejected() {
        let config = UdpMediumConfig {
            group: Ipv4Addr::LOCALHOST,
            ..UdpMediumConfig::default()
        };
        assert!(matches!(
            UdpMedium::bind(config),
            Err(TransportError::BindFailed(_))
        ));
    }
}
