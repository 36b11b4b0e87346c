//! Broadcast media that carry raw frames.
//!
//! A medium is a shared channel every node hears: a LoRa radio in the
//! field, a UDP multicast group on a LAN ([`crate::udp::UdpMedium`]) or an
//! in-process hub for tests ([`MemoryHub`]).

use crate::transport::{SignalQuality, TransportError, TransportResult};
use crate::wire::MTU;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::broadcast;

/// A frame taken off the medium
#[derive(Debug, Clone)]
pub struct ReceivedFrame {
    /// Raw frame
    pub bytes: Vec<u8>,
    /// Signal quality, when the medium measures it
    pub signal: SignalQuality,
}

/// Shared broadcast medium.
#[async_trait]
pub trait Medium: Send + Sync {
    /// Put a frame on the air.
    ///
    /// # Errors
    /// Returns `TransportError` if the frame cannot be transmitted
    async fn transmit(&self, frame: &[u8]) -> TransportResult<()>;

    /// Wait for the next frame from another node.
    ///
    /// # Errors
    /// Returns `TransportError::Closed` once the medium is gone
    async fn receive(&self) -> TransportResult<ReceivedFrame>;

    /// Largest frame the medium carries
    fn mtu(&self) -> usize {
        MTU
    }
}

#[derive(Debug, Clone)]
struct HubFrame {
    sender: u64,
    bytes: Arc<Vec<u8>>,
    signal: SignalQuality,
}

/// In-process broadcast hub.
///
/// Every attached [`MemoryMedium`] hears every other one, never itself.
#[derive(Clone)]
pub struct MemoryHub {
    tx: broadcast::Sender<HubFrame>,
    next_id: Arc<AtomicU64>,
}

impl MemoryHub {
    /// Hub with room for `capacity` frames in flight per listener
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self {
            tx,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Attach a new node to the hub
    #[must_use]
    pub fn attach(&self) -> MemoryMedium {
        MemoryMedium {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            tx: self.tx.clone(),
            rx: tokio::sync::Mutex::new(self.tx.subscribe()),
            in_range: AtomicBool::new(true),
            signal: Mutex::new(SignalQuality::default()),
        }
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new(1024)
    }
}

/// One node's view of a [`MemoryHub`].
pub struct MemoryMedium {
    id: u64,
    tx: broadcast::Sender<HubFrame>,
    rx: tokio::sync::Mutex<broadcast::Receiver<HubFrame>>,
    in_range: AtomicBool,
    signal: Mutex<SignalQuality>,
}

impl MemoryMedium {
    /// Move the node out of (or back into) radio range.
    ///
    /// Out of range, transmissions are lost and nothing is heard.
    pub fn set_in_range(&self, in_range: bool) {
        self.in_range.store(in_range, Ordering::SeqCst);
    }

    /// Signal quality stamped on frames this node transmits
    pub fn set_signal(&self, signal: SignalQuality) {
        if let Ok(mut guard) = self.signal.lock() {
            *guard = signal;
        }
    }

    fn current_signal(&self) -> SignalQuality {
        self.signal.lock().map(|s| *s).unwrap_or_default()
    }
}

#[async_trait]
impl Medium for MemoryMedium {
    async fn transmit(&self, frame: &[u8]) -> TransportResult<()> {
        if frame.len() > MTU {
            return Err(TransportError::Other(format!(
                "frame of {} bytes exceeds MTU",
                frame.len()
            )));
        }
        if !self.in_range.load(Ordering::SeqCst) {
            return Ok(());
        }
        // No listeners is not an error on a broadcast medium.
        let _ = self.tx.send(HubFrame {
            sender: self.id,
            bytes: Arc::new(frame.to_vec()),
            signal: self.current_signal(),
        });
        Ok(())
    }

    async fn receive(&self) -> TransportResult<ReceivedFrame> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok(frame) => {
                    if frame.sender == self.id || !self.in_range.load(Ordering::SeqCst) {
                        continue;
                    }
                    return Ok(ReceivedFrame {
                        bytes: frame.bytes.as_ref().clone(),
                        signal: frame.signal,
                    });
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!("Memory medium {} lagged, lost {} frames", self.id, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_hub_delivers_to_others_only() {
        let hub = MemoryHub::default();
        let a = hub.attach();
        let b = hub.attach();

        a.transmit(b"hello").await.unwrap();
        let frame = b.receive().await.unwrap();
        assert_eq!(frame.bytes, b"hello");

        assert!(
            timeout(Duration::from_millis(50), a.receive())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_out_of_range_loses_frames() {
        let hub = MemoryHub::default();
        let a = hub.attach();
        let b = hub.attach();

        a.set_in_range(false);
        a.transmit(b"lost").await.unwrap();
        a.set_in_range(true);
        a.transmit(b"heard").await.unwrap();

        assert_eq!(b.receive().await.unwrap().bytes, b"heard");
    }

    #[tokio::test]
    async fn test_signal_is_stamped() {
        let hub = MemoryHub::default();
        let a = hub.attach();
        let b = hub.attach();

        a.set_signal(SignalQuality::new(-110, -3.5));
        a.transmit(b"x").await.unwrap();
        assert_eq!(
            b.receive().await.unwrap().signal,
            SignalQuality::new(-110, -3.5)
        );
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let hub = MemoryHub::default();
        let a = hub.attach();
        assert!(a.transmit(&vec![0u8; MTU + 1]).await.is_err());
    }
}
