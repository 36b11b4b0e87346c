//! Single-hop mesh transport over a shared broadcast medium.
//!
//! [`MeshTransport`] implements [`Transport`] on top of any [`Medium`]:
//!
//! - **Paths** are learned from signed announces and can be solicited with
//!   path requests; a path is a known public identity for an address.
//! - **Links** use a three-packet handshake. The initiator sends an
//!   ephemeral X25519 key, the destination answers with its own ephemeral
//!   key and a signature over both, and the initiator confirms with a
//!   sealed RTT packet. Both sides derive the link key from the DH secret
//!   salted with the link id.
//! - **Liveness** is kept by initiator keepalives; a link with no inbound
//!   traffic for the stale time is torn down as timed out.
//!
//! Frames are de-duplicated by hash, which also drops our own echoes on
//! media that loop transmissions back.

use crate::announce::{Announce, AnnounceHistory};
use crate::endpoint::Endpoint;
use crate::medium::Medium;
use crate::transport::{
    CloseReason, LinkId, SignalQuality, Transport, TransportError, TransportEvent,
    TransportResult, TransportStats,
};
use crate::wire::{LINK_MDU, LinkContext, PATH_TAG_LEN, Packet, REQUEST_RANDOM_LEN};
use async_trait::async_trait;
use beacon_crypto::aead::{LinkKey, Nonce};
use beacon_crypto::hash::{Kdf, TRUNCATED_HASH_LEN, truncated_hash};
use beacon_crypto::identity::PUBLIC_IDENTITY_LEN;
use beacon_crypto::{CryptoError, Fingerprint, Identity, PublicIdentity, Signature, x25519};
use dashmap::DashMap;
use rand_core::{OsRng, RngCore};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

const LINK_KEY_CONTEXT: &str = "lorabeacon 2024-06 link key";

const KEEPALIVE_PROBE: u8 = 0xFF;
const KEEPALIVE_REPLY: u8 = 0xFE;

/// Mesh timing and bookkeeping settings
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Idle time after which the initiator sends a keepalive
    pub keepalive_interval: Duration,
    /// Silence after which an active link is torn down
    pub stale_time: Duration,
    /// Time a handshake may take before it is abandoned
    pub establishment_timeout: Duration,
    /// Housekeeping tick
    pub housekeeping_interval: Duration,
    /// Frame hashes remembered for duplicate suppression
    pub dedup_capacity: usize,
    /// Announce random hashes remembered per destination
    pub announce_history: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: Duration::from_secs(360),
            stale_time: Duration::from_secs(720),
            establishment_timeout: Duration::from_secs(15),
            housekeeping_interval: Duration::from_secs(1),
            dedup_capacity: 1024,
            announce_history: 32,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Initiator,
    Responder,
}

impl Side {
    fn as_byte(self) -> u8 {
        match self {
            Self::Initiator => 0x01,
            Self::Responder => 0x02,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingProof,
    AwaitingRtt,
    Active,
}

struct LinkEntry {
    side: Side,
    phase: Phase,
    peer: Option<PublicIdentity>,
    ephemeral: Option<x25519::PrivateKey>,
    link_key: Option<LinkKey>,
    opened_at: Instant,
    last_inbound: Instant,
    last_outbound: Instant,
}

impl LinkEntry {
    fn new(side: Side, phase: Phase) -> Self {
        let now = Instant::now();
        Self {
            side,
            phase,
            peer: None,
            ephemeral: None,
            link_key: None,
            opened_at: now,
            last_inbound: now,
            last_outbound: now,
        }
    }
}

struct PathEntry {
    identity: PublicIdentity,
    hops: u8,
    history: AnnounceHistory,
}

struct LocalEndpoint {
    endpoint: Endpoint,
    identity: Arc<Identity>,
    app_data: Vec<u8>,
}

struct EventChannel {
    tx: mpsc::UnboundedSender<TransportEvent>,
    rx: Option<mpsc::UnboundedReceiver<TransportEvent>>,
}

/// Bounded set of recently seen frame hashes
struct FrameFilter {
    seen: HashSet<[u8; TRUNCATED_HASH_LEN]>,
    order: VecDeque<[u8; TRUNCATED_HASH_LEN]>,
    capacity: usize,
}

impl FrameFilter {
    fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Returns false if the digest was already present
    fn insert(&mut self, digest: [u8; TRUNCATED_HASH_LEN]) -> bool {
        if !self.seen.insert(digest) {
            return false;
        }
        self.order.push_back(digest);
        if self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }
}

#[derive(Default)]
struct Counters {
    sent: AtomicU64,
    received: AtomicU64,
    duplicate: AtomicU64,
    rejected: AtomicU64,
}

struct Shared {
    medium: Arc<dyn Medium>,
    config: MeshConfig,
    paths: DashMap<Fingerprint, PathEntry>,
    endpoints: DashMap<Fingerprint, LocalEndpoint>,
    links: DashMap<LinkId, LinkEntry>,
    events: Mutex<EventChannel>,
    filter: Mutex<FrameFilter>,
    counters: Counters,
}

/// Mesh transport running over a broadcast medium.
///
/// Owns a receive task and a housekeeping task; both stop when the
/// transport is dropped or [`MeshTransport::shutdown`] is called.
pub struct MeshTransport {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MeshTransport {
    /// Start a transport on `medium`. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn start(medium: Arc<dyn Medium>, config: MeshConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            medium,
            filter: Mutex::new(FrameFilter::new(config.dedup_capacity)),
            config,
            paths: DashMap::new(),
            endpoints: DashMap::new(),
            links: DashMap::new(),
            events: Mutex::new(EventChannel { tx, rx: Some(rx) }),
            counters: Counters::default(),
        });

        let tasks = vec![
            tokio::spawn(receive_loop(Arc::clone(&shared))),
            tokio::spawn(housekeeping_loop(Arc::clone(&shared))),
        ];

        Self {
            shared,
            tasks: Mutex::new(tasks),
        }
    }

    /// Stop the background tasks. Links are dropped without notice.
    pub fn shutdown(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for MeshTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn link_id_for(destination: &Fingerprint, ephemeral: &[u8; 32], random: &[u8]) -> LinkId {
    let mut material = Vec::with_capacity(16 + 32 + random.len());
    material.extend_from_slice(destination.as_bytes());
    material.extend_from_slice(ephemeral);
    material.extend_from_slice(random);
    LinkId::from_bytes(truncated_hash(&material))
}

fn proof_material(link: &LinkId, responder: &[u8; 32], initiator: &[u8; 32]) -> Vec<u8> {
    let mut material = Vec::with_capacity(LinkId::LEN + 64);
    material.extend_from_slice(link.as_bytes());
    material.extend_from_slice(responder);
    material.extend_from_slice(initiator);
    material
}

fn identify_material(link: &LinkId, public: &[u8; PUBLIC_IDENTITY_LEN]) -> Vec<u8> {
    let mut material = Vec::with_capacity(LinkId::LEN + PUBLIC_IDENTITY_LEN);
    material.extend_from_slice(link.as_bytes());
    material.extend_from_slice(public);
    material
}

fn derive_link_key(
    ours: &x25519::PrivateKey,
    theirs: &[u8; 32],
    link: &LinkId,
) -> Result<LinkKey, CryptoError> {
    let shared = ours.exchange(&x25519::PublicKey::from_bytes(*theirs))?;
    let key = Kdf::new(LINK_KEY_CONTEXT).derive_key(shared.as_bytes(), link.as_bytes());
    Ok(LinkKey::new(key))
}

fn associated_data(link: &LinkId, context: LinkContext) -> [u8; LinkId::LEN + 1] {
    let mut aad = [0u8; LinkId::LEN + 1];
    aad[..LinkId::LEN].copy_from_slice(link.as_bytes());
    aad[LinkId::LEN] = context as u8;
    aad
}

async fn receive_loop(shared: Arc<Shared>) {
    loop {
        let frame = match shared.medium.receive().await {
            Ok(frame) => frame,
            Err(TransportError::Closed) => {
                tracing::debug!("Medium closed, receive loop exiting");
                break;
            }
            Err(e) => {
                tracing::warn!("Medium receive error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        shared.counters.received.fetch_add(1, Ordering::Relaxed);

        if !shared.remember_frame(&frame.bytes) {
            shared.counters.duplicate.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match Packet::decode(&frame.bytes) {
            Ok(packet) => shared.handle_packet(packet, frame.signal).await,
            Err(e) => {
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Dropping malformed frame: {}", e);
            }
        }
    }
}

async fn housekeeping_loop(shared: Arc<Shared>) {
    let period = shared
        .config
        .housekeeping_interval
        .max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        shared.housekeeping().await;
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let channel = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        if channel.tx.send(event).is_err() {
            tracing::trace!("Transport event dropped, no subscriber");
        }
    }

    /// Record a frame hash; false if it was seen before
    fn remember_frame(&self, bytes: &[u8]) -> bool {
        self.filter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(truncated_hash(bytes))
    }

    async fn transmit(&self, packet: &Packet) -> TransportResult<()> {
        let bytes = packet.encode()?;
        self.remember_frame(&bytes);
        self.medium.transmit(&bytes).await?;
        self.counters.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn seal_and_transmit(
        &self,
        link: LinkId,
        key: &LinkKey,
        context: LinkContext,
        plaintext: &[u8],
    ) -> TransportResult<()> {
        let nonce = Nonce::generate(&mut OsRng);
        let ciphertext = key.encrypt(&nonce, plaintext, &associated_data(&link, context))?;
        self.transmit(&Packet::LinkData {
            link,
            context,
            nonce,
            ciphertext,
        })
        .await?;

        if let Some(mut entry) = self.links.get_mut(&link) {
            entry.last_outbound = Instant::now();
        }
        Ok(())
    }

    async fn send_sealed(
        &self,
        link: LinkId,
        context: LinkContext,
        plaintext: &[u8],
    ) -> TransportResult<()> {
        let key = self
            .links
            .get(&link)
            .and_then(|entry| entry.link_key.clone())
            .ok_or(TransportError::UnknownLink(link))?;
        self.seal_and_transmit(link, &key, context, plaintext).await
    }

    fn require_active(&self, link: LinkId) -> TransportResult<()> {
        match self.links.get(&link) {
            None => Err(TransportError::UnknownLink(link)),
            Some(entry) if entry.phase != Phase::Active => {
                Err(TransportError::LinkNotEstablished(link))
            }
            Some(_) => Ok(()),
        }
    }

    async fn handle_packet(&self, packet: Packet, signal: SignalQuality) {
        match packet {
            Packet::Announce(announce) => self.handle_announce(announce, signal),
            Packet::PathRequest { target, .. } => self.handle_path_request(target).await,
            Packet::LinkRequest {
                destination,
                ephemeral,
                random,
            } => {
                self.handle_link_request(destination, ephemeral, random)
                    .await;
            }
            Packet::LinkProof {
                link,
                ephemeral,
                signature,
            } => self.handle_link_proof(link, ephemeral, signature).await,
            Packet::LinkData {
                link,
                context,
                nonce,
                ciphertext,
            } => {
                self.handle_link_data(link, context, nonce, &ciphertext, signal)
                    .await;
            }
        }
    }

    fn handle_announce(&self, announce: Announce, signal: SignalQuality) {
        if let Err(e) = announce.validate() {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::debug!("Rejected announce for {}: {}", announce.destination, e);
            return;
        }
        if self.endpoints.contains_key(&announce.destination) {
            return;
        }

        let accepted = {
            let mut entry = self
                .paths
                .entry(announce.destination)
                .or_insert_with(|| PathEntry {
                    identity: announce.identity,
                    hops: 1,
                    history: AnnounceHistory::new(self.config.announce_history),
                });
            if entry.history.accept(&announce) {
                entry.identity = announce.identity;
                entry.hops = 1;
                true
            } else {
                false
            }
        };

        if !accepted {
            tracing::trace!("Ignoring replayed announce for {}", announce.destination);
            return;
        }

        tracing::debug!("Path to {} learned from announce", announce.destination);
        self.emit(TransportEvent::AnnounceReceived {
            destination: announce.destination,
            identity: announce.identity,
            app_data: announce.app_data,
            hops: 1,
            signal,
        });
    }

    async fn handle_path_request(&self, target: Fingerprint) {
        let local = self.endpoints.get(&target).map(|local| {
            (
                local.endpoint.clone(),
                Arc::clone(&local.identity),
                local.app_data.clone(),
            )
        });
        let Some((endpoint, identity, app_data)) = local else {
            return;
        };

        tracing::debug!("Answering path request for {}", target);
        let announce = Announce::create(&endpoint, &identity, &app_data);
        if let Err(e) = self.transmit(&Packet::Announce(announce)).await {
            tracing::warn!("Failed to answer path request for {}: {}", target, e);
        }
    }

    async fn handle_link_request(
        &self,
        destination: Fingerprint,
        ephemeral: [u8; 32],
        random: [u8; REQUEST_RANDOM_LEN],
    ) {
        let Some(identity) = self
            .endpoints
            .get(&destination)
            .map(|local| Arc::clone(&local.identity))
        else {
            return;
        };

        let link = link_id_for(&destination, &ephemeral, &random);
        if self.links.contains_key(&link) {
            return;
        }

        let ours = x25519::PrivateKey::generate(&mut OsRng);
        let ours_public = ours.public_key().to_bytes();
        let key = match derive_link_key(&ours, &ephemeral, &link) {
            Ok(key) => key,
            Err(e) => {
                tracing::debug!("Rejected link request for {}: {}", destination, e);
                return;
            }
        };
        let signature = identity.sign(&proof_material(&link, &ours_public, &ephemeral));

        let mut entry = LinkEntry::new(Side::Responder, Phase::AwaitingRtt);
        entry.link_key = Some(key);
        self.links.insert(link, entry);

        tracing::debug!("Link request {} for {}", link, destination);
        self.emit(TransportEvent::LinkRequested { link, destination });

        let proof = Packet::LinkProof {
            link,
            ephemeral: ours_public,
            signature,
        };
        if let Err(e) = self.transmit(&proof).await {
            tracing::warn!("Failed to send link proof for {}: {}", link, e);
        }
    }

    async fn handle_link_proof(&self, link: LinkId, ephemeral: [u8; 32], signature: Signature) {
        let proven = {
            let Some(mut entry) = self.links.get_mut(&link) else {
                return;
            };
            if entry.side != Side::Initiator || entry.phase != Phase::AwaitingProof {
                return;
            }
            let (Some(peer), Some(ours)) = (entry.peer, entry.ephemeral.as_ref()) else {
                return;
            };

            let ours_public = ours.public_key().to_bytes();
            if peer
                .verify(&proof_material(&link, &ephemeral, &ours_public), &signature)
                .is_err()
            {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!("Invalid link proof for {}", link);
                return;
            }
            let key = match derive_link_key(ours, &ephemeral, &link) {
                Ok(key) => key,
                Err(e) => {
                    tracing::debug!("Link proof for {} unusable: {}", link, e);
                    return;
                }
            };

            entry.link_key = Some(key.clone());
            entry.ephemeral = None;
            entry.phase = Phase::Active;
            entry.last_inbound = Instant::now();
            (peer, key)
        };
        let (peer, key) = proven;

        // Confirm before anyone can queue data behind it
        if let Err(e) = self
            .seal_and_transmit(link, &key, LinkContext::Rtt, &[])
            .await
        {
            tracing::warn!("Failed to confirm link {}: {}", link, e);
        }

        tracing::debug!("Link {} established", link);
        self.emit(TransportEvent::LinkEstablished {
            link,
            mdu: LINK_MDU,
        });
        self.emit(TransportEvent::RemoteIdentified {
            link,
            identity: peer,
        });
    }

    fn activate_responder(&self, link: LinkId) {
        let activated = match self.links.get_mut(&link) {
            Some(mut entry) if entry.phase == Phase::AwaitingRtt => {
                entry.phase = Phase::Active;
                true
            }
            _ => false,
        };
        if activated {
            tracing::debug!("Link {} established", link);
            self.emit(TransportEvent::LinkEstablished {
                link,
                mdu: LINK_MDU,
            });
        }
    }

    async fn handle_link_data(
        &self,
        link: LinkId,
        context: LinkContext,
        nonce: Nonce,
        ciphertext: &[u8],
        signal: SignalQuality,
    ) {
        let Some((key, side)) = self
            .links
            .get(&link)
            .and_then(|entry| entry.link_key.clone().map(|key| (key, entry.side)))
        else {
            return;
        };

        let plaintext = match key.decrypt(&nonce, ciphertext, &associated_data(&link, context)) {
            Ok(plaintext) => plaintext,
            Err(_) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("Failed to open packet on link {}", link);
                return;
            }
        };

        if let Some(mut entry) = self.links.get_mut(&link) {
            entry.last_inbound = Instant::now();
        }
        if context != LinkContext::Close {
            self.activate_responder(link);
        }

        match context {
            LinkContext::Rtt => {}
            LinkContext::Data => self.emit(TransportEvent::Packet {
                link,
                payload: plaintext,
                signal,
            }),
            LinkContext::Identify => self.handle_identify(link, &plaintext),
            LinkContext::Keepalive => {
                if side == Side::Responder && plaintext.first() == Some(&KEEPALIVE_PROBE) {
                    if let Err(e) = self
                        .seal_and_transmit(link, &key, LinkContext::Keepalive, &[KEEPALIVE_REPLY])
                        .await
                    {
                        tracing::debug!("Keepalive reply on {} failed: {}", link, e);
                    }
                }
            }
            LinkContext::Close => {
                if self.links.remove(&link).is_some() {
                    let reason = if plaintext.first() == Some(&Side::Responder.as_byte()) {
                        CloseReason::DestinationClosed
                    } else {
                        CloseReason::InitiatorClosed
                    };
                    tracing::debug!("Link {} closed by peer ({:?})", link, reason);
                    self.emit(TransportEvent::LinkClosed { link, reason });
                }
            }
        }
    }

    fn handle_identify(&self, link: LinkId, payload: &[u8]) {
        if payload.len() != PUBLIC_IDENTITY_LEN + 64 {
            tracing::debug!("Malformed identify on {}", link);
            return;
        }
        let (public_bytes, signature_bytes) = payload.split_at(PUBLIC_IDENTITY_LEN);
        let Ok(identity) = PublicIdentity::from_bytes(public_bytes) else {
            tracing::debug!("Identify on {} carried an invalid identity", link);
            return;
        };
        let Ok(signature) = Signature::from_slice(signature_bytes) else {
            return;
        };
        if identity
            .verify(
                &identify_material(&link, &identity.to_bytes()),
                &signature,
            )
            .is_err()
        {
            tracing::warn!("Identify on {} failed verification", link);
            return;
        }

        match self.links.get_mut(&link) {
            Some(mut entry) => entry.peer = Some(identity),
            None => return,
        }
        tracing::debug!("Link {} identified as {}", link, identity);
        self.emit(TransportEvent::RemoteIdentified { link, identity });
    }

    async fn close_removed(&self, link: LinkId, entry: LinkEntry) {
        if let Some(key) = entry.link_key.as_ref() {
            if let Err(e) = self
                .seal_and_transmit(link, key, LinkContext::Close, &[entry.side.as_byte()])
                .await
            {
                tracing::debug!("Close notice for {} not sent: {}", link, e);
            }
        }
    }

    async fn housekeeping(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        let mut stale = Vec::new();
        let mut probes = Vec::new();

        for entry in self.links.iter() {
            match entry.phase {
                Phase::AwaitingProof | Phase::AwaitingRtt
                    if now.duration_since(entry.opened_at) > self.config.establishment_timeout =>
                {
                    expired.push(*entry.key());
                }
                Phase::Active if now.duration_since(entry.last_inbound) > self.config.stale_time => {
                    stale.push(*entry.key());
                }
                Phase::Active
                    if entry.side == Side::Initiator
                        && now.duration_since(entry.last_outbound)
                            >= self.config.keepalive_interval =>
                {
                    probes.push(*entry.key());
                }
                _ => {}
            }
        }

        for link in expired {
            if self.links.remove(&link).is_some() {
                tracing::info!("Link {} handshake timed out", link);
                self.emit(TransportEvent::LinkClosed {
                    link,
                    reason: CloseReason::Timeout,
                });
            }
        }

        for link in stale {
            if let Some((_, entry)) = self.links.remove(&link) {
                tracing::info!("Link {} went stale", link);
                self.close_removed(link, entry).await;
                self.emit(TransportEvent::LinkClosed {
                    link,
                    reason: CloseReason::Timeout,
                });
            }
        }

        for link in probes {
            if let Err(e) = self
                .send_sealed(link, LinkContext::Keepalive, &[KEEPALIVE_PROBE])
                .await
            {
                tracing::debug!("Keepalive on {} failed: {}", link, e);
            }
        }
    }
}

#[async_trait]
impl Transport for MeshTransport {
    fn has_path(&self, destination: &Fingerprint) -> bool {
        self.shared.paths.contains_key(destination)
    }

    async fn request_path(&self, destination: &Fingerprint) -> TransportResult<()> {
        let mut tag = [0u8; PATH_TAG_LEN];
        OsRng.fill_bytes(&mut tag);
        tracing::debug!("Requesting path to {}", destination);
        self.shared
            .transmit(&Packet::PathRequest {
                target: *destination,
                tag,
            })
            .await
    }

    fn recall(&self, destination: &Fingerprint) -> Option<PublicIdentity> {
        self.shared
            .paths
            .get(destination)
            .map(|entry| entry.identity)
    }

    fn restore_path(&self, destination: Fingerprint, identity: PublicIdentity, hops: u8) {
        let history = self.shared.config.announce_history;
        self.shared
            .paths
            .entry(destination)
            .or_insert_with(|| PathEntry {
                identity,
                hops,
                history: AnnounceHistory::new(history),
            });
    }

    fn register_endpoint(
        &self,
        endpoint: Endpoint,
        identity: Arc<Identity>,
    ) -> TransportResult<()> {
        if identity.public() != endpoint.identity() {
            return Err(TransportError::InvalidEndpoint(format!(
                "{} is not owned by {}",
                endpoint,
                identity.fingerprint()
            )));
        }
        tracing::debug!("Hosting endpoint {}", endpoint);
        self.shared.endpoints.insert(
            endpoint.address(),
            LocalEndpoint {
                endpoint,
                identity,
                app_data: Vec::new(),
            },
        );
        Ok(())
    }

    async fn announce(&self, destination: &Fingerprint, app_data: &[u8]) -> TransportResult<()> {
        let (endpoint, identity) = {
            let mut local = self
                .shared
                .endpoints
                .get_mut(destination)
                .ok_or(TransportError::UnknownEndpoint(*destination))?;
            local.app_data = app_data.to_vec();
            (local.endpoint.clone(), Arc::clone(&local.identity))
        };
        let announce = Announce::create(&endpoint, &identity, app_data);
        tracing::debug!("Announcing {}", endpoint);
        self.shared.transmit(&Packet::Announce(announce)).await
    }

    async fn open_link(&self, endpoint: &Endpoint) -> TransportResult<LinkId> {
        let destination = endpoint.address();
        if !self.has_path(&destination) {
            return Err(TransportError::NoPath(destination));
        }

        let ours = x25519::PrivateKey::generate(&mut OsRng);
        let ephemeral = ours.public_key().to_bytes();
        let mut random = [0u8; REQUEST_RANDOM_LEN];
        OsRng.fill_bytes(&mut random);
        let link = link_id_for(&destination, &ephemeral, &random);

        let mut entry = LinkEntry::new(Side::Initiator, Phase::AwaitingProof);
        entry.peer = Some(*endpoint.identity());
        entry.ephemeral = Some(ours);
        self.shared.links.insert(link, entry);
        self.shared
            .emit(TransportEvent::HandshakeStarted { link });

        let request = Packet::LinkRequest {
            destination,
            ephemeral,
            random,
        };
        if let Err(e) = self.shared.transmit(&request).await {
            self.shared.links.remove(&link);
            return Err(e);
        }
        tracing::debug!("Link request {} sent to {}", link, destination);
        Ok(link)
    }

    async fn identify(&self, link: LinkId, identity: &Identity) -> TransportResult<()> {
        self.shared.require_active(link)?;
        let public = identity.public().to_bytes();
        let signature = identity.sign(&identify_material(&link, &public));

        let mut payload = Vec::with_capacity(PUBLIC_IDENTITY_LEN + 64);
        payload.extend_from_slice(&public);
        payload.extend_from_slice(signature.as_bytes());
        self.shared
            .send_sealed(link, LinkContext::Identify, &payload)
            .await
    }

    async fn send(&self, link: LinkId, payload: &[u8]) -> TransportResult<()> {
        if payload.len() > LINK_MDU {
            return Err(TransportError::PayloadTooLarge {
                size: payload.len(),
                mdu: LINK_MDU,
            });
        }
        self.shared.require_active(link)?;
        self.shared
            .send_sealed(link, LinkContext::Data, payload)
            .await
    }

    async fn close_link(&self, link: LinkId) -> TransportResult<()> {
        let (_, entry) = self
            .shared
            .links
            .remove(&link)
            .ok_or(TransportError::UnknownLink(link))?;
        self.shared.close_removed(link, entry).await;
        self.shared.emit(TransportEvent::LinkClosed {
            link,
            reason: CloseReason::Local,
        });
        Ok(())
    }

    fn link_mdu(&self) -> usize {
        LINK_MDU
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let mut channel = self
            .shared
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = channel.rx.take() {
            return rx;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        channel.tx = tx;
        rx
    }

    fn stats(&self) -> TransportStats {
        let counters = &self.shared.counters;
        TransportStats {
            frames_sent: counters.sent.load(Ordering::Relaxed),
            frames_received: counters.received.load(Ordering::Relaxed),
            frames_duplicate: counters.duplicate.load(Ordering::Relaxed),
            frames_rejected: counters.rejected.load(Ordering::Relaxed),
            links: self.shared.links.len(),
            paths: self.shared.paths.len(),
        }
    }
}
