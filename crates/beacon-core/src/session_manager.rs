//! Session management for beacon nodes
//!
//! The session manager owns every [`Link`] the node knows about:
//!
//! - Uplinks, tracked by role name (`IncidentCommand`, `TeamLead`). One
//!   link per role; connecting a role again retires the previous link.
//! - Inbound links accepted from clients. Every inbound link is tracked,
//!   replies go to the most recent one.
//!
//! # Event flow
//!
//! ```text
//! Transport ──TransportEvent──> dispatcher task ──> Link state
//!                                     │
//!                                     ├──> audit record
//!                                     └──SessionEvent──> application
//! ```
//!
//! The registry sits behind one async mutex shared by the dispatcher and
//! the public operations. [`SessionManager::connect_role`] holds it across
//! `open_link` and registration, so the dispatcher can never see an event
//! for a link that is not registered yet. Teardown removes a link from the
//! registry before closing it on the transport; late events for it are
//! dropped.
//!
//! Events for one link are emitted while that link's lock is held, and
//! closing takes the same lock. Nothing for a link is emitted after its
//! `Closed` event, whichever task closes it.
//!
//! Inbound links are tracked from the link request on but only become the
//! reply target once established.

use crate::error::{BeaconError, Result};
use crate::framer::{Payload, decode_text};
use crate::identity_store::{IdentityStore, KnownDestination};
use crate::link::{Link, LinkRole, LinkState, LinkView, TeardownReason};
use crate::path::{PathResolver, PathResult};
use crate::persist::Persister;
use crate::record::{RecordQueue, Recorder};
use crate::{APP_NAME, ASPECT};
use beacon_crypto::{Fingerprint, PublicIdentity};
use beacon_transport::{Endpoint, LinkId, SignalQuality, Transport, TransportError, TransportEvent};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Where a message should go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Uplink tracked under a role name
    Role(String),
    /// Any tracked link by transport id
    Link(LinkId),
    /// Most recently accepted inbound link
    LatestInbound,
}

impl From<&str> for Target {
    fn from(role: &str) -> Self {
        Target::Role(role.to_string())
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Role(role) => write!(f, "{role}"),
            Target::Link(link) => write!(f, "link {link}"),
            Target::LatestInbound => write!(f, "latest inbound link"),
        }
    }
}

/// What is known about the sender of an inbound message
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Provenance {
    /// Remote side has proven its identity on this link
    pub identified: bool,
    /// Proven identity, if any
    pub peer: Option<PublicIdentity>,
    /// Signal of the carrying frame
    pub signal: SignalQuality,
}

/// Link events delivered to the application, in the order they happened
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Link became ACTIVE
    Established {
        /// Transport link id
        link: LinkId,
        /// Role name, or `Client` for inbound links
        name: String,
    },
    /// Remote identity proven
    RemoteIdentified {
        /// Transport link id
        link: LinkId,
        /// Role name, or `Client` for inbound links
        name: String,
        /// Proven identity
        identity: PublicIdentity,
    },
    /// Application message
    Message {
        /// Transport link id
        link: LinkId,
        /// Role name, or `Client` for inbound links
        name: String,
        /// Decoded text (invalid UTF-8 replaced)
        text: String,
        /// Raw bytes as received
        payload: Vec<u8>,
        /// Sender details
        provenance: Provenance,
    },
    /// Link reached CLOSED
    Closed {
        /// Transport link id, if the handshake ever started
        link: Option<LinkId>,
        /// Role name, or `Client` for inbound links
        name: String,
        /// Why
        reason: TeardownReason,
    },
}

#[derive(Default)]
struct Registry {
    roles: HashMap<String, Arc<Link>>,
    by_id: HashMap<LinkId, Arc<Link>>,
    latest_inbound: Option<LinkId>,
    pending: HashMap<String, CancellationToken>,
}

impl Registry {
    /// Track an inbound link. Only an `ACTIVE` one takes over replies.
    fn accept(&mut self, link: Arc<Link>) -> bool {
        let Some(id) = link.link_id() else {
            return false;
        };
        let active = link.is_active();
        self.by_id.insert(id, link);
        if active {
            self.latest_inbound = Some(id);
        }
        active
    }

    /// Drop every reference to `id`, returning the link it named
    fn forget(&mut self, id: LinkId) -> Option<Arc<Link>> {
        let link = self.by_id.remove(&id)?;
        if self.latest_inbound == Some(id) {
            self.latest_inbound = None;
        }
        if self
            .roles
            .get(link.name())
            .is_some_and(|tracked| Arc::ptr_eq(tracked, &link))
        {
            self.roles.remove(link.name());
        }
        Some(link)
    }

    /// Remove the role entry only if it still points at `link`
    fn forget_role(&mut self, link: &Arc<Link>) {
        if self
            .roles
            .get(link.name())
            .is_some_and(|tracked| Arc::ptr_eq(tracked, link))
        {
            self.roles.remove(link.name());
            self.pending.remove(link.name());
            if let Some(id) = link.link_id() {
                self.by_id.remove(&id);
            }
        }
    }

    fn owns_role(&self, link: &Arc<Link>) -> bool {
        self.roles
            .get(link.name())
            .is_some_and(|tracked| Arc::ptr_eq(tracked, link))
    }
}

/// State shared with the dispatcher task
struct Shared {
    transport: Arc<dyn Transport>,
    store: Arc<IdentityStore>,
    records: RecordQueue,
    persister: Persister,
    registry: Mutex<Registry>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Owns the node's links and routes transport events to them.
pub struct SessionManager {
    shared: Arc<Shared>,
    resolver: PathResolver,
    events_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>,
    dispatcher: JoinHandle<()>,
}

impl SessionManager {
    /// Start a session manager on `transport`. Must be called inside a
    /// Tokio runtime; the dispatcher and record writer tasks are spawned
    /// immediately. Destination cache saves are queued on `persister`.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<IdentityStore>,
        recorder: Arc<Recorder>,
        persister: Persister,
    ) -> Self {
        let resolver = PathResolver::new(Arc::clone(&transport), Arc::clone(&store));
        let (tx, rx) = mpsc::unbounded_channel();
        let transport_events = transport.subscribe();
        let shared = Arc::new(Shared {
            transport,
            store,
            records: RecordQueue::spawn(recorder),
            persister,
            registry: Mutex::new(Registry::default()),
            events: tx,
        });
        let dispatcher = tokio::spawn(dispatch(Arc::clone(&shared), transport_events));

        Self {
            shared,
            resolver,
            events_rx: std::sync::Mutex::new(Some(rx)),
            dispatcher,
        }
    }

    /// Override the path poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.resolver.set_poll_interval(poll_interval);
        self
    }

    /// Take the application event stream. Only the first call gets it.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Wait until every audit line recorded so far is on disk
    pub async fn flush_records(&self) {
        self.shared.records.flush().await;
    }

    /// Transport this manager drives
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.shared.transport
    }

    /// Open an uplink to `target` and track it under `role`.
    ///
    /// The link is registered as `PENDING` before path resolution starts,
    /// then handed to the transport once a path is known. Returns once the
    /// link request is on the air; establishment is reported later through
    /// [`SessionEvent::Established`].
    ///
    /// # Errors
    ///
    /// - [`BeaconError::PathTimedOut`] if no path appears within `timeout`
    /// - [`BeaconError::Cancelled`] if the role is torn down or reconnected
    ///   while this call is in progress
    /// - [`BeaconError::Transport`] if the target is not a beacon uplink
    ///   endpoint or the link request cannot be sent
    pub async fn connect_role(
        &self,
        role: &str,
        target: Fingerprint,
        timeout: Duration,
    ) -> Result<Arc<Link>> {
        let link = Arc::new(Link::uplink(role, target, self.shared.transport.link_mdu()));
        let cancel = CancellationToken::new();

        let previous = {
            let mut registry = self.shared.registry.lock().await;
            if let Some(token) = registry.pending.insert(role.to_string(), cancel.clone()) {
                token.cancel();
            }
            let previous = registry.roles.insert(role.to_string(), Arc::clone(&link));
            if let Some(id) = previous.as_ref().and_then(|old| old.link_id()) {
                registry.by_id.remove(&id);
            }
            previous
        };
        if let Some(old) = previous {
            tracing::info!("Replacing existing {} link", role);
            self.shared.retire(&old).await;
        }

        self.shared
            .records
            .record(format!("Establishing link with {role} [{target}]..."));

        let identity = match self.resolver.resolve(&target, timeout, &cancel).await {
            Ok(PathResult::Known(identity) | PathResult::Resolved(identity)) => identity,
            Ok(PathResult::TimedOut) => {
                self.shared.abandon(&link, TeardownReason::Timeout).await;
                return Err(BeaconError::PathTimedOut(target));
            }
            Err(BeaconError::Cancelled) => return Err(BeaconError::Cancelled),
            Err(e) => {
                self.shared.abandon(&link, TeardownReason::Unknown).await;
                return Err(e);
            }
        };

        let endpoint = match uplink_endpoint(identity, target) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.shared.abandon(&link, TeardownReason::Unknown).await;
                return Err(e);
            }
        };

        let mut registry = self.shared.registry.lock().await;
        if cancel.is_cancelled() || !registry.owns_role(&link) {
            return Err(BeaconError::Cancelled);
        }
        match self.shared.transport.open_link(&endpoint).await {
            Ok(id) => {
                link.attach(id);
                registry.by_id.insert(id, Arc::clone(&link));
                registry.pending.remove(role);
                tracing::debug!("{} uplink request {} sent", role, id);
                Ok(link)
            }
            Err(e) => {
                registry.forget_role(&link);
                drop(registry);
                self.shared.close(&link, TeardownReason::Unknown);
                Err(e.into())
            }
        }
    }

    /// Track a link accepted from a client.
    ///
    /// An `ACTIVE` link becomes the reply target for
    /// [`Target::LatestInbound`] (last connected wins); one still
    /// handshaking is only tracked. The dispatcher does the same when an
    /// inbound link is established. Returns whether the link took over
    /// replies.
    pub async fn accept_inbound(&self, link: Arc<Link>) -> bool {
        self.shared.registry.lock().await.accept(link)
    }

    /// Send one message.
    ///
    /// The MDU is checked before anything else and before the transport is
    /// involved. A transport failure closes the link.
    ///
    /// # Errors
    ///
    /// - [`BeaconError::UnknownRole`] if no link is tracked for the role
    /// - [`BeaconError::PayloadTooLarge`] if the payload exceeds the MDU
    /// - [`BeaconError::LinkNotActive`] if the link is not `ACTIVE`, no
    ///   inbound link exists, or the transport rejected the packet
    pub async fn send(&self, target: &Target, payload: impl Into<Payload>) -> Result<()> {
        let payload = payload.into();
        let link = self.lookup(target).await?;

        let mdu = link.mdu();
        let bytes = match payload.encode(mdu) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.shared
                    .records
                    .record(format!("MDU error, sent {}/{} bytes.", payload.len(), mdu));
                tracing::warn!("{}: {}", link.name(), e);
                return Err(e);
            }
        };

        let state = link.state();
        let id = match (state, link.link_id()) {
            (LinkState::Active, Some(id)) => id,
            _ => {
                return Err(BeaconError::LinkNotActive(Cow::Owned(format!(
                    "{} link is {}",
                    link.name(),
                    state
                ))));
            }
        };

        match self.shared.transport.send(id, bytes).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.records.record(format!("Transmission error: {e}"));
                tracing::warn!("Send on {} failed: {}", id, e);
                self.shared.registry.lock().await.forget(id);
                self.shared.retire_with(&link, TeardownReason::Unknown).await;
                Err(BeaconError::LinkNotActive(Cow::Owned(format!(
                    "{} link failed: {e}",
                    link.name()
                ))))
            }
        }
    }

    async fn lookup(&self, target: &Target) -> Result<Arc<Link>> {
        let registry = self.shared.registry.lock().await;
        match target {
            Target::Role(role) => registry
                .roles
                .get(role)
                .cloned()
                .ok_or_else(|| BeaconError::UnknownRole(role.clone())),
            Target::Link(id) => registry
                .by_id
                .get(id)
                .cloned()
                .ok_or_else(|| BeaconError::LinkNotActive(Cow::Owned(format!("no link {id}")))),
            Target::LatestInbound => registry
                .latest_inbound
                .and_then(|id| registry.by_id.get(&id).cloned())
                .ok_or(BeaconError::link_not_active("no inbound link")),
        }
    }

    /// Link tracked under `role`
    pub async fn link(&self, role: &str) -> Option<Arc<Link>> {
        self.shared.registry.lock().await.roles.get(role).cloned()
    }

    /// Most recently accepted inbound link that is still open
    pub async fn latest_inbound(&self) -> Option<Arc<Link>> {
        let registry = self.shared.registry.lock().await;
        registry
            .latest_inbound
            .and_then(|id| registry.by_id.get(&id).cloned())
    }

    /// Roles whose links are `ACTIVE`, sorted by name
    pub async fn active_roles(&self) -> Vec<String> {
        let registry = self.shared.registry.lock().await;
        let mut roles: Vec<_> = registry
            .roles
            .iter()
            .filter(|(_, link)| link.is_active())
            .map(|(role, _)| role.clone())
            .collect();
        roles.sort();
        roles
    }

    /// Number of tracked links with a transport id
    pub async fn link_count(&self) -> usize {
        self.shared.registry.lock().await.by_id.len()
    }

    /// Close the link tracked under `role`. Returns whether one existed.
    pub async fn teardown_role(&self, role: &str) -> bool {
        let link = {
            let mut registry = self.shared.registry.lock().await;
            if let Some(token) = registry.pending.remove(role) {
                token.cancel();
            }
            let link = registry.roles.remove(role);
            if let Some(id) = link.as_ref().and_then(|link| link.link_id()) {
                registry.by_id.remove(&id);
            }
            link
        };
        match link {
            Some(link) => {
                self.shared.retire(&link).await;
                true
            }
            None => false,
        }
    }

    /// Close every tracked link.
    pub async fn teardown_all(&self) {
        let links = {
            let mut registry = self.shared.registry.lock().await;
            for (_, token) in registry.pending.drain() {
                token.cancel();
            }
            let mut links: Vec<Arc<Link>> = registry.by_id.drain().map(|(_, link)| link).collect();
            for (_, link) in registry.roles.drain() {
                if !links.iter().any(|known| Arc::ptr_eq(known, &link)) {
                    links.push(link);
                }
            }
            registry.latest_inbound = None;
            links
        };
        tracing::info!("Tearing down {} links", links.len());
        for link in links {
            self.shared.retire(&link).await;
        }
    }

    /// Stop the dispatcher. Links are left as they are.
    pub fn shutdown(&self) {
        self.dispatcher.abort();
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

fn uplink_endpoint(identity: PublicIdentity, target: Fingerprint) -> Result<Endpoint> {
    let endpoint = Endpoint::new(identity, APP_NAME, &[ASPECT])?;
    if endpoint.address() != target {
        return Err(BeaconError::Transport(Cow::Owned(format!(
            "{target} is not a {APP_NAME}.{ASPECT} endpoint"
        ))));
    }
    Ok(endpoint)
}

fn optional<T: fmt::Display>(value: Option<T>) -> String {
    value.map_or_else(|| "None".to_string(), |value| value.to_string())
}

impl Shared {
    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::trace!("Session event dropped, no listener");
        }
    }

    /// Close a link this node no longer wants, already unregistered
    async fn retire(&self, link: &Arc<Link>) {
        self.retire_with(link, TeardownReason::ClosedLocally).await;
    }

    async fn retire_with(&self, link: &Arc<Link>, reason: TeardownReason) {
        self.close(link, reason);
        if let Some(id) = link.link_id() {
            match self.transport.close_link(id).await {
                Ok(()) | Err(TransportError::UnknownLink(_)) => {}
                Err(e) => tracing::debug!("Closing {} on the transport failed: {}", id, e),
            }
        }
    }

    /// Give up on an uplink that never reached the transport
    async fn abandon(&self, link: &Arc<Link>, reason: TeardownReason) {
        self.registry.lock().await.forget_role(link);
        self.close(link, reason);
    }

    /// Close `link` and announce it, unless it was already closed
    fn close(&self, link: &Link, reason: TeardownReason) -> bool {
        link.close_then(reason, |view| self.closed(link, view, reason))
    }

    /// Runs under the link lock
    fn closed(&self, link: &Link, view: LinkView, reason: TeardownReason) {
        let record = match link.role() {
            LinkRole::Uplink => {
                let what = match reason {
                    TeardownReason::Timeout => "uplink timed out.",
                    TeardownReason::ClosedByPeer => "uplink closed by peer.",
                    TeardownReason::ClosedLocally => "uplink closed locally.",
                    TeardownReason::Unknown => "uplink closed. NFI.",
                };
                format!("{} [{}] {}", link.name(), optional(link.target()), what)
            }
            LinkRole::Inbound => format!(
                "{} [{}] disconnected ({:?}).",
                link.name(),
                optional(view.peer.map(|peer| peer.fingerprint())),
                reason
            ),
        };
        tracing::info!("{}", record);
        self.records.record(record);
        self.emit(SessionEvent::Closed {
            link: view.link_id,
            name: link.name().to_string(),
            reason,
        });
    }

    async fn tracked(&self, id: LinkId) -> Option<Arc<Link>> {
        self.registry.lock().await.by_id.get(&id).cloned()
    }

    async fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::AnnounceReceived {
                destination,
                identity,
                app_data,
                hops,
                ..
            } => {
                let mut known = KnownDestination::new(destination, &identity, hops);
                known.app_data = app_data;
                if self.store.remember(known) {
                    tracing::debug!("Remembered destination {} ({} hops)", destination, hops);
                    self.store.persist(&self.persister);
                }
            }

            TransportEvent::LinkRequested { link, destination } => {
                let inbound = Arc::new(Link::inbound(link, self.transport.link_mdu()));
                self.registry.lock().await.by_id.insert(link, inbound);
                tracing::info!("Client connecting on {} via {}", link, destination);
            }

            TransportEvent::HandshakeStarted { link } => {
                if let Some(tracked) = self.tracked(link).await {
                    tracked.advance(LinkState::Handshaking);
                }
            }

            TransportEvent::LinkEstablished { link, mdu } => {
                // Held across the transition so an inbound link is the reply
                // target before anyone sees `Established`
                let mut registry = self.registry.lock().await;
                let Some(tracked) = registry.by_id.get(&link).cloned() else {
                    return;
                };
                let established = tracked.establish_then(mdu, |_| {
                    let record = match tracked.role() {
                        LinkRole::Uplink => format!(
                            "Uplink to {} [{}] established.",
                            tracked.name(),
                            optional(tracked.target())
                        ),
                        LinkRole::Inbound => "Client connected.".to_string(),
                    };
                    self.records.record(record);
                    self.emit(SessionEvent::Established {
                        link,
                        name: tracked.name().to_string(),
                    });
                });
                if !established {
                    return;
                }
                match tracked.role() {
                    LinkRole::Uplink => {
                        drop(registry);
                        if let Err(e) = self.transport.identify(link, self.store.identity()).await
                        {
                            tracing::warn!("Identify on {} failed: {}", link, e);
                        }
                    }
                    LinkRole::Inbound => {
                        if registry.accept(Arc::clone(&tracked)) {
                            tracing::debug!("{} is now the reply target", link);
                        }
                    }
                }
            }

            TransportEvent::RemoteIdentified { link, identity } => {
                let Some(tracked) = self.tracked(link).await else {
                    return;
                };
                tracked.identify_then(identity, |_| {
                    if tracked.role() == LinkRole::Inbound {
                        self.records.record(format!(
                            "Client identified as {}.",
                            identity.fingerprint()
                        ));
                    }
                    self.emit(SessionEvent::RemoteIdentified {
                        link,
                        name: tracked.name().to_string(),
                        identity,
                    });
                });
            }

            TransportEvent::Packet {
                link,
                payload,
                signal,
            } => {
                let Some(tracked) = self.tracked(link).await else {
                    tracing::debug!("Packet for untracked link {} dropped", link);
                    return;
                };
                let text = decode_text(&payload).into_owned();
                let delivered = tracked.while_open(|view| {
                    let provenance = Provenance {
                        identified: view.peer.is_some(),
                        peer: view.peer,
                        signal,
                    };
                    self.records.record(format!(
                        "{} [{} ({})] RSSI:{} SNR:{} -- {}",
                        tracked.name(),
                        optional(view.peer.map(|peer| peer.fingerprint())),
                        if provenance.identified {
                            "VERIFIED"
                        } else {
                            "UNVERIFIED"
                        },
                        optional(signal.rssi),
                        optional(signal.snr),
                        text
                    ));
                    self.emit(SessionEvent::Message {
                        link,
                        name: tracked.name().to_string(),
                        text,
                        payload,
                        provenance,
                    });
                });
                if delivered.is_none() {
                    tracing::debug!("Packet for closed link {} dropped", link);
                }
            }

            TransportEvent::LinkClosed { link, reason } => {
                let Some(tracked) = self.registry.lock().await.forget(link) else {
                    return;
                };
                self.close(&tracked, TeardownReason::from(reason));
            }
        }
    }
}

async fn dispatch(shared: Arc<Shared>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
    while let Some(event) = events.recv().await {
        shared.handle(event).await;
    }
    tracing::debug!("Transport event stream ended");
}
