//! Link state machine.
//!
//! A [`Link`] is one logical session with one peer. Its state only moves
//! forward:
//!
//! ```text
//! PENDING -> HANDSHAKING -> ACTIVE -> CLOSED(reason)
//!    |            |                      ^
//!    +------------+----------------------+
//! ```
//!
//! `CLOSED` is terminal. A reconnect creates a new `Link`.

use beacon_crypto::{Fingerprint, PublicIdentity};
use beacon_transport::{CloseReason, LinkId};
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Why a link ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeardownReason {
    /// Handshake or keepalive timed out
    Timeout,
    /// The peer closed the link
    ClosedByPeer,
    /// This node closed the link
    ClosedLocally,
    /// Closed for a reason the transport could not explain
    Unknown,
}

impl From<CloseReason> for TeardownReason {
    fn from(reason: CloseReason) -> Self {
        match reason {
            CloseReason::Timeout => TeardownReason::Timeout,
            CloseReason::DestinationClosed | CloseReason::InitiatorClosed => {
                TeardownReason::ClosedByPeer
            }
            CloseReason::Local => TeardownReason::ClosedLocally,
            CloseReason::Failed => TeardownReason::Unknown,
        }
    }
}

/// Link lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkState {
    /// Created, handshake not started
    Pending,
    /// Cryptographic handshake in flight
    Handshaking,
    /// Usable for messages
    Active,
    /// Terminal
    Closed(TeardownReason),
}

impl LinkState {
    /// Whether this is the terminal state
    #[must_use]
    pub fn is_closed(&self) -> bool {
        matches!(self, LinkState::Closed(_))
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkState::Pending => write!(f, "PENDING"),
            LinkState::Handshaking => write!(f, "HANDSHAKING"),
            LinkState::Active => write!(f, "ACTIVE"),
            LinkState::Closed(reason) => write!(f, "CLOSED({reason:?})"),
        }
    }
}

/// Which side opened the link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkRole {
    /// Opened by this node towards a named role
    Uplink,
    /// Accepted from a remote client
    Inbound,
}

/// Rejected transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("invalid link transition {from} -> {to}")]
pub struct InvalidTransition {
    /// State before
    pub from: LinkState,
    /// Requested state
    pub to: LinkState,
}

/// Pure transition rules
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkStateMachine {
    state: LinkState,
}

impl LinkStateMachine {
    /// New machine in `PENDING`
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(LinkState::Pending)
    }

    /// New machine in `state`; inbound links start out handshaking
    #[must_use]
    pub fn starting_at(state: LinkState) -> Self {
        Self { state }
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.state
    }

    /// Check if a transition is valid
    #[must_use]
    pub fn can_transition(&self, to: LinkState) -> bool {
        match (self.state, to) {
            (LinkState::Pending, LinkState::Handshaking | LinkState::Closed(_)) => true,
            (LinkState::Handshaking, LinkState::Active | LinkState::Closed(_)) => true,
            (LinkState::Active, LinkState::Closed(_)) => true,
            _ => false,
        }
    }

    /// Move to `to`.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidTransition`] and leaves the state unchanged if the
    /// move is not allowed.
    pub fn transition(&mut self, to: LinkState) -> Result<(), InvalidTransition> {
        if !self.can_transition(to) {
            return Err(InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

impl Default for LinkStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
struct LinkInner {
    machine: LinkStateMachine,
    link_id: Option<LinkId>,
    mdu: usize,
    peer: Option<PublicIdentity>,
}

/// Shared handle to one logical session.
#[derive(Debug)]
pub struct Link {
    role: LinkRole,
    name: String,
    target: Option<Fingerprint>,
    inner: Mutex<LinkInner>,
}

impl Link {
    /// New uplink towards `target`, tracked under `name`
    #[must_use]
    pub fn uplink(name: impl Into<String>, target: Fingerprint, mdu: usize) -> Self {
        Self::build(LinkRole::Uplink, name.into(), Some(target), mdu, LinkState::Pending)
    }

    /// New inbound link, already handshaking
    #[must_use]
    pub fn inbound(link_id: LinkId, mdu: usize) -> Self {
        let link = Self::build(
            LinkRole::Inbound,
            "Client".to_string(),
            None,
            mdu,
            LinkState::Handshaking,
        );
        link.lock().link_id = Some(link_id);
        link
    }

    fn build(
        role: LinkRole,
        name: String,
        target: Option<Fingerprint>,
        mdu: usize,
        state: LinkState,
    ) -> Self {
        Self {
            role,
            name,
            target,
            inner: Mutex::new(LinkInner {
                machine: LinkStateMachine::starting_at(state),
                link_id: None,
                mdu,
                peer: None,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, LinkInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Uplink or inbound
    #[must_use]
    pub fn role(&self) -> LinkRole {
        self.role
    }

    /// Role name used in records
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Destination address for uplinks
    #[must_use]
    pub fn target(&self) -> Option<Fingerprint> {
        self.target
    }

    /// Current state
    #[must_use]
    pub fn state(&self) -> LinkState {
        self.lock().machine.state()
    }

    /// Transport link id, once the handshake has started
    #[must_use]
    pub fn link_id(&self) -> Option<LinkId> {
        self.lock().link_id
    }

    /// Largest payload one message may carry
    #[must_use]
    pub fn mdu(&self) -> usize {
        self.lock().mdu
    }

    /// Remote identity, once proven
    #[must_use]
    pub fn peer(&self) -> Option<PublicIdentity> {
        self.lock().peer
    }

    /// Whether the remote side has been cryptographically identified
    #[must_use]
    pub fn is_identified(&self) -> bool {
        self.lock().peer.is_some()
    }

    /// Whether messages may be sent
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == LinkState::Active
    }

    /// Whether the link has ended
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state().is_closed()
    }

    /// Teardown reason, once closed
    #[must_use]
    pub fn teardown_reason(&self) -> Option<TeardownReason> {
        match self.state() {
            LinkState::Closed(reason) => Some(reason),
            _ => None,
        }
    }

    pub(crate) fn attach(&self, link_id: LinkId) {
        self.lock().link_id = Some(link_id);
    }

    /// Apply a transition, logging and ignoring invalid ones.
    pub(crate) fn advance(&self, to: LinkState) -> bool {
        self.advance_then(to, |_| {})
    }

    /// Apply a transition and, if it was accepted, run `f` before the link
    /// lock is released.
    fn advance_then(&self, to: LinkState, f: impl FnOnce(LinkView)) -> bool {
        let mut inner = self.lock();
        let from = inner.machine.state();
        match inner.machine.transition(to) {
            Ok(()) => {
                tracing::debug!("{} link {} -> {}", self.name, from, to);
                f(inner.view());
                true
            }
            Err(e) => {
                tracing::trace!("{} link: {}", self.name, e);
                false
            }
        }
    }

    /// Mark established with the negotiated MDU, then run `f` under the
    /// link lock.
    pub(crate) fn establish_then(&self, mdu: usize, f: impl FnOnce(LinkView)) -> bool {
        let mut inner = self.lock();
        if inner.machine.transition(LinkState::Active).is_err() {
            return false;
        }
        inner.mdu = mdu;
        tracing::debug!("{} link active, MDU {}", self.name, mdu);
        f(inner.view());
        true
    }

    /// Close unless already closed, running `f` under the link lock when
    /// this call is the one that closed it. Returns whether it did.
    pub(crate) fn close_then(&self, reason: TeardownReason, f: impl FnOnce(LinkView)) -> bool {
        self.advance_then(LinkState::Closed(reason), f)
    }

    /// Record the proven remote identity and run `f` under the link lock.
    /// Does nothing on a closed link.
    pub(crate) fn identify_then(&self, identity: PublicIdentity, f: impl FnOnce(LinkView)) -> bool {
        let mut inner = self.lock();
        if inner.machine.state().is_closed() {
            return false;
        }
        inner.peer = Some(identity);
        f(inner.view());
        true
    }

    /// Run `f` while the link is held open. Returns `None` without calling
    /// `f` if the link is closed.
    ///
    /// Closing takes the same lock, so whatever `f` emits is ordered before
    /// the close notification.
    pub(crate) fn while_open<R>(&self, f: impl FnOnce(LinkView) -> R) -> Option<R> {
        let inner = self.lock();
        if inner.machine.state().is_closed() {
            return None;
        }
        Some(f(inner.view()))
    }
}

/// Snapshot of a link's mutable fields taken under its lock
#[derive(Debug, Clone, Copy)]
pub(crate) struct LinkView {
    pub(crate) link_id: Option<LinkId>,
    pub(crate) peer: Option<PublicIdentity>,
}

impl LinkInner {
    fn view(&self) -> LinkView {
        LinkView {
            link_id: self.link_id,
            peer: self.peer,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_happy_path() {
        let mut machine = LinkStateMachine::new();
        assert_eq!(machine.state(), LinkState::Pending);
        machine.transition(LinkState::Handshaking).unwrap();
        machine.transition(LinkState::Active).unwrap();
        machine
            .transition(LinkState::Closed(TeardownReason::ClosedByPeer))
            .unwrap();
        assert_eq!(
            machine.state(),
            LinkState::Closed(TeardownReason::ClosedByPeer)
        );
    }

    #[test]
    fn test_no_skipping_handshake() {
        let mut machine = LinkStateMachine::new();
        assert_eq!(
            machine.transition(LinkState::Active),
            Err(InvalidTransition {
                from: LinkState::Pending,
                to: LinkState::Active
            })
        );
        assert_eq!(machine.state(), LinkState::Pending);
    }

    #[test]
    fn test_any_state_can_close() {
        for start in [LinkState::Pending, LinkState::Handshaking, LinkState::Active] {
            let machine = LinkStateMachine::starting_at(start);
            assert!(machine.can_transition(LinkState::Closed(TeardownReason::Unknown)));
        }
    }

    #[test]
    fn test_close_reason_mapping() {
        assert_eq!(
            TeardownReason::from(CloseReason::DestinationClosed),
            TeardownReason::ClosedByPeer
        );
        assert_eq!(
            TeardownReason::from(CloseReason::InitiatorClosed),
            TeardownReason::ClosedByPeer
        );
        assert_eq!(
            TeardownReason::from(CloseReason::Timeout),
            TeardownReason::Timeout
        );
        assert_eq!(
            TeardownReason::from(CloseReason::Local),
            TeardownReason::ClosedLocally
        );
        assert_eq!(
            TeardownReason::from(CloseReason::Failed),
            TeardownReason::Unknown
        );
    }

    #[test]
    fn test_link_handle_lifecycle() {
        let link = Link::uplink("Incident Command", Fingerprint::from_bytes([1; 16]), 0);
        assert_eq!(link.state(), LinkState::Pending);
        assert!(!link.establish_then(442, |_| {}));

        assert!(link.advance(LinkState::Handshaking));
        assert!(link.establish_then(442, |_| {}));
        assert_eq!(link.mdu(), 442);
        assert!(link.is_active());

        assert!(link.close_then(TeardownReason::Timeout, |_| {}));
        assert!(!link.close_then(TeardownReason::ClosedLocally, |_| {}));
        assert_eq!(link.teardown_reason(), Some(TeardownReason::Timeout));
    }

    #[test]
    fn test_closed_link_runs_nothing_under_lock() {
        let link = Link::inbound(LinkId::from_bytes([3; 16]), 442);
        let peer = *beacon_crypto::Identity::generate().public();

        assert_eq!(link.while_open(|view| view.link_id), Some(Some(LinkId::from_bytes([3; 16]))));
        assert!(link.identify_then(peer, |view| assert_eq!(view.peer, Some(peer))));

        let mut closed_with = None;
        assert!(link.close_then(TeardownReason::ClosedByPeer, |view| closed_with = view.peer));
        assert_eq!(closed_with, Some(peer));

        assert!(link.while_open(|_| ()).is_none());
        assert!(!link.identify_then(peer, |_| panic!("closed link identified")));
        assert!(!link.close_then(TeardownReason::Timeout, |_| panic!("closed twice")));
    }

    #[test]
    fn test_inbound_starts_handshaking() {
        let link = Link::inbound(LinkId::from_bytes([2; 16]), 442);
        assert_eq!(link.role(), LinkRole::Inbound);
        assert_eq!(link.state(), LinkState::Handshaking);
        assert_eq!(link.link_id(), Some(LinkId::from_bytes([2; 16])));
        assert!(!link.is_identified());
    }

    fn any_state() -> impl Strategy<Value = LinkState> {
        prop_oneof![
            Just(LinkState::Pending),
            Just(LinkState::Handshaking),
            Just(LinkState::Active),
            Just(LinkState::Closed(TeardownReason::Timeout)),
            Just(LinkState::Closed(TeardownReason::ClosedByPeer)),
            Just(LinkState::Closed(TeardownReason::ClosedLocally)),
            Just(LinkState::Closed(TeardownReason::Unknown)),
        ]
    }

    proptest! {
        #[test]
        fn prop_closed_is_terminal(steps in prop::collection::vec(any_state(), 0..32)) {
            let mut machine = LinkStateMachine::new();
            let mut closed_at: Option<LinkState> = None;
            for step in steps {
                let _ = machine.transition(step);
                if let Some(closed) = closed_at {
                    prop_assert_eq!(machine.state(), closed);
                } else if machine.state().is_closed() {
                    closed_at = Some(machine.state());
                }
            }
        }

        #[test]
        fn prop_state_never_moves_backwards(steps in prop::collection::vec(any_state(), 0..32)) {
            fn rank(state: LinkState) -> u8 {
                match state {
                    LinkState::Pending => 0,
                    LinkState::Handshaking => 1,
                    LinkState::Active => 2,
                    LinkState::Closed(_) => 3,
                }
            }
            let mut machine = LinkStateMachine::new();
            for step in steps {
                let before = rank(machine.state());
                let _ = machine.transition(step);
                prop_assert!(rank(machine.state()) >= before);
            }
        }
    }
}
