//! Live connection registry.
//!
//! The [`ConnectionManager`] is owned by the session actor and is the only
//! place a connection becomes live. It enforces:
//!
//! - at most one live connection per identity,
//! - at most one in-flight dial per identity,
//! - results from a stale generation or superseded attempt are rejected,
//! - on glare (both sides dial each other) the connection initiated by the
//!   side with the lower deterministic address is kept.
//!
//! Dialing itself happens in spawned tasks (see [`retry`]); they report back
//! through the actor mailbox carrying the [`DialTicket`] they were issued.

pub mod retry;

use crate::identity::{IdentityKey, TransportAddress};
use crate::media::{MediaStream, MediaTrack, TrackKind};
use crate::transport::PeerConnection;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Per-identity connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Idle,
    Dialing,
    Connected,
    Closed,
}

/// Which side placed the call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outbound,
    Inbound,
}

/// A registered connection.
#[derive(Debug)]
pub struct LiveConnection {
    pub key: IdentityKey,
    pub connection: Arc<dyn PeerConnection>,
    pub remote_stream: MediaStream,
    pub direction: Direction,
    /// Initiated by the side with the lower deterministic address.
    pub canonical: bool,
    /// Cancels the task forwarding this connection's events.
    pub watcher: CancellationToken,
}

impl LiveConnection {
    pub fn id(&self) -> &str {
        self.connection.id()
    }

    /// Stop watching and close the underlying connection.
    pub fn shutdown(&self) {
        self.watcher.cancel();
        self.connection.close();
    }
}

/// Permission to dial one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTicket {
    pub key: IdentityKey,
    pub attempt: u64,
    pub generation: u64,
    /// Deterministic address of the remote side.
    pub peer_address: TransportAddress,
    pub candidates: Vec<TransportAddress>,
}

/// Why a connection was not registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// From an older generation or a superseded attempt.
    Stale,
    /// Identity is not an expected peer.
    NotMember,
    /// A canonical connection for the identity already exists or is dialing.
    Superseded,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RejectReason::Stale => "stale",
            RejectReason::NotMember => "not_member",
            RejectReason::Superseded => "superseded",
        }
    }
}

/// Result of registering a connection.
#[derive(Debug)]
pub enum Registration {
    /// Now live. A replaced connection must be shut down by the caller.
    Registered { replaced: Option<LiveConnection> },
    Rejected(RejectReason),
}

/// Outcome of pushing a track to every live connection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub replaced: usize,
    /// Identities whose connection refused the new track.
    pub failed: Vec<IdentityKey>,
}

#[derive(Debug)]
pub struct ConnectionManager {
    local_address: TransportAddress,
    live: BTreeMap<IdentityKey, LiveConnection>,
    dialing: BTreeMap<IdentityKey, u64>,
    closed: BTreeSet<IdentityKey>,
    next_attempt: u64,
    generation: u64,
    active: bool,
}

impl ConnectionManager {
    pub fn new(local_address: TransportAddress) -> Self {
        Self {
            local_address,
            live: BTreeMap::new(),
            dialing: BTreeMap::new(),
            closed: BTreeSet::new(),
            next_attempt: 1,
            generation: 0,
            active: true,
        }
    }

    pub fn local_address(&self) -> &TransportAddress {
        &self.local_address
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn state(&self, key: &IdentityKey) -> ConnectionState {
        if self.live.contains_key(key) {
            ConnectionState::Connected
        } else if self.dialing.contains_key(key) {
            ConnectionState::Dialing
        } else if self.closed.contains(key) {
            ConnectionState::Closed
        } else {
            ConnectionState::Idle
        }
    }

    pub fn is_connected(&self, key: &IdentityKey) -> bool {
        self.live.contains_key(key)
    }

    pub fn is_dialing(&self, key: &IdentityKey) -> bool {
        self.dialing.contains_key(key)
    }

    pub fn live_keys(&self) -> BTreeSet<IdentityKey> {
        self.live.keys().cloned().collect()
    }

    pub fn dialing_keys(&self) -> BTreeSet<IdentityKey> {
        self.dialing.keys().cloned().collect()
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&LiveConnection> {
        self.live.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LiveConnection> {
        self.live.values()
    }

    pub fn remote_stream(&self, key: &IdentityKey) -> Option<&MediaStream> {
        self.live.get(key).map(|conn| &conn.remote_stream)
    }

    /// Issue a dial ticket unless the identity is already live or dialing.
    pub fn begin_dial(
        &mut self,
        key: IdentityKey,
        peer_address: TransportAddress,
        candidates: Vec<TransportAddress>,
    ) -> Option<DialTicket> {
        if !self.active || self.live.contains_key(&key) || self.dialing.contains_key(&key) {
            return None;
        }
        let attempt = self.next_attempt;
        self.next_attempt += 1;
        self.dialing.insert(key.clone(), attempt);
        self.closed.remove(&key);
        Some(DialTicket {
            key,
            attempt,
            generation: self.generation,
            peer_address,
            candidates,
        })
    }

    /// True while the ticket is the identity's current attempt.
    pub fn is_current(&self, ticket: &DialTicket) -> bool {
        self.active
            && ticket.generation == self.generation
            && self.dialing.get(&ticket.key) == Some(&ticket.attempt)
    }

    fn release_ticket(&mut self, ticket: &DialTicket) -> bool {
        let current = self.is_current(ticket);
        if self.dialing.get(&ticket.key) == Some(&ticket.attempt) {
            self.dialing.remove(&ticket.key);
        }
        current
    }

    /// Record a dial that produced no connection.
    pub fn dial_failed(&mut self, ticket: &DialTicket) {
        if self.release_ticket(ticket) {
            self.closed.insert(ticket.key.clone());
        }
    }

    /// Abandon an in-flight dial so its result is treated as stale.
    pub fn abandon_dial(&mut self, key: &IdentityKey) -> bool {
        self.dialing.remove(key).is_some()
    }

    /// Register the connection produced by a dial ticket.
    pub fn register_outbound(
        &mut self,
        ticket: &DialTicket,
        connection: Arc<dyn PeerConnection>,
        remote_stream: MediaStream,
        watcher: CancellationToken,
        is_member: bool,
    ) -> Registration {
        if !self.release_ticket(ticket) {
            return Registration::Rejected(RejectReason::Stale);
        }
        if !is_member {
            return Registration::Rejected(RejectReason::NotMember);
        }
        let canonical = self.local_address < ticket.peer_address;
        self.insert(LiveConnection {
            key: ticket.key.clone(),
            connection,
            remote_stream,
            direction: Direction::Outbound,
            canonical,
            watcher,
        })
    }

    /// Whether an inbound call from `key` should be answered at all.
    pub fn accepts_inbound(&self, key: &IdentityKey, peer_address: &TransportAddress) -> bool {
        if !self.active {
            return false;
        }
        let canonical = peer_address < &self.local_address;
        if canonical {
            return true;
        }
        let our_canonical_live = self.live.get(key).is_some_and(|conn| conn.canonical);
        !self.dialing.contains_key(key) && !our_canonical_live
    }

    /// Register an answered inbound connection.
    ///
    /// A canonical inbound connection supersedes our own in-flight dial to
    /// the same identity; the caller cancels that dial task.
    pub fn register_inbound(
        &mut self,
        key: IdentityKey,
        peer_address: &TransportAddress,
        connection: Arc<dyn PeerConnection>,
        remote_stream: MediaStream,
        watcher: CancellationToken,
        generation: u64,
    ) -> Registration {
        if !self.active || generation != self.generation {
            return Registration::Rejected(RejectReason::Stale);
        }
        let canonical = peer_address < &self.local_address;
        if self.dialing.contains_key(&key) {
            if !canonical {
                return Registration::Rejected(RejectReason::Superseded);
            }
            debug!(
                target: "session.dial",
                key = %key,
                "Canonical inbound connection supersedes in-flight dial"
            );
            self.dialing.remove(&key);
        }
        self.insert(LiveConnection {
            key,
            connection,
            remote_stream,
            direction: Direction::Inbound,
            canonical,
            watcher,
        })
    }

    fn insert(&mut self, conn: LiveConnection) -> Registration {
        if let Some(existing) = self.live.get(&conn.key) {
            if existing.canonical && !conn.canonical {
                return Registration::Rejected(RejectReason::Superseded);
            }
        }
        self.closed.remove(&conn.key);
        let replaced = self.live.insert(conn.key.clone(), conn);
        Registration::Registered { replaced }
    }

    /// Remove a closed connection, matched by connection id.
    ///
    /// Events from an already-replaced connection are ignored.
    pub fn on_closed(&mut self, key: &IdentityKey, connection_id: &str) -> Option<LiveConnection> {
        if self.live.get(key).map(LiveConnection::id) != Some(connection_id) {
            return None;
        }
        let removed = self.live.remove(key);
        self.closed.insert(key.clone());
        removed
    }

    /// Update the remote stream after renegotiation.
    pub fn update_remote_stream(
        &mut self,
        key: &IdentityKey,
        connection_id: &str,
        stream: MediaStream,
    ) -> bool {
        match self.live.get_mut(key) {
            Some(conn) if conn.id() == connection_id => {
                conn.remote_stream = stream;
                true
            }
            _ => false,
        }
    }

    /// Drop dials outside `expected` and take the live connections in
    /// `to_close`.
    ///
    /// Returned connections must be shut down by the caller.
    pub fn close_unexpected(
        &mut self,
        expected: &BTreeSet<IdentityKey>,
        to_close: &[IdentityKey],
    ) -> Vec<LiveConnection> {
        self.dialing.retain(|key, _| expected.contains(key));
        to_close
            .iter()
            .filter_map(|key| self.live.remove(key))
            .collect()
    }

    /// Stop accepting work and hand back every live connection.
    ///
    /// Bumps the generation so all in-flight results become stale.
    pub fn deactivate(&mut self) -> Vec<LiveConnection> {
        self.active = false;
        self.generation += 1;
        self.dialing.clear();
        std::mem::take(&mut self.live).into_values().collect()
    }

    /// Push an outgoing track to every live connection.
    pub async fn replace_outgoing_track(
        &self,
        kind: TrackKind,
        track: Option<MediaTrack>,
    ) -> ReplaceSummary {
        let mut summary = ReplaceSummary::default();
        for conn in self.live.values() {
            match conn.connection.replace_track(kind, track.clone()).await {
                Ok(()) => summary.replaced += 1,
                Err(e) => {
                    warn!(
                        target: "session.media",
                        key = %conn.key,
                        connection_id = %conn.id(),
                        error = %e,
                        "Track replacement failed"
                    );
                    summary.failed.push(conn.key.clone());
                }
            }
        }
        summary
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::errors::TransportError;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug)]
    struct StubConnection {
        id: String,
        remote: TransportAddress,
        closed: AtomicBool,
        refuse_tracks: bool,
    }

    impl StubConnection {
        fn new(id: &str, remote: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                remote: TransportAddress::new(remote),
                closed: AtomicBool::new(false),
                refuse_tracks: false,
            })
        }
    }

    #[async_trait]
    impl PeerConnection for StubConnection {
        fn id(&self) -> &str {
            &self.id
        }

        fn remote_address(&self) -> &TransportAddress {
            &self.remote
        }

        async fn answer(&self, _local: &MediaStream) -> Result<(), TransportError> {
            Ok(())
        }

        async fn replace_track(
            &self,
            _kind: TrackKind,
            _track: Option<MediaTrack>,
        ) -> Result<(), TransportError> {
            if self.refuse_tracks {
                Err(TransportError::Closed)
            } else {
                Ok(())
            }
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn key(raw: &str) -> IdentityKey {
        IdentityKey::from_canonical(raw)
    }

    fn manager(local: &str) -> ConnectionManager {
        ConnectionManager::new(TransportAddress::new(local))
    }

    fn ticket(manager: &mut ConnectionManager, raw: &str, peer: &str) -> DialTicket {
        manager
            .begin_dial(key(raw), TransportAddress::new(peer), vec![TransportAddress::new(peer)])
            .unwrap()
    }

    #[test]
    fn test_single_in_flight_dial_per_identity() {
        let mut manager = manager("dt-a");
        let first = ticket(&mut manager, "email:b@x.io", "dt-b");

        assert!(manager
            .begin_dial(key("email:b@x.io"), TransportAddress::new("dt-b"), vec![])
            .is_none());
        assert_eq!(manager.state(&key("email:b@x.io")), ConnectionState::Dialing);

        manager.dial_failed(&first);
        assert_eq!(manager.state(&key("email:b@x.io")), ConnectionState::Closed);
        assert!(manager
            .begin_dial(key("email:b@x.io"), TransportAddress::new("dt-b"), vec![])
            .is_some());
    }

    #[test]
    fn test_register_outbound_and_reject_duplicates() {
        let mut manager = manager("dt-a");
        let t = ticket(&mut manager, "email:b@x.io", "dt-b");
        let conn = StubConnection::new("c1", "dt-b");

        let registration = manager.register_outbound(
            &t,
            conn,
            MediaStream::empty(),
            CancellationToken::new(),
            true,
        );
        assert!(matches!(
            registration,
            Registration::Registered { replaced: None }
        ));
        assert_eq!(manager.live_count(), 1);
        assert!(manager.get(&key("email:b@x.io")).unwrap().canonical);

        // Replaying the same ticket is stale
        let again = manager.register_outbound(
            &t,
            StubConnection::new("c2", "dt-b"),
            MediaStream::empty(),
            CancellationToken::new(),
            true,
        );
        assert!(matches!(again, Registration::Rejected(RejectReason::Stale)));
        assert_eq!(manager.live_count(), 1);
    }

    #[test]
    fn test_generation_bump_rejects_in_flight_results() {
        let mut manager = manager("dt-a");
        let t = ticket(&mut manager, "email:b@x.io", "dt-b");

        let drained = manager.deactivate();
        assert!(drained.is_empty());
        assert!(!manager.is_current(&t));

        let registration = manager.register_outbound(
            &t,
            StubConnection::new("c1", "dt-b"),
            MediaStream::empty(),
            CancellationToken::new(),
            true,
        );
        assert!(matches!(
            registration,
            Registration::Rejected(RejectReason::Stale)
        ));
        assert!(manager
            .begin_dial(key("email:b@x.io"), TransportAddress::new("dt-b"), vec![])
            .is_none());
    }

    #[test]
    fn test_non_member_result_is_rejected() {
        let mut manager = manager("dt-a");
        let t = ticket(&mut manager, "email:b@x.io", "dt-b");
        let registration = manager.register_outbound(
            &t,
            StubConnection::new("c1", "dt-b"),
            MediaStream::empty(),
            CancellationToken::new(),
            false,
        );
        assert!(matches!(
            registration,
            Registration::Rejected(RejectReason::NotMember)
        ));
        assert_eq!(manager.live_count(), 0);
    }

    #[test]
    fn test_glare_lower_address_side_keeps_its_dial() {
        // We are the lower address: our dial is canonical.
        let mut low = manager("dt-a");
        let _t = ticket(&mut low, "email:b@x.io", "dt-b");
        let peer = TransportAddress::new("dt-b");
        assert!(!low.accepts_inbound(&key("email:b@x.io"), &peer));
        let inbound = low.register_inbound(
            key("email:b@x.io"),
            &peer,
            StubConnection::new("in-1", "dt-b"),
            MediaStream::empty(),
            CancellationToken::new(),
            low.generation(),
        );
        assert!(matches!(
            inbound,
            Registration::Rejected(RejectReason::Superseded)
        ));

        // We are the higher address: the inbound call is canonical.
        let mut high = manager("dt-b");
        let t = ticket(&mut high, "email:a@x.io", "dt-a");
        let peer = TransportAddress::new("dt-a");
        assert!(high.accepts_inbound(&key("email:a@x.io"), &peer));
        let generation = high.generation();
        let inbound = high.register_inbound(
            key("email:a@x.io"),
            &peer,
            StubConnection::new("in-2", "dt-a"),
            MediaStream::empty(),
            CancellationToken::new(),
            generation,
        );
        assert!(matches!(inbound, Registration::Registered { .. }));
        assert!(!high.is_current(&t));
        assert_eq!(high.live_count(), 1);
    }

    #[test]
    fn test_canonical_connection_is_not_replaced() {
        let mut manager = manager("dt-b");
        let peer = TransportAddress::new("dt-a");
        let generation = manager.generation();
        manager.register_inbound(
            key("email:a@x.io"),
            &peer,
            StubConnection::new("canonical", "dt-a"),
            MediaStream::empty(),
            CancellationToken::new(),
            generation,
        );

        let t = ticket(&mut manager, "email:c@x.io", "dt-c");
        manager.dial_failed(&t);

        // A non-canonical duplicate never displaces the canonical one
        assert!(!manager.accepts_inbound(&key("email:a@x.io"), &TransportAddress::new("dt-z")));
        assert_eq!(manager.get(&key("email:a@x.io")).unwrap().id(), "canonical");
    }

    #[test]
    fn test_on_closed_matches_connection_id() {
        let mut manager = manager("dt-a");
        let t = ticket(&mut manager, "email:b@x.io", "dt-b");
        manager.register_outbound(
            &t,
            StubConnection::new("c1", "dt-b"),
            MediaStream::empty(),
            CancellationToken::new(),
            true,
        );

        assert!(manager.on_closed(&key("email:b@x.io"), "old").is_none());
        assert_eq!(manager.live_count(), 1);

        let removed = manager.on_closed(&key("email:b@x.io"), "c1").unwrap();
        assert_eq!(removed.id(), "c1");
        assert_eq!(manager.state(&key("email:b@x.io")), ConnectionState::Closed);
    }

    #[test]
    fn test_close_unexpected_drops_others() {
        let mut manager = manager("dt-a");
        for (raw, peer, id) in [("email:b@x.io", "dt-b", "c1"), ("email:c@x.io", "dt-c", "c2")] {
            let t = ticket(&mut manager, raw, peer);
            manager.register_outbound(
                &t,
                StubConnection::new(id, peer),
                MediaStream::empty(),
                CancellationToken::new(),
                true,
            );
        }
        let pending = ticket(&mut manager, "email:d@x.io", "dt-d");

        let expected = BTreeSet::from([key("email:b@x.io")]);
        let to_close = vec![key("email:c@x.io")];
        let dropped = manager.close_unexpected(&expected, &to_close);

        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped.first().unwrap().key, key("email:c@x.io"));
        assert!(!manager.is_current(&pending));
        assert_eq!(manager.live_keys(), expected);
    }

    #[tokio::test]
    async fn test_replace_outgoing_track_reports_failures() {
        let mut manager = manager("dt-a");
        let t = ticket(&mut manager, "email:b@x.io", "dt-b");
        manager.register_outbound(
            &t,
            StubConnection::new("ok", "dt-b"),
            MediaStream::empty(),
            CancellationToken::new(),
            true,
        );
        let t = ticket(&mut manager, "email:c@x.io", "dt-c");
        manager.register_outbound(
            &t,
            Arc::new(StubConnection {
                id: "broken".to_string(),
                remote: TransportAddress::new("dt-c"),
                closed: AtomicBool::new(false),
                refuse_tracks: true,
            }),
            MediaStream::empty(),
            CancellationToken::new(),
            true,
        );

        let summary = manager
            .replace_outgoing_track(TrackKind::Video, Some(MediaTrack::new(TrackKind::Video, "cam")))
            .await;

        assert_eq!(summary.replaced, 1);
        assert_eq!(summary.failed, vec![key("email:c@x.io")]);
    }
}
