//! Reconnect sweep planning and the diagnostic snapshot.
//!
//! The sweep is a pure diff between who we should be connected to and who
//! we are connected to. Execution (closing, dialing) is done by the session
//! actor so that teardown always precedes re-dial.

use crate::connection::ConnectionState;
use crate::identity::IdentityKey;
use crate::membership::SessionMembership;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

/// What caused a sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SweepTrigger {
    Interval,
    OnDemand,
    MembershipChange,
}

impl SweepTrigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            SweepTrigger::Interval => "interval",
            SweepTrigger::OnDemand => "on_demand",
            SweepTrigger::MembershipChange => "membership_change",
        }
    }
}

/// Actions required to converge on the expected peer set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Peers we should be connected to.
    pub expected: BTreeSet<IdentityKey>,
    /// Expected peers without a live connection or in-flight dial.
    pub to_dial: Vec<IdentityKey>,
    /// Expected peers with a dial already in flight.
    pub in_flight: Vec<IdentityKey>,
    /// Live peers that are no longer expected.
    pub to_close: Vec<IdentityKey>,
}

impl ReconcilePlan {
    /// Expected peers without a live connection.
    pub fn missing(&self) -> impl Iterator<Item = &IdentityKey> {
        self.to_dial.iter().chain(self.in_flight.iter())
    }
}

/// Summary of an executed sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub dialed: Vec<IdentityKey>,
    pub skipped_in_flight: Vec<IdentityKey>,
    pub closed: Vec<IdentityKey>,
}

/// Point-in-time connectivity summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiagnosticSnapshot {
    pub session_id: String,
    pub local_key: IdentityKey,
    pub peer_ready: bool,
    pub expected_count: usize,
    pub connected_count: usize,
    pub missing_keys: Vec<IdentityKey>,
    pub dialing_keys: Vec<IdentityKey>,
    /// State of every expected peer.
    pub peer_states: BTreeMap<IdentityKey, ConnectionState>,
    /// Missing peers whose last dial exhausted every candidate.
    pub retrying_keys: Vec<IdentityKey>,
    pub local_audio_track_count: usize,
    pub local_video_track_count: usize,
    pub audio_playback_blocked: bool,
    pub generation: u64,
    /// Unix seconds.
    pub taken_at: i64,
}

#[derive(Debug, Clone)]
pub struct ReconnectSweeper {
    interval: Duration,
    sweeps: u64,
}

impl ReconnectSweeper {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sweeps: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn sweeps(&self) -> u64 {
        self.sweeps
    }

    pub fn record(&mut self) {
        self.sweeps += 1;
    }

    /// Diff expected peers against live connections and in-flight dials.
    ///
    /// A local identity that is not itself a member (waiting, refused or
    /// removed) expects no peers.
    pub fn plan(
        membership: &SessionMembership,
        local: &IdentityKey,
        live: &BTreeSet<IdentityKey>,
        dialing: &BTreeSet<IdentityKey>,
    ) -> ReconcilePlan {
        let expected: BTreeSet<IdentityKey> = if membership.contains(local) {
            membership.others(local).into_iter().collect()
        } else {
            BTreeSet::new()
        };

        let (in_flight, to_dial) = expected
            .iter()
            .filter(|key| !live.contains(*key))
            .cloned()
            .partition(|key| dialing.contains(key));
        let to_close = live
            .iter()
            .filter(|key| !expected.contains(*key))
            .cloned()
            .collect();

        ReconcilePlan {
            expected,
            to_dial,
            in_flight,
            to_close,
        }
    }
}
