//! Message types for the session actor.
//!
//! Requests from a [`super::SessionHandle`] carry a `oneshot` reply channel.
//! Internal messages are posted back into the mailbox by tasks the actor
//! spawned (dials, inbound answers, connection watchers, capture prompts)
//! so that every state change happens on the actor.

use crate::connection::retry::DialOutcome;
use crate::connection::{DialTicket, Direction};
use crate::errors::{MediaError, SessionError};
use crate::identity::{IdentityKey, ParticipantRef, TransportAddress};
use crate::media::{MediaKind, MediaStream};
use crate::meeting_control::{ControlOutcome, JoinDecision, MeetingControlState};
use crate::metadata::SessionPatch;
use crate::router::RenderTile;
use crate::screen_share::ScreenShareOwnership;
use crate::sweeper::{DiagnosticSnapshot, SweepReport};
use crate::transport::{PeerEvent, PeerLink};
use serde::Serialize;
use std::time::Duration;
use tokio::sync::oneshot;

use super::metrics::SessionMetricsSnapshot;

/// Messages sent to `SessionActor`.
#[derive(Debug)]
pub enum SessionMessage {
    /// Acquire media, join and start reconciling.
    Start {
        respond_to: oneshot::Sender<Result<JoinDecision, SessionError>>,
    },

    /// Another participant asks to join through us.
    Join {
        participant: ParticipantRef,
        respond_to: oneshot::Sender<Result<JoinDecision, SessionError>>,
    },

    /// Add an invitee directly to the participant list.
    Invite {
        participant: ParticipantRef,
        respond_to: oneshot::Sender<Result<IdentityKey, SessionError>>,
    },

    /// Host removes a participant.
    RemoveParticipant {
        key: IdentityKey,
        respond_to: oneshot::Sender<Result<ControlOutcome, SessionError>>,
    },

    ToggleLobby {
        respond_to: oneshot::Sender<Result<ControlOutcome, SessionError>>,
    },

    ToggleLock {
        respond_to: oneshot::Sender<Result<ControlOutcome, SessionError>>,
    },

    Admit {
        key: IdentityKey,
        respond_to: oneshot::Sender<Result<ControlOutcome, SessionError>>,
    },

    AdmitAll {
        respond_to: oneshot::Sender<Result<ControlOutcome, SessionError>>,
    },

    SetMuted {
        muted: bool,
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    /// Switch camera/microphone without tearing down connections.
    SwitchDevice {
        device_id: Option<String>,
        respond_to: oneshot::Sender<Result<usize, SessionError>>,
    },

    /// Re-acquire a source and push it to every live connection.
    ReplaceOutgoingTrack {
        kind: MediaKind,
        respond_to: oneshot::Sender<Result<usize, SessionError>>,
    },

    StartScreenShare {
        respond_to: oneshot::Sender<Result<ScreenShareOwnership, SessionError>>,
    },

    StopScreenShare {
        respond_to: oneshot::Sender<Result<bool, SessionError>>,
    },

    /// Retry blocked playback after a user gesture.
    UserInteraction {
        respond_to: oneshot::Sender<Result<bool, SessionError>>,
    },

    StreamFor {
        key: IdentityKey,
        respond_to: oneshot::Sender<Option<MediaStream>>,
    },

    RenderTiles {
        respond_to: oneshot::Sender<Vec<RenderTile>>,
    },

    Diagnostics {
        respond_to: oneshot::Sender<DiagnosticSnapshot>,
    },

    RunSweep {
        respond_to: oneshot::Sender<SweepReport>,
    },

    Notices {
        respond_to: oneshot::Sender<Vec<Notice>>,
    },

    DismissNotice {
        id: u64,
        respond_to: oneshot::Sender<bool>,
    },

    /// A patch published by another participant.
    RemotePatch { patch: SessionPatch },

    GetState {
        respond_to: oneshot::Sender<SessionState>,
    },

    /// Leave the session.
    Leave {
        respond_to: oneshot::Sender<Result<(), SessionError>>,
    },

    // ------------------------------------------------------------------
    // Internal
    // ------------------------------------------------------------------
    /// A dial task finished.
    DialSettled {
        ticket: DialTicket,
        outcome: DialOutcome,
        elapsed: Duration,
    },

    /// An answered inbound call delivered media (or failed to).
    InboundSettled {
        key: IdentityKey,
        remote_address: TransportAddress,
        generation: u64,
        link: PeerLink,
        result: Result<MediaStream, String>,
    },

    /// Event from a live connection's watcher.
    ConnectionEvent {
        key: IdentityKey,
        connection_id: String,
        event: PeerEvent,
    },

    /// The display picker resolved.
    ScreenCaptureSettled {
        result: Result<MediaStream, MediaError>,
        respond_to: oneshot::Sender<Result<ScreenShareOwnership, SessionError>>,
    },

    /// The local screen track ended (platform "stop sharing").
    ScreenTrackEnded { token: u64 },
}

/// A persistent, dismissible user-facing notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notice {
    pub id: u64,
    pub kind: NoticeKind,
    pub message: String,
    /// Unix seconds.
    pub raised_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    MediaUnavailable,
    AudioBlocked,
    JoinRefused,
}

/// One live connection, as reported by `GetState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionSummary {
    pub key: IdentityKey,
    pub connection_id: String,
    pub direction: Direction,
    pub canonical: bool,
}

/// Session state snapshot (for debugging and tests).
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub session_id: String,
    pub local_key: IdentityKey,
    pub started: bool,
    pub active: bool,
    pub generation: u64,
    pub members: Vec<IdentityKey>,
    pub connections: Vec<ConnectionSummary>,
    pub dialing: Vec<IdentityKey>,
    pub control: MeetingControlState,
    pub screen_share: ScreenShareOwnership,
    pub presenting: bool,
    pub muted: bool,
    pub metrics: SessionMetricsSnapshot,
}
