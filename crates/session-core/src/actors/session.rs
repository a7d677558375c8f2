//! `SessionActor` - owns one participant's view of a multi-party session.
//!
//! The actor is the single writer of every piece of session state:
//! membership, the connection registry, local media, screen-share ownership
//! and meeting controls. Slow work (dialing, waiting for inbound media,
//! capture prompts, connection event streams) runs in spawned tasks that
//! post their results back into the mailbox, so the actor never blocks on
//! the network and never observes a half-applied change.
//!
//! # Reconciliation
//!
//! Every membership change and every sweep interval runs the same pass:
//! connections to identities no longer expected are closed first, then
//! expected identities with neither a live connection nor a dial in flight
//! are dialed. Results are tagged with a ticket and generation; anything
//! that settles after a leave or a superseding change is closed on arrival.

use crate::config::SessionSettings;
use crate::connection::retry::{dial_with_fallback, wait_for_media, DialOutcome};
use crate::connection::{ConnectionManager, DialTicket, Registration};
use crate::errors::{MediaError, SessionError};
use crate::identity::{Directory, IdentityKey, IdentityResolver, ParticipantRef, TransportAddress};
use crate::media::{LocalMediaController, MediaDevices, MediaKind, MediaStream, TrackKind};
use crate::meeting_control::{ControlAction, ControlOutcome, JoinDecision};
use crate::membership::SessionMembership;
use crate::metadata::{MetadataChannel, SessionDocument, SessionPatch};
use crate::observability::metrics as prom;
use crate::router::{RenderTile, StreamRouter};
use crate::screen_share::{ScreenShareArbiter, ScreenShareOwnership, StartPermit, StartRejection};
use crate::sweeper::{DiagnosticSnapshot, ReconnectSweeper, SweepReport, SweepTrigger};
use crate::transport::{IncomingCall, PeerEvent, PeerLink, PeerTransport};

use super::messages::{
    ConnectionSummary, Notice, NoticeKind, SessionMessage, SessionState,
};
use super::metrics::{MailboxMonitor, SessionMetrics};

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Default channel buffer size for the session mailbox.
const SESSION_CHANNEL_BUFFER: usize = 256;

/// Collaborators injected into a session.
pub struct SessionDeps {
    pub transport: Arc<dyn PeerTransport>,
    pub devices: Arc<dyn MediaDevices>,
    pub metadata: Arc<dyn MetadataChannel>,
    pub directory: Arc<dyn Directory>,
    /// Calls placed to this participant's addresses.
    pub incoming: mpsc::Receiver<IncomingCall>,
}

/// Handle to a `SessionActor`.
#[derive(Clone, Debug)]
pub struct SessionHandle {
    sender: mpsc::Sender<SessionMessage>,
    cancel_token: CancellationToken,
    session_id: String,
    local_key: IdentityKey,
}

impl SessionHandle {
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Canonical identity of the local participant.
    #[must_use]
    pub fn local_key(&self) -> &IdentityKey {
        &self.local_key
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> SessionMessage,
    ) -> Result<T, SessionError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| SessionError::SessionEnded)?;
        rx.await.map_err(|_| SessionError::SessionEnded)
    }

    /// Acquire local media, join and begin connecting to every member.
    pub async fn start(&self) -> Result<JoinDecision, SessionError> {
        self.request(|respond_to| SessionMessage::Start { respond_to })
            .await?
    }

    /// Evaluate a join request from another participant.
    pub async fn join(&self, participant: ParticipantRef) -> Result<JoinDecision, SessionError> {
        self.request(|respond_to| SessionMessage::Join {
            participant,
            respond_to,
        })
        .await?
    }

    /// Add an invitee to the session.
    pub async fn invite(&self, participant: ParticipantRef) -> Result<IdentityKey, SessionError> {
        self.request(|respond_to| SessionMessage::Invite {
            participant,
            respond_to,
        })
        .await?
    }

    pub async fn remove_participant(
        &self,
        key: IdentityKey,
    ) -> Result<ControlOutcome, SessionError> {
        self.request(|respond_to| SessionMessage::RemoveParticipant { key, respond_to })
            .await?
    }

    pub async fn toggle_lobby(&self) -> Result<ControlOutcome, SessionError> {
        self.request(|respond_to| SessionMessage::ToggleLobby { respond_to })
            .await?
    }

    pub async fn toggle_lock(&self) -> Result<ControlOutcome, SessionError> {
        self.request(|respond_to| SessionMessage::ToggleLock { respond_to })
            .await?
    }

    pub async fn admit(&self, key: IdentityKey) -> Result<ControlOutcome, SessionError> {
        self.request(|respond_to| SessionMessage::Admit { key, respond_to })
            .await?
    }

    pub async fn admit_all(&self) -> Result<ControlOutcome, SessionError> {
        self.request(|respond_to| SessionMessage::AdmitAll { respond_to })
            .await?
    }

    pub async fn set_muted(&self, muted: bool) -> Result<(), SessionError> {
        self.request(|respond_to| SessionMessage::SetMuted { muted, respond_to })
            .await?
    }

    /// Switch capture device. Returns the number of connections updated.
    pub async fn switch_device(&self, device_id: Option<String>) -> Result<usize, SessionError> {
        self.request(|respond_to| SessionMessage::SwitchDevice {
            device_id,
            respond_to,
        })
        .await?
    }

    /// Re-acquire a source and push it to every live connection.
    pub async fn replace_outgoing_track(&self, kind: MediaKind) -> Result<usize, SessionError> {
        self.request(|respond_to| SessionMessage::ReplaceOutgoingTrack { kind, respond_to })
            .await?
    }

    pub async fn start_screen_share(&self) -> Result<ScreenShareOwnership, SessionError> {
        self.request(|respond_to| SessionMessage::StartScreenShare { respond_to })
            .await?
    }

    /// Stop presenting. Returns false if we were not the owner.
    pub async fn stop_screen_share(&self) -> Result<bool, SessionError> {
        self.request(|respond_to| SessionMessage::StopScreenShare { respond_to })
            .await?
    }

    /// Report a user gesture. Returns true once no playback is blocked.
    pub async fn user_interaction(&self) -> Result<bool, SessionError> {
        self.request(|respond_to| SessionMessage::UserInteraction { respond_to })
            .await?
    }

    pub async fn stream_for(&self, key: IdentityKey) -> Result<Option<MediaStream>, SessionError> {
        self.request(|respond_to| SessionMessage::StreamFor { key, respond_to })
            .await
    }

    pub async fn render_tiles(&self) -> Result<Vec<RenderTile>, SessionError> {
        self.request(|respond_to| SessionMessage::RenderTiles { respond_to })
            .await
    }

    pub async fn diagnostics(&self) -> Result<DiagnosticSnapshot, SessionError> {
        self.request(|respond_to| SessionMessage::Diagnostics { respond_to })
            .await
    }

    /// Run a reconnect sweep now.
    pub async fn run_sweep(&self) -> Result<SweepReport, SessionError> {
        self.request(|respond_to| SessionMessage::RunSweep { respond_to })
            .await
    }

    pub async fn notices(&self) -> Result<Vec<Notice>, SessionError> {
        self.request(|respond_to| SessionMessage::Notices { respond_to })
            .await
    }

    pub async fn dismiss_notice(&self, id: u64) -> Result<bool, SessionError> {
        self.request(|respond_to| SessionMessage::DismissNotice { id, respond_to })
            .await
    }

    /// Deliver a patch published by another participant.
    pub async fn apply_remote_patch(&self, patch: SessionPatch) -> Result<(), SessionError> {
        self.sender
            .send(SessionMessage::RemotePatch { patch })
            .await
            .map_err(|_| SessionError::SessionEnded)
    }

    pub async fn get_state(&self) -> Result<SessionState, SessionError> {
        self.request(|respond_to| SessionMessage::GetState { respond_to })
            .await
    }

    /// Leave the session: close every connection and release media.
    ///
    /// The actor keeps answering queries until cancelled.
    pub async fn leave(&self) -> Result<(), SessionError> {
        self.request(|respond_to| SessionMessage::Leave { respond_to })
            .await?
    }

    /// Cancel the session actor.
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }
}

/// Post a message from a spawned task, handing it back if the actor is gone.
async fn post(
    mailbox: &mpsc::WeakSender<SessionMessage>,
    message: SessionMessage,
) -> Result<(), SessionMessage> {
    match mailbox.upgrade() {
        Some(sender) => sender.send(message).await.map_err(|e| e.0),
        None => Err(message),
    }
}

/// Release resources carried by an undeliverable message.
fn discard(message: SessionMessage) {
    match message {
        SessionMessage::DialSettled {
            outcome: DialOutcome::Connected { link, .. },
            ..
        }
        | SessionMessage::InboundSettled { link, .. } => link.connection.close(),
        SessionMessage::ScreenCaptureSettled {
            result: Ok(stream), ..
        } => stream.stop_all(),
        _ => {}
    }
}

/// Identities whose addresses callers are attributed to: members, then
/// removed and waiting identities so their calls are recognized and refused.
fn address_owners<'a>(
    membership: &'a SessionMembership,
    document: &'a SessionDocument,
) -> impl Iterator<Item = (&'a IdentityKey, Option<&'a ParticipantRef>)> {
    let outsiders = document
        .removed
        .iter()
        .chain(document.control.waiting_room.iter())
        .filter(move |key| !membership.contains(key))
        .map(|key| (key, None));
    membership.entries().chain(outsiders)
}

/// The `SessionActor` implementation.
pub struct SessionActor {
    session_id: String,
    local_ref: ParticipantRef,
    local_key: IdentityKey,
    receiver: mpsc::Receiver<SessionMessage>,
    /// Weak so that dropping every handle ends the actor.
    mailbox_sender: mpsc::WeakSender<SessionMessage>,
    cancel_token: CancellationToken,
    incoming: mpsc::Receiver<IncomingCall>,
    incoming_open: bool,
    settings: SessionSettings,
    transport: Arc<dyn PeerTransport>,
    metadata: Arc<dyn MetadataChannel>,
    resolver: IdentityResolver,
    document: SessionDocument,
    membership: SessionMembership,
    connections: ConnectionManager,
    media: LocalMediaController,
    router: StreamRouter,
    arbiter: ScreenShareArbiter,
    sweeper: ReconnectSweeper,
    /// In-flight dial tasks by identity: (attempt, cancel token).
    dial_tasks: BTreeMap<IdentityKey, (u64, CancellationToken)>,
    /// Answered inbound calls still waiting for media.
    pending_inbound: BTreeSet<IdentityKey>,
    /// Expected peers whose last dial exhausted every candidate.
    retrying: BTreeSet<IdentityKey>,
    /// Remote streams waiting on a user gesture to play.
    blocked_playback: BTreeMap<IdentityKey, MediaStream>,
    /// Cancels the watcher on the current screen capture track.
    screen_watch: Option<CancellationToken>,
    notices: Vec<Notice>,
    next_notice_id: u64,
    started: bool,
    metrics: SessionMetrics,
    mailbox: MailboxMonitor,
}

impl SessionActor {
    /// Spawn a new session actor.
    ///
    /// Returns a handle and the task join handle.
    ///
    /// # Arguments
    ///
    /// * `settings` - Dial, sweep and addressing parameters
    /// * `local` - Reference to the local participant
    /// * `document` - Initial copy of the shared session document
    /// * `deps` - Transport, devices, metadata channel and directory
    /// * `cancel_token` - Cancellation token for the actor and its tasks
    pub fn spawn(
        settings: SessionSettings,
        local: ParticipantRef,
        document: SessionDocument,
        deps: SessionDeps,
        cancel_token: CancellationToken,
    ) -> (SessionHandle, JoinHandle<()>) {
        let (sender, receiver) = mpsc::channel(SESSION_CHANNEL_BUFFER);

        let mut resolver = IdentityResolver::new(
            deps.directory,
            settings.address_prefix.clone(),
            settings.legacy_address_prefix.clone(),
        );
        let local_key = resolver.register(&local);

        let mut document = document;
        if document.control.host_id.is_none() {
            if let Some(host) = document.host_reference().cloned() {
                document.control.host_id = Some(resolver.register(&host));
            }
        }
        let membership = SessionMembership::derive(&document, &mut resolver);
        resolver.rebuild_address_table(
            address_owners(&membership, &document),
            &document.observed_addresses,
        );

        let mut arbiter = ScreenShareArbiter::new(settings.screen_share_cooldown);
        arbiter.apply_remote(&document.screen_share);

        let session_id = document.session_id.clone();
        let actor = Self {
            session_id: session_id.clone(),
            local_ref: local,
            local_key: local_key.clone(),
            receiver,
            mailbox_sender: sender.downgrade(),
            cancel_token: cancel_token.clone(),
            incoming: deps.incoming,
            incoming_open: true,
            connections: ConnectionManager::new(resolver.to_address(&local_key)),
            sweeper: ReconnectSweeper::new(settings.sweep_interval),
            settings,
            transport: deps.transport,
            metadata: deps.metadata,
            resolver,
            document,
            membership,
            media: LocalMediaController::new(deps.devices),
            router: StreamRouter::new(local_key.clone()),
            arbiter,
            dial_tasks: BTreeMap::new(),
            pending_inbound: BTreeSet::new(),
            retrying: BTreeSet::new(),
            blocked_playback: BTreeMap::new(),
            screen_watch: None,
            notices: Vec::new(),
            next_notice_id: 1,
            started: false,
            metrics: SessionMetrics::default(),
            mailbox: MailboxMonitor::new(&session_id),
        };

        let task_handle = tokio::spawn(actor.run());

        let handle = SessionHandle {
            sender,
            cancel_token,
            session_id,
            local_key,
        };

        (handle, task_handle)
    }

    /// Run the actor message loop.
    #[instrument(skip_all, name = "session.actor", fields(session_id = %self.session_id))]
    async fn run(mut self) {
        info!(
            target: "session.actor",
            session_id = %self.session_id,
            local = %self.local_key,
            address = %self.connections.local_address(),
            "SessionActor started"
        );

        let period = self.sweeper.interval();
        let mut sweep_tick = tokio::time::interval_at(Instant::now() + period, period);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = self.cancel_token.cancelled() => {
                    info!(
                        target: "session.actor",
                        session_id = %self.session_id,
                        "SessionActor received cancellation signal"
                    );
                    self.teardown("cancelled");
                    break;
                }

                _ = sweep_tick.tick() => {
                    self.sweep(SweepTrigger::Interval);
                }

                call = self.incoming.recv(), if self.incoming_open => {
                    match call {
                        Some(call) => self.handle_incoming(call).await,
                        None => self.incoming_open = false,
                    }
                }

                msg = self.receiver.recv() => {
                    match msg {
                        Some(message) => {
                            self.mailbox.record_enqueue();
                            self.handle_message(message).await;
                            self.mailbox.record_dequeue();
                        }
                        None => {
                            info!(
                                target: "session.actor",
                                session_id = %self.session_id,
                                "SessionActor channel closed, exiting"
                            );
                            self.teardown("handles dropped");
                            break;
                        }
                    }
                }
            }
        }

        info!(
            target: "session.actor",
            session_id = %self.session_id,
            sweeps = self.sweeper.sweeps(),
            messages_processed = self.mailbox.messages_processed(),
            "SessionActor stopped"
        );
    }

    /// Handle a single message.
    async fn handle_message(&mut self, message: SessionMessage) {
        match message {
            SessionMessage::Start { respond_to } => {
                let result = self.handle_start().await;
                let _ = respond_to.send(result);
            }
            SessionMessage::Join {
                participant,
                respond_to,
            } => {
                let result = self.handle_join(participant).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::Invite {
                participant,
                respond_to,
            } => {
                let result = self.handle_invite(participant).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::RemoveParticipant { key, respond_to } => {
                let result = self.handle_remove(key).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::ToggleLobby { respond_to } => {
                let result = self.handle_toggle(ControlAction::ToggleLobby).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::ToggleLock { respond_to } => {
                let result = self.handle_toggle(ControlAction::ToggleLock).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::Admit { key, respond_to } => {
                let result = self.handle_admit(Some(key)).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::AdmitAll { respond_to } => {
                let result = self.handle_admit(None).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::SetMuted { muted, respond_to } => {
                let result = if self.connections.is_active() {
                    self.media.set_muted(muted);
                    Ok(())
                } else {
                    Err(SessionError::SessionEnded)
                };
                let _ = respond_to.send(result);
            }
            SessionMessage::SwitchDevice {
                device_id,
                respond_to,
            } => {
                let result = self.handle_switch_device(device_id).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::ReplaceOutgoingTrack { kind, respond_to } => {
                let result = match kind {
                    MediaKind::Camera => self.handle_switch_device(None).await,
                    MediaKind::Screen => self.handle_replace_screen().await,
                };
                let _ = respond_to.send(result);
            }
            SessionMessage::StartScreenShare { respond_to } => {
                self.handle_start_screen_share(respond_to);
            }
            SessionMessage::StopScreenShare { respond_to } => {
                let stopped = self.stop_screen_share_local(None).await;
                let _ = respond_to.send(Ok(stopped));
            }
            SessionMessage::UserInteraction { respond_to } => {
                let result = self.handle_user_interaction().await;
                let _ = respond_to.send(result);
            }
            SessionMessage::StreamFor { key, respond_to } => {
                let _ = respond_to.send(self.router.stream_for(&key, &self.media, &self.connections));
            }
            SessionMessage::RenderTiles { respond_to } => {
                let _ = respond_to.send(self.router.tiles(
                    &self.membership,
                    &self.media,
                    &self.connections,
                ));
            }
            SessionMessage::Diagnostics { respond_to } => {
                let _ = respond_to.send(self.diagnostics());
            }
            SessionMessage::RunSweep { respond_to } => {
                let _ = respond_to.send(self.sweep(SweepTrigger::OnDemand));
            }
            SessionMessage::Notices { respond_to } => {
                let _ = respond_to.send(self.notices.clone());
            }
            SessionMessage::DismissNotice { id, respond_to } => {
                let before = self.notices.len();
                self.notices.retain(|notice| notice.id != id);
                let _ = respond_to.send(self.notices.len() != before);
            }
            SessionMessage::RemotePatch { patch } => {
                self.handle_remote_patch(patch).await;
            }
            SessionMessage::GetState { respond_to } => {
                let _ = respond_to.send(self.state());
            }
            SessionMessage::Leave { respond_to } => {
                self.handle_leave().await;
                let _ = respond_to.send(Ok(()));
            }
            SessionMessage::DialSettled {
                ticket,
                outcome,
                elapsed,
            } => {
                self.handle_dial_settled(ticket, outcome, elapsed).await;
            }
            SessionMessage::InboundSettled {
                key,
                remote_address,
                generation,
                link,
                result,
            } => {
                self.handle_inbound_settled(key, remote_address, generation, link, result)
                    .await;
            }
            SessionMessage::ConnectionEvent {
                key,
                connection_id,
                event,
            } => {
                self.handle_connection_event(key, connection_id, event)
                    .await;
            }
            SessionMessage::ScreenCaptureSettled { result, respond_to } => {
                let result = self.handle_screen_capture_settled(result).await;
                let _ = respond_to.send(result);
            }
            SessionMessage::ScreenTrackEnded { token } => {
                if self.stop_screen_share_local(Some(token)).await {
                    info!(
                        target: "session.screen_share",
                        session_id = %self.session_id,
                        token,
                        "Screen share ended by the platform"
                    );
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Membership and admission
    // ------------------------------------------------------------------

    #[instrument(skip_all, fields(session_id = %self.session_id))]
    async fn handle_start(&mut self) -> Result<JoinDecision, SessionError> {
        if !self.connections.is_active() {
            return Err(SessionError::SessionEnded);
        }
        if self.started {
            return Ok(self.local_join_state());
        }
        self.started = true;

        if let Err(e) = self.media.acquire_camera(None).await {
            self.raise_media_notice(&e);
        }

        let decision = self.evaluate_join(self.local_ref.clone()).await;
        if decision == JoinDecision::Refused {
            self.raise_notice(NoticeKind::JoinRefused, "This meeting is locked".to_string());
        }
        info!(
            target: "session.control",
            session_id = %self.session_id,
            local = %self.local_key,
            decision = ?decision,
            "Session started"
        );

        self.sweep(SweepTrigger::MembershipChange);
        Ok(decision)
    }

    fn local_join_state(&self) -> JoinDecision {
        if self.membership.contains(&self.local_key) {
            JoinDecision::AlreadyMember
        } else if self.document.control.is_waiting(&self.local_key) {
            JoinDecision::Waiting
        } else {
            JoinDecision::Refused
        }
    }

    async fn evaluate_join(&mut self, reference: ParticipantRef) -> JoinDecision {
        let key = self.register_reference(&reference);
        if key.is_unknown() {
            return JoinDecision::Refused;
        }
        let decision = self
            .document
            .control
            .evaluate_join(&key, self.membership.contains(&key));
        match decision {
            JoinDecision::Admitted => {
                self.apply_local_patch(SessionPatch::ParticipantAdded {
                    key: key.clone(),
                    participant: reference,
                })
                .await;
            }
            JoinDecision::Waiting => {
                self.apply_local_patch(SessionPatch::WaitingRoomJoined { key: key.clone() })
                    .await;
            }
            JoinDecision::AlreadyMember | JoinDecision::Refused => {}
        }
        let decision = self.settled_join(&key, decision);
        debug!(
            target: "session.control",
            session_id = %self.session_id,
            key = %key,
            decision = ?decision,
            "Join evaluated"
        );
        decision
    }

    /// The decision as the document now records it.
    fn settled_join(&self, key: &IdentityKey, decision: JoinDecision) -> JoinDecision {
        match decision {
            JoinDecision::Admitted if !self.membership.contains(key) => JoinDecision::Refused,
            JoinDecision::Waiting if !self.document.control.is_waiting(key) => {
                JoinDecision::Refused
            }
            decision => decision,
        }
    }

    async fn handle_join(&mut self, participant: ParticipantRef) -> Result<JoinDecision, SessionError> {
        if !self.connections.is_active() {
            return Err(SessionError::SessionEnded);
        }
        let decision = self.evaluate_join(participant).await;
        self.sweep(SweepTrigger::MembershipChange);
        Ok(decision)
    }

    async fn handle_invite(&mut self, participant: ParticipantRef) -> Result<IdentityKey, SessionError> {
        if !self.connections.is_active() {
            return Err(SessionError::SessionEnded);
        }
        let control = &self.document.control;
        if !self.membership.contains(&self.local_key)
            || (control.meeting_locked && !control.is_host(&self.local_key))
        {
            return Err(SessionError::UnauthorizedControlAction(
                "invite".to_string(),
            ));
        }
        let key = self.register_reference(&participant);
        if key.is_unknown() {
            return Err(SessionError::Internal(
                "invitee has no usable identity".to_string(),
            ));
        }
        self.apply_local_patch(SessionPatch::ParticipantAdded {
            key: key.clone(),
            participant,
        })
        .await;
        self.sweep(SweepTrigger::MembershipChange);
        Ok(key)
    }

    async fn handle_remove(&mut self, key: IdentityKey) -> Result<ControlOutcome, SessionError> {
        if !self.connections.is_active() {
            return Err(SessionError::SessionEnded);
        }
        let outcome = if !self.document.control.is_host(&self.local_key) {
            ControlOutcome::Ignored
        } else if key == self.local_key || !self.membership.contains(&key) {
            ControlOutcome::Unchanged
        } else {
            self.apply_local_patch(SessionPatch::ParticipantRemoved { key: key.clone() })
                .await;
            self.sweep(SweepTrigger::MembershipChange);
            ControlOutcome::Applied
        };
        self.record_control(ControlAction::Remove, outcome);
        Ok(outcome)
    }

    async fn handle_toggle(&mut self, action: ControlAction) -> Result<ControlOutcome, SessionError> {
        if !self.connections.is_active() {
            return Err(SessionError::SessionEnded);
        }
        let mut control = self.document.control.clone();
        let (outcome, patch) = match action {
            ControlAction::ToggleLock => (
                control.toggle_lock(&self.local_key),
                SessionPatch::LockToggled {
                    locked: control.meeting_locked,
                },
            ),
            _ => (
                control.toggle_lobby(&self.local_key),
                SessionPatch::LobbyToggled {
                    enabled: control.lobby_enabled,
                },
            ),
        };
        // Only the toggled flag is published; the waiting room is never overwritten
        if outcome == ControlOutcome::Applied {
            self.apply_local_patch(patch).await;
        }
        self.record_control(action, outcome);
        Ok(outcome)
    }

    async fn handle_admit(&mut self, key: Option<IdentityKey>) -> Result<ControlOutcome, SessionError> {
        if !self.connections.is_active() {
            return Err(SessionError::SessionEnded);
        }
        let mut control = self.document.control.clone();
        let (action, admission) = match &key {
            Some(key) => (ControlAction::Admit, control.admit(&self.local_key, key)),
            None => (ControlAction::AdmitAll, control.admit_all(&self.local_key)),
        };
        if !admission.admitted.is_empty() {
            info!(
                target: "session.control",
                session_id = %self.session_id,
                admitted = admission.admitted.len(),
                "Admitting from waiting room"
            );
            self.apply_local_patch(SessionPatch::ParticipantsAdmitted {
                keys: admission.admitted,
            })
            .await;
            self.sweep(SweepTrigger::MembershipChange);
        }
        self.record_control(action, admission.outcome);
        Ok(admission.outcome)
    }

    fn record_control(&self, action: ControlAction, outcome: ControlOutcome) {
        prom::record_control_action(action.as_str(), outcome.as_str());
        if outcome == ControlOutcome::Ignored {
            warn!(
                target: "session.control",
                session_id = %self.session_id,
                actor = %self.local_key,
                action = action.as_str(),
                "Ignoring host-only action from non-host"
            );
        }
    }

    /// Apply a local change, refresh derived state and publish it.
    async fn apply_local_patch(&mut self, patch: SessionPatch) {
        if !self.document.apply(&patch) {
            return;
        }
        self.refresh_membership();
        if let Err(e) = self.metadata.publish(&self.local_key, &patch).await {
            warn!(
                target: "session.actor",
                session_id = %self.session_id,
                patch = patch.kind(),
                error = %e,
                "Failed to publish session patch"
            );
        }
    }

    async fn handle_remote_patch(&mut self, patch: SessionPatch) {
        debug!(
            target: "session.actor",
            session_id = %self.session_id,
            patch = patch.kind(),
            "Applying remote patch"
        );
        if let SessionPatch::ScreenShareChanged { ownership } = &patch {
            if self.arbiter.apply_remote(ownership) {
                self.yield_screen_if_superseded().await;
            }
        }
        if self.document.apply(&patch) {
            self.refresh_membership();
            self.sweep(SweepTrigger::MembershipChange);
        }
    }

    /// Register a reference with live connection keys pinned.
    fn register_reference(&mut self, reference: &ParticipantRef) -> IdentityKey {
        self.resolver.pin(self.connections.live_keys());
        self.resolver.register(reference)
    }

    fn refresh_membership(&mut self) {
        self.resolver.pin(self.connections.live_keys());
        self.membership = SessionMembership::derive(&self.document, &mut self.resolver);
        self.resolver.rebuild_address_table(
            address_owners(&self.membership, &self.document),
            &self.document.observed_addresses,
        );
    }

    fn is_expected(&self, key: &IdentityKey) -> bool {
        key != &self.local_key
            && self.membership.contains(&self.local_key)
            && self.membership.contains(key)
    }

    // ------------------------------------------------------------------
    // Reconciliation and dialing
    // ------------------------------------------------------------------

    /// Close unexpected connections, then dial missing peers.
    fn sweep(&mut self, trigger: SweepTrigger) -> SweepReport {
        if !self.started || !self.connections.is_active() {
            return SweepReport::default();
        }

        let plan = ReconnectSweeper::plan(
            &self.membership,
            &self.local_key,
            &self.connections.live_keys(),
            &self.connections.dialing_keys(),
        );

        let mut closed = Vec::new();
        for conn in self
            .connections
            .close_unexpected(&plan.expected, &plan.to_close)
        {
            conn.shutdown();
            self.blocked_playback.remove(&conn.key);
            closed.push(conn.key.clone());
        }
        self.dial_tasks.retain(|key, (_, token)| {
            let keep = plan.expected.contains(key);
            if !keep {
                token.cancel();
            }
            keep
        });
        self.retrying.retain(|key| plan.expected.contains(key));

        let mut dialed = Vec::new();
        let mut skipped_in_flight = plan.in_flight.clone();
        for key in plan.to_dial {
            if self.pending_inbound.contains(&key) {
                skipped_in_flight.push(key);
            } else if self.dial(key.clone()) {
                dialed.push(key);
            }
        }
        skipped_in_flight.sort();

        self.sweeper.record();
        self.metrics.sweep();
        prom::record_sweep(trigger.as_str(), dialed.len());
        prom::set_live_connections(self.connections.live_count());

        if !dialed.is_empty() || !closed.is_empty() {
            debug!(
                target: "session.sweep",
                session_id = %self.session_id,
                trigger = trigger.as_str(),
                dialed = dialed.len(),
                in_flight = skipped_in_flight.len(),
                closed = closed.len(),
                "Sweep reconciled connections"
            );
        }

        SweepReport {
            dialed,
            skipped_in_flight,
            closed,
        }
    }

    /// Spawn a dial task for an identity. Returns false if one is in flight.
    fn dial(&mut self, key: IdentityKey) -> bool {
        let reference = self.membership.reference(&key).cloned();
        let observed: Vec<TransportAddress> = self
            .document
            .observed_addresses
            .iter()
            .filter(|(_, owner)| self.resolver.canonical(owner) == key)
            .map(|(address, _)| address.clone())
            .collect();
        let candidates = self.resolver.candidates(
            &key,
            reference.as_ref(),
            &observed,
            self.settings.retry.max_candidates,
        );
        let peer_address = self.resolver.to_address(&key);
        let Some(ticket) = self
            .connections
            .begin_dial(key.clone(), peer_address, candidates)
        else {
            return false;
        };

        let cancel = self.cancel_token.child_token();
        self.dial_tasks
            .insert(key.clone(), (ticket.attempt, cancel.clone()));
        self.metrics.dial_started();

        debug!(
            target: "session.dial",
            session_id = %self.session_id,
            key = %key,
            attempt = ticket.attempt,
            candidates = ticket.candidates.len(),
            "Dialing"
        );

        let transport = Arc::clone(&self.transport);
        let local_stream = self.media.outgoing_stream();
        let policy = self.settings.retry;
        let mailbox = self.mailbox_sender.clone();
        tokio::spawn(async move {
            let started = Instant::now();
            let outcome = dial_with_fallback(
                transport.as_ref(),
                &ticket.candidates,
                &local_stream,
                &policy,
                &cancel,
            )
            .await;
            let message = SessionMessage::DialSettled {
                ticket,
                outcome,
                elapsed: started.elapsed(),
            };
            if let Err(message) = post(&mailbox, message).await {
                discard(message);
            }
        });
        true
    }

    async fn handle_dial_settled(
        &mut self,
        ticket: DialTicket,
        outcome: DialOutcome,
        elapsed: Duration,
    ) {
        if self
            .dial_tasks
            .get(&ticket.key)
            .is_some_and(|(attempt, _)| *attempt == ticket.attempt)
        {
            self.dial_tasks.remove(&ticket.key);
        }
        prom::record_dial(outcome.as_str(), elapsed);

        match outcome {
            DialOutcome::Connected {
                address,
                link,
                remote_stream,
                attempts,
            } => {
                let PeerLink { connection, events } = link;
                let watcher = self.cancel_token.child_token();
                let is_member = self.is_expected(&ticket.key);
                match self.connections.register_outbound(
                    &ticket,
                    Arc::clone(&connection),
                    remote_stream.clone(),
                    watcher.clone(),
                    is_member,
                ) {
                    Registration::Registered { replaced } => {
                        if let Some(previous) = replaced {
                            previous.shutdown();
                        }
                        self.metrics.dial_connected();
                        self.retrying.remove(&ticket.key);
                        info!(
                            target: "session.dial",
                            session_id = %self.session_id,
                            key = %ticket.key,
                            address = %address,
                            attempts,
                            elapsed_ms = elapsed.as_millis() as u64,
                            "Connected"
                        );
                        self.watch_connection(
                            ticket.key.clone(),
                            connection.id().to_string(),
                            events,
                            watcher,
                        );
                        self.start_playback(ticket.key.clone(), remote_stream).await;
                        prom::set_live_connections(self.connections.live_count());
                    }
                    Registration::Rejected(reason) => {
                        connection.close();
                        debug!(
                            target: "session.dial",
                            session_id = %self.session_id,
                            key = %ticket.key,
                            reason = reason.as_str(),
                            "Discarding dial result"
                        );
                    }
                }
            }
            DialOutcome::Exhausted {
                attempts,
                last_error,
            } => {
                let current = self.connections.is_current(&ticket);
                self.connections.dial_failed(&ticket);
                if current {
                    self.metrics.dial_exhausted();
                    self.retrying.insert(ticket.key.clone());
                    let error = SessionError::DialFailed {
                        key: ticket.key.to_string(),
                        reason: last_error.unwrap_or_else(|| "no candidates".to_string()),
                    };
                    warn!(
                        target: "session.dial",
                        session_id = %self.session_id,
                        attempts,
                        error = %error,
                        "All candidates failed, will retry on next sweep"
                    );
                }
            }
            DialOutcome::Cancelled => {
                self.connections.dial_failed(&ticket);
            }
        }
    }

    async fn handle_incoming(&mut self, call: IncomingCall) {
        let IncomingCall {
            remote_address,
            link,
        } = call;

        if !self.started || !self.connections.is_active() {
            debug!(
                target: "session.dial",
                session_id = %self.session_id,
                address = %remote_address,
                "Rejecting inbound call, session not running"
            );
            link.connection.close();
            return;
        }

        let others = self.membership.others(&self.local_key);
        let connections = &self.connections;
        let key = self
            .resolver
            .from_address(&remote_address, &others, |key| connections.is_connected(key));

        let control = &self.document.control;
        let refusal = if !self.membership.contains(&self.local_key) {
            Some("local participant not admitted")
        } else if control.is_waiting(&key) || self.document.removed.contains(&key) {
            Some("caller not admitted")
        } else if control.meeting_locked
            && !self.membership.contains(&key)
            && !control.is_host(&key)
        {
            Some("meeting locked")
        } else if !self
            .connections
            .accepts_inbound(&key, &self.resolver.to_address(&key))
        {
            Some("canonical connection preferred")
        } else {
            None
        };
        if let Some(reason) = refusal {
            info!(
                target: "session.dial",
                session_id = %self.session_id,
                key = %key,
                reason,
                "Rejecting inbound call"
            );
            link.connection.close();
            return;
        }

        if self.resolver.lookup_address(&remote_address).is_none() {
            self.apply_local_patch(SessionPatch::AddressObserved {
                address: remote_address.clone(),
                key: key.clone(),
            })
            .await;
        }

        if self.media.camera().is_none() {
            if let Err(e) = self.media.acquire_camera(None).await {
                self.raise_media_notice(&e);
            }
        }
        let local_stream = self.media.outgoing_stream();
        if let Err(e) = link.connection.answer(&local_stream).await {
            warn!(
                target: "session.dial",
                session_id = %self.session_id,
                key = %key,
                error = %e,
                "Failed to answer inbound call"
            );
            link.connection.close();
            return;
        }

        self.pending_inbound.insert(key.clone());
        let generation = self.connections.generation();
        let timeout = self.settings.retry.per_candidate_timeout;
        let mailbox = self.mailbox_sender.clone();
        tokio::spawn(async move {
            let mut link = link;
            let result = tokio::time::timeout(timeout, wait_for_media(&mut link.events))
                .await
                .unwrap_or_else(|_| Err("no media before timeout".to_string()));
            let message = SessionMessage::InboundSettled {
                key,
                remote_address,
                generation,
                link,
                result,
            };
            if let Err(message) = post(&mailbox, message).await {
                discard(message);
            }
        });
    }

    async fn handle_inbound_settled(
        &mut self,
        key: IdentityKey,
        remote_address: TransportAddress,
        generation: u64,
        link: PeerLink,
        result: Result<MediaStream, String>,
    ) {
        self.pending_inbound.remove(&key);
        let PeerLink { connection, events } = link;

        let remote_stream = match result {
            Ok(stream) => stream,
            Err(reason) => {
                debug!(
                    target: "session.dial",
                    session_id = %self.session_id,
                    key = %key,
                    reason = %reason,
                    "Inbound call ended before media"
                );
                connection.close();
                return;
            }
        };
        if !self.is_expected(&key) {
            connection.close();
            return;
        }

        let peer_address = self.resolver.to_address(&key);
        let watcher = self.cancel_token.child_token();
        match self.connections.register_inbound(
            key.clone(),
            &peer_address,
            Arc::clone(&connection),
            remote_stream.clone(),
            watcher.clone(),
            generation,
        ) {
            Registration::Registered { replaced } => {
                if let Some(previous) = replaced {
                    previous.shutdown();
                }
                if let Some((_, token)) = self.dial_tasks.remove(&key) {
                    token.cancel();
                }
                self.retrying.remove(&key);
                info!(
                    target: "session.dial",
                    session_id = %self.session_id,
                    key = %key,
                    address = %remote_address,
                    "Accepted inbound connection"
                );
                self.watch_connection(key.clone(), connection.id().to_string(), events, watcher);
                self.start_playback(key, remote_stream).await;
                prom::set_live_connections(self.connections.live_count());
            }
            Registration::Rejected(reason) => {
                debug!(
                    target: "session.dial",
                    session_id = %self.session_id,
                    key = %key,
                    reason = reason.as_str(),
                    "Discarding inbound connection"
                );
                connection.close();
            }
        }
    }

    /// Forward a live connection's events into the mailbox until it ends.
    fn watch_connection(
        &self,
        key: IdentityKey,
        connection_id: String,
        mut events: mpsc::Receiver<PeerEvent>,
        watcher: CancellationToken,
    ) {
        let mailbox = self.mailbox_sender.clone();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    () = watcher.cancelled() => break,
                    event = events.recv() => event.unwrap_or(PeerEvent::Closed),
                };
                let terminal = !matches!(event, PeerEvent::Stream(_));
                let message = SessionMessage::ConnectionEvent {
                    key: key.clone(),
                    connection_id: connection_id.clone(),
                    event,
                };
                if post(&mailbox, message).await.is_err() || terminal {
                    break;
                }
            }
        });
    }

    async fn handle_connection_event(
        &mut self,
        key: IdentityKey,
        connection_id: String,
        event: PeerEvent,
    ) {
        match event {
            PeerEvent::Stream(stream) => {
                if self
                    .connections
                    .update_remote_stream(&key, &connection_id, stream.clone())
                {
                    self.start_playback(key, stream).await;
                }
            }
            PeerEvent::Closed | PeerEvent::Error(_) => {
                if let Some(conn) = self.connections.on_closed(&key, &connection_id) {
                    conn.shutdown();
                    self.blocked_playback.remove(&key);
                    self.metrics.connection_closed();
                    prom::set_live_connections(self.connections.live_count());
                    // Releases the key pin so a fuller reference can take over
                    self.refresh_membership();
                    info!(
                        target: "session.dial",
                        session_id = %self.session_id,
                        key = %key,
                        connection_id = %connection_id,
                        error = ?match &event {
                            PeerEvent::Error(reason) => Some(reason.as_str()),
                            _ => None,
                        },
                        "Connection closed, sweep will re-dial"
                    );
                }
            }
        }
    }

    /// Close connections that refused a replacement track so the sweep
    /// re-dials them with current media.
    fn drop_failed(&mut self, failed: Vec<IdentityKey>) {
        for key in failed {
            let Some(connection_id) = self.connections.get(&key).map(|c| c.id().to_string())
            else {
                continue;
            };
            if let Some(conn) = self.connections.on_closed(&key, &connection_id) {
                conn.shutdown();
                self.metrics.connection_closed();
            }
        }
        prom::set_live_connections(self.connections.live_count());
    }

    /// Close everything and stop accepting work.
    fn teardown(&mut self, reason: &str) {
        for (_, (_, token)) in std::mem::take(&mut self.dial_tasks) {
            token.cancel();
        }
        let closed = self.connections.deactivate();
        for conn in &closed {
            conn.shutdown();
        }
        self.pending_inbound.clear();
        self.retrying.clear();
        self.blocked_playback.clear();
        self.unwatch_screen_track();
        self.media.release_all();
        prom::set_live_connections(0);
        info!(
            target: "session.actor",
            session_id = %self.session_id,
            reason,
            closed = closed.len(),
            "Session torn down"
        );
    }

    async fn handle_leave(&mut self) {
        if !self.connections.is_active() {
            return;
        }
        self.stop_screen_share_local(None).await;
        self.apply_local_patch(SessionPatch::ParticipantRemoved {
            key: self.local_key.clone(),
        })
        .await;
        self.teardown("leave");
    }

    // ------------------------------------------------------------------
    // Local media
    // ------------------------------------------------------------------

    async fn handle_switch_device(&mut self, device_id: Option<String>) -> Result<usize, SessionError> {
        if !self.connections.is_active() {
            return Err(SessionError::SessionEnded);
        }
        if let Some(id) = &device_id {
            if let Err(e) = self.ensure_device(id).await {
                self.raise_media_notice(&e);
                return Err(e.into());
            }
        }
        let stream = match self.media.prepare_switch(device_id.clone()).await {
            Ok(stream) => stream,
            Err(e) => {
                self.raise_media_notice(&e);
                return Err(e.into());
            }
        };

        let mut summary = self
            .connections
            .replace_outgoing_track(TrackKind::Audio, stream.first_track(TrackKind::Audio).cloned())
            .await;
        if !self.media.is_presenting() {
            let video = self
                .connections
                .replace_outgoing_track(TrackKind::Video, stream.first_track(TrackKind::Video).cloned())
                .await;
            summary.replaced = summary.replaced.max(video.replaced);
            summary.failed.extend(video.failed);
            summary.failed.sort();
            summary.failed.dedup();
        }
        let failed = summary.failed.len();
        self.drop_failed(summary.failed);

        if let Some(previous) = self.media.commit_switch(stream, device_id) {
            previous.stop_all();
        }
        Ok(summary.replaced.saturating_sub(failed))
    }

    /// Reject a device the platform does not list.
    async fn ensure_device(&self, device_id: &str) -> Result<(), MediaError> {
        let devices = self.media.devices().enumerate_devices().await?;
        if devices.iter().any(|device| device.device_id == device_id) {
            Ok(())
        } else {
            Err(MediaError::NoDevice)
        }
    }

    async fn handle_replace_screen(&mut self) -> Result<usize, SessionError> {
        if !self.connections.is_active() {
            return Err(SessionError::SessionEnded);
        }
        let token = self.arbiter.ownership().token;
        if !self.media.is_presenting() || !self.arbiter.ownership().is_owned_by(&self.local_key) {
            return Err(SessionError::OwnershipConflict(
                "not presenting".to_string(),
            ));
        }
        let stream = match self.media.devices().acquire_display_media().await {
            Ok(stream) => stream,
            Err(e) => {
                prom::record_media_error(e.kind());
                return Err(e.into());
            }
        };
        self.watch_screen_track(&stream, token);
        self.media.set_screen(stream.clone());
        let summary = self
            .connections
            .replace_outgoing_track(TrackKind::Video, self.media.outgoing_video())
            .await;
        let replaced = summary.replaced;
        self.drop_failed(summary.failed);
        Ok(replaced)
    }

    async fn handle_user_interaction(&mut self) -> Result<bool, SessionError> {
        let blocked = std::mem::take(&mut self.blocked_playback);
        for (key, stream) in blocked {
            self.start_playback(key, stream).await;
        }
        let unblocked = self.blocked_playback.is_empty();
        if unblocked {
            self.notices
                .retain(|notice| notice.kind != NoticeKind::AudioBlocked);
        }
        Ok(unblocked)
    }

    async fn start_playback(&mut self, key: IdentityKey, stream: MediaStream) {
        match self.media.play_remote(&stream).await {
            Ok(()) => {
                self.blocked_playback.remove(&key);
            }
            Err(MediaError::AutoplayBlocked) => {
                prom::record_media_error(MediaError::AutoplayBlocked.kind());
                debug!(
                    target: "session.media",
                    session_id = %self.session_id,
                    key = %key,
                    "Playback blocked until user interaction"
                );
                self.blocked_playback.insert(key, stream);
                self.raise_notice(
                    NoticeKind::AudioBlocked,
                    SessionError::AutoplayBlocked.client_message(),
                );
            }
            Err(e) => {
                prom::record_media_error(e.kind());
                warn!(
                    target: "session.media",
                    session_id = %self.session_id,
                    key = %key,
                    error = %e,
                    "Remote playback failed"
                );
            }
        }
    }

    fn raise_media_notice(&mut self, error: &MediaError) {
        prom::record_media_error(error.kind());
        warn!(
            target: "session.media",
            session_id = %self.session_id,
            error = %error,
            "Local media unavailable, continuing without it"
        );
        self.raise_notice(
            NoticeKind::MediaUnavailable,
            SessionError::from(error.clone()).client_message(),
        );
    }

    /// Add a notice unless an identical one is still shown.
    fn raise_notice(&mut self, kind: NoticeKind, message: String) {
        if self
            .notices
            .iter()
            .any(|notice| notice.kind == kind && notice.message == message)
        {
            return;
        }
        self.notices.push(Notice {
            id: self.next_notice_id,
            kind,
            message,
            raised_at: chrono::Utc::now().timestamp(),
        });
        self.next_notice_id += 1;
    }

    // ------------------------------------------------------------------
    // Screen share
    // ------------------------------------------------------------------

    fn handle_start_screen_share(
        &mut self,
        respond_to: oneshot::Sender<Result<ScreenShareOwnership, SessionError>>,
    ) {
        if !self.connections.is_active() {
            let _ = respond_to.send(Err(SessionError::SessionEnded));
            return;
        }
        match self.arbiter.request_start(&self.local_key, Instant::now()) {
            Ok(StartPermit::AlreadyOwner) => {
                let _ = respond_to.send(Ok(self.arbiter.ownership().clone()));
            }
            Ok(StartPermit::Acquire) => {
                let devices = self.media.devices();
                let mailbox = self.mailbox_sender.clone();
                tokio::spawn(async move {
                    let result = devices.acquire_display_media().await;
                    let message = SessionMessage::ScreenCaptureSettled { result, respond_to };
                    if let Err(message) = post(&mailbox, message).await {
                        discard(message);
                    }
                });
            }
            Err(rejection) => {
                prom::record_screen_share_request(rejection.as_str());
                info!(
                    target: "session.screen_share",
                    session_id = %self.session_id,
                    reason = rejection.as_str(),
                    "Screen share request refused"
                );
                let _ = respond_to.send(Err(Self::conflict(&rejection)));
            }
        }
    }

    fn conflict(rejection: &StartRejection) -> SessionError {
        match rejection {
            StartRejection::OwnedByOther(owner) => {
                SessionError::OwnershipConflict(format!("owned by {owner}"))
            }
            other => SessionError::OwnershipConflict(other.as_str().to_string()),
        }
    }

    async fn handle_screen_capture_settled(
        &mut self,
        result: Result<MediaStream, MediaError>,
    ) -> Result<ScreenShareOwnership, SessionError> {
        let stream = match result {
            Ok(stream) => stream,
            Err(e) => {
                self.arbiter.abort_start(&self.local_key);
                prom::record_screen_share_request("capture_failed");
                if e == MediaError::Cancelled {
                    prom::record_media_error(e.kind());
                } else {
                    self.raise_media_notice(&e);
                }
                return Err(e.into());
            }
        };

        if !self.connections.is_active() {
            stream.stop_all();
            self.arbiter.abort_start(&self.local_key);
            return Err(SessionError::SessionEnded);
        }

        let ownership = match self.arbiter.complete_start(&self.local_key) {
            Ok(ownership) => ownership,
            Err(rejection) => {
                stream.stop_all();
                prom::record_screen_share_request(rejection.as_str());
                return Err(Self::conflict(&rejection));
            }
        };

        self.media.set_screen(stream.clone());
        let summary = self
            .connections
            .replace_outgoing_track(TrackKind::Video, self.media.outgoing_video())
            .await;
        self.drop_failed(summary.failed);
        self.watch_screen_track(&stream, ownership.token);
        self.apply_local_patch(SessionPatch::ScreenShareChanged {
            ownership: ownership.clone(),
        })
        .await;

        prom::record_screen_share_request("granted");
        info!(
            target: "session.screen_share",
            session_id = %self.session_id,
            token = ownership.token,
            connections = summary.replaced,
            "Screen share started"
        );
        Ok(ownership)
    }

    /// Post `ScreenTrackEnded` when the platform ends the capture.
    ///
    /// Replaces any watcher on a previous capture.
    fn watch_screen_track(&mut self, stream: &MediaStream, token: u64) {
        self.unwatch_screen_track();
        let Some(track) = stream.first_track(TrackKind::Video) else {
            return;
        };
        let ended = track.ended_token();
        let cancel = self.cancel_token.child_token();
        self.screen_watch = Some(cancel.clone());
        let mailbox = self.mailbox_sender.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {}
                () = ended.cancelled() => {
                    let _ = post(&mailbox, SessionMessage::ScreenTrackEnded { token }).await;
                }
            }
        });
    }

    fn unwatch_screen_track(&mut self) {
        if let Some(watch) = self.screen_watch.take() {
            watch.cancel();
        }
    }

    /// Stop presenting and restore the camera on every connection.
    async fn stop_screen_share_local(&mut self, token: Option<u64>) -> bool {
        let Some(ownership) = self.arbiter.stop(&self.local_key, token) else {
            return false;
        };
        self.unwatch_screen_track();
        self.media.release_screen();
        let summary = self
            .connections
            .replace_outgoing_track(TrackKind::Video, self.media.outgoing_video())
            .await;
        self.drop_failed(summary.failed);
        self.apply_local_patch(SessionPatch::ScreenShareChanged { ownership })
            .await;
        info!(
            target: "session.screen_share",
            session_id = %self.session_id,
            "Screen share stopped"
        );
        true
    }

    /// Release a local capture that lost ownership to a newer claim.
    async fn yield_screen_if_superseded(&mut self) {
        if !self.media.is_presenting() || self.arbiter.ownership().is_owned_by(&self.local_key) {
            return;
        }
        self.unwatch_screen_track();
        self.media.release_screen();
        let summary = self
            .connections
            .replace_outgoing_track(TrackKind::Video, self.media.outgoing_video())
            .await;
        self.drop_failed(summary.failed);
        info!(
            target: "session.screen_share",
            session_id = %self.session_id,
            owner = ?self.arbiter.owner().map(IdentityKey::as_str),
            "Screen share superseded by a newer claim"
        );
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    fn diagnostics(&self) -> DiagnosticSnapshot {
        let plan = ReconnectSweeper::plan(
            &self.membership,
            &self.local_key,
            &self.connections.live_keys(),
            &self.connections.dialing_keys(),
        );
        let mut missing_keys: Vec<IdentityKey> = plan.missing().cloned().collect();
        missing_keys.sort();
        let retrying_keys = missing_keys
            .iter()
            .filter(|key| self.retrying.contains(*key))
            .cloned()
            .collect();
        let (audio, video) = self.media.track_counts();

        DiagnosticSnapshot {
            session_id: self.session_id.clone(),
            local_key: self.local_key.clone(),
            peer_ready: self.started
                && self.connections.is_active()
                && self.membership.contains(&self.local_key),
            expected_count: plan.expected.len(),
            connected_count: plan
                .expected
                .iter()
                .filter(|key| self.connections.is_connected(key))
                .count(),
            missing_keys,
            dialing_keys: self.connections.dialing_keys().into_iter().collect(),
            peer_states: plan
                .expected
                .iter()
                .map(|key| (key.clone(), self.connections.state(key)))
                .collect(),
            retrying_keys,
            local_audio_track_count: audio,
            local_video_track_count: video,
            audio_playback_blocked: !self.blocked_playback.is_empty(),
            generation: self.connections.generation(),
            taken_at: chrono::Utc::now().timestamp(),
        }
    }

    fn state(&self) -> SessionState {
        SessionState {
            session_id: self.session_id.clone(),
            local_key: self.local_key.clone(),
            started: self.started,
            active: self.connections.is_active(),
            generation: self.connections.generation(),
            members: self.membership.keys().cloned().collect(),
            connections: self
                .connections
                .iter()
                .map(|conn| ConnectionSummary {
                    key: conn.key.clone(),
                    connection_id: conn.id().to_string(),
                    direction: conn.direction,
                    canonical: conn.canonical,
                })
                .collect(),
            dialing: self.connections.dialing_keys().into_iter().collect(),
            control: self.document.control.clone(),
            screen_share: self.arbiter.ownership().clone(),
            presenting: self.media.is_presenting(),
            muted: self.media.is_muted(),
            metrics: self.metrics.snapshot(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::identity::StaticDirectory;
    use crate::transport::loopback::{LoopbackDocument, LoopbackNetwork, SyntheticMedia};

    fn organizer() -> ParticipantRef {
        ParticipantRef::from_email("host@example.com")
    }

    async fn spawn_lone(
        document: SessionDocument,
    ) -> (SessionHandle, JoinHandle<()>, CancellationToken) {
        let network = LoopbackNetwork::new();
        let address = TransportAddress::new("dt-host");
        let incoming = network.listen([address.clone()]).await;
        let deps = SessionDeps {
            transport: network.transport(address),
            devices: Arc::new(SyntheticMedia::new()),
            metadata: Arc::new(LoopbackDocument::new(document.clone())),
            directory: Arc::new(StaticDirectory::default()),
            incoming,
        };
        let cancel_token = CancellationToken::new();
        let (handle, task) = SessionActor::spawn(
            SessionSettings::default(),
            organizer(),
            document,
            deps,
            cancel_token.clone(),
        );
        (handle, task, cancel_token)
    }

    #[tokio::test]
    async fn test_spawn_and_start() {
        let document = SessionDocument::new("s-actor").with_participant(organizer());
        let (handle, task, cancel_token) = spawn_lone(document).await;

        assert_eq!(handle.session_id(), "s-actor");
        assert_eq!(handle.local_key().as_str(), "email:host@example.com");

        let state = handle.get_state().await.unwrap();
        assert!(!state.started);
        assert!(state.active);

        assert_eq!(handle.start().await.unwrap(), JoinDecision::AlreadyMember);
        assert_eq!(handle.start().await.unwrap(), JoinDecision::AlreadyMember);

        let snapshot = handle.diagnostics().await.unwrap();
        assert!(snapshot.peer_ready);
        assert_eq!(snapshot.expected_count, 0);
        assert_eq!(snapshot.local_audio_track_count, 1);
        assert_eq!(snapshot.local_video_track_count, 1);

        cancel_token.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_actor_exits_when_handles_dropped() {
        let document = SessionDocument::new("s-drop").with_participant(organizer());
        let (handle, task, _cancel_token) = spawn_lone(document).await;
        handle.start().await.unwrap();

        drop(handle);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("actor should exit once every handle is gone")
            .unwrap();
    }

    #[tokio::test]
    async fn test_cancellation_ends_requests() {
        let document = SessionDocument::new("s-cancel").with_participant(organizer());
        let (handle, task, _cancel_token) = spawn_lone(document).await;

        handle.cancel();
        task.await.unwrap();

        assert!(handle.is_cancelled());
        assert!(matches!(
            handle.get_state().await,
            Err(SessionError::SessionEnded)
        ));
    }
}
