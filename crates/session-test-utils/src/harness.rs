//! Multi-party sessions over the loopback transport.
//!
//! Every participant listens on its deterministic address, captures from its
//! own [`SyntheticMedia`] and shares one [`LoopbackDocument`]. Participants
//! joining later start from the document's current snapshot.

use anyhow::{bail, Context, Result};
use session_core::actors::{SessionActor, SessionDeps, SessionHandle, SessionState};
use session_core::config::SessionSettings;
use session_core::identity::{
    IdentityKey, IdentityResolver, ParticipantRef, StaticDirectory, TransportAddress,
};
use session_core::media::MediaDevices;
use session_core::meeting_control::JoinDecision;
use session_core::metadata::{MetadataChannel, SessionDocument};
use session_core::sweeper::DiagnosticSnapshot;
use session_core::transport::loopback::{LoopbackDocument, LoopbackNetwork, SyntheticMedia};
use session_core::transport::{IncomingCall, PeerTransport};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Poll period for `wait_*` helpers.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default bound for `wait_*` helpers.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Yields per `settle` round.
const SETTLE_YIELDS: usize = 32;

/// Incoming-call buffer for [`spawn_session`].
const INCOMING_BUFFER: usize = 8;

/// One spawned participant.
#[derive(Debug, Clone)]
pub struct Participant {
    pub reference: ParticipantRef,
    pub handle: SessionHandle,
    pub media: Arc<SyntheticMedia>,
    pub address: TransportAddress,
}

impl Participant {
    #[must_use]
    pub fn key(&self) -> &IdentityKey {
        self.handle.local_key()
    }
}

/// A shared session with any number of loopback participants.
pub struct SessionHarness {
    settings: SessionSettings,
    network: LoopbackNetwork,
    document: LoopbackDocument,
    directory: Arc<StaticDirectory>,
    cancel_token: CancellationToken,
    participants: BTreeMap<IdentityKey, Participant>,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHarness {
    #[must_use]
    pub fn new(document: SessionDocument) -> Self {
        Self::with_settings(document, SessionSettings::default())
    }

    #[must_use]
    pub fn with_settings(document: SessionDocument, settings: SessionSettings) -> Self {
        Self {
            settings,
            network: LoopbackNetwork::new(),
            document: LoopbackDocument::new(document),
            directory: Arc::new(StaticDirectory::default()),
            cancel_token: CancellationToken::new(),
            participants: BTreeMap::new(),
            tasks: Vec::new(),
        }
    }

    /// Use a directory for every participant spawned after this call.
    #[must_use]
    pub fn directory(mut self, directory: StaticDirectory) -> Self {
        self.directory = Arc::new(directory);
        self
    }

    pub fn network(&self) -> &LoopbackNetwork {
        &self.network
    }

    pub fn document(&self) -> &LoopbackDocument {
        &self.document
    }

    /// Deterministic listening address of a participant.
    #[must_use]
    pub fn address_of(&self, participant: &ParticipantRef) -> TransportAddress {
        let resolver = self.resolver();
        resolver.to_address(&resolver.resolve(participant))
    }

    #[must_use]
    pub fn key_of(&self, participant: &ParticipantRef) -> IdentityKey {
        self.resolver().resolve(participant)
    }

    fn resolver(&self) -> IdentityResolver {
        IdentityResolver::new(
            self.directory.clone(),
            self.settings.address_prefix.clone(),
            self.settings.legacy_address_prefix.clone(),
        )
    }

    /// Spawn a participant without starting it.
    pub async fn spawn(&mut self, reference: ParticipantRef) -> Participant {
        let address = self.address_of(&reference);
        let incoming = self.network.listen([address.clone()]).await;
        let media = Arc::new(SyntheticMedia::new());

        let deps = SessionDeps {
            transport: self.network.transport(address.clone()),
            devices: media.clone(),
            metadata: Arc::new(self.document.clone()),
            directory: self.directory.clone(),
            incoming,
        };
        let snapshot = self.document.snapshot().await;
        let (handle, task) = SessionActor::spawn(
            self.settings.clone(),
            reference.clone(),
            snapshot,
            deps,
            self.cancel_token.child_token(),
        );
        self.document.subscribe(handle.clone()).await;
        self.tasks.push(task);

        let participant = Participant {
            reference,
            handle,
            media,
            address,
        };
        self.participants
            .insert(participant.key().clone(), participant.clone());
        participant
    }

    /// Spawn and start a participant, requiring a successful join.
    pub async fn join(&mut self, reference: ParticipantRef) -> Result<Participant> {
        let (participant, decision) = self.try_join(reference).await?;
        match decision {
            JoinDecision::Admitted | JoinDecision::AlreadyMember => Ok(participant),
            other => bail!("{} was not admitted: {other:?}", participant.key()),
        }
    }

    /// Spawn and start a participant, returning whatever decision it got.
    pub async fn try_join(
        &mut self,
        reference: ParticipantRef,
    ) -> Result<(Participant, JoinDecision)> {
        let participant = self.spawn(reference).await;
        let decision = participant
            .handle
            .start()
            .await
            .with_context(|| format!("starting {}", participant.key()))?;
        Ok((participant, decision))
    }

    pub fn participant(&self, key: &IdentityKey) -> Option<&Participant> {
        self.participants.get(key)
    }

    pub fn participants(&self) -> impl Iterator<Item = &Participant> {
        self.participants.values()
    }

    /// Let spawned tasks and mailboxes drain.
    pub async fn settle(&self) {
        for _ in 0..SETTLE_YIELDS {
            tokio::task::yield_now().await;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
        for _ in 0..SETTLE_YIELDS {
            tokio::task::yield_now().await;
        }
    }

    /// Wait until every participant sees every other one connected.
    pub async fn wait_fully_connected(&self) -> Result<()> {
        for participant in self.participants.values() {
            wait_for_diagnostics(&participant.handle, WAIT_TIMEOUT, |snapshot| {
                snapshot.peer_ready && snapshot.missing_keys.is_empty()
            })
            .await
            .with_context(|| format!("{} never connected to everyone", participant.key()))?;
        }
        Ok(())
    }

    /// Leave with every participant and stop their actors.
    pub async fn shutdown(mut self) {
        for participant in self.participants.values() {
            let _ = participant.handle.leave().await;
        }
        self.cancel_token.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Spawn a lone session over arbitrary collaborators.
///
/// Returns the handle and the sender that delivers incoming calls to it.
pub fn spawn_session(
    settings: SessionSettings,
    local: ParticipantRef,
    document: SessionDocument,
    transport: Arc<dyn PeerTransport>,
    devices: Arc<dyn MediaDevices>,
    metadata: Arc<dyn MetadataChannel>,
) -> (SessionHandle, mpsc::Sender<IncomingCall>) {
    let (incoming_tx, incoming) = mpsc::channel(INCOMING_BUFFER);
    let deps = SessionDeps {
        transport,
        devices,
        metadata,
        directory: Arc::new(StaticDirectory::default()),
        incoming,
    };
    let (handle, _task) =
        SessionActor::spawn(settings, local, document, deps, CancellationToken::new());
    (handle, incoming_tx)
}

/// Deterministic address of a participant under default settings.
#[must_use]
pub fn default_address(participant: &ParticipantRef) -> TransportAddress {
    let settings = SessionSettings::default();
    let resolver = IdentityResolver::new(
        Arc::new(StaticDirectory::default()),
        settings.address_prefix,
        settings.legacy_address_prefix,
    );
    resolver.to_address(&resolver.resolve(participant))
}

/// Poll a session's state until `predicate` holds.
pub async fn wait_for_state<F>(
    handle: &SessionHandle,
    timeout: Duration,
    predicate: F,
) -> Result<SessionState>
where
    F: Fn(&SessionState) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let state = handle.get_state().await?;
        if predicate(&state) {
            return Ok(state);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("state of {} never matched: {state:?}", handle.local_key());
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// Poll a session's diagnostics until `predicate` holds.
pub async fn wait_for_diagnostics<F>(
    handle: &SessionHandle,
    timeout: Duration,
    predicate: F,
) -> Result<DiagnosticSnapshot>
where
    F: Fn(&DiagnosticSnapshot) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let snapshot = handle.diagnostics().await?;
        if predicate(&snapshot) {
            return Ok(snapshot);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!(
                "diagnostics of {} never matched: {snapshot:?}",
                handle.local_key()
            );
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}
