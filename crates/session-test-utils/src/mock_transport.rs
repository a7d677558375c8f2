//! Scripted peer transport for dial ladder and answer-path tests.
//!
//! Each address is scripted with a [`DialScript`]. Unscripted addresses are
//! unreachable. Every dial is recorded in order, and every connection the
//! transport hands out stays inspectable through [`ScriptedTransport::connections`].
//!
//! # Example
//!
//! ```rust,ignore
//! use session_test_utils::ScriptedTransport;
//!
//! let transport = ScriptedTransport::builder()
//!     .refuse("dt-aaa")
//!     .answer("dt-legacy-bob")
//!     .build();
//! ```

use async_trait::async_trait;
use session_core::errors::TransportError;
use session_core::identity::TransportAddress;
use session_core::media::{MediaStream, MediaTrack, TrackKind};
use session_core::transport::{IncomingCall, PeerConnection, PeerEvent, PeerLink, PeerTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// How a scripted address responds to a dial.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialScript {
    /// Connects and delivers remote media immediately.
    Answer,
    /// Fails the dial with `TransportError::Rejected`.
    Refuse,
    /// Never completes the dial.
    Hang,
    /// Connects but delivers no media.
    Silent,
    /// Connects, then closes before any media.
    CloseBeforeMedia,
}

/// A connection handed out by [`ScriptedTransport`] or built for an
/// incoming call.
#[derive(Debug)]
pub struct ScriptedConnection {
    id: String,
    remote_address: TransportAddress,
    events: mpsc::Sender<PeerEvent>,
    /// Delivered to our own events when answered.
    answer_media: Option<MediaStream>,
    refuse_tracks: AtomicBool,
    closed: AtomicBool,
    answered: AtomicBool,
    replaced: Mutex<Vec<(TrackKind, Option<String>)>>,
}

impl ScriptedConnection {
    fn new(
        id: String,
        remote_address: TransportAddress,
        answer_media: Option<MediaStream>,
    ) -> (Arc<Self>, mpsc::Receiver<PeerEvent>) {
        let (events, rx) = mpsc::channel(16);
        (
            Arc::new(Self {
                id,
                remote_address,
                events,
                answer_media,
                refuse_tracks: AtomicBool::new(false),
                closed: AtomicBool::new(false),
                answered: AtomicBool::new(false),
                replaced: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    /// Whether the session closed this connection.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn is_answered(&self) -> bool {
        self.answered.load(Ordering::SeqCst)
    }

    /// Make every later `replace_track` fail.
    pub fn refuse_tracks(&self) {
        self.refuse_tracks.store(true, Ordering::SeqCst);
    }

    /// Replacement log: track kind and the new track's label.
    #[must_use]
    pub fn replaced_tracks(&self) -> Vec<(TrackKind, Option<String>)> {
        self.replaced.lock().unwrap().clone()
    }

    /// Inject an event as if the remote side produced it.
    pub async fn push_event(&self, event: PeerEvent) {
        let _ = self.events.send(event).await;
    }
}

#[async_trait]
impl PeerConnection for ScriptedConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> &TransportAddress {
        &self.remote_address
    }

    async fn answer(&self, _local: &MediaStream) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.answered.store(true, Ordering::SeqCst);
        if let Some(media) = &self.answer_media {
            let _ = self.events.send(PeerEvent::Stream(media.clone())).await;
        }
        Ok(())
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<MediaTrack>,
    ) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if self.refuse_tracks.load(Ordering::SeqCst) {
            return Err(TransportError::Failed("track refused".to_string()));
        }
        self.replaced
            .lock()
            .unwrap()
            .push((kind, track.map(|t| t.label().to_string())));
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Remote media carrying one audio and one video track.
#[must_use]
pub fn remote_media(label: &str) -> MediaStream {
    MediaStream::new(vec![
        MediaTrack::new(TrackKind::Audio, format!("{label}:microphone")),
        MediaTrack::new(TrackKind::Video, format!("{label}:camera")),
    ])
}

/// Build an incoming call whose connection delivers `label`'s media once
/// answered.
#[must_use]
pub fn incoming_call(
    remote_address: &str,
    label: &str,
) -> (IncomingCall, Arc<ScriptedConnection>) {
    let id = format!("in-{}", uuid::Uuid::new_v4());
    let (connection, events) = ScriptedConnection::new(
        id,
        TransportAddress::new(remote_address),
        Some(remote_media(label)),
    );
    let call = IncomingCall {
        remote_address: TransportAddress::new(remote_address),
        link: PeerLink {
            connection: Arc::clone(&connection) as Arc<dyn PeerConnection>,
            events,
        },
    };
    (call, connection)
}

/// Build an incoming call that delivers nothing once answered. Media
/// arrives only through [`ScriptedConnection::push_event`].
#[must_use]
pub fn silent_incoming_call(remote_address: &str) -> (IncomingCall, Arc<ScriptedConnection>) {
    let id = format!("in-{}", uuid::Uuid::new_v4());
    let (connection, events) =
        ScriptedConnection::new(id, TransportAddress::new(remote_address), None);
    let call = IncomingCall {
        remote_address: TransportAddress::new(remote_address),
        link: PeerLink {
            connection: Arc::clone(&connection) as Arc<dyn PeerConnection>,
            events,
        },
    };
    (call, connection)
}

/// Peer transport with scripted per-address behaviour.
#[derive(Debug, Default)]
pub struct ScriptedTransport {
    scripts: Mutex<HashMap<TransportAddress, DialScript>>,
    dials: Mutex<Vec<TransportAddress>>,
    connections: Mutex<Vec<Arc<ScriptedConnection>>>,
    next_id: AtomicU64,
}

impl ScriptedTransport {
    /// Create a new ScriptedTransport builder.
    #[must_use]
    pub fn builder() -> ScriptedTransportBuilder {
        ScriptedTransportBuilder::default()
    }

    /// Change an address's script.
    pub fn script(&self, address: &str, script: DialScript) {
        self.scripts
            .lock()
            .unwrap()
            .insert(TransportAddress::new(address), script);
    }

    /// Every dialed address, in order.
    #[must_use]
    pub fn dials(&self) -> Vec<TransportAddress> {
        self.dials.lock().unwrap().clone()
    }

    /// Number of dials placed to an address.
    #[must_use]
    pub fn dial_count(&self, address: &str) -> usize {
        let address = TransportAddress::new(address);
        self.dials
            .lock()
            .unwrap()
            .iter()
            .filter(|dialed| **dialed == address)
            .count()
    }

    /// Every connection handed out, in order.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<ScriptedConnection>> {
        self.connections.lock().unwrap().clone()
    }

    /// Connections to an address that the session has not closed.
    #[must_use]
    pub fn open_connections(&self, address: &str) -> Vec<Arc<ScriptedConnection>> {
        let address = TransportAddress::new(address);
        self.connections()
            .into_iter()
            .filter(|conn| conn.remote_address == address && !conn.is_closed())
            .collect()
    }

    fn connect(
        &self,
        address: &TransportAddress,
    ) -> (Arc<ScriptedConnection>, mpsc::Receiver<PeerEvent>) {
        let id = format!("out-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (connection, events) = ScriptedConnection::new(id, address.clone(), None);
        self.connections.lock().unwrap().push(Arc::clone(&connection));
        (connection, events)
    }
}

#[async_trait]
impl PeerTransport for ScriptedTransport {
    async fn dial(
        &self,
        address: &TransportAddress,
        _local: &MediaStream,
    ) -> Result<PeerLink, TransportError> {
        self.dials.lock().unwrap().push(address.clone());
        let script = self.scripts.lock().unwrap().get(address).cloned();

        let script = match script {
            None => return Err(TransportError::Unreachable(address.to_string())),
            Some(DialScript::Refuse) => {
                return Err(TransportError::Rejected(address.to_string()));
            }
            Some(DialScript::Hang) => std::future::pending().await,
            Some(script) => script,
        };

        let (connection, events) = self.connect(address);
        match script {
            DialScript::Answer => {
                connection
                    .push_event(PeerEvent::Stream(remote_media(address.as_str())))
                    .await;
            }
            DialScript::CloseBeforeMedia => connection.push_event(PeerEvent::Closed).await,
            _ => {}
        }
        Ok(PeerLink {
            connection,
            events,
        })
    }
}

/// Builder for ScriptedTransport configuration.
#[derive(Debug, Default)]
pub struct ScriptedTransportBuilder {
    scripts: HashMap<TransportAddress, DialScript>,
}

impl ScriptedTransportBuilder {
    #[must_use]
    pub fn answer(self, address: &str) -> Self {
        self.with(address, DialScript::Answer)
    }

    #[must_use]
    pub fn refuse(self, address: &str) -> Self {
        self.with(address, DialScript::Refuse)
    }

    #[must_use]
    pub fn hang(self, address: &str) -> Self {
        self.with(address, DialScript::Hang)
    }

    #[must_use]
    pub fn silent(self, address: &str) -> Self {
        self.with(address, DialScript::Silent)
    }

    #[must_use]
    pub fn close_before_media(self, address: &str) -> Self {
        self.with(address, DialScript::CloseBeforeMedia)
    }

    #[must_use]
    pub fn with(mut self, address: &str, script: DialScript) -> Self {
        self.scripts.insert(TransportAddress::new(address), script);
        self
    }

    /// Build the ScriptedTransport.
    #[must_use]
    pub fn build(self) -> ScriptedTransport {
        ScriptedTransport {
            scripts: Mutex::new(self.scripts),
            ..ScriptedTransport::default()
        }
    }
}
