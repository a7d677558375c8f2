//! In-process transport, synthetic media and metadata fan-out.
//!
//! Lets complete sessions run inside one process: every participant listens
//! on its addresses through a shared [`LoopbackNetwork`], captures from
//! [`SyntheticMedia`] and exchanges patches through a [`LoopbackDocument`].

use super::{IncomingCall, PeerConnection, PeerEvent, PeerLink, PeerTransport};
use crate::actors::SessionHandle;
use crate::errors::{MediaError, SessionError, TransportError};
use crate::identity::{IdentityKey, TransportAddress};
use crate::media::{
    MediaConstraints, MediaDeviceInfo, MediaDevices, MediaStream, MediaTrack, TrackKind,
};
use crate::metadata::{MetadataChannel, SessionDocument, SessionPatch};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::debug;

/// Buffer for per-connection event channels.
const EVENT_CHANNEL_BUFFER: usize = 16;

/// Buffer for a listener's incoming-call channel.
const INCOMING_CHANNEL_BUFFER: usize = 32;

/// Registry of listening addresses and the links placed between them.
#[derive(Debug, Clone, Default)]
pub struct LoopbackNetwork {
    listeners: Arc<RwLock<HashMap<TransportAddress, mpsc::Sender<IncomingCall>>>>,
    links: Arc<RwLock<Vec<LinkEnds>>>,
    next_connection: Arc<AtomicU64>,
}

/// Both ends of one placed call.
#[derive(Debug)]
struct LinkEnds {
    caller: Arc<LoopbackConnection>,
    callee: Arc<LoopbackConnection>,
}

impl LinkEnds {
    fn id(&self) -> &str {
        self.caller.id.trim_end_matches("-out")
    }
}

/// A physical link neither end has closed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenLink {
    /// Shared prefix of both ends' connection ids.
    pub id: String,
    pub caller: TransportAddress,
    pub callee: TransportAddress,
}

impl LoopbackNetwork {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Listen on every address; calls to any of them arrive on one receiver.
    pub async fn listen(
        &self,
        addresses: impl IntoIterator<Item = TransportAddress>,
    ) -> mpsc::Receiver<IncomingCall> {
        let (tx, rx) = mpsc::channel(INCOMING_CHANNEL_BUFFER);
        let mut listeners = self.listeners.write().await;
        for address in addresses {
            listeners.insert(address, tx.clone());
        }
        rx
    }

    pub async fn unlisten(&self, address: &TransportAddress) {
        self.listeners.write().await.remove(address);
    }

    /// Links that are still open, in placement order.
    pub async fn open_links(&self) -> Vec<OpenLink> {
        let mut links = self.links.write().await;
        links.retain(|ends| !ends.caller.is_closed());
        links
            .iter()
            .map(|ends| OpenLink {
                id: ends.id().to_string(),
                caller: ends.callee.remote_address.clone(),
                callee: ends.caller.remote_address.clone(),
            })
            .collect()
    }

    /// Drop a link as a network failure would: both ends see it close.
    ///
    /// Returns false if the link is unknown or already closed.
    pub async fn sever(&self, link_id: &str) -> bool {
        let links = self.links.read().await;
        match links.iter().find(|ends| ends.id() == link_id) {
            Some(ends) => ends.caller.fail(),
            None => false,
        }
    }

    /// Transport that places calls from `local_address`.
    #[must_use]
    pub fn transport(&self, local_address: TransportAddress) -> Arc<LoopbackTransport> {
        Arc::new(LoopbackTransport {
            network: self.clone(),
            local_address,
        })
    }
}

/// Dials other listeners on a [`LoopbackNetwork`].
#[derive(Debug)]
pub struct LoopbackTransport {
    network: LoopbackNetwork,
    local_address: TransportAddress,
}

#[async_trait]
impl PeerTransport for LoopbackTransport {
    async fn dial(
        &self,
        address: &TransportAddress,
        local: &MediaStream,
    ) -> Result<PeerLink, TransportError> {
        let listener = self
            .network
            .listeners
            .read()
            .await
            .get(address)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(address.to_string()))?;

        let id = self.network.next_connection.fetch_add(1, Ordering::Relaxed);
        let (caller, callee, ends) = LoopbackConnection::pair(
            id,
            self.local_address.clone(),
            address.clone(),
            local.clone(),
        );

        listener
            .send(IncomingCall {
                remote_address: self.local_address.clone(),
                link: callee,
            })
            .await
            .map_err(|_| TransportError::Unreachable(address.to_string()))?;
        self.network.links.write().await.push(ends);

        debug!(
            target: "session.dial",
            from = %self.local_address,
            to = %address,
            connection_id = id,
            "Loopback call placed"
        );
        Ok(caller)
    }
}

/// One end of an in-process connection.
#[derive(Debug)]
pub struct LoopbackConnection {
    id: String,
    remote_address: TransportAddress,
    /// Events delivered to this end.
    own_events: mpsc::Sender<PeerEvent>,
    /// Events delivered to the other end.
    peer_events: mpsc::Sender<PeerEvent>,
    /// Caller's offered media, delivered to the callee on answer.
    offer: Option<MediaStream>,
    outgoing: RwLock<Vec<MediaTrack>>,
    closed: Arc<AtomicBool>,
}

impl LoopbackConnection {
    fn pair(
        id: u64,
        caller_address: TransportAddress,
        callee_address: TransportAddress,
        offer: MediaStream,
    ) -> (PeerLink, PeerLink, LinkEnds) {
        let (caller_tx, caller_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let (callee_tx, callee_rx) = mpsc::channel(EVENT_CHANNEL_BUFFER);
        let closed = Arc::new(AtomicBool::new(false));

        let caller = LoopbackConnection {
            id: format!("loop-{id}-out"),
            remote_address: callee_address,
            own_events: caller_tx.clone(),
            peer_events: callee_tx.clone(),
            offer: None,
            outgoing: RwLock::new(offer.tracks().to_vec()),
            closed: Arc::clone(&closed),
        };
        let callee = LoopbackConnection {
            id: format!("loop-{id}-in"),
            remote_address: caller_address,
            own_events: callee_tx,
            peer_events: caller_tx,
            offer: Some(offer),
            outgoing: RwLock::new(Vec::new()),
            closed,
        };

        let ends = LinkEnds {
            caller: Arc::new(caller),
            callee: Arc::new(callee),
        };
        (
            PeerLink {
                connection: Arc::clone(&ends.caller) as Arc<dyn PeerConnection>,
                events: caller_rx,
            },
            PeerLink {
                connection: Arc::clone(&ends.callee) as Arc<dyn PeerConnection>,
                events: callee_rx,
            },
            ends,
        )
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Close from outside both ends, notifying each.
    fn fail(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let _ = self.own_events.try_send(PeerEvent::Closed);
        let _ = self.peer_events.try_send(PeerEvent::Closed);
        true
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.is_closed() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerConnection for LoopbackConnection {
    fn id(&self) -> &str {
        &self.id
    }

    fn remote_address(&self) -> &TransportAddress {
        &self.remote_address
    }

    async fn answer(&self, local: &MediaStream) -> Result<(), TransportError> {
        self.ensure_open()?;
        let offer = self
            .offer
            .clone()
            .ok_or_else(|| TransportError::Failed("outbound connection cannot answer".to_string()))?;
        *self.outgoing.write().await = local.tracks().to_vec();
        self.peer_events
            .send(PeerEvent::Stream(local.clone()))
            .await
            .map_err(|_| TransportError::Closed)?;
        self.own_events
            .send(PeerEvent::Stream(offer))
            .await
            .map_err(|_| TransportError::Closed)
    }

    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<MediaTrack>,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let renegotiated = {
            let mut outgoing = self.outgoing.write().await;
            outgoing.retain(|existing| existing.kind() != kind);
            outgoing.extend(track);
            MediaStream::new(outgoing.clone())
        };
        self.peer_events
            .send(PeerEvent::Stream(renegotiated))
            .await
            .map_err(|_| TransportError::Closed)
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            let _ = self.peer_events.try_send(PeerEvent::Closed);
        }
    }
}

/// Capture devices that produce labelled synthetic tracks.
#[derive(Debug)]
pub struct SyntheticMedia {
    devices: Vec<MediaDeviceInfo>,
    autoplay_blocked: AtomicBool,
}

impl Default for SyntheticMedia {
    fn default() -> Self {
        Self::new()
    }
}

impl SyntheticMedia {
    /// One default camera and microphone.
    #[must_use]
    pub fn new() -> Self {
        Self {
            devices: vec![
                MediaDeviceInfo {
                    device_id: "default-camera".to_string(),
                    kind: TrackKind::Video,
                    label: "Synthetic Camera".to_string(),
                },
                MediaDeviceInfo {
                    device_id: "default-microphone".to_string(),
                    kind: TrackKind::Audio,
                    label: "Synthetic Microphone".to_string(),
                },
            ],
            autoplay_blocked: AtomicBool::new(false),
        }
    }

    /// Block or allow remote playback.
    pub fn set_autoplay_blocked(&self, blocked: bool) {
        self.autoplay_blocked.store(blocked, Ordering::SeqCst);
    }
}

#[async_trait]
impl MediaDevices for SyntheticMedia {
    async fn acquire_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        if !constraints.audio && !constraints.video {
            return Err(MediaError::NoDevice);
        }
        let device = constraints.device_id.as_deref().unwrap_or("default");
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(TrackKind::Audio, format!("{device}:microphone")));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(TrackKind::Video, format!("{device}:camera")));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn acquire_display_media(&self) -> Result<MediaStream, MediaError> {
        Ok(MediaStream::new(vec![MediaTrack::new(
            TrackKind::Video,
            "screen",
        )]))
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        Ok(self.devices.clone())
    }

    async fn play(&self, _stream: &MediaStream) -> Result<(), MediaError> {
        if self.autoplay_blocked.load(Ordering::SeqCst) {
            Err(MediaError::AutoplayBlocked)
        } else {
            Ok(())
        }
    }
}

/// Shared session document with ordered fan-out to subscribed sessions.
///
/// Each subscriber receives every patch published by another participant,
/// in publish order.
#[derive(Debug, Clone)]
pub struct LoopbackDocument {
    document: Arc<RwLock<SessionDocument>>,
    subscribers: Arc<RwLock<Vec<(IdentityKey, mpsc::UnboundedSender<SessionPatch>)>>>,
}

impl LoopbackDocument {
    #[must_use]
    pub fn new(document: SessionDocument) -> Self {
        Self {
            document: Arc::new(RwLock::new(document)),
            subscribers: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Current merged document, for participants joining later.
    pub async fn snapshot(&self) -> SessionDocument {
        self.document.read().await.clone()
    }

    /// Deliver other participants' patches to a session.
    pub async fn subscribe(&self, handle: SessionHandle) {
        let (tx, mut rx) = mpsc::unbounded_channel::<SessionPatch>();
        self.subscribers
            .write()
            .await
            .push((handle.local_key().clone(), tx));
        tokio::spawn(async move {
            while let Some(patch) = rx.recv().await {
                if handle.apply_remote_patch(patch).await.is_err() {
                    break;
                }
            }
        });
    }
}

#[async_trait]
impl MetadataChannel for LoopbackDocument {
    async fn publish(&self, origin: &IdentityKey, patch: &SessionPatch) -> Result<(), SessionError> {
        self.document.write().await.apply(patch);
        let mut subscribers = self.subscribers.write().await;
        subscribers.retain(|(key, tx)| key == origin || tx.send(patch.clone()).is_ok());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_unknown_address_is_unreachable() {
        let network = LoopbackNetwork::new();
        let transport = network.transport(TransportAddress::new("dt-a"));
        let result = transport
            .dial(&TransportAddress::new("dt-nobody"), &MediaStream::empty())
            .await;
        assert!(matches!(result, Err(TransportError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_answer_exchanges_media_both_ways() {
        let network = LoopbackNetwork::new();
        let mut incoming = network.listen([TransportAddress::new("dt-b")]).await;
        let transport = network.transport(TransportAddress::new("dt-a"));
        let offer = MediaStream::new(vec![MediaTrack::new(TrackKind::Audio, "a-mic")]);

        let mut caller = transport
            .dial(&TransportAddress::new("dt-b"), &offer)
            .await
            .unwrap();
        let call = incoming.recv().await.unwrap();
        assert_eq!(call.remote_address, TransportAddress::new("dt-a"));

        let answer = MediaStream::new(vec![MediaTrack::new(TrackKind::Video, "b-cam")]);
        let mut callee = call.link;
        callee.connection.answer(&answer).await.unwrap();

        match caller.events.recv().await.unwrap() {
            PeerEvent::Stream(stream) => assert_eq!(stream, answer),
            other => panic!("unexpected event {other:?}"),
        }
        match callee.events.recv().await.unwrap() {
            PeerEvent::Stream(stream) => assert_eq!(stream, offer),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_close_notifies_peer_once() {
        let network = LoopbackNetwork::new();
        let mut incoming = network.listen([TransportAddress::new("dt-b")]).await;
        let transport = network.transport(TransportAddress::new("dt-a"));
        let caller = transport
            .dial(&TransportAddress::new("dt-b"), &MediaStream::empty())
            .await
            .unwrap();
        let mut callee = incoming.recv().await.unwrap().link;

        caller.connection.close();
        caller.connection.close();

        assert!(matches!(callee.events.recv().await, Some(PeerEvent::Closed)));
        assert!(callee.events.try_recv().is_err());
        assert!(matches!(
            callee.connection.answer(&MediaStream::empty()).await,
            Err(TransportError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_sever_closes_both_ends() {
        let network = LoopbackNetwork::new();
        let mut incoming = network.listen([TransportAddress::new("dt-b")]).await;
        let transport = network.transport(TransportAddress::new("dt-a"));
        let mut caller = transport
            .dial(&TransportAddress::new("dt-b"), &MediaStream::empty())
            .await
            .unwrap();
        let mut callee = incoming.recv().await.unwrap().link;

        let links = network.open_links().await;
        assert_eq!(
            links,
            vec![OpenLink {
                id: "loop-0".to_string(),
                caller: TransportAddress::new("dt-a"),
                callee: TransportAddress::new("dt-b"),
            }]
        );

        assert!(network.sever("loop-0").await);
        assert!(!network.sever("loop-0").await);
        assert!(matches!(caller.events.recv().await, Some(PeerEvent::Closed)));
        assert!(matches!(callee.events.recv().await, Some(PeerEvent::Closed)));
        assert!(network.open_links().await.is_empty());
    }

    #[tokio::test]
    async fn test_replace_track_renegotiates() {
        let network = LoopbackNetwork::new();
        let mut incoming = network.listen([TransportAddress::new("dt-b")]).await;
        let transport = network.transport(TransportAddress::new("dt-a"));
        let offer = MediaStream::new(vec![
            MediaTrack::new(TrackKind::Audio, "mic"),
            MediaTrack::new(TrackKind::Video, "cam"),
        ]);
        let caller = transport
            .dial(&TransportAddress::new("dt-b"), &offer)
            .await
            .unwrap();
        let mut callee = incoming.recv().await.unwrap().link;

        let screen = MediaTrack::new(TrackKind::Video, "screen");
        caller
            .connection
            .replace_track(TrackKind::Video, Some(screen.clone()))
            .await
            .unwrap();

        match callee.events.recv().await.unwrap() {
            PeerEvent::Stream(stream) => {
                assert_eq!(stream.first_track(TrackKind::Video), Some(&screen));
                assert_eq!(stream.tracks().len(), 2);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_synthetic_media_autoplay_toggle() {
        let media = SyntheticMedia::new();
        let stream = media
            .acquire_user_media(&MediaConstraints::camera(Some("usb".to_string())))
            .await
            .unwrap();
        assert_eq!(stream.tracks().len(), 2);
        assert_eq!(
            stream.first_track(TrackKind::Video).unwrap().label(),
            "usb:camera"
        );

        media.set_autoplay_blocked(true);
        assert_eq!(media.play(&stream).await, Err(MediaError::AutoplayBlocked));
        media.set_autoplay_blocked(false);
        assert!(media.play(&stream).await.is_ok());
    }
}
