//! Peer transport seam.
//!
//! The session core never talks to a network directly. It dials through a
//! [`PeerTransport`], answers [`IncomingCall`]s delivered on a channel, and
//! observes each connection through its [`PeerEvent`] stream.
//!
//! [`loopback`] is an in-process implementation for the demo binary and tests.

pub mod loopback;

use crate::errors::TransportError;
use crate::identity::TransportAddress;
use crate::media::{MediaStream, MediaTrack, TrackKind};
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Lifecycle events of one peer connection.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// The remote side's media arrived (or was renegotiated).
    Stream(MediaStream),
    /// The connection closed.
    Closed,
    /// The connection failed.
    Error(String),
}

/// One bidirectional media connection.
#[async_trait]
pub trait PeerConnection: Send + Sync + fmt::Debug {
    /// Unique per connection, never reused.
    fn id(&self) -> &str;

    /// Address of the remote side.
    fn remote_address(&self) -> &TransportAddress;

    /// Accept an inbound call, offering local media.
    async fn answer(&self, local: &MediaStream) -> Result<(), TransportError>;

    /// Swap an outgoing track without renegotiating the connection.
    async fn replace_track(
        &self,
        kind: TrackKind,
        track: Option<MediaTrack>,
    ) -> Result<(), TransportError>;

    /// Close the connection. Idempotent.
    fn close(&self);
}

/// A connection paired with its event stream.
pub struct PeerLink {
    pub connection: Arc<dyn PeerConnection>,
    pub events: mpsc::Receiver<PeerEvent>,
}

impl fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerLink")
            .field("connection", &self.connection.id())
            .finish_non_exhaustive()
    }
}

/// An unanswered call from a remote participant.
#[derive(Debug)]
pub struct IncomingCall {
    pub remote_address: TransportAddress,
    pub link: PeerLink,
}

/// Outbound dialing.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Place a call to an address, offering local media.
    ///
    /// Returns once the call is placed; remote media arrives later as a
    /// [`PeerEvent::Stream`].
    async fn dial(
        &self,
        address: &TransportAddress,
        local: &MediaStream,
    ) -> Result<PeerLink, TransportError>;
}
