//! Local capture streams and the controller that owns them.
//!
//! A [`MediaTrack`] is a shared handle: clones observe the same enabled flag
//! and the same `ended` signal, which fires when the track is stopped either
//! locally or by the platform (e.g. the user clicking "stop sharing").

use crate::errors::MediaError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Track media type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Source of a local stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaKind {
    Camera,
    Screen,
}

#[derive(Debug)]
struct TrackInner {
    id: String,
    kind: TrackKind,
    label: String,
    enabled: AtomicBool,
    ended: CancellationToken,
}

/// A single audio or video track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    inner: Arc<TrackInner>,
}

impl MediaTrack {
    pub fn new(kind: TrackKind, label: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(TrackInner {
                id: uuid::Uuid::new_v4().to_string(),
                kind,
                label: label.into(),
                enabled: AtomicBool::new(true),
                ended: CancellationToken::new(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn kind(&self) -> TrackKind {
        self.inner.kind
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Stop the track. Idempotent.
    pub fn stop(&self) {
        self.inner.ended.cancel();
    }

    pub fn is_ended(&self) -> bool {
        self.inner.ended.is_cancelled()
    }

    /// Token cancelled once the track ends.
    pub fn ended_token(&self) -> CancellationToken {
        self.inner.ended.clone()
    }
}

impl PartialEq for MediaTrack {
    fn eq(&self, other: &Self) -> bool {
        self.inner.id == other.inner.id
    }
}

impl Eq for MediaTrack {}

/// An ordered bundle of tracks.
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            tracks,
        }
    }

    /// Stream with no tracks, used to join without devices.
    pub fn empty() -> Self {
        Self::new(Vec::new())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// First track of a kind that has not ended.
    pub fn first_track(&self, kind: TrackKind) -> Option<&MediaTrack> {
        self.tracks
            .iter()
            .find(|track| track.kind() == kind && !track.is_ended())
    }

    /// Live (not ended) tracks of a kind.
    pub fn live_count(&self, kind: TrackKind) -> usize {
        self.tracks
            .iter()
            .filter(|track| track.kind() == kind && !track.is_ended())
            .count()
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

impl PartialEq for MediaStream {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for MediaStream {}

/// Capture request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
    pub device_id: Option<String>,
}

impl MediaConstraints {
    /// Camera and microphone, optionally pinned to one device.
    pub fn camera(device_id: Option<String>) -> Self {
        Self {
            audio: true,
            video: true,
            device_id,
        }
    }
}

/// An enumerated capture device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaDeviceInfo {
    pub device_id: String,
    pub kind: TrackKind,
    pub label: String,
}

/// Platform capture and playback.
#[async_trait]
pub trait MediaDevices: Send + Sync {
    /// Acquire camera and/or microphone.
    async fn acquire_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError>;

    /// Prompt the user to pick a display surface.
    async fn acquire_display_media(&self) -> Result<MediaStream, MediaError>;

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError>;

    /// Start playback of a remote stream.
    ///
    /// Fails with [`MediaError::AutoplayBlocked`] until a user gesture.
    async fn play(&self, stream: &MediaStream) -> Result<(), MediaError>;
}

/// Owns the local camera and screen streams.
///
/// At most one screen stream is held, and only while this participant owns
/// screen share. The outgoing video track is the screen track while
/// presenting and the camera track otherwise, never both.
pub struct LocalMediaController {
    devices: Arc<dyn MediaDevices>,
    camera: Option<MediaStream>,
    camera_device: Option<String>,
    screen: Option<MediaStream>,
    muted: bool,
}

impl std::fmt::Debug for LocalMediaController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMediaController")
            .field("camera", &self.camera.as_ref().map(MediaStream::id))
            .field("camera_device", &self.camera_device)
            .field("screen", &self.screen.as_ref().map(MediaStream::id))
            .field("muted", &self.muted)
            .finish_non_exhaustive()
    }
}

impl LocalMediaController {
    pub fn new(devices: Arc<dyn MediaDevices>) -> Self {
        Self {
            devices,
            camera: None,
            camera_device: None,
            screen: None,
            muted: false,
        }
    }

    /// Shared handle to the platform devices.
    pub fn devices(&self) -> Arc<dyn MediaDevices> {
        Arc::clone(&self.devices)
    }

    /// Acquire camera and microphone if not already held.
    pub async fn acquire_camera(
        &mut self,
        device_id: Option<String>,
    ) -> Result<MediaStream, MediaError> {
        if let Some(camera) = &self.camera {
            let same_device = device_id.is_none() || device_id == self.camera_device;
            if same_device && camera.tracks().iter().any(|track| !track.is_ended()) {
                return Ok(camera.clone());
            }
        }

        let stream = self.capture_camera(device_id.clone()).await?;
        if let Some(previous) = self.camera.replace(stream.clone()) {
            previous.stop_all();
        }
        self.camera_device = device_id;
        Ok(stream)
    }

    /// Capture a replacement camera stream without committing it.
    pub async fn prepare_switch(
        &self,
        device_id: Option<String>,
    ) -> Result<MediaStream, MediaError> {
        self.capture_camera(device_id.or_else(|| self.camera_device.clone()))
            .await
    }

    /// Commit a prepared stream, returning the one it replaces.
    ///
    /// The caller stops the returned stream once every connection carries
    /// the new tracks.
    pub fn commit_switch(
        &mut self,
        stream: MediaStream,
        device_id: Option<String>,
    ) -> Option<MediaStream> {
        if device_id.is_some() {
            self.camera_device = device_id;
        }
        info!(
            target: "session.media",
            stream_id = %stream.id(),
            device = ?self.camera_device,
            "Camera switched"
        );
        self.camera.replace(stream)
    }

    async fn capture_camera(&self, device_id: Option<String>) -> Result<MediaStream, MediaError> {
        let stream = self
            .devices
            .acquire_user_media(&MediaConstraints::camera(device_id))
            .await?;
        for track in stream.tracks() {
            if track.kind() == TrackKind::Audio {
                track.set_enabled(!self.muted);
            }
        }
        debug!(
            target: "session.media",
            stream_id = %stream.id(),
            tracks = stream.tracks().len(),
            "Camera captured"
        );
        Ok(stream)
    }

    /// Hold a freshly captured screen stream.
    pub fn set_screen(&mut self, stream: MediaStream) {
        if let Some(previous) = self.screen.replace(stream) {
            previous.stop_all();
        }
    }

    /// Drop and stop the screen stream.
    pub fn release_screen(&mut self) -> Option<MediaStream> {
        let screen = self.screen.take();
        if let Some(stream) = &screen {
            stream.stop_all();
        }
        screen
    }

    /// Toggle microphone tracks without renegotiating.
    pub fn set_muted(&mut self, muted: bool) {
        self.muted = muted;
        if let Some(camera) = &self.camera {
            for track in camera.tracks() {
                if track.kind() == TrackKind::Audio {
                    track.set_enabled(!muted);
                }
            }
        }
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn camera(&self) -> Option<&MediaStream> {
        self.camera.as_ref()
    }

    pub fn screen(&self) -> Option<&MediaStream> {
        self.screen.as_ref()
    }

    pub fn is_presenting(&self) -> bool {
        self.screen.is_some()
    }

    /// The single locally active stream: screen while presenting, else camera.
    pub fn active_stream(&self) -> Option<&MediaStream> {
        self.screen.as_ref().or(self.camera.as_ref())
    }

    /// Video track currently sent to peers.
    pub fn outgoing_video(&self) -> Option<MediaTrack> {
        self.active_stream()
            .and_then(|stream| stream.first_track(TrackKind::Video))
            .cloned()
    }

    /// Stream offered when dialing or answering.
    pub fn outgoing_stream(&self) -> MediaStream {
        let mut tracks = Vec::new();
        if let Some(audio) = self
            .camera
            .as_ref()
            .and_then(|camera| camera.first_track(TrackKind::Audio))
        {
            tracks.push(audio.clone());
        }
        if let Some(video) = self.outgoing_video() {
            tracks.push(video);
        }
        if tracks.is_empty() {
            MediaStream::empty()
        } else {
            MediaStream::new(tracks)
        }
    }

    /// Live local (audio, video) track counts.
    pub fn track_counts(&self) -> (usize, usize) {
        [self.camera.as_ref(), self.screen.as_ref()]
            .into_iter()
            .flatten()
            .fold((0, 0), |(audio, video), stream| {
                (
                    audio + stream.live_count(TrackKind::Audio),
                    video + stream.live_count(TrackKind::Video),
                )
            })
    }

    /// Start playback of a remote stream.
    pub async fn play_remote(&self, stream: &MediaStream) -> Result<(), MediaError> {
        self.devices.play(stream).await
    }

    /// Stop and drop everything.
    pub fn release_all(&mut self) {
        if let Some(camera) = self.camera.take() {
            camera.stop_all();
        }
        self.release_screen();
    }
}
