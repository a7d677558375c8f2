//! Scripted media devices.
//!
//! Camera and display capture can be scripted to fail, remote playback can
//! be blocked until a test flips it back, and every capture is counted.

use async_trait::async_trait;
use session_core::errors::MediaError;
use session_core::media::{
    MediaConstraints, MediaDeviceInfo, MediaDevices, MediaStream, MediaTrack, TrackKind,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

/// Media devices with scripted failures.
#[derive(Debug, Default)]
pub struct ScriptedMedia {
    camera_error: Mutex<Option<MediaError>>,
    display_error: Mutex<Option<MediaError>>,
    autoplay_blocked: AtomicBool,
    camera_captures: AtomicUsize,
    display_captures: AtomicUsize,
    plays: AtomicUsize,
    last_display: Mutex<Option<MediaStream>>,
}

impl ScriptedMedia {
    /// Create a new ScriptedMedia builder.
    #[must_use]
    pub fn builder() -> ScriptedMediaBuilder {
        ScriptedMediaBuilder::default()
    }

    /// Fail (or stop failing) camera capture.
    pub fn set_camera_error(&self, error: Option<MediaError>) {
        *self.camera_error.lock().unwrap() = error;
    }

    /// Fail (or stop failing) display capture.
    pub fn set_display_error(&self, error: Option<MediaError>) {
        *self.display_error.lock().unwrap() = error;
    }

    pub fn set_autoplay_blocked(&self, blocked: bool) {
        self.autoplay_blocked.store(blocked, Ordering::SeqCst);
    }

    #[must_use]
    pub fn camera_captures(&self) -> usize {
        self.camera_captures.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn display_captures(&self) -> usize {
        self.display_captures.load(Ordering::SeqCst)
    }

    /// Successful playback starts.
    #[must_use]
    pub fn plays(&self) -> usize {
        self.plays.load(Ordering::SeqCst)
    }

    /// The most recent display capture, so tests can end it like the
    /// platform's "stop sharing" button would.
    #[must_use]
    pub fn last_display(&self) -> Option<MediaStream> {
        self.last_display.lock().unwrap().clone()
    }
}

#[async_trait]
impl MediaDevices for ScriptedMedia {
    async fn acquire_user_media(
        &self,
        constraints: &MediaConstraints,
    ) -> Result<MediaStream, MediaError> {
        if let Some(error) = self.camera_error.lock().unwrap().clone() {
            return Err(error);
        }
        let capture = self.camera_captures.fetch_add(1, Ordering::SeqCst) + 1;
        let device = constraints.device_id.as_deref().unwrap_or("default");
        let mut tracks = Vec::new();
        if constraints.audio {
            tracks.push(MediaTrack::new(
                TrackKind::Audio,
                format!("{device}:microphone:{capture}"),
            ));
        }
        if constraints.video {
            tracks.push(MediaTrack::new(
                TrackKind::Video,
                format!("{device}:camera:{capture}"),
            ));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn acquire_display_media(&self) -> Result<MediaStream, MediaError> {
        if let Some(error) = self.display_error.lock().unwrap().clone() {
            return Err(error);
        }
        let capture = self.display_captures.fetch_add(1, Ordering::SeqCst) + 1;
        let stream = MediaStream::new(vec![MediaTrack::new(
            TrackKind::Video,
            format!("screen:{capture}"),
        )]);
        *self.last_display.lock().unwrap() = Some(stream.clone());
        Ok(stream)
    }

    async fn enumerate_devices(&self) -> Result<Vec<MediaDeviceInfo>, MediaError> {
        Ok(vec![
            MediaDeviceInfo {
                device_id: "default".to_string(),
                kind: TrackKind::Video,
                label: "Scripted Camera".to_string(),
            },
            MediaDeviceInfo {
                device_id: "usb-camera".to_string(),
                kind: TrackKind::Video,
                label: "Scripted USB Camera".to_string(),
            },
        ])
    }

    async fn play(&self, _stream: &MediaStream) -> Result<(), MediaError> {
        if self.autoplay_blocked.load(Ordering::SeqCst) {
            return Err(MediaError::AutoplayBlocked);
        }
        self.plays.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Builder for ScriptedMedia configuration.
#[derive(Debug, Default)]
pub struct ScriptedMediaBuilder {
    camera_error: Option<MediaError>,
    display_error: Option<MediaError>,
    autoplay_blocked: bool,
}

impl ScriptedMediaBuilder {
    /// Camera capture fails with `error`.
    #[must_use]
    pub fn deny_camera(mut self, error: MediaError) -> Self {
        self.camera_error = Some(error);
        self
    }

    /// Display capture fails with `error`.
    #[must_use]
    pub fn deny_display(mut self, error: MediaError) -> Self {
        self.display_error = Some(error);
        self
    }

    /// Remote playback fails with `AutoplayBlocked`.
    #[must_use]
    pub fn block_autoplay(mut self) -> Self {
        self.autoplay_blocked = true;
        self
    }

    /// Build the ScriptedMedia.
    #[must_use]
    pub fn build(self) -> ScriptedMedia {
        ScriptedMedia {
            camera_error: Mutex::new(self.camera_error),
            display_error: Mutex::new(self.display_error),
            autoplay_blocked: AtomicBool::new(self.autoplay_blocked),
            ..ScriptedMedia::default()
        }
    }
}
