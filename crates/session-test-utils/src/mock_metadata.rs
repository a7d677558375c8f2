//! Metadata channel that records every published patch.

use async_trait::async_trait;
use session_core::errors::SessionError;
use session_core::identity::IdentityKey;
use session_core::metadata::{MetadataChannel, SessionPatch};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

/// Records `(origin, patch)` pairs in publish order.
#[derive(Debug, Default)]
pub struct RecordingMetadata {
    published: Mutex<Vec<(IdentityKey, SessionPatch)>>,
    failing: AtomicBool,
}

impl RecordingMetadata {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later publish fail with `SessionError::Metadata`.
    pub fn fail_publishes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    #[must_use]
    pub fn published(&self) -> Vec<(IdentityKey, SessionPatch)> {
        self.published.lock().unwrap().clone()
    }

    /// Published patches without their origin.
    #[must_use]
    pub fn patches(&self) -> Vec<SessionPatch> {
        self.published()
            .into_iter()
            .map(|(_, patch)| patch)
            .collect()
    }

    /// Published patches of one kind, see [`SessionPatch::kind`].
    #[must_use]
    pub fn patches_of(&self, kind: &str) -> Vec<SessionPatch> {
        self.patches()
            .into_iter()
            .filter(|patch| patch.kind() == kind)
            .collect()
    }
}

#[async_trait]
impl MetadataChannel for RecordingMetadata {
    async fn publish(
        &self,
        origin: &IdentityKey,
        patch: &SessionPatch,
    ) -> Result<(), SessionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SessionError::Metadata("publish refused".to_string()));
        }
        self.published
            .lock()
            .unwrap()
            .push((origin.clone(), patch.clone()));
        Ok(())
    }
}
