//! Pre-configured participants and session documents.

use session_core::identity::{IdentityKey, ParticipantRef};
use session_core::metadata::SessionDocument;
use uuid::Uuid;

/// Alice, usually the organizer.
#[must_use]
pub fn alice() -> ParticipantRef {
    ParticipantRef::from_email("alice@example.com")
        .with_id("alice")
        .with_name("Alice")
}

/// Bob, usually the invitee.
#[must_use]
pub fn bob() -> ParticipantRef {
    ParticipantRef::from_email("bob@example.com")
        .with_id("bob")
        .with_name("Bob")
}

#[must_use]
pub fn carol() -> ParticipantRef {
    ParticipantRef::from_email("carol@example.com")
        .with_id("carol")
        .with_name("Carol")
}

/// Canonical key of an email-bearing reference.
#[must_use]
pub fn key_of(email: &str) -> IdentityKey {
    IdentityKey::from_canonical(format!("email:{}", email.to_lowercase()))
}

/// Test session document fixture.
#[derive(Debug, Clone)]
pub struct TestSession {
    document: SessionDocument,
}

impl TestSession {
    /// Create a new test session with the given ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            document: SessionDocument::new(id),
        }
    }

    /// Create a test session with a random ID.
    #[must_use]
    pub fn random() -> Self {
        Self::new(format!("session-{}", Uuid::new_v4()))
    }

    #[must_use]
    pub fn organizer(mut self, participant: ParticipantRef) -> Self {
        self.document.organizer = Some(participant);
        self
    }

    #[must_use]
    pub fn inviter(mut self, participant: ParticipantRef) -> Self {
        self.document.inviter = Some(participant);
        self
    }

    #[must_use]
    pub fn invitee(mut self, participant: ParticipantRef) -> Self {
        self.document.invitee = Some(participant);
        self
    }

    #[must_use]
    pub fn participant(mut self, participant: ParticipantRef) -> Self {
        self.document.participants.push(participant);
        self
    }

    /// Start with the lobby enabled.
    #[must_use]
    pub fn with_lobby(mut self) -> Self {
        self.document.control.lobby_enabled = true;
        self
    }

    /// Start locked.
    #[must_use]
    pub fn locked(mut self) -> Self {
        self.document.control.meeting_locked = true;
        self
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.document.session_id
    }

    /// Build the SessionDocument.
    #[must_use]
    pub fn build(self) -> SessionDocument {
        self.document
    }
}
