//! Shared session document and the patches that change it.
//!
//! Every participant holds a copy of the [`SessionDocument`]. Local changes
//! are applied as a [`SessionPatch`] and published through the
//! [`MetadataChannel`]; remote patches arrive through
//! `SessionHandle::apply_remote_patch`. `apply` is pure and deterministic so
//! all copies converge when they see the same patches.

use crate::errors::SessionError;
use crate::identity::{IdentityKey, ParticipantRef, TransportAddress};
use crate::meeting_control::MeetingControlState;
use crate::screen_share::ScreenShareOwnership;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDocument {
    pub session_id: String,
    #[serde(default)]
    pub participants: Vec<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inviter: Option<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invitee: Option<ParticipantRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organizer: Option<ParticipantRef>,
    /// Addresses seen on inbound calls, attributed to a participant.
    #[serde(default)]
    pub observed_addresses: BTreeMap<TransportAddress, IdentityKey>,
    /// Identities removed from the session.
    #[serde(default)]
    pub removed: BTreeSet<IdentityKey>,
    #[serde(default)]
    pub control: MeetingControlState,
    #[serde(default)]
    pub screen_share: ScreenShareOwnership,
}

impl SessionDocument {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_participant(mut self, participant: ParticipantRef) -> Self {
        self.participants.push(participant);
        self
    }

    #[must_use]
    pub fn with_inviter(mut self, inviter: ParticipantRef) -> Self {
        self.inviter = Some(inviter);
        self
    }

    #[must_use]
    pub fn with_invitee(mut self, invitee: ParticipantRef) -> Self {
        self.invitee = Some(invitee);
        self
    }

    #[must_use]
    pub fn with_organizer(mut self, organizer: ParticipantRef) -> Self {
        self.organizer = Some(organizer);
        self
    }

    /// The organizer, else the inviter, else the first participant.
    pub fn host_reference(&self) -> Option<&ParticipantRef> {
        self.organizer
            .as_ref()
            .or(self.inviter.as_ref())
            .or_else(|| self.participants.first())
    }

    /// Every reference that contributes to membership.
    pub fn member_references(&self) -> impl Iterator<Item = &ParticipantRef> {
        self.organizer
            .iter()
            .chain(self.inviter.iter())
            .chain(self.invitee.iter())
            .chain(self.participants.iter())
    }

    pub fn to_json(&self) -> Result<String, SessionError> {
        serde_json::to_string(self).map_err(|e| SessionError::Metadata(e.to_string()))
    }

    pub fn from_json(raw: &str) -> Result<Self, SessionError> {
        serde_json::from_str(raw).map_err(|e| SessionError::Metadata(e.to_string()))
    }

    fn push_participant(&mut self, participant: ParticipantRef) {
        if !self.participants.contains(&participant) {
            self.participants.push(participant);
        }
    }

    /// Apply a patch. Returns true if the document changed.
    pub fn apply(&mut self, patch: &SessionPatch) -> bool {
        let before = self.clone();
        match patch {
            SessionPatch::ParticipantAdded { key, participant } => {
                self.removed.remove(key);
                self.control.waiting_room.retain(|waiting| waiting != key);
                self.push_participant(participant.clone());
            }
            SessionPatch::ParticipantsAdmitted { keys } => {
                for key in keys {
                    self.removed.remove(key);
                    self.control.waiting_room.retain(|waiting| waiting != key);
                    if let Some(participant) = key.to_reference() {
                        self.push_participant(participant);
                    }
                }
            }
            SessionPatch::ParticipantRemoved { key } => {
                self.removed.insert(key.clone());
                self.control.waiting_room.retain(|waiting| waiting != key);
                self.observed_addresses.retain(|_, owner| owner != key);
            }
            // A tombstoned identity may queue; only admission lifts the tombstone
            SessionPatch::WaitingRoomJoined { key } => {
                self.control.enqueue(key.clone());
            }
            SessionPatch::AddressObserved { address, key } => {
                self.observed_addresses
                    .entry(address.clone())
                    .or_insert_with(|| key.clone());
            }
            SessionPatch::LobbyToggled { enabled } => {
                self.control.lobby_enabled = *enabled;
            }
            SessionPatch::LockToggled { locked } => {
                self.control.meeting_locked = *locked;
            }
            SessionPatch::ScreenShareChanged { ownership } => {
                self.screen_share.merge(ownership);
            }
        }
        *self != before
    }
}

/// A single change to the session document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionPatch {
    ParticipantAdded {
        key: IdentityKey,
        participant: ParticipantRef,
    },
    ParticipantsAdmitted {
        keys: Vec<IdentityKey>,
    },
    ParticipantRemoved {
        key: IdentityKey,
    },
    WaitingRoomJoined {
        key: IdentityKey,
    },
    AddressObserved {
        address: TransportAddress,
        key: IdentityKey,
    },
    LobbyToggled {
        enabled: bool,
    },
    LockToggled {
        locked: bool,
    },
    ScreenShareChanged {
        ownership: ScreenShareOwnership,
    },
}

impl SessionPatch {
    /// Bounded label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionPatch::ParticipantAdded { .. } => "participant_added",
            SessionPatch::ParticipantsAdmitted { .. } => "participants_admitted",
            SessionPatch::ParticipantRemoved { .. } => "participant_removed",
            SessionPatch::WaitingRoomJoined { .. } => "waiting_room_joined",
            SessionPatch::AddressObserved { .. } => "address_observed",
            SessionPatch::LobbyToggled { .. } => "lobby_toggled",
            SessionPatch::LockToggled { .. } => "lock_toggled",
            SessionPatch::ScreenShareChanged { .. } => "screen_share_changed",
        }
    }
}

/// Publishes local patches to the other participants.
#[async_trait]
pub trait MetadataChannel: Send + Sync {
    async fn publish(&self, origin: &IdentityKey, patch: &SessionPatch)
        -> Result<(), SessionError>;
}

/// Channel for sessions without shared metadata.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullMetadataChannel;

#[async_trait]
impl MetadataChannel for NullMetadataChannel {
    async fn publish(
        &self,
        _origin: &IdentityKey,
        _patch: &SessionPatch,
    ) -> Result<(), SessionError> {
        Ok(())
    }
}
