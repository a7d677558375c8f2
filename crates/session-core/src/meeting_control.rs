//! Host-only meeting controls: lobby, lock and admission.
//!
//! Every action takes the acting identity. Actions from anyone other than
//! the host return [`ControlOutcome::Ignored`] and leave state untouched.

use crate::identity::IdentityKey;
use serde::{Deserialize, Serialize};

/// Shared meeting control state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MeetingControlState {
    pub host_id: Option<IdentityKey>,
    pub lobby_enabled: bool,
    pub meeting_locked: bool,
    /// Identities waiting for admission, in arrival order.
    pub waiting_room: Vec<IdentityKey>,
}

/// Result of a control action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOutcome {
    /// State changed.
    Applied,
    /// Authorized but nothing to do.
    Unchanged,
    /// Actor is not the host; no-op.
    Ignored,
}

impl ControlOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlOutcome::Applied => "applied",
            ControlOutcome::Unchanged => "unchanged",
            ControlOutcome::Ignored => "ignored",
        }
    }
}

/// Host control actions, used as metric labels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlAction {
    ToggleLobby,
    ToggleLock,
    Admit,
    AdmitAll,
    Remove,
}

impl ControlAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlAction::ToggleLobby => "toggle_lobby",
            ControlAction::ToggleLock => "toggle_lock",
            ControlAction::Admit => "admit",
            ControlAction::AdmitAll => "admit_all",
            ControlAction::Remove => "remove",
        }
    }
}

/// How a join attempt is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinDecision {
    AlreadyMember,
    Admitted,
    Waiting,
    Refused,
}

/// Identities moved out of the waiting room by an admit action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub outcome: ControlOutcome,
    pub admitted: Vec<IdentityKey>,
}

impl Admission {
    fn ignored() -> Self {
        Self {
            outcome: ControlOutcome::Ignored,
            admitted: Vec::new(),
        }
    }
}

impl MeetingControlState {
    pub fn with_host(host: IdentityKey) -> Self {
        Self {
            host_id: Some(host),
            ..Self::default()
        }
    }

    pub fn is_host(&self, key: &IdentityKey) -> bool {
        self.host_id.as_ref() == Some(key)
    }

    pub fn is_waiting(&self, key: &IdentityKey) -> bool {
        self.waiting_room.contains(key)
    }

    /// Decide how a join is handled. Does not mutate state.
    ///
    /// A locked meeting refuses everyone but the host and existing members,
    /// even when the lobby is enabled.
    pub fn evaluate_join(&self, joiner: &IdentityKey, is_member: bool) -> JoinDecision {
        if is_member {
            JoinDecision::AlreadyMember
        } else if self.is_host(joiner) {
            JoinDecision::Admitted
        } else if self.meeting_locked {
            JoinDecision::Refused
        } else if self.lobby_enabled {
            JoinDecision::Waiting
        } else {
            JoinDecision::Admitted
        }
    }

    /// Queue an identity in the waiting room. Returns false if already queued.
    pub fn enqueue(&mut self, key: IdentityKey) -> bool {
        if self.waiting_room.contains(&key) {
            return false;
        }
        self.waiting_room.push(key);
        true
    }

    pub fn toggle_lobby(&mut self, actor: &IdentityKey) -> ControlOutcome {
        if !self.is_host(actor) {
            return ControlOutcome::Ignored;
        }
        self.lobby_enabled = !self.lobby_enabled;
        ControlOutcome::Applied
    }

    pub fn toggle_lock(&mut self, actor: &IdentityKey) -> ControlOutcome {
        if !self.is_host(actor) {
            return ControlOutcome::Ignored;
        }
        self.meeting_locked = !self.meeting_locked;
        ControlOutcome::Applied
    }

    /// Move one identity out of the waiting room.
    ///
    /// Repeating the call after admission is a no-op.
    pub fn admit(&mut self, actor: &IdentityKey, key: &IdentityKey) -> Admission {
        if !self.is_host(actor) {
            return Admission::ignored();
        }
        let before = self.waiting_room.len();
        self.waiting_room.retain(|waiting| waiting != key);
        if self.waiting_room.len() == before {
            return Admission {
                outcome: ControlOutcome::Unchanged,
                admitted: Vec::new(),
            };
        }
        Admission {
            outcome: ControlOutcome::Applied,
            admitted: vec![key.clone()],
        }
    }

    /// Drain the whole waiting room in one step.
    pub fn admit_all(&mut self, actor: &IdentityKey) -> Admission {
        if !self.is_host(actor) {
            return Admission::ignored();
        }
        if self.waiting_room.is_empty() {
            return Admission {
                outcome: ControlOutcome::Unchanged,
                admitted: Vec::new(),
            };
        }
        Admission {
            outcome: ControlOutcome::Applied,
            admitted: std::mem::take(&mut self.waiting_room),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key(raw: &str) -> IdentityKey {
        IdentityKey::from_canonical(raw)
    }

    fn hosted() -> MeetingControlState {
        MeetingControlState::with_host(key("email:host@example.com"))
    }

    #[test]
    fn test_non_host_actions_are_ignored() {
        let mut state = hosted();
        state.enqueue(key("email:j@example.com"));
        let snapshot = state.clone();
        let guest = key("email:guest@example.com");

        assert_eq!(state.toggle_lobby(&guest), ControlOutcome::Ignored);
        assert_eq!(state.toggle_lock(&guest), ControlOutcome::Ignored);
        assert_eq!(
            state.admit(&guest, &key("email:j@example.com")).outcome,
            ControlOutcome::Ignored
        );
        assert_eq!(state.admit_all(&guest).outcome, ControlOutcome::Ignored);
        assert_eq!(state, snapshot);
    }

    #[test]
    fn test_host_toggles() {
        let mut state = hosted();
        let host = key("email:host@example.com");

        assert_eq!(state.toggle_lobby(&host), ControlOutcome::Applied);
        assert!(state.lobby_enabled);
        assert_eq!(state.toggle_lock(&host), ControlOutcome::Applied);
        assert!(state.meeting_locked);
        assert_eq!(state.toggle_lobby(&host), ControlOutcome::Applied);
        assert!(!state.lobby_enabled);
    }

    #[test]
    fn test_evaluate_join() {
        let mut state = hosted();
        let host = key("email:host@example.com");
        let joiner = key("email:j@example.com");

        assert_eq!(state.evaluate_join(&joiner, false), JoinDecision::Admitted);
        assert_eq!(state.evaluate_join(&joiner, true), JoinDecision::AlreadyMember);

        state.lobby_enabled = true;
        assert_eq!(state.evaluate_join(&joiner, false), JoinDecision::Waiting);
        assert_eq!(state.evaluate_join(&host, false), JoinDecision::Admitted);

        state.meeting_locked = true;
        assert_eq!(state.evaluate_join(&joiner, false), JoinDecision::Refused);
        assert_eq!(state.evaluate_join(&joiner, true), JoinDecision::AlreadyMember);
        assert_eq!(state.evaluate_join(&host, false), JoinDecision::Admitted);
    }

    #[test]
    fn test_admit_is_idempotent() {
        let mut state = hosted();
        let host = key("email:host@example.com");
        let joiner = key("email:j@example.com");
        assert!(state.enqueue(joiner.clone()));
        assert!(!state.enqueue(joiner.clone()));

        let first = state.admit(&host, &joiner);
        assert_eq!(first.outcome, ControlOutcome::Applied);
        assert_eq!(first.admitted, vec![joiner.clone()]);

        let second = state.admit(&host, &joiner);
        assert_eq!(second.outcome, ControlOutcome::Unchanged);
        assert!(second.admitted.is_empty());
    }

    #[test]
    fn test_admit_all_drains_in_order() {
        let mut state = hosted();
        let host = key("email:host@example.com");
        let waiting: Vec<_> = ["email:a@x.io", "email:b@x.io", "email:c@x.io"]
            .into_iter()
            .map(key)
            .collect();
        for k in &waiting {
            state.enqueue(k.clone());
        }

        let admission = state.admit_all(&host);

        assert_eq!(admission.outcome, ControlOutcome::Applied);
        assert_eq!(admission.admitted, waiting);
        assert!(state.waiting_room.is_empty());
        assert_eq!(state.admit_all(&host).outcome, ControlOutcome::Unchanged);
    }
}
