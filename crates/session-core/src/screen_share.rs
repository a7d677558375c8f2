//! Screen-share ownership arbitration.
//!
//! At most one participant presents at a time. Each successful start issues
//! a strictly larger ownership token; a stop only clears ownership when it
//! comes from the current owner with the current token. Remote updates carry
//! the token so stale claims lose to newer ones regardless of arrival order.

use crate::identity::IdentityKey;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// Who is presenting, and under which token.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScreenShareOwnership {
    pub owner: Option<IdentityKey>,
    pub token: u64,
}

impl ScreenShareOwnership {
    pub fn is_owned_by(&self, key: &IdentityKey) -> bool {
        self.owner.as_ref() == Some(key)
    }

    /// Merge a remote update. Returns true if state changed.
    ///
    /// A newer token always wins. A clear carrying the current token is the
    /// owner's stop and also applies. Two claims at the same token resolve to
    /// the lower identity key.
    pub fn merge(&mut self, incoming: &ScreenShareOwnership) -> bool {
        let same_token = incoming.token == self.token;
        let applies = match (&incoming.owner, &self.owner) {
            _ if incoming.token > self.token => true,
            (None, Some(_)) => same_token,
            (Some(theirs), Some(ours)) => same_token && theirs < ours,
            (Some(_), None) | (None, None) => false,
        };
        if applies {
            *self = incoming.clone();
            true
        } else {
            false
        }
    }
}

/// Why a start request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartRejection {
    OwnedByOther(IdentityKey),
    InFlight,
    CoolingDown,
}

impl StartRejection {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartRejection::OwnedByOther(_) => "owned_by_other",
            StartRejection::InFlight => "in_flight",
            StartRejection::CoolingDown => "cooling_down",
        }
    }
}

/// Accepted start request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartPermit {
    /// Capture may proceed.
    Acquire,
    /// Requester already presents.
    AlreadyOwner,
}

#[derive(Debug)]
pub struct ScreenShareArbiter {
    ownership: ScreenShareOwnership,
    in_flight: BTreeSet<IdentityKey>,
    cooldown: Duration,
    refused_at: HashMap<IdentityKey, Instant>,
}

impl ScreenShareArbiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            ownership: ScreenShareOwnership::default(),
            in_flight: BTreeSet::new(),
            cooldown,
            refused_at: HashMap::new(),
        }
    }

    pub fn ownership(&self) -> &ScreenShareOwnership {
        &self.ownership
    }

    pub fn owner(&self) -> Option<&IdentityKey> {
        self.ownership.owner.as_ref()
    }

    pub fn is_in_flight(&self, key: &IdentityKey) -> bool {
        self.in_flight.contains(key)
    }

    /// Gate a start request before any capture prompt is shown.
    pub fn request_start(
        &mut self,
        key: &IdentityKey,
        now: Instant,
    ) -> Result<StartPermit, StartRejection> {
        if let Some(refused) = self.refused_at.get(key) {
            if now.saturating_duration_since(*refused) < self.cooldown {
                return Err(StartRejection::CoolingDown);
            }
        }

        match &self.ownership.owner {
            Some(owner) if owner == key => return Ok(StartPermit::AlreadyOwner),
            Some(owner) => {
                let owner = owner.clone();
                self.refused_at.insert(key.clone(), now);
                return Err(StartRejection::OwnedByOther(owner));
            }
            None => {}
        }

        if !self.in_flight.insert(key.clone()) {
            return Err(StartRejection::InFlight);
        }
        Ok(StartPermit::Acquire)
    }

    /// Claim ownership once capture succeeded.
    ///
    /// Fails if someone else claimed ownership while capture was pending;
    /// the caller must stop the captured stream.
    pub fn complete_start(
        &mut self,
        key: &IdentityKey,
    ) -> Result<ScreenShareOwnership, StartRejection> {
        self.in_flight.remove(key);
        if let Some(owner) = &self.ownership.owner {
            if owner != key {
                return Err(StartRejection::OwnedByOther(owner.clone()));
            }
        }
        self.ownership.token += 1;
        self.ownership.owner = Some(key.clone());
        self.refused_at.remove(key);
        Ok(self.ownership.clone())
    }

    /// Roll back an in-flight request after a failed or cancelled capture.
    pub fn abort_start(&mut self, key: &IdentityKey) {
        self.in_flight.remove(key);
    }

    /// Release ownership. Only the current owner (and token, if given) may.
    pub fn stop(&mut self, key: &IdentityKey, token: Option<u64>) -> Option<ScreenShareOwnership> {
        if !self.ownership.is_owned_by(key) {
            return None;
        }
        if token.is_some_and(|token| token != self.ownership.token) {
            return None;
        }
        self.ownership.owner = None;
        Some(self.ownership.clone())
    }

    /// Apply an ownership update published by another participant.
    pub fn apply_remote(&mut self, incoming: &ScreenShareOwnership) -> bool {
        self.ownership.merge(incoming)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn key(raw: &str) -> IdentityKey {
        IdentityKey::from_canonical(raw)
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_requester_is_refused_while_owned() {
        let mut arbiter = ScreenShareArbiter::new(Duration::from_millis(1500));
        let alice = key("email:alice@example.com");
        let bob = key("email:bob@example.com");

        assert_eq!(
            arbiter.request_start(&alice, Instant::now()),
            Ok(StartPermit::Acquire)
        );
        let ownership = arbiter.complete_start(&alice).unwrap();
        assert_eq!(ownership.token, 1);

        assert_eq!(
            arbiter.request_start(&bob, Instant::now()),
            Err(StartRejection::OwnedByOther(alice.clone()))
        );
        assert_eq!(arbiter.owner(), Some(&alice));
    }

    #[tokio::test(start_paused = true)]
    async fn test_refused_requester_cools_down() {
        let mut arbiter = ScreenShareArbiter::new(Duration::from_millis(1500));
        let alice = key("email:alice@example.com");
        let bob = key("email:bob@example.com");
        arbiter.request_start(&alice, Instant::now()).unwrap();
        arbiter.complete_start(&alice).unwrap();

        assert!(arbiter.request_start(&bob, Instant::now()).is_err());
        arbiter.stop(&alice, None).unwrap();

        assert_eq!(
            arbiter.request_start(&bob, Instant::now()),
            Err(StartRejection::CoolingDown)
        );

        tokio::time::advance(Duration::from_millis(1600)).await;
        assert_eq!(
            arbiter.request_start(&bob, Instant::now()),
            Ok(StartPermit::Acquire)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_request_blocks_duplicate() {
        let mut arbiter = ScreenShareArbiter::new(Duration::ZERO);
        let alice = key("email:alice@example.com");

        arbiter.request_start(&alice, Instant::now()).unwrap();
        assert_eq!(
            arbiter.request_start(&alice, Instant::now()),
            Err(StartRejection::InFlight)
        );

        arbiter.abort_start(&alice);
        assert!(!arbiter.is_in_flight(&alice));
        assert_eq!(arbiter.owner(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remote_claim_during_capture_wins() {
        let mut arbiter = ScreenShareArbiter::new(Duration::ZERO);
        let alice = key("email:alice@example.com");
        let bob = key("email:bob@example.com");

        arbiter.request_start(&alice, Instant::now()).unwrap();
        assert!(arbiter.apply_remote(&ScreenShareOwnership {
            owner: Some(bob.clone()),
            token: 1,
        }));

        assert_eq!(
            arbiter.complete_start(&alice),
            Err(StartRejection::OwnedByOther(bob))
        );
        assert!(!arbiter.is_in_flight(&alice));
    }

    #[test]
    fn test_only_owner_with_current_token_may_stop() {
        let mut arbiter = ScreenShareArbiter::new(Duration::ZERO);
        let alice = key("email:alice@example.com");
        let bob = key("email:bob@example.com");
        arbiter.in_flight.insert(alice.clone());
        arbiter.complete_start(&alice).unwrap();

        assert!(arbiter.stop(&bob, None).is_none());
        assert!(arbiter.stop(&alice, Some(99)).is_none());
        assert_eq!(arbiter.owner(), Some(&alice));

        let cleared = arbiter.stop(&alice, Some(1)).unwrap();
        assert_eq!(cleared.owner, None);
        assert_eq!(cleared.token, 1);
    }

    #[test]
    fn test_merge_prefers_newer_tokens() {
        let alice = key("email:alice@example.com");
        let bob = key("email:bob@example.com");
        let mut ownership = ScreenShareOwnership {
            owner: Some(alice.clone()),
            token: 3,
        };

        // Stale claim is ignored
        assert!(!ownership.merge(&ScreenShareOwnership {
            owner: Some(bob.clone()),
            token: 2,
        }));
        // Stale clear is ignored
        assert!(!ownership.merge(&ScreenShareOwnership {
            owner: None,
            token: 2,
        }));
        // Owner's clear at the current token applies
        assert!(ownership.merge(&ScreenShareOwnership {
            owner: None,
            token: 3,
        }));
        // Newer claim applies
        assert!(ownership.merge(&ScreenShareOwnership {
            owner: Some(bob.clone()),
            token: 4,
        }));
        assert_eq!(ownership.owner, Some(bob));
    }

    #[test]
    fn test_concurrent_claims_converge_on_lower_key() {
        let alice = key("email:alice@example.com");
        let bob = key("email:bob@example.com");
        let alice_claim = ScreenShareOwnership {
            owner: Some(alice.clone()),
            token: 1,
        };
        let bob_claim = ScreenShareOwnership {
            owner: Some(bob),
            token: 1,
        };

        let mut at_alice = alice_claim.clone();
        assert!(!at_alice.merge(&bob_claim));

        let mut at_bob = bob_claim;
        assert!(at_bob.merge(&alice_claim));

        assert_eq!(at_alice, at_bob);
        assert_eq!(at_bob.owner, Some(alice));
    }
}
